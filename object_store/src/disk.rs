//! This module contains the local filesystem implementation of the
//! ObjectStore trait.

use std::{
    io::ErrorKind,
    path::PathBuf,
    sync::atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;
use bytes::Bytes;
use observability_deps::tracing::debug;
use snafu::{ensure, ResultExt};
use walkdir::WalkDir;

use crate::{
    DeleteSnafu, ListSnafu, NotFoundSnafu, ObjectPath, ObjectStore, ReadSnafu, Result,
    TaskFailedSnafu, WriteSnafu,
};

const TMP_SUFFIX: &str = ".tmp";

/// Local filesystem storage suitable for testing or for opting out of using
/// a cloud storage provider.
#[derive(Debug)]
pub struct LocalFileSystem {
    root: PathBuf,
    tmp_counter: AtomicU64,
}

impl LocalFileSystem {
    /// Store objects under `root`. The directory is created on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            tmp_counter: AtomicU64::new(0),
        }
    }

    fn path(&self, location: &ObjectPath) -> PathBuf {
        let mut path = self.root.clone();
        path.extend(location.parts());
        path
    }
}

#[async_trait]
impl ObjectStore for LocalFileSystem {
    async fn put(&self, location: &ObjectPath, bytes: Bytes) -> Result<()> {
        let path = self.path(location);
        let raw = location.to_raw();

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context(WriteSnafu { location: &raw })?;
        }

        // stage next to the target so the rename stays on one filesystem
        let n = self.tmp_counter.fetch_add(1, Ordering::Relaxed);
        let mut tmp = path.clone().into_os_string();
        tmp.push(format!(".{}.{}{}", std::process::id(), n, TMP_SUFFIX));
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, &bytes)
            .await
            .context(WriteSnafu { location: &raw })?;
        tokio::fs::rename(&tmp, &path)
            .await
            .context(WriteSnafu { location: &raw })?;

        debug!(location = %raw, bytes = bytes.len(), "object written");
        Ok(())
    }

    async fn get(&self, location: &ObjectPath) -> Result<Bytes> {
        let path = self.path(location);
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) => {
                ensure!(
                    e.kind() != ErrorKind::NotFound,
                    NotFoundSnafu {
                        location: location.to_raw()
                    }
                );
                Err(e).context(ReadSnafu {
                    location: location.to_raw(),
                })
            }
        }
    }

    async fn delete(&self, location: &ObjectPath) -> Result<()> {
        let path = self.path(location);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context(DeleteSnafu {
                location: location.to_raw(),
            }),
        }
    }

    async fn list(&self, prefix: &ObjectPath) -> Result<Vec<ObjectPath>> {
        let root = self.root.clone();
        let start = self.path(prefix);
        let raw = prefix.to_raw();

        tokio::task::spawn_blocking(move || {
            if !start.exists() {
                return Ok(vec![]);
            }

            let mut out = vec![];
            for entry in WalkDir::new(&start) {
                let entry = entry.context(ListSnafu { location: &raw })?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let relative = match entry.path().strip_prefix(&root) {
                    Ok(r) => r,
                    Err(_) => continue,
                };
                let parts: Vec<_> = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect();
                if parts.last().map(|f| f.ends_with(TMP_SUFFIX)).unwrap_or(false) {
                    continue;
                }
                out.push(ObjectPath::from_dirs(parts));
            }
            out.sort();
            Ok(out)
        })
        .await
        .context(TaskFailedSnafu)?
    }
}
