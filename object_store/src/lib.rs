//! The distributed file store the partitioning engine reads and writes
//! partitions through.
//!
//! The engine needs only whole-object semantics: an object is written
//! atomically with [`ObjectStore::put`], read back whole with
//! [`ObjectStore::get`] and removed with [`ObjectStore::delete`]. Replication
//! and placement are the backend's concern.
//!
//! Two backends ship with this crate:
//!
//! * [`memory::InMemory`]: a process-local map, used by tests and by
//!   single-node deployments.
//! * [`disk::LocalFileSystem`]: objects as files under a root directory,
//!   each write staged to a temporary file and renamed into place.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

pub mod disk;
pub mod memory;
pub mod path;

use async_trait::async_trait;
use bytes::Bytes;
use snafu::Snafu;

pub use path::ObjectPath;

/// A specialized `Error` for object store-related errors
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("object not found: {}", location))]
    NotFound {
        #[snafu(implicit(false))]
        location: String,
    },

    #[snafu(display("unable to read {}: {}", location, source))]
    Read {
        #[snafu(implicit(false))]
        location: String,
        source: std::io::Error,
    },

    #[snafu(display("unable to write {}: {}", location, source))]
    Write {
        #[snafu(implicit(false))]
        location: String,
        source: std::io::Error,
    },

    #[snafu(display("unable to delete {}: {}", location, source))]
    Delete {
        #[snafu(implicit(false))]
        location: String,
        source: std::io::Error,
    },

    #[snafu(display("unable to list {}: {}", location, source))]
    List {
        #[snafu(implicit(false))]
        location: String,
        source: walkdir::Error,
    },

    #[snafu(display("background task failed: {}", source))]
    TaskFailed { source: tokio::task::JoinError },
}

/// A specialized `Result` for object store-related errors
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Universal API to the store backends.
#[async_trait]
pub trait ObjectStore: std::fmt::Debug + Send + Sync + 'static {
    /// Save the provided bytes to the specified location. The object becomes
    /// visible to readers only once it is completely written.
    async fn put(&self, location: &ObjectPath, bytes: Bytes) -> Result<()>;

    /// Return the bytes that are stored at the specified location.
    async fn get(&self, location: &ObjectPath) -> Result<Bytes>;

    /// Delete the object at the specified location. Deleting a missing
    /// object succeeds.
    async fn delete(&self, location: &ObjectPath) -> Result<()>;

    /// List all the objects with the given prefix.
    async fn list(&self, prefix: &ObjectPath) -> Result<Vec<ObjectPath>>;

    /// Returns true if an object exists at `location`.
    async fn exists(&self, location: &ObjectPath) -> Result<bool> {
        match self.get(location).await {
            Ok(_) => Ok(true),
            Err(Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use assert_matches::assert_matches;

    use super::*;

    /// Exercise the common contract against any backend.
    pub(crate) async fn put_get_delete_list(store: &dyn ObjectStore) {
        let a = ObjectPath::from_dirs_and_file(["data", "0"], "part-1");
        let b = ObjectPath::from_dirs_and_file(["data", "0"], "part-2");
        let other = ObjectPath::from_dirs_and_file(["commits"], "plan");

        assert_matches!(store.get(&a).await, Err(Error::NotFound { .. }));
        assert!(!store.exists(&a).await.unwrap());

        store.put(&a, Bytes::from_static(b"hello")).await.unwrap();
        store.put(&b, Bytes::from_static(b"world")).await.unwrap();
        store.put(&other, Bytes::from_static(b"x")).await.unwrap();

        assert_eq!(store.get(&a).await.unwrap(), Bytes::from_static(b"hello"));
        assert!(store.exists(&a).await.unwrap());

        // overwrite
        store.put(&a, Bytes::from_static(b"bye")).await.unwrap();
        assert_eq!(store.get(&a).await.unwrap(), Bytes::from_static(b"bye"));

        let mut listed = store
            .list(&ObjectPath::from_dirs(["data"]))
            .await
            .unwrap();
        listed.sort();
        assert_eq!(listed, vec![a.clone(), b.clone()]);

        store.delete(&a).await.unwrap();
        // deleting twice is fine
        store.delete(&a).await.unwrap();
        assert_matches!(store.get(&a).await, Err(Error::NotFound { .. }));

        let listed = store.list(&ObjectPath::from_dirs(["data"])).await.unwrap();
        assert_eq!(listed, vec![b]);

        let listed = store.list(&ObjectPath::from_dirs(["missing"])).await.unwrap();
        assert!(listed.is_empty());
    }
}
