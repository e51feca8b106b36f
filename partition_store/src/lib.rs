//! Partition-aware layout on top of an [`ObjectStore`].
//!
//! Everything one dataset replica owns lives under
//! `<working_dir>/<replica_id>/`:
//!
//! ```text
//! info               key schema (JSON)
//! index              partition index (JSON)
//! ids                next partition id to hand out (JSON)
//! data/<id>          one partition, JSON lines, one record per line
//! commits/<plan_id>  journal of an in-flight repartition (JSON)
//! ```
//!
//! Partition files are written with a single `put`, so readers observe a
//! partition either completely or not at all.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use std::sync::Arc;

use bytes::Bytes;
use data_types::{KeySchema, PartitionId, Record};
use object_store::{ObjectPath, ObjectStore};
use observability_deps::tracing::{debug, info};
use partition_index::PartitionIndex;
use snafu::{ResultExt, Snafu};
use uuid::Uuid;

mod journal;

pub use journal::{CommitJournal, CommitPhase};

const SCHEMA_FILE: &str = "info";
const INDEX_FILE: &str = "index";
const IDS_FILE: &str = "ids";
const DATA_DIR: &str = "data";
const COMMITS_DIR: &str = "commits";

#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("error writing partition {}: {}", partition, source))]
    WritePartition {
        partition: PartitionId,
        source: object_store::Error,
    },

    #[snafu(display("error reading partition {}: {}", partition, source))]
    ReadPartition {
        partition: PartitionId,
        source: object_store::Error,
    },

    #[snafu(display("error deleting partition {}: {}", partition, source))]
    DeletePartition {
        partition: PartitionId,
        source: object_store::Error,
    },

    #[snafu(display("partition {} is corrupt at line {}: {}", partition, line, source))]
    DecodeRecord {
        partition: PartitionId,
        line: usize,
        source: serde_json::Error,
    },

    #[snafu(display("error serializing {}: {}", what, source))]
    Serialize {
        what: String,
        source: serde_json::Error,
    },

    #[snafu(display("error deserializing {}: {}", what, source))]
    Deserialize {
        what: String,
        source: serde_json::Error,
    },

    #[snafu(display("object store error at {}: {}", location, source))]
    Store {
        #[snafu(implicit(false))]
        location: String,
        source: object_store::Error,
    },

    #[snafu(display("persisted index is invalid: {}", source))]
    InvalidIndex { source: partition_index::Error },
}

impl Error {
    /// Returns true if the error is caused by a missing object.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::WritePartition { source, .. }
                | Self::ReadPartition { source, .. }
                | Self::DeletePartition { source, .. }
                | Self::Store { source, .. }
                if matches!(source, object_store::Error::NotFound { .. })
        )
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Handle to the files of one dataset replica.
#[derive(Debug, Clone)]
pub struct PartitionStore {
    store: Arc<dyn ObjectStore>,
    root: ObjectPath,
}

impl PartitionStore {
    pub fn new(store: Arc<dyn ObjectStore>, working_dir: &str, replica_id: &str) -> Self {
        let root = ObjectPath::from_dirs([working_dir, replica_id]);
        Self { store, root }
    }

    pub fn root(&self) -> &ObjectPath {
        &self.root
    }

    pub fn object_store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    fn partition_path(&self, partition: PartitionId) -> ObjectPath {
        self.root.child(DATA_DIR).child(&partition.to_string())
    }

    fn journal_path(&self, plan_id: Uuid) -> ObjectPath {
        self.root.child(COMMITS_DIR).child(&plan_id.to_string())
    }

    /// Durably write `records` as partition `partition`, replacing any
    /// previous content. Returns the number of records written.
    pub async fn write_partition(&self, partition: PartitionId, records: &[Record]) -> Result<u64> {
        let mut buf = Vec::new();
        for record in records {
            serde_json::to_writer(&mut buf, record).context(SerializeSnafu {
                what: format!("record of partition {}", partition),
            })?;
            buf.push(b'\n');
        }

        self.store
            .put(&self.partition_path(partition), Bytes::from(buf))
            .await
            .context(WritePartitionSnafu { partition })?;

        debug!(%partition, records = records.len(), "partition written");
        Ok(records.len() as u64)
    }

    pub async fn read_partition(&self, partition: PartitionId) -> Result<Vec<Record>> {
        let bytes = self
            .store
            .get(&self.partition_path(partition))
            .await
            .context(ReadPartitionSnafu { partition })?;

        bytes
            .split(|b| *b == b'\n')
            .enumerate()
            .filter(|(_, line)| !line.is_empty())
            .map(|(i, line)| {
                serde_json::from_slice(line).context(DecodeRecordSnafu {
                    partition,
                    line: i + 1,
                })
            })
            .collect()
    }

    /// Remove partition `partition`. Removing a missing partition succeeds.
    pub async fn delete_partition(&self, partition: PartitionId) -> Result<()> {
        self.store
            .delete(&self.partition_path(partition))
            .await
            .context(DeletePartitionSnafu { partition })?;
        debug!(%partition, "partition deleted");
        Ok(())
    }

    pub async fn partition_exists(&self, partition: PartitionId) -> Result<bool> {
        let location = self.partition_path(partition);
        self.store.exists(&location).await.context(StoreSnafu {
            location: location.to_raw(),
        })
    }

    /// Ids of every partition file present, ascending.
    pub async fn list_partitions(&self) -> Result<Vec<PartitionId>> {
        let prefix = self.root.child(DATA_DIR);
        let paths = self.store.list(&prefix).await.context(StoreSnafu {
            location: prefix.to_raw(),
        })?;

        let mut ids: Vec<_> = paths
            .iter()
            .filter_map(|p| p.file_name()?.parse::<i64>().ok())
            .map(PartitionId::new)
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn put_json<T: serde::Serialize + Sync>(&self, location: ObjectPath, value: &T) -> Result<()> {
        let json = serde_json::to_vec(value).context(SerializeSnafu {
            what: location.to_raw(),
        })?;
        self.store
            .put(&location, Bytes::from(json))
            .await
            .context(StoreSnafu {
                location: location.to_raw(),
            })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, location: ObjectPath) -> Result<T> {
        let bytes = self.store.get(&location).await.context(StoreSnafu {
            location: location.to_raw(),
        })?;
        serde_json::from_slice(&bytes).context(DeserializeSnafu {
            what: location.to_raw(),
        })
    }

    pub async fn save_schema(&self, schema: &KeySchema) -> Result<()> {
        self.put_json(self.root.child(SCHEMA_FILE), schema).await
    }

    pub async fn load_schema(&self) -> Result<KeySchema> {
        self.get_json(self.root.child(SCHEMA_FILE)).await
    }

    pub async fn save_index(&self, index: &PartitionIndex) -> Result<()> {
        self.put_json(self.root.child(INDEX_FILE), index).await?;
        debug!(version = index.version(), "index persisted");
        Ok(())
    }

    /// Load the persisted index, rejecting structurally invalid trees.
    pub async fn load_index(&self) -> Result<PartitionIndex> {
        let index: PartitionIndex = self.get_json(self.root.child(INDEX_FILE)).await?;
        index.validate().context(InvalidIndexSnafu)?;
        info!(
            version = index.version(),
            leaves = index.leaves().len(),
            root = %self.root,
            "index loaded"
        );
        Ok(index)
    }

    /// The id counter shared by every process planning on this replica, or
    /// `None` if no id was ever handed out through it.
    pub async fn load_next_id(&self) -> Result<Option<PartitionId>> {
        match self.get_json(self.root.child(IDS_FILE)).await {
            Ok(next) => Ok(Some(next)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn save_next_id(&self, next: PartitionId) -> Result<()> {
        self.put_json(self.root.child(IDS_FILE), &next).await
    }

    pub async fn put_journal(&self, journal: &CommitJournal) -> Result<()> {
        self.put_json(self.journal_path(journal.plan_id), journal)
            .await
    }

    pub async fn get_journal(&self, plan_id: Uuid) -> Result<CommitJournal> {
        self.get_json(self.journal_path(plan_id)).await
    }

    pub async fn delete_journal(&self, plan_id: Uuid) -> Result<()> {
        let location = self.journal_path(plan_id);
        self.store.delete(&location).await.context(StoreSnafu {
            location: location.to_raw(),
        })
    }

    /// Every journal of a repartition that has not finished yet. Journals
    /// deleted while the listing runs are skipped.
    pub async fn list_journals(&self) -> Result<Vec<CommitJournal>> {
        let prefix = self.root.child(COMMITS_DIR);
        let paths = self.store.list(&prefix).await.context(StoreSnafu {
            location: prefix.to_raw(),
        })?;

        let mut journals = Vec::with_capacity(paths.len());
        for path in paths {
            match self.get_json(path).await {
                Ok(journal) => journals.push(journal),
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(journals)
    }
}
