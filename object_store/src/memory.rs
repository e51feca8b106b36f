//! This module contains the in-memory implementation of the ObjectStore
//! trait.

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;

use crate::{NotFoundSnafu, ObjectPath, ObjectStore, Result};

/// In-memory storage suitable for testing or for opting out of using a
/// cloud storage provider.
#[derive(Debug, Default)]
pub struct InMemory {
    storage: RwLock<BTreeMap<ObjectPath, Bytes>>,
}

impl InMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of objects currently stored.
    pub async fn len(&self) -> usize {
        self.storage.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.storage.read().await.is_empty()
    }
}

#[async_trait]
impl ObjectStore for InMemory {
    async fn put(&self, location: &ObjectPath, bytes: Bytes) -> Result<()> {
        self.storage.write().await.insert(location.clone(), bytes);
        Ok(())
    }

    async fn get(&self, location: &ObjectPath) -> Result<Bytes> {
        self.storage
            .read()
            .await
            .get(location)
            .cloned()
            .ok_or_else(|| {
                NotFoundSnafu {
                    location: location.to_raw(),
                }
                .build()
            })
    }

    async fn delete(&self, location: &ObjectPath) -> Result<()> {
        self.storage.write().await.remove(location);
        Ok(())
    }

    async fn list(&self, prefix: &ObjectPath) -> Result<Vec<ObjectPath>> {
        Ok(self
            .storage
            .read()
            .await
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}
