use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::store::{CommitBatch, DocumentKey, LedgerStore, StoreError, StoredDocument};

/// Process-local ledger store. Commits hold the write lock for the whole check-and-apply.
#[derive(Debug, Default)]
pub struct InMemoryLedgerStore {
    documents: RwLock<BTreeMap<DocumentKey, (u64, Value)>>,
}

impl InMemoryLedgerStore {
    pub async fn len(&self) -> usize {
        self.documents.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.documents.read().await.is_empty()
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn fetch(&self, key: &DocumentKey) -> Result<Option<StoredDocument>, StoreError> {
        let documents = self.documents.read().await;
        Ok(documents.get(key).map(|(version, body)| StoredDocument {
            key: key.clone(),
            version: *version,
            body: body.clone(),
        }))
    }

    async fn list(&self, collection: &str) -> Result<Vec<StoredDocument>, StoreError> {
        let documents = self.documents.read().await;
        Ok(documents
            .iter()
            .filter(|(key, _)| key.collection == collection)
            .map(|(key, (version, body))| StoredDocument {
                key: key.clone(),
                version: *version,
                body: body.clone(),
            })
            .collect())
    }

    async fn commit(&self, batch: CommitBatch) -> Result<Vec<StoredDocument>, StoreError> {
        let mut documents = self.documents.write().await;

        let current = |key: &DocumentKey| documents.get(key).map(|(version, _)| *version);
        for precondition in &batch.preconditions {
            if current(&precondition.key) != precondition.expected_version {
                return Err(StoreError::Conflict(precondition.key.clone()));
            }
        }
        for write in &batch.writes {
            if current(&write.key) != write.expected_version {
                return Err(StoreError::Conflict(write.key.clone()));
            }
        }

        let mut written = Vec::with_capacity(batch.writes.len());
        for write in batch.writes {
            let version = write.expected_version.unwrap_or(0) + 1;
            documents.insert(write.key.clone(), (version, write.body.clone()));
            written.push(StoredDocument { key: write.key, version, body: write.body });
        }
        Ok(written)
    }
}
