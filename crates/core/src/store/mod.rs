//! Versioned document store seam.
//!
//! Every ledger document lives at `(collection, id)` and carries a version that is bumped
//! on each write. A [`CommitBatch`] is applied all-or-nothing: every precondition and every
//! write's expected version must still hold, otherwise the whole batch fails with
//! [`StoreError::Conflict`].

pub mod memory;
pub mod transaction;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use memory::InMemoryLedgerStore;
pub use transaction::{LedgerTransaction, TxFuture};

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DocumentKey {
    pub collection: String,
    pub id: String,
}

impl DocumentKey {
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self { collection: collection.into(), id: id.into() }
    }
}

impl std::fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct StoredDocument {
    pub key: DocumentKey,
    pub version: u64,
    pub body: Value,
}

impl StoredDocument {
    pub fn decode<D: DeserializeOwned>(&self) -> Result<D, StoreError> {
        serde_json::from_value(self.body.clone())
            .map_err(|error| StoreError::Decode { key: self.key.clone(), message: error.to_string() })
    }
}

/// Version a read-only document must still have at commit. `None` means it must not exist.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Precondition {
    pub key: DocumentKey,
    pub expected_version: Option<u64>,
}

/// `expected_version: None` is a create; the commit fails if the key already exists.
#[derive(Clone, Debug, PartialEq)]
pub struct DocumentWrite {
    pub key: DocumentKey,
    pub expected_version: Option<u64>,
    pub body: Value,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CommitBatch {
    pub preconditions: Vec<Precondition>,
    pub writes: Vec<DocumentWrite>,
}

impl CommitBatch {
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("document `{0}` was changed concurrently")]
    Conflict(DocumentKey),
    #[error("ledger store backend failure: {0}")]
    Backend(String),
    #[error("document `{key}` could not be decoded: {message}")]
    Decode { key: DocumentKey, message: String },
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn fetch(&self, key: &DocumentKey) -> Result<Option<StoredDocument>, StoreError>;

    /// Committed documents of one collection, ordered by id.
    async fn list(&self, collection: &str) -> Result<Vec<StoredDocument>, StoreError>;

    /// Applies the batch atomically and returns the written documents with their new versions.
    async fn commit(&self, batch: CommitBatch) -> Result<Vec<StoredDocument>, StoreError>;
}

/// A typed ledger document that knows its own key.
pub trait Document: Serialize + DeserializeOwned + Send + Sync {
    fn key(&self) -> DocumentKey;
}

/// Reads one committed document outside of any transaction.
pub async fn load<D: DeserializeOwned>(
    store: &dyn LedgerStore,
    key: &DocumentKey,
) -> Result<Option<D>, StoreError> {
    match store.fetch(key).await? {
        Some(document) => document.decode().map(Some),
        None => Ok(None),
    }
}

pub async fn load_all<D: DeserializeOwned>(
    store: &dyn LedgerStore,
    collection: &str,
) -> Result<Vec<D>, StoreError> {
    store.list(collection).await?.iter().map(StoredDocument::decode).collect()
}
