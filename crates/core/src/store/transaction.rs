use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

use crate::errors::ApplicationError;
use crate::facts::{DomainFact, FactEnvelope};
use crate::store::{
    CommitBatch, Document, DocumentKey, DocumentWrite, LedgerStore, Precondition, StoredDocument,
};

pub type TxFuture<'t, T> = Pin<Box<dyn Future<Output = Result<T, ApplicationError>> + Send + 't>>;

/// Optimistic unit of work over a [`LedgerStore`].
///
/// Reads record the version they saw and are served from the snapshot on repeat; staged
/// writes shadow reads. Nothing reaches the store before [`LedgerTransaction::commit`],
/// which validates every recorded version in the same atomic batch as the writes.
pub struct LedgerTransaction {
    store: Arc<dyn LedgerStore>,
    correlation_id: String,
    reads: BTreeMap<DocumentKey, Option<StoredDocument>>,
    writes: BTreeMap<DocumentKey, Value>,
    facts: Vec<FactEnvelope>,
}

impl LedgerTransaction {
    pub fn new(store: Arc<dyn LedgerStore>, correlation_id: impl Into<String>) -> Self {
        Self {
            store,
            correlation_id: correlation_id.into(),
            reads: BTreeMap::new(),
            writes: BTreeMap::new(),
            facts: Vec::new(),
        }
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub async fn get<D: Document>(&mut self, key: &DocumentKey) -> Result<Option<D>, ApplicationError> {
        if let Some(staged) = self.writes.get(key) {
            return serde_json::from_value(staged.clone())
                .map(Some)
                .map_err(|error| ApplicationError::Persistence(format!("{key}: {error}")));
        }

        if !self.reads.contains_key(key) {
            let fetched = self.store.fetch(key).await?;
            self.reads.insert(key.clone(), fetched);
        }

        match self.reads.get(key) {
            Some(Some(document)) => Ok(Some(document.decode()?)),
            _ => Ok(None),
        }
    }

    pub async fn require<D: Document>(
        &mut self,
        key: &DocumentKey,
        entity: &'static str,
    ) -> Result<D, ApplicationError> {
        self.get(key).await?.ok_or_else(|| ApplicationError::not_found(entity, &key.id))
    }

    /// Stages a write. A document that was read updates at its read version; one that was
    /// never read, or read as missing, is created and must not exist at commit.
    pub fn put<D: Document>(&mut self, document: &D) -> Result<(), ApplicationError> {
        let key = document.key();
        let body = serde_json::to_value(document)
            .map_err(|error| ApplicationError::Persistence(format!("{key}: {error}")))?;
        self.writes.insert(key, body);
        Ok(())
    }

    pub fn emit(&mut self, fact: DomainFact) {
        self.facts.push(FactEnvelope::new(self.correlation_id.clone(), fact));
    }

    /// Drops staged writes and facts but keeps the recorded reads, so a caller can replace
    /// a failed mutation with a different one on the same snapshot.
    pub fn discard_changes(&mut self) {
        self.writes.clear();
        self.facts.clear();
    }

    /// Commits the batch and hands back the facts to publish.
    pub async fn commit(self) -> Result<Vec<FactEnvelope>, ApplicationError> {
        let Self { store, reads, mut writes, facts, .. } = self;

        for envelope in &facts {
            let key = envelope.key();
            let body = serde_json::to_value(envelope)
                .map_err(|error| ApplicationError::Persistence(format!("{key}: {error}")))?;
            writes.insert(key, body);
        }

        if writes.is_empty() {
            return Ok(facts);
        }

        let preconditions = reads
            .iter()
            .filter(|(key, _)| !writes.contains_key(*key))
            .map(|(key, read)| Precondition {
                key: key.clone(),
                expected_version: read.as_ref().map(|document| document.version),
            })
            .collect();
        let writes = writes
            .into_iter()
            .map(|(key, body)| DocumentWrite {
                expected_version: reads
                    .get(&key)
                    .and_then(|read| read.as_ref().map(|document| document.version)),
                key,
                body,
            })
            .collect();

        store.commit(CommitBatch { preconditions, writes }).await?;
        Ok(facts)
    }
}
