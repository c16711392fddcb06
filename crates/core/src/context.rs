use std::sync::Arc;

use tracing::{debug, warn};

use crate::errors::ApplicationError;
use crate::facts::{FactSink, TracingFactSink};
use crate::retry::RetryPolicy;
use crate::store::{LedgerStore, LedgerTransaction, TxFuture};

/// Shared handle every ledger service runs its transactions through.
#[derive(Clone)]
pub struct LedgerContext {
    store: Arc<dyn LedgerStore>,
    facts: Arc<dyn FactSink>,
    retry: RetryPolicy,
}

impl LedgerContext {
    pub fn new(store: Arc<dyn LedgerStore>, facts: Arc<dyn FactSink>, retry: RetryPolicy) -> Self {
        Self { store, facts, retry }
    }

    pub fn with_store(store: Arc<dyn LedgerStore>) -> Self {
        Self::new(store, Arc::new(TracingFactSink), RetryPolicy::default())
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    /// Runs `work` in a fresh transaction and commits it, re-running the whole closure on
    /// `Conflict` until the retry budget is spent. Facts are published only after commit.
    pub async fn transact<T, F>(
        &self,
        operation: &'static str,
        correlation_id: &str,
        mut work: F,
    ) -> Result<T, ApplicationError>
    where
        T: Send,
        F: for<'t> FnMut(&'t mut LedgerTransaction) -> TxFuture<'t, T> + Send,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut tx = LedgerTransaction::new(self.store.clone(), correlation_id);
            let result = work(&mut tx).await;
            let outcome = match result {
                Ok(value) => tx.commit().await.map(|facts| (value, facts)),
                Err(error) => Err(error),
            };

            match outcome {
                Ok((value, facts)) => {
                    for envelope in &facts {
                        self.facts.publish(envelope);
                    }
                    debug!(
                        event_name = "ledger.transaction.committed",
                        correlation_id,
                        operation,
                        attempt,
                        facts = facts.len(),
                        "ledger transaction committed"
                    );
                    return Ok(value);
                }
                Err(ApplicationError::Conflict(detail)) if attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        event_name = "ledger.transaction.retry",
                        correlation_id,
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        detail = %detail,
                        "ledger transaction conflicted, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(error) => return Err(error),
            }
        }
    }
}
