use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::payment::PaymentIntentId;
use crate::errors::ApplicationError;

/// Authoritative view of a payment intent as the processor reports it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProcessorIntent {
    pub id: PaymentIntentId,
    pub amount: i64,
    pub currency: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

/// Read-only processor API used to resolve ambiguous webhook metadata.
#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    async fn retrieve_intent(
        &self,
        intent_id: &PaymentIntentId,
    ) -> Result<ProcessorIntent, ApplicationError>;
}

/// Used when no processor endpoint is configured; every lookup fails as an integration error.
#[derive(Clone, Copy, Debug, Default)]
pub struct DisabledPaymentProcessor;

#[async_trait]
impl PaymentProcessor for DisabledPaymentProcessor {
    async fn retrieve_intent(
        &self,
        intent_id: &PaymentIntentId,
    ) -> Result<ProcessorIntent, ApplicationError> {
        Err(ApplicationError::Integration(format!(
            "no payment processor configured to resolve intent `{intent_id}`"
        )))
    }
}

/// Fixed set of intents with an optional artificial latency.
#[derive(Clone, Debug, Default)]
pub struct StaticPaymentProcessor {
    intents: Arc<Mutex<BTreeMap<PaymentIntentId, ProcessorIntent>>>,
    latency: Option<Duration>,
}

impl StaticPaymentProcessor {
    pub fn with_intent(self, intent: ProcessorIntent) -> Self {
        match self.intents.lock() {
            Ok(mut intents) => intents.insert(intent.id.clone(), intent),
            Err(poisoned) => poisoned.into_inner().insert(intent.id.clone(), intent),
        };
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }
}

#[async_trait]
impl PaymentProcessor for StaticPaymentProcessor {
    async fn retrieve_intent(
        &self,
        intent_id: &PaymentIntentId,
    ) -> Result<ProcessorIntent, ApplicationError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let found = match self.intents.lock() {
            Ok(intents) => intents.get(intent_id).cloned(),
            Err(poisoned) => poisoned.into_inner().get(intent_id).cloned(),
        };
        found.ok_or_else(|| ApplicationError::not_found("payment intent", intent_id))
    }
}
