use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::domain::approval::{ApprovalRequestId, ApprovalStatus};
use crate::domain::order::OrderId;
use crate::domain::payment::{EventId, PaymentIntentId};
use crate::domain::payout::{PayoutId, PayoutStatus};
use crate::domain::quote::{ProposalId, QuoteId};
use crate::domain::time_entry::{TimeEntryCategory, TimeEntryId};
use crate::domain::CompanyId;
use crate::store::{Document, DocumentKey};

pub const FACT_OUTBOX: &str = "fact_outbox";

/// Business fact written to the outbox in the transaction that caused it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DomainFact {
    #[serde(rename = "quote.published")]
    QuotePublished { quote_id: QuoteId },
    #[serde(rename = "quote.cancelled")]
    QuoteCancelled { quote_id: QuoteId, expired_proposal_ids: Vec<ProposalId> },
    #[serde(rename = "proposal.submitted")]
    ProposalSubmitted { quote_id: QuoteId, proposal_id: ProposalId, provider_id: CompanyId },
    #[serde(rename = "proposal.payment_pending")]
    ProposalPaymentPending {
        quote_id: QuoteId,
        proposal_id: ProposalId,
        payment_intent_id: Option<PaymentIntentId>,
    },
    #[serde(rename = "proposal.accepted")]
    ProposalAccepted {
        quote_id: QuoteId,
        proposal_id: ProposalId,
        rejected_proposal_ids: Vec<ProposalId>,
    },
    #[serde(rename = "order.created")]
    OrderCreated { order_id: OrderId, quote_id: QuoteId, payment_intent_id: PaymentIntentId },
    #[serde(rename = "order.provider_completed")]
    OrderProviderCompleted { order_id: OrderId },
    #[serde(rename = "order.completed")]
    OrderCompleted { order_id: OrderId, payout_id: Option<PayoutId> },
    #[serde(rename = "order.cancelled")]
    OrderCancelled { order_id: OrderId, reason: String },
    #[serde(rename = "approval.requested")]
    ApprovalRequested {
        order_id: OrderId,
        approval_request_id: ApprovalRequestId,
        total_amount_cents: i64,
    },
    #[serde(rename = "approval.responded")]
    ApprovalResponded {
        order_id: OrderId,
        approval_request_id: ApprovalRequestId,
        status: ApprovalStatus,
    },
    #[serde(rename = "timeEntry.billed")]
    TimeEntryBilled {
        order_id: OrderId,
        time_entry_id: TimeEntryId,
        payment_intent_id: PaymentIntentId,
        amount_cents: i64,
    },
    #[serde(rename = "timeEntry.recategorized")]
    TimeEntryRecategorized {
        order_id: OrderId,
        time_entry_id: TimeEntryId,
        from: TimeEntryCategory,
        to: TimeEntryCategory,
    },
    #[serde(rename = "payout.created")]
    PayoutCreated { payout_id: PayoutId, order_id: OrderId, amount_cents: i64 },
    #[serde(rename = "payout.status_changed")]
    PayoutStatusChanged { payout_id: PayoutId, from: PayoutStatus, to: PayoutStatus },
    #[serde(rename = "paymentEvent.parked")]
    PaymentEventParked { event_id: EventId, reason: String },
}

impl DomainFact {
    pub fn name(&self) -> &'static str {
        match self {
            Self::QuotePublished { .. } => "quote.published",
            Self::QuoteCancelled { .. } => "quote.cancelled",
            Self::ProposalSubmitted { .. } => "proposal.submitted",
            Self::ProposalPaymentPending { .. } => "proposal.payment_pending",
            Self::ProposalAccepted { .. } => "proposal.accepted",
            Self::OrderCreated { .. } => "order.created",
            Self::OrderProviderCompleted { .. } => "order.provider_completed",
            Self::OrderCompleted { .. } => "order.completed",
            Self::OrderCancelled { .. } => "order.cancelled",
            Self::ApprovalRequested { .. } => "approval.requested",
            Self::ApprovalResponded { .. } => "approval.responded",
            Self::TimeEntryBilled { .. } => "timeEntry.billed",
            Self::TimeEntryRecategorized { .. } => "timeEntry.recategorized",
            Self::PayoutCreated { .. } => "payout.created",
            Self::PayoutStatusChanged { .. } => "payout.status_changed",
            Self::PaymentEventParked { .. } => "paymentEvent.parked",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactEnvelope {
    pub fact_id: String,
    pub correlation_id: String,
    pub occurred_at: DateTime<Utc>,
    pub fact: DomainFact,
}

impl FactEnvelope {
    pub fn new(correlation_id: impl Into<String>, fact: DomainFact) -> Self {
        Self {
            fact_id: Uuid::new_v4().to_string(),
            correlation_id: correlation_id.into(),
            occurred_at: Utc::now(),
            fact,
        }
    }
}

impl Document for FactEnvelope {
    fn key(&self) -> DocumentKey {
        DocumentKey::new(FACT_OUTBOX, self.fact_id.as_str())
    }
}

/// Receives facts after their transaction committed. Delivery is at-least-once; the
/// outbox document stays the canonical record.
pub trait FactSink: Send + Sync {
    fn publish(&self, envelope: &FactEnvelope);
}

#[derive(Clone, Default)]
pub struct InMemoryFactSink {
    facts: Arc<Mutex<Vec<FactEnvelope>>>,
}

impl InMemoryFactSink {
    pub fn facts(&self) -> Vec<FactEnvelope> {
        match self.facts.lock() {
            Ok(facts) => facts.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.facts().iter().map(|envelope| envelope.fact.name()).collect()
    }
}

impl FactSink for InMemoryFactSink {
    fn publish(&self, envelope: &FactEnvelope) {
        match self.facts.lock() {
            Ok(mut facts) => facts.push(envelope.clone()),
            Err(poisoned) => poisoned.into_inner().push(envelope.clone()),
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct TracingFactSink;

impl FactSink for TracingFactSink {
    fn publish(&self, envelope: &FactEnvelope) {
        info!(
            event_name = "ledger.fact.published",
            correlation_id = %envelope.correlation_id,
            fact_id = %envelope.fact_id,
            fact = envelope.fact.name(),
            "domain fact published"
        );
    }
}

#[cfg(test)]
mod tests {
    use crate::domain::order::OrderId;
    use crate::facts::{DomainFact, FactEnvelope, FactSink, InMemoryFactSink};
    use crate::store::Document;

    #[test]
    fn in_memory_sink_records_facts_with_correlation_fields() {
        let sink = InMemoryFactSink::default();
        sink.publish(&FactEnvelope::new(
            "req-123",
            DomainFact::OrderProviderCompleted { order_id: OrderId::new("O1") },
        ));

        let facts = sink.facts();
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].correlation_id, "req-123");
        assert_eq!(sink.names(), vec!["order.provider_completed"]);
    }

    #[test]
    fn facts_serialize_with_dotted_type_tag() {
        let envelope = FactEnvelope::new(
            "req-1",
            DomainFact::OrderCancelled { order_id: OrderId::new("O1"), reason: "moved".into() },
        );
        let body = serde_json::to_value(&envelope).expect("serialize fact");

        assert_eq!(body["fact"]["type"], "order.cancelled");
        assert_eq!(envelope.key().collection, "fact_outbox");
    }
}
