use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::domain::approval::ApprovalRequestId;
use crate::domain::order::OrderId;
use crate::domain::payout::PayoutId;
use crate::domain::quote::{ProposalId, QuoteId};
use crate::domain::time_entry::TimeEntryId;
use crate::store::{Document, DocumentKey};

string_id!(PaymentIntentId, "pi");
string_id!(EventId, "evt");

pub const PAYMENT_INTENTS: &str = "payment_intents";
pub const PROCESSED_EVENTS: &str = "processed_events";

/// Webhook body as delivered by the payment processor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentEvent {
    pub event_id: EventId,
    #[serde(rename = "type")]
    pub event_type: String,
    pub object: PaymentObject,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PaymentObject {
    pub id: PaymentIntentId,
    pub amount: i64,
    pub currency: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub application_fee_amount: Option<i64>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl PaymentEvent {
    pub fn kind(&self) -> PaymentEventKind {
        PaymentEventKind::classify(&self.event_type)
    }

    pub fn intent_id(&self) -> &PaymentIntentId {
        &self.object.id
    }

    /// Commission taken at capture: metadata first, then the processor application fee.
    pub fn platform_fee_cents(&self, metadata: &PaymentMetadata) -> i64 {
        metadata.platform_fee_cents().or(self.object.application_fee_amount).unwrap_or(0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentEventKind {
    Capture,
    Failure,
    Other,
}

impl PaymentEventKind {
    pub fn classify(event_type: &str) -> Self {
        match event_type {
            "payment_intent.succeeded" | "charge.succeeded" => Self::Capture,
            "payment_intent.payment_failed" | "payment_intent.canceled" => Self::Failure,
            _ => Self::Other,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitialPayment {
    pub quote_id: QuoteId,
    pub proposal_id: ProposalId,
    pub platform_fee_cents: Option<i64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "by", rename_all = "snake_case")]
pub enum SettlementTarget {
    ApprovalRequest { approval_request_id: ApprovalRequestId },
    Entries { entry_ids: Vec<TimeEntryId> },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdditionalHoursPayment {
    pub order_id: OrderId,
    pub target: SettlementTarget,
    pub platform_fee_cents: Option<i64>,
}

/// Routing information carried in the intent metadata, one variant per payment type.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "paymentType", rename_all = "snake_case")]
pub enum PaymentMetadata {
    B2bProject(InitialPayment),
    FixedPrice(InitialPayment),
    AdditionalHoursPayment(AdditionalHoursPayment),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum MetadataError {
    #[error("metadata carries no `paymentType` or `type` discriminator")]
    MissingDiscriminator,
    #[error("unknown payment type `{0}`")]
    UnknownPaymentType(String),
    #[error("payment type `{payment_type}` requires metadata field `{field}`")]
    MissingField { payment_type: &'static str, field: &'static str },
    #[error("metadata field `{field}` has unusable value `{value}`")]
    InvalidField { field: &'static str, value: String },
}

impl PaymentMetadata {
    pub fn parse(metadata: &BTreeMap<String, Value>) -> Result<Self, MetadataError> {
        let bag = MetadataBag(metadata);
        let payment_type = bag
            .text("paymentType")
            .or_else(|| bag.text("type"))
            .ok_or(MetadataError::MissingDiscriminator)?;
        let platform_fee_cents = bag.cents("platformFeeAmount")?;

        match payment_type.as_str() {
            "b2b_project" | "b2b_payment" => {
                Ok(Self::B2bProject(bag.initial_payment("b2b_project", platform_fee_cents)?))
            }
            "fixed_price" => {
                Ok(Self::FixedPrice(bag.initial_payment("fixed_price", platform_fee_cents)?))
            }
            "additional_hours_payment" | "additional_hours_platform_hold" => {
                const TYPE: &str = "additional_hours_payment";
                let order_id = bag
                    .text("orderId")
                    .map(OrderId)
                    .ok_or(MetadataError::MissingField { payment_type: TYPE, field: "orderId" })?;
                let target = match (bag.text("approvalRequestId"), bag.text("entryIds")) {
                    (Some(id), _) => SettlementTarget::ApprovalRequest {
                        approval_request_id: ApprovalRequestId(id),
                    },
                    (None, Some(list)) => {
                        let entry_ids: Vec<TimeEntryId> = list
                            .split(',')
                            .map(str::trim)
                            .filter(|id| !id.is_empty())
                            .map(TimeEntryId::new)
                            .collect();
                        if entry_ids.is_empty() {
                            return Err(MetadataError::InvalidField { field: "entryIds", value: list });
                        }
                        SettlementTarget::Entries { entry_ids }
                    }
                    (None, None) => {
                        return Err(MetadataError::MissingField {
                            payment_type: TYPE,
                            field: "approvalRequestId",
                        })
                    }
                };
                Ok(Self::AdditionalHoursPayment(AdditionalHoursPayment {
                    order_id,
                    target,
                    platform_fee_cents,
                }))
            }
            _ => Err(MetadataError::UnknownPaymentType(payment_type)),
        }
    }

    pub fn payment_type(&self) -> &'static str {
        match self {
            Self::B2bProject(_) => "b2b_project",
            Self::FixedPrice(_) => "fixed_price",
            Self::AdditionalHoursPayment(_) => "additional_hours_payment",
        }
    }

    pub fn platform_fee_cents(&self) -> Option<i64> {
        match self {
            Self::B2bProject(initial) | Self::FixedPrice(initial) => initial.platform_fee_cents,
            Self::AdditionalHoursPayment(hours) => hours.platform_fee_cents,
        }
    }
}

struct MetadataBag<'a>(&'a BTreeMap<String, Value>);

impl MetadataBag<'_> {
    fn text(&self, key: &str) -> Option<String> {
        match self.0.get(key)? {
            Value::String(value) if !value.trim().is_empty() => Some(value.trim().to_string()),
            Value::Number(number) => Some(number.to_string()),
            _ => None,
        }
    }

    fn cents(&self, key: &'static str) -> Result<Option<i64>, MetadataError> {
        match self.text(key) {
            None => Ok(None),
            Some(raw) => match raw.parse::<i64>() {
                Ok(cents) if cents >= 0 => Ok(Some(cents)),
                _ => Err(MetadataError::InvalidField { field: key, value: raw }),
            },
        }
    }

    fn initial_payment(
        &self,
        payment_type: &'static str,
        platform_fee_cents: Option<i64>,
    ) -> Result<InitialPayment, MetadataError> {
        let quote_id = self
            .text("quoteId")
            .or_else(|| self.text("projectRequestId"))
            .map(QuoteId)
            .ok_or(MetadataError::MissingField { payment_type, field: "quoteId" })?;
        let proposal_id = self
            .text("proposalId")
            .map(ProposalId)
            .ok_or(MetadataError::MissingField { payment_type, field: "proposalId" })?;
        Ok(InitialPayment { quote_id, proposal_id, platform_fee_cents })
    }
}

/// What a payment intent was used for.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "target", rename_all = "snake_case")]
pub enum IntentTarget {
    Order { order_id: OrderId, quote_id: QuoteId, proposal_id: ProposalId },
    ApprovalRequest { order_id: OrderId, approval_request_id: ApprovalRequestId },
}

/// Create-only marker that binds one payment intent to the effect it settled.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentIntentLink {
    pub payment_intent_id: PaymentIntentId,
    pub target: IntentTarget,
    pub event_id: EventId,
    pub created_at: DateTime<Utc>,
}

impl Document for PaymentIntentLink {
    fn key(&self) -> DocumentKey {
        Self::key_for(&self.payment_intent_id)
    }
}

impl PaymentIntentLink {
    pub fn key_for(id: &PaymentIntentId) -> DocumentKey {
        DocumentKey::new(PAYMENT_INTENTS, id.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum ParkReason {
    Unroutable { detail: String },
    AmountMismatch { expected_cents: i64, captured_cents: i64 },
    ProcessorTimeout,
    InvalidState { detail: String },
}

impl ParkReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unroutable { .. } => "unroutable",
            Self::AmountMismatch { .. } => "amount_mismatch",
            Self::ProcessorTimeout => "processor_timeout",
            Self::InvalidState { .. } => "invalid_state",
        }
    }
}

impl std::fmt::Display for ParkReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unroutable { detail } | Self::InvalidState { detail } => {
                write!(f, "{}: {detail}", self.as_str())
            }
            Self::AmountMismatch { expected_cents, captured_cents } => write!(
                f,
                "amount_mismatch: expected {expected_cents}, captured {captured_cents}"
            ),
            Self::ProcessorTimeout => f.write_str(self.as_str()),
        }
    }
}

/// Effect of a processed payment event, recorded on its dedup marker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    OrderCreated { order_id: OrderId, quote_id: QuoteId, proposal_id: ProposalId },
    OrderAlreadyExists { order_id: OrderId },
    HoursSettled {
        order_id: OrderId,
        approval_request_id: ApprovalRequestId,
        billed_entry_ids: Vec<TimeEntryId>,
        captured_cents: i64,
        payout_id: Option<PayoutId>,
    },
    AlreadySettled { order_id: OrderId, approval_request_id: ApprovalRequestId },
    PaymentReleased { quote_id: QuoteId, proposal_id: ProposalId },
    FailureNoted { payment_intent_id: PaymentIntentId },
    Ignored { event_type: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessedEventStatus {
    Processed,
    Ignored,
    Parked,
    Dismissed,
}

impl ProcessedEventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processed => "processed",
            Self::Ignored => "ignored",
            Self::Parked => "parked",
            Self::Dismissed => "dismissed",
        }
    }

    /// Parked events stay parked across replays until they process or are dismissed.
    pub fn can_transition_to(&self, next: ProcessedEventStatus) -> bool {
        matches!(
            (self, next),
            (Self::Parked, Self::Parked)
                | (Self::Parked, Self::Processed)
                | (Self::Parked, Self::Ignored)
                | (Self::Parked, Self::Dismissed)
        )
    }
}

/// Dedup marker keyed by processor event id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProcessedEvent {
    pub event_id: EventId,
    pub event_type: String,
    pub payment_intent_id: PaymentIntentId,
    pub status: ProcessedEventStatus,
    pub outcome: Option<ReconcileOutcome>,
    pub park_reason: Option<ParkReason>,
    pub payload: Option<PaymentEvent>,
    /// Signed body that did not decode into a [`PaymentEvent`].
    #[serde(default)]
    pub raw_payload: Option<Value>,
    pub attempts: u32,
    pub note: Option<String>,
    pub first_seen_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document for ProcessedEvent {
    fn key(&self) -> DocumentKey {
        Self::key_for(&self.event_id)
    }
}

impl ProcessedEvent {
    pub fn key_for(id: &EventId) -> DocumentKey {
        DocumentKey::new(PROCESSED_EVENTS, id.as_str())
    }

    pub fn disposition(&self) -> EventDisposition {
        EventDisposition {
            event_id: self.event_id.clone(),
            status: match self.status {
                ProcessedEventStatus::Processed => DispositionStatus::Processed,
                ProcessedEventStatus::Ignored => DispositionStatus::Ignored,
                ProcessedEventStatus::Parked | ProcessedEventStatus::Dismissed => {
                    DispositionStatus::Parked
                }
            },
            outcome: self.outcome.clone(),
            park_reason: self.park_reason.clone(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispositionStatus {
    Processed,
    Duplicate,
    Parked,
    Ignored,
}

/// Answer of the reconciler for one delivery. Every disposition acknowledges the webhook.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventDisposition {
    pub event_id: EventId,
    pub status: DispositionStatus,
    pub outcome: Option<ReconcileOutcome>,
    pub park_reason: Option<ParkReason>,
}

impl EventDisposition {
    pub fn duplicate_of(record: &ProcessedEvent) -> Self {
        Self { status: DispositionStatus::Duplicate, ..record.disposition() }
    }
}
