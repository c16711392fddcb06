use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::approval::ApprovalRequestId;
use crate::domain::payment::{EventId, PaymentIntentId};
use crate::domain::payout::PayoutId;
use crate::domain::quote::{ProposalId, QuoteId};
use crate::domain::time_entry::TimeTracking;
use crate::domain::{CompanyId, Currency, CustomerId};
use crate::errors::DomainError;
use crate::store::{Document, DocumentKey};

string_id!(OrderId, "ord");

pub const ORDERS: &str = "orders";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Aktiv,
    ProviderCompleted,
    Abgeschlossen,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Aktiv => "AKTIV",
            Self::ProviderCompleted => "PROVIDER_COMPLETED",
            Self::Abgeschlossen => "ABGESCHLOSSEN",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "AKTIV" => Some(Self::Aktiv),
            "PROVIDER_COMPLETED" => Some(Self::ProviderCompleted),
            "ABGESCHLOSSEN" => Some(Self::Abgeschlossen),
            "CANCELLED" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        matches!(
            (self, next),
            (Self::Aktiv, Self::ProviderCompleted)
                | (Self::ProviderCompleted, Self::Abgeschlossen)
                | (Self::Aktiv, Self::Cancelled)
                | (Self::ProviderCompleted, Self::Cancelled)
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CaptureKind {
    OrderPayment,
    AdditionalHours { approval_request_id: ApprovalRequestId },
}

impl CaptureKind {
    pub fn approval_request_id(&self) -> Option<&ApprovalRequestId> {
        match self {
            Self::OrderPayment => None,
            Self::AdditionalHours { approval_request_id } => Some(approval_request_id),
        }
    }
}

/// Money captured for this order. The fee is copied from the capture metadata and is
/// the only input to the commission at payout time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureRecord {
    pub payment_intent_id: PaymentIntentId,
    pub event_id: EventId,
    pub kind: CaptureKind,
    pub amount_cents: i64,
    pub platform_fee_cents: i64,
    pub currency: Currency,
    pub captured_at: DateTime<Utc>,
    pub payout_id: Option<PayoutId>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionReview {
    pub rating: Option<u8>,
    pub review: Option<String>,
}

impl CompletionReview {
    pub fn validate(&self) -> Result<(), DomainError> {
        if let Some(rating) = self.rating {
            if !(1..=5).contains(&rating) {
                return Err(DomainError::Validation(format!(
                    "rating must be between 1 and 5, got {rating}"
                )));
            }
        }
        if let Some(review) = &self.review {
            if review.trim().chars().count() < 10 {
                return Err(DomainError::Validation(
                    "review must be at least 10 characters long".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub quote_id: QuoteId,
    pub proposal_id: ProposalId,
    pub customer_id: CustomerId,
    pub provider_id: CompanyId,
    pub category: String,
    pub subcategory: Option<String>,
    pub payment_intent_id: PaymentIntentId,
    pub quoted_hours: Decimal,
    pub price_cents: i64,
    pub currency: Currency,
    pub status: OrderStatus,
    pub time_tracking: TimeTracking,
    pub captures: Vec<CaptureRecord>,
    pub payout_ids: Vec<PayoutId>,
    pub completion_note: Option<String>,
    pub review: Option<CompletionReview>,
    pub cancellation_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub provider_completed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl Document for Order {
    fn key(&self) -> DocumentKey {
        Self::key_for(&self.id)
    }
}

impl Order {
    pub fn key_for(id: &OrderId) -> DocumentKey {
        DocumentKey::new(ORDERS, id.as_str())
    }

    pub fn transition_to(&mut self, next: OrderStatus, action: &str) -> Result<(), DomainError> {
        if !self.status.can_transition_to(next) {
            return Err(DomainError::invalid_transition(
                "order",
                &self.id,
                self.status.as_str(),
                action,
            ));
        }
        let now = Utc::now();
        match next {
            OrderStatus::ProviderCompleted => self.provider_completed_at = Some(now),
            OrderStatus::Abgeschlossen => self.completed_at = Some(now),
            OrderStatus::Cancelled => self.cancelled_at = Some(now),
            OrderStatus::Aktiv => {}
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    pub fn total_captured_cents(&self) -> i64 {
        self.captures.iter().map(|capture| capture.amount_cents).sum()
    }

    pub fn total_platform_fee_cents(&self) -> i64 {
        self.captures.iter().map(|capture| capture.platform_fee_cents).sum()
    }

    pub fn capture_for_intent(&self, intent: &PaymentIntentId) -> Option<&CaptureRecord> {
        self.captures.iter().find(|capture| &capture.payment_intent_id == intent)
    }
}
