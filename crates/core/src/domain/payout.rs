use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::approval::ApprovalRequestId;
use crate::domain::order::OrderId;
use crate::domain::payment::PaymentIntentId;
use crate::domain::{CompanyId, Currency, CustomerId};
use crate::errors::DomainError;
use crate::store::{Document, DocumentKey};

string_id!(PayoutId, "po");

pub const PAYOUTS: &str = "payouts";
pub const PAYOUT_SLOTS: &str = "payout_slots";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutStatus {
    Pending,
    Processing,
    Paid,
    Failed,
}

impl PayoutStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Paid => "paid",
            Self::Failed => "failed",
        }
    }

    pub fn can_transition_to(&self, next: PayoutStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Processing)
                | (Self::Processing, Self::Paid)
                | (Self::Pending, Self::Failed)
                | (Self::Processing, Self::Failed)
        )
    }
}

/// Captures a payout covers: the order itself, or one late approval request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "batch", rename_all = "snake_case")]
pub enum PayoutBatch {
    Order,
    ApprovalRequest { approval_request_id: ApprovalRequestId },
}

impl PayoutBatch {
    fn slot_suffix(&self) -> &str {
        match self {
            Self::Order => "order",
            Self::ApprovalRequest { approval_request_id } => approval_request_id.as_str(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payout {
    pub id: PayoutId,
    pub order_id: OrderId,
    pub provider_id: CompanyId,
    pub customer_id: CustomerId,
    pub batch: PayoutBatch,
    pub captured_cents: i64,
    pub commission_cents: i64,
    pub amount_cents: i64,
    pub currency: Currency,
    pub status: PayoutStatus,
    pub payment_intent_ids: Vec<PaymentIntentId>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
}

impl Document for Payout {
    fn key(&self) -> DocumentKey {
        Self::key_for(&self.id)
    }
}

impl Payout {
    pub fn key_for(id: &PayoutId) -> DocumentKey {
        DocumentKey::new(PAYOUTS, id.as_str())
    }

    pub fn transition_to(&mut self, next: PayoutStatus) -> Result<(), DomainError> {
        if !self.status.can_transition_to(next) {
            return Err(DomainError::invalid_transition(
                "payout",
                &self.id,
                self.status.as_str(),
                format!("move to `{}`", next.as_str()),
            ));
        }
        let now = Utc::now();
        if next == PayoutStatus::Paid {
            self.paid_at = Some(now);
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }
}

/// Unique `(order, batch)` claim. `payout_id` is cleared when the payout fails so the
/// batch can be paid out again.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutSlot {
    pub order_id: OrderId,
    pub batch: PayoutBatch,
    pub payout_id: Option<PayoutId>,
    pub updated_at: DateTime<Utc>,
}

impl Document for PayoutSlot {
    fn key(&self) -> DocumentKey {
        Self::key_for(&self.order_id, &self.batch)
    }
}

impl PayoutSlot {
    pub fn key_for(order_id: &OrderId, batch: &PayoutBatch) -> DocumentKey {
        DocumentKey::new(PAYOUT_SLOTS, format!("{order_id}:{}", batch.slot_suffix()))
    }
}

#[cfg(test)]
mod tests {
    use super::{PayoutBatch, PayoutSlot, PayoutStatus};
    use crate::domain::approval::ApprovalRequestId;
    use crate::domain::order::OrderId;

    #[test]
    fn payout_status_table() {
        assert!(PayoutStatus::Pending.can_transition_to(PayoutStatus::Processing));
        assert!(PayoutStatus::Processing.can_transition_to(PayoutStatus::Paid));
        assert!(PayoutStatus::Pending.can_transition_to(PayoutStatus::Failed));
        assert!(!PayoutStatus::Pending.can_transition_to(PayoutStatus::Paid));
        assert!(!PayoutStatus::Paid.can_transition_to(PayoutStatus::Failed));
        assert!(!PayoutStatus::Failed.can_transition_to(PayoutStatus::Pending));
    }

    #[test]
    fn slot_keys_are_unique_per_order_and_batch() {
        let order = OrderId::new("O1");
        let whole = PayoutSlot::key_for(&order, &PayoutBatch::Order);
        let late = PayoutSlot::key_for(
            &order,
            &PayoutBatch::ApprovalRequest { approval_request_id: ApprovalRequestId::new("apr-1") },
        );
        assert_eq!(whole.to_string(), "payout_slots/O1:order");
        assert_eq!(late.to_string(), "payout_slots/O1:apr-1");
    }
}
