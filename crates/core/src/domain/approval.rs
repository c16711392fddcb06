use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::payment::{EventId, PaymentIntentId};
use crate::domain::time_entry::TimeEntryId;
use crate::errors::DomainError;

string_id!(ApprovalRequestId, "apr");

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    PartiallyApproved,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::PartiallyApproved => "partially_approved",
        }
    }

    pub fn can_transition_to(&self, next: ApprovalStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Approved)
                | (Self::Pending, Self::Rejected)
                | (Self::Pending, Self::PartiallyApproved)
        )
    }
}

/// Customer answer to an approval request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ApprovalDecision {
    ApproveAll,
    RejectAll,
    /// Listed entries are approved, every other member is rejected.
    PerEntry { approved_entry_ids: Vec<TimeEntryId> },
}

impl ApprovalDecision {
    /// Splits the request members into approved and rejected ids.
    pub fn partition(
        &self,
        members: &[TimeEntryId],
    ) -> Result<(Vec<TimeEntryId>, Vec<TimeEntryId>), DomainError> {
        match self {
            Self::ApproveAll => Ok((members.to_vec(), Vec::new())),
            Self::RejectAll => Ok((Vec::new(), members.to_vec())),
            Self::PerEntry { approved_entry_ids } => {
                let approved: BTreeSet<&TimeEntryId> = approved_entry_ids.iter().collect();
                if let Some(stranger) = approved.iter().find(|id| !members.contains(**id)) {
                    return Err(DomainError::Validation(format!(
                        "time entry `{stranger}` is not part of this approval request"
                    )));
                }
                Ok(members.iter().cloned().partition(|id| approved.contains(id)))
            }
        }
    }
}

pub fn status_for(approved: usize, rejected: usize) -> ApprovalStatus {
    match (approved, rejected) {
        (_, 0) => ApprovalStatus::Approved,
        (0, _) => ApprovalStatus::Rejected,
        _ => ApprovalStatus::PartiallyApproved,
    }
}

/// Payment that settled the approved part of a request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalSettlement {
    pub payment_intent_id: PaymentIntentId,
    pub event_id: EventId,
    pub captured_cents: i64,
    pub platform_fee_cents: i64,
    pub settled_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: ApprovalRequestId,
    pub entry_ids: Vec<TimeEntryId>,
    pub total_hours: Decimal,
    pub total_amount_cents: i64,
    pub status: ApprovalStatus,
    pub provider_message: Option<String>,
    pub customer_feedback: Option<String>,
    pub submitted_by: String,
    pub submitted_at: DateTime<Utc>,
    pub responded_at: Option<DateTime<Utc>>,
    pub settlement: Option<ApprovalSettlement>,
}

impl ApprovalRequest {
    pub fn transition_to(&mut self, next: ApprovalStatus) -> Result<(), DomainError> {
        if !self.status.can_transition_to(next) {
            return Err(DomainError::invalid_transition(
                "approval request",
                &self.id,
                self.status.as_str(),
                "record a customer response",
            ));
        }
        self.status = next;
        self.responded_at = Some(Utc::now());
        Ok(())
    }
}
