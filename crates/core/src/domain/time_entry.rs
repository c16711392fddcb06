use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::domain::approval::{ApprovalRequest, ApprovalRequestId, ApprovalStatus};
use crate::domain::payment::PaymentIntentId;
use crate::errors::DomainError;

string_id!(TimeEntryId, "te");

const MAX_ENTRY_HOURS: i64 = 24;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeEntryCategory {
    /// Covered by the upfront proposal price.
    Original,
    /// Billable beyond the quote, needs customer approval.
    Additional,
}

impl TimeEntryCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Original => "original",
            Self::Additional => "additional",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeEntryStatus {
    Logged,
    Submitted,
    CustomerApproved,
    CustomerRejected,
    Billed,
}

impl TimeEntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Logged => "logged",
            Self::Submitted => "submitted",
            Self::CustomerApproved => "customer_approved",
            Self::CustomerRejected => "customer_rejected",
            Self::Billed => "billed",
        }
    }

    pub fn can_transition_to(&self, next: TimeEntryStatus) -> bool {
        matches!(
            (self, next),
            (Self::Logged, Self::Submitted)
                | (Self::Submitted, Self::Logged)
                | (Self::Submitted, Self::CustomerApproved)
                | (Self::Submitted, Self::CustomerRejected)
                | (Self::CustomerApproved, Self::Billed)
        )
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimeEntry {
    pub id: TimeEntryId,
    pub date: NaiveDate,
    pub start_time: Option<NaiveTime>,
    pub end_time: Option<NaiveTime>,
    pub hours: Decimal,
    pub description: String,
    pub category: TimeEntryCategory,
    pub status: TimeEntryStatus,
    pub billable_amount_cents: i64,
    pub approval_request_id: Option<ApprovalRequestId>,
    pub payment_intent_id: Option<PaymentIntentId>,
    pub logged_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub billed_at: Option<DateTime<Utc>>,
}

impl TimeEntry {
    pub fn transition_to(&mut self, next: TimeEntryStatus, action: &str) -> Result<(), DomainError> {
        if !self.status.can_transition_to(next) {
            return Err(DomainError::invalid_transition(
                "time entry",
                &self.id,
                self.status.as_str(),
                action,
            ));
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// Work interval as submitted by a provider, before it becomes a [`TimeEntry`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewTimeEntry {
    pub date: NaiveDate,
    pub start_time: Option<NaiveTime>,
    pub end_time: Option<NaiveTime>,
    pub hours: Option<Decimal>,
    pub description: String,
    pub category: TimeEntryCategory,
}

impl NewTimeEntry {
    /// Duration from start/end when both are present, otherwise the explicit hours.
    pub fn resolve_hours(&self) -> Result<Decimal, DomainError> {
        let hours = match (self.start_time, self.end_time, self.hours) {
            (Some(start), Some(end), _) => {
                if end <= start {
                    return Err(DomainError::Validation(
                        "end time must be after start time".to_string(),
                    ));
                }
                let minutes = (end - start).num_minutes();
                Decimal::new(minutes, 0) / Decimal::new(60, 0)
            }
            (_, _, Some(hours)) => hours,
            _ => {
                return Err(DomainError::Validation(
                    "either start and end time or a duration in hours is required".to_string(),
                ))
            }
        };

        if hours <= Decimal::ZERO || hours > Decimal::new(MAX_ENTRY_HOURS, 0) {
            return Err(DomainError::Validation(format!(
                "hours must be in range (0, {MAX_ENTRY_HOURS}], got {hours}"
            )));
        }
        Ok(hours.round_dp(2))
    }
}

/// `round_half_away_from_zero(hours * rate)` in minor units.
pub fn billable_amount(hours: Decimal, hourly_rate_cents: i64) -> Result<i64, DomainError> {
    (hours * Decimal::from(hourly_rate_cents))
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .ok_or_else(|| {
            DomainError::InvariantViolation(format!(
                "billable amount for {hours}h at {hourly_rate_cents} overflows"
            ))
        })
}

/// Read-time projection over the entries; never persisted.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeTrackingTotals {
    pub logged_hours: Decimal,
    pub original_hours: Decimal,
    pub additional_hours: Decimal,
    pub approved_hours: Decimal,
    pub billed_hours: Decimal,
    pub pending_amount_cents: i64,
    pub approved_unbilled_amount_cents: i64,
    pub billed_amount_cents: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimeTracking {
    pub hourly_rate_cents: i64,
    pub entries: Vec<TimeEntry>,
    pub approval_requests: Vec<ApprovalRequest>,
}

impl TimeTracking {
    pub fn new(hourly_rate_cents: i64) -> Self {
        Self { hourly_rate_cents, entries: Vec::new(), approval_requests: Vec::new() }
    }

    pub fn entry(&self, id: &TimeEntryId) -> Option<&TimeEntry> {
        self.entries.iter().find(|entry| &entry.id == id)
    }

    pub fn entry_mut(&mut self, id: &TimeEntryId) -> Result<&mut TimeEntry, DomainError> {
        self.entries
            .iter_mut()
            .find(|entry| &entry.id == id)
            .ok_or_else(|| DomainError::Validation(format!("time entry `{id}` does not exist")))
    }

    pub fn approval_request(&self, id: &ApprovalRequestId) -> Option<&ApprovalRequest> {
        self.approval_requests.iter().find(|request| &request.id == id)
    }

    pub fn approval_request_mut(
        &mut self,
        id: &ApprovalRequestId,
    ) -> Result<&mut ApprovalRequest, DomainError> {
        self.approval_requests.iter_mut().find(|request| &request.id == id).ok_or_else(|| {
            DomainError::Validation(format!("approval request `{id}` does not exist"))
        })
    }

    /// Finds the single approval request that contains every listed entry.
    pub fn approval_request_for_entries(
        &self,
        entry_ids: &[TimeEntryId],
    ) -> Result<&ApprovalRequest, DomainError> {
        let mut owners = entry_ids
            .iter()
            .map(|id| self.entry(id).and_then(|entry| entry.approval_request_id.clone()));
        let first = owners.next().flatten().ok_or_else(|| {
            DomainError::Validation("entries are not part of any approval request".to_string())
        })?;
        if owners.any(|owner| owner.as_ref() != Some(&first)) {
            return Err(DomainError::Validation(
                "entries span more than one approval request".to_string(),
            ));
        }
        self.approval_request(&first).ok_or_else(|| {
            DomainError::Validation(format!("approval request `{first}` does not exist"))
        })
    }

    pub fn log(&mut self, entry: TimeEntry) {
        self.entries.push(entry);
    }

    /// Entries of `request` that the customer approved, in request order.
    pub fn approved_entries(&self, request: &ApprovalRequest) -> Vec<&TimeEntry> {
        request
            .entry_ids
            .iter()
            .filter_map(|id| self.entry(id))
            .filter(|entry| entry.status == TimeEntryStatus::CustomerApproved)
            .collect()
    }

    pub fn totals(&self) -> TimeTrackingTotals {
        let mut totals = TimeTrackingTotals::default();
        for entry in &self.entries {
            totals.logged_hours += entry.hours;
            match entry.category {
                TimeEntryCategory::Original => totals.original_hours += entry.hours,
                TimeEntryCategory::Additional => totals.additional_hours += entry.hours,
            }
            match entry.status {
                TimeEntryStatus::Submitted => {
                    totals.pending_amount_cents += entry.billable_amount_cents;
                }
                TimeEntryStatus::CustomerApproved => {
                    totals.approved_hours += entry.hours;
                    totals.approved_unbilled_amount_cents += entry.billable_amount_cents;
                }
                TimeEntryStatus::Billed => {
                    totals.approved_hours += entry.hours;
                    totals.billed_hours += entry.hours;
                    totals.billed_amount_cents += entry.billable_amount_cents;
                }
                TimeEntryStatus::Logged | TimeEntryStatus::CustomerRejected => {}
            }
        }
        totals
    }

    /// Takes a submitted entry back out of its pending approval request and returns it to
    /// `logged`. A request left without entries is dropped.
    pub fn withdraw_from_approval(&mut self, entry_id: &TimeEntryId) -> Result<(), DomainError> {
        let entry = self.entry_mut(entry_id)?;
        let request_id = entry.approval_request_id.clone().ok_or_else(|| {
            DomainError::Validation(format!("time entry `{entry_id}` is not awaiting approval"))
        })?;
        let (hours, amount_cents) = (entry.hours, entry.billable_amount_cents);

        let request = self.approval_request_mut(&request_id)?;
        if request.status != ApprovalStatus::Pending {
            return Err(DomainError::invalid_transition(
                "approval request",
                &request_id,
                request.status.as_str(),
                format!("release time entry `{entry_id}`"),
            ));
        }
        request.entry_ids.retain(|id| id != entry_id);
        request.total_hours -= hours;
        request.total_amount_cents -= amount_cents;
        if request.entry_ids.is_empty() {
            self.approval_requests.retain(|request| request.id != request_id);
        }

        let entry = self.entry_mut(entry_id)?;
        entry.transition_to(TimeEntryStatus::Logged, "be withdrawn from approval")?;
        entry.approval_request_id = None;
        Ok(())
    }
}
