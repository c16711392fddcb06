//! Time entries and customer approval of additional hours. Approval only authorizes
//! billing; entries become `billed` when the reconciler settles the matching capture.

use std::collections::BTreeSet;

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::info;

use crate::context::LedgerContext;
use crate::domain::approval::{
    status_for, ApprovalDecision, ApprovalRequest, ApprovalRequestId, ApprovalStatus,
};
use crate::domain::balance::{AuditEntryId, LedgerAuditEntry};
use crate::domain::order::{Order, OrderId, OrderStatus};
use crate::domain::payment::PaymentIntentId;
use crate::domain::time_entry::{
    billable_amount, NewTimeEntry, TimeEntry, TimeEntryCategory, TimeEntryId, TimeEntryStatus,
};
use crate::domain::{Actor, ActorRole};
use crate::errors::{ApplicationError, DomainError};
use crate::facts::DomainFact;
use crate::store::LedgerTransaction;

/// Marks the approved members of `request_id` as billed against `payment_intent_id`.
pub fn bill_approved_entries(
    tx: &mut LedgerTransaction,
    order: &mut Order,
    request_id: &ApprovalRequestId,
    payment_intent_id: &PaymentIntentId,
) -> Result<Vec<TimeEntryId>, ApplicationError> {
    let request = order
        .time_tracking
        .approval_request(request_id)
        .ok_or_else(|| ApplicationError::not_found("approval request", request_id))?;
    let approved: Vec<TimeEntryId> = order
        .time_tracking
        .approved_entries(request)
        .into_iter()
        .map(|entry| entry.id.clone())
        .collect();

    let now = Utc::now();
    for entry_id in &approved {
        let entry = order.time_tracking.entry_mut(entry_id)?;
        entry.transition_to(TimeEntryStatus::Billed, "be billed")?;
        entry.payment_intent_id = Some(payment_intent_id.clone());
        entry.billed_at = Some(now);
        tx.emit(DomainFact::TimeEntryBilled {
            order_id: order.id.clone(),
            time_entry_id: entry_id.clone(),
            payment_intent_id: payment_intent_id.clone(),
            amount_cents: entry.billable_amount_cents,
        });
    }
    order.updated_at = now;
    Ok(approved)
}

fn ensure_assigned_provider(actor: &Actor, order: &Order, action: &str) -> Result<(), ApplicationError> {
    if actor.role == ActorRole::Provider && actor.id == order.provider_id.as_str() {
        Ok(())
    } else {
        Err(ApplicationError::forbidden(actor, action))
    }
}

#[derive(Clone)]
pub struct TimeTrackingService {
    ctx: LedgerContext,
}

impl TimeTrackingService {
    pub fn new(ctx: LedgerContext) -> Self {
        Self { ctx }
    }

    pub async fn log_time(
        &self,
        actor: &Actor,
        order_id: &OrderId,
        input: NewTimeEntry,
        correlation_id: &str,
    ) -> Result<TimeEntry, ApplicationError> {
        let hours = input.resolve_hours()?;
        if input.description.trim().is_empty() {
            return Err(DomainError::Validation("a description is required".to_string()).into());
        }

        let actor = actor.clone();
        let order_id = order_id.clone();
        let entry = self
            .ctx
            .transact("time_entry.log", correlation_id, move |tx| {
                let actor = actor.clone();
                let order_id = order_id.clone();
                let input = input.clone();
                Box::pin(async move {
                    let mut order: Order = tx.require(&Order::key_for(&order_id), "order").await?;
                    ensure_assigned_provider(&actor, &order, "log time on the order")?;
                    if order.status != OrderStatus::Aktiv {
                        return Err(DomainError::invalid_transition(
                            "order",
                            &order.id,
                            order.status.as_str(),
                            "accept time entries",
                        )
                        .into());
                    }

                    let billable_amount_cents = match input.category {
                        TimeEntryCategory::Original => 0,
                        TimeEntryCategory::Additional => {
                            billable_amount(hours, order.time_tracking.hourly_rate_cents)?
                        }
                    };
                    let now = Utc::now();
                    let entry = TimeEntry {
                        id: TimeEntryId::generate(),
                        date: input.date,
                        start_time: input.start_time,
                        end_time: input.end_time,
                        hours,
                        description: input.description.trim().to_string(),
                        category: input.category,
                        status: TimeEntryStatus::Logged,
                        billable_amount_cents,
                        approval_request_id: None,
                        payment_intent_id: None,
                        logged_by: actor.id.clone(),
                        created_at: now,
                        updated_at: now,
                        billed_at: None,
                    };
                    order.time_tracking.log(entry.clone());
                    order.updated_at = now;
                    tx.put(&order)?;
                    Ok(entry)
                })
            })
            .await?;

        info!(
            event_name = "ledger.time_entry.logged",
            correlation_id,
            time_entry_id = %entry.id,
            category = entry.category.as_str(),
            "time entry logged"
        );
        Ok(entry)
    }

    /// Groups logged additional entries into one approval request and freezes their
    /// billable amounts at the order's hourly rate.
    pub async fn submit_for_approval(
        &self,
        actor: &Actor,
        order_id: &OrderId,
        entry_ids: Vec<TimeEntryId>,
        message: Option<String>,
        correlation_id: &str,
    ) -> Result<ApprovalRequest, ApplicationError> {
        if entry_ids.is_empty() {
            return Err(DomainError::Validation("at least one time entry is required".to_string()).into());
        }
        let unique: BTreeSet<&TimeEntryId> = entry_ids.iter().collect();
        if unique.len() != entry_ids.len() {
            return Err(DomainError::Validation("time entries must be listed once".to_string()).into());
        }

        let actor = actor.clone();
        let order_id = order_id.clone();
        let request = self
            .ctx
            .transact("approval.submit", correlation_id, move |tx| {
                let actor = actor.clone();
                let order_id = order_id.clone();
                let entry_ids = entry_ids.clone();
                let message = message.clone();
                Box::pin(async move {
                    let mut order: Order = tx.require(&Order::key_for(&order_id), "order").await?;
                    ensure_assigned_provider(&actor, &order, "submit hours for approval")?;
                    if !matches!(order.status, OrderStatus::Aktiv | OrderStatus::ProviderCompleted) {
                        return Err(DomainError::invalid_transition(
                            "order",
                            &order.id,
                            order.status.as_str(),
                            "accept approval requests",
                        )
                        .into());
                    }

                    let request_id = ApprovalRequestId::generate();
                    let rate = order.time_tracking.hourly_rate_cents;
                    let mut total_hours = Decimal::ZERO;
                    let mut total_amount_cents = 0_i64;
                    for entry_id in &entry_ids {
                        let entry = order.time_tracking.entry_mut(entry_id)?;
                        if entry.category == TimeEntryCategory::Original {
                            return Err(DomainError::invalid_transition(
                                "time entry",
                                entry_id,
                                format!("{} (original)", entry.status.as_str()),
                                "be submitted for approval",
                            )
                            .into());
                        }
                        entry.transition_to(TimeEntryStatus::Submitted, "be submitted for approval")?;
                        entry.billable_amount_cents = billable_amount(entry.hours, rate)?;
                        entry.approval_request_id = Some(request_id.clone());
                        total_hours += entry.hours;
                        total_amount_cents += entry.billable_amount_cents;
                    }

                    let request = ApprovalRequest {
                        id: request_id,
                        entry_ids,
                        total_hours,
                        total_amount_cents,
                        status: ApprovalStatus::Pending,
                        provider_message: message.filter(|value| !value.trim().is_empty()),
                        customer_feedback: None,
                        submitted_by: actor.id.clone(),
                        submitted_at: Utc::now(),
                        responded_at: None,
                        settlement: None,
                    };
                    order.time_tracking.approval_requests.push(request.clone());
                    order.updated_at = Utc::now();
                    tx.put(&order)?;
                    tx.emit(DomainFact::ApprovalRequested {
                        order_id: order.id.clone(),
                        approval_request_id: request.id.clone(),
                        total_amount_cents,
                    });
                    Ok(request)
                })
            })
            .await?;

        info!(
            event_name = "ledger.approval.requested",
            correlation_id,
            approval_request_id = %request.id,
            total_amount_cents = request.total_amount_cents,
            "approval requested"
        );
        Ok(request)
    }

    pub async fn customer_respond(
        &self,
        actor: &Actor,
        order_id: &OrderId,
        approval_request_id: &ApprovalRequestId,
        decision: ApprovalDecision,
        feedback: Option<String>,
        correlation_id: &str,
    ) -> Result<ApprovalRequest, ApplicationError> {
        let actor = actor.clone();
        let order_id = order_id.clone();
        let approval_request_id = approval_request_id.clone();
        let request = self
            .ctx
            .transact("approval.respond", correlation_id, move |tx| {
                let actor = actor.clone();
                let order_id = order_id.clone();
                let request_id = approval_request_id.clone();
                let decision = decision.clone();
                let feedback = feedback.clone();
                Box::pin(async move {
                    let mut order: Order = tx.require(&Order::key_for(&order_id), "order").await?;
                    if !actor.is_customer(&order.customer_id) {
                        return Err(ApplicationError::forbidden(&actor, "respond to an approval request"));
                    }
                    if order.status == OrderStatus::Cancelled {
                        return Err(DomainError::invalid_transition(
                            "order",
                            &order.id,
                            order.status.as_str(),
                            "accept approval responses",
                        )
                        .into());
                    }

                    let request = order.time_tracking.approval_request_mut(&request_id)?;
                    let (approved, rejected) = decision.partition(&request.entry_ids)?;
                    request.transition_to(status_for(approved.len(), rejected.len()))?;
                    request.customer_feedback = feedback.filter(|value| !value.trim().is_empty());
                    let request = request.clone();

                    for entry_id in &approved {
                        order
                            .time_tracking
                            .entry_mut(entry_id)?
                            .transition_to(TimeEntryStatus::CustomerApproved, "be approved")?;
                    }
                    for entry_id in &rejected {
                        order
                            .time_tracking
                            .entry_mut(entry_id)?
                            .transition_to(TimeEntryStatus::CustomerRejected, "be rejected")?;
                    }
                    order.updated_at = Utc::now();
                    tx.put(&order)?;
                    tx.emit(DomainFact::ApprovalResponded {
                        order_id: order.id.clone(),
                        approval_request_id: request.id.clone(),
                        status: request.status,
                    });
                    Ok(request)
                })
            })
            .await?;

        info!(
            event_name = "ledger.approval.responded",
            correlation_id,
            approval_request_id = %request.id,
            status = request.status.as_str(),
            "approval request answered"
        );
        Ok(request)
    }

    /// Moves a logged entry between `original` and `additional`, recomputing its amount
    /// and leaving an audit entry on the provider company. A submitted entry can still be
    /// moved to `original`; it leaves its pending approval request in the same commit.
    pub async fn recategorize_entry(
        &self,
        actor: &Actor,
        order_id: &OrderId,
        entry_id: &TimeEntryId,
        category: TimeEntryCategory,
        reason: String,
        correlation_id: &str,
    ) -> Result<TimeEntry, ApplicationError> {
        if reason.trim().is_empty() {
            return Err(DomainError::Validation("a reason is required to recategorize".to_string()).into());
        }
        let actor = actor.clone();
        let order_id = order_id.clone();
        let entry_id = entry_id.clone();
        let entry = self
            .ctx
            .transact("time_entry.recategorize", correlation_id, move |tx| {
                let actor = actor.clone();
                let order_id = order_id.clone();
                let entry_id = entry_id.clone();
                let reason = reason.trim().to_string();
                Box::pin(async move {
                    let mut order: Order = tx.require(&Order::key_for(&order_id), "order").await?;
                    if !actor.is_provider(&order.provider_id) {
                        return Err(ApplicationError::forbidden(&actor, "recategorize a time entry"));
                    }
                    let rate = order.time_tracking.hourly_rate_cents;
                    let current = order.time_tracking.entry_mut(&entry_id)?;
                    match current.status {
                        TimeEntryStatus::Logged => {}
                        TimeEntryStatus::Submitted if category == TimeEntryCategory::Original => {
                            order.time_tracking.withdraw_from_approval(&entry_id)?;
                        }
                        status => {
                            return Err(DomainError::invalid_transition(
                                "time entry",
                                &entry_id,
                                status.as_str(),
                                "be recategorized",
                            )
                            .into());
                        }
                    }
                    let entry = order.time_tracking.entry_mut(&entry_id)?;
                    if entry.category == category {
                        return Err(DomainError::Validation(format!(
                            "time entry `{entry_id}` is already `{}`",
                            category.as_str()
                        ))
                        .into());
                    }

                    let previous_category = entry.category;
                    let previous_amount_cents = entry.billable_amount_cents;
                    entry.category = category;
                    entry.billable_amount_cents = match category {
                        TimeEntryCategory::Original => 0,
                        TimeEntryCategory::Additional => billable_amount(entry.hours, rate)?,
                    };
                    entry.updated_at = Utc::now();
                    let entry = entry.clone();

                    tx.put(&LedgerAuditEntry {
                        id: AuditEntryId::generate(),
                        company_id: order.provider_id.clone(),
                        order_id: order.id.clone(),
                        time_entry_id: entry.id.clone(),
                        previous_category,
                        new_category: category,
                        previous_amount_cents,
                        new_amount_cents: entry.billable_amount_cents,
                        actor: actor.to_string(),
                        reason,
                        recorded_at: entry.updated_at,
                    })?;
                    order.updated_at = entry.updated_at;
                    tx.put(&order)?;
                    tx.emit(DomainFact::TimeEntryRecategorized {
                        order_id: order.id.clone(),
                        time_entry_id: entry.id.clone(),
                        from: previous_category,
                        to: category,
                    });
                    Ok(entry)
                })
            })
            .await?;

        info!(
            event_name = "ledger.time_entry.recategorized",
            correlation_id,
            time_entry_id = %entry.id,
            category = entry.category.as_str(),
            "time entry recategorized"
        );
        Ok(entry)
    }
}
