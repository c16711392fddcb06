//! Escrow and payout calculator.
//!
//! Captured money is held by the platform per provider company. Every movement is an
//! append-only [`BalanceHistoryEntry`] written in the same transaction as the company
//! counter, so `counter == sum(history)` holds after every commit.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::context::LedgerContext;
use crate::domain::balance::{
    balance_history_collection, BalanceEntryId, BalanceEntryKind, BalanceEntryStatus,
    BalanceHistoryEntry, CompanyBalance, CompanyBalanceView, COMPANIES,
};
use crate::domain::order::{CaptureKind, CaptureRecord, Order, OrderId, OrderStatus};
use crate::domain::payment::{EventId, PaymentIntentId};
use crate::domain::payout::{Payout, PayoutBatch, PayoutId, PayoutSlot, PayoutStatus};
use crate::domain::{Actor, CompanyId, Currency};
use crate::errors::{ApplicationError, DomainError};
use crate::facts::DomainFact;
use crate::store::{self, LedgerTransaction};

/// Money confirmed by the processor for one payment intent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CaptureInput {
    pub payment_intent_id: PaymentIntentId,
    pub event_id: EventId,
    pub kind: CaptureKind,
    pub amount_cents: i64,
    pub platform_fee_cents: i64,
    pub currency: Currency,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum PayoutResult {
    Created { payout: Payout },
    Existing { payout: Payout },
    NothingToPay,
}

impl PayoutResult {
    pub fn payout(&self) -> Option<&Payout> {
        match self {
            Self::Created { payout } | Self::Existing { payout } => Some(payout),
            Self::NothingToPay => None,
        }
    }
}

/// Appends the capture to `order` and credits the provider's held balance. The caller
/// stages the order write.
pub async fn record_captured_payment(
    tx: &mut LedgerTransaction,
    order: &mut Order,
    capture: CaptureInput,
) -> Result<BalanceHistoryEntry, ApplicationError> {
    if order.capture_for_intent(&capture.payment_intent_id).is_some() {
        return Err(DomainError::InvariantViolation(format!(
            "payment intent `{}` is already recorded on order `{}`",
            capture.payment_intent_id, order.id
        ))
        .into());
    }
    if capture.platform_fee_cents < 0 || capture.platform_fee_cents > capture.amount_cents {
        return Err(DomainError::Validation(format!(
            "platform fee {} is outside the captured amount {}",
            capture.platform_fee_cents, capture.amount_cents
        ))
        .into());
    }

    let now = Utc::now();
    let kind = match capture.kind {
        CaptureKind::OrderPayment => BalanceEntryKind::OrderPayment,
        CaptureKind::AdditionalHours { .. } => BalanceEntryKind::AdditionalHoursPayment,
    };
    let entry = BalanceHistoryEntry {
        id: BalanceEntryId::generate(),
        company_id: order.provider_id.clone(),
        kind,
        amount_cents: capture.amount_cents,
        commission_cents: capture.platform_fee_cents,
        payment_intent_id: Some(capture.payment_intent_id.clone()),
        order_id: order.id.clone(),
        payout_id: None,
        status: BalanceEntryStatus::PlatformHeld,
        created_at: now,
    };

    order.captures.push(CaptureRecord {
        payment_intent_id: capture.payment_intent_id,
        event_id: capture.event_id,
        kind: capture.kind,
        amount_cents: capture.amount_cents,
        platform_fee_cents: capture.platform_fee_cents,
        currency: capture.currency,
        captured_at: now,
        payout_id: None,
    });
    order.updated_at = now;

    append_balance_entry(tx, &entry).await?;
    Ok(entry)
}

/// Creates the payout for one batch of `order`, or returns the live one. Captures are
/// allocated to the new payout; the caller stages the order write.
pub async fn compute_payout(
    tx: &mut LedgerTransaction,
    order: &mut Order,
    batch: PayoutBatch,
) -> Result<PayoutResult, ApplicationError> {
    let slot_key = PayoutSlot::key_for(&order.id, &batch);
    if let Some(slot) = tx.get::<PayoutSlot>(&slot_key).await? {
        if let Some(payout_id) = &slot.payout_id {
            let existing: Payout = tx.require(&Payout::key_for(payout_id), "payout").await?;
            if existing.status != PayoutStatus::Failed {
                return Ok(PayoutResult::Existing { payout: existing });
            }
        }
    }

    let in_batch = |capture: &CaptureRecord| {
        capture.payout_id.is_none()
            && match &batch {
                PayoutBatch::Order => true,
                PayoutBatch::ApprovalRequest { approval_request_id } => {
                    capture.kind.approval_request_id() == Some(approval_request_id)
                }
            }
    };
    let covered: Vec<&CaptureRecord> = order.captures.iter().filter(|c| in_batch(c)).collect();
    if covered.is_empty() {
        return Ok(PayoutResult::NothingToPay);
    }

    let captured_cents: i64 = covered.iter().map(|capture| capture.amount_cents).sum();
    let commission_cents: i64 = covered.iter().map(|capture| capture.platform_fee_cents).sum();
    let amount_cents = captured_cents - commission_cents;
    if amount_cents < 0 {
        return Err(DomainError::InvariantViolation(format!(
            "commission {commission_cents} exceeds captured {captured_cents} on order `{}`",
            order.id
        ))
        .into());
    }

    let now = Utc::now();
    let payout = Payout {
        id: PayoutId::generate(),
        order_id: order.id.clone(),
        provider_id: order.provider_id.clone(),
        customer_id: order.customer_id.clone(),
        batch: batch.clone(),
        captured_cents,
        commission_cents,
        amount_cents,
        currency: order.currency.clone(),
        status: PayoutStatus::Pending,
        payment_intent_ids: covered.iter().map(|c| c.payment_intent_id.clone()).collect(),
        failure_reason: None,
        created_at: now,
        updated_at: now,
        paid_at: None,
    };

    for capture in order.captures.iter_mut().filter(|c| in_batch(c)) {
        capture.payout_id = Some(payout.id.clone());
    }
    order.payout_ids.push(payout.id.clone());
    order.updated_at = now;

    tx.put(&PayoutSlot {
        order_id: order.id.clone(),
        batch,
        payout_id: Some(payout.id.clone()),
        updated_at: now,
    })?;
    tx.put(&payout)?;

    for (kind, amount, status) in [
        (BalanceEntryKind::PayoutReserved, -amount_cents, BalanceEntryStatus::ReservedForPayout),
        (BalanceEntryKind::PlatformCommission, -commission_cents, BalanceEntryStatus::Released),
    ] {
        let entry = BalanceHistoryEntry {
            id: BalanceEntryId::generate(),
            company_id: order.provider_id.clone(),
            kind,
            amount_cents: amount,
            commission_cents: if kind == BalanceEntryKind::PlatformCommission {
                commission_cents
            } else {
                0
            },
            payment_intent_id: None,
            order_id: order.id.clone(),
            payout_id: Some(payout.id.clone()),
            status,
            created_at: now,
        };
        append_balance_entry(tx, &entry).await?;
    }

    tx.emit(DomainFact::PayoutCreated {
        payout_id: payout.id.clone(),
        order_id: order.id.clone(),
        amount_cents,
    });
    Ok(PayoutResult::Created { payout })
}

/// Advances a payout. A failed payout credits the held balance back, releases its
/// captures and frees the batch slot so the batch can be paid out again.
pub async fn update_payout_status(
    tx: &mut LedgerTransaction,
    payout_id: &PayoutId,
    next: PayoutStatus,
    failure_reason: Option<String>,
) -> Result<Payout, ApplicationError> {
    let failure_reason = failure_reason.map(|reason| reason.trim().to_string());
    if next == PayoutStatus::Failed && failure_reason.as_deref().map_or(true, str::is_empty) {
        return Err(DomainError::Validation(format!(
            "payout `{payout_id}` cannot fail without a failure reason"
        ))
        .into());
    }
    let mut payout: Payout = tx.require(&Payout::key_for(payout_id), "payout").await?;
    let previous = payout.status;
    payout.transition_to(next)?;

    if next == PayoutStatus::Failed {
        payout.failure_reason = failure_reason;

        let mut order: Order = tx.require(&Order::key_for(&payout.order_id), "order").await?;
        for capture in order.captures.iter_mut() {
            if capture.payout_id.as_ref() == Some(payout_id) {
                capture.payout_id = None;
            }
        }
        order.updated_at = Utc::now();
        tx.put(&order)?;

        let slot_key = PayoutSlot::key_for(&payout.order_id, &payout.batch);
        let mut slot: PayoutSlot = tx.require(&slot_key, "payout slot").await?;
        slot.payout_id = None;
        slot.updated_at = Utc::now();
        tx.put(&slot)?;

        append_balance_entry(
            tx,
            &BalanceHistoryEntry {
                id: BalanceEntryId::generate(),
                company_id: payout.provider_id.clone(),
                kind: BalanceEntryKind::PayoutReversed,
                amount_cents: payout.amount_cents + payout.commission_cents,
                commission_cents: payout.commission_cents,
                payment_intent_id: None,
                order_id: payout.order_id.clone(),
                payout_id: Some(payout.id.clone()),
                status: BalanceEntryStatus::PlatformHeld,
                created_at: Utc::now(),
            },
        )
        .await?;
    }

    tx.put(&payout)?;
    tx.emit(DomainFact::PayoutStatusChanged { payout_id: payout.id.clone(), from: previous, to: next });
    Ok(payout)
}

async fn append_balance_entry(
    tx: &mut LedgerTransaction,
    entry: &BalanceHistoryEntry,
) -> Result<(), ApplicationError> {
    let key = CompanyBalance::key_for(&entry.company_id);
    let mut balance = tx
        .get::<CompanyBalance>(&key)
        .await?
        .unwrap_or_else(|| CompanyBalance::empty(entry.company_id.clone()));
    balance.apply(entry);
    tx.put(entry)?;
    tx.put(&balance)
}

#[derive(Clone)]
pub struct EscrowService {
    ctx: LedgerContext,
}

impl EscrowService {
    pub fn new(ctx: LedgerContext) -> Self {
        Self { ctx }
    }

    /// Order-level payout for a completed order. Repeated calls return the live payout.
    pub async fn compute_payout(
        &self,
        order_id: &OrderId,
        correlation_id: &str,
    ) -> Result<PayoutResult, ApplicationError> {
        let order_id = order_id.clone();
        self.ctx
            .transact("payout.compute", correlation_id, move |tx| {
                let order_id = order_id.clone();
                Box::pin(async move {
                    let mut order: Order = tx.require(&Order::key_for(&order_id), "order").await?;
                    if order.status != OrderStatus::Abgeschlossen {
                        return Err(DomainError::invalid_transition(
                            "order",
                            &order.id,
                            order.status.as_str(),
                            "be paid out",
                        )
                        .into());
                    }
                    let result = compute_payout(tx, &mut order, PayoutBatch::Order).await?;
                    if matches!(result, PayoutResult::Created { .. }) {
                        tx.put(&order)?;
                    }
                    Ok(result)
                })
            })
            .await
    }

    pub async fn update_payout_status(
        &self,
        actor: &Actor,
        payout_id: &PayoutId,
        next: PayoutStatus,
        failure_reason: Option<String>,
        correlation_id: &str,
    ) -> Result<Payout, ApplicationError> {
        if !actor.is_operator() {
            return Err(ApplicationError::forbidden(actor, "change payout status"));
        }
        let payout_id = payout_id.clone();
        let payout = self
            .ctx
            .transact("payout.update_status", correlation_id, move |tx| {
                let payout_id = payout_id.clone();
                let failure_reason = failure_reason.clone();
                Box::pin(async move { update_payout_status(tx, &payout_id, next, failure_reason).await })
            })
            .await?;

        info!(
            event_name = "ledger.payout.status_changed",
            correlation_id,
            payout_id = %payout.id,
            status = payout.status.as_str(),
            "payout status changed"
        );
        Ok(payout)
    }

    pub async fn get_payout(&self, payout_id: &PayoutId) -> Result<Payout, ApplicationError> {
        store::load(self.ctx.store().as_ref(), &Payout::key_for(payout_id))
            .await?
            .ok_or_else(|| ApplicationError::not_found("payout", payout_id))
    }

    /// Counter, derived sum and entries for one company. The two reads are not one
    /// snapshot, so a concurrent append can show up as a transient mismatch.
    pub async fn company_balance(
        &self,
        company_id: &CompanyId,
    ) -> Result<CompanyBalanceView, ApplicationError> {
        let store = self.ctx.store().as_ref();
        let balance: Option<CompanyBalance> =
            store::load(store, &CompanyBalance::key_for(company_id)).await?;
        let mut entries: Vec<BalanceHistoryEntry> =
            store::load_all(store, &balance_history_collection(company_id)).await?;
        entries.sort_by(|left, right| left.created_at.cmp(&right.created_at));

        let balance = balance.unwrap_or_else(|| CompanyBalance::empty(company_id.clone()));
        Ok(CompanyBalanceView {
            company_id: company_id.clone(),
            held_cents: balance.held_cents,
            derived_cents: entries.iter().map(|entry| entry.amount_cents).sum(),
            entry_count: balance.entry_count,
            entries,
        })
    }

    /// Balance views of every company whose counter disagrees with its history.
    pub async fn inconsistent_balances(&self) -> Result<Vec<CompanyBalanceView>, ApplicationError> {
        let counters: Vec<CompanyBalance> =
            store::load_all(self.ctx.store().as_ref(), COMPANIES).await?;
        let mut mismatched = Vec::new();
        for counter in counters {
            let view = self.company_balance(&counter.company_id).await?;
            if !view.is_consistent() {
                mismatched.push(view);
            }
        }
        Ok(mismatched)
    }
}
