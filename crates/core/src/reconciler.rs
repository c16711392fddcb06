//! Payment event reconciler.
//!
//! Every processor event is keyed by its event id. The dedup marker in
//! `processed_events` commits in the same transaction as the ledger effects, so a
//! redelivered event either finds the marker and returns the recorded outcome or races
//! the first delivery and loses with `Conflict` before retrying into the marker.
//!
//! Events that cannot be applied are parked with their payload instead of failing the
//! webhook; operators replay or dismiss them later.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::context::LedgerContext;
use crate::domain::approval::{ApprovalSettlement, ApprovalStatus};
use crate::domain::order::{CaptureKind, Order, OrderStatus};
use crate::domain::payment::{
    AdditionalHoursPayment, EventDisposition, EventId, InitialPayment, IntentTarget, ParkReason,
    PaymentEvent, PaymentEventKind, PaymentIntentId, PaymentIntentLink, PaymentMetadata,
    ProcessedEvent,
    ProcessedEventStatus, ReconcileOutcome, SettlementTarget, PROCESSED_EVENTS,
};
use crate::domain::payout::PayoutBatch;
use crate::domain::quote::Quote;
use crate::domain::Actor;
use crate::errors::{ApplicationError, DomainError};
use crate::escrow::{self, CaptureInput};
use crate::facts::DomainFact;
use crate::orders::{self, OrderCreation};
use crate::processor::PaymentProcessor;
use crate::store::{self, LedgerTransaction};
use crate::time_tracking;

pub const DEFAULT_PROCESSOR_TIMEOUT: Duration = Duration::from_millis(2_000);

/// How an event is handled, decided before the transaction starts.
#[derive(Clone, Debug, PartialEq)]
enum Route {
    Apply(PaymentMetadata),
    Ignore,
    Park(ParkReason),
}

#[derive(Clone)]
pub struct PaymentReconciler {
    ctx: LedgerContext,
    processor: Arc<dyn PaymentProcessor>,
    processor_timeout: Duration,
}

impl PaymentReconciler {
    pub fn new(ctx: LedgerContext, processor: Arc<dyn PaymentProcessor>) -> Self {
        Self { ctx, processor, processor_timeout: DEFAULT_PROCESSOR_TIMEOUT }
    }

    pub fn with_processor_timeout(mut self, timeout: Duration) -> Self {
        self.processor_timeout = timeout;
        self
    }

    /// Single entry point for verified webhook deliveries.
    pub async fn handle_payment_event(
        &self,
        event: PaymentEvent,
        correlation_id: &str,
    ) -> Result<EventDisposition, ApplicationError> {
        let key = ProcessedEvent::key_for(&event.event_id);
        if let Some(record) =
            store::load::<ProcessedEvent>(self.ctx.store().as_ref(), &key).await?
        {
            info!(
                event_name = "ledger.payment_event.duplicate",
                correlation_id,
                event_id = %event.event_id,
                status = record.status.as_str(),
                "payment event already handled"
            );
            return Ok(EventDisposition::duplicate_of(&record));
        }
        self.reconcile(event, false, correlation_id).await
    }

    /// Re-runs a parked event from its stored payload.
    pub async fn replay_parked(
        &self,
        actor: &Actor,
        event_id: &EventId,
        correlation_id: &str,
    ) -> Result<EventDisposition, ApplicationError> {
        if !actor.is_operator() {
            return Err(ApplicationError::forbidden(actor, "replay a parked payment event"));
        }
        let record = store::load::<ProcessedEvent>(
            self.ctx.store().as_ref(),
            &ProcessedEvent::key_for(event_id),
        )
        .await?
        .ok_or_else(|| ApplicationError::not_found("payment event", event_id))?;
        if record.status != ProcessedEventStatus::Parked {
            return Err(DomainError::invalid_transition(
                "payment event",
                event_id,
                record.status.as_str(),
                "be replayed",
            )
            .into());
        }
        let payload = match (record.payload, record.raw_payload) {
            (Some(payload), _) => payload,
            (None, Some(raw)) => serde_json::from_value::<PaymentEvent>(raw).map_err(|error| {
                DomainError::Validation(format!(
                    "parked event `{event_id}` is still malformed ({error}); dismiss it instead"
                ))
            })?,
            (None, None) => {
                return Err(DomainError::InvariantViolation(format!(
                    "parked event `{event_id}` has no payload"
                ))
                .into())
            }
        };

        info!(
            event_name = "ledger.payment_event.replay",
            correlation_id,
            event_id = %event_id,
            attempts = record.attempts,
            "replaying parked payment event"
        );
        self.reconcile(payload, true, correlation_id).await
    }

    /// Parks a verified delivery whose body does not decode into a [`PaymentEvent`]. The
    /// body is kept as raw JSON under its `eventId`, or under a digest of the bytes when
    /// no id can be read, so redeliveries land on the same marker.
    pub async fn park_malformed(
        &self,
        body: &[u8],
        decode_error: String,
        correlation_id: &str,
    ) -> Result<EventDisposition, ApplicationError> {
        let raw = serde_json::from_slice::<Value>(body)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned()));
        let event_id = raw
            .get("eventId")
            .and_then(Value::as_str)
            .filter(|id| !id.trim().is_empty())
            .map(|id| EventId::new(id.trim()))
            .unwrap_or_else(|| {
                EventId::new(format!("malformed_{}", hex::encode(Sha256::digest(body))))
            });
        let event_type =
            raw.get("type").and_then(Value::as_str).unwrap_or("unknown").to_string();
        let intent_id = raw
            .pointer("/object/id")
            .and_then(Value::as_str)
            .map(PaymentIntentId::new)
            .unwrap_or_else(|| PaymentIntentId::new("unknown"));

        let disposition = self
            .ctx
            .transact("payment_event.park_malformed", correlation_id, move |tx| {
                let event_id = event_id.clone();
                let event_type = event_type.clone();
                let intent_id = intent_id.clone();
                let raw = raw.clone();
                let reason =
                    ParkReason::Unroutable { detail: format!("malformed event: {decode_error}") };
                Box::pin(async move {
                    if let Some(record) =
                        tx.get::<ProcessedEvent>(&ProcessedEvent::key_for(&event_id)).await?
                    {
                        return Ok(EventDisposition::duplicate_of(&record));
                    }
                    let now = Utc::now();
                    let record = ProcessedEvent {
                        event_id,
                        event_type,
                        payment_intent_id: intent_id,
                        status: ProcessedEventStatus::Parked,
                        outcome: None,
                        park_reason: Some(reason.clone()),
                        payload: None,
                        raw_payload: Some(raw),
                        attempts: 1,
                        note: None,
                        first_seen_at: now,
                        updated_at: now,
                    };
                    tx.emit(DomainFact::PaymentEventParked {
                        event_id: record.event_id.clone(),
                        reason: reason.to_string(),
                    });
                    tx.put(&record)?;
                    Ok(record.disposition())
                })
            })
            .await?;

        warn!(
            event_name = "ledger.payment_event.parked",
            correlation_id,
            event_id = %disposition.event_id,
            reason = "malformed",
            status = ?disposition.status,
            "undecodable payment event parked"
        );
        Ok(disposition)
    }

    pub async fn dismiss_parked(
        &self,
        actor: &Actor,
        event_id: &EventId,
        note: String,
        correlation_id: &str,
    ) -> Result<ProcessedEvent, ApplicationError> {
        if !actor.is_operator() {
            return Err(ApplicationError::forbidden(actor, "dismiss a parked payment event"));
        }
        if note.trim().is_empty() {
            return Err(DomainError::Validation("a dismissal note is required".to_string()).into());
        }
        let event_id = event_id.clone();
        let record = self
            .ctx
            .transact("payment_event.dismiss", correlation_id, move |tx| {
                let event_id = event_id.clone();
                let note = note.trim().to_string();
                Box::pin(async move {
                    let mut record: ProcessedEvent =
                        tx.require(&ProcessedEvent::key_for(&event_id), "payment event").await?;
                    if !record.status.can_transition_to(ProcessedEventStatus::Dismissed) {
                        return Err(DomainError::invalid_transition(
                            "payment event",
                            &event_id,
                            record.status.as_str(),
                            "be dismissed",
                        )
                        .into());
                    }
                    record.status = ProcessedEventStatus::Dismissed;
                    record.note = Some(note);
                    record.updated_at = Utc::now();
                    tx.put(&record)?;
                    Ok(record)
                })
            })
            .await?;

        info!(
            event_name = "ledger.payment_event.dismissed",
            correlation_id,
            event_id = %record.event_id,
            "parked payment event dismissed"
        );
        Ok(record)
    }

    pub async fn list_parked(&self) -> Result<Vec<ProcessedEvent>, ApplicationError> {
        let records: Vec<ProcessedEvent> =
            store::load_all(self.ctx.store().as_ref(), PROCESSED_EVENTS).await?;
        Ok(records
            .into_iter()
            .filter(|record| record.status == ProcessedEventStatus::Parked)
            .collect())
    }

    async fn reconcile(
        &self,
        event: PaymentEvent,
        replay: bool,
        correlation_id: &str,
    ) -> Result<EventDisposition, ApplicationError> {
        let route = self.route(&event, correlation_id).await;
        let disposition = self
            .ctx
            .transact("payment_event.reconcile", correlation_id, move |tx| {
                let event = event.clone();
                let route = route.clone();
                Box::pin(async move {
                    let existing: Option<ProcessedEvent> =
                        tx.get(&ProcessedEvent::key_for(&event.event_id)).await?;
                    if let Some(record) = &existing {
                        if !(replay && record.status == ProcessedEventStatus::Parked) {
                            return Ok(EventDisposition::duplicate_of(record));
                        }
                    }

                    let (status, outcome, park_reason) = match route {
                        Route::Ignore => (
                            ProcessedEventStatus::Ignored,
                            Some(ReconcileOutcome::Ignored { event_type: event.event_type.clone() }),
                            None,
                        ),
                        Route::Park(reason) => (ProcessedEventStatus::Parked, None, Some(reason)),
                        Route::Apply(metadata) => match apply(tx, &event, &metadata).await {
                            Ok(outcome) => (ProcessedEventStatus::Processed, Some(outcome), None),
                            Err(error) => match park_reason_for(&error) {
                                Some(reason) => {
                                    tx.discard_changes();
                                    (ProcessedEventStatus::Parked, None, Some(reason))
                                }
                                None => return Err(error),
                            },
                        },
                    };

                    let record = record_for(existing, &event, status, outcome, park_reason)?;
                    if let Some(reason) = &record.park_reason {
                        tx.emit(DomainFact::PaymentEventParked {
                            event_id: record.event_id.clone(),
                            reason: reason.to_string(),
                        });
                    }
                    tx.put(&record)?;
                    Ok(record.disposition())
                })
            })
            .await?;

        match &disposition.park_reason {
            Some(reason) => warn!(
                event_name = "ledger.payment_event.parked",
                correlation_id,
                event_id = %disposition.event_id,
                reason = reason.as_str(),
                detail = %reason,
                "payment event parked"
            ),
            None => info!(
                event_name = "ledger.payment_event.reconciled",
                correlation_id,
                event_id = %disposition.event_id,
                status = ?disposition.status,
                "payment event reconciled"
            ),
        }
        Ok(disposition)
    }

    /// Classifies the event and resolves its metadata. When the webhook metadata does not
    /// parse, the processor's copy of the intent is consulted under a bounded timeout.
    async fn route(&self, event: &PaymentEvent, correlation_id: &str) -> Route {
        if event.kind() == PaymentEventKind::Other {
            return Route::Ignore;
        }
        let webhook_error = match PaymentMetadata::parse(&event.object.metadata) {
            Ok(metadata) => return Route::Apply(metadata),
            Err(error) => error,
        };

        warn!(
            event_name = "ledger.payment_event.ambiguous_metadata",
            correlation_id,
            event_id = %event.event_id,
            payment_intent_id = %event.intent_id(),
            error = %webhook_error,
            "webhook metadata unusable, asking the processor"
        );
        let lookup = self.processor.retrieve_intent(event.intent_id());
        match tokio::time::timeout(self.processor_timeout, lookup).await {
            Err(_) => Route::Park(ParkReason::ProcessorTimeout),
            Ok(Err(error)) => Route::Park(ParkReason::Unroutable {
                detail: format!("{webhook_error}; processor lookup failed: {error}"),
            }),
            Ok(Ok(intent)) => match PaymentMetadata::parse(&intent.metadata) {
                Ok(metadata) => {
                    info!(
                        event_name = "ledger.payment_event.metadata_resolved",
                        correlation_id,
                        event_id = %event.event_id,
                        payment_type = metadata.payment_type(),
                        "processor metadata routed the event"
                    );
                    Route::Apply(metadata)
                }
                Err(error) => Route::Park(ParkReason::Unroutable { detail: error.to_string() }),
            },
        }
    }
}

/// Errors that park an event rather than fail the delivery. Store and integration
/// failures propagate so the processor redelivers.
fn park_reason_for(error: &ApplicationError) -> Option<ParkReason> {
    match error {
        ApplicationError::AmountMismatch { expected_cents, captured_cents } => {
            Some(ParkReason::AmountMismatch {
                expected_cents: *expected_cents,
                captured_cents: *captured_cents,
            })
        }
        ApplicationError::Unroutable(detail) => Some(ParkReason::Unroutable { detail: detail.clone() }),
        ApplicationError::NotFound { .. } => Some(ParkReason::Unroutable { detail: error.to_string() }),
        ApplicationError::Domain(_) => Some(ParkReason::InvalidState { detail: error.to_string() }),
        _ => None,
    }
}

fn record_for(
    existing: Option<ProcessedEvent>,
    event: &PaymentEvent,
    status: ProcessedEventStatus,
    outcome: Option<ReconcileOutcome>,
    park_reason: Option<ParkReason>,
) -> Result<ProcessedEvent, ApplicationError> {
    let now = Utc::now();
    match existing {
        Some(mut record) => {
            if !record.status.can_transition_to(status) {
                return Err(DomainError::invalid_transition(
                    "payment event",
                    &record.event_id,
                    record.status.as_str(),
                    format!("become {}", status.as_str()),
                )
                .into());
            }
            record.status = status;
            record.outcome = outcome;
            record.park_reason = park_reason;
            record.attempts += 1;
            record.updated_at = now;
            Ok(record)
        }
        None => Ok(ProcessedEvent {
            event_id: event.event_id.clone(),
            event_type: event.event_type.clone(),
            payment_intent_id: event.intent_id().clone(),
            status,
            outcome,
            park_reason,
            payload: Some(event.clone()),
            raw_payload: None,
            attempts: 1,
            note: None,
            first_seen_at: now,
            updated_at: now,
        }),
    }
}

async fn apply(
    tx: &mut LedgerTransaction,
    event: &PaymentEvent,
    metadata: &PaymentMetadata,
) -> Result<ReconcileOutcome, ApplicationError> {
    match (event.kind(), metadata) {
        (PaymentEventKind::Capture, PaymentMetadata::B2bProject(initial))
        | (PaymentEventKind::Capture, PaymentMetadata::FixedPrice(initial)) => {
            apply_initial_capture(tx, event, metadata, initial).await
        }
        (PaymentEventKind::Capture, PaymentMetadata::AdditionalHoursPayment(hours)) => {
            apply_hours_capture(tx, event, metadata, hours).await
        }
        (PaymentEventKind::Failure, PaymentMetadata::B2bProject(initial))
        | (PaymentEventKind::Failure, PaymentMetadata::FixedPrice(initial)) => {
            apply_initial_failure(tx, event, initial).await
        }
        (PaymentEventKind::Failure, PaymentMetadata::AdditionalHoursPayment(_)) => {
            Ok(ReconcileOutcome::FailureNoted { payment_intent_id: event.intent_id().clone() })
        }
        (PaymentEventKind::Other, _) => {
            Ok(ReconcileOutcome::Ignored { event_type: event.event_type.clone() })
        }
    }
}

async fn apply_initial_capture(
    tx: &mut LedgerTransaction,
    event: &PaymentEvent,
    metadata: &PaymentMetadata,
    initial: &InitialPayment,
) -> Result<ReconcileOutcome, ApplicationError> {
    let mut quote: Quote = tx.require(&Quote::key_for(&initial.quote_id), "quote").await?;
    let proposal = quote
        .proposal(&initial.proposal_id)
        .ok_or_else(|| ApplicationError::not_found("proposal", &initial.proposal_id))?
        .clone();

    if !proposal.currency.matches(&event.object.currency) {
        return Err(DomainError::Validation(format!(
            "captured currency `{}` does not match proposal currency `{}`",
            event.object.currency, proposal.currency
        ))
        .into());
    }
    if event.object.amount != proposal.price_cents {
        return Err(ApplicationError::AmountMismatch {
            expected_cents: proposal.price_cents,
            captured_cents: event.object.amount,
        });
    }

    let intent_id = event.intent_id();
    let mut order = match orders::create_from_accepted_proposal(
        tx,
        &quote,
        &proposal.id,
        intent_id,
        &event.event_id,
    )
    .await?
    {
        OrderCreation::Existing(order_id) => {
            return Ok(ReconcileOutcome::OrderAlreadyExists { order_id })
        }
        OrderCreation::Created(order) => *order,
    };

    let rejected_proposal_ids = quote.settle_acceptance(&proposal.id, intent_id, &order.id)?;
    escrow::record_captured_payment(
        tx,
        &mut order,
        CaptureInput {
            payment_intent_id: intent_id.clone(),
            event_id: event.event_id.clone(),
            kind: CaptureKind::OrderPayment,
            amount_cents: event.object.amount,
            platform_fee_cents: event.platform_fee_cents(metadata),
            currency: proposal.currency.clone(),
        },
    )
    .await?;

    tx.put(&quote)?;
    tx.put(&order)?;
    tx.emit(DomainFact::ProposalAccepted {
        quote_id: quote.id.clone(),
        proposal_id: proposal.id.clone(),
        rejected_proposal_ids,
    });
    info!(
        event_name = "ledger.order.created",
        correlation_id = tx.correlation_id(),
        order_id = %order.id,
        quote_id = %quote.id,
        payment_intent_id = %intent_id,
        "order created from captured payment"
    );
    Ok(ReconcileOutcome::OrderCreated {
        order_id: order.id,
        quote_id: quote.id,
        proposal_id: proposal.id,
    })
}

async fn apply_hours_capture(
    tx: &mut LedgerTransaction,
    event: &PaymentEvent,
    metadata: &PaymentMetadata,
    hours: &AdditionalHoursPayment,
) -> Result<ReconcileOutcome, ApplicationError> {
    let intent_id = event.intent_id();
    if let Some(link) = tx.get::<PaymentIntentLink>(&PaymentIntentLink::key_for(intent_id)).await? {
        return match link.target {
            IntentTarget::ApprovalRequest { order_id, approval_request_id } => {
                Ok(ReconcileOutcome::AlreadySettled { order_id, approval_request_id })
            }
            IntentTarget::Order { order_id, .. } => Err(DomainError::InvariantViolation(format!(
                "payment intent `{intent_id}` already created order `{order_id}`"
            ))
            .into()),
        };
    }

    let mut order: Order = tx.require(&Order::key_for(&hours.order_id), "order").await?;
    if order.status == OrderStatus::Cancelled {
        return Err(DomainError::invalid_transition(
            "order",
            &order.id,
            order.status.as_str(),
            "settle additional hours",
        )
        .into());
    }
    if !order.currency.matches(&event.object.currency) {
        return Err(DomainError::Validation(format!(
            "captured currency `{}` does not match order currency `{}`",
            event.object.currency, order.currency
        ))
        .into());
    }

    let request = match &hours.target {
        SettlementTarget::ApprovalRequest { approval_request_id } => order
            .time_tracking
            .approval_request(approval_request_id)
            .ok_or_else(|| ApplicationError::not_found("approval request", approval_request_id))?,
        SettlementTarget::Entries { entry_ids } => {
            order.time_tracking.approval_request_for_entries(entry_ids)?
        }
    };
    if !matches!(request.status, ApprovalStatus::Approved | ApprovalStatus::PartiallyApproved) {
        return Err(DomainError::invalid_transition(
            "approval request",
            &request.id,
            request.status.as_str(),
            "be settled",
        )
        .into());
    }
    if let Some(settlement) = &request.settlement {
        return Err(DomainError::invalid_transition(
            "approval request",
            &request.id,
            format!("{} by intent `{}`", request.status.as_str(), settlement.payment_intent_id),
            format!("settle payment intent `{intent_id}`"),
        )
        .into());
    }

    let request_id = request.id.clone();
    let expected_cents: i64 = order
        .time_tracking
        .approved_entries(request)
        .iter()
        .map(|entry| entry.billable_amount_cents)
        .sum();
    if expected_cents != event.object.amount {
        return Err(ApplicationError::AmountMismatch {
            expected_cents,
            captured_cents: event.object.amount,
        });
    }

    let platform_fee_cents = event.platform_fee_cents(metadata);
    let billed_entry_ids = time_tracking::bill_approved_entries(tx, &mut order, &request_id, intent_id)?;
    order.time_tracking.approval_request_mut(&request_id)?.settlement = Some(ApprovalSettlement {
        payment_intent_id: intent_id.clone(),
        event_id: event.event_id.clone(),
        captured_cents: event.object.amount,
        platform_fee_cents,
        settled_at: Utc::now(),
    });
    let currency = order.currency.clone();
    escrow::record_captured_payment(
        tx,
        &mut order,
        CaptureInput {
            payment_intent_id: intent_id.clone(),
            event_id: event.event_id.clone(),
            kind: CaptureKind::AdditionalHours { approval_request_id: request_id.clone() },
            amount_cents: event.object.amount,
            platform_fee_cents,
            currency,
        },
    )
    .await?;

    tx.put(&PaymentIntentLink {
        payment_intent_id: intent_id.clone(),
        target: IntentTarget::ApprovalRequest {
            order_id: order.id.clone(),
            approval_request_id: request_id.clone(),
        },
        event_id: event.event_id.clone(),
        created_at: Utc::now(),
    })?;

    // Hours paid after sign-off are paid out on their own.
    let payout_id = if order.status == OrderStatus::Abgeschlossen {
        let batch = PayoutBatch::ApprovalRequest { approval_request_id: request_id.clone() };
        escrow::compute_payout(tx, &mut order, batch)
            .await?
            .payout()
            .map(|payout| payout.id.clone())
    } else {
        None
    };
    tx.put(&order)?;

    Ok(ReconcileOutcome::HoursSettled {
        order_id: order.id,
        approval_request_id: request_id,
        billed_entry_ids,
        captured_cents: event.object.amount,
        payout_id,
    })
}

/// A failed or cancelled initial payment returns the reserved proposal to `pending`.
async fn apply_initial_failure(
    tx: &mut LedgerTransaction,
    event: &PaymentEvent,
    initial: &InitialPayment,
) -> Result<ReconcileOutcome, ApplicationError> {
    let mut quote: Quote = tx.require(&Quote::key_for(&initial.quote_id), "quote").await?;
    let intent_id = event.intent_id();
    let reserved = quote.payment_pending_proposal().is_some_and(|proposal| {
        proposal.id == initial.proposal_id
            && proposal.payment_intent_id.as_ref().map_or(true, |reserved| reserved == intent_id)
    });
    if !reserved {
        return Ok(ReconcileOutcome::FailureNoted { payment_intent_id: intent_id.clone() });
    }

    quote.release_payment(&initial.proposal_id)?;
    tx.put(&quote)?;
    Ok(ReconcileOutcome::PaymentReleased {
        quote_id: quote.id,
        proposal_id: initial.proposal_id.clone(),
    })
}
