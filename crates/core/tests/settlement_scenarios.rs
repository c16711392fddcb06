use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde_json::Value;
use taskledger_core::context::LedgerContext;
use taskledger_core::domain::approval::{ApprovalDecision, ApprovalRequest, ApprovalStatus};
use taskledger_core::domain::balance::{ledger_audit_collection, BalanceEntryKind, LedgerAuditEntry};
use taskledger_core::domain::order::{CompletionReview, Order, OrderId, OrderStatus, ORDERS};
use taskledger_core::domain::payment::{
    DispositionStatus, EventDisposition, EventId, ParkReason, PaymentEvent, PaymentIntentId,
    PaymentObject, ProcessedEventStatus, ReconcileOutcome,
};
use taskledger_core::domain::payout::PayoutStatus;
use taskledger_core::domain::quote::{ProposalId, ProposalStatus, Quote, QuoteId, QuoteStatus, Visibility};
use taskledger_core::domain::time_entry::{NewTimeEntry, TimeEntryCategory, TimeEntryId, TimeEntryStatus};
use taskledger_core::domain::{Actor, CompanyId};
use taskledger_core::errors::{ApplicationError, DomainError};
use taskledger_core::escrow::{EscrowService, PayoutResult};
use taskledger_core::facts::InMemoryFactSink;
use taskledger_core::orders::{OrderListQuery, OrderService};
use taskledger_core::processor::{
    DisabledPaymentProcessor, PaymentProcessor, ProcessorIntent, StaticPaymentProcessor,
};
use taskledger_core::quotes::{ProposalDraft, QuoteDraft, QuoteService};
use taskledger_core::reconciler::PaymentReconciler;
use taskledger_core::retry::RetryPolicy;
use taskledger_core::store::{self, InMemoryLedgerStore};
use taskledger_core::time_tracking::TimeTrackingService;

const CUSTOMER: &str = "cus-1";
const PROVIDER: &str = "cmp-1";
const RIVAL: &str = "cmp-2";
const RATE_CENTS: i64 = 2_500;

#[tokio::test]
async fn scenario_one_capture_delivered_twice_creates_one_order() {
    let ledger = Ledger::new();
    let quote = ledger.open_quote(&[(PROVIDER, 40_000), (RIVAL, 35_000)]).await;
    let winner = quote.proposals[0].id.clone();
    let loser = quote.proposals[1].id.clone();
    ledger.reserve(&quote.id, &winner, "pi_1").await;

    let event = capture("evt_1", "pi_1", 40_000, initial_metadata(&quote.id, &winner, 4_000));
    let first = ledger.deliver(event.clone()).await;
    assert_eq!(first.status, DispositionStatus::Processed);
    let Some(ReconcileOutcome::OrderCreated { order_id, proposal_id, .. }) = first.outcome.clone() else {
        panic!("expected order creation, got {first:?}");
    };
    assert_eq!(proposal_id, winner);

    let documents_before = ledger.store.len().await;
    let second = ledger.deliver(event).await;
    assert_eq!(second.status, DispositionStatus::Duplicate);
    assert_eq!(second.outcome, first.outcome);
    assert_eq!(ledger.store.len().await, documents_before, "duplicate delivery must not write");

    let quote = ledger.quote(&quote.id).await;
    assert_eq!(quote.status, QuoteStatus::Accepted);
    assert_eq!(quote.proposal(&winner).map(|p| p.status), Some(ProposalStatus::Accepted));
    assert_eq!(quote.proposal(&loser).map(|p| p.status), Some(ProposalStatus::Rejected));
    assert_eq!(quote.order_id.as_ref(), Some(&order_id));

    let order = ledger.order(&order_id).await;
    assert_eq!(order.status, OrderStatus::Aktiv);
    assert_eq!(order.payment_intent_id.as_str(), "pi_1");
    assert_eq!(ledger.orders().await.len(), 1);
    assert!(ledger.sink.names().contains(&"proposal.accepted"));
    assert!(ledger.sink.names().contains(&"order.created"));
}

#[tokio::test]
async fn scenario_two_approved_hours_are_billed_and_paid_out() {
    let ledger = Ledger::new();
    let order = ledger.paid_order(40_000, 4_000).await;
    let request = ledger.approved_request(&order.id, &[2, 1]).await;
    assert_eq!(request.total_amount_cents, 7_500);

    let disposition = ledger
        .deliver(capture("evt_h1", "pi_h1", 7_500, hours_metadata(&order.id, &request, 750)))
        .await;
    let Some(ReconcileOutcome::HoursSettled { billed_entry_ids, payout_id, .. }) = disposition.outcome
    else {
        panic!("expected settlement, got {disposition:?}");
    };
    assert_eq!(billed_entry_ids.len(), 2);
    assert_eq!(payout_id, None);

    let settled = ledger.order(&order.id).await;
    for entry_id in &request.entry_ids {
        let entry = settled.time_tracking.entry(entry_id).expect("entry");
        assert_eq!(entry.status, TimeEntryStatus::Billed);
        assert_eq!(entry.payment_intent_id.as_ref().map(|id| id.as_str()), Some("pi_h1"));
        assert!(entry.billed_at.is_some());
    }
    let totals = settled.time_tracking.totals();
    assert_eq!(totals.billed_amount_cents, 7_500);

    let balance = ledger.balance().await;
    let hours_entries: Vec<_> = balance
        .entries
        .iter()
        .filter(|entry| entry.kind == BalanceEntryKind::AdditionalHoursPayment)
        .collect();
    assert_eq!(hours_entries.len(), 1);
    assert_eq!(hours_entries[0].amount_cents, 7_500);

    ledger.complete(&order.id).await;
    let payouts = ledger.orders_service().order_payouts(&customer(), &order.id).await.expect("payouts");
    assert_eq!(payouts.len(), 1);
    let payout = &payouts[0];
    assert_eq!(payout.captured_cents, 47_500);
    assert_eq!(payout.commission_cents, 4_750);
    assert_eq!(payout.amount_cents + payout.commission_cents, payout.captured_cents);

    let balance = ledger.balance().await;
    assert!(balance.is_consistent());
    assert_eq!(balance.held_cents, 0);
}

#[tokio::test]
async fn scenario_three_short_capture_is_parked_without_billing() {
    let ledger = Ledger::new();
    let order = ledger.paid_order(40_000, 0).await;
    let request = ledger.approved_request(&order.id, &[2, 1]).await;
    let entries_before = ledger.balance().await.entries.len();

    let disposition = ledger
        .deliver(capture("evt_short", "pi_short", 5_000, hours_metadata(&order.id, &request, 0)))
        .await;
    assert_eq!(disposition.status, DispositionStatus::Parked);
    assert_eq!(
        disposition.park_reason,
        Some(ParkReason::AmountMismatch { expected_cents: 7_500, captured_cents: 5_000 })
    );

    let order = ledger.order(&order.id).await;
    for entry_id in &request.entry_ids {
        let status = order.time_tracking.entry(entry_id).map(|entry| entry.status);
        assert_eq!(status, Some(TimeEntryStatus::CustomerApproved));
    }
    assert!(order.capture_for_intent(&PaymentIntentId::new("pi_short")).is_none());
    assert_eq!(ledger.balance().await.entries.len(), entries_before);
    assert!(ledger.sink.names().contains(&"paymentEvent.parked"));

    let parked = ledger.reconciler.list_parked().await.expect("parked");
    assert_eq!(parked.len(), 1);
    assert!(parked[0].payload.is_some(), "parked events keep their payload");
}

#[tokio::test]
async fn dual_delivery_of_one_intent_settles_once() {
    let ledger = Ledger::new();
    let quote = ledger.open_quote(&[(PROVIDER, 40_000)]).await;
    let proposal_id = quote.proposals[0].id.clone();
    let metadata = initial_metadata(&quote.id, &proposal_id, 0);

    ledger.deliver(capture("evt_a", "pi_dual", 40_000, metadata.clone())).await;
    let mut charge = capture("evt_b", "pi_dual", 40_000, metadata);
    charge.event_type = "charge.succeeded".to_string();
    let second = ledger.deliver(charge).await;

    assert_eq!(second.status, DispositionStatus::Processed);
    assert!(matches!(second.outcome, Some(ReconcileOutcome::OrderAlreadyExists { .. })));
    assert_eq!(ledger.orders().await.len(), 1);
    assert_eq!(ledger.balance().await.entries.len(), 1);
}

#[tokio::test]
async fn hours_settlement_is_idempotent_across_redelivery() {
    let ledger = Ledger::new();
    let order = ledger.paid_order(40_000, 0).await;
    let request = ledger.approved_request(&order.id, &[2]).await;
    let event = capture("evt_h", "pi_h", 5_000, hours_metadata(&order.id, &request, 0));

    let first = ledger.deliver(event.clone()).await;
    let again = ledger.deliver(event).await;
    assert_eq!(again.status, DispositionStatus::Duplicate);
    assert_eq!(again.outcome, first.outcome);

    let charge = PaymentEvent {
        event_id: EventId::new("evt_h_charge"),
        event_type: "charge.succeeded".to_string(),
        ..capture("evt_h", "pi_h", 5_000, hours_metadata(&order.id, &request, 0))
    };
    let dual = ledger.deliver(charge).await;
    assert!(matches!(dual.outcome, Some(ReconcileOutcome::AlreadySettled { .. })));

    let billed = ledger.sink.names().iter().filter(|name| **name == "timeEntry.billed").count();
    assert_eq!(billed, 1);
    let hours_entries = ledger
        .balance()
        .await
        .entries
        .iter()
        .filter(|entry| entry.kind == BalanceEntryKind::AdditionalHoursPayment)
        .count();
    assert_eq!(hours_entries, 1);
}

#[tokio::test]
async fn settlement_by_entry_list_finds_the_request() {
    let ledger = Ledger::new();
    let order = ledger.paid_order(40_000, 0).await;
    let request = ledger.approved_request(&order.id, &[1, 1]).await;

    let list = request.entry_ids.iter().map(|id| id.as_str()).collect::<Vec<_>>().join(",");
    let mut metadata = meta(&[("type", "additional_hours_platform_hold"), ("orderId", order.id.as_str())]);
    metadata.insert("entryIds".to_string(), Value::String(list));

    let disposition = ledger.deliver(capture("evt_list", "pi_list", 5_000, metadata)).await;
    assert!(matches!(
        disposition.outcome,
        Some(ReconcileOutcome::HoursSettled { ref approval_request_id, .. }) if approval_request_id == &request.id
    ));
}

#[tokio::test]
async fn partial_approval_bills_only_approved_entries() {
    let ledger = Ledger::new();
    let order = ledger.paid_order(40_000, 0).await;
    let request = ledger.submitted_request(&order.id, &[2, 1]).await;
    let approved = request.entry_ids[0].clone();

    let responded = ledger
        .time
        .customer_respond(
            &customer(),
            &order.id,
            &request.id,
            ApprovalDecision::PerEntry { approved_entry_ids: vec![approved.clone()] },
            Some("the second hour was not agreed".to_string()),
            "req",
        )
        .await
        .expect("respond");
    assert_eq!(responded.status, ApprovalStatus::PartiallyApproved);

    let disposition = ledger
        .deliver(capture("evt_part", "pi_part", 5_000, hours_metadata(&order.id, &request, 0)))
        .await;
    assert_eq!(disposition.status, DispositionStatus::Processed);

    let order = ledger.order(&order.id).await;
    assert_eq!(order.time_tracking.entry(&approved).map(|e| e.status), Some(TimeEntryStatus::Billed));
    assert_eq!(
        order.time_tracking.entry(&request.entry_ids[1]).map(|e| e.status),
        Some(TimeEntryStatus::CustomerRejected)
    );
}

#[tokio::test]
async fn second_response_to_an_answered_request_is_an_invalid_transition() {
    let ledger = Ledger::new();
    let order = ledger.paid_order(40_000, 0).await;
    let request = ledger.approved_request(&order.id, &[1]).await;

    let error = ledger
        .time
        .customer_respond(&customer(), &order.id, &request.id, ApprovalDecision::RejectAll, None, "req")
        .await
        .expect_err("already answered");
    assert!(matches!(
        error,
        ApplicationError::Domain(DomainError::InvalidTransition { ref current, .. }) if current == "approved"
    ));
}

#[tokio::test]
async fn original_hours_cannot_be_submitted_for_approval() {
    let ledger = Ledger::new();
    let order = ledger.paid_order(40_000, 0).await;
    let entry = ledger.log(&order.id, 3, TimeEntryCategory::Original).await;
    assert_eq!(entry.billable_amount_cents, 0);

    let error = ledger
        .time
        .submit_for_approval(&provider(), &order.id, vec![entry.id], None, "req")
        .await
        .expect_err("original entry");
    assert!(matches!(error, ApplicationError::Domain(DomainError::InvalidTransition { .. })));
}

#[tokio::test]
async fn recategorizing_a_logged_entry_leaves_an_audit_trail() {
    let ledger = Ledger::new();
    let order = ledger.paid_order(40_000, 0).await;
    let entry = ledger.log(&order.id, 2, TimeEntryCategory::Additional).await;
    assert_eq!(entry.billable_amount_cents, 5_000);

    let moved = ledger
        .time
        .recategorize_entry(
            &provider(),
            &order.id,
            &entry.id,
            TimeEntryCategory::Original,
            "covered by the quoted scope".to_string(),
            "req",
        )
        .await
        .expect("recategorize");
    assert_eq!(moved.billable_amount_cents, 0);

    let audit: Vec<LedgerAuditEntry> =
        store::load_all(ledger.store.as_ref(), &ledger_audit_collection(&CompanyId::new(PROVIDER)))
            .await
            .expect("audit");
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].previous_amount_cents, 5_000);
    assert_eq!(audit[0].new_category, TimeEntryCategory::Original);

    let submitted = ledger.log(&order.id, 1, TimeEntryCategory::Additional).await;
    ledger
        .time
        .submit_for_approval(&provider(), &order.id, vec![submitted.id.clone()], None, "req")
        .await
        .expect("submit");
    let error = ledger
        .time
        .recategorize_entry(
            &provider(),
            &order.id,
            &submitted.id,
            TimeEntryCategory::Additional,
            "still extra".to_string(),
            "req",
        )
        .await
        .expect_err("submitted entries only move to original");
    assert!(matches!(error, ApplicationError::Domain(DomainError::InvalidTransition { .. })));
}

#[tokio::test]
async fn submitted_entry_moved_to_original_leaves_its_pending_request() {
    let ledger = Ledger::new();
    let order = ledger.paid_order(40_000, 0).await;
    let request = ledger.submitted_request(&order.id, &[1, 2]).await;
    assert_eq!(request.total_amount_cents, 7_500);
    let mistagged = request.entry_ids[0].clone();

    let moved = ledger
        .time
        .recategorize_entry(
            &provider(),
            &order.id,
            &mistagged,
            TimeEntryCategory::Original,
            "part of the quoted scope".to_string(),
            "req",
        )
        .await
        .expect("recategorize submitted entry");
    assert_eq!(moved.status, TimeEntryStatus::Logged);
    assert_eq!(moved.billable_amount_cents, 0);
    assert_eq!(moved.approval_request_id, None);

    let reloaded = ledger.order(&order.id).await;
    let remaining = reloaded.time_tracking.approval_request(&request.id).expect("request kept");
    assert_eq!(remaining.entry_ids, vec![request.entry_ids[1].clone()]);
    assert_eq!(remaining.total_amount_cents, 5_000);
    assert_eq!(remaining.total_hours, Decimal::new(2, 0));

    let last = request.entry_ids[1].clone();
    ledger
        .time
        .recategorize_entry(
            &provider(),
            &order.id,
            &last,
            TimeEntryCategory::Original,
            "also quoted".to_string(),
            "req",
        )
        .await
        .expect("recategorize last entry");
    let reloaded = ledger.order(&order.id).await;
    assert!(reloaded.time_tracking.approval_request(&request.id).is_none());

    let approved = ledger.approved_request(&order.id, &[1]).await;
    let error = ledger
        .time
        .recategorize_entry(
            &provider(),
            &order.id,
            &approved.entry_ids[0],
            TimeEntryCategory::Original,
            "after approval".to_string(),
            "req",
        )
        .await
        .expect_err("approved entries stay put");
    assert!(matches!(error, ApplicationError::Domain(DomainError::InvalidTransition { .. })));
}

#[tokio::test]
async fn payment_failure_returns_the_proposal_to_pending() {
    let ledger = Ledger::new();
    let quote = ledger.open_quote(&[(PROVIDER, 40_000), (RIVAL, 35_000)]).await;
    let first = quote.proposals[0].id.clone();
    let second = quote.proposals[1].id.clone();
    ledger.reserve(&quote.id, &first, "pi_fail").await;

    let mut failed = capture("evt_fail", "pi_fail", 40_000, initial_metadata(&quote.id, &first, 0));
    failed.event_type = "payment_intent.payment_failed".to_string();
    let disposition = ledger.deliver(failed).await;
    assert!(matches!(disposition.outcome, Some(ReconcileOutcome::PaymentReleased { .. })));

    let reloaded = ledger.quote(&quote.id).await;
    assert_eq!(reloaded.status, QuoteStatus::Responded);
    assert_eq!(reloaded.proposal(&first).map(|p| p.status), Some(ProposalStatus::Pending));

    ledger.reserve(&quote.id, &second, "pi_second").await;
    let reloaded = ledger.quote(&quote.id).await;
    assert_eq!(reloaded.proposal(&second).map(|p| p.status), Some(ProposalStatus::PaymentPending));
}

#[tokio::test]
async fn ambiguous_metadata_is_resolved_through_the_processor() {
    let ledger = Ledger::new();
    let quote = ledger.open_quote(&[(PROVIDER, 40_000)]).await;
    let proposal_id = quote.proposals[0].id.clone();
    let processor = StaticPaymentProcessor::default().with_intent(ProcessorIntent {
        id: PaymentIntentId::new("pi_amb"),
        amount: 40_000,
        currency: "eur".to_string(),
        status: Some("succeeded".to_string()),
        metadata: initial_metadata(&quote.id, &proposal_id, 0),
    });
    let reconciler = ledger.reconciler_with(Arc::new(processor), Duration::from_secs(1));

    let disposition = reconciler
        .handle_payment_event(capture("evt_amb", "pi_amb", 40_000, BTreeMap::new()), "req")
        .await
        .expect("reconcile");
    assert!(matches!(disposition.outcome, Some(ReconcileOutcome::OrderCreated { .. })));
}

#[tokio::test]
async fn slow_processor_parks_the_event_as_timeout() {
    let ledger = Ledger::new();
    let processor = StaticPaymentProcessor::default().with_latency(Duration::from_millis(500));
    let reconciler = ledger.reconciler_with(Arc::new(processor), Duration::from_millis(20));

    let disposition = reconciler
        .handle_payment_event(capture("evt_slow", "pi_slow", 1_000, BTreeMap::new()), "req")
        .await
        .expect("reconcile");
    assert_eq!(disposition.status, DispositionStatus::Parked);
    assert_eq!(disposition.park_reason, Some(ParkReason::ProcessorTimeout));
    assert!(ledger.orders().await.is_empty());
}

#[tokio::test]
async fn unroutable_events_are_parked_then_replayed_or_dismissed() {
    let ledger = Ledger::new();
    let quote = ledger.open_quote(&[(PROVIDER, 40_000)]).await;
    let proposal_id = quote.proposals[0].id.clone();

    let mut metadata = initial_metadata(&quote.id, &proposal_id, 0);
    metadata.insert("quoteId".to_string(), Value::String("quo_missing".to_string()));
    let parked = ledger.deliver(capture("evt_lost", "pi_lost", 40_000, metadata)).await;
    assert!(matches!(parked.park_reason, Some(ParkReason::Unroutable { .. })));

    let error = ledger
        .reconciler
        .replay_parked(&customer(), &EventId::new("evt_lost"), "req")
        .await
        .expect_err("customers cannot replay");
    assert!(matches!(error, ApplicationError::Forbidden { .. }));

    let replayed = ledger
        .reconciler
        .replay_parked(&operator(), &EventId::new("evt_lost"), "req")
        .await
        .expect("replay");
    assert_eq!(replayed.status, DispositionStatus::Parked);
    let records = ledger.reconciler.list_parked().await.expect("parked");
    assert_eq!(records[0].attempts, 2);

    let dismissed = ledger
        .reconciler
        .dismiss_parked(&operator(), &EventId::new("evt_lost"), "refunded manually".to_string(), "req")
        .await
        .expect("dismiss");
    assert_eq!(dismissed.status, ProcessedEventStatus::Dismissed);
    assert!(ledger.reconciler.list_parked().await.expect("parked").is_empty());

    let error = ledger
        .reconciler
        .replay_parked(&operator(), &EventId::new("evt_lost"), "req")
        .await
        .expect_err("dismissed events stay closed");
    assert!(matches!(error, ApplicationError::Domain(DomainError::InvalidTransition { .. })));
}

#[tokio::test]
async fn undecodable_event_is_parked_with_its_raw_body() {
    let ledger = Ledger::new();
    let body = br#"{"eventId":"evt_bad","type":"payment_intent.succeeded","object":{"id":"pi_bad","amount":"7500"}}"#;

    let parked = ledger
        .reconciler
        .park_malformed(body, "invalid type: string \"7500\"".to_string(), "req")
        .await
        .expect("park");
    assert_eq!(parked.event_id, EventId::new("evt_bad"));
    assert_eq!(parked.status, DispositionStatus::Parked);
    assert!(matches!(parked.park_reason, Some(ParkReason::Unroutable { .. })));

    let again = ledger
        .reconciler
        .park_malformed(body, "invalid type".to_string(), "req")
        .await
        .expect("redelivery");
    assert_eq!(again.status, DispositionStatus::Duplicate);

    let records = ledger.reconciler.list_parked().await.expect("parked");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].payment_intent_id, PaymentIntentId::new("pi_bad"));
    assert!(records[0].payload.is_none());
    let raw = records[0].raw_payload.as_ref().expect("raw body kept");
    assert_eq!(raw["object"]["amount"], Value::String("7500".to_string()));

    let error = ledger
        .reconciler
        .replay_parked(&operator(), &EventId::new("evt_bad"), "req")
        .await
        .expect_err("still undecodable");
    assert!(matches!(error, ApplicationError::Domain(DomainError::Validation(_))));

    ledger
        .reconciler
        .dismiss_parked(&operator(), &EventId::new("evt_bad"), "processor bug".to_string(), "req")
        .await
        .expect("dismiss");
    assert!(ledger.reconciler.list_parked().await.expect("parked").is_empty());
    assert!(ledger.orders().await.is_empty());
}

#[tokio::test]
async fn body_without_event_id_is_keyed_by_its_digest() {
    let ledger = Ledger::new();
    let first = ledger
        .reconciler
        .park_malformed(b"not json at all", "expected value".to_string(), "req")
        .await
        .expect("park");
    assert!(first.event_id.as_str().starts_with("malformed_"));

    let again = ledger
        .reconciler
        .park_malformed(b"not json at all", "expected value".to_string(), "req")
        .await
        .expect("park again");
    assert_eq!(again.event_id, first.event_id);
    assert_eq!(again.status, DispositionStatus::Duplicate);

    let other = ledger
        .reconciler
        .park_malformed(b"{\"hello\":1}", "missing field".to_string(), "req")
        .await
        .expect("park other");
    assert_ne!(other.event_id, first.event_id);
    assert_eq!(ledger.reconciler.list_parked().await.expect("parked").len(), 2);
}

#[tokio::test]
async fn unrelated_event_types_are_recorded_as_ignored() {
    let ledger = Ledger::new();
    let mut event = capture("evt_misc", "pi_misc", 100, BTreeMap::new());
    event.event_type = "customer.updated".to_string();

    let disposition = ledger.deliver(event.clone()).await;
    assert_eq!(disposition.status, DispositionStatus::Ignored);
    assert_eq!(ledger.deliver(event).await.status, DispositionStatus::Duplicate);
}

#[tokio::test]
async fn payout_is_created_once_and_conserves_money() {
    let ledger = Ledger::new();
    let order = ledger.paid_order(40_000, 6_000).await;
    let first = ledger.complete(&order.id).await;
    let PayoutResult::Created { payout } = first else {
        panic!("expected a new payout, got {first:?}");
    };
    assert_eq!(payout.amount_cents, 34_000);
    assert_eq!(payout.commission_cents, 6_000);

    for _ in 0..3 {
        let again = ledger.escrow.compute_payout(&order.id, "req").await.expect("payout");
        assert_eq!(again.payout().map(|p| p.id.clone()), Some(payout.id.clone()));
        assert!(matches!(again, PayoutResult::Existing { .. }));
    }
    let payouts = ledger.orders_service().order_payouts(&customer(), &order.id).await.expect("payouts");
    assert_eq!(payouts.len(), 1);
}

#[tokio::test]
async fn failed_payout_is_reversed_and_can_be_recomputed() {
    let ledger = Ledger::new();
    let order = ledger.paid_order(40_000, 4_000).await;
    let payout = ledger.complete(&order.id).await.payout().cloned().expect("payout");

    let error = ledger
        .escrow
        .update_payout_status(&provider(), &payout.id, PayoutStatus::Paid, None, "req")
        .await
        .expect_err("providers cannot drive payouts");
    assert!(matches!(error, ApplicationError::Forbidden { .. }));

    ledger
        .escrow
        .update_payout_status(&operator(), &payout.id, PayoutStatus::Processing, None, "req")
        .await
        .expect("processing");
    let failed = ledger
        .escrow
        .update_payout_status(
            &operator(),
            &payout.id,
            PayoutStatus::Failed,
            Some("iban rejected".to_string()),
            "req",
        )
        .await
        .expect("failed");
    assert_eq!(failed.failure_reason.as_deref(), Some("iban rejected"));
    assert_eq!(failed.paid_at, None);

    let balance = ledger.balance().await;
    assert!(balance.is_consistent());
    assert_eq!(balance.held_cents, 40_000);

    let retried = ledger.escrow.compute_payout(&order.id, "req").await.expect("recompute");
    let PayoutResult::Created { payout: replacement } = retried else {
        panic!("expected a replacement payout, got {retried:?}");
    };
    assert_ne!(replacement.id, payout.id);
    assert_eq!(replacement.amount_cents, 36_000);
    assert_eq!(ledger.balance().await.held_cents, 0);

    let error = ledger
        .escrow
        .update_payout_status(&operator(), &payout.id, PayoutStatus::Paid, None, "req")
        .await
        .expect_err("failed payouts are terminal");
    assert!(matches!(error, ApplicationError::Domain(DomainError::InvalidTransition { .. })));
}

#[tokio::test]
async fn paid_payout_records_when_it_was_paid() {
    let ledger = Ledger::new();
    let order = ledger.paid_order(40_000, 4_000).await;
    let payout = ledger.complete(&order.id).await.payout().cloned().expect("payout");
    assert_eq!(payout.paid_at, None);

    let processing = ledger
        .escrow
        .update_payout_status(&operator(), &payout.id, PayoutStatus::Processing, None, "req")
        .await
        .expect("processing");
    assert_eq!(processing.paid_at, None);

    let paid = ledger
        .escrow
        .update_payout_status(&operator(), &payout.id, PayoutStatus::Paid, None, "req")
        .await
        .expect("paid");
    assert_eq!(paid.status, PayoutStatus::Paid);
    let paid_at = paid.paid_at.expect("paid_at set");
    assert!(paid_at >= paid.created_at);
    assert_eq!(ledger.escrow.get_payout(&payout.id).await.expect("payout").paid_at, Some(paid_at));
}

#[tokio::test]
async fn failing_a_payout_requires_a_reason() {
    let ledger = Ledger::new();
    let order = ledger.paid_order(40_000, 4_000).await;
    let payout = ledger.complete(&order.id).await.payout().cloned().expect("payout");

    for reason in [None, Some("   ".to_string())] {
        let error = ledger
            .escrow
            .update_payout_status(&operator(), &payout.id, PayoutStatus::Failed, reason, "req")
            .await
            .expect_err("reason required");
        assert!(matches!(error, ApplicationError::Domain(DomainError::Validation(_))));
    }
    let unchanged = ledger.escrow.get_payout(&payout.id).await.expect("payout");
    assert_eq!(unchanged.status, PayoutStatus::Pending);
    assert_eq!(ledger.balance().await.held_cents, 0);
}

#[tokio::test]
async fn hours_settled_after_completion_get_their_own_payout() {
    let ledger = Ledger::new();
    let order = ledger.paid_order(40_000, 4_000).await;
    let request = ledger.submitted_request(&order.id, &[2]).await;
    ledger
        .orders_service()
        .mark_provider_completed(&provider(), &order.id, Some("all done".to_string()), "req")
        .await
        .expect("provider complete");
    ledger
        .time
        .customer_respond(&customer(), &order.id, &request.id, ApprovalDecision::ApproveAll, None, "req")
        .await
        .expect("approve");
    let order_payout = ledger.complete(&order.id).await.payout().cloned().expect("order payout");
    assert_eq!(order_payout.captured_cents, 40_000);

    let disposition = ledger
        .deliver(capture("evt_late", "pi_late", 5_000, hours_metadata(&order.id, &request, 500)))
        .await;
    let Some(ReconcileOutcome::HoursSettled { payout_id: Some(late_payout), .. }) = disposition.outcome
    else {
        panic!("expected a late payout, got {disposition:?}");
    };
    assert_ne!(late_payout, order_payout.id);

    let late = ledger.escrow.get_payout(&late_payout).await.expect("late payout");
    assert_eq!(late.amount_cents, 4_500);
    assert_eq!(late.commission_cents, 500);
    let balance = ledger.balance().await;
    assert!(balance.is_consistent());
    assert_eq!(balance.held_cents, 0);
    assert!(ledger.escrow.inconsistent_balances().await.expect("audit").is_empty());
}

#[tokio::test]
async fn order_lifecycle_enforces_parties_and_state() {
    let ledger = Ledger::new();
    let order = ledger.paid_order(40_000, 0).await;
    let orders = ledger.orders_service();

    let error = orders
        .mark_provider_completed(&Actor::provider(RIVAL), &order.id, None, "req")
        .await
        .expect_err("not the provider");
    assert!(matches!(error, ApplicationError::Forbidden { .. }));

    let error = orders
        .mark_completed(
            &customer(),
            &order.id,
            CompletionReview { rating: Some(6), review: None },
            "req",
        )
        .await
        .expect_err("rating out of range");
    assert_eq!(error.error_class(), "validation");

    let cancelled = orders
        .cancel_order(&customer(), &order.id, "project postponed".to_string(), "req")
        .await
        .expect("cancel");
    assert_eq!(cancelled.status, OrderStatus::Cancelled);
    assert_eq!(cancelled.cancellation_reason.as_deref(), Some("project postponed"));

    let error = orders
        .cancel_order(&customer(), &order.id, "again".to_string(), "req")
        .await
        .expect_err("already cancelled");
    assert!(matches!(
        error,
        ApplicationError::Domain(DomainError::InvalidTransition { ref current, .. }) if current == "CANCELLED"
    ));
    // Billed history is left untouched by cancellation.
    assert_eq!(ledger.balance().await.entries.len(), 1);
}

#[tokio::test]
async fn completed_orders_cannot_be_cancelled() {
    let ledger = Ledger::new();
    let order = ledger.paid_order(40_000, 0).await;
    ledger.complete(&order.id).await;

    let error = ledger
        .orders_service()
        .cancel_order(&provider(), &order.id, "changed my mind".to_string(), "req")
        .await
        .expect_err("completed");
    assert!(matches!(error, ApplicationError::Domain(DomainError::InvalidTransition { .. })));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_deliveries_create_at_most_one_order() {
    let ledger = Ledger::with_retry(RetryPolicy {
        max_attempts: 64,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(10),
        multiplier: 2,
    });
    let quote = ledger.open_quote(&[(PROVIDER, 40_000), (RIVAL, 35_000)]).await;
    let proposal_id = quote.proposals[0].id.clone();
    let metadata = initial_metadata(&quote.id, &proposal_id, 1_000);

    let mut handles = Vec::new();
    for attempt in 0..8 {
        let reconciler = ledger.reconciler.clone();
        let event = capture(
            if attempt % 2 == 0 { "evt_race_a" } else { "evt_race_b" },
            "pi_race",
            40_000,
            metadata.clone(),
        );
        handles.push(tokio::spawn(async move {
            reconciler.handle_payment_event(event, "race").await
        }));
    }

    let mut created = 0;
    for handle in handles {
        let disposition = handle.await.expect("join").expect("reconcile");
        if matches!(disposition.outcome, Some(ReconcileOutcome::OrderCreated { .. }))
            && disposition.status == DispositionStatus::Processed
        {
            created += 1;
        }
    }

    assert_eq!(created, 1);
    assert_eq!(ledger.orders().await.len(), 1);
    let balance = ledger.balance().await;
    assert_eq!(balance.entries.len(), 1);
    assert!(balance.is_consistent());
    let quote = ledger.quote(&quote.id).await;
    let accepted = quote.proposals.iter().filter(|p| p.status == ProposalStatus::Accepted).count();
    assert_eq!(accepted, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_accepts_leave_one_reservation_and_a_conflict() {
    let ledger = Ledger::with_retry(RetryPolicy {
        max_attempts: 64,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(10),
        multiplier: 2,
    });
    let quote = ledger.open_quote(&[(PROVIDER, 40_000), (RIVAL, 35_000)]).await;

    let mut handles = Vec::new();
    for (index, proposal) in quote.proposals.iter().enumerate() {
        let quotes = ledger.quotes.clone();
        let quote_id = quote.id.clone();
        let proposal_id = proposal.id.clone();
        let intent = PaymentIntentId::new(format!("pi_accept_{index}"));
        handles.push(tokio::spawn(async move {
            quotes.accept_proposal(&customer(), &quote_id, &proposal_id, Some(intent), "race").await
        }));
    }

    let mut reserved = 0;
    let mut conflicts = Vec::new();
    for handle in handles {
        match handle.await.expect("join") {
            Ok(quote) => {
                assert_eq!(quote.status, QuoteStatus::PaymentPending);
                reserved += 1;
            }
            Err(ApplicationError::Conflict(detail)) => conflicts.push(detail),
            Err(other) => panic!("loser must see a conflict, got {other:?}"),
        }
    }
    assert_eq!(reserved, 1);
    assert_eq!(conflicts.len(), 1);
    assert!(conflicts[0].contains("payment_pending"), "{}", conflicts[0]);

    let quote = ledger.quote(&quote.id).await;
    let pending =
        quote.proposals.iter().filter(|p| p.status == ProposalStatus::PaymentPending).count();
    assert_eq!(pending, 1);
    assert_eq!(
        quote.proposals.iter().filter(|p| p.status == ProposalStatus::Pending).count(),
        1
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn payout_races_with_completion_and_stays_single() {
    let ledger = Ledger::with_retry(RetryPolicy {
        max_attempts: 64,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(10),
        multiplier: 2,
    });
    let order = ledger.paid_order(40_000, 6_000).await;
    ledger
        .orders_service()
        .mark_provider_completed(&provider(), &order.id, None, "req")
        .await
        .expect("provider complete");

    let mut payout_calls = Vec::new();
    for _ in 0..6 {
        let escrow = ledger.escrow.clone();
        let order_id = order.id.clone();
        payout_calls.push(tokio::spawn(async move { escrow.compute_payout(&order_id, "race").await }));
    }
    let orders = ledger.orders_service();
    let order_id = order.id.clone();
    let completion = tokio::spawn(async move {
        orders
            .mark_completed(&customer(), &order_id, CompletionReview { rating: None, review: None }, "race")
            .await
    });

    let (completed, _) = completion.await.expect("join").expect("complete");
    assert_eq!(completed.status, OrderStatus::Abgeschlossen);
    for call in payout_calls {
        match call.await.expect("join") {
            Ok(result) => assert!(result.payout().is_some(), "{result:?}"),
            Err(ApplicationError::Domain(DomainError::InvalidTransition { .. })) => {}
            Err(other) => panic!("unexpected payout error {other:?}"),
        }
    }

    let payouts = ledger.orders_service().order_payouts(&operator(), &order.id).await.expect("payouts");
    assert_eq!(payouts.len(), 1);
    assert_eq!(payouts[0].amount_cents + payouts[0].commission_cents, 40_000);
    let balance = ledger.balance().await;
    assert!(balance.is_consistent());
    assert_eq!(balance.held_cents, 0);
}

#[tokio::test]
async fn parties_list_only_their_own_orders() {
    let ledger = Ledger::new();
    let first = ledger.paid_order(40_000, 0).await;
    let quote = ledger.open_quote(&[(RIVAL, 20_000)]).await;
    let proposal_id = quote.proposals[0].id.clone();
    ledger.reserve(&quote.id, &proposal_id, "pi_rival").await;
    let disposition = ledger
        .deliver(capture("evt_rival", "pi_rival", 20_000, initial_metadata(&quote.id, &proposal_id, 0)))
        .await;
    let Some(ReconcileOutcome::OrderCreated { order_id: second, .. }) = disposition.outcome else {
        panic!("expected a second order, got {disposition:?}");
    };
    let orders = ledger.orders_service();

    let mine = orders.list_orders(&provider(), OrderListQuery::default()).await.expect("list");
    assert_eq!(mine.iter().map(|view| view.order.id.clone()).collect::<Vec<_>>(), vec![first.id.clone()]);

    let all = orders.list_orders(&customer(), OrderListQuery::default()).await.expect("list");
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].order.id, second, "newest first");

    let page = orders
        .list_orders(
            &customer(),
            OrderListQuery { status: None, limit: Some(1), after: Some(second.clone()) },
        )
        .await
        .expect("next page");
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].order.id, first.id);

    ledger.complete(&first.id).await;
    let active = orders
        .list_orders(
            &operator(),
            OrderListQuery { status: Some(OrderStatus::Aktiv), limit: None, after: None },
        )
        .await
        .expect("filtered");
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].order.id, second);

    let error = orders
        .list_orders(&customer(), OrderListQuery { status: None, limit: Some(0), after: None })
        .await
        .expect_err("zero limit");
    assert!(matches!(error, ApplicationError::Domain(DomainError::Validation(_))));
}

struct Ledger {
    store: Arc<InMemoryLedgerStore>,
    sink: InMemoryFactSink,
    ctx: LedgerContext,
    quotes: QuoteService,
    time: TimeTrackingService,
    escrow: EscrowService,
    reconciler: PaymentReconciler,
}

impl Ledger {
    fn new() -> Self {
        Self::with_retry(RetryPolicy::immediate(8))
    }

    fn with_retry(retry: RetryPolicy) -> Self {
        let store = Arc::new(InMemoryLedgerStore::default());
        let sink = InMemoryFactSink::default();
        let ctx = LedgerContext::new(store.clone(), Arc::new(sink.clone()), retry);
        Self {
            quotes: QuoteService::new(ctx.clone()),
            time: TimeTrackingService::new(ctx.clone()),
            escrow: EscrowService::new(ctx.clone()),
            reconciler: PaymentReconciler::new(ctx.clone(), Arc::new(DisabledPaymentProcessor)),
            store,
            sink,
            ctx,
        }
    }

    fn orders_service(&self) -> OrderService {
        OrderService::new(self.ctx.clone())
    }

    fn reconciler_with(&self, processor: Arc<dyn PaymentProcessor>, timeout: Duration) -> PaymentReconciler {
        PaymentReconciler::new(self.ctx.clone(), processor).with_processor_timeout(timeout)
    }

    async fn open_quote(&self, offers: &[(&str, i64)]) -> Quote {
        let quote = self
            .quotes
            .create_quote(
                &customer(),
                QuoteDraft {
                    title: "Office renovation".to_string(),
                    category: "construction".to_string(),
                    subcategory: Some("drywall".to_string()),
                    visibility: Visibility::Public,
                },
                "req",
            )
            .await
            .expect("create quote");
        self.quotes.publish(&customer(), &quote.id, "req").await.expect("publish");
        for (provider, price_cents) in offers {
            self.quotes
                .submit_proposal(
                    &Actor::provider(*provider),
                    &quote.id,
                    ProposalDraft {
                        price_cents: *price_cents,
                        currency: "EUR".to_string(),
                        quoted_hours: Decimal::new(16, 0),
                        hourly_rate_cents: RATE_CENTS,
                        message: None,
                    },
                    "req",
                )
                .await
                .expect("submit proposal");
        }
        self.quote(&quote.id).await
    }

    async fn reserve(&self, quote_id: &QuoteId, proposal_id: &ProposalId, intent: &str) {
        self.quotes
            .accept_proposal(&customer(), quote_id, proposal_id, Some(PaymentIntentId::new(intent)), "req")
            .await
            .expect("accept proposal");
    }

    async fn paid_order(&self, price_cents: i64, fee_cents: i64) -> Order {
        let quote = self.open_quote(&[(PROVIDER, price_cents)]).await;
        let proposal_id = quote.proposals[0].id.clone();
        self.reserve(&quote.id, &proposal_id, "pi_order").await;
        let disposition = self
            .deliver(capture(
                "evt_order",
                "pi_order",
                price_cents,
                initial_metadata(&quote.id, &proposal_id, fee_cents),
            ))
            .await;
        let Some(ReconcileOutcome::OrderCreated { order_id, .. }) = disposition.outcome else {
            panic!("expected an order, got {disposition:?}");
        };
        self.order(&order_id).await
    }

    async fn log(&self, order_id: &OrderId, hours: i64, category: TimeEntryCategory) -> taskledger_core::domain::time_entry::TimeEntry {
        self.time
            .log_time(
                &provider(),
                order_id,
                NewTimeEntry {
                    date: NaiveDate::from_ymd_opt(2026, 3, 2).expect("date"),
                    start_time: None,
                    end_time: None,
                    hours: Some(Decimal::new(hours, 0)),
                    description: "extra wiring in the hallway".to_string(),
                    category,
                },
                "req",
            )
            .await
            .expect("log time")
    }

    async fn submitted_request(&self, order_id: &OrderId, hours: &[i64]) -> ApprovalRequest {
        let mut entry_ids: Vec<TimeEntryId> = Vec::new();
        for hours in hours {
            entry_ids.push(self.log(order_id, *hours, TimeEntryCategory::Additional).await.id);
        }
        self.time
            .submit_for_approval(&provider(), order_id, entry_ids, Some("extra work".to_string()), "req")
            .await
            .expect("submit for approval")
    }

    async fn approved_request(&self, order_id: &OrderId, hours: &[i64]) -> ApprovalRequest {
        let request = self.submitted_request(order_id, hours).await;
        self.time
            .customer_respond(&customer(), order_id, &request.id, ApprovalDecision::ApproveAll, None, "req")
            .await
            .expect("approve")
    }

    async fn complete(&self, order_id: &OrderId) -> PayoutResult {
        let orders = self.orders_service();
        if self.order(order_id).await.status == OrderStatus::Aktiv {
            orders
                .mark_provider_completed(&provider(), order_id, None, "req")
                .await
                .expect("provider complete");
        }
        let (order, payout) = orders
            .mark_completed(
                &customer(),
                order_id,
                CompletionReview { rating: Some(5), review: Some("Clean and on time".to_string()) },
                "req",
            )
            .await
            .expect("complete order");
        assert_eq!(order.status, OrderStatus::Abgeschlossen);
        payout
    }

    async fn deliver(&self, event: PaymentEvent) -> EventDisposition {
        self.reconciler.handle_payment_event(event, "req").await.expect("reconcile")
    }

    async fn quote(&self, quote_id: &QuoteId) -> Quote {
        self.quotes.get_quote(&operator(), quote_id).await.expect("quote")
    }

    async fn order(&self, order_id: &OrderId) -> Order {
        self.orders_service().get_order(&operator(), order_id).await.expect("order").order
    }

    async fn orders(&self) -> Vec<Order> {
        store::load_all(self.store.as_ref(), ORDERS).await.expect("orders")
    }

    async fn balance(&self) -> taskledger_core::domain::balance::CompanyBalanceView {
        self.escrow.company_balance(&CompanyId::new(PROVIDER)).await.expect("balance")
    }
}

fn customer() -> Actor {
    Actor::customer(CUSTOMER)
}

fn provider() -> Actor {
    Actor::provider(PROVIDER)
}

fn operator() -> Actor {
    Actor::operator("ops-1")
}

fn meta(pairs: &[(&str, &str)]) -> BTreeMap<String, Value> {
    pairs.iter().map(|(key, value)| (key.to_string(), Value::String(value.to_string()))).collect()
}

fn initial_metadata(quote_id: &QuoteId, proposal_id: &ProposalId, fee_cents: i64) -> BTreeMap<String, Value> {
    let fee = fee_cents.to_string();
    meta(&[
        ("paymentType", "b2b_project"),
        ("quoteId", quote_id.as_str()),
        ("proposalId", proposal_id.as_str()),
        ("platformFeeAmount", fee.as_str()),
    ])
}

fn hours_metadata(order_id: &OrderId, request: &ApprovalRequest, fee_cents: i64) -> BTreeMap<String, Value> {
    let fee = fee_cents.to_string();
    meta(&[
        ("paymentType", "additional_hours_payment"),
        ("orderId", order_id.as_str()),
        ("approvalRequestId", request.id.as_str()),
        ("platformFeeAmount", fee.as_str()),
    ])
}

fn capture(event_id: &str, intent: &str, amount: i64, metadata: BTreeMap<String, Value>) -> PaymentEvent {
    PaymentEvent {
        event_id: EventId::new(event_id),
        event_type: "payment_intent.succeeded".to_string(),
        object: PaymentObject {
            id: PaymentIntentId::new(intent),
            amount,
            currency: "eur".to_string(),
            status: Some("succeeded".to_string()),
            application_fee_amount: None,
            metadata,
        },
    }
}
