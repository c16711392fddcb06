//! Order lifecycle: `AKTIV -> PROVIDER_COMPLETED -> ABGESCHLOSSEN`, with cancellation
//! from either open state. Orders are only ever created by the payment reconciler.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::context::LedgerContext;
use crate::domain::order::{CompletionReview, Order, OrderId, OrderStatus, ORDERS};
use crate::domain::payment::{EventId, IntentTarget, PaymentIntentId, PaymentIntentLink};
use crate::domain::payout::{Payout, PayoutBatch, PayoutStatus};
use crate::domain::quote::{ProposalId, Quote};
use crate::domain::time_entry::{TimeTracking, TimeTrackingTotals};
use crate::domain::{Actor, ActorRole};
use crate::errors::{ApplicationError, DomainError};
use crate::escrow::{self, PayoutResult};
use crate::facts::DomainFact;
use crate::store::{self, LedgerTransaction};

#[derive(Clone, Debug, PartialEq)]
pub enum OrderCreation {
    /// New order, not yet staged; the caller records the capture and writes it.
    Created(Box<Order>),
    Existing(OrderId),
}

/// Read model for parties: the order plus its time tracking totals.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrderView {
    pub order: Order,
    pub totals: TimeTrackingTotals,
}

pub const DEFAULT_ORDER_PAGE: usize = 20;
pub const MAX_ORDER_PAGE: usize = 100;

/// Page of a party's orders, newest first. `after` continues from a previously returned
/// order id.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderListQuery {
    pub status: Option<OrderStatus>,
    pub limit: Option<usize>,
    pub after: Option<OrderId>,
}

/// Creates the order for a paid proposal, once per payment intent. The intent link is a
/// create-only document, so two racing deliveries cannot both commit an order.
pub async fn create_from_accepted_proposal(
    tx: &mut LedgerTransaction,
    quote: &Quote,
    proposal_id: &ProposalId,
    payment_intent_id: &PaymentIntentId,
    event_id: &EventId,
) -> Result<OrderCreation, ApplicationError> {
    let link_key = PaymentIntentLink::key_for(payment_intent_id);
    if let Some(link) = tx.get::<PaymentIntentLink>(&link_key).await? {
        return match link.target {
            IntentTarget::Order { order_id, .. } => Ok(OrderCreation::Existing(order_id)),
            IntentTarget::ApprovalRequest { approval_request_id, .. } => {
                Err(DomainError::InvariantViolation(format!(
                    "payment intent `{payment_intent_id}` already settled approval request `{approval_request_id}`"
                ))
                .into())
            }
        };
    }

    let proposal = quote.proposal(proposal_id).ok_or_else(|| {
        ApplicationError::not_found("proposal", proposal_id)
    })?;
    let now = Utc::now();
    let order = Order {
        id: OrderId::generate(),
        quote_id: quote.id.clone(),
        proposal_id: proposal.id.clone(),
        customer_id: quote.customer_id.clone(),
        provider_id: proposal.provider_id.clone(),
        category: quote.category.clone(),
        subcategory: quote.subcategory.clone(),
        payment_intent_id: payment_intent_id.clone(),
        quoted_hours: proposal.quoted_hours,
        price_cents: proposal.price_cents,
        currency: proposal.currency.clone(),
        status: OrderStatus::Aktiv,
        time_tracking: TimeTracking::new(proposal.hourly_rate_cents),
        captures: Vec::new(),
        payout_ids: Vec::new(),
        completion_note: None,
        review: None,
        cancellation_reason: None,
        created_at: now,
        updated_at: now,
        provider_completed_at: None,
        completed_at: None,
        cancelled_at: None,
    };

    tx.put(&PaymentIntentLink {
        payment_intent_id: payment_intent_id.clone(),
        target: IntentTarget::Order {
            order_id: order.id.clone(),
            quote_id: quote.id.clone(),
            proposal_id: proposal.id.clone(),
        },
        event_id: event_id.clone(),
        created_at: now,
    })?;
    tx.emit(DomainFact::OrderCreated {
        order_id: order.id.clone(),
        quote_id: quote.id.clone(),
        payment_intent_id: payment_intent_id.clone(),
    });
    Ok(OrderCreation::Created(Box::new(order)))
}

/// Fails with `InvalidTransition` once any payout of the order has been paid.
pub async fn ensure_no_paid_payout(
    tx: &mut LedgerTransaction,
    order: &Order,
    action: &str,
) -> Result<(), ApplicationError> {
    for payout_id in &order.payout_ids {
        let payout: Payout = tx.require(&Payout::key_for(payout_id), "payout").await?;
        if payout.status == PayoutStatus::Paid {
            return Err(DomainError::invalid_transition(
                "order",
                &order.id,
                format!("{} with paid payout `{payout_id}`", order.status.as_str()),
                action,
            )
            .into());
        }
    }
    Ok(())
}

pub fn ensure_party(actor: &Actor, order: &Order, action: &str) -> Result<(), ApplicationError> {
    if actor.is_customer(&order.customer_id) || actor.is_provider(&order.provider_id) {
        Ok(())
    } else {
        Err(ApplicationError::forbidden(actor, action))
    }
}

#[derive(Clone)]
pub struct OrderService {
    ctx: LedgerContext,
}

impl OrderService {
    pub fn new(ctx: LedgerContext) -> Self {
        Self { ctx }
    }

    pub async fn get_order(&self, actor: &Actor, order_id: &OrderId) -> Result<OrderView, ApplicationError> {
        let order: Order = store::load(self.ctx.store().as_ref(), &Order::key_for(order_id))
            .await?
            .ok_or_else(|| ApplicationError::not_found("order", order_id))?;
        ensure_party(actor, &order, "read the order")?;
        let totals = order.time_tracking.totals();
        Ok(OrderView { order, totals })
    }

    /// Orders where `actor` is the customer or the provider; operators see every order.
    pub async fn list_orders(
        &self,
        actor: &Actor,
        query: OrderListQuery,
    ) -> Result<Vec<OrderView>, ApplicationError> {
        let limit = query.limit.unwrap_or(DEFAULT_ORDER_PAGE);
        if limit == 0 || limit > MAX_ORDER_PAGE {
            return Err(DomainError::Validation(format!(
                "limit must be in range [1, {MAX_ORDER_PAGE}], got {limit}"
            ))
            .into());
        }

        let mut orders: Vec<Order> = store::load_all(self.ctx.store().as_ref(), ORDERS)
            .await?
            .into_iter()
            .filter(|order: &Order| match actor.role {
                ActorRole::Customer => order.customer_id.as_str() == actor.id,
                ActorRole::Provider => order.provider_id.as_str() == actor.id,
                ActorRole::Operator | ActorRole::System => true,
            })
            .filter(|order| query.status.map_or(true, |status| order.status == status))
            .collect();
        orders.sort_by(|left, right| {
            right.created_at.cmp(&left.created_at).then_with(|| right.id.cmp(&left.id))
        });

        let start = match &query.after {
            Some(after) => orders
                .iter()
                .position(|order| &order.id == after)
                .map(|index| index + 1)
                .ok_or_else(|| ApplicationError::not_found("order", after))?,
            None => 0,
        };
        Ok(orders
            .into_iter()
            .skip(start)
            .take(limit)
            .map(|order| {
                let totals = order.time_tracking.totals();
                OrderView { order, totals }
            })
            .collect())
    }

    pub async fn order_payouts(
        &self,
        actor: &Actor,
        order_id: &OrderId,
    ) -> Result<Vec<Payout>, ApplicationError> {
        let view = self.get_order(actor, order_id).await?;
        let mut payouts = Vec::with_capacity(view.order.payout_ids.len());
        for payout_id in &view.order.payout_ids {
            if let Some(payout) =
                store::load::<Payout>(self.ctx.store().as_ref(), &Payout::key_for(payout_id)).await?
            {
                payouts.push(payout);
            }
        }
        Ok(payouts)
    }

    pub async fn mark_provider_completed(
        &self,
        actor: &Actor,
        order_id: &OrderId,
        note: Option<String>,
        correlation_id: &str,
    ) -> Result<Order, ApplicationError> {
        let actor = actor.clone();
        let order_id = order_id.clone();
        let order = self
            .ctx
            .transact("order.provider_complete", correlation_id, move |tx| {
                let actor = actor.clone();
                let order_id = order_id.clone();
                let note = note.clone();
                Box::pin(async move {
                    let mut order: Order = tx.require(&Order::key_for(&order_id), "order").await?;
                    if !actor.is_provider(&order.provider_id) {
                        return Err(ApplicationError::forbidden(&actor, "mark the order provider-completed"));
                    }
                    ensure_no_paid_payout(tx, &order, "be marked provider-completed").await?;
                    order.transition_to(OrderStatus::ProviderCompleted, "be marked provider-completed")?;
                    order.completion_note = note.filter(|value| !value.trim().is_empty());
                    tx.put(&order)?;
                    tx.emit(DomainFact::OrderProviderCompleted { order_id: order.id.clone() });
                    Ok(order)
                })
            })
            .await?;

        info!(
            event_name = "ledger.order.provider_completed",
            correlation_id,
            order_id = %order.id,
            "order marked provider-completed"
        );
        Ok(order)
    }

    /// Customer sign-off. The order-level payout is created in the same transaction.
    pub async fn mark_completed(
        &self,
        actor: &Actor,
        order_id: &OrderId,
        review: CompletionReview,
        correlation_id: &str,
    ) -> Result<(Order, PayoutResult), ApplicationError> {
        review.validate()?;
        let actor = actor.clone();
        let order_id = order_id.clone();
        let (order, payout) = self
            .ctx
            .transact("order.complete", correlation_id, move |tx| {
                let actor = actor.clone();
                let order_id = order_id.clone();
                let review = review.clone();
                Box::pin(async move {
                    let mut order: Order = tx.require(&Order::key_for(&order_id), "order").await?;
                    if !actor.is_customer(&order.customer_id) {
                        return Err(ApplicationError::forbidden(&actor, "complete the order"));
                    }
                    ensure_no_paid_payout(tx, &order, "be completed").await?;
                    order.transition_to(OrderStatus::Abgeschlossen, "be completed")?;
                    if review.rating.is_some() || review.review.is_some() {
                        order.review = Some(review);
                    }

                    let payout = escrow::compute_payout(tx, &mut order, PayoutBatch::Order).await?;
                    tx.put(&order)?;
                    tx.emit(DomainFact::OrderCompleted {
                        order_id: order.id.clone(),
                        payout_id: payout.payout().map(|payout| payout.id.clone()),
                    });
                    Ok((order, payout))
                })
            })
            .await?;

        info!(
            event_name = "ledger.order.completed",
            correlation_id,
            order_id = %order.id,
            payout_id = payout.payout().map(|payout| payout.id.as_str()).unwrap_or("none"),
            "order completed"
        );
        Ok((order, payout))
    }

    /// Cancels an open order. Billed entries and balance history stay as they are.
    pub async fn cancel_order(
        &self,
        actor: &Actor,
        order_id: &OrderId,
        reason: String,
        correlation_id: &str,
    ) -> Result<Order, ApplicationError> {
        if reason.trim().is_empty() {
            return Err(DomainError::Validation("a cancellation reason is required".to_string()).into());
        }
        let actor = actor.clone();
        let order_id = order_id.clone();
        let order = self
            .ctx
            .transact("order.cancel", correlation_id, move |tx| {
                let actor = actor.clone();
                let order_id = order_id.clone();
                let reason = reason.trim().to_string();
                Box::pin(async move {
                    let mut order: Order = tx.require(&Order::key_for(&order_id), "order").await?;
                    ensure_party(&actor, &order, "cancel the order")?;
                    ensure_no_paid_payout(tx, &order, "be cancelled").await?;
                    order.transition_to(OrderStatus::Cancelled, "be cancelled")?;
                    order.cancellation_reason = Some(reason.clone());
                    tx.put(&order)?;
                    tx.emit(DomainFact::OrderCancelled { order_id: order.id.clone(), reason });
                    Ok(order)
                })
            })
            .await?;

        info!(event_name = "ledger.order.cancelled", correlation_id, order_id = %order.id, "order cancelled");
        Ok(order)
    }
}
