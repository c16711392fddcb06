//! Quote/proposal manager: the customer request, provider offers and the payment
//! reservation that precedes acceptance. Acceptance itself is finalized by the reconciler
//! once the processor confirms the capture.

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::context::LedgerContext;
use crate::domain::payment::PaymentIntentId;
use crate::domain::quote::{Proposal, ProposalId, ProposalStatus, Quote, QuoteId, QuoteStatus, Visibility};
use crate::domain::{Actor, ActorRole, CompanyId, Currency, CustomerId};
use crate::errors::{ApplicationError, DomainError};
use crate::facts::DomainFact;
use crate::store;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuoteDraft {
    pub title: String,
    pub category: String,
    pub subcategory: Option<String>,
    pub visibility: Visibility,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalDraft {
    pub price_cents: i64,
    pub currency: String,
    pub quoted_hours: Decimal,
    pub hourly_rate_cents: i64,
    pub message: Option<String>,
}

impl ProposalDraft {
    fn validate(&self) -> Result<Currency, DomainError> {
        if self.price_cents <= 0 {
            return Err(DomainError::Validation("proposal price must be positive".to_string()));
        }
        if self.hourly_rate_cents <= 0 {
            return Err(DomainError::Validation("hourly rate must be positive".to_string()));
        }
        if self.quoted_hours <= Decimal::ZERO {
            return Err(DomainError::Validation("quoted hours must be positive".to_string()));
        }
        Currency::parse(&self.currency)
    }
}

#[derive(Clone)]
pub struct QuoteService {
    ctx: LedgerContext,
}

impl QuoteService {
    pub fn new(ctx: LedgerContext) -> Self {
        Self { ctx }
    }

    pub async fn create_quote(
        &self,
        actor: &Actor,
        draft: QuoteDraft,
        correlation_id: &str,
    ) -> Result<Quote, ApplicationError> {
        if actor.role != ActorRole::Customer {
            return Err(ApplicationError::forbidden(actor, "create a quote"));
        }
        if draft.title.trim().is_empty() || draft.category.trim().is_empty() {
            return Err(DomainError::Validation("title and category are required".to_string()).into());
        }

        let now = Utc::now();
        let quote = Quote {
            id: QuoteId::generate(),
            customer_id: CustomerId::new(actor.id.as_str()),
            title: draft.title.trim().to_string(),
            category: draft.category.trim().to_string(),
            subcategory: draft.subcategory.filter(|value| !value.trim().is_empty()),
            visibility: draft.visibility,
            status: QuoteStatus::Draft,
            proposals: Vec::new(),
            order_id: None,
            created_at: now,
            updated_at: now,
        };

        let created = quote.clone();
        self.ctx
            .transact("quote.create", correlation_id, move |tx| {
                let quote = created.clone();
                Box::pin(async move {
                    tx.put(&quote)?;
                    Ok(())
                })
            })
            .await?;

        info!(
            event_name = "ledger.quote.created",
            correlation_id,
            quote_id = %quote.id,
            customer_id = %quote.customer_id,
            "quote created"
        );
        Ok(quote)
    }

    pub async fn publish(
        &self,
        actor: &Actor,
        quote_id: &QuoteId,
        correlation_id: &str,
    ) -> Result<Quote, ApplicationError> {
        let actor = actor.clone();
        let quote_id = quote_id.clone();
        let quote = self
            .ctx
            .transact("quote.publish", correlation_id, move |tx| {
                let actor = actor.clone();
                let quote_id = quote_id.clone();
                Box::pin(async move {
                    let mut quote: Quote = tx.require(&Quote::key_for(&quote_id), "quote").await?;
                    ensure_customer(&actor, &quote, "publish the quote")?;
                    quote.transition_to(QuoteStatus::Published, "be published")?;
                    tx.put(&quote)?;
                    tx.emit(DomainFact::QuotePublished { quote_id: quote.id.clone() });
                    Ok(quote)
                })
            })
            .await?;

        info!(event_name = "ledger.quote.published", correlation_id, quote_id = %quote.id, "quote published");
        Ok(quote)
    }

    pub async fn submit_proposal(
        &self,
        actor: &Actor,
        quote_id: &QuoteId,
        draft: ProposalDraft,
        correlation_id: &str,
    ) -> Result<Proposal, ApplicationError> {
        if actor.role != ActorRole::Provider {
            return Err(ApplicationError::forbidden(actor, "submit a proposal"));
        }
        let currency = draft.validate()?;

        let now = Utc::now();
        let proposal = Proposal {
            id: ProposalId::generate(),
            provider_id: CompanyId::new(actor.id.as_str()),
            price_cents: draft.price_cents,
            currency,
            quoted_hours: draft.quoted_hours,
            hourly_rate_cents: draft.hourly_rate_cents,
            message: draft.message,
            status: ProposalStatus::Pending,
            payment_intent_id: None,
            submitted_at: now,
            updated_at: now,
        };

        let quote_id = quote_id.clone();
        let submitted = proposal.clone();
        self.ctx
            .transact("proposal.submit", correlation_id, move |tx| {
                let quote_id = quote_id.clone();
                let proposal = submitted.clone();
                Box::pin(async move {
                    let mut quote: Quote = tx.require(&Quote::key_for(&quote_id), "quote").await?;
                    let fact = DomainFact::ProposalSubmitted {
                        quote_id: quote.id.clone(),
                        proposal_id: proposal.id.clone(),
                        provider_id: proposal.provider_id.clone(),
                    };
                    quote.add_proposal(proposal)?;
                    tx.put(&quote)?;
                    tx.emit(fact);
                    Ok(())
                })
            })
            .await?;

        info!(
            event_name = "ledger.proposal.submitted",
            correlation_id,
            proposal_id = %proposal.id,
            provider_id = %proposal.provider_id,
            "proposal submitted"
        );
        Ok(proposal)
    }

    /// Reserves `proposal_id` for payment. Siblings stay open until the capture clears.
    pub async fn accept_proposal(
        &self,
        actor: &Actor,
        quote_id: &QuoteId,
        proposal_id: &ProposalId,
        payment_intent_id: Option<PaymentIntentId>,
        correlation_id: &str,
    ) -> Result<Quote, ApplicationError> {
        let actor = actor.clone();
        let quote_id = quote_id.clone();
        let proposal_id = proposal_id.clone();
        // A reservation held by another proposal is the inner error; `transact` retries
        // an outer `Conflict`.
        let quote = self
            .ctx
            .transact("proposal.accept", correlation_id, move |tx| {
                let actor = actor.clone();
                let quote_id = quote_id.clone();
                let proposal_id = proposal_id.clone();
                let payment_intent_id = payment_intent_id.clone();
                Box::pin(async move {
                    let mut quote: Quote = tx.require(&Quote::key_for(&quote_id), "quote").await?;
                    ensure_customer(&actor, &quote, "accept a proposal")?;
                    if let Some(held) = quote.payment_pending_proposal() {
                        if held.id != proposal_id {
                            return Ok(Err(ApplicationError::Conflict(format!(
                                "quote `{}` is {} for proposal `{}`, not `{proposal_id}`",
                                quote.id,
                                quote.status.as_str(),
                                held.id
                            ))));
                        }
                    }
                    let before = quote.clone();
                    quote.begin_payment(&proposal_id, payment_intent_id.clone())?;
                    if quote == before {
                        return Ok(Ok(quote));
                    }
                    tx.put(&quote)?;
                    tx.emit(DomainFact::ProposalPaymentPending {
                        quote_id: quote.id.clone(),
                        proposal_id,
                        payment_intent_id,
                    });
                    Ok(Ok(quote))
                })
            })
            .await??;

        info!(
            event_name = "ledger.proposal.payment_pending",
            correlation_id,
            quote_id = %quote.id,
            "proposal reserved for payment"
        );
        Ok(quote)
    }

    pub async fn reject_proposal(
        &self,
        actor: &Actor,
        quote_id: &QuoteId,
        proposal_id: &ProposalId,
        correlation_id: &str,
    ) -> Result<Quote, ApplicationError> {
        let actor = actor.clone();
        let quote_id = quote_id.clone();
        let proposal_id = proposal_id.clone();
        self.ctx
            .transact("proposal.reject", correlation_id, move |tx| {
                let actor = actor.clone();
                let quote_id = quote_id.clone();
                let proposal_id = proposal_id.clone();
                Box::pin(async move {
                    let mut quote: Quote = tx.require(&Quote::key_for(&quote_id), "quote").await?;
                    ensure_customer(&actor, &quote, "reject a proposal")?;
                    quote.reject_proposal(&proposal_id)?;
                    tx.put(&quote)?;
                    Ok(quote)
                })
            })
            .await
    }

    /// Abandons a payment reservation so the customer can pick another proposal.
    pub async fn release_payment(
        &self,
        actor: &Actor,
        quote_id: &QuoteId,
        proposal_id: &ProposalId,
        correlation_id: &str,
    ) -> Result<Quote, ApplicationError> {
        let actor = actor.clone();
        let quote_id = quote_id.clone();
        let proposal_id = proposal_id.clone();
        self.ctx
            .transact("proposal.release_payment", correlation_id, move |tx| {
                let actor = actor.clone();
                let quote_id = quote_id.clone();
                let proposal_id = proposal_id.clone();
                Box::pin(async move {
                    let mut quote: Quote = tx.require(&Quote::key_for(&quote_id), "quote").await?;
                    ensure_customer(&actor, &quote, "release a payment reservation")?;
                    quote.release_payment(&proposal_id)?;
                    tx.put(&quote)?;
                    Ok(quote)
                })
            })
            .await
    }

    pub async fn cancel_quote(
        &self,
        actor: &Actor,
        quote_id: &QuoteId,
        correlation_id: &str,
    ) -> Result<Quote, ApplicationError> {
        let actor = actor.clone();
        let quote_id = quote_id.clone();
        let quote = self
            .ctx
            .transact("quote.cancel", correlation_id, move |tx| {
                let actor = actor.clone();
                let quote_id = quote_id.clone();
                Box::pin(async move {
                    let mut quote: Quote = tx.require(&Quote::key_for(&quote_id), "quote").await?;
                    ensure_customer(&actor, &quote, "cancel the quote")?;
                    let expired_proposal_ids = quote.cancel()?;
                    tx.put(&quote)?;
                    tx.emit(DomainFact::QuoteCancelled {
                        quote_id: quote.id.clone(),
                        expired_proposal_ids,
                    });
                    Ok(quote)
                })
            })
            .await?;

        info!(event_name = "ledger.quote.cancelled", correlation_id, quote_id = %quote.id, "quote cancelled");
        Ok(quote)
    }

    /// Customers see their own quotes; providers see public quotes and direct quotes
    /// addressed to them.
    pub async fn get_quote(&self, actor: &Actor, quote_id: &QuoteId) -> Result<Quote, ApplicationError> {
        let quote: Quote = store::load(self.ctx.store().as_ref(), &Quote::key_for(quote_id))
            .await?
            .ok_or_else(|| ApplicationError::not_found("quote", quote_id))?;

        let visible = match actor.role {
            ActorRole::Operator | ActorRole::System => true,
            ActorRole::Customer => actor.is_customer(&quote.customer_id),
            ActorRole::Provider => match &quote.visibility {
                Visibility::Public => quote.status != QuoteStatus::Draft,
                Visibility::Direct { provider_id } => actor.is_provider(provider_id),
            },
        };
        if !visible {
            return Err(ApplicationError::forbidden(actor, format!("read quote `{quote_id}`")));
        }
        Ok(quote)
    }
}

fn ensure_customer(actor: &Actor, quote: &Quote, action: &str) -> Result<(), ApplicationError> {
    if actor.is_customer(&quote.customer_id) {
        Ok(())
    } else {
        Err(ApplicationError::forbidden(actor, action))
    }
}
