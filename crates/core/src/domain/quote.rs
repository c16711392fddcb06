use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::order::OrderId;
use crate::domain::payment::PaymentIntentId;
use crate::domain::{CompanyId, Currency, CustomerId};
use crate::errors::DomainError;
use crate::store::{Document, DocumentKey};

string_id!(QuoteId, "quo");
string_id!(ProposalId, "prp");

pub const QUOTES: &str = "quotes";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Visibility {
    Public,
    Direct { provider_id: CompanyId },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuoteStatus {
    Draft,
    Published,
    Responded,
    PaymentPending,
    Accepted,
    Cancelled,
}

impl QuoteStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Published => "published",
            Self::Responded => "responded",
            Self::PaymentPending => "payment_pending",
            Self::Accepted => "accepted",
            Self::Cancelled => "cancelled",
        }
    }

    /// `PaymentPending -> Responded` is the only backwards edge: a failed or abandoned
    /// payment lets the customer fall back to another proposal.
    pub fn can_transition_to(&self, next: QuoteStatus) -> bool {
        matches!(
            (self, next),
            (Self::Draft, Self::Published)
                | (Self::Published, Self::Responded)
                | (Self::Responded, Self::PaymentPending)
                | (Self::PaymentPending, Self::Responded)
                | (Self::PaymentPending, Self::Accepted)
                | (Self::Draft, Self::Cancelled)
                | (Self::Published, Self::Cancelled)
                | (Self::Responded, Self::Cancelled)
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Pending,
    PaymentPending,
    Accepted,
    Rejected,
    Expired,
}

impl ProposalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::PaymentPending => "payment_pending",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
        }
    }

    pub fn can_transition_to(&self, next: ProposalStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::PaymentPending)
                | (Self::PaymentPending, Self::Pending)
                | (Self::PaymentPending, Self::Accepted)
                | (Self::Pending, Self::Accepted)
                | (Self::Pending, Self::Rejected)
                | (Self::PaymentPending, Self::Rejected)
                | (Self::Pending, Self::Expired)
        )
    }

    pub fn is_open(&self) -> bool {
        matches!(self, Self::Pending | Self::PaymentPending)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub id: ProposalId,
    pub provider_id: CompanyId,
    pub price_cents: i64,
    pub currency: Currency,
    pub quoted_hours: Decimal,
    pub hourly_rate_cents: i64,
    pub message: Option<String>,
    pub status: ProposalStatus,
    pub payment_intent_id: Option<PaymentIntentId>,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Proposal {
    fn transition_to(&mut self, next: ProposalStatus, action: &str) -> Result<(), DomainError> {
        if !self.status.can_transition_to(next) {
            return Err(DomainError::invalid_transition(
                "proposal",
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

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub id: QuoteId,
    pub customer_id: CustomerId,
    pub title: String,
    pub category: String,
    pub subcategory: Option<String>,
    pub visibility: Visibility,
    pub status: QuoteStatus,
    pub proposals: Vec<Proposal>,
    pub order_id: Option<OrderId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document for Quote {
    fn key(&self) -> DocumentKey {
        Self::key_for(&self.id)
    }
}

impl Quote {
    pub fn key_for(id: &QuoteId) -> DocumentKey {
        DocumentKey::new(QUOTES, id.as_str())
    }

    pub fn can_transition_to(&self, next: QuoteStatus) -> bool {
        self.status.can_transition_to(next)
    }

    pub fn transition_to(&mut self, next: QuoteStatus, action: &str) -> Result<(), DomainError> {
        if !self.can_transition_to(next) {
            return Err(DomainError::invalid_transition(
                "quote",
                &self.id,
                self.status.as_str(),
                action,
            ));
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn proposal(&self, id: &ProposalId) -> Option<&Proposal> {
        self.proposals.iter().find(|proposal| &proposal.id == id)
    }

    fn proposal_mut(&mut self, id: &ProposalId) -> Result<&mut Proposal, DomainError> {
        let quote_id = self.id.clone();
        self.proposals.iter_mut().find(|proposal| &proposal.id == id).ok_or_else(|| {
            DomainError::Validation(format!("proposal `{id}` does not belong to quote `{quote_id}`"))
        })
    }

    pub fn accepted_proposal(&self) -> Option<&Proposal> {
        self.proposals.iter().find(|proposal| proposal.status == ProposalStatus::Accepted)
    }

    pub fn payment_pending_proposal(&self) -> Option<&Proposal> {
        self.proposals.iter().find(|proposal| proposal.status == ProposalStatus::PaymentPending)
    }

    /// Adds a provider offer. Open quotes only, one open offer per company, and direct
    /// quotes accept offers from the targeted provider alone.
    pub fn add_proposal(&mut self, proposal: Proposal) -> Result<(), DomainError> {
        if !matches!(self.status, QuoteStatus::Published | QuoteStatus::Responded) {
            return Err(DomainError::invalid_transition(
                "quote",
                &self.id,
                self.status.as_str(),
                "receive proposals",
            ));
        }

        if let Visibility::Direct { provider_id } = &self.visibility {
            if provider_id != &proposal.provider_id {
                return Err(DomainError::Validation(format!(
                    "quote `{}` is addressed to provider `{provider_id}` only",
                    self.id
                )));
            }
        }

        let duplicate = self.proposals.iter().any(|existing| {
            existing.provider_id == proposal.provider_id && existing.status.is_open()
        });
        if duplicate {
            return Err(DomainError::Validation(format!(
                "provider `{}` already has an open proposal on quote `{}`",
                proposal.provider_id, self.id
            )));
        }

        if self.status == QuoteStatus::Published {
            self.transition_to(QuoteStatus::Responded, "receive proposals")?;
        }
        self.updated_at = Utc::now();
        self.proposals.push(proposal);
        Ok(())
    }

    /// Reserves a proposal for payment. Siblings stay `pending` so that a failed payment
    /// can fall back to one of them. Re-reserving the same proposal is a no-op.
    pub fn begin_payment(
        &mut self,
        proposal_id: &ProposalId,
        payment_intent_id: Option<PaymentIntentId>,
    ) -> Result<(), DomainError> {
        if let Some(pending) = self.payment_pending_proposal() {
            if &pending.id == proposal_id {
                let pending_intent = pending.payment_intent_id.clone();
                if let Some(intent) = payment_intent_id {
                    if pending_intent.as_ref().is_some_and(|existing| existing != &intent) {
                        return Err(DomainError::Validation(format!(
                            "proposal `{proposal_id}` is already awaiting payment intent `{}`",
                            pending_intent.map(|id| id.0).unwrap_or_default()
                        )));
                    }
                    self.proposal_mut(proposal_id)?.payment_intent_id = Some(intent);
                }
                return Ok(());
            }
            return Err(DomainError::invalid_transition(
                "quote",
                &self.id,
                format!("{} (proposal `{}`)", self.status.as_str(), pending.id),
                format!("start payment for proposal `{proposal_id}`"),
            ));
        }

        if !self.can_transition_to(QuoteStatus::PaymentPending) {
            return Err(DomainError::invalid_transition(
                "quote",
                &self.id,
                self.status.as_str(),
                format!("start payment for proposal `{proposal_id}`"),
            ));
        }

        let proposal = self.proposal_mut(proposal_id)?;
        proposal.transition_to(ProposalStatus::PaymentPending, "start payment")?;
        proposal.payment_intent_id = payment_intent_id;
        self.transition_to(QuoteStatus::PaymentPending, "start payment")
    }

    /// Returns a `payment_pending` proposal to `pending` after a failed or abandoned payment.
    pub fn release_payment(&mut self, proposal_id: &ProposalId) -> Result<(), DomainError> {
        let proposal = self.proposal_mut(proposal_id)?;
        if proposal.status != ProposalStatus::PaymentPending {
            return Err(DomainError::invalid_transition(
                "proposal",
                proposal_id,
                proposal.status.as_str(),
                "release a pending payment",
            ));
        }
        proposal.transition_to(ProposalStatus::Pending, "release a pending payment")?;
        proposal.payment_intent_id = None;
        self.transition_to(QuoteStatus::Responded, "release a pending payment")
    }

    /// Promotes the paid proposal to `accepted` and forces every sibling to `rejected`.
    /// Returns the ids of the rejected siblings.
    pub fn settle_acceptance(
        &mut self,
        proposal_id: &ProposalId,
        payment_intent_id: &PaymentIntentId,
        order_id: &OrderId,
    ) -> Result<Vec<ProposalId>, DomainError> {
        if !self.can_transition_to(QuoteStatus::Accepted) {
            // A capture can arrive for a proposal that was never reserved; reserve it first.
            if self.status == QuoteStatus::Responded {
                self.begin_payment(proposal_id, Some(payment_intent_id.clone()))?;
            } else {
                return Err(DomainError::invalid_transition(
                    "quote",
                    &self.id,
                    self.status.as_str(),
                    format!("accept proposal `{proposal_id}`"),
                ));
            }
        }

        let winner = self.proposal_mut(proposal_id)?;
        if let Some(reserved) = &winner.payment_intent_id {
            if reserved != payment_intent_id {
                return Err(DomainError::invalid_transition(
                    "proposal",
                    proposal_id,
                    format!("{} for intent `{reserved}`", winner.status.as_str()),
                    format!("settle payment intent `{payment_intent_id}`"),
                ));
            }
        }
        winner.transition_to(ProposalStatus::Accepted, "accept payment")?;
        winner.payment_intent_id = Some(payment_intent_id.clone());

        let mut rejected = Vec::new();
        for sibling in self.proposals.iter_mut().filter(|proposal| &proposal.id != proposal_id) {
            if sibling.status.is_open() {
                sibling.transition_to(ProposalStatus::Rejected, "reject sibling")?;
                rejected.push(sibling.id.clone());
            }
        }

        self.order_id = Some(order_id.clone());
        self.transition_to(QuoteStatus::Accepted, "accept payment")?;
        Ok(rejected)
    }

    pub fn reject_proposal(&mut self, proposal_id: &ProposalId) -> Result<(), DomainError> {
        if matches!(self.status, QuoteStatus::Accepted | QuoteStatus::Cancelled) {
            return Err(DomainError::invalid_transition(
                "quote",
                &self.id,
                self.status.as_str(),
                format!("reject proposal `{proposal_id}`"),
            ));
        }
        let proposal = self.proposal_mut(proposal_id)?;
        if proposal.status != ProposalStatus::Pending {
            return Err(DomainError::invalid_transition(
                "proposal",
                proposal_id,
                proposal.status.as_str(),
                "be rejected",
            ));
        }
        proposal.transition_to(ProposalStatus::Rejected, "be rejected")?;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Cancels the request. Open proposals expire. Not allowed while a payment is in flight.
    pub fn cancel(&mut self) -> Result<Vec<ProposalId>, DomainError> {
        self.transition_to(QuoteStatus::Cancelled, "be cancelled")?;
        let mut expired = Vec::new();
        for proposal in &mut self.proposals {
            if proposal.status == ProposalStatus::Pending {
                proposal.transition_to(ProposalStatus::Expired, "expire")?;
                expired.push(proposal.id.clone());
            }
        }
        Ok(expired)
    }
}
