pub mod config;
pub mod context;
pub mod domain;
pub mod errors;
pub mod escrow;
pub mod facts;
pub mod orders;
pub mod processor;
pub mod quotes;
pub mod reconciler;
pub mod retry;
pub mod store;
pub mod time_tracking;
pub mod webhook;

pub use context::LedgerContext;
pub use domain::order::{Order, OrderId, OrderStatus};
pub use domain::payment::{EventDisposition, PaymentEvent, ProcessedEvent};
pub use domain::payout::{Payout, PayoutId, PayoutStatus};
pub use domain::quote::{Proposal, ProposalId, Quote, QuoteId, QuoteStatus};
pub use domain::{Actor, ActorRole, CompanyId, CustomerId};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use escrow::{EscrowService, PayoutResult};
pub use facts::{DomainFact, FactEnvelope, FactSink};
pub use orders::OrderService;
pub use processor::{PaymentProcessor, ProcessorIntent};
pub use quotes::QuoteService;
pub use reconciler::PaymentReconciler;
pub use retry::RetryPolicy;
pub use store::{InMemoryLedgerStore, LedgerStore, LedgerTransaction};
pub use time_tracking::TimeTrackingService;
pub use webhook::WebhookVerifier;
