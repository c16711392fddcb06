//! Marketplace domain model: quotes and proposals, orders with their time tracking,
//! payment events, balance history and payouts.
//!
//! Every entity status is an enum with an explicit transition table. Money is always an
//! `i64` amount of minor currency units.

use serde::{Deserialize, Serialize};

use crate::errors::DomainError;

macro_rules! string_id {
    ($name:ident, $prefix:literal) => {
        #[derive(
            Clone,
            Debug,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Hash,
            ::serde::Serialize,
            ::serde::Deserialize,
        )]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn generate() -> Self {
                Self(format!("{}_{}", $prefix, ::uuid::Uuid::new_v4().simple()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

pub mod approval;
pub mod balance;
pub mod order;
pub mod payment;
pub mod payout;
pub mod quote;
pub mod time_entry;

string_id!(CustomerId, "cus");
string_id!(CompanyId, "cmp");

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorRole {
    Customer,
    Provider,
    Operator,
    System,
}

impl ActorRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Customer => "customer",
            Self::Provider => "provider",
            Self::Operator => "operator",
            Self::System => "system",
        }
    }
}

/// Identity of whoever issued a command. Authentication happens upstream; the core only
/// checks that the actor is a party to the entity it touches.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    pub role: ActorRole,
}

impl Actor {
    pub fn customer(id: impl Into<String>) -> Self {
        Self { id: id.into(), role: ActorRole::Customer }
    }

    pub fn provider(id: impl Into<String>) -> Self {
        Self { id: id.into(), role: ActorRole::Provider }
    }

    pub fn operator(id: impl Into<String>) -> Self {
        Self { id: id.into(), role: ActorRole::Operator }
    }

    pub fn is_operator(&self) -> bool {
        matches!(self.role, ActorRole::Operator | ActorRole::System)
    }

    pub fn is_customer(&self, customer_id: &CustomerId) -> bool {
        self.is_operator() || (self.role == ActorRole::Customer && self.id == customer_id.0)
    }

    pub fn is_provider(&self, company_id: &CompanyId) -> bool {
        self.is_operator() || (self.role == ActorRole::Provider && self.id == company_id.0)
    }
}

impl std::fmt::Display for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.role.as_str(), self.id)
    }
}

/// ISO 4217 currency code, normalized to upper case.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Currency(pub String);

impl Currency {
    pub fn parse(code: &str) -> Result<Self, DomainError> {
        let normalized = code.trim().to_ascii_uppercase();
        if normalized.len() != 3 || !normalized.chars().all(|ch| ch.is_ascii_alphabetic()) {
            return Err(DomainError::Validation(format!(
                "currency must be a three letter ISO code, got `{code}`"
            )));
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Processor payloads carry lower case codes; compare without allocating.
    pub fn matches(&self, code: &str) -> bool {
        self.0.eq_ignore_ascii_case(code.trim())
    }
}

impl std::fmt::Display for Currency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
