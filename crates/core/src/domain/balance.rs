use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::order::OrderId;
use crate::domain::payment::PaymentIntentId;
use crate::domain::payout::PayoutId;
use crate::domain::time_entry::{TimeEntryCategory, TimeEntryId};
use crate::domain::CompanyId;
use crate::store::{Document, DocumentKey};

string_id!(BalanceEntryId, "bal");
string_id!(AuditEntryId, "aud");

pub const COMPANIES: &str = "companies";

pub fn balance_history_collection(company_id: &CompanyId) -> String {
    format!("{COMPANIES}/{company_id}/balance_history")
}

pub fn ledger_audit_collection(company_id: &CompanyId) -> String {
    format!("{COMPANIES}/{company_id}/ledger_audit")
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceEntryKind {
    OrderPayment,
    AdditionalHoursPayment,
    PayoutReserved,
    PlatformCommission,
    PayoutReversed,
}

impl BalanceEntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OrderPayment => "order_payment",
            Self::AdditionalHoursPayment => "additional_hours_payment",
            Self::PayoutReserved => "payout_reserved",
            Self::PlatformCommission => "platform_commission",
            Self::PayoutReversed => "payout_reversed",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceEntryStatus {
    PlatformHeld,
    ReservedForPayout,
    Released,
}

/// Append-only movement of money held for a provider company. Amounts are signed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceHistoryEntry {
    pub id: BalanceEntryId,
    pub company_id: CompanyId,
    pub kind: BalanceEntryKind,
    pub amount_cents: i64,
    pub commission_cents: i64,
    pub payment_intent_id: Option<PaymentIntentId>,
    pub order_id: OrderId,
    pub payout_id: Option<PayoutId>,
    pub status: BalanceEntryStatus,
    pub created_at: DateTime<Utc>,
}

impl Document for BalanceHistoryEntry {
    fn key(&self) -> DocumentKey {
        DocumentKey::new(balance_history_collection(&self.company_id), self.id.as_str())
    }
}

/// Held balance counter, written only together with a balance history append.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanyBalance {
    pub company_id: CompanyId,
    pub held_cents: i64,
    pub entry_count: u64,
    pub updated_at: DateTime<Utc>,
}

impl Document for CompanyBalance {
    fn key(&self) -> DocumentKey {
        Self::key_for(&self.company_id)
    }
}

impl CompanyBalance {
    pub fn key_for(company_id: &CompanyId) -> DocumentKey {
        DocumentKey::new(COMPANIES, company_id.as_str())
    }

    pub fn empty(company_id: CompanyId) -> Self {
        Self { company_id, held_cents: 0, entry_count: 0, updated_at: Utc::now() }
    }

    pub fn apply(&mut self, entry: &BalanceHistoryEntry) {
        self.held_cents += entry.amount_cents;
        self.entry_count += 1;
        self.updated_at = entry.created_at;
    }
}

/// Counter next to the sum derived from the history it summarizes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanyBalanceView {
    pub company_id: CompanyId,
    pub held_cents: i64,
    pub derived_cents: i64,
    pub entry_count: u64,
    pub entries: Vec<BalanceHistoryEntry>,
}

impl CompanyBalanceView {
    pub fn is_consistent(&self) -> bool {
        self.held_cents == self.derived_cents && self.entry_count == self.entries.len() as u64
    }
}

/// Audit trail for manual corrections of a time entry category.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerAuditEntry {
    pub id: AuditEntryId,
    pub company_id: CompanyId,
    pub order_id: OrderId,
    pub time_entry_id: TimeEntryId,
    pub previous_category: TimeEntryCategory,
    pub new_category: TimeEntryCategory,
    pub previous_amount_cents: i64,
    pub new_amount_cents: i64,
    pub actor: String,
    pub reason: String,
    pub recorded_at: DateTime<Utc>,
}

impl Document for LedgerAuditEntry {
    fn key(&self) -> DocumentKey {
        DocumentKey::new(ledger_audit_collection(&self.company_id), self.id.as_str())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::{
        BalanceEntryId, BalanceEntryKind, BalanceEntryStatus, BalanceHistoryEntry, CompanyBalance,
        CompanyBalanceView,
    };
    use crate::domain::order::OrderId;
    use crate::domain::CompanyId;
    use crate::store::Document;

    fn entry(kind: BalanceEntryKind, amount_cents: i64) -> BalanceHistoryEntry {
        BalanceHistoryEntry {
            id: BalanceEntryId::generate(),
            company_id: CompanyId::new("cmp-1"),
            kind,
            amount_cents,
            commission_cents: 0,
            payment_intent_id: None,
            order_id: OrderId::new("O1"),
            payout_id: None,
            status: BalanceEntryStatus::PlatformHeld,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn history_lives_under_the_company() {
        let key = entry(BalanceEntryKind::OrderPayment, 100).key();
        assert_eq!(key.collection, "companies/cmp-1/balance_history");
    }

    #[test]
    fn counter_tracks_signed_entries() {
        let mut balance = CompanyBalance::empty(CompanyId::new("cmp-1"));
        let entries = vec![
            entry(BalanceEntryKind::OrderPayment, 40_000),
            entry(BalanceEntryKind::PayoutReserved, -36_000),
            entry(BalanceEntryKind::PlatformCommission, -4_000),
        ];
        for item in &entries {
            balance.apply(item);
        }

        let view = CompanyBalanceView {
            company_id: balance.company_id.clone(),
            held_cents: balance.held_cents,
            derived_cents: entries.iter().map(|item| item.amount_cents).sum(),
            entry_count: balance.entry_count,
            entries,
        };
        assert_eq!(view.held_cents, 0);
        assert!(view.is_consistent());
    }
}
