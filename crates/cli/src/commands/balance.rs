use taskledger_core::domain::payout::{PayoutId, PayoutStatus};
use taskledger_core::domain::{Actor, CompanyId};

use crate::commands::{with_ledger, CommandResult};

pub fn balance(company_id: &str) -> CommandResult {
    let company_id = CompanyId::new(company_id);
    with_ledger("balance", "company balance", |ledger| async move {
        ledger.escrow.company_balance(&company_id).await
    })
}

pub fn payout_status(
    operator: &str,
    payout_id: &str,
    status: PayoutStatus,
    failure_reason: Option<String>,
) -> CommandResult {
    let actor = Actor::operator(operator);
    let payout_id = PayoutId::new(payout_id);
    with_ledger("payout-status", "payout status updated", |ledger| async move {
        ledger
            .escrow
            .update_payout_status(&actor, &payout_id, status, failure_reason, "cli-payout")
            .await
    })
}
