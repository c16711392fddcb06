use taskledger_core::domain::payment::EventId;
use taskledger_core::domain::Actor;

use crate::commands::{with_ledger, CommandResult};

pub fn parked() -> CommandResult {
    with_ledger("parked", "parked payment events", |ledger| async move {
        ledger.reconciler.list_parked().await
    })
}

pub fn replay(operator: &str, event_id: &str) -> CommandResult {
    let actor = Actor::operator(operator);
    let event_id = EventId::new(event_id);
    with_ledger("replay", "parked payment event replayed", |ledger| async move {
        ledger.reconciler.replay_parked(&actor, &event_id, "cli-replay").await
    })
}

pub fn dismiss(operator: &str, event_id: &str, note: &str) -> CommandResult {
    let actor = Actor::operator(operator);
    let event_id = EventId::new(event_id);
    let note = note.to_string();
    with_ledger("dismiss", "parked payment event dismissed", |ledger| async move {
        ledger.reconciler.dismiss_parked(&actor, &event_id, note, "cli-dismiss").await
    })
}
