pub mod connection;
pub mod ledger_store;
pub mod migrations;

pub use connection::{connect, connect_from_config, connect_with_settings, ping, DbPool};
pub use ledger_store::SqlLedgerStore;
