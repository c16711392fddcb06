pub mod balance;
pub mod config;
pub mod doctor;
pub mod events;
pub mod migrate;

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use taskledger_core::config::{AppConfig, LoadOptions};
use taskledger_core::errors::ApplicationError;
use taskledger_core::escrow::EscrowService;
use taskledger_core::facts::TracingFactSink;
use taskledger_core::processor::DisabledPaymentProcessor;
use taskledger_core::reconciler::PaymentReconciler;
use taskledger_core::retry::RetryPolicy;
use taskledger_core::LedgerContext;
use taskledger_db::{connect_from_config, migrations, SqlLedgerStore};

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub exit_code: u8,
    pub output: String,
}

#[derive(Debug, Serialize)]
struct CommandOutcome {
    command: String,
    status: String,
    error_class: Option<String>,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

impl CommandResult {
    pub fn success(command: &str, message: impl Into<String>) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "ok".to_string(),
            error_class: None,
            message: message.into(),
            data: None,
        };
        Self { exit_code: 0, output: serialize_payload(payload) }
    }

    pub fn success_with<T: Serialize>(command: &str, message: impl Into<String>, data: &T) -> Self {
        match serde_json::to_value(data) {
            Ok(data) => {
                let payload = CommandOutcome {
                    command: command.to_string(),
                    status: "ok".to_string(),
                    error_class: None,
                    message: message.into(),
                    data: Some(data),
                };
                Self { exit_code: 0, output: serialize_payload(payload) }
            }
            Err(error) => Self::failure(command, "serialization", error.to_string(), 1),
        }
    }

    pub fn failure(
        command: &str,
        error_class: &str,
        message: impl Into<String>,
        exit_code: u8,
    ) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "error".to_string(),
            error_class: Some(error_class.to_string()),
            message: message.into(),
            data: None,
        };
        Self { exit_code, output: serialize_payload(payload) }
    }
}

fn serialize_payload(payload: CommandOutcome) -> String {
    serde_json::to_string(&payload).unwrap_or_else(|error| {
        format!(
            "{{\"command\":\"unknown\",\"status\":\"error\",\"error_class\":\"serialization\",\"message\":\"{}\"}}",
            error.to_string().replace('\\', "\\\\").replace('"', "\\\"")
        )
    })
}

/// Ledger services an operator command works through.
pub struct OperatorLedger {
    pub reconciler: PaymentReconciler,
    pub escrow: EscrowService,
}

/// Loads config, opens the store with pending migrations applied and runs `work` on a
/// current-thread runtime. Replays from the CLI route on event metadata alone.
pub(crate) fn with_ledger<T, F, Fut>(command: &str, message: &str, work: F) -> CommandResult
where
    T: Serialize,
    F: FnOnce(OperatorLedger) -> Fut,
    Fut: Future<Output = Result<T, ApplicationError>>,
{
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                command,
                "config_validation",
                format!("configuration issue: {error}"),
                2,
            );
        }
    };

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return CommandResult::failure(
                command,
                "runtime_init",
                format!("failed to initialize async runtime: {error}"),
                3,
            );
        }
    };

    let result = runtime.block_on(async {
        let pool = connect_from_config(&config.database)
            .await
            .map_err(|error| ("db_connectivity", error.to_string(), 4u8))?;
        migrations::run_pending(&pool)
            .await
            .map_err(|error| ("migration", error.to_string(), 5u8))?;

        let ctx = LedgerContext::new(
            Arc::new(SqlLedgerStore::new(pool.clone())),
            Arc::new(TracingFactSink),
            RetryPolicy::from_config(&config.ledger),
        );
        let ledger = OperatorLedger {
            reconciler: PaymentReconciler::new(ctx.clone(), Arc::new(DisabledPaymentProcessor)),
            escrow: EscrowService::new(ctx),
        };
        let outcome = work(ledger)
            .await
            .map_err(|error| (error.error_class(), error.to_string(), 6u8));
        pool.close().await;
        outcome
    });

    match result {
        Ok(data) => CommandResult::success_with(command, message, &data),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure(command, error_class, message, exit_code)
        }
    }
}
