use std::sync::Arc;
use std::time::Duration;

use taskledger_core::config::{AppConfig, ConfigError, LoadOptions};
use taskledger_core::errors::ApplicationError;
use taskledger_core::facts::TracingFactSink;
use taskledger_core::processor::{DisabledPaymentProcessor, PaymentProcessor};
use taskledger_core::retry::RetryPolicy;
use taskledger_core::webhook::WebhookVerifier;
use taskledger_core::LedgerContext;
use taskledger_db::{connect_from_config, migrations, DbPool, SqlLedgerStore};
use thiserror::Error;
use tracing::info;

use crate::api::ApiState;
use crate::processor::HttpPaymentProcessor;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub state: ApiState,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("payment processor client could not be built: {0}")]
    Processor(#[source] ApplicationError),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let db_pool =
        connect_from_config(&config.database).await.map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let ctx = LedgerContext::new(
        Arc::new(SqlLedgerStore::new(db_pool.clone())),
        Arc::new(TracingFactSink),
        RetryPolicy::from_config(&config.ledger),
    );
    let processor: Arc<dyn PaymentProcessor> =
        match HttpPaymentProcessor::from_config(&config.payments).map_err(BootstrapError::Processor)? {
            Some(processor) => Arc::new(processor),
            None => Arc::new(DisabledPaymentProcessor),
        };
    info!(
        event_name = "system.bootstrap.processor_configured",
        correlation_id = "bootstrap",
        processor = if config.payments.processor_base_url.is_some() { "http" } else { "disabled" },
        "payment processor lookup configured"
    );

    let state = ApiState::new(
        ctx,
        processor,
        Duration::from_millis(config.payments.processor_timeout_ms),
        WebhookVerifier::from_config(&config.payments),
    );

    Ok(Application { config, db_pool, state })
}

#[cfg(test)]
mod tests {
    use taskledger_core::config::{ConfigOverrides, LoadOptions};
    use taskledger_core::domain::quote::Visibility;
    use taskledger_core::domain::Actor;
    use taskledger_core::quotes::QuoteDraft;

    use crate::bootstrap::bootstrap;

    #[tokio::test]
    async fn bootstrap_fails_fast_without_webhook_secret() {
        let result = bootstrap(LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some("sqlite::memory:".to_string()),
                webhook_secret: Some("not-a-signing-secret".to_string()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        })
        .await;

        assert!(result.is_err());
        let message = result.err().expect("error").to_string();
        assert!(message.contains("payments.webhook_secret"), "{message}");
    }

    #[tokio::test]
    async fn bootstrap_applies_migrations_and_wires_the_ledger() {
        let app = bootstrap(valid_overrides("sqlite::memory:")).await.expect("bootstrap");

        let (table_count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'ledger_document'",
        )
        .fetch_one(&app.db_pool)
        .await
        .expect("schema query");
        assert_eq!(table_count, 1);

        let customer = Actor::customer("cus-boot");
        let quote = app
            .state
            .quotes
            .create_quote(
                &customer,
                QuoteDraft {
                    title: "Garden fence".to_string(),
                    category: "garden".to_string(),
                    subcategory: None,
                    visibility: Visibility::Public,
                },
                "bootstrap-test",
            )
            .await
            .expect("quote is stored through the sqlite ledger");
        let stored = app.state.quotes.get_quote(&customer, &quote.id).await.expect("read back");
        assert_eq!(stored.title, "Garden fence");

        app.db_pool.close().await;
    }

    fn valid_overrides(database_url: &str) -> LoadOptions {
        LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some(database_url.to_string()),
                webhook_secret: Some("whsec_test".to_string()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        }
    }
}
