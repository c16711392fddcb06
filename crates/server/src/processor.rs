//! HTTP client for the payment processor's intent lookup, used by the reconciler when
//! webhook metadata cannot be routed on its own.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use taskledger_core::config::PaymentsConfig;
use taskledger_core::domain::payment::PaymentIntentId;
use taskledger_core::errors::ApplicationError;
use taskledger_core::processor::{PaymentProcessor, ProcessorIntent};
use tracing::warn;

pub struct HttpPaymentProcessor {
    client: Client,
    base_url: String,
    api_key: Option<SecretString>,
}

impl HttpPaymentProcessor {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<SecretString>,
        timeout: Duration,
    ) -> Result<Self, ApplicationError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| ApplicationError::Configuration(format!("processor client: {error}")))?;
        Ok(Self { client, base_url: base_url.into().trim_end_matches('/').to_string(), api_key })
    }

    /// `None` when no processor endpoint is configured.
    pub fn from_config(config: &PaymentsConfig) -> Result<Option<Self>, ApplicationError> {
        config
            .processor_base_url
            .as_ref()
            .map(|base_url| {
                Self::new(
                    base_url.clone(),
                    config.processor_api_key.clone(),
                    Duration::from_millis(config.processor_timeout_ms),
                )
            })
            .transpose()
    }

    fn intent_url(&self, intent_id: &PaymentIntentId) -> String {
        format!("{}/v1/payment_intents/{}", self.base_url, intent_id)
    }
}

#[async_trait]
impl PaymentProcessor for HttpPaymentProcessor {
    async fn retrieve_intent(
        &self,
        intent_id: &PaymentIntentId,
    ) -> Result<ProcessorIntent, ApplicationError> {
        let mut request = self.client.get(self.intent_url(intent_id));
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key.expose_secret());
        }

        let response = request.send().await.map_err(|error| {
            warn!(
                event_name = "ledger.processor.request_failed",
                payment_intent_id = %intent_id,
                error = %error,
                "payment processor lookup failed"
            );
            ApplicationError::Integration(format!("processor lookup for `{intent_id}`: {error}"))
        })?;

        match response.status() {
            status if status.is_success() => {
                response.json::<ProcessorIntent>().await.map_err(|error| {
                    ApplicationError::Integration(format!(
                        "processor intent `{intent_id}` unreadable: {error}"
                    ))
                })
            }
            StatusCode::NOT_FOUND => Err(ApplicationError::not_found("payment intent", intent_id)),
            status => Err(ApplicationError::Integration(format!(
                "processor lookup for `{intent_id}` returned {status}"
            ))),
        }
    }
}
