use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use thiserror::Error;

use crate::config::PaymentsConfig;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-payment-signature";

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature header is missing")]
    MissingHeader,
    #[error("signature header is malformed: {0}")]
    Malformed(String),
    #[error("signature timestamp is {age_secs}s away from now, outside the tolerance")]
    OutsideTolerance { age_secs: i64 },
    #[error("no signature matches the payload")]
    Mismatch,
}

/// Checks `t=<unix>,v1=<hex>` headers: HMAC-SHA256 over `"<t>.<body>"` with the endpoint
/// signing secret. Several `v1` entries may be present during secret rotation.
#[derive(Clone, Debug)]
pub struct WebhookVerifier {
    secret: SecretString,
    tolerance_secs: u64,
}

impl WebhookVerifier {
    pub fn new(secret: SecretString, tolerance_secs: u64) -> Self {
        Self { secret, tolerance_secs }
    }

    pub fn from_config(config: &PaymentsConfig) -> Self {
        Self::new(config.webhook_secret.clone(), config.signature_tolerance_secs)
    }

    pub fn verify(
        &self,
        header: Option<&str>,
        body: &[u8],
        now: DateTime<Utc>,
    ) -> Result<(), SignatureError> {
        let header = header.ok_or(SignatureError::MissingHeader)?;

        let mut timestamp = None;
        let mut signatures = Vec::new();
        for part in header.split(',') {
            let (name, value) = part
                .trim()
                .split_once('=')
                .ok_or_else(|| SignatureError::Malformed(format!("segment `{part}`")))?;
            match name {
                "t" => {
                    let parsed = value.parse::<i64>().map_err(|_| {
                        SignatureError::Malformed(format!("timestamp `{value}`"))
                    })?;
                    timestamp = Some(parsed);
                }
                "v1" => signatures.push(value),
                _ => {}
            }
        }

        let timestamp = timestamp.ok_or_else(|| SignatureError::Malformed("no `t=`".into()))?;
        if signatures.is_empty() {
            return Err(SignatureError::Malformed("no `v1=` signature".into()));
        }

        let age_secs = now.timestamp() - timestamp;
        if age_secs.unsigned_abs() > self.tolerance_secs {
            return Err(SignatureError::OutsideTolerance { age_secs });
        }

        for signature in signatures {
            let Ok(expected) = hex::decode(signature) else {
                continue;
            };
            if self.mac(timestamp, body)?.verify_slice(&expected).is_ok() {
                return Ok(());
            }
        }
        Err(SignatureError::Mismatch)
    }

    /// Produces a header the verifier accepts. Used by tests and local tooling.
    pub fn sign(&self, body: &[u8], timestamp: i64) -> Result<String, SignatureError> {
        let digest = self.mac(timestamp, body)?.finalize().into_bytes();
        Ok(format!("t={timestamp},v1={}", hex::encode(digest)))
    }

    fn mac(&self, timestamp: i64, body: &[u8]) -> Result<HmacSha256, SignatureError> {
        let mut mac = HmacSha256::new_from_slice(self.secret.expose_secret().as_bytes())
            .map_err(|_| SignatureError::Malformed("unusable signing secret".into()))?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(body);
        Ok(mac)
    }
}
