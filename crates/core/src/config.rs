use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub payments: PaymentsConfig,
    pub ledger: LedgerConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct PaymentsConfig {
    pub webhook_secret: SecretString,
    pub signature_tolerance_secs: u64,
    pub processor_base_url: Option<String>,
    pub processor_api_key: Option<SecretString>,
    pub processor_timeout_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LedgerConfig {
    pub retry_max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub server_port: Option<u16>,
    pub webhook_secret: Option<String>,
    pub processor_base_url: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self { retry_max_attempts: 8, retry_base_delay_ms: 25, retry_max_delay_ms: 1_000 }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://taskledger.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                graceful_shutdown_secs: 15,
            },
            payments: PaymentsConfig {
                webhook_secret: String::new().into(),
                signature_tolerance_secs: 300,
                processor_base_url: None,
                processor_api_key: None,
                processor_timeout_ms: 3_000,
            },
            ledger: LedgerConfig::default(),
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("taskledger.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(payments) = patch.payments {
            if let Some(webhook_secret) = payments.webhook_secret {
                self.payments.webhook_secret = secret_value(webhook_secret);
            }
            if let Some(tolerance) = payments.signature_tolerance_secs {
                self.payments.signature_tolerance_secs = tolerance;
            }
            if let Some(base_url) = payments.processor_base_url {
                self.payments.processor_base_url = Some(base_url);
            }
            if let Some(api_key) = payments.processor_api_key {
                self.payments.processor_api_key = Some(secret_value(api_key));
            }
            if let Some(timeout_ms) = payments.processor_timeout_ms {
                self.payments.processor_timeout_ms = timeout_ms;
            }
        }

        if let Some(ledger) = patch.ledger {
            if let Some(attempts) = ledger.retry_max_attempts {
                self.ledger.retry_max_attempts = attempts;
            }
            if let Some(base_delay) = ledger.retry_base_delay_ms {
                self.ledger.retry_base_delay_ms = base_delay;
            }
            if let Some(max_delay) = ledger.retry_max_delay_ms {
                self.ledger.retry_max_delay_ms = max_delay;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("TASKLEDGER_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("TASKLEDGER_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections =
                parse_u32("TASKLEDGER_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("TASKLEDGER_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("TASKLEDGER_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("TASKLEDGER_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("TASKLEDGER_SERVER_PORT") {
            self.server.port = parse_u16("TASKLEDGER_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("TASKLEDGER_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("TASKLEDGER_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        if let Some(value) = read_env("TASKLEDGER_PAYMENTS_WEBHOOK_SECRET") {
            self.payments.webhook_secret = secret_value(value);
        }
        if let Some(value) = read_env("TASKLEDGER_PAYMENTS_SIGNATURE_TOLERANCE_SECS") {
            self.payments.signature_tolerance_secs =
                parse_u64("TASKLEDGER_PAYMENTS_SIGNATURE_TOLERANCE_SECS", &value)?;
        }
        if let Some(value) = read_env("TASKLEDGER_PAYMENTS_PROCESSOR_BASE_URL") {
            self.payments.processor_base_url = Some(value);
        }
        if let Some(value) = read_env("TASKLEDGER_PAYMENTS_PROCESSOR_API_KEY") {
            self.payments.processor_api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("TASKLEDGER_PAYMENTS_PROCESSOR_TIMEOUT_MS") {
            self.payments.processor_timeout_ms =
                parse_u64("TASKLEDGER_PAYMENTS_PROCESSOR_TIMEOUT_MS", &value)?;
        }

        if let Some(value) = read_env("TASKLEDGER_LEDGER_RETRY_MAX_ATTEMPTS") {
            self.ledger.retry_max_attempts =
                parse_u32("TASKLEDGER_LEDGER_RETRY_MAX_ATTEMPTS", &value)?;
        }
        if let Some(value) = read_env("TASKLEDGER_LEDGER_RETRY_BASE_DELAY_MS") {
            self.ledger.retry_base_delay_ms =
                parse_u64("TASKLEDGER_LEDGER_RETRY_BASE_DELAY_MS", &value)?;
        }
        if let Some(value) = read_env("TASKLEDGER_LEDGER_RETRY_MAX_DELAY_MS") {
            self.ledger.retry_max_delay_ms =
                parse_u64("TASKLEDGER_LEDGER_RETRY_MAX_DELAY_MS", &value)?;
        }

        let log_level =
            read_env("TASKLEDGER_LOGGING_LEVEL").or_else(|| read_env("TASKLEDGER_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("TASKLEDGER_LOGGING_FORMAT").or_else(|| read_env("TASKLEDGER_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(port) = overrides.server_port {
            self.server.port = port;
        }
        if let Some(webhook_secret) = overrides.webhook_secret {
            self.payments.webhook_secret = secret_value(webhook_secret);
        }
        if let Some(base_url) = overrides.processor_base_url {
            self.payments.processor_base_url = Some(base_url);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_server(&self.server)?;
        validate_payments(&self.payments)?;
        validate_ledger(&self.ledger)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("taskledger.toml"), PathBuf::from("config/taskledger.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.port == 0 {
        return Err(ConfigError::Validation("server.port must be greater than zero".to_string()));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_payments(payments: &PaymentsConfig) -> Result<(), ConfigError> {
    let secret = payments.webhook_secret.expose_secret();
    if secret.is_empty() {
        return Err(ConfigError::Validation(
            "payments.webhook_secret is required. Copy the signing secret of the webhook endpoint from the processor dashboard".to_string(),
        ));
    }
    if !secret.starts_with("whsec_") {
        return Err(ConfigError::Validation(
            "payments.webhook_secret must start with `whsec_`".to_string(),
        ));
    }

    if payments.signature_tolerance_secs == 0 || payments.signature_tolerance_secs > 3_600 {
        return Err(ConfigError::Validation(
            "payments.signature_tolerance_secs must be in range 1..=3600".to_string(),
        ));
    }

    if payments.processor_timeout_ms == 0 || payments.processor_timeout_ms > 60_000 {
        return Err(ConfigError::Validation(
            "payments.processor_timeout_ms must be in range 1..=60000".to_string(),
        ));
    }

    if let Some(base_url) = &payments.processor_base_url {
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(ConfigError::Validation(
                "payments.processor_base_url must start with http:// or https://".to_string(),
            ));
        }
        let missing_key = payments
            .processor_api_key
            .as_ref()
            .map(|value| value.expose_secret().trim().is_empty())
            .unwrap_or(true);
        if missing_key {
            return Err(ConfigError::Validation(
                "payments.processor_api_key is required when processor_base_url is set"
                    .to_string(),
            ));
        }
    }

    Ok(())
}

fn validate_ledger(ledger: &LedgerConfig) -> Result<(), ConfigError> {
    if ledger.retry_max_attempts == 0 || ledger.retry_max_attempts > 50 {
        return Err(ConfigError::Validation(
            "ledger.retry_max_attempts must be in range 1..=50".to_string(),
        ));
    }

    if ledger.retry_base_delay_ms > ledger.retry_max_delay_ms {
        return Err(ConfigError::Validation(
            "ledger.retry_base_delay_ms must not exceed ledger.retry_max_delay_ms".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    server: Option<ServerPatch>,
    payments: Option<PaymentsPatch>,
    ledger: Option<LedgerPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct PaymentsPatch {
    webhook_secret: Option<String>,
    signature_tolerance_secs: Option<u64>,
    processor_base_url: Option<String>,
    processor_api_key: Option<String>,
    processor_timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LedgerPatch {
    retry_max_attempts: Option<u32>,
    retry_base_delay_ms: Option<u64>,
    retry_max_delay_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
