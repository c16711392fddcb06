use std::env;
use std::sync::{Mutex, OnceLock};

use serde_json::Value;
use taskledger_core::domain::payout::PayoutStatus;
use taskledger_cli::commands::{balance, config, doctor, events, migrate};

const VALID_ENV: &[(&str, &str)] = &[
    ("TASKLEDGER_PAYMENTS_WEBHOOK_SECRET", "whsec_cli_test"),
    ("TASKLEDGER_DATABASE_URL", "sqlite::memory:"),
];

#[test]
fn migrate_returns_success_with_valid_env() {
    with_env(VALID_ENV, || {
        let result = migrate::run();
        assert_eq!(result.exit_code, 0, "expected successful migrate run: {}", result.output);

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "migrate");
        assert_eq!(payload["status"], "ok");
    });
}

#[test]
fn migrate_returns_config_failure_without_webhook_secret() {
    with_env(&[("TASKLEDGER_DATABASE_URL", "sqlite::memory:")], || {
        let result = migrate::run();
        assert_eq!(result.exit_code, 2, "expected config validation failure code");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["status"], "error");
        assert_eq!(payload["error_class"], "config_validation");
    });
}

#[test]
fn parked_lists_nothing_on_a_fresh_store() {
    with_env(VALID_ENV, || {
        let result = events::parked();
        assert_eq!(result.exit_code, 0, "{}", result.output);

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "parked");
        assert_eq!(payload["data"], Value::Array(Vec::new()));
    });
}

#[test]
fn replay_of_unknown_event_reports_not_found() {
    with_env(VALID_ENV, || {
        let result = events::replay("ops-1", "evt_missing");
        assert_eq!(result.exit_code, 6);

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "replay");
        assert_eq!(payload["error_class"], "not_found");
    });
}

#[test]
fn dismiss_requires_a_note() {
    with_env(VALID_ENV, || {
        let result = events::dismiss("ops-1", "evt_missing", "  ");
        assert_eq!(result.exit_code, 6);

        let payload = parse_payload(&result.output);
        assert_eq!(payload["error_class"], "validation");
    });
}

#[test]
fn balance_of_unknown_company_is_empty_and_consistent() {
    with_env(VALID_ENV, || {
        let result = balance::balance("cmp-none");
        assert_eq!(result.exit_code, 0, "{}", result.output);

        let payload = parse_payload(&result.output);
        assert_eq!(payload["data"]["held_cents"], 0);
        assert_eq!(payload["data"]["derived_cents"], 0);
        assert_eq!(payload["data"]["entry_count"], 0);
    });
}

#[test]
fn failed_payout_status_needs_a_reason() {
    with_env(VALID_ENV, || {
        let result = balance::payout_status("ops-1", "po_missing", PayoutStatus::Failed, None);
        assert_eq!(result.exit_code, 6, "{}", result.output);

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "payout-status");
        assert_eq!(payload["error_class"], "validation");
    });
}

#[test]
fn config_redacts_the_signing_secret() {
    with_env(VALID_ENV, || {
        let output = config::run();
        assert!(output.contains("payments.webhook_secret = whsec_*** (source: env"), "{output}");
        assert!(!output.contains("whsec_cli_test"));
    });
}

#[test]
fn doctor_reports_config_failure_as_json() {
    with_env(&[], || {
        let report: Value =
            serde_json::from_str(&doctor::run(true)).expect("doctor output should be JSON");
        assert_eq!(report["overall_status"], "fail");
        assert_eq!(report["checks"][0]["name"], "config_validation");
        assert_eq!(report["checks"][0]["status"], "fail");
    });
}

fn parse_payload(output: &str) -> Value {
    serde_json::from_str(output).expect("command output should be valid JSON")
}

fn with_env(vars: &[(&str, &str)], test_fn: impl FnOnce()) {
    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    let _guard =
        ENV_LOCK.get_or_init(|| Mutex::new(())).lock().expect("env mutex should not be poisoned");

    let keys = [
        "TASKLEDGER_DATABASE_URL",
        "TASKLEDGER_DATABASE_MAX_CONNECTIONS",
        "TASKLEDGER_DATABASE_TIMEOUT_SECS",
        "TASKLEDGER_SERVER_BIND_ADDRESS",
        "TASKLEDGER_SERVER_PORT",
        "TASKLEDGER_SERVER_GRACEFUL_SHUTDOWN_SECS",
        "TASKLEDGER_PAYMENTS_WEBHOOK_SECRET",
        "TASKLEDGER_PAYMENTS_SIGNATURE_TOLERANCE_SECS",
        "TASKLEDGER_PAYMENTS_PROCESSOR_BASE_URL",
        "TASKLEDGER_PAYMENTS_PROCESSOR_API_KEY",
        "TASKLEDGER_PAYMENTS_PROCESSOR_TIMEOUT_MS",
        "TASKLEDGER_LEDGER_RETRY_MAX_ATTEMPTS",
        "TASKLEDGER_LEDGER_RETRY_BASE_DELAY_MS",
        "TASKLEDGER_LEDGER_RETRY_MAX_DELAY_MS",
        "TASKLEDGER_LOGGING_LEVEL",
        "TASKLEDGER_LOGGING_FORMAT",
        "TASKLEDGER_LOG_LEVEL",
        "TASKLEDGER_LOG_FORMAT",
    ];

    let previous_values: Vec<(&str, Option<String>)> =
        keys.iter().map(|key| (*key, env::var(key).ok())).collect();

    for key in &keys {
        env::remove_var(key);
    }
    for (key, value) in vars {
        env::set_var(key, value);
    }

    test_fn();

    for (key, value) in previous_values {
        if let Some(value) = value {
            env::set_var(key, value);
        } else {
            env::remove_var(key);
        }
    }
}
