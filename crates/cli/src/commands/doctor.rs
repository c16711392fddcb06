use std::sync::Arc;

use serde::Serialize;
use taskledger_core::config::{AppConfig, LoadOptions};
use taskledger_core::escrow::EscrowService;
use taskledger_core::LedgerContext;
use taskledger_db::{connect_from_config, migrations, ping, DbPool, SqlLedgerStore};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CheckStatus {
    Pass,
    Warn,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    name: &'static str,
    status: CheckStatus,
    details: String,
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    overall_status: CheckStatus,
    summary: String,
    checks: Vec<DoctorCheck>,
}

pub fn run(json_output: bool) -> String {
    let report = build_report();

    if json_output {
        return serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            format!(
                "{{\"overall_status\":\"fail\",\"summary\":\"doctor serialization failed\",\"error\":\"{}\"}}",
                escape_json(&error.to_string())
            )
        });
    }

    render_human(&report)
}

fn build_report() -> DoctorReport {
    let mut checks = Vec::new();

    match AppConfig::load(LoadOptions::default()) {
        Ok(config) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Pass,
                details: "configuration loaded and validated".to_string(),
            });
            checks.push(check_processor_lookup(&config));
            checks.extend(check_ledger_store(&config));
        }
        Err(error) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Fail,
                details: error.to_string(),
            });
            for name in
                ["processor_lookup", "database_connectivity", "ledger_schema", "balance_integrity"]
            {
                checks.push(DoctorCheck {
                    name,
                    status: CheckStatus::Skipped,
                    details: "skipped because configuration did not load".to_string(),
                });
            }
        }
    }

    let failed = checks
        .iter()
        .any(|check| matches!(check.status, CheckStatus::Fail | CheckStatus::Skipped));
    let overall_status = if failed { CheckStatus::Fail } else { CheckStatus::Pass };
    let summary = if failed {
        "doctor: one or more readiness checks failed".to_string()
    } else {
        "doctor: all readiness checks passed".to_string()
    };

    DoctorReport { overall_status, summary, checks }
}

fn check_processor_lookup(config: &AppConfig) -> DoctorCheck {
    match &config.payments.processor_base_url {
        Some(base_url) => DoctorCheck {
            name: "processor_lookup",
            status: CheckStatus::Pass,
            details: format!("ambiguous events are resolved through `{base_url}`"),
        },
        None => DoctorCheck {
            name: "processor_lookup",
            status: CheckStatus::Warn,
            details: "no processor endpoint; events without routable metadata will park"
                .to_string(),
        },
    }
}

fn check_ledger_store(config: &AppConfig) -> Vec<DoctorCheck> {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return vec![DoctorCheck {
                name: "database_connectivity",
                status: CheckStatus::Fail,
                details: format!("failed to initialize async runtime: {error}"),
            }];
        }
    };

    runtime.block_on(async {
        let pool = match connect_from_config(&config.database).await {
            Ok(pool) => pool,
            Err(error) => {
                return vec![
                    DoctorCheck {
                        name: "database_connectivity",
                        status: CheckStatus::Fail,
                        details: format!("failed to connect to database: {error}"),
                    },
                    skipped("ledger_schema", "the database is unreachable"),
                    skipped("balance_integrity", "the database is unreachable"),
                ];
            }
        };

        let connectivity = match ping(&pool).await {
            Ok(()) => DoctorCheck {
                name: "database_connectivity",
                status: CheckStatus::Pass,
                details: format!("connected using `{}`", config.database.url),
            },
            Err(error) => DoctorCheck {
                name: "database_connectivity",
                status: CheckStatus::Fail,
                details: format!("database query failed: {error}"),
            },
        };
        let schema = check_schema(&pool).await;
        let integrity = if schema.status == CheckStatus::Pass {
            check_balance_integrity(&pool).await
        } else {
            skipped("balance_integrity", "the ledger schema is not current")
        };
        pool.close().await;
        vec![connectivity, schema, integrity]
    })
}

fn skipped(name: &'static str, reason: &str) -> DoctorCheck {
    DoctorCheck { name, status: CheckStatus::Skipped, details: format!("skipped because {reason}") }
}

/// Every company counter must equal the sum of its balance history.
async fn check_balance_integrity(pool: &DbPool) -> DoctorCheck {
    let ctx = LedgerContext::with_store(Arc::new(SqlLedgerStore::new(pool.clone())));
    match EscrowService::new(ctx).inconsistent_balances().await {
        Ok(mismatched) if mismatched.is_empty() => DoctorCheck {
            name: "balance_integrity",
            status: CheckStatus::Pass,
            details: "company counters match their balance history".to_string(),
        },
        Ok(mismatched) => {
            let companies: Vec<String> = mismatched
                .iter()
                .map(|view| {
                    format!(
                        "{} (held {}, derived {})",
                        view.company_id, view.held_cents, view.derived_cents
                    )
                })
                .collect();
            DoctorCheck {
                name: "balance_integrity",
                status: CheckStatus::Fail,
                details: format!("counter drift: {}", companies.join(", ")),
            }
        }
        Err(error) => DoctorCheck {
            name: "balance_integrity",
            status: CheckStatus::Fail,
            details: format!("balance audit failed: {error}"),
        },
    }
}

async fn check_schema(pool: &DbPool) -> DoctorCheck {
    let known = migrations::MIGRATOR.iter().count() as i64;
    let applied = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM _sqlx_migrations WHERE success = 1",
    )
    .fetch_one(pool)
    .await;

    match applied {
        Ok(applied) if applied >= known => DoctorCheck {
            name: "ledger_schema",
            status: CheckStatus::Pass,
            details: format!("{applied} of {known} migrations applied"),
        },
        Ok(applied) => DoctorCheck {
            name: "ledger_schema",
            status: CheckStatus::Fail,
            details: format!("{applied} of {known} migrations applied; run `taskledger migrate`"),
        },
        Err(_) => DoctorCheck {
            name: "ledger_schema",
            status: CheckStatus::Fail,
            details: "ledger schema missing; run `taskledger migrate`".to_string(),
        },
    }
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = Vec::new();
    lines.push(report.summary.clone());

    for check in &report.checks {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Warn => "warn",
            CheckStatus::Fail => "fail",
            CheckStatus::Skipped => "skip",
        };
        lines.push(format!("- [{marker}] {}: {}", check.name, check.details));
    }

    lines.join("\n")
}

fn escape_json(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
