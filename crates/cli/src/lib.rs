pub mod commands;

use clap::{Parser, Subcommand, ValueEnum};
use std::process::ExitCode;
use taskledger_core::domain::payout::PayoutStatus;

#[derive(Debug, Parser)]
#[command(
    name = "taskledger",
    about = "Taskledger operator CLI",
    long_about = "Operate the taskledger store: migrations, config inspection, readiness checks, parked payment events and balances.",
    after_help = "Examples:\n  taskledger doctor --json\n  taskledger parked\n  taskledger replay evt_123 --operator ops-1"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config, processor lookup, DB connectivity and ledger schema")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "List payment events parked for operator review")]
    Parked,
    #[command(about = "Re-run a parked payment event from its stored payload")]
    Replay {
        event_id: String,
        #[arg(long, default_value = "operator-cli")]
        operator: String,
    },
    #[command(about = "Close a parked payment event without applying it")]
    Dismiss {
        event_id: String,
        #[arg(long, help = "Why the event is dismissed")]
        note: String,
        #[arg(long, default_value = "operator-cli")]
        operator: String,
    },
    #[command(about = "Show a provider company's held balance next to its history")]
    Balance { company_id: String },
    #[command(about = "Move a payout through processing, paid or failed")]
    PayoutStatus {
        payout_id: String,
        #[arg(value_enum)]
        status: PayoutStatusArg,
        #[arg(long, help = "Required when the payout failed")]
        failure_reason: Option<String>,
        #[arg(long, default_value = "operator-cli")]
        operator: String,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum PayoutStatusArg {
    Processing,
    Paid,
    Failed,
}

impl From<PayoutStatusArg> for PayoutStatus {
    fn from(value: PayoutStatusArg) -> Self {
        match value {
            PayoutStatusArg::Processing => Self::Processing,
            PayoutStatusArg::Paid => Self::Paid,
            PayoutStatusArg::Failed => Self::Failed,
        }
    }
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Doctor { json } => {
            commands::CommandResult { exit_code: 0, output: commands::doctor::run(json) }
        }
        Command::Parked => commands::events::parked(),
        Command::Replay { event_id, operator } => commands::events::replay(&operator, &event_id),
        Command::Dismiss { event_id, note, operator } => {
            commands::events::dismiss(&operator, &event_id, &note)
        }
        Command::Balance { company_id } => commands::balance::balance(&company_id),
        Command::PayoutStatus { payout_id, status, failure_reason, operator } => {
            commands::balance::payout_status(&operator, &payout_id, status.into(), failure_reason)
        }
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
