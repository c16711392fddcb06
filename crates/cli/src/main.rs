use std::process::ExitCode;

fn main() -> ExitCode {
    taskledger_cli::run()
}
