//! Stepflow CLI
//!
//! Runs the failure-routing stack locally: object-created notifications are
//! matched against the bucket rule, the job is invoked, and failures are
//! published to the notification topic.

mod cli;
mod commands;
mod output;
mod telemetry;

use clap::Parser;
use colored::Colorize;
use std::process::ExitCode;

use crate::cli::{Args, Command};

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();

    let args = Args::parse();

    if args.no_color {
        colored::control::set_override(false);
    }

    if let Err(e) = telemetry::init_telemetry(&args) {
        eprintln!("Error: {:#}", e);
        return ExitCode::FAILURE;
    }

    let result = match args.command.clone() {
        Command::Run { events, keys, cause } => {
            commands::run::run(&args, events.as_deref(), &keys, &cause).await
        }
        Command::Definition => commands::show::definition(&args),
        Command::Config => commands::show::config(&args),
    };

    match result {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Command failed");
            eprintln!("{}: {:#}", "Error".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}
