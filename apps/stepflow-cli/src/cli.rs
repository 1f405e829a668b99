//! Command-line argument parsing

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::output::OutputFormat;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "stepflow",
    about = "Failure-routing workflow runner",
    version,
    long_about = "Replays object-created notifications through the trigger rule and \
                  state machine, invoking the job and notifying the topic on failure."
)]
pub struct Args {
    /// Path to a stack configuration file (TOML, YAML or JSON)
    #[arg(short, long, env = "STEPFLOW_CONFIG")]
    pub config: Option<PathBuf>,

    /// Subscription email address for failure notifications
    #[arg(short, long, env = "STEPFLOW_EMAIL")]
    pub email: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        short,
        long,
        env = "LOG_LEVEL",
        default_value = "info",
        value_parser = ["trace", "debug", "info", "warn", "error"]
    )]
    pub log_level: String,

    /// Enable JSON log format
    #[arg(long, env = "JSON_LOGS")]
    pub json_logs: bool,

    /// Output format (text, json)
    #[arg(short, long, default_value = "text")]
    pub format: OutputFormat,

    /// Disable colored output
    #[arg(long, env = "NO_COLOR")]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Deliver trigger events and run the executions they start
    Run {
        /// File with a JSON array or one JSON event per line; stdin if omitted
        #[arg(short, long)]
        events: Option<PathBuf>,

        /// Object keys to deliver as object-created events for the configured bucket
        #[arg(short, long = "key")]
        keys: Vec<String>,

        /// Cause reported by the placeholder job
        #[arg(long, default_value = "placeholder job is not implemented")]
        cause: String,
    },

    /// Print the state machine definition
    Definition,

    /// Print the resolved stack configuration and resource identifiers
    Config,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_parse_run_with_keys() {
        let args = Args::parse_from(["stepflow", "run", "--key", "a.txt", "--key", "b.csv"]);
        match args.command {
            Command::Run { keys, events, .. } => {
                assert_eq!(keys, vec!["a.txt", "b.csv"]);
                assert!(events.is_none());
            }
            _ => panic!("expected run"),
        }
        assert_eq!(args.format, OutputFormat::Text);
        assert!(!args.no_color);
    }

    #[test]
    fn test_parse_format() {
        let args = Args::parse_from(["stepflow", "--format", "json", "--no-color", "config"]);
        assert_eq!(args.format, OutputFormat::Json);
        assert!(args.no_color);

        assert!(Args::try_parse_from(["stepflow", "--format", "xml", "config"]).is_err());
    }
}
