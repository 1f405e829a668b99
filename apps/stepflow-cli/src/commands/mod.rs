//! Command implementations

pub mod run;
pub mod show;

use anyhow::{Context, Result};
use stepflow_core::StackConfig;

use crate::cli::Args;

/// Resolve the stack configuration from the config file or the environment,
/// then apply command-line overrides
pub fn load_config(args: &Args) -> Result<StackConfig> {
    let config = match &args.config {
        Some(path) => StackConfig::load_from_file(&path.to_string_lossy())
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => StackConfig::load().context("Failed to load configuration from environment")?,
    };

    Ok(match &args.email {
        Some(email) => config.with_notification_email(email.clone()),
        None => config,
    })
}
