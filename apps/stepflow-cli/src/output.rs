//! Output formatting utilities

use colored::{ColoredString, Colorize};
use serde::Serialize;
use stepflow_workflow::{ExecutionStatus, WorkflowExecution};
use tabled::Tabled;

/// Output format types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable tables
    Text,
    /// JSON format
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "plain" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            _ => Err(format!("Unknown format: {}", s)),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Text => write!(f, "text"),
            OutputFormat::Json => write!(f, "json"),
        }
    }
}

/// Print a serializable value as pretty JSON
pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Status text, green for success and red for failure
pub fn status(status: ExecutionStatus) -> ColoredString {
    let text = status.to_string();
    match status {
        ExecutionStatus::Succeeded => text.green().bold(),
        ExecutionStatus::Failed => text.red().bold(),
        ExecutionStatus::Running => text.yellow(),
    }
}

/// Print a dimmed message
pub fn dimmed(message: &str) {
    println!("{}", message.dimmed());
}

/// Print a section header
pub fn section(title: &str) {
    println!();
    println!("{}", title.bold().underline());
}

#[derive(Tabled)]
pub struct ExecutionRow {
    #[tabled(rename = "Execution")]
    pub id: String,
    #[tabled(rename = "Status")]
    pub status: ColoredString,
    #[tabled(rename = "Key")]
    pub key: String,
    #[tabled(rename = "State")]
    pub state: String,
    #[tabled(rename = "Error")]
    pub error: String,
}

impl From<&WorkflowExecution> for ExecutionRow {
    fn from(execution: &WorkflowExecution) -> Self {
        Self {
            id: execution.execution_id.clone(),
            status: status(execution.status),
            key: execution.input["detail"]["object"]["key"]
                .as_str()
                .unwrap_or("-")
                .to_string(),
            state: execution
                .visited_states()
                .last()
                .map(|s| s.to_string())
                .unwrap_or_default(),
            error: execution
                .error
                .as_ref()
                .map(|e| format!("{}: {}", e.error, e.cause))
                .unwrap_or_else(|| "-".to_string()),
        }
    }
}

#[derive(Tabled)]
pub struct SettingRow {
    #[tabled(rename = "Setting")]
    pub setting: String,
    #[tabled(rename = "Value")]
    pub value: String,
}

impl SettingRow {
    pub fn new(setting: &str, value: impl Into<String>) -> Self {
        Self {
            setting: setting.to_string(),
            value: value.into(),
        }
    }
}
