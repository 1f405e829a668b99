//! Event replay through the local stack

use anyhow::{Context, Result};
use serde_json::Value;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use stepflow_workflow::{InMemoryTopic, PlaceholderJob, Stack, TriggerEvent};
use tabled::{Table, Tabled};

use super::load_config;
use crate::cli::Args;
use crate::output::{self, ExecutionRow, OutputFormat};

pub async fn run(args: &Args, events: Option<&Path>, keys: &[String], cause: &str) -> Result<()> {
    let config = load_config(args)?;

    let job = Arc::new(PlaceholderJob::failing_with("Exception", cause));
    let topic = Arc::new(InMemoryTopic::new(
        &config.topic_name,
        &config.topic_display_name,
    ));
    if let Some(email) = &config.notification_email {
        topic.subscribe_email(email.clone()).await;
    }
    let stack = Stack::new(config, job.clone(), topic.clone()).await?;

    let mut batch: Vec<TriggerEvent> = keys.iter().map(|key| stack.object_created(key)).collect();
    if events.is_some() || keys.is_empty() {
        batch.extend(read_events(events)?);
    }

    let mut executions = Vec::new();
    for event in batch {
        let started = stack.deliver(event).await?;
        if started.is_empty() {
            tracing::info!("Event matched no rule");
        }
        executions.extend(started);
    }

    let messages = topic.messages().await;
    tracing::info!(
        executions = executions.len(),
        invocations = job.invocation_count(),
        notifications = messages.len(),
        "Replay finished"
    );

    match args.format {
        OutputFormat::Json => output::print_json(&serde_json::json!({
            "executions": executions,
            "notifications": messages,
            "deliveries": topic.deliveries().await,
        })),
        OutputFormat::Text => {
            if executions.is_empty() {
                output::dimmed("No executions started.");
                return Ok(());
            }

            let rows: Vec<ExecutionRow> = executions.iter().map(ExecutionRow::from).collect();
            println!("{}", Table::new(rows));

            if !messages.is_empty() {
                output::section("Notifications");
                let rows: Vec<NotificationRow> = messages
                    .iter()
                    .map(|m| NotificationRow {
                        topic: m.topic_name.clone(),
                        message: m.message.clone(),
                    })
                    .collect();
                println!("{}", Table::new(rows));
            }
            Ok(())
        }
    }
}

#[derive(Tabled)]
struct NotificationRow {
    #[tabled(rename = "Topic")]
    topic: String,
    #[tabled(rename = "Message")]
    message: String,
}

/// Read events from a file or stdin: either a JSON array or one document per line
fn read_events(path: Option<&Path>) -> Result<Vec<TriggerEvent>> {
    let raw = match path {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read events from {}", path.display()))?,
        None => {
            let mut buffer = String::new();
            std::io::stdin()
                .read_to_string(&mut buffer)
                .context("Failed to read events from stdin")?;
            buffer
        }
    };

    parse_events(&raw)
}

fn parse_events(raw: &str) -> Result<Vec<TriggerEvent>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    let documents: Vec<Value> = if trimmed.starts_with('[') {
        serde_json::from_str(trimmed).context("Events file is not a JSON array")?
    } else {
        trimmed
            .lines()
            .filter(|line| !line.trim().is_empty())
            .enumerate()
            .map(|(i, line)| {
                serde_json::from_str(line).with_context(|| format!("Invalid event on line {}", i + 1))
            })
            .collect::<Result<_>>()?
    };

    documents
        .into_iter()
        .map(|document| TriggerEvent::from_document(document).map_err(Into::into))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_json_array() {
        let raw = r#"[{"source": "aws.s3", "detail-type": "Object Created"}, {"source": "aws.s3"}]"#;
        let events = parse_events(raw).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].detail_type(), Some("Object Created"));
    }

    #[test]
    fn test_parse_json_lines() {
        let raw = "{\"source\": \"aws.s3\"}\n\n{\"source\": \"custom\"}\n";
        let events = parse_events(raw).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].source(), Some("custom"));
    }

    #[test]
    fn test_parse_rejects_non_objects() {
        assert!(parse_events("[1, 2]").is_err());
        assert!(parse_events("not json").is_err());
        assert!(parse_events("   ").unwrap().is_empty());
    }
}
