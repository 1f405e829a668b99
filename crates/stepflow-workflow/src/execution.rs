//! Workflow execution records and history

use crate::state::{ErrorDocument, StateId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Status of a workflow execution
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Running,
    Succeeded,
    Failed,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionStatus::Succeeded | ExecutionStatus::Failed)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionStatus::Running => write!(f, "RUNNING"),
            ExecutionStatus::Succeeded => write!(f, "SUCCEEDED"),
            ExecutionStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// What happened at one point of an execution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HistoryEventKind {
    ExecutionStarted { input: Value },
    StateEntered { state: String, input: Value },
    TaskSucceeded { state: String, output: Value },
    TaskFailed { state: String, error: ErrorDocument, attempt: u32 },
    TaskRetryScheduled { state: String, attempt: u32, delay_ms: u64 },
    CatchMatched { state: String, next: String },
    StateExited { state: String },
    ExecutionSucceeded { output: Value },
    ExecutionFailed { error: Option<ErrorDocument> },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryEvent {
    pub id: u32,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: HistoryEventKind,
}

/// One run of the state machine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub execution_id: String,
    pub execution_arn: String,
    pub state_machine: String,
    /// State the execution is in, or the terminal state it stopped at
    pub current_state: StateId,
    pub input: Value,
    pub output: Option<Value>,
    pub error: Option<ErrorDocument>,
    pub status: ExecutionStatus,
    pub history: Vec<HistoryEvent>,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
}

impl WorkflowExecution {
    pub fn new(
        execution_id: impl Into<String>,
        execution_arn: impl Into<String>,
        state_machine: impl Into<String>,
        start_at: StateId,
        input: Value,
    ) -> Self {
        let mut execution = Self {
            execution_id: execution_id.into(),
            execution_arn: execution_arn.into(),
            state_machine: state_machine.into(),
            current_state: start_at,
            input: input.clone(),
            output: None,
            error: None,
            status: ExecutionStatus::Running,
            history: Vec::new(),
            started_at: Utc::now(),
            stopped_at: None,
        };
        execution.record(HistoryEventKind::ExecutionStarted { input });
        execution
    }

    pub fn record(&mut self, kind: HistoryEventKind) {
        let id = self.history.len() as u32 + 1;
        self.history.push(HistoryEvent {
            id,
            timestamp: Utc::now(),
            kind,
        });
    }

    pub fn enter(&mut self, state: StateId, name: &str, input: &Value) {
        self.current_state = state;
        self.record(HistoryEventKind::StateEntered {
            state: name.to_string(),
            input: input.clone(),
        });
    }

    pub fn succeed(&mut self, output: Value) {
        self.status = ExecutionStatus::Succeeded;
        self.output = Some(output.clone());
        self.stopped_at = Some(Utc::now());
        self.record(HistoryEventKind::ExecutionSucceeded { output });
    }

    pub fn fail(&mut self, error: Option<ErrorDocument>) {
        self.status = ExecutionStatus::Failed;
        self.error = error.clone();
        self.stopped_at = Some(Utc::now());
        self.record(HistoryEventKind::ExecutionFailed { error });
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Names of the states entered, in order
    pub fn visited_states(&self) -> Vec<&str> {
        self.history
            .iter()
            .filter_map(|event| match &event.kind {
                HistoryEventKind::StateEntered { state, .. } => Some(state.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.stopped_at
            .map(|stopped| (stopped - self.started_at).num_milliseconds())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_display_matches_serialized_form() {
        for status in [
            ExecutionStatus::Running,
            ExecutionStatus::Succeeded,
            ExecutionStatus::Failed,
        ] {
            assert_eq!(serde_json::to_value(status).unwrap(), json!(status.to_string()));
        }
    }

    #[test]
    fn test_new_execution_is_running() {
        let execution = WorkflowExecution::new("e1", "arn:e1", "sm", StateId::SubmitJob, json!({"a": 1}));

        assert_eq!(execution.status, ExecutionStatus::Running);
        assert!(!execution.is_terminal());
        assert_eq!(execution.history.len(), 1);
        assert!(matches!(
            execution.history[0].kind,
            HistoryEventKind::ExecutionStarted { .. }
        ));
    }

    #[test]
    fn test_fail_and_history_ids() {
        let mut execution = WorkflowExecution::new("e1", "arn:e1", "sm", StateId::SubmitJob, json!({}));
        execution.enter(StateId::SubmitJob, "CdkSubmitJob", &json!({}));
        execution.enter(StateId::TaskFailed, "TaskFailed", &json!({}));
        execution.fail(None);

        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.current_state, StateId::TaskFailed);
        assert_eq!(execution.visited_states(), vec!["CdkSubmitJob", "TaskFailed"]);
        let ids: Vec<u32> = execution.history.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
        assert!(execution.duration_ms().is_some());
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(
            serde_json::to_value(ExecutionStatus::Succeeded).unwrap(),
            json!("SUCCEEDED")
        );
    }
}
