//! Execution engine for a single state machine definition

use crate::definition::StateMachineDefinition;
use crate::execution::{ExecutionStatus, HistoryEventKind, WorkflowExecution};
use crate::state::{
    ErrorDocument, Outcome, RetryPolicy, StateId, StateKind, StateSpec, TaskResource, Transition,
};
use crate::task::{FunctionInvoker, PublishRequest, TopicPublisher};
use crate::{Result, WorkflowError};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use uuid::Uuid;

/// Runs executions of one state machine definition.
///
/// Executions are independent: each owns its payload and current state, and
/// only the execution table is shared.
#[derive(Clone)]
pub struct WorkflowEngine {
    definition: Arc<StateMachineDefinition>,
    invoker: Arc<dyn FunctionInvoker>,
    publisher: Arc<dyn TopicPublisher>,
    executions: Arc<RwLock<HashMap<String, ExecutionSlot>>>,
    execution_arn_prefix: String,
    max_transitions: usize,
}

struct ExecutionSlot {
    execution: WorkflowExecution,
    status: watch::Sender<ExecutionStatus>,
}

impl WorkflowEngine {
    /// Create an engine; the definition is validated first
    pub fn new(
        definition: StateMachineDefinition,
        invoker: Arc<dyn FunctionInvoker>,
        publisher: Arc<dyn TopicPublisher>,
    ) -> Result<Self> {
        let graph = definition.validate()?;
        let execution_arn_prefix = format!("execution:{}", definition.name);

        tracing::info!(
            state_machine = %definition.name,
            states = definition.states.len(),
            "Workflow engine created"
        );

        Ok(Self {
            definition: Arc::new(definition),
            invoker,
            publisher,
            executions: Arc::new(RwLock::new(HashMap::new())),
            execution_arn_prefix,
            max_transitions: graph.depth(),
        })
    }

    /// Prefix for execution ARNs, e.g. the state machine ARN with
    /// `stateMachine` replaced by `execution`
    pub fn with_execution_arn_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.execution_arn_prefix = prefix.into();
        self
    }

    pub fn definition(&self) -> &StateMachineDefinition {
        &self.definition
    }

    /// Register a new execution and run it in the background.
    ///
    /// Every call starts a distinct execution, including repeated calls with
    /// the same input.
    pub async fn start_execution(&self, input: Value) -> Result<String> {
        let execution_id = self.register(input).await;

        let engine = self.clone();
        let exec_id = execution_id.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.run_execution(&exec_id).await {
                tracing::error!(
                    execution_id = %exec_id,
                    error = %e,
                    "Workflow execution aborted"
                );
            }
        });

        Ok(execution_id)
    }

    /// Register a new execution and run it to completion
    pub async fn execute(&self, input: Value) -> Result<WorkflowExecution> {
        let execution_id = self.register(input).await;
        self.run_execution(&execution_id).await?;
        self.get_execution(&execution_id).await
    }

    /// Wait until an execution reaches a terminal status
    pub async fn wait_for_completion(&self, execution_id: &str) -> Result<WorkflowExecution> {
        let mut receiver = {
            let executions = self.executions.read().await;
            let slot = executions
                .get(execution_id)
                .ok_or_else(|| WorkflowError::NotFound(execution_id.to_string()))?;
            slot.status.subscribe()
        };

        receiver
            .wait_for(|status| status.is_terminal())
            .await
            .map_err(|_| WorkflowError::NotFound(execution_id.to_string()))?;

        self.get_execution(execution_id).await
    }

    /// Get execution snapshot
    pub async fn get_execution(&self, execution_id: &str) -> Result<WorkflowExecution> {
        let executions = self.executions.read().await;
        executions
            .get(execution_id)
            .map(|slot| slot.execution.clone())
            .ok_or_else(|| WorkflowError::NotFound(execution_id.to_string()))
    }

    /// All executions, oldest first
    pub async fn list_executions(&self) -> Vec<WorkflowExecution> {
        let executions = self.executions.read().await;
        let mut list: Vec<_> = executions.values().map(|s| s.execution.clone()).collect();
        list.sort_by_key(|e| e.started_at);
        list
    }

    pub async fn count_by_status(&self, status: ExecutionStatus) -> usize {
        let executions = self.executions.read().await;
        executions
            .values()
            .filter(|s| s.execution.status == status)
            .count()
    }

    /// Drop a finished execution from the table and return its final
    /// snapshot; running executions stay
    pub async fn remove_execution(&self, execution_id: &str) -> Result<WorkflowExecution> {
        let mut executions = self.executions.write().await;
        match executions.get(execution_id) {
            None => Err(WorkflowError::NotFound(execution_id.to_string())),
            Some(slot) if !slot.execution.is_terminal() => {
                Err(WorkflowError::ExecutionRunning(execution_id.to_string()))
            }
            Some(_) => {
                let slot = executions
                    .remove(execution_id)
                    .ok_or_else(|| WorkflowError::NotFound(execution_id.to_string()))?;
                tracing::debug!(execution_id = %execution_id, "Removed execution");
                Ok(slot.execution)
            }
        }
    }

    /// Drop every finished execution, keeping running ones.
    /// Returns how many were removed.
    pub async fn purge_finished(&self) -> usize {
        let mut executions = self.executions.write().await;
        let before = executions.len();
        executions.retain(|_, slot| !slot.execution.is_terminal());
        let removed = before - executions.len();
        if removed > 0 {
            tracing::info!(removed, remaining = executions.len(), "Purged finished executions");
        }
        removed
    }

    async fn register(&self, input: Value) -> String {
        let execution_id = Uuid::new_v4().to_string();
        let execution = WorkflowExecution::new(
            &execution_id,
            format!("{}:{}", self.execution_arn_prefix, execution_id),
            &self.definition.name,
            self.definition.start_at,
            input,
        );
        let (status, _) = watch::channel(ExecutionStatus::Running);

        self.executions
            .write()
            .await
            .insert(execution_id.clone(), ExecutionSlot { execution, status });

        tracing::info!(
            execution_id = %execution_id,
            state_machine = %self.definition.name,
            "Workflow execution started"
        );

        execution_id
    }

    /// Main execution loop: one active state at a time until a terminal
    async fn run_execution(&self, execution_id: &str) -> Result<()> {
        let (mut state, mut input) = {
            let executions = self.executions.read().await;
            let slot = executions
                .get(execution_id)
                .ok_or_else(|| WorkflowError::NotFound(execution_id.to_string()))?;
            (self.definition.start_at, slot.execution.input.clone())
        };

        // Acyclic graph: no execution enters more states than exist
        for _ in 0..self.max_transitions {
            let spec = self.definition.state(state)?.clone();
            self.update(execution_id, |e| e.enter(state, &spec.name, &input))
                .await?;

            tracing::debug!(
                execution_id = %execution_id,
                state = %spec.name,
                "Entered state"
            );

            match &spec.kind {
                StateKind::Succeed => {
                    return self.finish_succeeded(execution_id, input).await;
                }
                StateKind::Fail { error, cause } => {
                    let error = match (error, cause) {
                        (None, None) => None,
                        (error, cause) => Some(ErrorDocument::new(
                            error.clone().unwrap_or_default(),
                            cause.clone().unwrap_or_default(),
                        )),
                    };
                    return self.finish_failed(execution_id, error).await;
                }
                StateKind::Task { resource, retry } => {
                    let outcome = self
                        .run_task(execution_id, &spec, resource, retry, &input)
                        .await?;

                    let caught = matches!(outcome, Outcome::Failure(_));
                    match self.definition.transitions.resolve(state, &input, outcome) {
                        Ok(Transition::Next {
                            state: next,
                            input: next_input,
                        }) => {
                            let next_name = self.definition.state_name(next).to_string();
                            self.update(execution_id, |e| {
                                if caught {
                                    e.record(HistoryEventKind::CatchMatched {
                                        state: spec.name.clone(),
                                        next: next_name.clone(),
                                    });
                                }
                                e.record(HistoryEventKind::StateExited {
                                    state: spec.name.clone(),
                                });
                            })
                            .await?;

                            if caught {
                                tracing::info!(
                                    execution_id = %execution_id,
                                    state = %spec.name,
                                    next = %next_name,
                                    "Task error caught"
                                );
                            }

                            state = next;
                            input = next_input;
                        }
                        Ok(Transition::Unhandled(error)) => {
                            tracing::warn!(
                                execution_id = %execution_id,
                                state = %spec.name,
                                error = %error.error,
                                "Unhandled task error"
                            );
                            return self.finish_failed(execution_id, Some(error)).await;
                        }
                        Err(e) => {
                            return self
                                .finish_failed(execution_id, Some(ErrorDocument::from(e)))
                                .await;
                        }
                    }
                }
            }
        }

        self.finish_failed(
            execution_id,
            Some(ErrorDocument::runtime("execution exceeded the number of states")),
        )
        .await
    }

    /// Run a task state, retrying per its policy
    async fn run_task(
        &self,
        execution_id: &str,
        spec: &StateSpec,
        resource: &TaskResource,
        retry: &RetryPolicy,
        input: &Value,
    ) -> Result<Outcome> {
        let mut attempt = 0;

        loop {
            match self.invoke_resource(resource, input).await {
                Ok(output) => {
                    self.update(execution_id, |e| {
                        e.record(HistoryEventKind::TaskSucceeded {
                            state: spec.name.clone(),
                            output: output.clone(),
                        })
                    })
                    .await?;
                    return Ok(Outcome::Success(output));
                }
                Err(error) => {
                    tracing::info!(
                        execution_id = %execution_id,
                        state = %spec.name,
                        error = %error.error,
                        cause = %error.cause,
                        attempt,
                        "Task failed"
                    );
                    self.update(execution_id, |e| {
                        e.record(HistoryEventKind::TaskFailed {
                            state: spec.name.clone(),
                            error: error.clone(),
                            attempt,
                        })
                    })
                    .await?;

                    if !retry.should_retry(&error.error, attempt) {
                        return Ok(Outcome::Failure(error));
                    }

                    let delay = retry.delay_for(attempt);
                    self.update(execution_id, |e| {
                        e.record(HistoryEventKind::TaskRetryScheduled {
                            state: spec.name.clone(),
                            attempt: attempt + 1,
                            delay_ms: delay.as_millis() as u64,
                        })
                    })
                    .await?;
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn invoke_resource(
        &self,
        resource: &TaskResource,
        input: &Value,
    ) -> std::result::Result<Value, ErrorDocument> {
        match resource {
            TaskResource::InvokeFunction { function_name } => self
                .invoker
                .invoke(function_name, input)
                .await
                .map_err(ErrorDocument::from),
            TaskResource::PublishToTopic {
                topic_name,
                message,
            } => {
                let body = message_body(message.require(input)?);
                let receipt = self
                    .publisher
                    .publish(PublishRequest {
                        topic_name: topic_name.clone(),
                        message: body,
                    })
                    .await?;
                Ok(serde_json::json!({ "MessageId": receipt.message_id }))
            }
        }
    }

    async fn finish_succeeded(&self, execution_id: &str, output: Value) -> Result<()> {
        self.finish(execution_id, |e| e.succeed(output)).await?;
        tracing::info!(execution_id = %execution_id, "Workflow execution succeeded");
        Ok(())
    }

    async fn finish_failed(&self, execution_id: &str, error: Option<ErrorDocument>) -> Result<()> {
        let error_name = error.as_ref().map(|e| e.error.clone()).unwrap_or_default();
        self.finish(execution_id, |e| e.fail(error)).await?;
        tracing::info!(
            execution_id = %execution_id,
            error = %error_name,
            "Workflow execution failed"
        );
        Ok(())
    }

    async fn finish<F>(&self, execution_id: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut WorkflowExecution),
    {
        let mut executions = self.executions.write().await;
        let slot = executions
            .get_mut(execution_id)
            .ok_or_else(|| WorkflowError::NotFound(execution_id.to_string()))?;

        f(&mut slot.execution);
        slot.status.send_replace(slot.execution.status);
        Ok(())
    }

    async fn update<F>(&self, execution_id: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut WorkflowExecution),
    {
        let mut executions = self.executions.write().await;
        let slot = executions
            .get_mut(execution_id)
            .ok_or_else(|| WorkflowError::NotFound(execution_id.to_string()))?;

        f(&mut slot.execution);
        Ok(())
    }

    /// Current state of a running execution
    pub async fn current_state(&self, execution_id: &str) -> Result<StateId> {
        Ok(self.get_execution(execution_id).await?.current_state)
    }
}

/// Strings are published verbatim; anything else as its JSON text
fn message_body(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
