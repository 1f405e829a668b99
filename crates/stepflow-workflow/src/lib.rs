//! Failure-routing workflow engine
//!
//! This crate provides:
//! - Field-path extraction and payload shaping between states
//! - An enumerated state set with a (state × outcome) transition table
//! - Catch and retry policies for task states
//! - State graph validation
//! - An execution engine with per-execution history
//! - Event-driven triggers for object-created notifications

pub mod dag;
pub mod definition;
pub mod engine;
pub mod execution;
pub mod path;
pub mod stack;
pub mod state;
pub mod task;
pub mod triggers;

pub use dag::{DagValidationError, StateGraph};
pub use definition::StateMachineDefinition;
pub use engine::WorkflowEngine;
pub use execution::{ExecutionStatus, HistoryEvent, HistoryEventKind, WorkflowExecution};
pub use path::{FieldPath, PathError, PayloadShaping};
pub use stack::Stack;
pub use state::{
    CatchRule, ErrorDocument, ErrorMatcher, Outcome, RetryPolicy, StateId, StateKind, StateSpec,
    TaskResource, Transition, TransitionTable,
};
pub use task::{
    FunctionInvoker, InMemoryTopic, InvocationError, PlaceholderJob, PublishError, PublishReceipt,
    PublishRequest, TopicPublisher,
};
pub use triggers::{
    EventBus, EventBusProcessor, EventPattern, InMemoryTriggerRepository, TriggerCondition,
    TriggerEvent, TriggerManager, TriggerRepository, TriggerRule,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Execution not found: {0}")]
    NotFound(String),

    #[error("Invalid workflow definition: {0}")]
    InvalidDefinition(String),

    #[error("DAG validation error: {0}")]
    DagValidation(#[from] DagValidationError),

    #[error("Path error: {0}")]
    Path(#[from] PathError),

    #[error("Invalid trigger event: {0}")]
    InvalidEvent(String),

    #[error("Invalid trigger rule: {0}")]
    InvalidTrigger(String),

    #[error("Execution still running: {0}")]
    ExecutionRunning(String),

    #[error("Event bus closed")]
    EventBusClosed,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] stepflow_core::CoreError),
}

pub type Result<T> = std::result::Result<T, WorkflowError>;
