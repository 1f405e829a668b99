//! States, catch and retry policy, and the transition table
//!
//! The state graph is an explicit enumerated set plus a table keyed by
//! (state, outcome). Nothing holds a reference to its successor, so the graph
//! owns no cycles and can be validated up front.

use crate::path::{FieldPath, PathError, PayloadShaping};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Error name matching every error a state can produce
pub const ERROR_ALL: &str = "States.ALL";
/// Error name used when payload shaping or routing fails inside the engine
pub const ERROR_RUNTIME: &str = "States.Runtime";

/// The states of the failure-routing machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateId {
    SubmitJob,
    PublishMessage,
    Succeeded,
    TaskFailed,
}

impl StateId {
    pub const ALL: [StateId; 4] = [
        StateId::SubmitJob,
        StateId::PublishMessage,
        StateId::Succeeded,
        StateId::TaskFailed,
    ];
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StateId::SubmitJob => "submit_job",
            StateId::PublishMessage => "publish_message",
            StateId::Succeeded => "succeeded",
            StateId::TaskFailed => "task_failed",
        };
        f.write_str(name)
    }
}

/// External action performed by a task state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskResource {
    /// Invoke a compute function with the state input as payload
    InvokeFunction { function_name: String },
    /// Publish the string at `message` of the state input to a topic
    PublishToTopic { topic_name: String, message: FieldPath },
}

/// What a state does when entered
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StateKind {
    Task {
        resource: TaskResource,
        #[serde(default)]
        retry: RetryPolicy,
    },
    Succeed,
    Fail {
        error: Option<String>,
        cause: Option<String>,
    },
}

impl StateKind {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StateKind::Succeed | StateKind::Fail { .. })
    }
}

/// A named node of the state machine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSpec {
    pub id: StateId,
    pub name: String,
    pub kind: StateKind,
    #[serde(default)]
    pub comment: Option<String>,
}

impl StateSpec {
    pub fn new(id: StateId, name: impl Into<String>, kind: StateKind) -> Self {
        Self {
            id,
            name: name.into(),
            kind,
            comment: None,
        }
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }
}

/// Error produced by a state, in the `{"Error", "Cause"}` document form
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDocument {
    #[serde(rename = "Error")]
    pub error: String,
    #[serde(rename = "Cause")]
    pub cause: String,
}

impl ErrorDocument {
    pub fn new(error: impl Into<String>, cause: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            cause: cause.into(),
        }
    }

    pub fn runtime(cause: impl Into<String>) -> Self {
        Self::new(ERROR_RUNTIME, cause)
    }

    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "Error": self.error,
            "Cause": self.cause,
        })
    }
}

impl From<PathError> for ErrorDocument {
    fn from(err: PathError) -> Self {
        Self::runtime(err.to_string())
    }
}

/// Matches error names for catch and retry rules
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ErrorMatcher {
    All,
    Named(String),
}

impl ErrorMatcher {
    pub fn matches(&self, error: &str) -> bool {
        match self {
            ErrorMatcher::All => true,
            ErrorMatcher::Named(name) => name == error,
        }
    }
}

impl From<String> for ErrorMatcher {
    fn from(value: String) -> Self {
        if value == ERROR_ALL {
            ErrorMatcher::All
        } else {
            ErrorMatcher::Named(value)
        }
    }
}

impl From<ErrorMatcher> for String {
    fn from(matcher: ErrorMatcher) -> Self {
        match matcher {
            ErrorMatcher::All => ERROR_ALL.to_string(),
            ErrorMatcher::Named(name) => name,
        }
    }
}

impl fmt::Display for ErrorMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorMatcher::All => f.write_str(ERROR_ALL),
            ErrorMatcher::Named(name) => f.write_str(name),
        }
    }
}

/// Routes a matching error to another state, shaping the error document into
/// that state's input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatchRule {
    pub error_equals: Vec<ErrorMatcher>,
    pub next: StateId,
    pub shaping: PayloadShaping,
}

impl CatchRule {
    pub fn catch_all(next: StateId, shaping: PayloadShaping) -> Self {
        Self {
            error_equals: vec![ErrorMatcher::All],
            next,
            shaping,
        }
    }

    pub fn matches(&self, error: &str) -> bool {
        self.error_equals.iter().any(|m| m.matches(error))
    }

    pub fn is_catch_all(&self) -> bool {
        self.error_equals.contains(&ErrorMatcher::All)
    }
}

/// Retry policy for a task state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub error_equals: Vec<ErrorMatcher>,
    /// Retries after the first attempt; 0 means single attempt
    pub max_retries: u32,
    pub interval_ms: u64,
    pub backoff_rate: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

impl RetryPolicy {
    /// Single attempt, errors go straight to the catch rules
    pub fn none() -> Self {
        Self {
            error_equals: Vec::new(),
            max_retries: 0,
            interval_ms: 1000,
            backoff_rate: 2.0,
        }
    }

    pub fn new(max_retries: u32) -> Self {
        Self {
            error_equals: vec![ErrorMatcher::All],
            max_retries,
            ..Self::none()
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_backoff_rate(mut self, rate: f64) -> Self {
        self.backoff_rate = rate;
        self
    }

    pub fn is_disabled(&self) -> bool {
        self.max_retries == 0 || self.error_equals.is_empty()
    }

    /// Whether a failure on attempt `attempt` (zero-based) should be retried
    pub fn should_retry(&self, error: &str, attempt: u32) -> bool {
        attempt < self.max_retries && self.error_equals.iter().any(|m| m.matches(error))
    }

    /// Delay before retry number `attempt` (zero-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_rate.max(1.0).powi(attempt as i32);
        Duration::from_millis((self.interval_ms as f64 * factor) as u64)
    }
}

/// Result of running a task state once its retries are exhausted
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success(Value),
    Failure(ErrorDocument),
}

/// Where execution goes after a task state
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Next { state: StateId, input: Value },
    /// No catch rule matched; the execution fails with this error
    Unhandled(ErrorDocument),
}

/// Default transition taken when a task succeeds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuccessRoute {
    pub next: StateId,
    pub shaping: PayloadShaping,
}

/// state × outcome → next state plus payload shaping
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransitionTable {
    on_success: BTreeMap<StateId, SuccessRoute>,
    catches: BTreeMap<StateId, Vec<CatchRule>>,
}

impl TransitionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_success(mut self, from: StateId, next: StateId, shaping: PayloadShaping) -> Self {
        self.on_success.insert(from, SuccessRoute { next, shaping });
        self
    }

    pub fn with_catch(mut self, from: StateId, rule: CatchRule) -> Self {
        self.catches.entry(from).or_default().push(rule);
        self
    }

    pub fn success_route(&self, state: StateId) -> Option<&SuccessRoute> {
        self.on_success.get(&state)
    }

    pub fn catches(&self, state: StateId) -> &[CatchRule] {
        self.catches.get(&state).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn has_catch_all(&self, state: StateId) -> bool {
        self.catches(state).iter().any(CatchRule::is_catch_all)
    }

    /// Every (from, to) pair the table can take
    pub fn edges(&self) -> Vec<(StateId, StateId)> {
        let success = self.on_success.iter().map(|(from, route)| (*from, route.next));
        let caught = self
            .catches
            .iter()
            .flat_map(|(from, rules)| rules.iter().map(move |rule| (*from, rule.next)));
        success.chain(caught).collect()
    }

    /// Resolve the next step for `state` given the input it ran with and its
    /// outcome. Catch rules are evaluated in declaration order.
    pub fn resolve(
        &self,
        state: StateId,
        input: &Value,
        outcome: Outcome,
    ) -> Result<Transition, PathError> {
        match outcome {
            Outcome::Success(result) => match self.success_route(state) {
                Some(route) => Ok(Transition::Next {
                    state: route.next,
                    input: route.shaping.apply(input, &result)?,
                }),
                None => Ok(Transition::Unhandled(ErrorDocument::runtime(format!(
                    "no success transition defined from {}",
                    state
                )))),
            },
            Outcome::Failure(error) => {
                match self.catches(state).iter().find(|rule| rule.matches(&error.error)) {
                    Some(rule) => Ok(Transition::Next {
                        state: rule.next,
                        input: rule.shaping.apply(input, &error.to_value())?,
                    }),
                    None => Ok(Transition::Unhandled(error)),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cause_only() -> PayloadShaping {
        PayloadShaping::select("Cause", FieldPath::parse("$.Cause").unwrap())
    }

    fn table() -> TransitionTable {
        TransitionTable::new()
            .with_success(StateId::SubmitJob, StateId::Succeeded, PayloadShaping::Result)
            .with_catch(
                StateId::SubmitJob,
                CatchRule::catch_all(StateId::PublishMessage, cause_only()),
            )
            .with_success(StateId::PublishMessage, StateId::TaskFailed, PayloadShaping::PassThrough)
    }

    #[test]
    fn test_success_routes_result() {
        let transition = table()
            .resolve(StateId::SubmitJob, &json!({"in": 1}), Outcome::Success(json!({"out": 2})))
            .unwrap();

        assert_eq!(
            transition,
            Transition::Next {
                state: StateId::Succeeded,
                input: json!({"out": 2})
            }
        );
    }

    #[test]
    fn test_catch_all_routes_any_error() {
        for name in ["Lambda.Unknown", "ZeroDivisionError", "States.Timeout"] {
            let transition = table()
                .resolve(
                    StateId::SubmitJob,
                    &json!({}),
                    Outcome::Failure(ErrorDocument::new(name, "boom")),
                )
                .unwrap();

            assert_eq!(
                transition,
                Transition::Next {
                    state: StateId::PublishMessage,
                    input: json!({"Cause": "boom"})
                }
            );
        }
    }

    #[test]
    fn test_uncaught_error_is_unhandled() {
        let error = ErrorDocument::new("SNS.PublishFailed", "topic unavailable");
        let transition = table()
            .resolve(StateId::PublishMessage, &json!({}), Outcome::Failure(error.clone()))
            .unwrap();

        assert_eq!(transition, Transition::Unhandled(error));
    }

    #[test]
    fn test_catch_rules_in_order() {
        let table = TransitionTable::new()
            .with_catch(
                StateId::SubmitJob,
                CatchRule {
                    error_equals: vec![ErrorMatcher::Named("Specific".to_string())],
                    next: StateId::TaskFailed,
                    shaping: PayloadShaping::Result,
                },
            )
            .with_catch(
                StateId::SubmitJob,
                CatchRule::catch_all(StateId::PublishMessage, PayloadShaping::Result),
            );

        let specific = table
            .resolve(
                StateId::SubmitJob,
                &json!({}),
                Outcome::Failure(ErrorDocument::new("Specific", "x")),
            )
            .unwrap();
        assert!(matches!(specific, Transition::Next { state: StateId::TaskFailed, .. }));

        let other = table
            .resolve(
                StateId::SubmitJob,
                &json!({}),
                Outcome::Failure(ErrorDocument::new("Other", "x")),
            )
            .unwrap();
        assert!(matches!(other, Transition::Next { state: StateId::PublishMessage, .. }));
    }

    #[test]
    fn test_error_matcher_serde() {
        let matchers: Vec<ErrorMatcher> =
            serde_json::from_value(json!(["States.ALL", "Lambda.Unknown"])).unwrap();
        assert_eq!(
            matchers,
            vec![ErrorMatcher::All, ErrorMatcher::Named("Lambda.Unknown".to_string())]
        );
    }

    #[test]
    fn test_retry_policy() {
        let none = RetryPolicy::none();
        assert!(none.is_disabled());
        assert!(!none.should_retry("anything", 0));

        let policy = RetryPolicy::new(2).with_interval(Duration::from_millis(100));
        assert!(policy.should_retry("x", 0));
        assert!(policy.should_retry("x", 1));
        assert!(!policy.should_retry("x", 2));
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
    }

    #[test]
    fn test_edges() {
        let edges = table().edges();
        assert_eq!(edges.len(), 3);
        assert!(edges.contains(&(StateId::SubmitJob, StateId::PublishMessage)));
    }
}
