//! State machine definition

use crate::dag::StateGraph;
use crate::path::{FieldPath, PayloadShaping};
use crate::state::{
    CatchRule, RetryPolicy, StateId, StateKind, StateSpec, TaskResource, TransitionTable,
};
use crate::{Result, WorkflowError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use stepflow_core::{ResourceNames, StackConfig};

/// Static description of a state machine, shared by all of its executions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateMachineDefinition {
    pub name: String,
    #[serde(default)]
    pub comment: Option<String>,
    pub start_at: StateId,
    pub states: BTreeMap<StateId, StateSpec>,
    pub transitions: TransitionTable,
}

impl StateMachineDefinition {
    /// Invoke the job; on any error publish its cause and stop as failed.
    ///
    /// ```text
    /// SubmitJob --success--> Succeeded
    /// SubmitJob --States.ALL--> PublishMessage {Cause: $.Cause}
    /// PublishMessage --success--> TaskFailed
    /// ```
    pub fn failure_routing(config: &StackConfig) -> Result<Self> {
        let cause = FieldPath::parse("$.Cause")?;

        let states = BTreeMap::from([
            (
                StateId::SubmitJob,
                StateSpec::new(
                    StateId::SubmitJob,
                    &config.job_state_name,
                    StateKind::Task {
                        resource: TaskResource::InvokeFunction {
                            function_name: config.function_name.clone(),
                        },
                        retry: RetryPolicy::none(),
                    },
                ),
            ),
            (
                StateId::PublishMessage,
                StateSpec::new(
                    StateId::PublishMessage,
                    &config.notify_state_name,
                    StateKind::Task {
                        resource: TaskResource::PublishToTopic {
                            topic_name: config.topic_name.clone(),
                            message: cause.clone(),
                        },
                        retry: RetryPolicy::none(),
                    },
                ),
            ),
            (
                StateId::Succeeded,
                StateSpec::new(StateId::Succeeded, &config.succeeded_state_name, StateKind::Succeed),
            ),
            (
                StateId::TaskFailed,
                StateSpec::new(
                    StateId::TaskFailed,
                    &config.failed_state_name,
                    StateKind::Fail {
                        error: None,
                        cause: None,
                    },
                ),
            ),
        ]);

        // A notified failure is still a failed execution
        let transitions = TransitionTable::new()
            .with_success(StateId::SubmitJob, StateId::Succeeded, PayloadShaping::Result)
            .with_catch(
                StateId::SubmitJob,
                CatchRule::catch_all(
                    StateId::PublishMessage,
                    PayloadShaping::select("Cause", cause),
                ),
            )
            .with_success(
                StateId::PublishMessage,
                StateId::TaskFailed,
                PayloadShaping::PassThrough,
            );

        let definition = Self {
            name: config.state_machine_name.clone(),
            comment: Some("Invoke the job and notify the topic when it fails".to_string()),
            start_at: StateId::SubmitJob,
            states,
            transitions,
        };

        definition.validate()?;
        Ok(definition)
    }

    /// Validate the state graph
    pub fn validate(&self) -> Result<StateGraph> {
        if self.name.trim().is_empty() {
            return Err(WorkflowError::InvalidDefinition(
                "State machine has no name".to_string(),
            ));
        }

        Ok(StateGraph::new(self.start_at, &self.states, &self.transitions)?)
    }

    pub fn state(&self, id: StateId) -> Result<&StateSpec> {
        self.states
            .get(&id)
            .ok_or_else(|| WorkflowError::InvalidDefinition(format!("State not found: {}", id)))
    }

    pub fn state_name(&self, id: StateId) -> &str {
        self.states.get(&id).map(|s| s.name.as_str()).unwrap_or("unknown")
    }

    /// Render as an Amazon States Language document, with task resources
    /// qualified by the account and region in `names`
    pub fn to_asl(&self, names: &ResourceNames) -> Value {
        let mut states = Map::new();

        for (id, spec) in &self.states {
            let mut state = Map::new();

            match &spec.kind {
                StateKind::Task { resource, retry } => {
                    state.insert("Type".to_string(), json!("Task"));
                    match resource {
                        TaskResource::InvokeFunction { function_name } => {
                            state.insert(
                                "Resource".to_string(),
                                json!("arn:aws:states:::lambda:invoke"),
                            );
                            state.insert(
                                "Parameters".to_string(),
                                json!({
                                    "FunctionName": names.function_arn_for(function_name),
                                    "Payload.$": "$",
                                }),
                            );
                        }
                        TaskResource::PublishToTopic {
                            topic_name,
                            message,
                        } => {
                            state.insert("Resource".to_string(), json!("arn:aws:states:::sns:publish"));
                            state.insert(
                                "Parameters".to_string(),
                                json!({
                                    "TopicArn": names.topic_arn_for(topic_name),
                                    "Message.$": message.as_str(),
                                }),
                            );
                        }
                    }

                    if !retry.is_disabled() {
                        state.insert(
                            "Retry".to_string(),
                            json!([{
                                "ErrorEquals": retry.error_equals.iter().map(ToString::to_string).collect::<Vec<_>>(),
                                "MaxAttempts": retry.max_retries,
                                // Whole seconds, at least one
                                "IntervalSeconds": retry.interval_ms.div_ceil(1000).max(1),
                                "BackoffRate": retry.backoff_rate,
                            }]),
                        );
                    }

                    let catches: Vec<Value> = self
                        .transitions
                        .catches(*id)
                        .iter()
                        .map(|rule| {
                            json!({
                                "ErrorEquals": rule.error_equals.iter().map(ToString::to_string).collect::<Vec<_>>(),
                                "Next": self.state_name(rule.next),
                            })
                        })
                        .collect();
                    if !catches.is_empty() {
                        state.insert("Catch".to_string(), Value::Array(catches));
                    }

                    if let Some(route) = self.transitions.success_route(*id) {
                        state.insert("Next".to_string(), json!(self.state_name(route.next)));
                    }
                }
                StateKind::Succeed => {
                    state.insert("Type".to_string(), json!("Succeed"));
                }
                StateKind::Fail { error, cause } => {
                    state.insert("Type".to_string(), json!("Fail"));
                    if let Some(error) = error {
                        state.insert("Error".to_string(), json!(error));
                    }
                    if let Some(cause) = cause {
                        state.insert("Cause".to_string(), json!(cause));
                    }
                }
            }

            if let Some(comment) = &spec.comment {
                state.insert("Comment".to_string(), json!(comment));
            }

            states.insert(spec.name.clone(), Value::Object(state));
        }

        let mut document = Map::new();
        if let Some(comment) = &self.comment {
            document.insert("Comment".to_string(), json!(comment));
        }
        document.insert("StartAt".to_string(), json!(self.state_name(self.start_at)));
        document.insert("States".to_string(), Value::Object(states));
        Value::Object(document)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_routing_is_valid() {
        let definition = StateMachineDefinition::failure_routing(&StackConfig::default()).unwrap();

        assert_eq!(definition.name, "CdkStateMachine");
        assert_eq!(definition.start_at, StateId::SubmitJob);
        assert_eq!(definition.states.len(), 4);
        assert!(definition.transitions.has_catch_all(StateId::SubmitJob));
        assert!(definition.transitions.catches(StateId::PublishMessage).is_empty());

        let graph = definition.validate().unwrap();
        assert_eq!(graph.depth(), 4);
    }

    #[test]
    fn test_notified_failure_ends_in_fail_state() {
        let definition = StateMachineDefinition::failure_routing(&StackConfig::default()).unwrap();
        let route = definition
            .transitions
            .success_route(StateId::PublishMessage)
            .unwrap();

        assert_eq!(route.next, StateId::TaskFailed);
        assert!(matches!(
            definition.state(StateId::TaskFailed).unwrap().kind,
            StateKind::Fail { .. }
        ));
    }

    #[test]
    fn test_no_retry_configured() {
        let definition = StateMachineDefinition::failure_routing(&StackConfig::default()).unwrap();

        for spec in definition.states.values() {
            if let StateKind::Task { retry, .. } = &spec.kind {
                assert!(retry.is_disabled());
            }
        }
    }

    fn names() -> ResourceNames {
        let config = StackConfig::default()
            .with_account("123456789012")
            .with_region("eu-west-1");
        ResourceNames::from_config(&config).unwrap()
    }

    #[test]
    fn test_asl_rendering() {
        let definition = StateMachineDefinition::failure_routing(&StackConfig::default()).unwrap();
        let asl = definition.to_asl(&names());

        assert_eq!(asl["StartAt"], "CdkSubmitJob");
        let submit = &asl["States"]["CdkSubmitJob"];
        assert_eq!(submit["Type"], "Task");
        assert_eq!(submit["Next"], "Succeeded");
        assert_eq!(submit["Catch"][0]["ErrorEquals"][0], "States.ALL");
        assert_eq!(submit["Catch"][0]["Next"], "CdkPublishMessage");
        assert!(submit.get("Retry").is_none());

        let publish = &asl["States"]["CdkPublishMessage"];
        assert_eq!(publish["Parameters"]["Message.$"], "$.Cause");
        assert_eq!(
            publish["Parameters"]["TopicArn"],
            "arn:aws:sns:eu-west-1:123456789012:CdkFailureTopic"
        );
        assert_eq!(
            submit["Parameters"]["FunctionName"],
            "arn:aws:lambda:eu-west-1:123456789012:function:CdkFailureLambda"
        );
        assert_eq!(publish["Next"], "TaskFailed");

        assert_eq!(asl["States"]["TaskFailed"]["Type"], "Fail");
    }

    #[test]
    fn test_asl_retry_interval_rounds_up() {
        let mut definition = StateMachineDefinition::failure_routing(&StackConfig::default()).unwrap();
        if let Some(spec) = definition.states.get_mut(&StateId::SubmitJob) {
            if let StateKind::Task { retry, .. } = &mut spec.kind {
                *retry = RetryPolicy::new(2).with_interval(std::time::Duration::from_millis(250));
            }
        }

        let asl = definition.to_asl(&names());
        let retry = &asl["States"]["CdkSubmitJob"]["Retry"][0];
        assert_eq!(retry["IntervalSeconds"], 1);
        assert_eq!(retry["MaxAttempts"], 2);
    }

    #[test]
    fn test_definition_serde() {
        let definition = StateMachineDefinition::failure_routing(&StackConfig::default()).unwrap();
        let value = serde_json::to_value(&definition).unwrap();
        let parsed: StateMachineDefinition = serde_json::from_value(value).unwrap();

        assert_eq!(parsed.states, definition.states);
        assert_eq!(parsed.transitions, definition.transitions);
        assert!(parsed.validate().is_ok());
    }
}
