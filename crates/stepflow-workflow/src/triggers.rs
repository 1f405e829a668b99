//! Event-driven workflow triggers
//!
//! Matches incoming storage notifications against rule patterns and starts one
//! execution per matching rule, with the raw event document as input.

use crate::engine::WorkflowEngine;
use crate::path::FieldPath;
use crate::{Result, WorkflowError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use stepflow_core::resources::bucket_arn;
use stepflow_core::StackConfig;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info};

/// Source emitted by the object storage service
pub const SOURCE_OBJECT_STORAGE: &str = "aws.s3";
/// Detail type of an object-creation notification
pub const DETAIL_OBJECT_CREATED: &str = "Object Created";

/// Event that can trigger workflows, kept as the raw document it arrived as
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TriggerEvent {
    document: Value,
}

impl TriggerEvent {
    pub fn from_document(document: Value) -> Result<Self> {
        if !document.is_object() {
            return Err(WorkflowError::InvalidEvent(
                "event document must be a JSON object".to_string(),
            ));
        }
        Ok(Self { document })
    }

    /// Object-created notification for `key` in a bucket
    pub fn object_created(bucket_name: &str, bucket_arn: &str, key: &str) -> Self {
        Self {
            document: serde_json::json!({
                "version": "0",
                "id": uuid::Uuid::new_v4().to_string(),
                "source": SOURCE_OBJECT_STORAGE,
                "detail-type": DETAIL_OBJECT_CREATED,
                "time": Utc::now().to_rfc3339(),
                "resources": [bucket_arn],
                "detail": {
                    "bucket": {"name": bucket_name},
                    "object": {"key": key}
                }
            }),
        }
    }

    pub fn document(&self) -> &Value {
        &self.document
    }

    pub fn into_document(self) -> Value {
        self.document
    }

    pub fn id(&self) -> &str {
        self.document.get("id").and_then(Value::as_str).unwrap_or("")
    }

    pub fn source(&self) -> Option<&str> {
        self.document.get("source").and_then(Value::as_str)
    }

    pub fn detail_type(&self) -> Option<&str> {
        self.document.get("detail-type").and_then(Value::as_str)
    }

    pub fn resources(&self) -> Vec<&str> {
        self.document
            .get("resources")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }

    pub fn object_key(&self) -> Option<&str> {
        self.document
            .pointer("/detail/object/key")
            .and_then(Value::as_str)
    }
}

/// Condition for trigger matching
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerCondition {
    /// Match event source
    Source { value: String },
    /// Match detail type
    DetailType { value: String },
    /// Event lists this resource
    Resource { value: String },
    /// Field equals value
    FieldEquals { path: FieldPath, value: Value },
    /// Field exists
    FieldExists { path: FieldPath },
    /// String field ends with suffix
    FieldSuffix { path: FieldPath, suffix: String },
    /// String field starts with prefix
    FieldPrefix { path: FieldPath, prefix: String },
    /// String field matches a regex
    FieldPattern { path: FieldPath, pattern: EventPattern },
    /// Match all conditions (AND)
    All { conditions: Vec<TriggerCondition> },
    /// Match any condition (OR)
    Any { conditions: Vec<TriggerCondition> },
    /// Negate condition
    Not { condition: Box<TriggerCondition> },
}

impl TriggerCondition {
    /// Check if event matches this condition
    pub fn matches(&self, event: &TriggerEvent) -> bool {
        let doc = event.document();
        match self {
            TriggerCondition::Source { value } => event.source() == Some(value.as_str()),
            TriggerCondition::DetailType { value } => event.detail_type() == Some(value.as_str()),
            TriggerCondition::Resource { value } => event.resources().contains(&value.as_str()),
            TriggerCondition::FieldEquals { path, value } => {
                path.extract(doc).map(|v| v == value).unwrap_or(false)
            }
            TriggerCondition::FieldExists { path } => path.extract(doc).is_some(),
            TriggerCondition::FieldSuffix { path, suffix } => string_at(path, doc)
                .map(|s| s.ends_with(suffix.as_str()))
                .unwrap_or(false),
            TriggerCondition::FieldPrefix { path, prefix } => string_at(path, doc)
                .map(|s| s.starts_with(prefix.as_str()))
                .unwrap_or(false),
            TriggerCondition::FieldPattern { path, pattern } => string_at(path, doc)
                .map(|s| pattern.is_match(s))
                .unwrap_or(false),
            TriggerCondition::All { conditions } => conditions.iter().all(|c| c.matches(event)),
            TriggerCondition::Any { conditions } => conditions.iter().any(|c| c.matches(event)),
            TriggerCondition::Not { condition } => !condition.matches(event),
        }
    }

    /// String field at `path` matches `pattern`; the regex is compiled here
    pub fn field_pattern(path: &str, pattern: &str) -> Result<Self> {
        Ok(TriggerCondition::FieldPattern {
            path: FieldPath::parse(path)?,
            pattern: EventPattern::new(pattern)?,
        })
    }

    /// Object created in `bucket_arn` with a key ending in `suffix`
    pub fn object_created(bucket_arn: &str, suffix: &str) -> Result<Self> {
        Ok(TriggerCondition::All {
            conditions: vec![
                TriggerCondition::Source {
                    value: SOURCE_OBJECT_STORAGE.to_string(),
                },
                TriggerCondition::Resource {
                    value: bucket_arn.to_string(),
                },
                TriggerCondition::DetailType {
                    value: DETAIL_OBJECT_CREATED.to_string(),
                },
                TriggerCondition::FieldSuffix {
                    path: FieldPath::parse("$.detail.object.key")?,
                    suffix: suffix.to_string(),
                },
            ],
        })
    }
}

/// Regular expression compiled once, when the condition is built or
/// deserialized
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EventPattern(regex::Regex);

impl EventPattern {
    pub fn new(pattern: &str) -> Result<Self> {
        regex::Regex::new(pattern)
            .map(Self)
            .map_err(|e| WorkflowError::InvalidTrigger(format!("pattern '{}': {}", pattern, e)))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn is_match(&self, value: &str) -> bool {
        self.0.is_match(value)
    }
}

impl PartialEq for EventPattern {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl TryFrom<String> for EventPattern {
    type Error = WorkflowError;

    fn try_from(pattern: String) -> Result<Self> {
        Self::new(&pattern)
    }
}

impl From<EventPattern> for String {
    fn from(pattern: EventPattern) -> Self {
        pattern.0.as_str().to_string()
    }
}

fn string_at<'a>(path: &FieldPath, doc: &'a Value) -> Option<&'a str> {
    path.extract(doc).and_then(Value::as_str)
}

/// Rule binding a condition to the state machine it starts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerRule {
    pub id: String,
    pub name: String,
    /// Name of the state machine to start
    pub target: String,
    pub condition: TriggerCondition,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

impl TriggerRule {
    pub fn new(name: &str, target: &str, condition: TriggerCondition) -> Self {
        Self {
            id: format!(
                "rule_{}",
                uuid::Uuid::new_v4().to_string().replace('-', "")
            ),
            name: name.to_string(),
            target: target.to_string(),
            condition,
            enabled: true,
            created_at: Utc::now(),
        }
    }

    /// The configured object-created rule for the stack
    pub fn object_created(config: &StackConfig) -> Result<Self> {
        let condition =
            TriggerCondition::object_created(&bucket_arn(&config.bucket_name), &config.key_suffix)?;
        Ok(Self::new(&config.rule_name, &config.state_machine_name, condition))
    }
}

/// Trigger repository trait
#[async_trait]
pub trait TriggerRepository: Send + Sync {
    async fn save(&self, rule: &TriggerRule) -> Result<()>;
    async fn get(&self, id: &str) -> Result<Option<TriggerRule>>;
    async fn list(&self) -> Result<Vec<TriggerRule>>;
    async fn list_enabled(&self) -> Result<Vec<TriggerRule>>;
    async fn delete(&self, id: &str) -> Result<()>;
    async fn update(&self, rule: &TriggerRule) -> Result<()>;
}

/// In-memory trigger repository
pub struct InMemoryTriggerRepository {
    rules: RwLock<HashMap<String, TriggerRule>>,
}

impl InMemoryTriggerRepository {
    pub fn new() -> Self {
        Self {
            rules: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryTriggerRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TriggerRepository for InMemoryTriggerRepository {
    async fn save(&self, rule: &TriggerRule) -> Result<()> {
        let mut rules = self.rules.write().await;
        rules.insert(rule.id.clone(), rule.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<TriggerRule>> {
        let rules = self.rules.read().await;
        Ok(rules.get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<TriggerRule>> {
        let rules = self.rules.read().await;
        let mut list: Vec<_> = rules.values().cloned().collect();
        list.sort_by_key(|r| r.created_at);
        Ok(list)
    }

    async fn list_enabled(&self) -> Result<Vec<TriggerRule>> {
        Ok(self.list().await?.into_iter().filter(|r| r.enabled).collect())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let mut rules = self.rules.write().await;
        rules.remove(id);
        Ok(())
    }

    async fn update(&self, rule: &TriggerRule) -> Result<()> {
        let mut rules = self.rules.write().await;
        if rules.contains_key(&rule.id) {
            rules.insert(rule.id.clone(), rule.clone());
            Ok(())
        } else {
            Err(WorkflowError::NotFound(rule.id.clone()))
        }
    }
}

/// Routes events to the state machines their rules target
pub struct TriggerManager {
    repository: Arc<dyn TriggerRepository>,
    targets: RwLock<HashMap<String, Arc<WorkflowEngine>>>,
}

impl TriggerManager {
    pub fn new(repository: Arc<dyn TriggerRepository>) -> Self {
        Self {
            repository,
            targets: RwLock::new(HashMap::new()),
        }
    }

    /// Make a state machine available as a rule target under its name
    pub async fn register_target(&self, engine: Arc<WorkflowEngine>) {
        let name = engine.definition().name.clone();
        self.targets.write().await.insert(name.clone(), engine);
        info!(target_name = %name, "Registered trigger target");
    }

    /// Create a new rule
    pub async fn create(&self, rule: TriggerRule) -> Result<TriggerRule> {
        self.repository.save(&rule).await?;

        info!(
            rule_id = %rule.id,
            rule_name = %rule.name,
            target_name = %rule.target,
            "Created trigger rule"
        );

        Ok(rule)
    }

    pub async fn enable(&self, id: &str) -> Result<()> {
        self.set_enabled(id, true).await
    }

    pub async fn disable(&self, id: &str) -> Result<()> {
        self.set_enabled(id, false).await
    }

    async fn set_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        let mut rule = self
            .repository
            .get(id)
            .await?
            .ok_or_else(|| WorkflowError::NotFound(id.to_string()))?;
        rule.enabled = enabled;
        self.repository.update(&rule).await?;
        info!(rule_id = %id, enabled, "Updated trigger rule");
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        self.repository.delete(id).await?;
        info!(rule_id = %id, "Deleted trigger rule");
        Ok(())
    }

    pub async fn rules(&self) -> Result<Vec<TriggerRule>> {
        self.repository.list().await
    }

    /// Process an event and start one execution per matching rule.
    ///
    /// Returns the started execution ids; an event no rule matches starts
    /// nothing and is not an error.
    pub async fn process_event(&self, event: TriggerEvent) -> Result<Vec<String>> {
        let rules = self.repository.list_enabled().await?;
        let mut started = Vec::new();

        debug!(
            event_id = %event.id(),
            object_key = ?event.object_key(),
            rules_count = rules.len(),
            "Processing trigger event"
        );

        for rule in rules {
            if !rule.condition.matches(&event) {
                continue;
            }

            let engine = match self.targets.read().await.get(&rule.target).cloned() {
                Some(engine) => engine,
                None => {
                    error!(
                        rule_id = %rule.id,
                        target_name = %rule.target,
                        "Trigger target not registered"
                    );
                    continue;
                }
            };

            match engine.start_execution(event.document().clone()).await {
                Ok(execution_id) => {
                    info!(
                        rule_name = %rule.name,
                        target_name = %rule.target,
                        execution_id = %execution_id,
                        event_id = %event.id(),
                        "Triggered workflow from event"
                    );
                    started.push(execution_id);
                }
                Err(e) => {
                    error!(
                        rule_id = %rule.id,
                        error = %e,
                        "Failed to trigger workflow"
                    );
                }
            }
        }

        if started.is_empty() {
            debug!(event_id = %event.id(), "Event matched no trigger rule");
        }

        Ok(started)
    }
}

/// Event bus for publishing events
#[derive(Clone)]
pub struct EventBus {
    sender: mpsc::Sender<TriggerEvent>,
}

impl EventBus {
    pub fn new(buffer_size: usize) -> (Self, EventBusProcessor) {
        let (sender, receiver) = mpsc::channel(buffer_size);
        (Self { sender }, EventBusProcessor { receiver })
    }

    /// Publish an event
    pub async fn publish(&self, event: TriggerEvent) -> Result<()> {
        self.sender
            .send(event)
            .await
            .map_err(|_| WorkflowError::EventBusClosed)
    }

    /// Publish multiple events
    pub async fn publish_batch(&self, events: Vec<TriggerEvent>) -> Result<()> {
        for event in events {
            self.publish(event).await?;
        }
        Ok(())
    }
}

/// Event bus processor
pub struct EventBusProcessor {
    receiver: mpsc::Receiver<TriggerEvent>,
}

impl EventBusProcessor {
    /// Deliver events to the manager until every bus handle is dropped.
    /// Returns the ids of all executions started.
    pub async fn run(mut self, manager: Arc<TriggerManager>) -> Vec<String> {
        info!("Starting event bus processor");
        let mut started = Vec::new();

        while let Some(event) = self.receiver.recv().await {
            match manager.process_event(event).await {
                Ok(ids) => started.extend(ids),
                Err(e) => error!(error = %e, "Error processing event"),
            }
        }

        info!(executions = started.len(), "Event bus processor stopped");
        started
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BUCKET_ARN: &str = "arn:aws:s3:::cdk-simple-workflow-bucket";

    fn rule_condition() -> TriggerCondition {
        TriggerCondition::object_created(BUCKET_ARN, ".txt").unwrap()
    }

    #[test]
    fn test_object_created_matches_txt() {
        let event = TriggerEvent::object_created("cdk-simple-workflow-bucket", BUCKET_ARN, "reports/jan.txt");
        assert!(rule_condition().matches(&event));
        assert_eq!(event.object_key(), Some("reports/jan.txt"));
    }

    #[test]
    fn test_suffix_mismatch() {
        let event = TriggerEvent::object_created("cdk-simple-workflow-bucket", BUCKET_ARN, "reports/jan.csv");
        assert!(!rule_condition().matches(&event));

        let event = TriggerEvent::object_created("cdk-simple-workflow-bucket", BUCKET_ARN, "reports/jan.txt.bak");
        assert!(!rule_condition().matches(&event));
    }

    #[test]
    fn test_other_bucket() {
        let event = TriggerEvent::object_created("other", "arn:aws:s3:::other", "a.txt");
        assert!(!rule_condition().matches(&event));
    }

    #[test]
    fn test_other_detail_type_and_source() {
        let mut doc = TriggerEvent::object_created("b", BUCKET_ARN, "a.txt").into_document();
        doc["detail-type"] = serde_json::json!("Object Deleted");
        let event = TriggerEvent::from_document(doc.clone()).unwrap();
        assert!(!rule_condition().matches(&event));

        doc["detail-type"] = serde_json::json!(DETAIL_OBJECT_CREATED);
        doc["source"] = serde_json::json!("aws.ec2");
        let event = TriggerEvent::from_document(doc).unwrap();
        assert!(!rule_condition().matches(&event));
    }

    #[test]
    fn test_missing_key_does_not_match() {
        let event = TriggerEvent::from_document(serde_json::json!({
            "source": "aws.s3",
            "detail-type": "Object Created",
            "resources": [BUCKET_ARN],
            "detail": {}
        }))
        .unwrap();
        assert!(!rule_condition().matches(&event));
    }

    #[test]
    fn test_composite_and_pattern_conditions() {
        let event = TriggerEvent::object_created("b", BUCKET_ARN, "reports/2024/jan.txt");
        let key = FieldPath::parse("$.detail.object.key").unwrap();

        let condition = TriggerCondition::Any {
            conditions: vec![
                TriggerCondition::FieldPrefix {
                    path: key.clone(),
                    prefix: "invoices/".to_string(),
                },
                TriggerCondition::field_pattern("$.detail.object.key", r"^reports/\d{4}/").unwrap(),
            ],
        };
        assert!(condition.matches(&event));

        let condition = TriggerCondition::Not {
            condition: Box::new(TriggerCondition::FieldExists { path: key }),
        };
        assert!(!condition.matches(&event));
    }

    #[test]
    fn test_condition_serde() {
        let condition: TriggerCondition = serde_json::from_value(serde_json::json!({
            "type": "field_suffix",
            "path": "$.detail.object.key",
            "suffix": ".txt"
        }))
        .unwrap();

        let event = TriggerEvent::object_created("b", BUCKET_ARN, "x.txt");
        assert!(condition.matches(&event));
    }

    #[test]
    fn test_invalid_pattern_is_rejected() {
        let result = TriggerCondition::field_pattern("$.detail.object.key", r"^reports/(\d+");
        assert!(matches!(result, Err(WorkflowError::InvalidTrigger(_))));

        let parsed = serde_json::from_value::<TriggerCondition>(serde_json::json!({
            "type": "field_pattern",
            "path": "$.detail.object.key",
            "pattern": "[unclosed"
        }));
        assert!(parsed.is_err());

        let condition: TriggerCondition = serde_json::from_value(serde_json::json!({
            "type": "field_pattern",
            "path": "$.detail.object.key",
            "pattern": r"\.txt$"
        }))
        .unwrap();
        let event = TriggerEvent::object_created("b", BUCKET_ARN, "x.txt");
        assert!(condition.matches(&event));
        assert_eq!(
            serde_json::to_value(&condition).unwrap()["pattern"],
            serde_json::json!(r"\.txt$")
        );
    }

    #[test]
    fn test_event_must_be_object() {
        assert!(TriggerEvent::from_document(serde_json::json!([1, 2])).is_err());
    }

    #[test]
    fn test_rule_from_config() {
        let rule = TriggerRule::object_created(&StackConfig::default()).unwrap();
        assert_eq!(rule.name, "CdkNewObject");
        assert_eq!(rule.target, "CdkStateMachine");
        assert!(rule.enabled);
    }

    #[tokio::test]
    async fn test_trigger_repository() {
        let repo = InMemoryTriggerRepository::new();
        let rule = TriggerRule::new("Test Rule", "sm", rule_condition());

        repo.save(&rule).await.unwrap();
        assert!(repo.get(&rule.id).await.unwrap().is_some());
        assert_eq!(repo.list_enabled().await.unwrap().len(), 1);

        let mut disabled = rule.clone();
        disabled.enabled = false;
        repo.update(&disabled).await.unwrap();
        assert!(repo.list_enabled().await.unwrap().is_empty());

        repo.delete(&rule.id).await.unwrap();
        assert!(repo.get(&rule.id).await.unwrap().is_none());
        assert!(repo.update(&rule).await.is_err());
    }
}
