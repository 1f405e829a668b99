//! External collaborators reached from task states
//!
//! The engine only needs two things from the outside world: a compute unit it
//! can invoke with a payload, and a topic it can publish a message to. Both
//! are traits so the hosting environment decides what sits behind them.

use crate::state::ErrorDocument;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Error name reported for failed publish requests
pub const ERROR_PUBLISH_FAILED: &str = "SNS.PublishFailed";

/// Failure reported by a compute unit
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{error}: {cause}")]
pub struct InvocationError {
    /// Error type, e.g. the exception class raised by the function
    pub error: String,
    /// Human-readable cause
    pub cause: String,
}

impl InvocationError {
    pub fn new(error: impl Into<String>, cause: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            cause: cause.into(),
        }
    }
}

impl From<InvocationError> for ErrorDocument {
    fn from(err: InvocationError) -> Self {
        ErrorDocument::new(err.error, err.cause)
    }
}

/// Failure to deliver a publish request to the topic
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Publish to {topic_name} failed: {reason}")]
pub struct PublishError {
    pub topic_name: String,
    pub reason: String,
}

impl From<PublishError> for ErrorDocument {
    fn from(err: PublishError) -> Self {
        ErrorDocument::new(ERROR_PUBLISH_FAILED, err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishRequest {
    pub topic_name: String,
    pub message: String,
}

/// Confirmation that the topic accepted a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReceipt {
    pub message_id: String,
}

/// Compute unit invoked by a task state
#[async_trait]
pub trait FunctionInvoker: Send + Sync {
    /// Invoke `function_name` once with `payload`
    async fn invoke(&self, function_name: &str, payload: &Value) -> Result<Value, InvocationError>;
}

/// Notification topic a task state publishes to
#[async_trait]
pub trait TopicPublisher: Send + Sync {
    /// Publish and wait for the topic to confirm acceptance
    async fn publish(&self, request: PublishRequest) -> Result<PublishReceipt, PublishError>;
}

/// Compute unit standing in for future business logic; every invocation fails
pub struct PlaceholderJob {
    error: String,
    cause: String,
    invocations: AtomicUsize,
}

impl PlaceholderJob {
    pub fn new() -> Self {
        Self::failing_with("Exception", "placeholder job is not implemented")
    }

    pub fn failing_with(error: impl Into<String>, cause: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            cause: cause.into(),
            invocations: AtomicUsize::new(0),
        }
    }

    pub fn invocation_count(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

impl Default for PlaceholderJob {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FunctionInvoker for PlaceholderJob {
    async fn invoke(&self, function_name: &str, _payload: &Value) -> Result<Value, InvocationError> {
        let count = self.invocations.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(function = %function_name, invocations = count, "Placeholder job invoked");
        Err(InvocationError::new(self.error.clone(), self.cause.clone()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionProtocol {
    Email,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub protocol: SubscriptionProtocol,
    pub endpoint: String,
}

/// A message accepted by the topic
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishedMessage {
    pub message_id: String,
    pub topic_name: String,
    pub message: String,
    pub published_at: DateTime<Utc>,
}

/// A message handed to one subscriber
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delivery {
    pub message_id: String,
    pub endpoint: String,
    pub body: String,
}

/// Topic kept in process memory; publishing is safe from concurrent executions
pub struct InMemoryTopic {
    name: String,
    display_name: String,
    subscriptions: RwLock<Vec<Subscription>>,
    messages: RwLock<Vec<PublishedMessage>>,
    deliveries: RwLock<Vec<Delivery>>,
    fail_publishes: AtomicBool,
}

impl InMemoryTopic {
    pub fn new(name: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            display_name: display_name.into(),
            subscriptions: RwLock::new(Vec::new()),
            messages: RwLock::new(Vec::new()),
            deliveries: RwLock::new(Vec::new()),
            fail_publishes: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub async fn subscribe_email(&self, address: impl Into<String>) {
        let endpoint = address.into();
        info!(topic = %self.name, endpoint = %endpoint, "Added email subscription");
        self.subscriptions.write().await.push(Subscription {
            protocol: SubscriptionProtocol::Email,
            endpoint,
        });
    }

    pub async fn subscriptions(&self) -> Vec<Subscription> {
        self.subscriptions.read().await.clone()
    }

    /// Make every subsequent publish fail (or succeed again)
    pub fn set_failing(&self, failing: bool) {
        self.fail_publishes.store(failing, Ordering::SeqCst);
    }

    pub async fn messages(&self) -> Vec<PublishedMessage> {
        self.messages.read().await.clone()
    }

    pub async fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.read().await.clone()
    }
}

#[async_trait]
impl TopicPublisher for InMemoryTopic {
    async fn publish(&self, request: PublishRequest) -> Result<PublishReceipt, PublishError> {
        if request.topic_name != self.name {
            return Err(PublishError {
                topic_name: request.topic_name,
                reason: "topic does not exist".to_string(),
            });
        }

        if self.fail_publishes.load(Ordering::SeqCst) {
            warn!(topic = %self.name, "Rejecting publish request");
            return Err(PublishError {
                topic_name: request.topic_name,
                reason: "topic unavailable".to_string(),
            });
        }

        let message_id = Uuid::new_v4().to_string();

        let subscriptions = self.subscriptions.read().await.clone();
        {
            let mut deliveries = self.deliveries.write().await;
            for subscription in &subscriptions {
                deliveries.push(Delivery {
                    message_id: message_id.clone(),
                    endpoint: subscription.endpoint.clone(),
                    body: request.message.clone(),
                });
            }
        }

        self.messages.write().await.push(PublishedMessage {
            message_id: message_id.clone(),
            topic_name: request.topic_name,
            message: request.message,
            published_at: Utc::now(),
        });

        info!(
            topic = %self.name,
            message_id = %message_id,
            subscribers = subscriptions.len(),
            "Message published"
        );

        Ok(PublishReceipt { message_id })
    }
}
