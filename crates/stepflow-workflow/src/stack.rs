//! Local wiring of the whole stack: bucket trigger, job, topic, state machine

use crate::definition::StateMachineDefinition;
use crate::engine::WorkflowEngine;
use crate::execution::WorkflowExecution;
use crate::task::{FunctionInvoker, InMemoryTopic, PlaceholderJob, TopicPublisher};
use crate::triggers::{InMemoryTriggerRepository, TriggerEvent, TriggerManager, TriggerRule};
use crate::Result;
use std::sync::Arc;
use stepflow_core::{ResourceNames, StackConfig};

/// All resources of one failure-routing stack
pub struct Stack {
    config: StackConfig,
    names: ResourceNames,
    engine: Arc<WorkflowEngine>,
    triggers: Arc<TriggerManager>,
    rule: TriggerRule,
}

impl Stack {
    /// Stack backed by the always-failing placeholder job and an in-memory
    /// topic subscribed with the configured email address
    pub async fn local(config: StackConfig) -> Result<(Self, Arc<PlaceholderJob>, Arc<InMemoryTopic>)> {
        let job = Arc::new(PlaceholderJob::new());
        let topic = Arc::new(InMemoryTopic::new(
            &config.topic_name,
            &config.topic_display_name,
        ));
        if let Some(email) = &config.notification_email {
            topic.subscribe_email(email.clone()).await;
        }

        let stack = Self::new(config, job.clone(), topic.clone()).await?;
        Ok((stack, job, topic))
    }

    /// Stack with caller-provided collaborators
    pub async fn new(
        config: StackConfig,
        invoker: Arc<dyn FunctionInvoker>,
        publisher: Arc<dyn TopicPublisher>,
    ) -> Result<Self> {
        config.validate()?;
        let names = ResourceNames::from_config(&config)?;

        let definition = StateMachineDefinition::failure_routing(&config)?;
        let engine = Arc::new(
            WorkflowEngine::new(definition, invoker, publisher)?
                .with_execution_arn_prefix(names.execution_arn_prefix()),
        );

        let triggers = Arc::new(TriggerManager::new(Arc::new(
            InMemoryTriggerRepository::new(),
        )));
        triggers.register_target(engine.clone()).await;
        let rule = triggers.create(TriggerRule::object_created(&config)?).await?;

        tracing::info!(
            stack = %config.stack_name,
            bucket = %config.bucket_name,
            rule = %rule.name,
            state_machine = %config.state_machine_name,
            "Stack ready"
        );

        Ok(Self {
            config,
            names,
            engine,
            triggers,
            rule,
        })
    }

    pub fn config(&self) -> &StackConfig {
        &self.config
    }

    pub fn names(&self) -> &ResourceNames {
        &self.names
    }

    pub fn engine(&self) -> &Arc<WorkflowEngine> {
        &self.engine
    }

    pub fn triggers(&self) -> &Arc<TriggerManager> {
        &self.triggers
    }

    pub fn rule(&self) -> &TriggerRule {
        &self.rule
    }

    /// Notification for a new object in the configured bucket
    pub fn object_created(&self, key: &str) -> TriggerEvent {
        TriggerEvent::object_created(&self.config.bucket_name, &self.names.bucket_arn, key)
    }

    /// Deliver one event and wait for the executions it started
    pub async fn deliver(&self, event: TriggerEvent) -> Result<Vec<WorkflowExecution>> {
        let ids = self.triggers.process_event(event).await?;
        let mut executions = Vec::with_capacity(ids.len());
        for id in ids {
            executions.push(self.engine.wait_for_completion(&id).await?);
        }
        Ok(executions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::ExecutionStatus;

    fn config() -> StackConfig {
        StackConfig::default()
            .with_account("123456789012")
            .with_notification_email("ops@example.com")
    }

    #[tokio::test]
    async fn test_local_stack_routes_failure_to_subscriber() {
        let (stack, job, topic) = Stack::local(config()).await.unwrap();

        let executions = stack
            .deliver(stack.object_created("reports/jan.txt"))
            .await
            .unwrap();

        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].status, ExecutionStatus::Failed);
        assert!(executions[0]
            .execution_arn
            .starts_with("arn:aws:states:us-east-1:123456789012:execution:CdkStateMachine:"));
        assert_eq!(job.invocation_count(), 1);

        let deliveries = topic.deliveries().await;
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].endpoint, "ops@example.com");
    }

    #[tokio::test]
    async fn test_stack_requires_email() {
        let result = Stack::local(StackConfig::default().with_account("123456789012")).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_stack_requires_account() {
        let config = StackConfig::default().with_notification_email("ops@example.com");
        let result = Stack::local(config).await;
        assert!(matches!(
            result,
            Err(crate::WorkflowError::Config(stepflow_core::CoreError::Missing(_)))
        ));
    }
}
