//! Resource identifiers derived from a [`StackConfig`].

use crate::config::StackConfig;
use crate::error::Result;
use serde::Serialize;

/// Fully qualified names of every resource in the stack
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ResourceNames {
    pub account: String,
    pub region: String,
    pub bucket_arn: String,
    pub rule_arn: String,
    pub function_arn: String,
    pub topic_arn: String,
    pub state_machine_arn: String,
}

impl ResourceNames {
    /// Fails with [`CoreError::Missing`](crate::CoreError::Missing) when no
    /// account is configured
    pub fn from_config(config: &StackConfig) -> Result<Self> {
        let account = config.account()?.to_string();
        let region = config.region.clone();

        let mut names = Self {
            account,
            region,
            // Bucket ARNs carry neither region nor account
            bucket_arn: bucket_arn(&config.bucket_name),
            rule_arn: String::new(),
            function_arn: String::new(),
            topic_arn: String::new(),
            state_machine_arn: String::new(),
        };
        names.rule_arn = names.scoped("events", &format!("rule/{}", config.rule_name));
        names.function_arn = names.function_arn_for(&config.function_name);
        names.topic_arn = names.topic_arn_for(&config.topic_name);
        names.state_machine_arn =
            names.scoped("states", &format!("stateMachine:{}", config.state_machine_name));

        Ok(names)
    }

    pub fn function_arn_for(&self, function_name: &str) -> String {
        self.scoped("lambda", &format!("function:{}", function_name))
    }

    pub fn topic_arn_for(&self, topic_name: &str) -> String {
        self.scoped("sns", topic_name)
    }

    /// Prefix shared by every execution ARN of the state machine
    pub fn execution_arn_prefix(&self) -> String {
        self.state_machine_arn
            .replacen(":stateMachine:", ":execution:", 1)
    }

    /// ARN of a single execution of the state machine
    pub fn execution_arn(&self, execution_id: &str) -> String {
        format!("{}:{}", self.execution_arn_prefix(), execution_id)
    }

    fn scoped(&self, service: &str, resource: &str) -> String {
        format!("arn:aws:{}:{}:{}:{}", service, self.region, self.account, resource)
    }
}

/// ARN of a bucket, which needs no account or region
pub fn bucket_arn(bucket_name: &str) -> String {
    format!("arn:aws:s3:::{}", bucket_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CoreError;

    #[test]
    fn test_arns() {
        let config = StackConfig::default()
            .with_account("123456789012")
            .with_region("eu-central-1");
        let names = ResourceNames::from_config(&config).unwrap();

        assert_eq!(names.bucket_arn, "arn:aws:s3:::cdk-simple-workflow-bucket");
        assert_eq!(
            names.rule_arn,
            "arn:aws:events:eu-central-1:123456789012:rule/CdkNewObject"
        );
        assert_eq!(
            names.topic_arn,
            "arn:aws:sns:eu-central-1:123456789012:CdkFailureTopic"
        );
        assert_eq!(
            names.function_arn,
            "arn:aws:lambda:eu-central-1:123456789012:function:CdkFailureLambda"
        );
        assert_eq!(
            names.execution_arn("abc"),
            "arn:aws:states:eu-central-1:123456789012:execution:CdkStateMachine:abc"
        );
    }

    #[test]
    fn test_missing_account_is_an_error() {
        let result = ResourceNames::from_config(&StackConfig::default());
        assert!(matches!(result, Err(CoreError::Missing(field)) if field == "account"));
    }
}
