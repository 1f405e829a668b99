use crate::error::{CoreError, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Environment prefix for stack configuration overrides
pub const ENV_PREFIX: &str = "STEPFLOW";

/// Configuration for one failure-routing stack.
///
/// Resource names are fixed literals rather than generated ones, so only one
/// stack with a given configuration can exist per account and region.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StackConfig {
    #[serde(default = "default_stack_name")]
    pub stack_name: String,
    #[serde(default)]
    pub account: Option<String>,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default = "default_bucket_name")]
    pub bucket_name: String,
    #[serde(default = "default_rule_name")]
    pub rule_name: String,
    #[serde(default = "default_key_suffix")]
    pub key_suffix: String,
    #[serde(default = "default_function_name")]
    pub function_name: String,
    #[serde(default = "default_topic_name")]
    pub topic_name: String,
    #[serde(default = "default_topic_display_name")]
    pub topic_display_name: String,
    #[serde(default = "default_state_machine_name")]
    pub state_machine_name: String,
    #[serde(default = "default_job_state_name")]
    pub job_state_name: String,
    #[serde(default = "default_notify_state_name")]
    pub notify_state_name: String,
    #[serde(default = "default_succeeded_state_name")]
    pub succeeded_state_name: String,
    #[serde(default = "default_failed_state_name")]
    pub failed_state_name: String,
    /// Destination address for failure notifications, supplied at deploy time
    #[serde(default)]
    pub notification_email: Option<String>,
    #[serde(default = "default_tags")]
    pub tags: BTreeMap<String, String>,
}

impl StackConfig {
    /// Load configuration from environment variables
    pub fn load() -> Result<Self> {
        Self::load_from_env(ENV_PREFIX)
    }

    /// Load configuration from environment with custom prefix.
    ///
    /// `AWS_ACCOUNT` and `AWS_REGION` are honoured the same way the deployment
    /// entry point read them, so account and region never live in a file.
    pub fn load_from_env(prefix: &str) -> Result<Self> {
        let builder = Self::with_defaults(Config::builder())?
            .add_source(
                Environment::with_prefix(prefix)
                    .separator("__")
                    .try_parsing(true),
            )
            .set_override_option("account", std::env::var("AWS_ACCOUNT").ok())?
            .set_override_option("region", std::env::var("AWS_REGION").ok())?;

        let config = builder.build()?;
        Ok(config.try_deserialize()?)
    }

    /// Load configuration from file with environment overrides
    pub fn load_from_file(path: &str) -> Result<Self> {
        let builder = Self::with_defaults(Config::builder())?
            .add_source(File::with_name(path))
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
            .set_override_option("account", std::env::var("AWS_ACCOUNT").ok())?
            .set_override_option("region", std::env::var("AWS_REGION").ok())?;

        let config = builder.build()?;
        Ok(config.try_deserialize()?)
    }

    fn with_defaults(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<config::ConfigBuilder<config::builder::DefaultState>> {
        Ok(builder
            .set_default("stack_name", default_stack_name())?
            .set_default("region", default_region())?
            .set_default("bucket_name", default_bucket_name())?
            .set_default("rule_name", default_rule_name())?
            .set_default("key_suffix", default_key_suffix())?
            .set_default("function_name", default_function_name())?
            .set_default("topic_name", default_topic_name())?
            .set_default("topic_display_name", default_topic_display_name())?
            .set_default("state_machine_name", default_state_machine_name())?
            .set_default("job_state_name", default_job_state_name())?
            .set_default("notify_state_name", default_notify_state_name())?
            .set_default("succeeded_state_name", default_succeeded_state_name())?
            .set_default("failed_state_name", default_failed_state_name())?)
    }

    pub fn with_account(mut self, account: impl Into<String>) -> Self {
        self.account = Some(account.into());
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    pub fn with_bucket_name(mut self, bucket_name: impl Into<String>) -> Self {
        self.bucket_name = bucket_name.into();
        self
    }

    pub fn with_key_suffix(mut self, key_suffix: impl Into<String>) -> Self {
        self.key_suffix = key_suffix.into();
        self
    }

    pub fn with_notification_email(mut self, email: impl Into<String>) -> Self {
        self.notification_email = Some(email.into());
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Account id; every ARN except the bucket's needs one
    pub fn account(&self) -> Result<&str> {
        match self.account.as_deref().map(str::trim) {
            Some(account) if !account.is_empty() => Ok(account),
            _ => Err(CoreError::Missing("account".to_string())),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let identifiers = [
            ("stack_name", &self.stack_name),
            ("region", &self.region),
            ("bucket_name", &self.bucket_name),
            ("rule_name", &self.rule_name),
            ("function_name", &self.function_name),
            ("topic_name", &self.topic_name),
            ("state_machine_name", &self.state_machine_name),
            ("job_state_name", &self.job_state_name),
            ("notify_state_name", &self.notify_state_name),
            ("succeeded_state_name", &self.succeeded_state_name),
            ("failed_state_name", &self.failed_state_name),
        ];

        for (field, value) in identifiers {
            if value.trim().is_empty() {
                return Err(CoreError::invalid(field, "must not be empty"));
            }
        }

        let account = self.account()?;
        if account.len() != 12 || !account.chars().all(|c| c.is_ascii_digit()) {
            return Err(CoreError::invalid(
                "account",
                format!("'{}' is not a 12-digit account id", account),
            ));
        }

        if self.key_suffix.is_empty() {
            return Err(CoreError::invalid("key_suffix", "must not be empty"));
        }

        // State names share one namespace within the machine
        let mut state_names = vec![
            &self.job_state_name,
            &self.notify_state_name,
            &self.succeeded_state_name,
            &self.failed_state_name,
        ];
        state_names.sort();
        state_names.dedup();
        if state_names.len() != 4 {
            return Err(CoreError::invalid("state names", "must be distinct"));
        }

        match self.notification_email.as_deref() {
            None => Err(CoreError::Missing("notification_email".to_string())),
            Some(email) if !is_plausible_email(email) => Err(CoreError::invalid(
                "notification_email",
                format!("'{}' is not an email address", email),
            )),
            Some(_) => Ok(()),
        }
    }
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            stack_name: default_stack_name(),
            account: None,
            region: default_region(),
            bucket_name: default_bucket_name(),
            rule_name: default_rule_name(),
            key_suffix: default_key_suffix(),
            function_name: default_function_name(),
            topic_name: default_topic_name(),
            topic_display_name: default_topic_display_name(),
            state_machine_name: default_state_machine_name(),
            job_state_name: default_job_state_name(),
            notify_state_name: default_notify_state_name(),
            succeeded_state_name: default_succeeded_state_name(),
            failed_state_name: default_failed_state_name(),
            notification_email: None,
            tags: default_tags(),
        }
    }
}

fn is_plausible_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, domain)) => !local.is_empty() && domain.contains('.') && !domain.starts_with('.'),
        None => false,
    }
}

fn default_stack_name() -> String {
    "CdkSimpleWorkflow".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_bucket_name() -> String {
    "cdk-simple-workflow-bucket".to_string()
}

fn default_rule_name() -> String {
    "CdkNewObject".to_string()
}

fn default_key_suffix() -> String {
    ".txt".to_string()
}

fn default_function_name() -> String {
    "CdkFailureLambda".to_string()
}

fn default_topic_name() -> String {
    "CdkFailureTopic".to_string()
}

fn default_topic_display_name() -> String {
    "Topic for Sfn Error Notification".to_string()
}

fn default_state_machine_name() -> String {
    "CdkStateMachine".to_string()
}

fn default_job_state_name() -> String {
    "CdkSubmitJob".to_string()
}

fn default_notify_state_name() -> String {
    "CdkPublishMessage".to_string()
}

fn default_succeeded_state_name() -> String {
    "Succeeded".to_string()
}

fn default_failed_state_name() -> String {
    "TaskFailed".to_string()
}

fn default_tags() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("IaC".to_string(), "cdk".to_string()),
        ("Project".to_string(), "cdk-simple-sfn".to_string()),
    ])
}
