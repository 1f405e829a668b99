//! Definition and configuration inspection

use anyhow::Result;
use serde_json::json;
use stepflow_core::{ResourceNames, StackConfig};
use stepflow_workflow::StateMachineDefinition;
use tabled::Table;

use super::load_config;
use crate::cli::Args;
use crate::output::{self, OutputFormat, SettingRow};

pub fn definition(args: &Args) -> Result<()> {
    let config = load_config(args)?;
    let names = ResourceNames::from_config(&config)?;
    let definition = StateMachineDefinition::failure_routing(&config)?;
    let graph = definition.validate()?;

    tracing::debug!(
        states = definition.states.len(),
        depth = graph.depth(),
        "Definition validated"
    );

    output::print_json(&definition.to_asl(&names))
}

pub fn config(args: &Args) -> Result<()> {
    let config = load_config(args)?;
    let names = ResourceNames::from_config(&config)?;

    match args.format {
        OutputFormat::Json => output::print_json(&json!({ "config": config, "resources": names })),
        OutputFormat::Text => {
            println!("{}", Table::new(setting_rows(&config, &names)));
            Ok(())
        }
    }
}

fn setting_rows(config: &StackConfig, names: &ResourceNames) -> Vec<SettingRow> {
    let mut rows = vec![
        SettingRow::new("Stack", config.stack_name.clone()),
        SettingRow::new("Account", names.account.clone()),
        SettingRow::new("Region", names.region.clone()),
        SettingRow::new("Bucket", names.bucket_arn.clone()),
        SettingRow::new("Rule", names.rule_arn.clone()),
        SettingRow::new("Key suffix", config.key_suffix.clone()),
        SettingRow::new("Function", names.function_arn.clone()),
        SettingRow::new(
            "Topic",
            format!("{} ({})", names.topic_arn, config.topic_display_name),
        ),
        SettingRow::new("State machine", names.state_machine_arn.clone()),
        SettingRow::new(
            "Notify",
            config.notification_email.clone().unwrap_or_else(|| "-".to_string()),
        ),
    ];
    rows.extend(
        config
            .tags
            .iter()
            .map(|(key, value)| SettingRow::new("Tag", format!("{}={}", key, value))),
    );
    rows
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setting_rows() {
        let config = StackConfig::default()
            .with_account("123456789012")
            .with_notification_email("ops@example.com");
        let names = ResourceNames::from_config(&config).unwrap();

        let rows = setting_rows(&config, &names);
        let account = rows.iter().find(|r| r.setting == "Account").unwrap();
        assert_eq!(account.value, "123456789012");
        assert_eq!(rows.iter().filter(|r| r.setting == "Tag").count(), 2);

        let table = Table::new(rows).to_string();
        assert!(table.contains("arn:aws:sns:us-east-1:123456789012:CdkFailureTopic"));
    }
}
