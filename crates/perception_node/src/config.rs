//! Configuration management for the perception node.
//!
//! This module handles loading and validation of node configuration from TOML
//! files: the node identity, logging, and the subscriptions to open on the
//! local bus.

use perception_bus::ObjectType;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use tracing::info;

fn default_input() -> String {
    "-".to_string()
}

fn default_trigger() -> bool {
    true
}

/// Application configuration loaded from TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Node identity and replay source
    pub node: NodeSettings,
    /// Logging configuration settings
    pub logging: LoggingSettings,
    /// Subscriptions opened at startup
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionSettings>,
}

/// Node identity and replay source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSettings {
    /// Agent name stamped on outbound filter updates
    pub agent_name: String,
    /// Replay input: "-" for stdin, otherwise a file path
    #[serde(default = "default_input")]
    pub input: String,
}

/// Logging system configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Whether to output logs in JSON format
    pub json_format: bool,
}

/// Which filter a subscription uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionKind {
    Perception,
    Namespace,
    SubObject,
    Types,
}

/// One subscription on the local bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionSettings {
    pub name: String,
    pub kind: SubscriptionKind,
    pub message_types: Vec<String>,
    /// Allowed namespaces (`namespace` and `sub_object` kinds)
    #[serde(default)]
    pub namespaces: Vec<String>,
    /// Initial targets (`perception` kind)
    #[serde(default)]
    pub targets: Vec<u64>,
    /// Initial subjects, or sub-objects for the `sub_object` kind
    #[serde(default)]
    pub subjects: Vec<u64>,
    /// Object type names allowed for subject matching
    #[serde(default)]
    pub subject_object_types: Vec<String>,
    #[serde(default)]
    pub match_all_subjects: bool,
    #[serde(default)]
    pub match_subjects: bool,
    /// Attach a perception trigger (`perception` kind)
    #[serde(default = "default_trigger")]
    pub trigger: bool,
    /// Name of a `perception` subscription whose filter a `sub_object`
    /// subscription also consults
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub perception: Option<String>,
}

impl SubscriptionSettings {
    pub fn new(name: &str, kind: SubscriptionKind, message_types: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            kind,
            message_types: message_types.iter().map(|t| t.to_string()).collect(),
            namespaces: Vec::new(),
            targets: Vec::new(),
            subjects: Vec::new(),
            subject_object_types: Vec::new(),
            match_all_subjects: false,
            match_subjects: false,
            trigger: kind == SubscriptionKind::Perception,
            perception: None,
        }
    }

    /// Resolves `subject_object_types`, `None` when no restriction is set.
    pub fn object_types(&self) -> Result<Option<Vec<ObjectType>>, String> {
        if self.subject_object_types.is_empty() {
            return Ok(None);
        }
        self.subject_object_types
            .iter()
            .map(|name| {
                ObjectType::from_name(name).ok_or_else(|| {
                    format!(
                        "Subscription '{}': unknown object type '{}'",
                        self.name, name
                    )
                })
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Some)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node: NodeSettings {
                agent_name: "perception-node".to_string(),
                input: default_input(),
            },
            logging: LoggingSettings {
                level: "info".to_string(),
                json_format: false,
            },
            subscriptions: vec![SubscriptionSettings::new(
                "player-view",
                SubscriptionKind::Perception,
                &["ao.PERCEPTION", "ao.PROPERTY"],
            )],
        }
    }
}

impl AppConfig {
    /// Loads configuration from a TOML file.
    ///
    /// If the file doesn't exist, a default configuration is written to
    /// `path` and returned.
    pub async fn load_from_file(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        if path.exists() {
            let content = tokio::fs::read_to_string(path).await?;
            let config: AppConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            let default_config = AppConfig::default();
            let toml_content = toml::to_string_pretty(&default_config)?;
            tokio::fs::write(path, toml_content).await?;
            info!("Created default configuration file: {}", path.display());
            Ok(default_config)
        }
    }

    /// Validates the configuration settings.
    pub fn validate(&self) -> Result<(), String> {
        if self.node.agent_name.trim().is_empty() {
            return Err("Agent name cannot be empty".to_string());
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(format!(
                "Invalid log level: {}. Must be one of: {valid_levels:?}",
                &self.logging.level
            ));
        }

        let mut names = HashSet::new();
        for subscription in &self.subscriptions {
            if !names.insert(subscription.name.as_str()) {
                return Err(format!("Duplicate subscription name: {}", subscription.name));
            }
            if subscription.message_types.is_empty() {
                return Err(format!(
                    "Subscription '{}' must declare at least one message type",
                    subscription.name
                ));
            }
            let needs_namespaces = matches!(
                subscription.kind,
                SubscriptionKind::Namespace | SubscriptionKind::SubObject
            );
            if needs_namespaces && subscription.namespaces.is_empty() {
                return Err(format!(
                    "Subscription '{}' must declare at least one namespace",
                    subscription.name
                ));
            }
            subscription.object_types()?;
        }

        for subscription in &self.subscriptions {
            let Some(linked) = &subscription.perception else {
                continue;
            };
            if subscription.kind != SubscriptionKind::SubObject {
                return Err(format!(
                    "Subscription '{}': only sub_object subscriptions may link a perception filter",
                    subscription.name
                ));
            }
            let target = self.subscriptions.iter().find(|s| &s.name == linked);
            if !target.is_some_and(|s| s.kind == SubscriptionKind::Perception) {
                return Err(format!(
                    "Subscription '{}': '{}' is not a perception subscription",
                    subscription.name, linked
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{NamedTempFile, TempDir};
    use tokio::fs;

    #[test]
    fn test_app_config_default() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());

        assert_eq!(config.node.agent_name, "perception-node");
        assert_eq!(config.node.input, "-");
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.json_format);

        let view = &config.subscriptions[0];
        assert_eq!(view.kind, SubscriptionKind::Perception);
        assert!(view.trigger);
        assert!(!view.match_subjects);
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.node.agent_name = "  ".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.subscriptions.push(config.subscriptions[0].clone());
        assert!(config.validate().unwrap_err().contains("Duplicate"));

        let mut config = AppConfig::default();
        config.subscriptions[0].message_types.clear();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.subscriptions.push(SubscriptionSettings::new(
            "combat",
            SubscriptionKind::Namespace,
            &["ao.PROPERTY"],
        ));
        assert!(config.validate().unwrap_err().contains("namespace"));

        let mut config = AppConfig::default();
        config.subscriptions[0].subject_object_types = vec!["dragon".to_string()];
        assert!(config.validate().unwrap_err().contains("dragon"));
    }

    #[test]
    fn test_perception_links_must_name_perception_subscriptions() {
        let mut config = AppConfig::default();
        let mut records = SubscriptionSettings::new(
            "records",
            SubscriptionKind::SubObject,
            &["ao.PROPERTY"],
        );
        records.namespaces = vec!["persistence".to_string()];
        records.perception = Some("player-view".to_string());
        config.subscriptions.push(records);
        assert!(config.validate().is_ok());

        config.subscriptions[1].perception = Some("missing".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_object_type_names_resolve() {
        let mut settings = SubscriptionSettings::new("view", SubscriptionKind::Perception, &["ao.PROPERTY"]);
        assert_eq!(settings.object_types(), Ok(None));
        settings.subject_object_types = vec!["player".to_string(), "mob".to_string()];
        assert_eq!(
            settings.object_types(),
            Ok(Some(vec![ObjectType::PLAYER, ObjectType::MOB]))
        );
    }

    #[tokio::test]
    async fn test_load_from_nonexistent_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("perception-node.toml");

        let config = AppConfig::load_from_file(&path).await.unwrap();
        assert_eq!(config.node.agent_name, "perception-node");
        assert!(path.exists());

        // The written default loads back identically.
        let reloaded = AppConfig::load_from_file(&path).await.unwrap();
        assert_eq!(reloaded.subscriptions.len(), 1);
        assert_eq!(reloaded.subscriptions[0].name, "player-view");
    }

    #[tokio::test]
    async fn test_load_from_existing_file() {
        let toml_content = r#"
[node]
agent_name = "proxy-7"

[logging]
level = "debug"
json_format = true

[[subscriptions]]
name = "player-view"
kind = "perception"
message_types = ["ao.PERCEPTION", "ao.PROPERTY"]
targets = [1001, 1002]
subject_object_types = ["player"]
match_subjects = true

[[subscriptions]]
name = "combat"
kind = "namespace"
message_types = ["ao.PROPERTY"]
namespaces = ["combat"]
"#;

        let temp_file = NamedTempFile::new().unwrap();
        fs::write(temp_file.path(), toml_content).await.unwrap();

        let config = AppConfig::load_from_file(&temp_file.path().to_path_buf())
            .await
            .unwrap();
        assert!(config.validate().is_ok());

        assert_eq!(config.node.agent_name, "proxy-7");
        assert_eq!(config.node.input, "-");
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json_format);

        let view = &config.subscriptions[0];
        assert_eq!(view.targets, vec![1001, 1002]);
        assert!(view.match_subjects);
        assert!(view.trigger);

        let combat = &config.subscriptions[1];
        assert_eq!(combat.kind, SubscriptionKind::Namespace);
        assert_eq!(combat.namespaces, vec!["combat"]);
    }
}
