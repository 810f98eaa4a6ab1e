//! Replay records and the subscriptions they are applied to.
//!
//! A replay file holds one JSON record per line:
//!
//! ```text
//! {"publish": {"kind": "perception", "msg_type": "ao.PERCEPTION", "target": 1001, "gain": [...]}}
//! {"filter_update": {"subscription": "player-view", "sender": "world", "update": {"instructions": [...]}}}
//! ```

use crate::config::{AppConfig, SubscriptionKind, SubscriptionSettings};
use perception_bus::{
    AgentId, BusError, ChannelUpdateSink, Filter, FilterUpdate, LocalBus, Message,
    MessageTrigger, MessageType, MessageTypeFilter, Namespace, NamespaceFilter, Oid,
    PerceptionFilter, PerceptionTrigger, SubObjectFilter, SubscriptionHandle,
    UpdateTriggerRegistry,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One line of replay input.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayRecord {
    /// Publish a message on the local bus
    Publish(Message),
    /// Apply a filter update received from a remote agent
    FilterUpdate(RemoteFilterUpdate),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteFilterUpdate {
    /// Name of the local subscription the update targets
    pub subscription: String,
    pub sender: AgentId,
    pub update: FilterUpdate,
}

/// What a replayed line did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayOutcome {
    /// A message was published and delivered this many times
    Delivered(usize),
    /// A filter update was applied; true if the filter's sets changed
    Applied(bool),
    /// The line was empty
    Blank,
    /// A filter update named a subscription that does not exist
    UnknownSubscription(String),
}

/// Owns the local bus and the configured subscriptions.
pub struct Replayer {
    bus: LocalBus,
    handles: HashMap<String, SubscriptionHandle>,
}

impl Replayer {
    /// Opens every configured subscription on a fresh bus.
    pub fn from_config(config: &AppConfig, sink: ChannelUpdateSink) -> Result<Self, BusError> {
        let mut replayer = Self {
            bus: LocalBus::new(sink, Arc::new(UpdateTriggerRegistry::new())),
            handles: HashMap::new(),
        };

        // Perception subscriptions first so sub-object filters can link them.
        let mut perception_filters: HashMap<&str, Arc<PerceptionFilter>> = HashMap::new();
        for settings in config
            .subscriptions
            .iter()
            .filter(|s| s.kind == SubscriptionKind::Perception)
        {
            let filter = replayer.open_perception(settings)?;
            perception_filters.insert(settings.name.as_str(), filter);
        }

        for settings in config
            .subscriptions
            .iter()
            .filter(|s| s.kind != SubscriptionKind::Perception)
        {
            let types = message_types(settings);
            let filter: Arc<dyn Filter> = match settings.kind {
                SubscriptionKind::Namespace => {
                    Arc::new(NamespaceFilter::new(types, namespaces(settings)))
                }
                SubscriptionKind::SubObject => {
                    let mut filter = SubObjectFilter::new(types, namespaces(settings));
                    if let Some(linked) = settings
                        .perception
                        .as_deref()
                        .and_then(|name| perception_filters.get(name))
                    {
                        filter = filter.with_perception(linked.clone());
                    }
                    for &oid in &settings.subjects {
                        filter.add_sub_object(Oid(oid));
                    }
                    Arc::new(filter)
                }
                SubscriptionKind::Types | SubscriptionKind::Perception => {
                    Arc::new(MessageTypeFilter::new(types))
                }
            };
            replayer.open(settings, filter, None);
        }

        Ok(replayer)
    }

    fn open_perception(
        &mut self,
        settings: &SubscriptionSettings,
    ) -> Result<Arc<PerceptionFilter>, BusError> {
        let filter = Arc::new(PerceptionFilter::new(message_types(settings)));
        filter.set_match_subjects(settings.match_subjects);
        filter.set_match_all_subjects(settings.match_all_subjects);
        match settings.object_types() {
            Ok(types) => filter.set_subject_object_types(types.as_deref()),
            Err(e) => warn!("⚠️ {e}; subject type restriction ignored"),
        }
        for &oid in &settings.subjects {
            filter.add_subject(Oid(oid));
        }

        let trigger = settings
            .trigger
            .then(|| Arc::new(PerceptionTrigger::new()) as Arc<dyn MessageTrigger>);
        let handle = self.open(settings, filter.clone(), trigger);
        for &oid in &settings.targets {
            self.bus.add_target(handle, Oid(oid))?;
        }
        Ok(filter)
    }

    fn open(
        &mut self,
        settings: &SubscriptionSettings,
        filter: Arc<dyn Filter>,
        trigger: Option<Arc<dyn MessageTrigger>>,
    ) -> SubscriptionHandle {
        let name = settings.name.clone();
        let handle = self.bus.subscribe(filter, trigger, move |handle, message| {
            info!(
                "📨 {} ({}) <- {} {}",
                name,
                handle,
                message.kind_name(),
                message.msg_type()
            );
        });
        info!(
            "🔌 Opened {:?} subscription '{}' as {}",
            settings.kind, settings.name, handle
        );
        self.handles.insert(settings.name.clone(), handle);
        handle
    }

    pub fn bus(&self) -> &LocalBus {
        &self.bus
    }

    pub fn handle(&self, name: &str) -> Option<SubscriptionHandle> {
        self.handles.get(name).copied()
    }

    pub fn name_of(&self, handle: SubscriptionHandle) -> Option<&str> {
        self.handles
            .iter()
            .find(|(_, h)| **h == handle)
            .map(|(name, _)| name.as_str())
    }

    /// Parses and applies one replay line.
    pub fn handle_line(&self, line: &str) -> Result<ReplayOutcome, BusError> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(ReplayOutcome::Blank);
        }
        match serde_json::from_str::<ReplayRecord>(line)? {
            ReplayRecord::Publish(message) => Ok(ReplayOutcome::Delivered(self.bus.publish(&message))),
            ReplayRecord::FilterUpdate(remote) => {
                let Some(handle) = self.handle(&remote.subscription) else {
                    return Ok(ReplayOutcome::UnknownSubscription(remote.subscription));
                };
                debug!(
                    "Applying {} instructions from {} to '{}'",
                    remote.update.len(),
                    remote.sender,
                    remote.subscription
                );
                let changed = self
                    .bus
                    .apply_filter_update(handle, &remote.update, &remote.sender)?;
                Ok(ReplayOutcome::Applied(changed))
            }
        }
    }
}

fn message_types(settings: &SubscriptionSettings) -> Vec<MessageType> {
    settings
        .message_types
        .iter()
        .map(|name| MessageType::intern(name))
        .collect()
}

fn namespaces(settings: &SubscriptionSettings) -> Vec<Namespace> {
    settings
        .namespaces
        .iter()
        .map(|name| Namespace::intern(name))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use perception_bus::OutboundFilterUpdate;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn replayer(config: &AppConfig) -> (Replayer, UnboundedReceiver<OutboundFilterUpdate>) {
        let (sink, rx) = ChannelUpdateSink::channel(AgentId::new(config.node.agent_name.clone()));
        (Replayer::from_config(config, sink).unwrap(), rx)
    }

    fn proxy_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.subscriptions[0].targets = vec![1001];
        config.subscriptions[0].match_subjects = true;

        let mut records = SubscriptionSettings::new("records", SubscriptionKind::SubObject, &["db.RECORD"]);
        records.namespaces = vec!["persistence".to_string()];
        records.perception = Some("player-view".to_string());
        config.subscriptions.push(records);
        config
    }

    #[tokio::test]
    async fn perception_traffic_drives_subjects_and_outbound_updates() {
        let config = proxy_config();
        let (replayer, mut rx) = replayer(&config);

        // Initial target is replicated on startup.
        let initial = rx.recv().await.unwrap();
        assert_eq!(Some(initial.subscription), replayer.handle("player-view"));
        assert_eq!(initial.sender, AgentId::new("perception-node"));

        let gain = r#"{"publish": {"kind": "perception", "msg_type": "ao.PERCEPTION", "target": 1001,
            "gain": [{"target": 1001, "subject": 5001, "object_type": "mob"}]}}"#;
        assert_eq!(replayer.handle_line(gain).unwrap(), ReplayOutcome::Delivered(1));

        let update = rx.recv().await.unwrap();
        let mut expected = FilterUpdate::new();
        expected.add_subject(Oid(5001));
        assert_eq!(update.update, expected);

        let record = r#"{"publish": {"kind": "subject", "msg_type": "db.RECORD", "subject": 5001, "namespace": "persistence"}}"#;
        assert_eq!(replayer.handle_line(record).unwrap(), ReplayOutcome::Delivered(1));
    }

    #[test]
    fn remote_updates_resolve_subscriptions_by_name() {
        let config = AppConfig::default();
        let (replayer, _rx) = replayer(&config);

        let line = r#"{"filter_update": {"subscription": "player-view", "sender": "world",
            "update": {"instructions": [{"op": "ADD", "field": 1, "oid": 7}]}}}"#;
        assert_eq!(replayer.handle_line(line).unwrap(), ReplayOutcome::Applied(true));

        let handle = replayer.handle("player-view").unwrap();
        assert_eq!(replayer.name_of(handle), Some("player-view"));
        let filter = replayer.bus().filter(handle).unwrap();
        assert!(filter.as_perception().unwrap().has_target(Oid(7)));

        let unknown = line.replace("player-view", "nobody");
        assert_eq!(
            replayer.handle_line(&unknown).unwrap(),
            ReplayOutcome::UnknownSubscription("nobody".to_string())
        );
    }

    #[test]
    fn blank_and_malformed_lines() {
        let (replayer, _rx) = replayer(&AppConfig::default());
        assert_eq!(replayer.handle_line("   ").unwrap(), ReplayOutcome::Blank);
        assert!(matches!(
            replayer.handle_line("{\"publish\": 3}"),
            Err(BusError::Json(_))
        ));
    }
}
