//! Main application logic and lifecycle management.
//!
//! The `Application` opens the configured subscriptions, replays input
//! records through the local bus, logs every outbound filter update and
//! reports final statistics on shutdown.

use crate::config::AppConfig;
use crate::replay::{ReplayOutcome, Replayer};
use crate::signals::wait_for_shutdown;
use perception_bus::{AgentId, ChannelUpdateSink, OutboundFilterUpdate};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{error, info, warn};

pub struct Application {
    config: AppConfig,
    replayer: Replayer,
    outbound: UnboundedReceiver<OutboundFilterUpdate>,
}

impl Application {
    /// Creates the application from validated configuration.
    pub fn new(config: AppConfig) -> Result<Self, Box<dyn std::error::Error>> {
        if let Err(e) = config.validate() {
            return Err(format!("Configuration validation failed: {e}").into());
        }

        let agent = AgentId::new(config.node.agent_name.clone());
        let (sink, outbound) = ChannelUpdateSink::channel(agent);
        let replayer = Replayer::from_config(&config, sink)?;

        info!(
            "🚀 Perception node '{}' ready with {} subscriptions",
            config.node.agent_name,
            replayer.bus().subscription_count()
        );
        Ok(Self {
            config,
            replayer,
            outbound,
        })
    }

    async fn open_input(&self) -> Result<Box<dyn AsyncBufRead + Unpin + Send>, Box<dyn std::error::Error>> {
        let input = self.config.node.input.as_str();
        if input == "-" {
            info!("📥 Replaying from stdin");
            Ok(Box::new(BufReader::new(tokio::io::stdin())))
        } else {
            info!("📥 Replaying from {}", input);
            let file = tokio::fs::File::open(input).await?;
            Ok(Box::new(BufReader::new(file)))
        }
    }

    /// Replays input until it ends or a shutdown signal arrives.
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        let mut lines = self.open_input().await?.lines();
        let Self {
            replayer,
            mut outbound,
            ..
        } = self;
        let shutdown = wait_for_shutdown();
        tokio::pin!(shutdown);

        let mut line_number = 0usize;
        loop {
            tokio::select! {
                line = lines.next_line() => match line? {
                    Some(line) => {
                        line_number += 1;
                        replay_line(&replayer, line_number, &line);
                    }
                    None => {
                        info!("📄 End of replay input after {} lines", line_number);
                        break;
                    }
                },
                Some(update) = outbound.recv() => log_outbound(&replayer, &update),
                result = &mut shutdown => {
                    result?;
                    break;
                }
            }
        }

        while let Ok(update) = outbound.try_recv() {
            log_outbound(&replayer, &update);
        }

        let stats = replayer.bus().stats();
        info!("📊 Final bus statistics: {}", serde_json::to_string(&stats)?);
        Ok(())
    }
}

fn replay_line(replayer: &Replayer, line_number: usize, line: &str) {
    match replayer.handle_line(line) {
        Ok(ReplayOutcome::UnknownSubscription(name)) => {
            warn!("⚠️ Line {}: unknown subscription '{}'", line_number, name);
        }
        Ok(ReplayOutcome::Applied(changed)) => {
            info!("🔁 Line {}: filter update applied (changed: {})", line_number, changed);
        }
        Ok(_) => {}
        Err(e) => error!("❌ Line {}: {}", line_number, e),
    }
}

fn log_outbound(replayer: &Replayer, outbound: &OutboundFilterUpdate) {
    let name = replayer
        .name_of(outbound.subscription)
        .unwrap_or("<closed>");
    match serde_json::to_string(&outbound.update) {
        Ok(update) => info!(
            "📤 Filter update for '{}' ({}) from {}: {}",
            name, outbound.subscription, outbound.sender, update
        ),
        Err(e) => error!("❌ Failed to encode filter update for '{}': {}", name, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn test_replay_file_to_completion() {
        let replay = NamedTempFile::new().unwrap();
        let records = [
            r#"{"publish": {"kind": "perception", "msg_type": "ao.PERCEPTION", "target": 1001, "gain": [{"target": 1001, "subject": 5001, "object_type": "mob"}]}}"#,
            "",
            r#"{"publish": {"kind": "property", "msg_type": "ao.PROPERTY", "subject": 5001, "properties": {}}}"#,
            "not json",
            r#"{"filter_update": {"subscription": "player-view", "sender": "world", "update": {"instructions": [{"op": "REMOVE", "field": 2, "oid": 5001}]}}}"#,
        ];
        tokio::fs::write(replay.path(), records.join("\n")).await.unwrap();

        let mut config = AppConfig::default();
        config.node.input = replay.path().to_string_lossy().to_string();
        config.subscriptions[0].targets = vec![1001];

        let app = Application::new(config).unwrap();
        let handle = app.replayer.handle("player-view").unwrap();
        let filter = app.replayer.bus().filter(handle).unwrap();
        app.run().await.unwrap();

        let perception = filter.as_perception().unwrap();
        assert!(!perception.has_subject(perception_bus::Oid(5001)));
        assert!(perception.has_target(perception_bus::Oid(1001)));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = AppConfig::default();
        config.logging.level = "chatty".to_string();
        assert!(Application::new(config).is_err());
    }
}
