use anyhow::Context;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::domain::{Command, StoredRule};
use crate::ports::{MessageBroker, RuleStore};

/// Applies remote rule-management commands and republishes the full rule list.
pub struct ControlPlane {
    store: Arc<dyn RuleStore>,
    broker: Arc<dyn MessageBroker>,
    list_topic: String,
}

impl ControlPlane {
    pub fn new(store: Arc<dyn RuleStore>, broker: Arc<dyn MessageBroker>, list_topic: impl Into<String>) -> Self {
        Self { store, broker, list_topic: list_topic.into() }
    }

    /// Entry point for raw control messages. Bad input is logged and dropped.
    #[instrument(skip(self, payload), fields(payload_len = payload.len()))]
    pub async fn handle_message(&self, payload: &[u8]) {
        let command: Command = match serde_json::from_slice(payload) {
            Ok(c) => c,
            Err(e) => {
                warn!(
                    "Dropping malformed control command: {} (payload: {})",
                    e,
                    String::from_utf8_lossy(payload)
                );
                metrics::counter!("control_commands_total", 1, "command" => "malformed");
                return;
            }
        };

        let name = command.name();
        metrics::counter!("control_commands_total", 1, "command" => name);
        if let Err(e) = self.apply(command).await {
            warn!(command = name, "Control command failed: {:?}", e);
        }
    }

    /// Apply one command, persist on mutation, then republish the complete list.
    /// Returns the id of a newly added rule. Entries that no longer decode are saved
    /// back as they were and can only be removed by `delete_rule`.
    pub async fn apply(&self, command: Command) -> anyhow::Result<Option<String>> {
        let mut rules = self.store.load().await.context("loading rule list")?;
        let mut created = None;

        match command {
            Command::AddRule { rule } => {
                rule.validate()?;
                let id = uuid::Uuid::new_v4().to_string();
                info!(rule_id = %id, "Adding rule '{}'", rule.name);
                rules.push(rule.with_id(id.clone()).into());
                self.store.save(&rules).await.context("saving rule list")?;
                created = Some(id);
            }
            Command::DeleteRule { rule_id } => {
                let before = rules.len();
                rules.retain(|r| r.id() != Some(rule_id.as_str()));
                if rules.len() == before {
                    info!(rule_id = %rule_id, "Delete requested for unknown rule, nothing to do");
                } else {
                    info!(rule_id = %rule_id, "Deleted rule");
                }
                self.store.save(&rules).await.context("saving rule list")?;
            }
            Command::GetList => {}
        }

        self.publish_list(&rules).await?;
        Ok(created)
    }

    async fn publish_list(&self, rules: &[StoredRule]) -> anyhow::Result<()> {
        let payload = serde_json::to_vec(rules)?;
        self.broker
            .publish_retained(&self.list_topic, payload)
            .await
            .context("publishing rule list")?;
        info!(count = rules.len(), topic = %self.list_topic, "Rule list published");
        Ok(())
    }
}
