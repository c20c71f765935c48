use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;

use crate::types::KillSwitchEvent;

/// Outbound delivery of kill-switch events. Delivery is advisory.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &KillSwitchEvent, targets: &[String]) -> Result<()>;
}

/// POSTs a JSON summary of the event to each target URL.
pub struct WebhookNotifier {
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent("Warden/1.0")
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, event: &KillSwitchEvent, targets: &[String]) -> Result<()> {
        let payload = json!({
            "event_id": event.id,
            "agent_id": event.agent_id,
            "trigger": event.trigger,
            "threat_level": event.threat_level,
            "reason": event.reason,
            "timestamp": event.timestamp,
        });

        let mut failures = Vec::new();
        for target in targets {
            match self.client.post(target).json(&payload).send().await {
                Ok(response) if response.status().is_success() => {}
                Ok(response) => failures.push(format!("{} returned {}", target, response.status())),
                Err(e) => failures.push(format!("{}: {}", target, e)),
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("Webhook delivery failed: {}", failures.join("; ")))
        }
    }
}
