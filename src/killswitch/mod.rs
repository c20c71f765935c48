//! Threat escalation: per-agent and global graduated responses.

pub mod notifier;
pub mod state_machine;
pub mod switch;

pub use notifier::{Notifier, WebhookNotifier};
pub use state_machine::{AgentStateMachine, Escalation};
pub use switch::{
    AgentStatus, KillSwitch, KillSwitchStatus, Marker, MarkerKind, MetricsSource,
    ShutdownCallback, Trigger,
};

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::types::KillSwitchConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KillSwitchSettings {
    pub poll_interval_secs: u64,
    pub suspend_secs: u64,
    pub block_secs: u64,
    pub global_shutdown_secs: u64,
    pub event_log_capacity: usize,
    pub event_retention_days: i64,
    pub webhook_timeout_secs: u64,
    /// Policy for agents without their own `KillSwitchConfig`.
    pub default_config: KillSwitchConfig,
}

impl Default for KillSwitchSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            suspend_secs: 30 * 60,
            block_secs: 60 * 60,
            global_shutdown_secs: 60 * 60,
            event_log_capacity: 1000,
            event_retention_days: 7,
            webhook_timeout_secs: 10,
            default_config: KillSwitchConfig::default(),
        }
    }
}

impl KillSwitchSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn suspend_window(&self) -> Duration {
        Duration::from_secs(self.suspend_secs)
    }

    pub fn block_window(&self) -> Duration {
        Duration::from_secs(self.block_secs)
    }

    pub fn global_window(&self) -> Duration {
        Duration::from_secs(self.global_shutdown_secs)
    }

    pub fn event_retention(&self) -> Duration {
        Duration::from_secs(self.event_retention_days.max(0) as u64 * 24 * 3600)
    }
}
