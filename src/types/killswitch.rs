use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{AgentId, EventId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Manual,
    CostExceeded,
    ErrorRate,
    SecurityViolation,
    ResourceExhaustion,
    SuspiciousActivity,
    AdminOverride,
}

impl TriggerKind {
    /// Triggers raised by an operator rather than by automatic evaluation.
    pub fn is_operator(&self) -> bool {
        matches!(self, TriggerKind::Manual | TriggerKind::AdminOverride)
    }

    pub fn as_str(&self) -> &str {
        match self {
            TriggerKind::Manual => "manual",
            TriggerKind::CostExceeded => "cost_exceeded",
            TriggerKind::ErrorRate => "error_rate",
            TriggerKind::SecurityViolation => "security_violation",
            TriggerKind::ResourceExhaustion => "resource_exhaustion",
            TriggerKind::SuspiciousActivity => "suspicious_activity",
            TriggerKind::AdminOverride => "admin_override",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl ThreatLevel {
    pub fn as_str(&self) -> &str {
        match self {
            ThreatLevel::Low => "low",
            ThreatLevel::Medium => "medium",
            ThreatLevel::High => "high",
            ThreatLevel::Critical => "critical",
        }
    }
}

/// Live state of an agent as seen by the kill switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Active,
    Warned,
    Suspended,
    Terminated,
}

/// One step actually performed while handling a trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum KillSwitchAction {
    ViolationRecorded,
    AgentSuspended { until: DateTime<Utc> },
    ExecutionsTerminated { count: usize },
    AgentBlocked { until: DateTime<Utc> },
    CallbacksExecuted { count: usize, failed: usize },
    GlobalShutdown { until: DateTime<Utc> },
    NotificationQueued { targets: usize },
}

/// Append-only audit record of one escalation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillSwitchEvent {
    pub id: EventId,
    pub agent_id: AgentId,
    pub trigger: TriggerKind,
    pub threat_level: ThreatLevel,
    pub reason: String,
    pub metadata: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
    pub triggered_by: String,
    pub actions_taken: Vec<KillSwitchAction>,
}

/// Per-agent policy for automatic triggers and notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KillSwitchConfig {
    pub enabled: bool,
    pub max_cost_per_hour: f64,
    pub max_error_rate: f64,
    pub max_violations: u32,
    pub notification_webhooks: Vec<String>,
    pub grace_period_secs: u64,
}

impl Default for KillSwitchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_cost_per_hour: 50.0,
            max_error_rate: 0.5,
            max_violations: 5,
            notification_webhooks: Vec::new(),
            grace_period_secs: 30,
        }
    }
}
