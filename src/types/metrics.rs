use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{AgentId, AlertId};

/// Rolling statistics for one agent inside the monitoring window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMetrics {
    pub agent_id: AgentId,
    pub executions_per_minute: u32,
    /// Exponentially weighted share of failed executions.
    pub error_rate: f64,
    /// Exponentially weighted latency.
    pub avg_response_ms: f64,
    pub peak_memory_mb: f64,
    /// Security violations within the last hour.
    pub violation_count: u32,
    /// Cost accrued in the current hour window.
    pub hourly_cost: f64,
    pub total_executions: u64,
    pub last_activity: DateTime<Utc>,
}

impl AgentMetrics {
    pub fn new(agent_id: impl Into<AgentId>) -> Self {
        Self {
            agent_id: agent_id.into(),
            executions_per_minute: 0,
            error_rate: 0.0,
            avg_response_ms: 0.0,
            peak_memory_mb: 0.0,
            violation_count: 0,
            hourly_cost: 0.0,
            total_executions: 0,
            last_activity: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    ErrorRate,
    ResponseTime,
    Cost,
    Violations,
    Memory,
    Validation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: AlertId,
    pub agent_id: AgentId,
    pub severity: AlertSeverity,
    pub metric_type: MetricType,
    pub message: String,
    pub value: f64,
    pub threshold: f64,
    pub created_at: DateTime<Utc>,
    pub acknowledged: bool,
}
