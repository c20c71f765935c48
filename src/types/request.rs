use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use super::{AgentId, RequestId, Strictness};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// Resource ceiling for a single sandboxed execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityLimits {
    pub max_execution_ms: u64,
    pub max_memory_mb: u64,
    /// Share of `max_execution_ms` the handler may spend on CPU work.
    pub max_cpu_percent: f64,
    pub max_network_calls: u32,
}

impl Default for SecurityLimits {
    fn default() -> Self {
        Self {
            max_execution_ms: 30_000,
            max_memory_mb: 512,
            max_cpu_percent: 80.0,
            max_network_calls: 100,
        }
    }
}

impl SecurityLimits {
    pub fn max_execution_time(&self) -> Duration {
        Duration::from_millis(self.max_execution_ms)
    }

    pub fn max_memory_bytes(&self) -> u64 {
        self.max_memory_mb.saturating_mul(1024 * 1024)
    }

    pub fn cpu_budget(&self) -> Duration {
        let fraction = (self.max_cpu_percent / 100.0).clamp(0.0, 1.0);
        self.max_execution_time().mul_f64(fraction)
    }
}

/// A unit of work submitted by an agent. Immutable once submitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerRequest {
    pub id: RequestId,
    pub agent_id: AgentId,
    pub handler_name: String,
    pub source_code: String,
    pub params: Value,
    pub priority: Priority,
    pub timeout_ms: u64,
    pub strictness: Strictness,
    pub limits: Option<SecurityLimits>,
    pub submitted_at: DateTime<Utc>,
}

impl HandlerRequest {
    pub fn new(
        agent_id: impl Into<AgentId>,
        handler_name: impl Into<String>,
        source_code: impl Into<String>,
        params: Value,
    ) -> Self {
        Self {
            id: RequestId::new_v4(),
            agent_id: agent_id.into(),
            handler_name: handler_name.into(),
            source_code: source_code.into(),
            params,
            priority: Priority::Normal,
            timeout_ms: 30_000,
            strictness: Strictness::Standard,
            limits: None,
            submitted_at: Utc::now(),
        }
    }

    pub fn with_strictness(mut self, strictness: Strictness) -> Self {
        self.strictness = strictness;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_limits(mut self, limits: SecurityLimits) -> Self {
        self.limits = Some(limits);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}
