use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{AgentId, RequestId, ValidationSummary};

/// Status reported by the sandbox for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Success,
    SecurityViolation,
    Failure,
    Timeout,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub peak_memory_mb: f64,
    pub cpu_time_ms: u64,
    pub wall_time_ms: u64,
    pub network_calls: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub status: OutcomeStatus,
    pub output: Option<Value>,
    pub usage: ResourceUsage,
    pub error: Option<String>,
    /// Soft findings that did not fail the run.
    pub warnings: Vec<String>,
}

impl ExecutionOutcome {
    pub fn success(output: Value, usage: ResourceUsage) -> Self {
        Self {
            status: OutcomeStatus::Success,
            output: Some(output),
            usage,
            error: None,
            warnings: Vec::new(),
        }
    }

    pub fn failed(status: OutcomeStatus, error: impl Into<String>, usage: ResourceUsage) -> Self {
        Self {
            status,
            output: None,
            usage,
            error: Some(error.into()),
            warnings: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Success
    }
}

/// Lifecycle of a request inside the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Validating,
    Executing,
    Completed,
    Failed,
    Blocked,
    Killed,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed
                | ExecutionStatus::Failed
                | ExecutionStatus::Blocked
                | ExecutionStatus::Killed
        )
    }

    pub fn as_str(&self) -> &str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Validating => "validating",
            ExecutionStatus::Executing => "executing",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Blocked => "blocked",
            ExecutionStatus::Killed => "killed",
        }
    }
}

impl From<OutcomeStatus> for ExecutionStatus {
    fn from(status: OutcomeStatus) -> Self {
        match status {
            OutcomeStatus::Success => ExecutionStatus::Completed,
            OutcomeStatus::SecurityViolation => ExecutionStatus::Blocked,
            OutcomeStatus::Failure | OutcomeStatus::Timeout => ExecutionStatus::Failed,
        }
    }
}

/// Externally visible record of one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub request_id: RequestId,
    pub agent_id: AgentId,
    pub handler_name: String,
    pub status: ExecutionStatus,
    pub outcome: Option<ExecutionOutcome>,
    pub validation: Option<ValidationSummary>,
    pub security_violations: Vec<String>,
    pub error: Option<String>,
    pub execution_time_ms: u64,
    pub cost_estimate: f64,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExecutionResult {
    pub fn new(request_id: RequestId, agent_id: AgentId, handler_name: String) -> Self {
        Self {
            request_id,
            agent_id,
            handler_name,
            status: ExecutionStatus::Pending,
            outcome: None,
            validation: None,
            security_violations: Vec::new(),
            error: None,
            execution_time_ms: 0,
            cost_estimate: 0.0,
            created_at: Utc::now(),
            completed_at: None,
        }
    }
}
