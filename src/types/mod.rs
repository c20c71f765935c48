pub mod execution;
pub mod killswitch;
pub mod metrics;
pub mod request;
pub mod validation;

pub use execution::{
    ExecutionOutcome, ExecutionResult, ExecutionStatus, OutcomeStatus, ResourceUsage,
};
pub use killswitch::{
    AgentState, KillSwitchAction, KillSwitchConfig, KillSwitchEvent, ThreatLevel, TriggerKind,
};
pub use metrics::{AgentMetrics, Alert, AlertSeverity, MetricType};
pub use request::{HandlerRequest, Priority, SecurityLimits};
pub use validation::{
    CategoryScores, IssueCategory, Severity, Strictness, UnknownStrictness, ValidationIssue,
    ValidationReport, ValidationSummary, ValidationVerdict,
};

use uuid::Uuid;

/// Agents are identified by the business layer; the control plane treats the
/// identifier as opaque.
pub type AgentId = String;
pub type RequestId = Uuid;
pub type SlotId = Uuid;
pub type EventId = Uuid;
pub type AlertId = Uuid;

/// Agent id used for events that target the whole control plane.
pub const SYSTEM_AGENT: &str = "system";
