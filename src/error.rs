use thiserror::Error;
use uuid::Uuid;

use crate::types::AgentId;

/// Faults raised by the control plane itself.
#[derive(Debug, Error)]
pub enum WardenError {
    #[error("control plane is shutting down")]
    ShuttingDown,

    #[error("agent {agent_id} is at its concurrency limit of {limit}")]
    ConcurrencyLimit { agent_id: AgentId, limit: usize },

    #[error("no handler registered under '{0}'")]
    UnknownHandler(String),

    #[error("execution {0} not found")]
    ExecutionNotFound(Uuid),

    #[error("configuration error: {0}")]
    Config(String),
}
