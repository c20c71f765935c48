use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::types::AgentState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Escalation {
    Warn,
    Suspend,
    Terminate,
    /// Restrictions expired; the agent may run again.
    Reinstate,
}

pub struct AgentStateMachine;

impl AgentStateMachine {
    pub fn transition(state: AgentState, escalation: Escalation) -> Result<AgentState> {
        let next = match (state, escalation) {
            (AgentState::Active, Escalation::Warn) => AgentState::Warned,
            (current, Escalation::Warn) => current,

            // A suspension never downgrades a termination.
            (AgentState::Terminated, Escalation::Suspend) => AgentState::Terminated,
            (_, Escalation::Suspend) => AgentState::Suspended,

            (_, Escalation::Terminate) => AgentState::Terminated,

            (
                AgentState::Warned | AgentState::Suspended | AgentState::Terminated,
                Escalation::Reinstate,
            ) => AgentState::Active,

            (AgentState::Active, Escalation::Reinstate) => {
                return Err(anyhow!(
                    "Invalid transition from {:?} with {:?}",
                    state,
                    escalation
                ));
            }
        };
        Ok(next)
    }
}
