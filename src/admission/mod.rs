//! Per-agent rate, cost and concurrency gate.

pub mod controller;

pub use controller::{AdmissionController, AdmissionDecision, AgentUsage};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::types::AgentId;

/// Ceilings enforced for one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionLimits {
    pub requests_per_minute: u32,
    pub requests_per_hour: u32,
    pub max_cost_per_hour: f64,
    pub max_cost_per_day: f64,
    pub max_concurrent: usize,
}

impl Default for AdmissionLimits {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            requests_per_hour: 1000,
            max_cost_per_hour: 10.0,
            max_cost_per_day: 100.0,
            max_concurrent: 5,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionSettings {
    /// Applied to every agent without an entry in `overrides`.
    pub defaults: AdmissionLimits,
    pub overrides: HashMap<AgentId, AdmissionLimits>,
}

impl AdmissionSettings {
    pub fn limits_for(&self, agent_id: &str) -> &AdmissionLimits {
        self.overrides.get(agent_id).unwrap_or(&self.defaults)
    }
}
