use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use super::{AdmissionLimits, AdmissionSettings};
use crate::error::WardenError;
use crate::storage::StateStore;
use crate::types::{AgentId, ResourceUsage, SlotId};

const MINUTE_MS: i64 = 60_000;
const HOUR_MS: i64 = 3_600_000;
/// Upper bound on the per-agent operation log.
const OPERATION_LOG_CAP: usize = 10_000;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdmissionDecision {
    pub allowed: bool,
    pub violations: Vec<String>,
}

/// Lifetime counters for one agent, advanced only by `record_operation`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentUsage {
    pub operations: u64,
    pub failures: u64,
    pub total_cost: f64,
    pub total_latency_ms: u64,
    pub cpu_time_ms: u64,
    pub peak_memory_mb: f64,
    pub network_calls: u64,
    pub by_type: HashMap<String, u64>,
}

#[derive(Debug, Deserialize)]
struct LoggedOperation {
    ts: i64,
    cost: f64,
}

#[derive(Debug, Default)]
struct Window {
    last_minute: u32,
    last_hour: u32,
    hourly_cost: f64,
}

/// Gates requests on per-agent request rates, cost budgets and concurrently
/// held slots.
///
/// Rate and cost counters live in the `StateStore`; slots are process-local.
pub struct AdmissionController {
    store: Arc<dyn StateStore>,
    settings: RwLock<AdmissionSettings>,
    slots: Mutex<HashMap<AgentId, HashSet<SlotId>>>,
    usage: Mutex<HashMap<AgentId, AgentUsage>>,
}

impl AdmissionController {
    pub fn new(store: Arc<dyn StateStore>, settings: AdmissionSettings) -> Self {
        Self {
            store,
            settings: RwLock::new(settings),
            slots: Mutex::new(HashMap::new()),
            usage: Mutex::new(HashMap::new()),
        }
    }

    fn ops_key(agent_id: &str) -> String {
        format!("admission:{}:ops", agent_id)
    }

    fn daily_cost_key(agent_id: &str) -> String {
        format!("admission:{}:cost:{}", agent_id, Utc::now().format("%Y-%m-%d"))
    }

    pub async fn limits_for(&self, agent_id: &str) -> AdmissionLimits {
        self.settings.read().await.limits_for(agent_id).clone()
    }

    pub async fn set_agent_limits(&self, agent_id: impl Into<AgentId>, limits: AdmissionLimits) {
        self.settings
            .write()
            .await
            .overrides
            .insert(agent_id.into(), limits);
    }

    async fn window(&self, agent_id: &str) -> Result<Window> {
        let now = Utc::now().timestamp_millis();
        let mut window = Window::default();

        for entry in self.store.list(&Self::ops_key(agent_id)).await? {
            let op: LoggedOperation = match serde_json::from_value(entry) {
                Ok(op) => op,
                Err(_) => continue,
            };
            let age = now - op.ts;
            if age <= HOUR_MS {
                window.last_hour += 1;
                window.hourly_cost += op.cost;
                if age <= MINUTE_MS {
                    window.last_minute += 1;
                }
            }
        }
        Ok(window)
    }

    async fn daily_cost(&self, agent_id: &str) -> Result<f64> {
        Ok(self
            .store
            .get(&Self::daily_cost_key(agent_id))
            .await?
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0))
    }

    /// Checks whether one more request costing `estimated_cost` fits inside
    /// the agent's budgets. Every exceeded ceiling is reported.
    pub async fn check_limits(
        &self,
        agent_id: &str,
        estimated_cost: f64,
        estimated_requests: u32,
    ) -> Result<AdmissionDecision> {
        let limits = self.limits_for(agent_id).await;
        let window = self
            .window(agent_id)
            .await
            .with_context(|| format!("Failed to read request log for agent {}", agent_id))?;
        let daily_cost = self.daily_cost(agent_id).await?;
        let held = self.active_slots(agent_id).await;

        let mut violations = Vec::new();
        if window.last_minute + estimated_requests > limits.requests_per_minute {
            violations.push(format!(
                "Rate limit exceeded: {} requests in the last minute (limit {})",
                window.last_minute, limits.requests_per_minute
            ));
        }
        if window.last_hour + estimated_requests > limits.requests_per_hour {
            violations.push(format!(
                "Rate limit exceeded: {} requests in the last hour (limit {})",
                window.last_hour, limits.requests_per_hour
            ));
        }
        if window.hourly_cost + estimated_cost > limits.max_cost_per_hour {
            violations.push(format!(
                "Hourly cost limit exceeded: {:.4} spent (limit {:.4})",
                window.hourly_cost, limits.max_cost_per_hour
            ));
        }
        if daily_cost + estimated_cost > limits.max_cost_per_day {
            violations.push(format!(
                "Daily cost limit exceeded: {:.4} spent (limit {:.4})",
                daily_cost, limits.max_cost_per_day
            ));
        }
        if held >= limits.max_concurrent {
            violations.push(format!(
                "Concurrency limit reached: {} of {} slots held",
                held, limits.max_concurrent
            ));
        }

        if !violations.is_empty() {
            log::info!(
                "Admission rejected for agent {}: {}",
                agent_id,
                violations.join("; ")
            );
        }

        Ok(AdmissionDecision {
            allowed: violations.is_empty(),
            violations,
        })
    }

    /// Takes one concurrency slot. Rejects rather than waits at the ceiling.
    pub async fn acquire_slot(&self, agent_id: &str) -> Result<SlotId, WardenError> {
        let limit = self.limits_for(agent_id).await.max_concurrent;
        let mut slots = self.slots.lock().await;
        let held = slots.entry(agent_id.to_string()).or_default();

        if held.len() >= limit {
            return Err(WardenError::ConcurrencyLimit {
                agent_id: agent_id.to_string(),
                limit,
            });
        }

        let slot = Uuid::new_v4();
        held.insert(slot);
        log::debug!(
            "Agent {} acquired slot {} ({}/{})",
            agent_id,
            slot,
            held.len(),
            limit
        );
        Ok(slot)
    }

    /// Returns `false` when the slot was not held, e.g. on a second release.
    pub async fn release_slot(&self, agent_id: &str, slot: SlotId) -> bool {
        let mut slots = self.slots.lock().await;
        let Some(held) = slots.get_mut(agent_id) else {
            log::warn!("Release of unknown slot {} for agent {}", slot, agent_id);
            return false;
        };

        let released = held.remove(&slot);
        if held.is_empty() {
            slots.remove(agent_id);
        }
        if !released {
            log::warn!("Slot {} for agent {} was already released", slot, agent_id);
        }
        released
    }

    pub async fn active_slots(&self, agent_id: &str) -> usize {
        self.slots
            .lock()
            .await
            .get(agent_id)
            .map(|held| held.len())
            .unwrap_or(0)
    }

    /// Advances the agent's rate and cost counters. Called once per
    /// finished request that passed admission.
    pub async fn record_operation(
        &self,
        agent_id: &str,
        cost: f64,
        usage: &ResourceUsage,
        success: bool,
        latency: Duration,
        op_type: &str,
    ) -> Result<()> {
        let entry = json!({
            "ts": Utc::now().timestamp_millis(),
            "cost": cost,
            "success": success,
            "op": op_type,
        });
        self.store
            .push_bounded(
                &Self::ops_key(agent_id),
                entry,
                OPERATION_LOG_CAP,
                Some(Duration::from_millis(HOUR_MS as u64)),
            )
            .await
            .with_context(|| format!("Failed to log operation for agent {}", agent_id))?;
        self.store
            .increment(
                &Self::daily_cost_key(agent_id),
                cost,
                Some(Duration::from_secs(48 * 3600)),
            )
            .await?;

        let mut stats = self.usage.lock().await;
        let stats = stats.entry(agent_id.to_string()).or_default();
        stats.operations += 1;
        if !success {
            stats.failures += 1;
        }
        stats.total_cost += cost;
        stats.total_latency_ms += latency.as_millis() as u64;
        stats.cpu_time_ms += usage.cpu_time_ms;
        stats.peak_memory_mb = stats.peak_memory_mb.max(usage.peak_memory_mb);
        stats.network_calls += u64::from(usage.network_calls);
        *stats.by_type.entry(op_type.to_string()).or_default() += 1;

        Ok(())
    }

    pub async fn get_usage(&self, agent_id: &str) -> Option<AgentUsage> {
        self.usage.lock().await.get(agent_id).cloned()
    }
}
