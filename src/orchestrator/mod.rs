//! Sequences validation, admission and sandboxed execution for every request.

pub mod executor;
pub mod maintenance;

pub use executor::{Orchestrator, SystemStatus};
pub use maintenance::MaintenanceReport;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::admission::AdmissionController;
use crate::config::Config;
use crate::killswitch::KillSwitch;
use crate::monitoring::MonitoringService;
use crate::sandbox::{HandlerRegistry, InProcessSandbox, SandboxExecutor};
use crate::storage::{InMemoryStore, StateStore};
use crate::types::SecurityLimits;
use crate::validation::CodeValidator;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSettings {
    pub maintenance_interval_secs: u64,
    /// Extra time past its timeout before an execution counts as stuck.
    pub stuck_grace_secs: u64,
    pub history_capacity: usize,
    /// Cost assumed for a request when checking admission.
    pub estimated_cost: f64,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            maintenance_interval_secs: 30,
            stuck_grace_secs: 60,
            history_capacity: 1000,
            estimated_cost: 0.01,
        }
    }
}

impl OrchestratorSettings {
    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }

    pub fn stuck_grace(&self) -> Duration {
        Duration::from_secs(self.stuck_grace_secs)
    }
}

/// Time-proportional cost estimate. Used for throttling, not billing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CostModel {
    pub base: f64,
    pub per_second: f64,
}

impl Default for CostModel {
    fn default() -> Self {
        Self {
            base: 0.001,
            per_second: 0.01,
        }
    }
}

impl CostModel {
    pub fn estimate(&self, elapsed: Duration) -> f64 {
        self.base + elapsed.as_secs_f64() * self.per_second
    }
}

/// The collaborators an `Orchestrator` drives.
pub struct Components {
    pub validator: Arc<CodeValidator>,
    pub admission: Arc<AdmissionController>,
    pub killswitch: Arc<KillSwitch>,
    pub monitoring: Arc<MonitoringService>,
    pub sandbox: Arc<dyn SandboxExecutor>,
    pub handlers: HandlerRegistry,
    pub default_limits: SecurityLimits,
}

impl Components {
    /// Wires every component against one shared store, with the in-process
    /// sandbox and the built-in handlers.
    pub fn from_config(config: &Config, store: Arc<dyn StateStore>) -> Result<Self> {
        Ok(Self {
            validator: Arc::new(CodeValidator::new(
                Arc::clone(&store),
                config.validation.clone(),
            )),
            admission: Arc::new(AdmissionController::new(
                Arc::clone(&store),
                config.admission.clone(),
            )),
            killswitch: Arc::new(KillSwitch::new(
                Arc::clone(&store),
                config.killswitch.clone(),
            )?),
            monitoring: Arc::new(MonitoringService::new(config.monitoring.clone())),
            sandbox: Arc::new(InProcessSandbox::new(config.sandbox.clone())),
            handlers: HandlerRegistry::with_builtins(),
            default_limits: config.sandbox.default_limits.clone(),
        })
    }
}

impl Orchestrator {
    /// Builds a control plane backed by an in-memory store.
    pub fn from_config(config: &Config) -> Result<Arc<Self>> {
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStore::new());
        let components = Components::from_config(config, store)?;
        Ok(Arc::new(Self::new(
            components,
            config.orchestrator.clone(),
            config.cost,
        )))
    }
}
