use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::admission::AdmissionSettings;
use crate::error::WardenError;
use crate::killswitch::KillSwitchSettings;
use crate::monitoring::MonitoringSettings;
use crate::orchestrator::{CostModel, OrchestratorSettings};
use crate::sandbox::SandboxSettings;
use crate::types::Strictness;
use crate::validation::ValidationSettings;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// Every section is optional; missing keys take their defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerSettings,
    pub admission: AdmissionSettings,
    pub validation: ValidationSettings,
    pub sandbox: SandboxSettings,
    pub killswitch: KillSwitchSettings,
    pub monitoring: MonitoringSettings,
    pub orchestrator: OrchestratorSettings,
    pub cost: CostModel,
}

impl Config {
    /// Reads a TOML file. `${VAR}` references are expanded from the
    /// environment before parsing.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let expanded = shellexpand::env(&content)
            .with_context(|| format!("Failed to expand variables in {}", path.display()))?;
        let config: Config = toml::from_str(&expanded)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults with `WARDEN_*` environment overrides applied.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `WARDEN_HOST`, `WARDEN_PORT`, `WARDEN_WEBHOOK_URL` and
    /// `WARDEN_STRICTNESS` as returned by `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), WardenError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("WARDEN_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("WARDEN_PORT") {
            self.server.port = port
                .parse()
                .map_err(|_| WardenError::Config(format!("WARDEN_PORT is not a port: {}", port)))?;
        }
        if let Some(url) = lookup("WARDEN_WEBHOOK_URL") {
            let webhooks = &mut self.killswitch.default_config.notification_webhooks;
            if !webhooks.contains(&url) {
                webhooks.push(url);
            }
        }
        if let Some(value) = lookup("WARDEN_STRICTNESS") {
            self.validation.default_strictness = value
                .parse::<Strictness>()
                .map_err(|e| WardenError::Config(format!("WARDEN_STRICTNESS: {}", e)))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), WardenError> {
        let mut problems = Vec::new();
        let mut limits = vec![("defaults", &self.admission.defaults)];
        limits.extend(
            self.admission
                .overrides
                .iter()
                .map(|(agent, l)| (agent.as_str(), l)),
        );
        for (scope, l) in limits {
            if l.max_concurrent == 0 {
                problems.push(format!("admission {}: max_concurrent must be positive", scope));
            }
        }
        if !(self.monitoring.ema_alpha > 0.0 && self.monitoring.ema_alpha <= 1.0) {
            problems.push("monitoring.ema_alpha must be in (0, 1]".to_string());
        }
        if self.orchestrator.history_capacity == 0 {
            problems.push("orchestrator.history_capacity must be positive".to_string());
        }
        if self.orchestrator.maintenance_interval_secs == 0 || self.killswitch.poll_interval_secs == 0
        {
            problems.push("background intervals must be positive".to_string());
        }
        if self.killswitch.event_log_capacity == 0 {
            problems.push("killswitch.event_log_capacity must be positive".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(WardenError::Config(problems.join("; ")))
        }
    }
}
