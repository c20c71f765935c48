//! Rolling per-agent metrics and threshold alerting.

pub mod service;

pub use service::{DashboardSnapshot, ExecutionSample, MonitoringService};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringSettings {
    /// Weight of the newest sample in the smoothed error rate and latency.
    pub ema_alpha: f64,
    pub error_rate_threshold: f64,
    pub response_time_threshold_ms: f64,
    pub hourly_cost_threshold: f64,
    pub memory_threshold_mb: f64,
    pub violation_threshold: u32,
    /// Alerts for the same agent and metric inside this window are dropped.
    pub dedup_window_secs: i64,
    pub max_alerts: usize,
    pub inactive_after_secs: i64,
}

impl Default for MonitoringSettings {
    fn default() -> Self {
        Self {
            ema_alpha: 0.1,
            error_rate_threshold: 0.3,
            response_time_threshold_ms: 10_000.0,
            hourly_cost_threshold: 10.0,
            memory_threshold_mb: 400.0,
            violation_threshold: 3,
            dedup_window_secs: 300,
            max_alerts: 1000,
            inactive_after_secs: 3600,
        }
    }
}
