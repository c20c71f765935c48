use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use super::MonitoringSettings;
use crate::killswitch::MetricsSource;
use crate::types::{AgentId, AgentMetrics, Alert, AlertId, AlertSeverity, MetricType};

/// What the orchestrator reports after each finished request.
#[derive(Debug, Clone, Default)]
pub struct ExecutionSample {
    pub success: bool,
    pub latency: Duration,
    pub cost: f64,
    pub peak_memory_mb: f64,
    pub security_violation: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DashboardSnapshot {
    pub generated_at: DateTime<Utc>,
    pub total_agents: usize,
    pub total_executions: u64,
    pub avg_error_rate: f64,
    pub total_hourly_cost: f64,
    pub total_violations: u64,
    pub active_alerts: usize,
    pub agents: Vec<AgentMetrics>,
    pub recent_alerts: Vec<Alert>,
}

/// How far back a security violation still counts against an agent.
const VIOLATION_WINDOW_SECS: i64 = 3600;

struct AgentWindow {
    metrics: AgentMetrics,
    recent: VecDeque<DateTime<Utc>>,
    violations: VecDeque<DateTime<Utc>>,
    cost_window_start: DateTime<Utc>,
}

impl AgentWindow {
    fn new(agent_id: &str) -> Self {
        Self {
            metrics: AgentMetrics::new(agent_id),
            recent: VecDeque::new(),
            violations: VecDeque::new(),
            cost_window_start: Utc::now(),
        }
    }

    fn roll(&mut self, now: DateTime<Utc>) {
        let minute_ago = now - ChronoDuration::seconds(60);
        while self.recent.front().is_some_and(|t| *t < minute_ago) {
            self.recent.pop_front();
        }
        let violation_cutoff = now - ChronoDuration::seconds(VIOLATION_WINDOW_SECS);
        while self.violations.front().is_some_and(|t| *t < violation_cutoff) {
            self.violations.pop_front();
        }
        if now - self.cost_window_start > ChronoDuration::hours(1) {
            self.cost_window_start = now;
            self.metrics.hourly_cost = 0.0;
        }
    }

    fn sync_counts(&mut self) {
        self.metrics.executions_per_minute = self.recent.len() as u32;
        self.metrics.violation_count = self.violations.len() as u32;
    }

    /// Metrics as of `now`, with expired windows dropped.
    fn snapshot(&self, now: DateTime<Utc>) -> AgentMetrics {
        let mut metrics = self.metrics.clone();
        let minute_ago = now - ChronoDuration::seconds(60);
        let violation_cutoff = now - ChronoDuration::seconds(VIOLATION_WINDOW_SECS);
        metrics.executions_per_minute = self.recent.iter().filter(|t| **t >= minute_ago).count() as u32;
        metrics.violation_count = self
            .violations
            .iter()
            .filter(|t| **t >= violation_cutoff)
            .count() as u32;
        if now - self.cost_window_start > ChronoDuration::hours(1) {
            metrics.hourly_cost = 0.0;
        }
        metrics
    }
}

pub struct MonitoringService {
    settings: MonitoringSettings,
    agents: RwLock<HashMap<AgentId, AgentWindow>>,
    alerts: Mutex<VecDeque<Alert>>,
}

impl MonitoringService {
    pub fn new(settings: MonitoringSettings) -> Self {
        Self {
            settings,
            agents: RwLock::new(HashMap::new()),
            alerts: Mutex::new(VecDeque::new()),
        }
    }

    /// Current metrics: hourly cost, recent violations and executions per
    /// minute only cover their windows as of the call.
    pub async fn get_agent_metrics(&self, agent_id: &str) -> Option<AgentMetrics> {
        let now = Utc::now();
        self.agents
            .read()
            .await
            .get(agent_id)
            .map(|w| w.snapshot(now))
    }

    /// Replaces the agent's metrics wholesale. The windowed counters are
    /// reset to match the given values as of now.
    pub async fn record_agent_metrics(&self, agent_id: &str, metrics: AgentMetrics) {
        let now = Utc::now();
        let mut agents = self.agents.write().await;
        let window = agents
            .entry(agent_id.to_string())
            .or_insert_with(|| AgentWindow::new(agent_id));
        window.recent = std::iter::repeat(now)
            .take(metrics.executions_per_minute as usize)
            .collect();
        window.violations = std::iter::repeat(now)
            .take(metrics.violation_count as usize)
            .collect();
        window.cost_window_start = now;
        window.metrics = metrics;
    }

    /// Folds one finished request into the agent's rolling metrics and raises
    /// any threshold alerts it causes.
    pub async fn record_execution(&self, agent_id: &str, sample: &ExecutionSample) -> AgentMetrics {
        let now = Utc::now();
        let alpha = self.settings.ema_alpha;

        let metrics = {
            let mut agents = self.agents.write().await;
            let window = agents
                .entry(agent_id.to_string())
                .or_insert_with(|| AgentWindow::new(agent_id));

            window.roll(now);
            window.recent.push_back(now);
            if sample.security_violation {
                window.violations.push_back(now);
            }
            window.sync_counts();

            let m = &mut window.metrics;
            let failed = if sample.success { 0.0 } else { 1.0 };
            let latency_ms = sample.latency.as_secs_f64() * 1000.0;
            if m.total_executions == 0 {
                m.avg_response_ms = latency_ms;
            } else {
                m.avg_response_ms = alpha * latency_ms + (1.0 - alpha) * m.avg_response_ms;
            }
            m.error_rate = alpha * failed + (1.0 - alpha) * m.error_rate;
            m.total_executions += 1;
            m.peak_memory_mb = m.peak_memory_mb.max(sample.peak_memory_mb);
            m.hourly_cost += sample.cost;
            m.last_activity = now;
            m.clone()
        };

        self.check_thresholds(&metrics, sample).await;
        metrics
    }

    async fn check_thresholds(&self, metrics: &AgentMetrics, sample: &ExecutionSample) {
        let s = &self.settings;
        let agent = metrics.agent_id.as_str();

        if sample.security_violation {
            self.create_alert(
                agent,
                AlertSeverity::Critical,
                MetricType::Violations,
                "Security violation during execution",
                metrics.violation_count as f64,
                s.violation_threshold as f64,
            )
            .await;
        }
        if metrics.error_rate > s.error_rate_threshold {
            self.create_alert(
                agent,
                AlertSeverity::Warning,
                MetricType::ErrorRate,
                format!("Error rate {:.2} above {:.2}", metrics.error_rate, s.error_rate_threshold),
                metrics.error_rate,
                s.error_rate_threshold,
            )
            .await;
        }
        if metrics.avg_response_ms > s.response_time_threshold_ms {
            self.create_alert(
                agent,
                AlertSeverity::Warning,
                MetricType::ResponseTime,
                format!("Average response time {:.0} ms", metrics.avg_response_ms),
                metrics.avg_response_ms,
                s.response_time_threshold_ms,
            )
            .await;
        }
        if metrics.hourly_cost > s.hourly_cost_threshold {
            self.create_alert(
                agent,
                AlertSeverity::Warning,
                MetricType::Cost,
                format!("Hourly cost {:.4}", metrics.hourly_cost),
                metrics.hourly_cost,
                s.hourly_cost_threshold,
            )
            .await;
        }
        if metrics.peak_memory_mb > s.memory_threshold_mb {
            self.create_alert(
                agent,
                AlertSeverity::Info,
                MetricType::Memory,
                format!("Peak memory {:.1} MB", metrics.peak_memory_mb),
                metrics.peak_memory_mb,
                s.memory_threshold_mb,
            )
            .await;
        }
    }

    /// Stores a new alert unless one for the same agent and metric was
    /// raised within the dedup window.
    pub async fn create_alert(
        &self,
        agent_id: &str,
        severity: AlertSeverity,
        metric_type: MetricType,
        message: impl Into<String>,
        value: f64,
        threshold: f64,
    ) -> Option<Alert> {
        let now = Utc::now();
        let cutoff = now - ChronoDuration::seconds(self.settings.dedup_window_secs);
        let mut alerts = self.alerts.lock().await;

        let duplicate = alerts.iter().rev().any(|a| {
            a.agent_id == agent_id && a.metric_type == metric_type && a.created_at >= cutoff
        });
        if duplicate {
            log::debug!("Suppressed duplicate {:?} alert for agent {}", metric_type, agent_id);
            return None;
        }

        let alert = Alert {
            id: Uuid::new_v4(),
            agent_id: agent_id.to_string(),
            severity,
            metric_type,
            message: message.into(),
            value,
            threshold,
            created_at: now,
            acknowledged: false,
        };
        match severity {
            AlertSeverity::Critical => log::error!("Alert for agent {}: {}", agent_id, alert.message),
            AlertSeverity::Warning => log::warn!("Alert for agent {}: {}", agent_id, alert.message),
            AlertSeverity::Info => log::info!("Alert for agent {}: {}", agent_id, alert.message),
        }

        alerts.push_back(alert.clone());
        while alerts.len() > self.settings.max_alerts {
            alerts.pop_front();
        }
        Some(alert)
    }

    pub async fn acknowledge_alert(&self, alert_id: AlertId) -> bool {
        let mut alerts = self.alerts.lock().await;
        match alerts.iter_mut().find(|a| a.id == alert_id) {
            Some(alert) => {
                alert.acknowledged = true;
                true
            }
            None => false,
        }
    }

    /// Newest first.
    pub async fn get_alerts(&self, include_acknowledged: bool) -> Vec<Alert> {
        self.alerts
            .lock()
            .await
            .iter()
            .rev()
            .filter(|a| include_acknowledged || !a.acknowledged)
            .cloned()
            .collect()
    }

    pub async fn get_dashboard_data(&self) -> DashboardSnapshot {
        let now = Utc::now();
        let agents: Vec<AgentMetrics> = self
            .agents
            .read()
            .await
            .values()
            .map(|w| w.snapshot(now))
            .collect();
        let alerts = self.alerts.lock().await;

        let avg_error_rate = if agents.is_empty() {
            0.0
        } else {
            agents.iter().map(|m| m.error_rate).sum::<f64>() / agents.len() as f64
        };

        DashboardSnapshot {
            generated_at: Utc::now(),
            total_agents: agents.len(),
            total_executions: agents.iter().map(|m| m.total_executions).sum(),
            avg_error_rate,
            total_hourly_cost: agents.iter().map(|m| m.hourly_cost).sum(),
            total_violations: agents.iter().map(|m| u64::from(m.violation_count)).sum(),
            active_alerts: alerts.iter().filter(|a| !a.acknowledged).count(),
            recent_alerts: alerts.iter().rev().take(20).cloned().collect(),
            agents,
        }
    }

    /// Drops agents idle for longer than the configured window.
    pub async fn prune_inactive(&self) -> usize {
        let cutoff = Utc::now() - ChronoDuration::seconds(self.settings.inactive_after_secs);
        let mut agents = self.agents.write().await;
        let before = agents.len();
        agents.retain(|_, w| w.metrics.last_activity >= cutoff);
        before - agents.len()
    }
}

#[async_trait]
impl MetricsSource for MonitoringService {
    async fn agent_metrics(&self, agent_id: &str) -> Option<AgentMetrics> {
        self.get_agent_metrics(agent_id).await
    }

    async fn tracked_agents(&self) -> Vec<AgentId> {
        self.agents.read().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(success: bool, latency_ms: u64) -> ExecutionSample {
        ExecutionSample {
            success,
            latency: Duration::from_millis(latency_ms),
            cost: 0.01,
            ..ExecutionSample::default()
        }
    }

    #[tokio::test]
    async fn test_smoothing_favours_recent_samples() {
        let monitoring = MonitoringService::new(MonitoringSettings::default());

        let first = monitoring.record_execution("a", &sample(true, 100)).await;
        assert_eq!(first.avg_response_ms, 100.0);
        assert_eq!(first.error_rate, 0.0);

        let second = monitoring.record_execution("a", &sample(false, 200)).await;
        assert!((second.avg_response_ms - 110.0).abs() < 1e-9);
        assert!((second.error_rate - 0.1).abs() < 1e-9);
        assert_eq!(second.total_executions, 2);
        assert_eq!(second.executions_per_minute, 2);
        assert!((second.hourly_cost - 0.02).abs() < 1e-9);
    }

    #[test]
    fn test_windows_expire_on_read() {
        let now = Utc::now();
        let mut window = AgentWindow::new("a");
        window.metrics.hourly_cost = 5.0;
        window.cost_window_start = now - ChronoDuration::minutes(61);
        window.violations.push_back(now - ChronoDuration::minutes(90));
        window.violations.push_back(now - ChronoDuration::minutes(10));
        window.recent.push_back(now - ChronoDuration::minutes(2));
        window.sync_counts();
        assert_eq!(window.metrics.violation_count, 2);

        let snapshot = window.snapshot(now);
        assert_eq!(snapshot.hourly_cost, 0.0);
        assert_eq!(snapshot.violation_count, 1);
        assert_eq!(snapshot.executions_per_minute, 0);

        window.roll(now);
        window.sync_counts();
        assert_eq!(window.metrics.hourly_cost, 0.0);
        assert_eq!(window.violations.len(), 1);
        assert!(window.recent.is_empty());
    }

    #[tokio::test]
    async fn test_violation_counts_and_alerts() {
        let monitoring = MonitoringService::new(MonitoringSettings::default());
        let violation = ExecutionSample {
            security_violation: true,
            ..sample(false, 10)
        };

        let metrics = monitoring.record_execution("a", &violation).await;
        assert_eq!(metrics.violation_count, 1);

        let alerts = monitoring.get_alerts(false).await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].metric_type, MetricType::Violations);
        assert_eq!(alerts[0].severity, AlertSeverity::Critical);
    }

    #[tokio::test]
    async fn test_alert_deduplication_and_ack() {
        let monitoring = MonitoringService::new(MonitoringSettings::default());
        let first = monitoring
            .create_alert("a", AlertSeverity::Warning, MetricType::Cost, "cost", 12.0, 10.0)
            .await
            .unwrap();
        assert!(monitoring
            .create_alert("a", AlertSeverity::Warning, MetricType::Cost, "cost", 13.0, 10.0)
            .await
            .is_none());
        assert!(monitoring
            .create_alert("a", AlertSeverity::Warning, MetricType::ErrorRate, "err", 0.5, 0.3)
            .await
            .is_some());
        assert!(monitoring
            .create_alert("b", AlertSeverity::Warning, MetricType::Cost, "cost", 12.0, 10.0)
            .await
            .is_some());

        assert!(monitoring.acknowledge_alert(first.id).await);
        assert!(!monitoring.acknowledge_alert(Uuid::new_v4()).await);
        assert_eq!(monitoring.get_alerts(false).await.len(), 2);
        assert_eq!(monitoring.get_alerts(true).await.len(), 3);
    }

    #[tokio::test]
    async fn test_alert_retention_is_bounded() {
        let monitoring = MonitoringService::new(MonitoringSettings {
            max_alerts: 2,
            ..MonitoringSettings::default()
        });
        for agent in ["a", "b", "c"] {
            monitoring
                .create_alert(agent, AlertSeverity::Info, MetricType::Memory, "m", 1.0, 0.0)
                .await;
        }
        let alerts = monitoring.get_alerts(true).await;
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0].agent_id, "c");
    }

    #[tokio::test]
    async fn test_dashboard_and_pruning() {
        let monitoring = MonitoringService::new(MonitoringSettings {
            inactive_after_secs: 60,
            ..MonitoringSettings::default()
        });
        monitoring.record_execution("a", &sample(true, 10)).await;
        let mut stale = AgentMetrics::new("b");
        stale.last_activity = Utc::now() - ChronoDuration::hours(2);
        stale.total_executions = 4;
        monitoring.record_agent_metrics("b", stale).await;

        let dashboard = monitoring.get_dashboard_data().await;
        assert_eq!(dashboard.total_agents, 2);
        assert_eq!(dashboard.total_executions, 5);

        assert_eq!(monitoring.prune_inactive().await, 1);
        assert!(monitoring.get_agent_metrics("b").await.is_none());
        assert_eq!(monitoring.tracked_agents().await, vec!["a".to_string()]);
    }
}
