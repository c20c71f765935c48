use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{AgentStateMachine, Escalation, KillSwitchSettings, Notifier, WebhookNotifier};
use crate::storage::StateStore;
use crate::types::{
    AgentId, AgentMetrics, AgentState, KillSwitchAction, KillSwitchConfig, KillSwitchEvent,
    RequestId, ThreatLevel, TriggerKind, SYSTEM_AGENT,
};

const GLOBAL_KEY: &str = "killswitch:global";
const EVENTS_KEY: &str = "killswitch:events";
const AUTO_ACTOR: &str = "auto";

/// Runs during a global shutdown. An error or panic is counted, never
/// propagated.
pub type ShutdownCallback = Box<dyn Fn(&KillSwitchEvent) -> Result<()> + Send + Sync>;

/// Supplies rolling metrics for automatic trigger evaluation.
#[async_trait]
pub trait MetricsSource: Send + Sync {
    async fn agent_metrics(&self, agent_id: &str) -> Option<AgentMetrics>;

    async fn tracked_agents(&self) -> Vec<AgentId>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkerKind {
    Suspended,
    Blocked,
    GlobalShutdown,
}

/// Restriction stored with a TTL; an expired marker no longer restricts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Marker {
    pub kind: MarkerKind,
    pub reason: String,
    pub until: DateTime<Utc>,
    pub event_id: Uuid,
}

/// Input to `KillSwitch::trigger`.
#[derive(Debug, Clone)]
pub struct Trigger {
    pub agent_id: AgentId,
    pub kind: TriggerKind,
    pub level: ThreatLevel,
    pub reason: String,
    pub metadata: Map<String, Value>,
    pub triggered_by: String,
}

impl Trigger {
    pub fn new(
        agent_id: impl Into<AgentId>,
        kind: TriggerKind,
        level: ThreatLevel,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            kind,
            level,
            reason: reason.into(),
            metadata: Map::new(),
            triggered_by: "system".to_string(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn by(mut self, actor: impl Into<String>) -> Self {
        self.triggered_by = actor.into();
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ViolationRecord {
    kind: TriggerKind,
    level: ThreatLevel,
    reason: String,
    timestamp: DateTime<Utc>,
}

struct AgentRecord {
    state: AgentState,
    executions: HashMap<RequestId, CancellationToken>,
    violations: Vec<ViolationRecord>,
    registered_at: DateTime<Utc>,
}

impl AgentRecord {
    fn new() -> Self {
        Self {
            state: AgentState::Active,
            executions: HashMap::new(),
            violations: Vec::new(),
            registered_at: Utc::now(),
        }
    }

    /// Cancels and forgets every in-flight execution.
    fn cancel_all(&mut self) -> usize {
        let count = self.executions.len();
        for (_, token) in self.executions.drain() {
            token.cancel();
        }
        count
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentStatus {
    pub agent_id: AgentId,
    pub state: AgentState,
    pub active_executions: usize,
    pub violation_count: usize,
    pub registered_at: Option<DateTime<Utc>>,
    pub marker: Option<Marker>,
    pub config: KillSwitchConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct KillSwitchStatus {
    pub global_shutdown: Option<Marker>,
    pub registered_agents: usize,
    pub active_executions: usize,
    pub agents_by_state: HashMap<String, usize>,
    pub total_events: usize,
    pub recent_events: Vec<KillSwitchEvent>,
}

/// Graduated responses to agent misbehavior.
///
/// Low threats are recorded, medium threats suspend the agent, high threats
/// cancel its executions and block it, and critical threats shut the whole
/// control plane down. Markers and the event log are kept in the
/// `StateStore`, live registrations in memory.
pub struct KillSwitch {
    store: Arc<dyn StateStore>,
    settings: KillSwitchSettings,
    notifier: Arc<dyn Notifier>,
    agents: RwLock<HashMap<AgentId, AgentRecord>>,
    configs: RwLock<HashMap<AgentId, KillSwitchConfig>>,
    events: Mutex<VecDeque<KillSwitchEvent>>,
    callbacks: Mutex<Vec<ShutdownCallback>>,
    /// When the auto-trigger check last fired for each agent.
    last_auto: Mutex<HashMap<AgentId, DateTime<Utc>>>,
}

impl KillSwitch {
    pub fn new(store: Arc<dyn StateStore>, settings: KillSwitchSettings) -> Result<Self> {
        let notifier = WebhookNotifier::new(Duration::from_secs(settings.webhook_timeout_secs))
            .context("Failed to build webhook client")?;
        Ok(Self::with_notifier(store, settings, Arc::new(notifier)))
    }

    pub fn with_notifier(
        store: Arc<dyn StateStore>,
        settings: KillSwitchSettings,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            store,
            settings,
            notifier,
            agents: RwLock::new(HashMap::new()),
            configs: RwLock::new(HashMap::new()),
            events: Mutex::new(VecDeque::new()),
            callbacks: Mutex::new(Vec::new()),
            last_auto: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &KillSwitchSettings {
        &self.settings
    }

    fn marker_key(agent_id: &str) -> String {
        format!("killswitch:marker:{}", agent_id)
    }

    async fn read_marker(&self, key: &str) -> Result<Option<Marker>> {
        match self.store.get(key).await? {
            Some(value) => Ok(serde_json::from_value(value).ok()),
            None => Ok(None),
        }
    }

    async fn write_marker(
        &self,
        key: &str,
        kind: MarkerKind,
        reason: &str,
        window: Duration,
        event_id: Uuid,
    ) -> Result<DateTime<Utc>> {
        let until = Utc::now() + chrono::Duration::from_std(window)?;
        let marker = Marker {
            kind,
            reason: reason.to_string(),
            until,
            event_id,
        };
        self.store
            .set(key, serde_json::to_value(&marker)?, Some(window))
            .await?;
        Ok(until)
    }

    pub async fn agent_marker(&self, agent_id: &str) -> Result<Option<Marker>> {
        self.read_marker(&Self::marker_key(agent_id)).await
    }

    pub async fn global_marker(&self) -> Result<Option<Marker>> {
        self.read_marker(GLOBAL_KEY).await
    }

    pub async fn is_global_shutdown(&self) -> Result<bool> {
        Ok(self.global_marker().await?.is_some())
    }

    /// Tracks an in-flight execution so it can be cancelled by an escalation.
    pub async fn register_agent(
        &self,
        agent_id: &str,
        request_id: RequestId,
        cancel: CancellationToken,
    ) {
        let mut agents = self.agents.write().await;
        agents
            .entry(agent_id.to_string())
            .or_insert_with(AgentRecord::new)
            .executions
            .insert(request_id, cancel);
    }

    /// Forgets one execution. The record itself is dropped once it holds no
    /// executions and the agent is in good standing.
    pub async fn release_execution(&self, agent_id: &str, request_id: RequestId) {
        let mut agents = self.agents.write().await;
        let Some(record) = agents.get_mut(agent_id) else {
            return;
        };
        record.executions.remove(&request_id);
        if record.executions.is_empty() && record.state == AgentState::Active {
            agents.remove(agent_id);
        }
    }

    /// Clears the live record. Markers and the event log are untouched.
    pub async fn unregister_agent(&self, agent_id: &str) -> bool {
        self.agents.write().await.remove(agent_id).is_some()
    }

    pub async fn registered_agents(&self) -> Vec<AgentId> {
        self.agents.read().await.keys().cloned().collect()
    }

    /// Returns `(false, reason)` while the agent or the whole control plane
    /// is restricted. Agents whose restriction expired are reinstated.
    pub async fn is_agent_allowed(&self, agent_id: &str) -> Result<(bool, Option<String>)> {
        if let Some(global) = self.global_marker().await? {
            return Ok((
                false,
                Some(format!("Global shutdown active until {}: {}", global.until, global.reason)),
            ));
        }

        if let Some(marker) = self.agent_marker(agent_id).await? {
            let label = match marker.kind {
                MarkerKind::Suspended => "suspended",
                _ => "blocked",
            };
            return Ok((
                false,
                Some(format!(
                    "Agent {} is {} until {}: {}",
                    agent_id, label, marker.until, marker.reason
                )),
            ));
        }

        let mut agents = self.agents.write().await;
        if let Some(record) = agents.get_mut(agent_id) {
            if matches!(record.state, AgentState::Suspended | AgentState::Terminated) {
                record.state = AgentStateMachine::transition(record.state, Escalation::Reinstate)?;
                log::info!("Agent {} reinstated after its restriction expired", agent_id);
            }
        }
        Ok((true, None))
    }

    pub async fn set_agent_config(&self, agent_id: impl Into<AgentId>, config: KillSwitchConfig) {
        self.configs.write().await.insert(agent_id.into(), config);
    }

    pub async fn config_for(&self, agent_id: &str) -> KillSwitchConfig {
        self.configs
            .read()
            .await
            .get(agent_id)
            .cloned()
            .unwrap_or_else(|| self.settings.default_config.clone())
    }

    pub async fn register_shutdown_callback(&self, callback: ShutdownCallback) {
        self.callbacks.lock().await.push(callback);
    }

    /// Applies the response for `trigger.level` and records one event.
    pub async fn trigger(&self, trigger: Trigger) -> Result<KillSwitchEvent> {
        let event_id = Uuid::new_v4();
        let mut actions = Vec::new();

        match trigger.level {
            ThreatLevel::Low => {
                self.escalate_agent(&trigger, Escalation::Warn, false).await?;
                actions.push(KillSwitchAction::ViolationRecorded);
            }
            ThreatLevel::Medium => {
                self.escalate_agent(&trigger, Escalation::Suspend, false).await?;
                actions.push(KillSwitchAction::ViolationRecorded);

                let key = Self::marker_key(&trigger.agent_id);
                let already_blocked = matches!(
                    self.read_marker(&key).await?,
                    Some(Marker { kind: MarkerKind::Blocked, .. })
                );
                if !already_blocked {
                    let until = self
                        .write_marker(
                            &key,
                            MarkerKind::Suspended,
                            &trigger.reason,
                            self.settings.suspend_window(),
                            event_id,
                        )
                        .await?;
                    actions.push(KillSwitchAction::AgentSuspended { until });
                }
            }
            ThreatLevel::High => {
                let count = self.escalate_agent(&trigger, Escalation::Terminate, true).await?;
                actions.push(KillSwitchAction::ExecutionsTerminated { count });

                let until = self
                    .write_marker(
                        &Self::marker_key(&trigger.agent_id),
                        MarkerKind::Blocked,
                        &trigger.reason,
                        self.settings.block_window(),
                        event_id,
                    )
                    .await?;
                actions.push(KillSwitchAction::AgentBlocked { until });
            }
            ThreatLevel::Critical => {
                let count = self.terminate_everything().await;
                actions.push(KillSwitchAction::ExecutionsTerminated { count });

                let until = self
                    .write_marker(
                        GLOBAL_KEY,
                        MarkerKind::GlobalShutdown,
                        &trigger.reason,
                        self.settings.global_window(),
                        event_id,
                    )
                    .await?;

                let mut event = self.build_event(event_id, &trigger, Vec::new());
                event.actions_taken.push(KillSwitchAction::GlobalShutdown { until });
                let (ran, failed) = self.run_shutdown_callbacks(&event).await;
                actions.push(KillSwitchAction::CallbacksExecuted { count: ran, failed });
                actions.push(KillSwitchAction::GlobalShutdown { until });
            }
        }

        let targets = self.notification_targets(&trigger.agent_id).await;
        if !targets.is_empty() {
            actions.push(KillSwitchAction::NotificationQueued {
                targets: targets.len(),
            });
        }

        let event = self.build_event(event_id, &trigger, actions);
        self.log_transition(&event);
        self.append_event(event.clone()).await?;

        if !targets.is_empty() {
            let notifier = Arc::clone(&self.notifier);
            let notification = event.clone();
            tokio::spawn(async move {
                if let Err(e) = notifier.notify(&notification, &targets).await {
                    log::warn!(
                        "Kill switch notification for event {} failed: {:#}",
                        notification.id,
                        e
                    );
                }
            });
        }

        Ok(event)
    }

    fn build_event(
        &self,
        id: Uuid,
        trigger: &Trigger,
        actions_taken: Vec<KillSwitchAction>,
    ) -> KillSwitchEvent {
        KillSwitchEvent {
            id,
            agent_id: trigger.agent_id.clone(),
            trigger: trigger.kind,
            threat_level: trigger.level,
            reason: trigger.reason.clone(),
            metadata: trigger.metadata.clone(),
            timestamp: Utc::now(),
            triggered_by: trigger.triggered_by.clone(),
            actions_taken,
        }
    }

    fn log_transition(&self, event: &KillSwitchEvent) {
        match event.threat_level {
            ThreatLevel::Low | ThreatLevel::Medium => log::warn!(
                "Kill switch {} ({}) for agent {} by {}: {}",
                event.threat_level.as_str(),
                event.trigger.as_str(),
                event.agent_id,
                event.triggered_by,
                event.reason
            ),
            ThreatLevel::High | ThreatLevel::Critical => log::error!(
                "Kill switch {} ({}) for agent {} by {}: {} [{} actions]",
                event.threat_level.as_str(),
                event.trigger.as_str(),
                event.agent_id,
                event.triggered_by,
                event.reason,
                event.actions_taken.len()
            ),
        }
    }

    /// Records the violation and moves the agent's state. Returns how many
    /// in-flight executions were cancelled.
    async fn escalate_agent(
        &self,
        trigger: &Trigger,
        escalation: Escalation,
        cancel_executions: bool,
    ) -> Result<usize> {
        let mut agents = self.agents.write().await;
        let record = agents
            .entry(trigger.agent_id.clone())
            .or_insert_with(AgentRecord::new);

        record.violations.push(ViolationRecord {
            kind: trigger.kind,
            level: trigger.level,
            reason: trigger.reason.clone(),
            timestamp: Utc::now(),
        });
        record.state = AgentStateMachine::transition(record.state, escalation)?;

        Ok(if cancel_executions {
            record.cancel_all()
        } else {
            0
        })
    }

    async fn terminate_everything(&self) -> usize {
        let mut agents = self.agents.write().await;
        let mut cancelled = 0;
        for record in agents.values_mut() {
            cancelled += record.cancel_all();
            record.state = AgentStateMachine::transition(record.state, Escalation::Terminate)
                .unwrap_or(AgentState::Terminated);
        }
        cancelled
    }

    async fn run_shutdown_callbacks(&self, event: &KillSwitchEvent) -> (usize, usize) {
        let callbacks = self.callbacks.lock().await;
        let mut failed = 0;
        for callback in callbacks.iter() {
            match catch_unwind(AssertUnwindSafe(|| callback(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failed += 1;
                    log::error!("Shutdown callback failed: {:#}", e);
                }
                Err(_) => {
                    failed += 1;
                    log::error!("Shutdown callback panicked");
                }
            }
        }
        (callbacks.len(), failed)
    }

    async fn notification_targets(&self, agent_id: &str) -> Vec<String> {
        let mut targets = self.settings.default_config.notification_webhooks.clone();
        if let Some(config) = self.configs.read().await.get(agent_id) {
            for target in &config.notification_webhooks {
                if !targets.contains(target) {
                    targets.push(target.clone());
                }
            }
        }
        targets
    }

    async fn append_event(&self, event: KillSwitchEvent) -> Result<()> {
        let retention = self.settings.event_retention();
        {
            let mut events = self.events.lock().await;
            events.push_back(event.clone());
            let cutoff = Utc::now() - chrono::Duration::from_std(retention)?;
            while events.len() > self.settings.event_log_capacity
                || events.front().is_some_and(|e| e.timestamp < cutoff)
            {
                events.pop_front();
            }
        }

        self.store
            .push_bounded(
                EVENTS_KEY,
                serde_json::to_value(&event)?,
                self.settings.event_log_capacity,
                Some(retention),
            )
            .await
            .context("Failed to persist kill switch event")
    }

    /// Most recent events first.
    pub async fn get_recent_events(&self, limit: usize) -> Vec<KillSwitchEvent> {
        self.events
            .lock()
            .await
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    /// Evaluates the automatic thresholds for one agent. Each breached
    /// threshold fires its own event. Metrics with no activity since the
    /// agent's last automatic escalation are not evaluated again.
    pub async fn check_auto_triggers(
        &self,
        agent_id: &str,
        metrics: &AgentMetrics,
    ) -> Result<Vec<KillSwitchEvent>> {
        let config = self.config_for(agent_id).await;
        if !config.enabled || agent_id == SYSTEM_AGENT || self.is_global_shutdown().await? {
            return Ok(Vec::new());
        }
        let stale = self
            .last_auto
            .lock()
            .await
            .get(agent_id)
            .is_some_and(|fired| metrics.last_activity <= *fired);
        if stale {
            return Ok(Vec::new());
        }

        let marker = self.agent_marker(agent_id).await?;
        let blocked = matches!(marker, Some(Marker { kind: MarkerKind::Blocked, .. }));
        let restricted = marker.is_some();

        let mut pending = Vec::new();
        if metrics.hourly_cost > config.max_cost_per_hour && !blocked {
            pending.push(
                Trigger::new(
                    agent_id,
                    TriggerKind::CostExceeded,
                    ThreatLevel::High,
                    format!(
                        "Hourly cost {:.4} exceeds limit {:.4}",
                        metrics.hourly_cost, config.max_cost_per_hour
                    ),
                )
                .with_metadata("value", metrics.hourly_cost)
                .with_metadata("threshold", config.max_cost_per_hour),
            );
        }
        if metrics.error_rate > config.max_error_rate && !restricted {
            pending.push(
                Trigger::new(
                    agent_id,
                    TriggerKind::ErrorRate,
                    ThreatLevel::Medium,
                    format!(
                        "Error rate {:.2} exceeds limit {:.2}",
                        metrics.error_rate, config.max_error_rate
                    ),
                )
                .with_metadata("value", metrics.error_rate)
                .with_metadata("threshold", config.max_error_rate),
            );
        }
        if metrics.violation_count > config.max_violations && !blocked {
            pending.push(
                Trigger::new(
                    agent_id,
                    TriggerKind::SecurityViolation,
                    ThreatLevel::High,
                    format!(
                        "{} security violations exceed limit {}",
                        metrics.violation_count, config.max_violations
                    ),
                )
                .with_metadata("value", metrics.violation_count)
                .with_metadata("threshold", config.max_violations),
            );
        }

        if pending.is_empty() {
            return Ok(Vec::new());
        }
        self.last_auto
            .lock()
            .await
            .insert(agent_id.to_string(), Utc::now());

        let mut fired = Vec::with_capacity(pending.len());
        for trigger in pending {
            fired.push(self.trigger(trigger.by(AUTO_ACTOR)).await?);
        }
        Ok(fired)
    }

    /// One poll round over every registered or monitored agent. Errors for
    /// one agent are logged and do not stop the round.
    pub async fn poll(&self, source: &dyn MetricsSource) -> usize {
        let mut agents = self.registered_agents().await;
        for agent in source.tracked_agents().await {
            if !agents.contains(&agent) {
                agents.push(agent);
            }
        }

        let mut fired = 0;
        for agent_id in agents {
            let Some(metrics) = source.agent_metrics(&agent_id).await else {
                continue;
            };
            match self.check_auto_triggers(&agent_id, &metrics).await {
                Ok(events) => fired += events.len(),
                Err(e) => log::error!("Auto-trigger check for agent {} failed: {:#}", agent_id, e),
            }
        }
        fired
    }

    /// Operator stop of every registered agent, one high-level event each.
    pub async fn emergency_stop_all(
        &self,
        reason: &str,
        triggered_by: &str,
    ) -> Result<Vec<KillSwitchEvent>> {
        let mut events = Vec::new();
        for agent_id in self.registered_agents().await {
            let trigger = Trigger::new(
                agent_id,
                TriggerKind::AdminOverride,
                ThreatLevel::High,
                reason,
            )
            .by(triggered_by);
            events.push(self.trigger(trigger).await?);
        }
        Ok(events)
    }

    pub async fn get_agent_status(&self, agent_id: &str) -> Result<AgentStatus> {
        let marker = self.agent_marker(agent_id).await?;
        let config = self.config_for(agent_id).await;
        let agents = self.agents.read().await;
        let record = agents.get(agent_id);

        Ok(AgentStatus {
            agent_id: agent_id.to_string(),
            state: record.map(|r| r.state).unwrap_or(AgentState::Active),
            active_executions: record.map(|r| r.executions.len()).unwrap_or(0),
            violation_count: record.map(|r| r.violations.len()).unwrap_or(0),
            registered_at: record.map(|r| r.registered_at),
            marker,
            config,
        })
    }

    pub async fn get_system_status(&self) -> Result<KillSwitchStatus> {
        let global_shutdown = self.global_marker().await?;
        let agents = self.agents.read().await;

        let mut agents_by_state: HashMap<String, usize> = HashMap::new();
        for record in agents.values() {
            let state = serde_json::to_value(record.state)?
                .as_str()
                .unwrap_or_default()
                .to_string();
            *agents_by_state.entry(state).or_default() += 1;
        }

        let events = self.events.lock().await;
        Ok(KillSwitchStatus {
            global_shutdown,
            registered_agents: agents.len(),
            active_executions: agents.values().map(|r| r.executions.len()).sum(),
            agents_by_state,
            total_events: events.len(),
            recent_events: events.iter().rev().take(10).cloned().collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RecordingNotifier {
        delivered: Mutex<Vec<(Uuid, Vec<String>)>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, event: &KillSwitchEvent, targets: &[String]) -> Result<()> {
            self.delivered.lock().await.push((event.id, targets.to_vec()));
            Ok(())
        }
    }

    fn switch() -> KillSwitch {
        KillSwitch::with_notifier(
            Arc::new(InMemoryStore::new()),
            KillSwitchSettings::default(),
            Arc::new(RecordingNotifier {
                delivered: Mutex::new(Vec::new()),
            }),
        )
    }

    #[tokio::test]
    async fn test_low_records_without_restricting() {
        let ks = switch();
        let event = ks
            .trigger(Trigger::new("a", TriggerKind::SuspiciousActivity, ThreatLevel::Low, "odd"))
            .await
            .unwrap();

        assert_eq!(event.actions_taken, vec![KillSwitchAction::ViolationRecorded]);
        assert_eq!(ks.is_agent_allowed("a").await.unwrap(), (true, None));
        let status = ks.get_agent_status("a").await.unwrap();
        assert_eq!(status.state, AgentState::Warned);
        assert_eq!(status.violation_count, 1);
    }

    #[tokio::test]
    async fn test_medium_suspends() {
        let ks = switch();
        ks.trigger(Trigger::new("a", TriggerKind::ErrorRate, ThreatLevel::Medium, "errors"))
            .await
            .unwrap();

        let (allowed, reason) = ks.is_agent_allowed("a").await.unwrap();
        assert!(!allowed);
        assert!(reason.unwrap().contains("suspended"));
        assert_eq!(
            ks.agent_marker("a").await.unwrap().unwrap().kind,
            MarkerKind::Suspended
        );
        assert!(ks.is_agent_allowed("b").await.unwrap().0);
    }

    #[tokio::test]
    async fn test_high_cancels_and_blocks() {
        let ks = switch();
        let token = CancellationToken::new();
        ks.register_agent("a", Uuid::new_v4(), token.clone()).await;

        let event = ks
            .trigger(Trigger::new("a", TriggerKind::SecurityViolation, ThreatLevel::High, "breach"))
            .await
            .unwrap();

        assert!(token.is_cancelled());
        assert!(event
            .actions_taken
            .contains(&KillSwitchAction::ExecutionsTerminated { count: 1 }));
        assert_eq!(ks.get_agent_status("a").await.unwrap().state, AgentState::Terminated);
        assert!(!ks.is_agent_allowed("a").await.unwrap().0);
    }

    #[tokio::test]
    async fn test_single_marker_per_agent() {
        let ks = switch();
        ks.trigger(Trigger::new("a", TriggerKind::Manual, ThreatLevel::High, "block"))
            .await
            .unwrap();
        let event = ks
            .trigger(Trigger::new("a", TriggerKind::ErrorRate, ThreatLevel::Medium, "late"))
            .await
            .unwrap();

        assert!(!event
            .actions_taken
            .iter()
            .any(|a| matches!(a, KillSwitchAction::AgentSuspended { .. })));
        assert_eq!(
            ks.agent_marker("a").await.unwrap().unwrap().kind,
            MarkerKind::Blocked
        );
    }

    #[tokio::test]
    async fn test_critical_shuts_everything_down() {
        let ks = switch();
        let tokens: Vec<_> = (0..3).map(|_| CancellationToken::new()).collect();
        for (i, token) in tokens.iter().enumerate() {
            ks.register_agent(&format!("agent-{}", i), Uuid::new_v4(), token.clone())
                .await;
        }
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        ks.register_shutdown_callback(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }))
        .await;
        ks.register_shutdown_callback(Box::new(|_| anyhow::bail!("broken")))
            .await;

        let event = ks
            .trigger(Trigger::new(SYSTEM_AGENT, TriggerKind::Manual, ThreatLevel::Critical, "stop"))
            .await
            .unwrap();

        assert!(tokens.iter().all(|t| t.is_cancelled()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(event
            .actions_taken
            .contains(&KillSwitchAction::CallbacksExecuted { count: 2, failed: 1 }));
        assert!(ks.is_global_shutdown().await.unwrap());
        assert!(!ks.is_agent_allowed("someone-new").await.unwrap().0);

        let status = ks.get_system_status().await.unwrap();
        assert_eq!(status.agents_by_state.get("terminated"), Some(&3));
        assert_eq!(status.total_events, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_suspension_reinstates() {
        let ks = switch();
        ks.trigger(Trigger::new("a", TriggerKind::ErrorRate, ThreatLevel::Medium, "errors"))
            .await
            .unwrap();
        assert!(!ks.is_agent_allowed("a").await.unwrap().0);

        tokio::time::advance(Duration::from_secs(31 * 60)).await;
        assert!(ks.is_agent_allowed("a").await.unwrap().0);
        assert_eq!(ks.get_agent_status("a").await.unwrap().state, AgentState::Active);
    }

    #[tokio::test]
    async fn test_auto_triggers_fire_independently() {
        let ks = switch();
        let mut metrics = AgentMetrics::new("a");
        metrics.hourly_cost = 75.0;
        metrics.error_rate = 0.9;
        metrics.violation_count = 6;

        let fired = ks.check_auto_triggers("a", &metrics).await.unwrap();
        let kinds: Vec<_> = fired.iter().map(|e| e.trigger).collect();
        assert_eq!(
            kinds,
            vec![
                TriggerKind::CostExceeded,
                TriggerKind::ErrorRate,
                TriggerKind::SecurityViolation
            ]
        );
        assert!(fired.iter().all(|e| e.triggered_by == "auto"));

        // Already blocked: nothing fires again.
        assert!(ks.check_auto_triggers("a", &metrics).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_disabled_config_skips_auto_triggers() {
        let ks = switch();
        ks.set_agent_config(
            "a",
            KillSwitchConfig {
                enabled: false,
                ..KillSwitchConfig::default()
            },
        )
        .await;
        let mut metrics = AgentMetrics::new("a");
        metrics.error_rate = 1.0;

        assert!(ks.check_auto_triggers("a", &metrics).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_notifications_are_queued() {
        let notifier = Arc::new(RecordingNotifier {
            delivered: Mutex::new(Vec::new()),
        });
        let ks = KillSwitch::with_notifier(
            Arc::new(InMemoryStore::new()),
            KillSwitchSettings::default(),
            notifier.clone(),
        );
        ks.set_agent_config(
            "a",
            KillSwitchConfig {
                notification_webhooks: vec!["http://hooks.local/a".to_string()],
                ..KillSwitchConfig::default()
            },
        )
        .await;

        let event = ks
            .trigger(Trigger::new("a", TriggerKind::Manual, ThreatLevel::Low, "ping"))
            .await
            .unwrap();
        assert!(event
            .actions_taken
            .contains(&KillSwitchAction::NotificationQueued { targets: 1 }));

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        let delivered = notifier.delivered.lock().await;
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].0, event.id);
    }

    #[tokio::test]
    async fn test_event_log_is_bounded() {
        let ks = KillSwitch::with_notifier(
            Arc::new(InMemoryStore::new()),
            KillSwitchSettings {
                event_log_capacity: 3,
                ..KillSwitchSettings::default()
            },
            Arc::new(RecordingNotifier {
                delivered: Mutex::new(Vec::new()),
            }),
        );
        for i in 0..5 {
            ks.trigger(Trigger::new("a", TriggerKind::Manual, ThreatLevel::Low, format!("{}", i)))
                .await
                .unwrap();
        }

        let events = ks.get_recent_events(10).await;
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].reason, "4");
        assert_eq!(ks.store.list(EVENTS_KEY).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_release_drops_clean_records_only() {
        let ks = switch();
        let id = Uuid::new_v4();
        ks.register_agent("a", id, CancellationToken::new()).await;
        ks.release_execution("a", id).await;
        assert!(ks.registered_agents().await.is_empty());

        ks.register_agent("b", id, CancellationToken::new()).await;
        ks.trigger(Trigger::new("b", TriggerKind::Manual, ThreatLevel::Low, "w"))
            .await
            .unwrap();
        ks.release_execution("b", id).await;
        assert_eq!(ks.registered_agents().await, vec!["b".to_string()]);
        assert!(ks.unregister_agent("b").await);
    }
}
