use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{Components, CostModel, OrchestratorSettings};
use crate::admission::AdmissionController;
use crate::error::WardenError;
use crate::killswitch::{KillSwitch, KillSwitchStatus, Trigger};
use crate::monitoring::{DashboardSnapshot, ExecutionSample, MonitoringService};
use crate::sandbox::{Handler, HandlerRegistry, SandboxExecutor};
use crate::types::{
    AlertSeverity, ExecutionOutcome, ExecutionResult, ExecutionStatus, HandlerRequest,
    MetricType, OutcomeStatus, RequestId, SecurityLimits, Severity, SlotId, ThreatLevel,
    TriggerKind, ValidationSummary, SYSTEM_AGENT,
};
use crate::validation::{CacheStats, CodeValidator};

/// An accepted request that has not been finalized yet.
pub(super) struct ActiveExecution {
    pub(super) result: ExecutionResult,
    pub(super) started: Instant,
    pub(super) timeout: Duration,
    pub(super) cancel: CancellationToken,
    slot: Option<SlotId>,
    admitted: bool,
}

/// How a request left the pipeline.
struct Completion {
    status: ExecutionStatus,
    outcome: Option<ExecutionOutcome>,
    validation: Option<ValidationSummary>,
    violations: Vec<String>,
    error: Option<String>,
    op_type: &'static str,
}

impl Completion {
    fn blocked(error: impl Into<String>, violations: Vec<String>, op_type: &'static str) -> Self {
        Self {
            status: ExecutionStatus::Blocked,
            outcome: None,
            validation: None,
            violations,
            error: Some(error.into()),
            op_type,
        }
    }

    fn failed(error: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Failed,
            outcome: None,
            validation: None,
            violations: Vec::new(),
            error: Some(error.into()),
            op_type: "error",
        }
    }

    fn killed(reason: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Killed,
            outcome: None,
            validation: None,
            violations: Vec::new(),
            error: Some(reason.into()),
            op_type: "cancelled",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub status: &'static str,
    pub active_executions: usize,
    pub handlers: Vec<String>,
    pub validation_cache: CacheStats,
    pub killswitch: KillSwitchStatus,
    pub monitoring: DashboardSnapshot,
    pub recent_executions: Vec<ExecutionResult>,
}

/// Runs every request through kill-switch and admission checks, validation,
/// slot acquisition and the sandbox, in that order, and finalizes each
/// request exactly once.
///
/// Finalization belongs to whoever removes the request from the active
/// table: the pipeline on normal completion, `cancel_execution` otherwise.
pub struct Orchestrator {
    pub(super) settings: OrchestratorSettings,
    cost: CostModel,
    validator: Arc<CodeValidator>,
    admission: Arc<AdmissionController>,
    pub(super) killswitch: Arc<KillSwitch>,
    pub(super) monitoring: Arc<MonitoringService>,
    sandbox: Arc<dyn SandboxExecutor>,
    handlers: RwLock<HandlerRegistry>,
    default_limits: SecurityLimits,
    pub(super) active: Mutex<HashMap<RequestId, ActiveExecution>>,
    history: Mutex<VecDeque<ExecutionResult>>,
    shutting_down: AtomicBool,
    pub(super) background: CancellationToken,
    pub(super) tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn new(components: Components, settings: OrchestratorSettings, cost: CostModel) -> Self {
        Self {
            settings,
            cost,
            validator: components.validator,
            admission: components.admission,
            killswitch: components.killswitch,
            monitoring: components.monitoring,
            sandbox: components.sandbox,
            handlers: RwLock::new(components.handlers),
            default_limits: components.default_limits,
            active: Mutex::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
            shutting_down: AtomicBool::new(false),
            background: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn validator(&self) -> &Arc<CodeValidator> {
        &self.validator
    }

    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    pub fn killswitch(&self) -> &Arc<KillSwitch> {
        &self.killswitch
    }

    pub fn monitoring(&self) -> &Arc<MonitoringService> {
        &self.monitoring
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub async fn register_handler(&self, handler: Arc<dyn Handler>) {
        self.handlers.write().await.register(handler);
    }

    /// Accepts the request and registers its agent with the kill switch.
    async fn begin(&self, request: &HandlerRequest) -> Result<CancellationToken, WardenError> {
        if self.is_shutting_down() {
            return Err(WardenError::ShuttingDown);
        }

        let cancel = CancellationToken::new();
        let entry = ActiveExecution {
            result: ExecutionResult::new(
                request.id,
                request.agent_id.clone(),
                request.handler_name.clone(),
            ),
            started: Instant::now(),
            timeout: request.timeout(),
            cancel: cancel.clone(),
            slot: None,
            admitted: false,
        };
        self.active.lock().await.insert(request.id, entry);
        self.killswitch
            .register_agent(&request.agent_id, request.id, cancel.clone())
            .await;

        log::info!(
            "Accepted request {} from agent {} for handler '{}'",
            request.id,
            request.agent_id,
            request.handler_name
        );
        Ok(cancel)
    }

    /// Runs the request and waits for its final result. The pipeline runs on
    /// its own task, so dropping the returned future does not abandon it.
    pub async fn execute_handler(
        self: &Arc<Self>,
        request: HandlerRequest,
    ) -> Result<ExecutionResult, WardenError> {
        let cancel = self.begin(&request).await?;
        let id = request.id;
        let settled = self.spawn_pipeline(request, cancel).await.ok().flatten();
        match settled {
            Some(result) => Ok(result),
            None => self
                .get_result(id)
                .await
                .ok_or(WardenError::ExecutionNotFound(id)),
        }
    }

    /// Accepts the request and runs it on a background task.
    pub async fn submit(self: &Arc<Self>, request: HandlerRequest) -> Result<RequestId, WardenError> {
        let cancel = self.begin(&request).await?;
        let id = request.id;
        drop(self.spawn_pipeline(request, cancel));
        Ok(id)
    }

    /// Runs the pipeline under a supervising task that settles the request
    /// as failed if the pipeline panics.
    fn spawn_pipeline(
        self: &Arc<Self>,
        request: HandlerRequest,
        cancel: CancellationToken,
    ) -> JoinHandle<Option<ExecutionResult>> {
        let id = request.id;
        let this = Arc::clone(self);

        tokio::spawn(async move {
            let runner = Arc::clone(&this);
            let run = tokio::spawn(async move { runner.run_pipeline(request, cancel).await });
            match run.await {
                Ok(result) => Some(result),
                Err(e) => {
                    log::error!("Pipeline for request {} crashed: {}", id, e);
                    this.abort_execution(id, Completion::failed(format!("Internal error: {}", e)))
                        .await;
                    this.get_result(id).await
                }
            }
        })
    }

    async fn run_pipeline(&self, request: HandlerRequest, cancel: CancellationToken) -> ExecutionResult {
        let completion = self.pipeline(&request, &cancel).await;
        let entry = self.active.lock().await.remove(&request.id);
        match entry {
            Some(entry) => self.settle(entry, completion).await,
            None => self.finalized_result(&request).await,
        }
    }

    async fn finalized_result(&self, request: &HandlerRequest) -> ExecutionResult {
        match self.get_result(request.id).await {
            Some(result) => result,
            None => {
                let mut result = ExecutionResult::new(
                    request.id,
                    request.agent_id.clone(),
                    request.handler_name.clone(),
                );
                result.status = ExecutionStatus::Killed;
                result
            }
        }
    }

    /// Moves the active entry to `status`. Returns `false` once the request
    /// was removed by a cancellation.
    async fn advance<F>(&self, id: RequestId, status: ExecutionStatus, update: F) -> bool
    where
        F: FnOnce(&mut ActiveExecution),
    {
        let mut active = self.active.lock().await;
        match active.get_mut(&id) {
            Some(entry) => {
                entry.result.status = status;
                update(entry);
                true
            }
            None => false,
        }
    }

    async fn pipeline(&self, request: &HandlerRequest, cancel: &CancellationToken) -> Completion {
        let id = request.id;
        let agent_id = request.agent_id.as_str();

        match self.killswitch.is_agent_allowed(agent_id).await {
            Ok((true, _)) => {}
            Ok((false, reason)) => {
                let reason = reason.unwrap_or_else(|| "Agent is restricted".to_string());
                return Completion::blocked(reason.clone(), vec![reason], "rejected");
            }
            Err(e) => return self.system_error(request, "kill switch check", e),
        }

        let decision = match self
            .admission
            .check_limits(agent_id, self.settings.estimated_cost, 1)
            .await
        {
            Ok(decision) => decision,
            Err(e) => return self.system_error(request, "admission check", e),
        };
        if !decision.allowed {
            return Completion::blocked(
                format!("Admission rejected: {}", decision.violations.join("; ")),
                decision.violations,
                "rejected",
            );
        }
        if !self
            .advance(id, ExecutionStatus::Validating, |e| e.admitted = true)
            .await
        {
            return Completion::killed("Cancelled before validation");
        }

        let report = match self
            .validator
            .validate(&request.source_code, &request.handler_name, request.strictness)
            .await
        {
            Ok(report) => report,
            Err(e) => return self.system_error(request, "validation", e),
        };
        let summary = report.summary();
        if !report.verdict.allows_execution() {
            let findings: Vec<String> = report
                .issues
                .iter()
                .filter(|i| i.severity >= Severity::Warning)
                .map(|i| i.message.clone())
                .collect();
            self.monitoring
                .create_alert(
                    agent_id,
                    AlertSeverity::Warning,
                    MetricType::Validation,
                    format!(
                        "Handler '{}' rejected by validation ({:?})",
                        request.handler_name, report.verdict
                    ),
                    f64::from(report.overall_score),
                    100.0,
                )
                .await;

            let mut completion = Completion::blocked(
                format!("Validation verdict {:?}", report.verdict).to_lowercase(),
                findings,
                "validation_rejected",
            );
            completion.validation = Some(summary);
            return completion;
        }

        let Some(handler) = self.handlers.read().await.get(&request.handler_name) else {
            let mut completion = Completion::failed(
                WardenError::UnknownHandler(request.handler_name.clone()).to_string(),
            );
            completion.validation = Some(summary);
            return completion;
        };

        let slot = match self.admission.acquire_slot(agent_id).await {
            Ok(slot) => slot,
            Err(e) => {
                let mut completion = Completion::blocked(e.to_string(), vec![e.to_string()], "rejected");
                completion.validation = Some(summary);
                return completion;
            }
        };
        let attached = self
            .advance(id, ExecutionStatus::Executing, |e| {
                e.slot = Some(slot);
                e.result.validation = Some(summary.clone());
            })
            .await;
        if !attached {
            self.admission.release_slot(agent_id, slot).await;
            return Completion::killed("Cancelled before execution");
        }

        let limits = request
            .limits
            .clone()
            .unwrap_or_else(|| self.default_limits.clone());
        let outcome = match self
            .sandbox
            .run(
                handler,
                &request.handler_name,
                request.params.clone(),
                &limits,
                request.timeout(),
                cancel.clone(),
            )
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => return self.system_error(request, "sandbox", e),
        };

        let mut completion = match outcome.status {
            OutcomeStatus::Success => Completion {
                status: ExecutionStatus::Completed,
                outcome: None,
                validation: None,
                violations: Vec::new(),
                error: None,
                op_type: "execute",
            },
            OutcomeStatus::SecurityViolation => {
                let reason = outcome
                    .error
                    .clone()
                    .unwrap_or_else(|| "Security violation".to_string());
                let trigger = Trigger::new(
                    agent_id,
                    TriggerKind::SecurityViolation,
                    ThreatLevel::High,
                    reason.clone(),
                )
                .with_metadata("request_id", request.id.to_string())
                .with_metadata("handler", request.handler_name.clone());
                if let Err(e) = self.killswitch.trigger(trigger).await {
                    log::error!(
                        "Failed to escalate violation of request {} (agent {}): {:#}",
                        id,
                        agent_id,
                        e
                    );
                }
                Completion::blocked(reason.clone(), vec![reason], "execute")
            }
            OutcomeStatus::Failure if cancel.is_cancelled() => {
                Completion::killed("Terminated by kill switch")
            }
            OutcomeStatus::Failure | OutcomeStatus::Timeout => Completion {
                status: ExecutionStatus::Failed,
                outcome: None,
                validation: None,
                violations: Vec::new(),
                error: outcome.error.clone(),
                op_type: "execute",
            },
        };
        completion.outcome = Some(outcome);
        completion
    }

    fn system_error(
        &self,
        request: &HandlerRequest,
        stage: &str,
        error: anyhow::Error,
    ) -> Completion {
        log::error!(
            "System error during {} for request {} (agent {}, handler '{}'): {:#}",
            stage,
            request.id,
            request.agent_id,
            request.handler_name,
            error
        );
        Completion::failed(format!("System error during {}: {}", stage, error))
    }

    /// Settles bookkeeping for a request removed from the active table.
    async fn settle(&self, entry: ActiveExecution, completion: Completion) -> ExecutionResult {
        let elapsed = entry.started.elapsed();
        let mut result = entry.result;
        let agent_id = result.agent_id.clone();

        result.status = completion.status;
        result.error = completion.error;
        result.security_violations = completion.violations;
        if completion.validation.is_some() {
            result.validation = completion.validation;
        }
        result.outcome = completion.outcome;
        result.execution_time_ms = elapsed.as_millis() as u64;
        result.completed_at = Some(Utc::now());
        result.cost_estimate = if entry.admitted {
            self.cost.estimate(elapsed)
        } else {
            0.0
        };

        if let Some(slot) = entry.slot {
            self.admission.release_slot(&agent_id, slot).await;
        }

        let success = result.status == ExecutionStatus::Completed;
        let usage = result
            .outcome
            .as_ref()
            .map(|o| o.usage.clone())
            .unwrap_or_default();
        if entry.admitted {
            if let Err(e) = self
                .admission
                .record_operation(
                    &agent_id,
                    result.cost_estimate,
                    &usage,
                    success,
                    elapsed,
                    completion.op_type,
                )
                .await
            {
                log::error!(
                    "Failed to record operation for request {} (agent {}): {:#}",
                    result.request_id,
                    agent_id,
                    e
                );
            }

            let security_violation = result
                .outcome
                .as_ref()
                .is_some_and(|o| o.status == OutcomeStatus::SecurityViolation);
            self.monitoring
                .record_execution(
                    &agent_id,
                    &ExecutionSample {
                        success,
                        latency: elapsed,
                        cost: result.cost_estimate,
                        peak_memory_mb: usage.peak_memory_mb,
                        security_violation,
                    },
                )
                .await;
        }

        self.killswitch
            .release_execution(&agent_id, result.request_id)
            .await;

        log::info!(
            "Request {} from agent {} finished as {} in {} ms",
            result.request_id,
            agent_id,
            result.status.as_str(),
            result.execution_time_ms
        );

        let mut history = self.history.lock().await;
        history.push_back(result.clone());
        while history.len() > self.settings.history_capacity {
            history.pop_front();
        }

        result
    }

    async fn abort_execution(&self, id: RequestId, completion: Completion) -> bool {
        let Some(entry) = self.active.lock().await.remove(&id) else {
            return false;
        };
        entry.cancel.cancel();
        self.settle(entry, completion).await;
        true
    }

    /// Stops a request and records it as killed. Returns `false` for
    /// unknown or already finished requests.
    pub async fn cancel_execution(&self, id: RequestId, reason: &str) -> bool {
        let cancelled = self.abort_execution(id, Completion::killed(reason)).await;
        if cancelled {
            log::warn!("Cancelled request {}: {}", id, reason);
        }
        cancelled
    }

    /// Irreversible for this process: refuses new work, raises a critical
    /// kill-switch event, kills every active request and stops background
    /// loops. Returns the ids of the requests that were active.
    pub async fn emergency_shutdown(&self, reason: &str) -> Vec<RequestId> {
        self.shutting_down.store(true, Ordering::SeqCst);
        let ids: Vec<RequestId> = self.active.lock().await.keys().copied().collect();
        log::error!(
            "Emergency shutdown: {} ({} active executions)",
            reason,
            ids.len()
        );

        let trigger = Trigger::new(
            SYSTEM_AGENT,
            TriggerKind::AdminOverride,
            ThreatLevel::Critical,
            reason,
        )
        .with_metadata("active_executions", ids.len())
        .by("orchestrator");
        if let Err(e) = self.killswitch.trigger(trigger).await {
            log::error!("Failed to record emergency shutdown event: {:#}", e);
        }

        let message = format!("Emergency shutdown: {}", reason);
        for id in &ids {
            self.cancel_execution(*id, &message).await;
        }

        self.stop().await;
        ids
    }

    pub async fn get_status(&self, id: RequestId) -> Option<ExecutionStatus> {
        self.get_result(id).await.map(|r| r.status)
    }

    pub async fn get_result(&self, id: RequestId) -> Option<ExecutionResult> {
        if let Some(entry) = self.active.lock().await.get(&id) {
            return Some(entry.result.clone());
        }
        self.history
            .lock()
            .await
            .iter()
            .rev()
            .find(|r| r.request_id == id)
            .cloned()
    }

    pub async fn active_count(&self) -> usize {
        self.active.lock().await.len()
    }

    /// Most recent first.
    pub async fn recent_results(&self, limit: usize) -> Vec<ExecutionResult> {
        self.history
            .lock()
            .await
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    pub async fn get_system_status(&self) -> Result<SystemStatus> {
        Ok(SystemStatus {
            status: if self.is_shutting_down() {
                "shutdown"
            } else {
                "running"
            },
            active_executions: self.active_count().await,
            handlers: self.handlers.read().await.names(),
            validation_cache: self.validator.cache_stats(),
            killswitch: self.killswitch.get_system_status().await?,
            monitoring: self.monitoring.get_dashboard_data().await,
            recent_executions: self.recent_results(10).await,
        })
    }
}
