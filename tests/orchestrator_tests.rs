//! End-to-end pipeline scenarios: validation gating, admission, violation
//! escalation, cancellation, reaping and emergency shutdown.

use anyhow::Result;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use warden::orchestrator::{Components, CostModel};
use warden::sandbox::{Handler, SandboxContext, SandboxError, SandboxExecutor};
use warden::storage::{InMemoryStore, StateStore};
use warden::{
    Config, ExecutionOutcome, ExecutionStatus, HandlerRequest, MetricType, Orchestrator,
    OutcomeStatus, ResourceUsage, SecurityLimits, Strictness, ThreatLevel, ValidationVerdict,
    WardenError,
};

const CLEAN_HANDLER: &str = r#"
class Handler:
    async def execute(self, params: dict) -> dict:
        try:
            return {"status": "ok", "echo": params}
        except Exception as exc:
            return {"status": "error", "message": str(exc)}
"#;

const EVAL_HANDLER: &str = r#"
class Handler:
    async def execute(self, params: dict) -> dict:
        try:
            return {"status": "ok", "value": eval(params["expr"])}
        except Exception as exc:
            return {"status": "error", "message": str(exc)}
"#;

#[derive(Clone, Copy)]
enum Behavior {
    Succeed,
    Fail,
    Violate,
    WaitForCancel,
    /// Finishes after a short delay whatever happens to the caller.
    Slow,
    /// Never returns and never looks at its cancellation token.
    Hang,
    Panic,
}

/// Sandbox stand-in that records how often it was asked to run.
struct MockSandbox {
    behavior: Behavior,
    calls: AtomicUsize,
}

impl MockSandbox {
    fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl SandboxExecutor for MockSandbox {
    async fn run(
        &self,
        _handler: Arc<dyn Handler>,
        _name: &str,
        params: Value,
        _limits: &SecurityLimits,
        _timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<ExecutionOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let usage = ResourceUsage::default();
        Ok(match self.behavior {
            Behavior::Succeed => ExecutionOutcome::success(json!({ "status": "ok", "echo": params }), usage),
            Behavior::Fail => ExecutionOutcome::failed(OutcomeStatus::Failure, "handler raised", usage),
            Behavior::Violate => ExecutionOutcome::failed(
                OutcomeStatus::SecurityViolation,
                "max_network_calls exceeded: call 101 to api.example.com exceeds limit 100",
                usage,
            ),
            Behavior::WaitForCancel => {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        ExecutionOutcome::failed(OutcomeStatus::Failure, "Execution cancelled", usage)
                    }
                    _ = tokio::time::sleep(Duration::from_secs(30)) => {
                        ExecutionOutcome::success(json!({ "status": "ok" }), usage)
                    }
                }
            }
            Behavior::Slow => {
                tokio::time::sleep(Duration::from_millis(50)).await;
                ExecutionOutcome::success(json!({ "status": "ok" }), usage)
            }
            Behavior::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                ExecutionOutcome::success(json!({ "status": "ok" }), usage)
            }
            Behavior::Panic => panic!("sandbox subsystem fault"),
        })
    }
}

fn orchestrator(config: &Config, sandbox: &Arc<MockSandbox>) -> Arc<Orchestrator> {
    let store: Arc<dyn StateStore> = Arc::new(InMemoryStore::new());
    let mut components = Components::from_config(config, store).unwrap();
    components.sandbox = sandbox.clone() as Arc<dyn SandboxExecutor>;
    Arc::new(Orchestrator::new(
        components,
        config.orchestrator.clone(),
        config.cost,
    ))
}

fn request(agent: &str) -> HandlerRequest {
    HandlerRequest::new(agent, "echo", CLEAN_HANDLER, json!({ "x": 1 }))
}

async fn wait_for_status(orchestrator: &Orchestrator, id: uuid::Uuid, status: ExecutionStatus) {
    for _ in 0..300 {
        if orchestrator.get_status(id).await == Some(status) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("request {} never reached {:?}", id, status);
}

#[tokio::test]
async fn test_clean_request_completes() {
    let sandbox = MockSandbox::new(Behavior::Succeed);
    let orchestrator = orchestrator(&Config::default(), &sandbox);

    let result = orchestrator.execute_handler(request("agent-1")).await.unwrap();

    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(sandbox.calls(), 1);
    assert_eq!(result.validation.unwrap().verdict, ValidationVerdict::Passed);
    assert!(result.cost_estimate > 0.0);
    assert!(result.completed_at.is_some());

    let metrics = orchestrator.monitoring().get_agent_metrics("agent-1").await.unwrap();
    assert_eq!(metrics.total_executions, 1);
    assert_eq!(orchestrator.admission().active_slots("agent-1").await, 0);
}

#[tokio::test]
async fn test_eval_under_strict_never_reaches_sandbox() {
    let sandbox = MockSandbox::new(Behavior::Succeed);
    let orchestrator = orchestrator(&Config::default(), &sandbox);

    let request = HandlerRequest::new("agent-1", "echo", EVAL_HANDLER, json!({ "expr": "1 + 1" }))
        .with_strictness(Strictness::Strict);
    let result = orchestrator.execute_handler(request).await.unwrap();

    assert_eq!(result.status, ExecutionStatus::Blocked);
    assert_eq!(sandbox.calls(), 0);
    assert_eq!(result.validation.unwrap().verdict, ValidationVerdict::Failed);
    assert!(!result.security_violations.is_empty());

    let alerts = orchestrator.monitoring().get_alerts(false).await;
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].metric_type, MetricType::Validation);
}

#[tokio::test]
async fn test_hourly_cost_exhaustion_blocks_next_request() {
    let sandbox = MockSandbox::new(Behavior::Succeed);
    let mut config = Config::default();
    config.cost = CostModel {
        base: 0.01,
        per_second: 0.0,
    };
    config.admission.defaults.max_cost_per_hour = 0.015;
    let orchestrator = orchestrator(&config, &sandbox);

    let first = orchestrator.execute_handler(request("agent-1")).await.unwrap();
    assert_eq!(first.status, ExecutionStatus::Completed);
    assert_eq!(first.cost_estimate, 0.01);

    let second = orchestrator.execute_handler(request("agent-1")).await.unwrap();
    assert_eq!(second.status, ExecutionStatus::Blocked);
    assert!(second.error.unwrap().contains("Hourly cost limit"));
    assert_eq!(second.cost_estimate, 0.0);
    assert_eq!(sandbox.calls(), 1);

    // Budgets are per agent.
    let other = orchestrator.execute_handler(request("agent-2")).await.unwrap();
    assert_eq!(other.status, ExecutionStatus::Completed);
}

#[tokio::test]
async fn test_security_violation_blocks_agent() {
    let sandbox = MockSandbox::new(Behavior::Violate);
    let orchestrator = orchestrator(&Config::default(), &sandbox);

    let result = orchestrator.execute_handler(request("agent-1")).await.unwrap();

    assert_eq!(result.status, ExecutionStatus::Blocked);
    assert_eq!(result.security_violations.len(), 1);
    assert!(result.security_violations[0].contains("max_network_calls"));

    let events = orchestrator.killswitch().get_recent_events(10).await;
    let high: Vec<_> = events
        .iter()
        .filter(|e| e.threat_level == ThreatLevel::High)
        .collect();
    assert_eq!(high.len(), 1);
    assert_eq!(high[0].agent_id, "agent-1");

    let metrics = orchestrator.monitoring().get_agent_metrics("agent-1").await.unwrap();
    assert_eq!(metrics.violation_count, 1);

    let (allowed, reason) = orchestrator.killswitch().is_agent_allowed("agent-1").await.unwrap();
    assert!(!allowed);
    assert!(reason.is_some());

    let next = orchestrator.execute_handler(request("agent-1")).await.unwrap();
    assert_eq!(next.status, ExecutionStatus::Blocked);
    assert_eq!(next.cost_estimate, 0.0);
    assert_eq!(sandbox.calls(), 1);
    assert_eq!(orchestrator.admission().active_slots("agent-1").await, 0);
}

#[tokio::test]
async fn test_slots_are_released_on_every_path() {
    let failing = MockSandbox::new(Behavior::Fail);
    let orchestrator = orchestrator(&Config::default(), &failing);

    for _ in 0..3 {
        let result = orchestrator.execute_handler(request("agent-1")).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.error.as_deref(), Some("handler raised"));
    }

    let unknown = HandlerRequest::new("agent-1", "no-such-handler", CLEAN_HANDLER, json!({}));
    let result = orchestrator.execute_handler(unknown).await.unwrap();
    assert_eq!(result.status, ExecutionStatus::Failed);
    assert!(result.error.unwrap().contains("no-such-handler"));

    assert_eq!(failing.calls(), 3);
    assert_eq!(orchestrator.admission().active_slots("agent-1").await, 0);
    assert_eq!(orchestrator.active_count().await, 0);

    let usage = orchestrator.admission().get_usage("agent-1").await.unwrap();
    assert_eq!(usage.operations, 4);
    assert_eq!(usage.failures, 4);
}

#[tokio::test]
async fn test_concurrency_ceiling_rejects_extra_request() {
    let sandbox = MockSandbox::new(Behavior::WaitForCancel);
    let mut config = Config::default();
    config.admission.defaults.max_concurrent = 1;
    let orchestrator = orchestrator(&config, &sandbox);

    let running = orchestrator.submit(request("agent-1")).await.unwrap();
    wait_for_status(&orchestrator, running, ExecutionStatus::Executing).await;

    let rejected = orchestrator.execute_handler(request("agent-1")).await.unwrap();
    assert_eq!(rejected.status, ExecutionStatus::Blocked);
    assert!(rejected.error.unwrap().contains("Concurrency limit"));

    assert!(orchestrator.cancel_execution(running, "test over").await);
    assert_eq!(
        orchestrator.get_status(running).await,
        Some(ExecutionStatus::Killed)
    );
    assert_eq!(orchestrator.admission().active_slots("agent-1").await, 0);
    assert!(!orchestrator.cancel_execution(running, "again").await);
}

#[tokio::test]
async fn test_emergency_shutdown_kills_everything() {
    let sandbox = MockSandbox::new(Behavior::WaitForCancel);
    let orchestrator = orchestrator(&Config::default(), &sandbox);

    let mut ids = Vec::new();
    for agent in ["agent-1", "agent-2", "agent-3"] {
        ids.push(orchestrator.submit(request(agent)).await.unwrap());
    }
    for id in &ids {
        wait_for_status(&orchestrator, *id, ExecutionStatus::Executing).await;
    }

    let stopped = orchestrator.emergency_shutdown("incident drill").await;
    assert_eq!(stopped.len(), 3);

    for id in &ids {
        assert_eq!(
            orchestrator.get_status(*id).await,
            Some(ExecutionStatus::Killed)
        );
    }
    assert_eq!(orchestrator.active_count().await, 0);

    let critical = orchestrator
        .killswitch()
        .get_recent_events(100)
        .await
        .into_iter()
        .filter(|e| e.threat_level == ThreatLevel::Critical)
        .count();
    assert_eq!(critical, 1);
    assert!(orchestrator.killswitch().is_global_shutdown().await.unwrap());

    let refused = orchestrator.submit(request("agent-4")).await;
    assert!(matches!(refused, Err(WardenError::ShuttingDown)));
}

#[tokio::test]
async fn test_sandbox_panic_settles_inline_request() {
    let sandbox = MockSandbox::new(Behavior::Panic);
    let orchestrator = orchestrator(&Config::default(), &sandbox);

    let result = orchestrator.execute_handler(request("agent-1")).await.unwrap();

    assert_eq!(result.status, ExecutionStatus::Failed);
    assert!(result.error.unwrap().contains("Internal error"));
    assert_eq!(sandbox.calls(), 1);
    assert_eq!(orchestrator.active_count().await, 0);
    assert_eq!(orchestrator.admission().active_slots("agent-1").await, 0);

    let usage = orchestrator.admission().get_usage("agent-1").await.unwrap();
    assert_eq!(usage.failures, 1);
}

#[tokio::test]
async fn test_dropped_caller_does_not_abandon_request() {
    let sandbox = MockSandbox::new(Behavior::Slow);
    let orchestrator = orchestrator(&Config::default(), &sandbox);
    let request = request("agent-1");
    let id = request.id;

    let waited = tokio::time::timeout(
        Duration::from_millis(5),
        orchestrator.execute_handler(request),
    )
    .await;
    assert!(waited.is_err());

    wait_for_status(&orchestrator, id, ExecutionStatus::Completed).await;
    assert_eq!(orchestrator.active_count().await, 0);
    assert_eq!(orchestrator.admission().active_slots("agent-1").await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_maintenance_reaps_stuck_execution() {
    let sandbox = MockSandbox::new(Behavior::Hang);
    let mut config = Config::default();
    config.orchestrator.stuck_grace_secs = 0;
    let orchestrator = orchestrator(&config, &sandbox);

    let id = orchestrator
        .submit(request("agent-1").with_timeout(Duration::from_secs(1)))
        .await
        .unwrap();
    wait_for_status(&orchestrator, id, ExecutionStatus::Executing).await;

    // Within its timeout nothing is reaped.
    assert!(orchestrator.run_maintenance().await.reaped.is_empty());

    tokio::time::advance(Duration::from_secs(2)).await;
    let report = orchestrator.run_maintenance().await;

    assert_eq!(report.reaped, vec![id]);
    assert_eq!(orchestrator.get_status(id).await, Some(ExecutionStatus::Killed));
    assert_eq!(orchestrator.active_count().await, 0);
    assert_eq!(orchestrator.admission().active_slots("agent-1").await, 0);
    assert!(orchestrator.run_maintenance().await.reaped.is_empty());
}

/// Registered handler that outlives any short timeout.
struct SleepyHandler;

#[async_trait::async_trait]
impl Handler for SleepyHandler {
    fn name(&self) -> &str {
        "sleepy"
    }

    async fn execute(&self, _params: Value, _ctx: &SandboxContext) -> Result<Value, SandboxError> {
        tokio::time::sleep(Duration::from_secs(10)).await;
        Ok(json!({ "status": "ok" }))
    }
}

#[tokio::test]
async fn test_timeout_fails_request_and_releases_slot() {
    let orchestrator = Orchestrator::from_config(&Config::default()).unwrap();
    orchestrator.register_handler(Arc::new(SleepyHandler)).await;

    let request = HandlerRequest::new("agent-1", "sleepy", CLEAN_HANDLER, json!({}))
        .with_timeout(Duration::from_millis(50));
    let result = orchestrator.execute_handler(request).await.unwrap();

    assert_eq!(result.status, ExecutionStatus::Failed);
    assert!(result.error.unwrap().contains("timeout"));
    assert_eq!(result.outcome.unwrap().status, OutcomeStatus::Timeout);
    assert_eq!(orchestrator.admission().active_slots("agent-1").await, 0);
    assert_eq!(orchestrator.active_count().await, 0);

    let usage = orchestrator.admission().get_usage("agent-1").await.unwrap();
    assert_eq!(usage.failures, 1);
}
