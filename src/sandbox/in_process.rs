use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;

use super::{Handler, ResourceMeter, SandboxContext, SandboxError, SandboxExecutor, SandboxSettings};
use crate::types::{ExecutionOutcome, OutcomeStatus, ResourceUsage, SecurityLimits};

/// Which ceiling bounds the wall-clock time of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WallClockBound {
    RequestTimeout,
    SandboxMaximum,
    SecurityLimit,
}

enum Finish {
    Joined(Result<Result<Value, SandboxError>, JoinError>),
    Deadline,
    Tripped,
    Cancelled,
}

/// Runs handlers as tokio tasks in the control-plane process.
///
/// Isolation is cooperative: handlers declare memory, CPU and network use
/// through their `SandboxContext`, and the wall clock is enforced by the
/// sandbox. A run that breaches a limit is aborted at its next await point.
pub struct InProcessSandbox {
    settings: SandboxSettings,
}

impl InProcessSandbox {
    pub fn new(settings: SandboxSettings) -> Self {
        Self { settings }
    }

    fn wall_clock_bound(
        &self,
        limits: &SecurityLimits,
        timeout: Duration,
    ) -> (Duration, WallClockBound) {
        let candidates = [
            (timeout, WallClockBound::RequestTimeout),
            (
                Duration::from_millis(self.settings.max_execution_ms),
                WallClockBound::SandboxMaximum,
            ),
            (limits.max_execution_time(), WallClockBound::SecurityLimit),
        ];
        candidates
            .into_iter()
            .min_by_key(|(duration, _)| *duration)
            .unwrap_or((timeout, WallClockBound::RequestTimeout))
    }

    fn violation(name: &str, error: &SandboxError, usage: ResourceUsage) -> ExecutionOutcome {
        log::warn!("Handler '{}' security violation: {}", name, error);
        ExecutionOutcome::failed(
            OutcomeStatus::SecurityViolation,
            format!("Security violation: {}", error),
            usage,
        )
    }

    fn deadline_outcome(
        name: &str,
        bound: WallClockBound,
        deadline: Duration,
        usage: ResourceUsage,
    ) -> ExecutionOutcome {
        match bound {
            WallClockBound::SecurityLimit => Self::violation(
                name,
                &SandboxError::LimitExceeded {
                    limit: "max_execution_ms".to_string(),
                    detail: format!("ran longer than {} ms", deadline.as_millis()),
                },
                usage,
            ),
            WallClockBound::RequestTimeout => ExecutionOutcome::failed(
                OutcomeStatus::Timeout,
                format!("Execution exceeded its timeout of {} ms", deadline.as_millis()),
                usage,
            ),
            WallClockBound::SandboxMaximum => ExecutionOutcome::failed(
                OutcomeStatus::Timeout,
                format!(
                    "Execution exceeded the sandbox maximum of {} ms",
                    deadline.as_millis()
                ),
                usage,
            ),
        }
    }

    fn completed_outcome(name: &str, value: Value, meter: &ResourceMeter) -> ExecutionOutcome {
        if let Some(breach) = meter.breach() {
            return Self::violation(name, &breach, meter.usage());
        }
        if !value.is_object() {
            return ExecutionOutcome::failed(
                OutcomeStatus::Failure,
                "Handler returned a non-object payload",
                meter.usage(),
            );
        }

        let has_status = value.get("status").is_some();
        let mut outcome = ExecutionOutcome::success(value, meter.usage());
        if !has_status {
            outcome
                .warnings
                .push("Handler result has no 'status' field".to_string());
        }
        outcome
    }
}

impl Default for InProcessSandbox {
    fn default() -> Self {
        Self::new(SandboxSettings::default())
    }
}

#[async_trait]
impl SandboxExecutor for InProcessSandbox {
    async fn run(
        &self,
        handler: Arc<dyn Handler>,
        name: &str,
        params: Value,
        limits: &SecurityLimits,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<ExecutionOutcome> {
        let meter = Arc::new(ResourceMeter::new(limits.clone()));
        let ctx = SandboxContext::new(name, Arc::clone(&meter), cancel.clone());
        let (deadline, bound) = self.wall_clock_bound(limits, timeout);
        let tripped = meter.tripped();

        let mut task = tokio::spawn(async move { handler.execute(params, &ctx).await });

        let finish = tokio::select! {
            joined = &mut task => Finish::Joined(joined),
            _ = tokio::time::sleep(deadline) => Finish::Deadline,
            _ = tripped.cancelled() => Finish::Tripped,
            _ = cancel.cancelled() => Finish::Cancelled,
        };
        if !matches!(finish, Finish::Joined(_)) {
            // Best effort: the task stops at its next await point.
            task.abort();
        }

        let outcome = match finish {
            Finish::Joined(Ok(Ok(value))) => Self::completed_outcome(name, value, &meter),
            Finish::Joined(Ok(Err(error))) => match meter.breach() {
                Some(breach) => Self::violation(name, &breach, meter.usage()),
                None if error.is_security_violation() => {
                    Self::violation(name, &error, meter.usage())
                }
                None => ExecutionOutcome::failed(
                    OutcomeStatus::Failure,
                    format!("Handler failed: {}", error),
                    meter.usage(),
                ),
            },
            Finish::Joined(Err(join_error)) => {
                let detail = if join_error.is_panic() {
                    "handler panicked"
                } else {
                    "handler task was aborted"
                };
                log::error!("Handler '{}' did not complete: {}", name, join_error);
                ExecutionOutcome::failed(OutcomeStatus::Failure, detail, meter.usage())
            }
            Finish::Tripped => match meter.breach() {
                Some(breach) => Self::violation(name, &breach, meter.usage()),
                None => ExecutionOutcome::failed(
                    OutcomeStatus::SecurityViolation,
                    "Security violation: resource limit exceeded",
                    meter.usage(),
                ),
            },
            Finish::Deadline => Self::deadline_outcome(name, bound, deadline, meter.usage()),
            Finish::Cancelled => ExecutionOutcome::failed(
                OutcomeStatus::Failure,
                "Execution cancelled",
                meter.usage(),
            ),
        };

        Ok(outcome)
    }
}
