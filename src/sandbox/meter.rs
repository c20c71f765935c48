use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::SandboxError;
use crate::types::{ResourceUsage, SecurityLimits};

/// Accounts resource use of one run against its `SecurityLimits`.
///
/// The first breach is latched and fires `tripped`, so the sandbox can stop
/// the handler even if the handler swallows the returned error.
#[derive(Debug)]
pub struct ResourceMeter {
    limits: SecurityLimits,
    started: Instant,
    memory_bytes: AtomicU64,
    peak_memory_bytes: AtomicU64,
    cpu_micros: AtomicU64,
    network_calls: AtomicU32,
    breach: Mutex<Option<SandboxError>>,
    tripped: CancellationToken,
}

impl ResourceMeter {
    pub fn new(limits: SecurityLimits) -> Self {
        Self {
            limits,
            started: Instant::now(),
            memory_bytes: AtomicU64::new(0),
            peak_memory_bytes: AtomicU64::new(0),
            cpu_micros: AtomicU64::new(0),
            network_calls: AtomicU32::new(0),
            breach: Mutex::new(None),
            tripped: CancellationToken::new(),
        }
    }

    pub fn limits(&self) -> &SecurityLimits {
        &self.limits
    }

    fn trip(&self, limit: &str, detail: String) -> SandboxError {
        let error = SandboxError::LimitExceeded {
            limit: limit.to_string(),
            detail,
        };
        if let Ok(mut breach) = self.breach.lock() {
            if breach.is_none() {
                *breach = Some(error.clone());
            }
        }
        self.tripped.cancel();
        error
    }

    pub fn breach(&self) -> Option<SandboxError> {
        self.breach.lock().ok().and_then(|b| b.clone())
    }

    pub fn tripped(&self) -> CancellationToken {
        self.tripped.clone()
    }

    pub fn reserve_memory(&self, bytes: u64) -> Result<(), SandboxError> {
        let current = add_saturating(&self.memory_bytes, bytes);
        self.peak_memory_bytes.fetch_max(current, Ordering::SeqCst);
        let max = self.limits.max_memory_bytes();
        if current > max {
            return Err(self.trip(
                "max_memory_mb",
                format!(
                    "{:.1} MB in use, limit {} MB",
                    current as f64 / (1024.0 * 1024.0),
                    self.limits.max_memory_mb
                ),
            ));
        }
        Ok(())
    }

    pub fn release_memory(&self, bytes: u64) {
        let _ = self
            .memory_bytes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                Some(current.saturating_sub(bytes))
            });
    }

    pub fn charge_cpu(&self, time: Duration) -> Result<(), SandboxError> {
        let micros = u64::try_from(time.as_micros()).unwrap_or(u64::MAX);
        let total = add_saturating(&self.cpu_micros, micros);
        let budget = self.limits.cpu_budget();
        if Duration::from_micros(total) > budget {
            return Err(self.trip(
                "max_cpu_percent",
                format!(
                    "{} ms of CPU used, budget {} ms ({}% of {} ms)",
                    total / 1000,
                    budget.as_millis(),
                    self.limits.max_cpu_percent,
                    self.limits.max_execution_ms
                ),
            ));
        }
        Ok(())
    }

    pub fn record_network_call(&self, target: &str) -> Result<(), SandboxError> {
        let calls = self.network_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if calls > self.limits.max_network_calls {
            return Err(self.trip(
                "max_network_calls",
                format!(
                    "call {} to {} exceeds limit {}",
                    calls, target, self.limits.max_network_calls
                ),
            ));
        }
        Ok(())
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn usage(&self) -> ResourceUsage {
        ResourceUsage {
            peak_memory_mb: self.peak_memory_bytes.load(Ordering::SeqCst) as f64
                / (1024.0 * 1024.0),
            cpu_time_ms: self.cpu_micros.load(Ordering::SeqCst) / 1000,
            wall_time_ms: self.elapsed().as_millis() as u64,
            network_calls: self.network_calls.load(Ordering::SeqCst),
        }
    }
}

/// Capability handle passed to a running handler.
#[derive(Debug, Clone)]
pub struct SandboxContext {
    pub handler_name: String,
    meter: std::sync::Arc<ResourceMeter>,
    cancel: CancellationToken,
}

impl SandboxContext {
    pub fn new(
        handler_name: impl Into<String>,
        meter: std::sync::Arc<ResourceMeter>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            handler_name: handler_name.into(),
            meter,
            cancel,
        }
    }

    pub fn reserve_memory(&self, bytes: u64) -> Result<(), SandboxError> {
        self.meter.reserve_memory(bytes)
    }

    pub fn release_memory(&self, bytes: u64) {
        self.meter.release_memory(bytes)
    }

    pub fn charge_cpu(&self, time: Duration) -> Result<(), SandboxError> {
        self.meter.charge_cpu(time)
    }

    /// Must be called before every outbound network request.
    pub fn network_call(&self, target: &str) -> Result<(), SandboxError> {
        self.meter.record_network_call(target)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.meter.tripped().is_cancelled()
    }

    pub fn limits(&self) -> &SecurityLimits {
        self.meter.limits()
    }
}

/// Adds `amount` and returns the new value, pinned at `u64::MAX`.
fn add_saturating(counter: &AtomicU64, amount: u64) -> u64 {
    let previous = counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
            Some(current.saturating_add(amount))
        })
        .unwrap_or_else(|current| current);
    previous.saturating_add(amount)
}
