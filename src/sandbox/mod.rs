pub mod builtin;
pub mod in_process;
pub mod meter;

pub use in_process::InProcessSandbox;
pub use meter::{ResourceMeter, SandboxContext};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::types::{ExecutionOutcome, SecurityLimits};

/// Errors a handler can surface from inside the sandbox.
#[derive(Debug, Clone, Error)]
pub enum SandboxError {
    /// A `SecurityLimits` dimension was exceeded.
    #[error("{limit} exceeded: {detail}")]
    LimitExceeded { limit: String, detail: String },

    #[error("forbidden action: {0}")]
    Forbidden(String),

    #[error("{0}")]
    Handler(String),
}

impl SandboxError {
    pub fn handler(message: impl Into<String>) -> Self {
        SandboxError::Handler(message.into())
    }

    pub fn is_security_violation(&self) -> bool {
        matches!(
            self,
            SandboxError::LimitExceeded { .. } | SandboxError::Forbidden(_)
        )
    }
}

/// A pre-registered handler entry point.
#[async_trait]
pub trait Handler: Send + Sync {
    fn name(&self) -> &str;

    /// Runs the handler. Resource use must be declared through `ctx`.
    async fn execute(&self, params: Value, ctx: &SandboxContext) -> Result<Value, SandboxError>;
}

/// Runs handlers under enforced resource ceilings.
#[async_trait]
pub trait SandboxExecutor: Send + Sync {
    /// Always returns resource usage, whatever the outcome. An `Err` means
    /// the sandbox itself failed, not the handler.
    async fn run(
        &self,
        handler: Arc<dyn Handler>,
        name: &str,
        params: Value,
        limits: &SecurityLimits,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<ExecutionOutcome>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSettings {
    /// Limits applied when a request carries no override.
    pub default_limits: SecurityLimits,
    /// Hard ceiling on any single run, regardless of request timeout.
    pub max_execution_ms: u64,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            default_limits: SecurityLimits::default(),
            max_execution_ms: 300_000,
        }
    }
}

/// Name-keyed table of handler entry points. The orchestrator only ever
/// executes handlers found here.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in handlers.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(builtin::EchoHandler));
        registry.register(Arc::new(builtin::TransformHandler));
        registry
    }

    pub fn register(&mut self, handler: Arc<dyn Handler>) {
        self.handlers.insert(handler.name().to_string(), handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}
