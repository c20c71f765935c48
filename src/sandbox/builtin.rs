//! Handlers shipped with the control plane.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::{Duration, Instant};

use super::{Handler, SandboxContext, SandboxError};

/// Returns its input unchanged.
pub struct EchoHandler;

#[async_trait]
impl Handler for EchoHandler {
    fn name(&self) -> &str {
        "echo"
    }

    async fn execute(&self, params: Value, _ctx: &SandboxContext) -> Result<Value, SandboxError> {
        Ok(json!({ "status": "ok", "echo": params }))
    }
}

/// Aggregates a numeric `items` array with `operation` (sum, mean, min, max).
pub struct TransformHandler;

#[async_trait]
impl Handler for TransformHandler {
    fn name(&self) -> &str {
        "transform"
    }

    async fn execute(&self, params: Value, ctx: &SandboxContext) -> Result<Value, SandboxError> {
        let items: Vec<f64> = params["items"]
            .as_array()
            .ok_or_else(|| SandboxError::handler("Missing items parameter"))?
            .iter()
            .map(|v| {
                v.as_f64()
                    .ok_or_else(|| SandboxError::handler("items must be numbers"))
            })
            .collect::<Result<_, _>>()?;
        let operation = params["operation"].as_str().unwrap_or("sum");

        let bytes = (items.len() * std::mem::size_of::<f64>()) as u64;
        ctx.reserve_memory(bytes)?;
        let started = Instant::now();

        let value = match operation {
            "sum" => items.iter().sum::<f64>(),
            "mean" if !items.is_empty() => items.iter().sum::<f64>() / items.len() as f64,
            "min" => items.iter().cloned().fold(f64::INFINITY, f64::min),
            "max" => items.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
            "mean" => 0.0,
            other => {
                ctx.release_memory(bytes);
                return Err(SandboxError::handler(format!("Unsupported operation: {}", other)));
            }
        };

        ctx.charge_cpu(started.elapsed().max(Duration::from_micros(1)))?;
        ctx.release_memory(bytes);

        Ok(json!({
            "status": "ok",
            "operation": operation,
            "count": items.len(),
            "value": value,
        }))
    }
}
