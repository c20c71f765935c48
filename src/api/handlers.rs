use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::api::error::ApiError;
use crate::error::WardenError;
use crate::orchestrator::{Orchestrator, SystemStatus};
use crate::types::{
    ExecutionResult, HandlerRequest, Priority, RequestId, SecurityLimits, Strictness,
    ValidationReport,
};

#[derive(Deserialize)]
pub struct ExecutionRequest {
    pub agent_id: String,
    pub handler_name: String,
    pub source_code: String,
    #[serde(default)]
    pub params: Value,
    pub strictness: Option<Strictness>,
    pub timeout_ms: Option<u64>,
    pub limits: Option<SecurityLimits>,
    pub priority: Option<Priority>,
    /// Run inline and respond with the final result.
    #[serde(default)]
    pub wait: bool,
}

#[derive(Serialize)]
pub struct SubmittedResponse {
    pub request_id: RequestId,
    pub status: &'static str,
}

#[derive(Deserialize)]
pub struct ValidateRequest {
    pub source_code: String,
    #[serde(default = "default_handler_name")]
    pub name: String,
    pub strictness: Option<Strictness>,
}

fn default_handler_name() -> String {
    "handler".to_string()
}

#[derive(Deserialize)]
pub struct ShutdownRequest {
    pub reason: String,
}

#[derive(Serialize)]
pub struct ShutdownResponse {
    pub stopped: Vec<RequestId>,
}

pub async fn health_check(State(orchestrator): State<Arc<Orchestrator>>) -> Json<Value> {
    let status = if orchestrator.is_shutting_down() {
        "shutdown"
    } else {
        "healthy"
    };
    Json(serde_json::json!({
        "status": status,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub async fn create_execution(
    State(orchestrator): State<Arc<Orchestrator>>,
    Json(body): Json<ExecutionRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let strictness = body
        .strictness
        .unwrap_or(orchestrator.validator().settings().default_strictness);
    let mut request = HandlerRequest::new(
        body.agent_id,
        body.handler_name,
        body.source_code,
        body.params,
    )
    .with_strictness(strictness)
    .with_priority(body.priority.unwrap_or_default());
    if let Some(ms) = body.timeout_ms {
        request = request.with_timeout(Duration::from_millis(ms));
    }
    if let Some(limits) = body.limits {
        request = request.with_limits(limits);
    }

    if body.wait {
        let result = orchestrator.execute_handler(request).await?;
        let json = serde_json::to_value(result).map_err(anyhow::Error::from)?;
        return Ok((StatusCode::OK, Json(json)));
    }

    let request_id = orchestrator.submit(request).await?;
    let json = serde_json::to_value(SubmittedResponse {
        request_id,
        status: "pending",
    })
    .map_err(anyhow::Error::from)?;
    Ok((StatusCode::ACCEPTED, Json(json)))
}

pub async fn get_execution(
    State(orchestrator): State<Arc<Orchestrator>>,
    Path(id): Path<RequestId>,
) -> Result<Json<ExecutionResult>, ApiError> {
    orchestrator
        .get_result(id)
        .await
        .map(Json)
        .ok_or_else(|| WardenError::ExecutionNotFound(id).into())
}

pub async fn cancel_execution(
    State(orchestrator): State<Arc<Orchestrator>>,
    Path(id): Path<RequestId>,
) -> Result<Json<ExecutionResult>, ApiError> {
    if !orchestrator.cancel_execution(id, "Cancelled via API").await {
        return match orchestrator.get_result(id).await {
            Some(result) => Err(ApiError::Conflict(format!(
                "execution {} already finished with status {:?}",
                id, result.status
            ))),
            None => Err(WardenError::ExecutionNotFound(id).into()),
        };
    }
    orchestrator
        .get_result(id)
        .await
        .map(Json)
        .ok_or_else(|| WardenError::ExecutionNotFound(id).into())
}

pub async fn validate_code(
    State(orchestrator): State<Arc<Orchestrator>>,
    Json(body): Json<ValidateRequest>,
) -> Result<Json<ValidationReport>, ApiError> {
    let validator = orchestrator.validator();
    let strictness = body
        .strictness
        .unwrap_or(validator.settings().default_strictness);
    let report = validator
        .validate(&body.source_code, &body.name, strictness)
        .await?;
    Ok(Json(report))
}

pub async fn emergency_shutdown(
    State(orchestrator): State<Arc<Orchestrator>>,
    Json(body): Json<ShutdownRequest>,
) -> Json<ShutdownResponse> {
    let stopped = orchestrator.emergency_shutdown(&body.reason).await;
    Json(ShutdownResponse { stopped })
}

pub async fn system_status(
    State(orchestrator): State<Arc<Orchestrator>>,
) -> Result<Json<SystemStatus>, ApiError> {
    Ok(Json(orchestrator.get_system_status().await?))
}
