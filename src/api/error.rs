use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::error::WardenError;

#[derive(Debug)]
pub enum ApiError {
    Warden(WardenError),
    Conflict(String),
    Internal(anyhow::Error),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Warden(e) => match e {
                WardenError::ExecutionNotFound(_) => StatusCode::NOT_FOUND,
                WardenError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
                WardenError::ConcurrencyLimit { .. } => StatusCode::TOO_MANY_REQUESTS,
                WardenError::UnknownHandler(_) => StatusCode::BAD_REQUEST,
                WardenError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<WardenError> for ApiError {
    fn from(e: WardenError) -> Self {
        ApiError::Warden(e)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::Internal(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            ApiError::Warden(e) => e.to_string(),
            ApiError::Conflict(m) => m.clone(),
            ApiError::Internal(e) => {
                log::error!("Request failed: {:#}", e);
                "internal error".to_string()
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}
