use anyhow::{Context, Result};
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::api::handlers;
use crate::orchestrator::Orchestrator;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/status", get(handlers::system_status))
        .route("/executions", post(handlers::create_execution))
        .route(
            "/executions/:id",
            get(handlers::get_execution).delete(handlers::cancel_execution),
        )
        .route("/validate", post(handlers::validate_code))
        .route("/emergency-shutdown", post(handlers::emergency_shutdown))
        .layer(CorsLayer::permissive())
        .with_state(state.orchestrator)
}

pub async fn serve(state: AppState, host: &str, port: u16) -> Result<()> {
    let app = create_router(state);
    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    log::info!("Warden API listening on {}", addr);

    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use crate::config::Config;

    const EVAL_HANDLER: &str = r#"
class Handler:
    async def execute(self, params: dict) -> dict:
        try:
            return {"status": "ok", "value": eval(params["expr"])}
        except Exception as exc:
            return {"status": "error", "message": str(exc)}
"#;

    const ECHO_HANDLER: &str = r#"
class Handler:
    async def execute(self, params: dict) -> dict:
        try:
            return {"status": "ok", "echo": params}
        except Exception as exc:
            return {"status": "error", "message": str(exc)}
"#;

    fn create_test_app() -> (Router, Arc<Orchestrator>) {
        let orchestrator = Orchestrator::from_config(&Config::default()).unwrap();
        let state = AppState {
            orchestrator: Arc::clone(&orchestrator),
        };
        (create_router(state), orchestrator)
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let body = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let (app, _) = create_test_app();

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "healthy");
    }

    #[tokio::test]
    async fn test_validate_endpoint() {
        let (app, _) = create_test_app();

        let response = app
            .oneshot(post_json(
                "/validate",
                serde_json::json!({ "source_code": EVAL_HANDLER, "strictness": "strict" }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["verdict"], "failed");
        assert_eq!(json["handler_name"], "handler");
        assert_eq!(json["issues"][0]["code"], "dynamic-eval");
    }

    #[tokio::test]
    async fn test_execute_and_fetch() {
        let (app, _) = create_test_app();

        let response = app
            .clone()
            .oneshot(post_json(
                "/executions",
                serde_json::json!({
                    "agent_id": "agent-1",
                    "handler_name": "echo",
                    "source_code": ECHO_HANDLER,
                    "params": { "x": 1 },
                    "wait": true,
                }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "completed");
        assert_eq!(json["outcome"]["output"]["echo"]["x"], 1);

        let id = json["request_id"].as_str().unwrap().to_string();
        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/executions/{}", id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["agent_id"], "agent-1");
    }

    #[tokio::test]
    async fn test_unknown_execution_is_not_found() {
        let (app, _) = create_test_app();

        let response = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/executions/00000000-0000-0000-0000-000000000000")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_submissions_refused_after_shutdown() {
        let (app, orchestrator) = create_test_app();

        let response = app
            .clone()
            .oneshot(post_json(
                "/emergency-shutdown",
                serde_json::json!({ "reason": "incident" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(orchestrator.is_shutting_down());

        let response = app
            .oneshot(post_json(
                "/executions",
                serde_json::json!({
                    "agent_id": "agent-1",
                    "handler_name": "echo",
                    "source_code": ECHO_HANDLER,
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
