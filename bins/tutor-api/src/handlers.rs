// HTTP route handlers for the tutor API

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};
use tutor_common::types::ExecutionRequest;
use tutor_engine::ExecutionError;

use crate::metrics::{self, InFlightGuard};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct ExecuteBody {
    pub source: String,
    #[serde(default)]
    pub stdin: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub session_id: Option<String>,
}

impl ExecuteBody {
    fn into_request(self, session_id: Option<String>) -> ExecutionRequest {
        let mut request = ExecutionRequest::new(self.source);
        if let Some(session_id) = session_id.or(self.session_id) {
            request = request.with_session(session_id);
        }
        if let Some(stdin) = self.stdin {
            request = request.with_stdin(stdin);
        }
        if let Some(timeout_ms) = self.timeout_ms {
            request = request.with_timeout_ms(timeout_ms);
        }
        request
    }
}

/// POST /execute - Run code, optionally tied to a session from the body
pub async fn execute(State(state): State<Arc<AppState>>, Json(body): Json<ExecuteBody>) -> Response {
    run(&state, body.into_request(None)).await
}

/// POST /sessions/:session_id/execute - Run code, superseding the session's previous run
pub async fn execute_in_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(body): Json<ExecuteBody>,
) -> Response {
    run(&state, body.into_request(Some(session_id))).await
}

async fn run(state: &AppState, request: ExecutionRequest) -> Response {
    let _in_flight = InFlightGuard::new();
    let start = Instant::now();
    let session_id = request.session_id().map(str::to_string);

    match state.coordinator.execute(request).await {
        Ok(result) => {
            let outcome = result.outcome().kind();
            metrics::record_execution(outcome.as_str(), start.elapsed());
            info!(
                execution_id = %result.execution_id(),
                session_id = session_id.as_deref().unwrap_or("-"),
                %outcome,
                elapsed_ms = result.meta().elapsed_ms,
                "Execution result returned"
            );
            (StatusCode::OK, Json(result)).into_response()
        }
        Err(err) => {
            let label = match &err {
                ExecutionError::Cancelled => metrics::CANCELLED,
                ExecutionError::Infrastructure(_) => metrics::INFRASTRUCTURE_ERROR,
            };
            metrics::record_execution(label, start.elapsed());
            error_response(&err, session_id.as_deref())
        }
    }
}

/// Superseded runs answer 409 so the client drops them; broken hosts answer 503.
fn error_response(err: &ExecutionError, session_id: Option<&str>) -> Response {
    match err {
        ExecutionError::Cancelled => {
            info!(session_id = session_id.unwrap_or("-"), "Execution cancelled before producing a result");
            (
                StatusCode::CONFLICT,
                Json(serde_json::json!({
                    "status": "cancelled",
                    "session_id": session_id,
                })),
            )
                .into_response()
        }
        ExecutionError::Infrastructure(e) => {
            error!(session_id = session_id.unwrap_or("-"), error = %e, "Execution engine unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({
                    "error": format!("Execution engine unavailable: {}", e)
                })),
            )
                .into_response()
        }
    }
}

/// DELETE /sessions/:session_id/execution - Cancel the session's in-flight run
pub async fn cancel_session(State(state): State<Arc<AppState>>, Path(session_id): Path<String>) -> impl IntoResponse {
    let cancelled = state.coordinator.cancel_session(&session_id).await;
    info!(session_id = %session_id, cancelled, "Session cancel requested");
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "session_id": session_id,
            "cancelled": cancelled,
        })),
    )
}

/// GET /status - Health check endpoint
pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let toolchain = state.coordinator.toolchain();
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "ok",
            "toolchain": toolchain.name,
            "toolchain_version": toolchain.version,
            "workers": state.coordinator.limits().workers,
            "active_sessions": state.coordinator.in_flight_sessions(),
        })),
    )
}

/// GET /metrics - Prometheus scrape endpoint
pub async fn metrics() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        metrics::render(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tutor_engine::InfrastructureError;

    #[test]
    fn test_path_session_wins_over_body() {
        let body: ExecuteBody = serde_json::from_value(serde_json::json!({
            "source": "print(1)",
            "session_id": "from-body",
            "timeout_ms": 2000
        }))
        .unwrap();

        let request = body.into_request(Some("from-path".to_string()));
        assert_eq!(request.session_id(), Some("from-path"));
        assert_eq!(request.timeout_ms(), Some(2000));
        assert_eq!(request.stdin(), None);
    }

    #[test]
    fn test_error_statuses() {
        let cancelled = error_response(&ExecutionError::Cancelled, Some("s1"));
        assert_eq!(cancelled.status(), StatusCode::CONFLICT);

        let missing = ExecutionError::from(InfrastructureError::ToolchainMissing {
            program: "kotlinc".to_string(),
        });
        assert_eq!(error_response(&missing, None).status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
