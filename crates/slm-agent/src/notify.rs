//! Localhost notify server for code-source nodes.
//!
//! Git hooks on the canonical code node POST here after each commit; the
//! handler updates `version.json`, buffers a `code_change` event, and fires
//! an out-of-band notification to the controller. Bound to 127.0.0.1 only.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use slm_proto::{AgentHealthResponse, CodeChangeRequest, CodeChangeResponse};
use std::sync::Arc;
use tracing::info;

use crate::daemon::SlmAgent;
use crate::error::{AgentError, AgentResult};

pub fn router(agent: Arc<SlmAgent>) -> Router {
    Router::new()
        .route("/api/code-change", post(code_change))
        .route("/api/health", get(health))
        .with_state(agent)
}

/// Serve the notify API on `127.0.0.1:{port}` until the process exits.
pub async fn serve(agent: Arc<SlmAgent>, port: u16) -> AgentResult<()> {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
        .await
        .map_err(|e| AgentError::Notify(format!("bind 127.0.0.1:{port}: {e}")))?;
    let addr = listener
        .local_addr()
        .map_err(|e| AgentError::Notify(e.to_string()))?;
    info!(%addr, "notify server started");

    axum::serve(listener, router(agent))
        .await
        .map_err(|e| AgentError::Notify(e.to_string()))
}

async fn code_change(
    State(agent): State<Arc<SlmAgent>>,
    Json(req): Json<CodeChangeRequest>,
) -> impl IntoResponse {
    if req.commit.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "commit hash required" })),
        )
            .into_response();
    }

    match agent.handle_code_change(&req) {
        Ok(()) => {
            let short: String = req.commit.chars().take(12).collect();
            Json(CodeChangeResponse {
                status: "ok".to_string(),
                commit: short,
            })
            .into_response()
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

async fn health(State(agent): State<Arc<SlmAgent>>) -> Json<AgentHealthResponse> {
    Json(AgentHealthResponse {
        status: "ok".to_string(),
        node_id: Some(agent.node_id().to_string()),
        version: agent.current_commit(),
    })
}
