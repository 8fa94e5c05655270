//! HTTP/WebSocket gateway

use anyhow::{Context, Result};
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use cide_core::WorkspaceId;

use super::socket::{run_session, run_terminal};
use crate::session::WorkspaceHandle;
use crate::state::ControlPlaneState;

/// Query string of `/ws`
#[derive(Debug, Default, Deserialize)]
pub struct WsQuery {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub pod: Option<String>,
    #[serde(rename = "workspaceId")]
    pub workspace_id: Option<String>,
}

impl WsQuery {
    fn is_terminal(&self) -> bool {
        self.kind.as_deref() == Some("terminal")
    }
}

/// Accepts client connections and hands them to sessions or terminals
pub struct Gateway {
    /// Address to bind
    pub address: String,
    state: Arc<ControlPlaneState>,
    shutdown_token: CancellationToken,
}

impl Gateway {
    /// Create a gateway that stops when the state's shutdown token fires
    pub fn new(address: String, state: Arc<ControlPlaneState>) -> Self {
        let shutdown_token = state.shutdown.clone();
        Self {
            address,
            state,
            shutdown_token,
        }
    }

    /// Stop on a different token (call before run)
    pub fn with_shutdown_token(mut self, token: CancellationToken) -> Self {
        self.shutdown_token = token;
        self
    }

    /// Routes served by the gateway
    pub fn router(&self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/healthz", get(health_handler))
            .with_state(Arc::clone(&self.state))
    }

    /// Bind and serve until shutdown
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.address)
            .await
            .with_context(|| format!("Failed to bind gateway to {}", self.address))?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let local_addr = listener.local_addr()?;
        tracing::info!("Gateway listening on {}", local_addr);

        let token = self.shutdown_token.clone();
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                token.cancelled().await;
                tracing::info!("Gateway shutting down");
            })
            .await
            .context("Gateway error")?;
        Ok(())
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<Arc<ControlPlaneState>>,
) -> Response {
    if !query.is_terminal() {
        return ws
            .on_upgrade(move |socket| run_session(socket, state))
            .into_response();
    }

    match authorize_terminal(&state, &query) {
        Ok(workspace) => {
            tracing::info!("Terminal requested for workspace {}", workspace.id);
            ws.on_upgrade(move |socket| run_terminal(socket, state, workspace))
                .into_response()
        }
        Err((status, message)) => {
            tracing::warn!("Rejected terminal connection: {}", message);
            (status, message).into_response()
        }
    }
}

/// Check that a terminal request names a live, ready workspace and its own pod
pub fn authorize_terminal(
    state: &ControlPlaneState,
    query: &WsQuery,
) -> Result<Arc<WorkspaceHandle>, (StatusCode, String)> {
    let (Some(pod), Some(raw_id)) = (query.pod.as_deref(), query.workspace_id.as_deref()) else {
        return Err((
            StatusCode::BAD_REQUEST,
            "pod and workspaceId are required".to_string(),
        ));
    };
    let id = WorkspaceId::parse(raw_id)
        .ok_or_else(|| (StatusCode::BAD_REQUEST, format!("invalid workspaceId '{}'", raw_id)))?;

    let workspace = state
        .registry
        .get(&id)
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("Workspace not found: {}", id)))?;

    if workspace.names.pod != pod {
        return Err((
            StatusCode::FORBIDDEN,
            format!("pod {} does not belong to workspace {}", pod, id),
        ));
    }
    if !workspace.is_ready() {
        return Err((
            StatusCode::CONFLICT,
            format!("Workspace is {}", workspace.state()),
        ));
    }
    Ok(workspace)
}

async fn health_handler(State(state): State<Arc<ControlPlaneState>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "workspaces": state.registry.len(),
    }))
}
