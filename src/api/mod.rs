// REST API surface
// Route table, shared state, and the axum server

//! # API Module
//!
//! The HTTP surface over the engine services. Authenticated routes sit
//! behind the JWT middleware; webhook receipt and the liveness probe are
//! public (webhooks authenticate by signature instead). CORS is permissive
//! so the browser builder can talk to any deployment.

pub mod auth;
pub mod handlers;
pub mod types;

use axum::middleware;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::config::PlatformConfig;
use crate::engine::{
    ConnectorRegistry, ExecutionQueue, PlatformStore, UsageMeter, WorkflowRuntime,
};
use crate::webhooks::WebhookIngestion;

use self::auth::require_auth;
use self::handlers::*;

/// Shared state behind every handler.
#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<dyn PlatformStore>,
    pub registry: Arc<ConnectorRegistry>,
    pub queue: Arc<ExecutionQueue>,
    pub runtime: Arc<WorkflowRuntime>,
    pub meter: Arc<UsageMeter>,
    pub ingestion: Arc<WebhookIngestion>,
    pub config: Arc<PlatformConfig>,
}

/// Build the full route table.
pub fn create_router(state: ApiState) -> Router {
    // Public: webhooks authenticate by signature, health by nothing.
    let public = Router::new()
        .route("/api/webhooks/:webhook_id", post(receive_webhook))
        .route("/health/app", get(health_app))
        .with_state(state.clone());

    let authed = Router::new()
        .route("/api/workflows/validate", post(validate_workflow))
        .route("/api/flows/save", post(save_flow))
        .route("/api/executions/dry-run", post(dry_run))
        .route("/api/executions", post(enqueue_execution))
        .route("/api/connectors", get(list_connectors))
        .route("/api/functions/:app_id", get(get_functions))
        .route("/api/connections", get(list_connections))
        .route("/api/webhooks/admin/listeners", get(admin_list_listeners))
        .route(
            "/api/webhooks/admin/listeners/:id/deactivate",
            post(admin_deactivate_listener),
        )
        .route(
            "/api/webhooks/admin/listeners/:id",
            delete(admin_delete_listener),
        )
        .route("/api/webhooks/admin/outbox", get(admin_list_outbox))
        .route(
            "/api/webhooks/admin/outbox/:id/replay",
            post(admin_replay_outbox),
        )
        .route("/api/webhooks/admin/health", get(admin_webhook_health))
        .route("/api/usage/export", get(usage_export))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .with_state(state);

    public
        .merge(authed)
        .fallback(not_found)
        .layer(CorsLayer::permissive())
}

async fn not_found() -> (axum::http::StatusCode, Json<serde_json::Value>) {
    (
        axum::http::StatusCode::NOT_FOUND,
        Json(serde_json::json!({
            "success": false,
            "error": {"code": "NOT_FOUND", "message": "no such route"}
        })),
    )
}

/// The HTTP server wrapper the `server` binary drives.
pub struct ApiServer {
    state: ApiState,
}

impl ApiServer {
    pub fn new(state: ApiState) -> Self {
        ApiServer { state }
    }

    pub fn router(&self) -> Router {
        create_router(self.state.clone())
    }

    /// Bind and serve until the process ends.
    pub async fn run(self) -> crate::Result<()> {
        let addr = format!("{}:{}", self.state.config.host, self.state.config.port);
        let socket: std::net::SocketAddr = addr
            .parse()
            .map_err(|e| crate::SwitchyardError::Internal(format!("bad bind address: {e}")))?;
        tracing::info!(%socket, "api server listening");
        axum::Server::bind(&socket)
            .serve(self.router().into_make_service())
            .await
            .map_err(|e| crate::SwitchyardError::Internal(format!("server error: {e}")))?;
        Ok(())
    }
}
