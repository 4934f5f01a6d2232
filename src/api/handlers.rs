// REST handlers for the platform API

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::{Extension, Json};
use bytes::Bytes;
use chrono::{Datelike, Utc};
use serde_json::json;
use uuid::Uuid;

use crate::engine::meter::{ExportFormat, UsageExportRequest};
use crate::engine::registry::ConnectorFilter;
use crate::engine::storage::{
    AuditStore, ConnectionStore, ExecutionStore, OrganizationStore, OutboxStore, TriggerStore,
    WorkflowStore,
};
use crate::models::{
    AuditAction, AuditEntry, ConnectionSummary, Durability, ExecutionRecord, PlanTier,
    QueueRunRequest, TriggerData, TriggerRegistration, TriggerType, Workflow,
};
use crate::webhooks::signature::RequestHeaders;
use crate::webhooks::{IngestError, IngestOutcome};
use crate::SwitchyardError;

use super::auth::AuthContext;
use super::types::*;
use super::ApiState;

// ---------------------------------------------------------------------
// Workflows
// ---------------------------------------------------------------------

/// `POST /api/workflows/validate`
pub async fn validate_workflow(
    State(_state): State<ApiState>,
    Json(request): Json<ValidateRequest>,
) -> Json<ValidateResponse> {
    let errors = request.graph.validate();
    let valid = errors.is_empty();
    Json(ValidateResponse {
        success: true,
        validation: ValidationBody {
            message: (!valid).then(|| format!("{} validation error(s)", errors.len())),
            valid,
            errors,
        },
    })
}

/// `POST /api/flows/save`
pub async fn save_flow(
    State(state): State<ApiState>,
    Extension(ctx): Extension<AuthContext>,
    Json(request): Json<SaveFlowRequest>,
) -> Result<Json<SaveFlowResponse>, ApiError> {
    let errors = request.graph.validate();
    if !errors.is_empty() {
        let first = errors[0].message.clone();
        return Err(ApiError::from(SwitchyardError::InvalidGraph(first)));
    }

    let now = Utc::now();
    let id = request.id.unwrap_or_else(|| Uuid::new_v4().to_string());
    let existing = state.store.get_workflow(&id).await.map_err(ApiError::from)?;
    if let Some(existing) = &existing {
        if existing.organization_id != ctx.organization_id {
            return Err(ApiError::from(SwitchyardError::Forbidden(
                "workflow belongs to another organization".into(),
            )));
        }
    }

    let workflow = Workflow {
        id: id.clone(),
        name: request.name,
        organization_id: ctx.organization_id.clone(),
        user_id: ctx.user_id.clone(),
        graph: request.graph,
        stop_on_error: request
            .metadata
            .as_ref()
            .and_then(|m| m.get("stop_on_error"))
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false),
        deadline_seconds: request
            .metadata
            .as_ref()
            .and_then(|m| m.get("deadline_seconds"))
            .and_then(serde_json::Value::as_u64),
        created_at: existing.map(|e| e.created_at).unwrap_or(now),
        updated_at: now,
    };
    state
        .store
        .put_workflow(workflow)
        .await
        .map_err(ApiError::from)?;

    Ok(Json(SaveFlowResponse {
        success: true,
        workflow_id: id,
    }))
}

// ---------------------------------------------------------------------
// Executions
// ---------------------------------------------------------------------

/// `POST /api/executions/dry-run`
pub async fn dry_run(
    State(state): State<ApiState>,
    Extension(ctx): Extension<AuthContext>,
    Json(request): Json<DryRunRequest>,
) -> Result<Json<DryRunResponse>, ApiError> {
    let organization = state
        .store
        .get_organization(&ctx.organization_id)
        .await
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::from(SwitchyardError::OrganizationRequired))?;

    let workflow = Workflow {
        id: request
            .workflow_id
            .unwrap_or_else(|| format!("dry-run-{}", Uuid::new_v4())),
        name: "dry-run".into(),
        organization_id: ctx.organization_id.clone(),
        user_id: ctx.user_id.clone(),
        graph: request.graph,
        stop_on_error: false,
        deadline_seconds: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };

    let run_request = QueueRunRequest {
        workflow_id: workflow.id.clone(),
        organization_id: ctx.organization_id.clone(),
        user_id: Some(ctx.user_id.clone()),
        trigger_type: TriggerType::Manual,
        trigger_data: None,
    };
    let mut record = ExecutionRecord::queued(&run_request, Durability::InMemory);
    state
        .store
        .create_execution(record.clone())
        .await
        .map_err(ApiError::from)?;

    let status = state
        .runtime
        .execute(&workflow, &organization, None, &mut record, true)
        .await
        .map_err(ApiError::from)?;

    Ok(Json(DryRunResponse {
        success: true,
        status: format!("{status:?}").to_lowercase(),
        order: record.node_order,
        nodes: record.nodes,
    }))
}

/// `POST /api/executions`
pub async fn enqueue_execution(
    State(state): State<ApiState>,
    Extension(ctx): Extension<AuthContext>,
    Json(request): Json<EnqueueRequest>,
) -> Result<Json<EnqueueResponse>, ApiError> {
    let trigger_data = request.initial_data.map(|payload| TriggerData {
        app_id: None,
        trigger_id: None,
        payload,
        headers: None,
        dedupe_token: None,
        timestamp: Utc::now(),
        source: "api".into(),
    });

    let run_request = QueueRunRequest {
        workflow_id: request.workflow_id,
        organization_id: ctx.organization_id.clone(),
        user_id: Some(ctx.user_id.clone()),
        trigger_type: request.trigger_type,
        trigger_data,
    };
    let execution_id = state
        .queue
        .enqueue(run_request)
        .await
        .map_err(ApiError::from)?;

    Ok(Json(EnqueueResponse {
        execution_id: execution_id.to_string(),
    }))
}

// ---------------------------------------------------------------------
// Webhook receipt (public)
// ---------------------------------------------------------------------

/// `POST /api/webhooks/:webhook_id`
pub async fn receive_webhook(
    State(state): State<ApiState>,
    Path(webhook_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let request_headers = RequestHeaders::from_pairs(
        headers
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str(), v))),
    );
    let host = headers
        .get("host")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let path = format!("/api/webhooks/{webhook_id}");

    match state
        .ingestion
        .ingest(&webhook_id, request_headers, &body, &host, &path)
        .await
    {
        Ok(IngestOutcome::Accepted { dedupe_token }) => (
            StatusCode::OK,
            Json(json!({"success": true, "status": "accepted", "dedupeToken": dedupe_token})),
        ),
        Ok(IngestOutcome::Duplicate { dedupe_token }) => (
            StatusCode::OK,
            Json(json!({"success": true, "status": "duplicate", "dedupeToken": dedupe_token})),
        ),
        Ok(IngestOutcome::Filtered) => (
            StatusCode::OK,
            Json(json!({"success": true, "status": "filtered"})),
        ),
        Err(IngestError::NotFound) => (
            StatusCode::NOT_FOUND,
            Json(json!({"success": false, "error": {"code": "NOT_FOUND"}})),
        ),
        Err(IngestError::Inactive) => (
            StatusCode::GONE,
            Json(json!({"success": false, "error": {"code": "INACTIVE"}})),
        ),
        Err(IngestError::Verification(reason)) => (
            StatusCode::UNAUTHORIZED,
            Json(json!({"success": false, "error": {"code": reason.code()}})),
        ),
        Err(IngestError::BadPayload) => (
            StatusCode::BAD_REQUEST,
            Json(json!({"success": false, "error": {"code": "INVALID_INPUT"}})),
        ),
        Err(IngestError::Storage(e)) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"success": false, "error": {"code": e.code()}})),
        ),
    }
}

// ---------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------

/// `GET /api/connectors?organization_id=...`
pub async fn list_connectors(
    State(state): State<ApiState>,
    Extension(ctx): Extension<AuthContext>,
    Query(query): Query<ConnectorsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let org_id = query
        .organization_id
        .unwrap_or_else(|| ctx.organization_id.clone());
    if org_id != ctx.organization_id && !ctx.role.is_admin() {
        return Err(ApiError::from(SwitchyardError::Forbidden(
            "cannot list connectors for another organization".into(),
        )));
    }
    let organization = state
        .store
        .get_organization(&org_id)
        .await
        .map_err(ApiError::from)?;

    let listings = state.registry.list_connectors(ConnectorFilter {
        organization: organization.as_ref(),
        include_hidden: false,
        include_disabled: false,
    });
    Ok(Json(json!({"success": true, "connectors": listings})))
}

/// `GET /api/functions/:app_id`
pub async fn get_functions(
    State(state): State<ApiState>,
    Path(app_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let definition = state
        .registry
        .definition(&app_id)
        .ok_or_else(|| ApiError::from(SwitchyardError::MissingApp(app_id.clone())))?;
    Ok(Json(json!({
        "success": true,
        "connector": app_id,
        "actions": definition.actions,
        "triggers": definition.triggers,
    })))
}

/// `GET /api/connections`
pub async fn list_connections(
    State(state): State<ApiState>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let connections = state
        .store
        .list_connections(&ctx.organization_id, &ctx.user_id)
        .await
        .map_err(ApiError::from)?;
    let summaries: Vec<ConnectionSummary> =
        connections.iter().map(ConnectionSummary::from).collect();
    Ok(Json(json!({"success": true, "connections": summaries})))
}

// ---------------------------------------------------------------------
// Webhook admin
// ---------------------------------------------------------------------

/// `GET /api/webhooks/admin/listeners`
pub async fn admin_list_listeners(
    State(state): State<ApiState>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<Json<serde_json::Value>, ApiError> {
    ctx.require_admin()?;
    let triggers = state
        .store
        .list_triggers(None)
        .await
        .map_err(ApiError::from)?;
    let listeners: Vec<ListenerSummary> = triggers
        .iter()
        .map(|t| {
            let (kind, endpoint_id) = match &t.registration {
                TriggerRegistration::Webhook(w) => ("webhook", Some(w.endpoint_id.clone())),
                TriggerRegistration::Polling(_) => ("polling", None),
            };
            ListenerSummary {
                id: t.id.clone(),
                workflow_id: t.workflow_id.clone(),
                organization_id: t.organization_id.clone(),
                kind,
                active: t.active,
                endpoint_id,
                dedupe_tokens: t.dedupe.len(),
            }
        })
        .collect();
    Ok(Json(json!({"success": true, "listeners": listeners})))
}

/// `POST /api/webhooks/admin/listeners/:id/deactivate`
pub async fn admin_deactivate_listener(
    State(state): State<ApiState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    ctx.require_admin()?;
    let found = state
        .store
        .set_trigger_active(&id, false)
        .await
        .map_err(ApiError::from)?;
    if !found {
        return Err(ApiError::from(SwitchyardError::NotFound(id)));
    }
    audit(&state, &ctx, AuditAction::TriggerDeactivated, &id).await;
    Ok(Json(json!({"success": true})))
}

/// `DELETE /api/webhooks/admin/listeners/:id`
pub async fn admin_delete_listener(
    State(state): State<ApiState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    ctx.require_admin()?;
    let found = state
        .store
        .delete_trigger(&id)
        .await
        .map_err(ApiError::from)?;
    if !found {
        return Err(ApiError::from(SwitchyardError::NotFound(id)));
    }
    audit(&state, &ctx, AuditAction::TriggerDeleted, &id).await;
    Ok(Json(json!({"success": true})))
}

/// `GET /api/webhooks/admin/outbox?status=failed&limit=...`
pub async fn admin_list_outbox(
    State(state): State<ApiState>,
    Extension(ctx): Extension<AuthContext>,
    Query(query): Query<OutboxQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    ctx.require_admin()?;
    let status = match query.status.as_deref() {
        Some("pending") => Some(crate::models::OutboxStatus::Pending),
        Some("dispatched") => Some(crate::models::OutboxStatus::Dispatched),
        Some("failed") => Some(crate::models::OutboxStatus::Failed),
        Some(other) => {
            return Err(ApiError::from(SwitchyardError::InvalidInput(format!(
                "unknown outbox status: {other}"
            ))))
        }
        None => None,
    };
    let rows = state
        .store
        .list_outbox(status, query.limit.unwrap_or(50))
        .await
        .map_err(ApiError::from)?;
    let rows: Vec<OutboxRowSummary> = rows
        .iter()
        .map(|r| OutboxRowSummary {
            id: r.id.to_string(),
            status: r.status,
            attempts: r.attempts,
            last_error: r.last_error.clone(),
            workflow_id: r.payload.workflow_id.clone(),
            organization_id: r.payload.organization_id.clone(),
            created_at: r.created_at,
            last_attempt_at: r.last_attempt_at,
        })
        .collect();
    Ok(Json(json!({"success": true, "outbox": rows})))
}

/// `POST /api/webhooks/admin/outbox/:id/replay`
///
/// Admin replay of an exhausted row: `failed -> pending`, attempts reset,
/// so the relay picks it up on its next cycle.
pub async fn admin_replay_outbox(
    State(state): State<ApiState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    ctx.require_admin()?;
    let id = id
        .parse::<Uuid>()
        .map_err(|_| ApiError::from(SwitchyardError::InvalidInput("bad outbox id".into())))?;
    let replayed = state
        .store
        .requeue_outbox(&id)
        .await
        .map_err(ApiError::from)?;
    if !replayed {
        return Err(ApiError::from(SwitchyardError::NotFound(format!(
            "no failed outbox row {id}"
        ))));
    }
    audit(&state, &ctx, AuditAction::OutboxReplayed, &id.to_string()).await;
    Ok(Json(json!({"success": true, "status": "pending"})))
}

/// `GET /api/webhooks/admin/health`
pub async fn admin_webhook_health(
    State(state): State<ApiState>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<Json<serde_json::Value>, ApiError> {
    ctx.require_admin()?;
    let pending = state
        .store
        .count_outbox(crate::models::OutboxStatus::Pending)
        .await
        .map_err(ApiError::from)?;
    let failed = state
        .store
        .count_outbox(crate::models::OutboxStatus::Failed)
        .await
        .map_err(ApiError::from)?;
    Ok(Json(json!({
        "success": true,
        "outbox": {"pending": pending, "failed": failed},
        "queue": state.queue.health().await,
    })))
}

// ---------------------------------------------------------------------
// Usage export & liveness
// ---------------------------------------------------------------------

/// `GET /api/usage/export?format=csv|json&plan=...&start_date=...`
pub async fn usage_export(
    State(state): State<ApiState>,
    Extension(ctx): Extension<AuthContext>,
    Query(query): Query<UsageExportQuery>,
) -> Result<impl IntoResponse, ApiError> {
    ctx.require_admin()?;
    let format = match query.format.as_str() {
        "csv" => ExportFormat::Csv,
        "json" => ExportFormat::Json,
        other => {
            return Err(ApiError::from(SwitchyardError::InvalidInput(format!(
                "unknown export format: {other}"
            ))))
        }
    };
    let plan_filter = match &query.plan {
        Some(label) => Some(PlanTier::parse(label).ok_or_else(|| {
            ApiError::from(SwitchyardError::InvalidInput(format!(
                "unknown plan: {label}"
            )))
        })?),
        None => None,
    };
    // The export month comes from start_date; default is the current one.
    let (year, month) = match &query.start_date {
        Some(raw) => {
            let date = raw.parse::<chrono::NaiveDate>().map_err(|_| {
                ApiError::from(SwitchyardError::InvalidInput("bad start_date".into()))
            })?;
            (date.year(), date.month())
        }
        None => {
            let now = Utc::now();
            (now.year(), now.month())
        }
    };

    let body = state
        .meter
        .generate_usage_export(&UsageExportRequest {
            format,
            year,
            month,
            plan_filter,
        })
        .await
        .map_err(ApiError::from)?;

    let content_type = match format {
        ExportFormat::Csv => "text/csv",
        ExportFormat::Json => "application/json",
    };
    Ok(([(axum::http::header::CONTENT_TYPE, content_type)], body))
}

/// `GET /health/app` (public)
pub async fn health_app(State(state): State<ApiState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        git_sha: state.config.git_sha.clone(),
        queue: state.queue.health().await,
    })
}

async fn audit(state: &ApiState, ctx: &AuthContext, action: AuditAction, subject: &str) {
    let entry = AuditEntry::new(&ctx.organization_id, &ctx.user_id, action, subject, None);
    if let Err(e) = state.store.append_audit(entry).await {
        tracing::error!(error = %e, "audit append failed");
    }
}
