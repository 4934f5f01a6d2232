// REST API wire types and the error envelope

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{GraphValidationError, NodeRunDetail, TriggerType, WorkflowGraph};
use crate::SwitchyardError;

/// Uniform error envelope: `{ success: false, error: { code, message } }`.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub success: bool,
    pub error: ErrorBody,
}

/// API-level error: a platform error plus its HTTP status.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
    pub details: Option<Value>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        ApiError {
            status,
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }
}

impl From<SwitchyardError> for ApiError {
    fn from(e: SwitchyardError) -> Self {
        let status = match &e {
            SwitchyardError::Unauthenticated => StatusCode::UNAUTHORIZED,
            SwitchyardError::Forbidden(_) => StatusCode::FORBIDDEN,
            SwitchyardError::OrganizationRequired | SwitchyardError::InvalidInput(_) => {
                StatusCode::BAD_REQUEST
            }
            SwitchyardError::QueueUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            SwitchyardError::ExecutionQuotaExceeded { .. }
            | SwitchyardError::ConnectorConcurrencyExceeded { .. }
            | SwitchyardError::UsageQuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            SwitchyardError::InvalidGraph(_)
            | SwitchyardError::MissingApp(_)
            | SwitchyardError::MissingFunction(_)
            | SwitchyardError::MissingConnection(_)
            | SwitchyardError::UnknownNodeType(_) => StatusCode::UNPROCESSABLE_ENTITY,
            SwitchyardError::NotFound(_) | SwitchyardError::ConnectionNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError {
            status,
            code: e.code().to_string(),
            message: e.to_string(),
            details: None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorEnvelope {
            success: false,
            error: ErrorBody {
                code: self.code,
                message: self.message,
                details: self.details,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ValidateRequest {
    pub graph: WorkflowGraph,
    #[serde(default)]
    pub options: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct SaveFlowRequest {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    pub graph: WorkflowGraph,
    #[serde(default)]
    pub metadata: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct DryRunRequest {
    #[serde(default)]
    pub workflow_id: Option<String>,
    pub graph: WorkflowGraph,
    #[serde(default)]
    pub options: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct EnqueueRequest {
    pub workflow_id: String,
    pub trigger_type: TriggerType,
    #[serde(default)]
    pub initial_data: Option<Value>,
    #[serde(default)]
    pub runtime: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ConnectorsQuery {
    #[serde(default)]
    pub organization_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct OutboxQuery {
    /// `pending | dispatched | failed`; absent lists every status.
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct UsageExportQuery {
    pub format: String,
    #[serde(default)]
    pub plan: Option<String>,
    #[serde(default)]
    pub start_date: Option<String>,
    #[serde(default)]
    pub end_date: Option<String>,
}

// ---------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct ValidationBody {
    pub valid: bool,
    pub errors: Vec<GraphValidationError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ValidateResponse {
    pub success: bool,
    pub validation: ValidationBody,
}

#[derive(Debug, Serialize)]
pub struct SaveFlowResponse {
    pub success: bool,
    pub workflow_id: String,
}

#[derive(Debug, Serialize)]
pub struct EnqueueResponse {
    pub execution_id: String,
}

#[derive(Debug, Serialize)]
pub struct DryRunResponse {
    pub success: bool,
    pub status: String,
    /// Node ids in completion order.
    pub order: Vec<String>,
    pub nodes: std::collections::HashMap<String, NodeRunDetail>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub git_sha: String,
    pub queue: crate::engine::QueueHealth,
}

#[derive(Debug, Serialize)]
pub struct OutboxRowSummary {
    pub id: String,
    pub status: crate::models::OutboxStatus,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub workflow_id: String,
    pub organization_id: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Serialize)]
pub struct ListenerSummary {
    pub id: String,
    pub workflow_id: String,
    pub organization_id: String,
    pub kind: &'static str,
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint_id: Option<String>,
    pub dedupe_tokens: usize,
}
