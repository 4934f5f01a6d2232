// Switchyard - multi-tenant workflow automation substrate
// Triggers in, governed admission, graph execution out.

//! # Switchyard Library
//!
//! This is the library root for Switchyard, a workflow automation platform
//! core. Users compose directed graphs of nodes (triggers, connector actions,
//! transforms, conditions, loops) and the platform executes them on demand,
//! on a schedule, or in response to external events.
//!
//! ## Core Components
//!
//! ### Domain Models (`models/`)
//! - [`WorkflowGraph`]: node/edge structure of a workflow
//! - [`WorkflowTrigger`]: persisted webhook or polling registration
//! - [`ExecutionRecord`]: one run of a workflow with per-node details
//! - [`Organization`] / [`OrganizationQuota`]: tenant root and its limits
//!
//! ### Engine Layer (`engine/`)
//! - [`ConnectorRegistry`]: what a workflow can do, and for which plan tier
//! - [`ExecutionQueue`]: tenant-aware admission with typed rejections
//! - [`WorkflowRuntime`]: topological graph evaluation with retries and
//!   idempotency keys
//! - polling scheduler and outbox relay: the ingestion-to-queue pipeline
//! - usage meter: per-tenant metering, alerts and admission checks
//!
//! ### Ingestion (`webhooks/`)
//! Signature verification for the vendor webhook schemes the platform
//! accepts, constant-time comparisons, and event dedupe.
//!
//! ### Connector Clients (`connectors/`)
//! The uniform client contract every vendor binding implements, plus the
//! generic HTTP executor for JSON-declared connectors.
//!
//! ## Architecture
//!
//! ```text
//! Ingestion -> Dedupe -> Outbox -> Queue -> Dispatcher -> Runtime
//!                                                |           |
//!                                           UsageMeter   Connector Client
//! ```
//!
//! Persistence (the `engine::storage` traits) is the synchronization point
//! for every crash-consistent step. Services are constructed once at the
//! application root (`server::Application`) and shared as `Arc`s; there are
//! no module-level singletons.

// Core domain models (no I/O)
pub mod models;

// Execution engines and platform services
pub mod engine;

// Webhook ingestion and signature verification
pub mod webhooks;

// Connector client contract and implementations
pub mod connectors;

// REST API surface
pub mod api;

// Application root and server wiring
pub mod server;

// Typed environment configuration
pub mod config;

// Re-export the most commonly used types at the crate root
pub use models::{
    ExecutionRecord, ExecutionStatus, Organization, OrganizationQuota, PlanTier, QueueRunRequest,
    TriggerType, WorkflowGraph, WorkflowTrigger,
};

pub use engine::{
    queue::ExecutionQueue, registry::ConnectorRegistry, runtime::WorkflowRuntime,
    storage::InMemoryStorage,
};

use thiserror::Error;

/// Crate-wide error type.
///
/// Every variant that can cross the API boundary carries a stable machine
/// code (see [`SwitchyardError::code`]); the HTTP layer maps codes to status
/// lines without string matching.
#[derive(Error, Debug)]
pub enum SwitchyardError {
    // ------------------------------------------------------------------
    // Admission
    // ------------------------------------------------------------------
    /// The caller did not supply an organization context.
    #[error("organization context required")]
    OrganizationRequired,

    /// The caller is not authenticated.
    #[error("unauthenticated")]
    Unauthenticated,

    /// The caller is authenticated but not allowed to do this.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The queue driver is unavailable and durability is required.
    #[error("execution queue unavailable: {0}")]
    QueueUnavailable(String),

    /// The organization exhausted its monthly execution quota.
    #[error("execution quota exceeded: {current}/{limit} runs this period")]
    ExecutionQuotaExceeded { current: u64, limit: u64 },

    /// The organization is already running its maximum concurrent executions.
    #[error("concurrency limit exceeded: {current}/{limit} concurrent executions")]
    ConnectorConcurrencyExceeded { current: u64, limit: u64 },

    /// A metered resource (api calls, tokens, storage) is over its limit.
    #[error("usage quota exceeded for {resource}: {current}/{limit}")]
    UsageQuotaExceeded {
        resource: String,
        current: u64,
        limit: u64,
    },

    // ------------------------------------------------------------------
    // Graph validation
    // ------------------------------------------------------------------
    /// The workflow graph failed structural validation.
    #[error("invalid graph: {0}")]
    InvalidGraph(String),

    /// A node references a connector that is not in the registry.
    #[error("unknown connector: {0}")]
    MissingApp(String),

    /// A node references a function its connector does not declare.
    #[error("unknown function: {0}")]
    MissingFunction(String),

    /// A node requires a connection that was not supplied.
    #[error("missing connection for node {0}")]
    MissingConnection(String),

    /// A node type string does not parse into a known role.
    #[error("unknown node type: {0}")]
    UnknownNodeType(String),

    // ------------------------------------------------------------------
    // Runtime
    // ------------------------------------------------------------------
    /// No runtime (native or fallback) can execute this connector operation.
    #[error("no runtime available for {connector}.{function}")]
    RuntimeUnavailable { connector: String, function: String },

    /// The Apps-Script runtime is feature-gated off for this connector.
    #[error("apps-script runtime disabled for connector {0}")]
    AppsScriptDisabled(String),

    /// An inline expression failed to parse or evaluate.
    #[error("expression error: {0}")]
    ExpressionError(String),

    /// A parameter reference could not be resolved.
    #[error("parameter resolution error: {0}")]
    ParameterResolutionError(String),

    /// The referenced connection does not exist for this tenant.
    #[error("connection not found: {0}")]
    ConnectionNotFound(String),

    /// The connection service could not be reached.
    #[error("connection service unavailable: {0}")]
    ConnectionServiceUnavailable(String),

    /// A connector call failed upstream.
    #[error("integration error: {0}")]
    IntegrationError(String),

    /// A node or execution deadline elapsed.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The execution was cancelled by request.
    #[error("cancelled")]
    Cancelled,

    // ------------------------------------------------------------------
    // Infrastructure
    // ------------------------------------------------------------------
    /// Something was not found (storage-level).
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid caller input.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Storage backend failure.
    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),

    /// Database failure (Postgres backend).
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// JSON serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Anything else.
    #[error("internal error: {0}")]
    Internal(String),
}

impl SwitchyardError {
    /// Stable machine code for this error.
    ///
    /// These strings are part of the wire contract; tests pin them.
    pub fn code(&self) -> &'static str {
        match self {
            Self::OrganizationRequired => "ORGANIZATION_REQUIRED",
            Self::Unauthenticated => "UNAUTHENTICATED",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::QueueUnavailable(_) => "QUEUE_UNAVAILABLE",
            Self::ExecutionQuotaExceeded { .. } => "EXECUTION_QUOTA_EXCEEDED",
            Self::ConnectorConcurrencyExceeded { .. } => "CONNECTOR_CONCURRENCY_EXCEEDED",
            Self::UsageQuotaExceeded { .. } => "USAGE_QUOTA_EXCEEDED",
            Self::InvalidGraph(_) => "INVALID_GRAPH",
            Self::MissingApp(_) => "MISSING_APP",
            Self::MissingFunction(_) => "MISSING_FUNCTION",
            Self::MissingConnection(_) => "MISSING_CONNECTION",
            Self::UnknownNodeType(_) => "UNKNOWN_NODE_TYPE",
            Self::RuntimeUnavailable { .. } => "RUNTIME_UNAVAILABLE",
            Self::AppsScriptDisabled(_) => "APPS_SCRIPT_DISABLED",
            Self::ExpressionError(_) => "EXPRESSION_ERROR",
            Self::ParameterResolutionError(_) => "PARAMETER_RESOLUTION_ERROR",
            Self::ConnectionNotFound(_) => "CONNECTION_NOT_FOUND",
            Self::ConnectionServiceUnavailable(_) => "CONNECTION_SERVICE_UNAVAILABLE",
            Self::IntegrationError(_) => "INTEGRATION_ERROR",
            Self::Timeout(_) => "TIMEOUT",
            Self::Cancelled => "CANCELLED",
            Self::NotFound(_) => "NOT_FOUND",
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::Storage(_) | Self::Database(_) => "STORAGE_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether an error of this kind is worth retrying at the node level.
    /// Admission and validation errors never are.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionServiceUnavailable(_)
                | Self::QueueUnavailable(_)
                | Self::Timeout(_)
                | Self::Storage(_)
                | Self::Database(_)
        )
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, SwitchyardError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(
            SwitchyardError::ExecutionQuotaExceeded {
                current: 10,
                limit: 10
            }
            .code(),
            "EXECUTION_QUOTA_EXCEEDED"
        );
        assert_eq!(SwitchyardError::Cancelled.code(), "CANCELLED");
        assert_eq!(
            SwitchyardError::QueueUnavailable("driver down".into()).code(),
            "QUEUE_UNAVAILABLE"
        );
    }

    #[test]
    fn admission_errors_are_not_retryable() {
        assert!(!SwitchyardError::ExecutionQuotaExceeded {
            current: 1,
            limit: 1
        }
        .is_retryable());
        assert!(SwitchyardError::Timeout("node deadline".into()).is_retryable());
    }
}
