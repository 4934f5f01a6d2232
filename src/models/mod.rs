// Core domain models for Switchyard
// Pure data structures; no I/O happens in this tree

//! # Domain Models Module
//!
//! Everything the engine persists or moves over a queue is defined here:
//! tenancy ([`organization`]), workflow structure ([`graph`]), trigger
//! registrations with dedupe state ([`trigger`]), executions and the
//! canonical run request ([`execution`]), stored connections
//! ([`connection`]), metering rows ([`usage`]) and the audit trail
//! ([`audit`]).
//!
//! The split mirrors the persisted table layout; storage backends map each
//! model onto its logical table without reshaping.

pub mod audit;
pub mod connection;
pub mod execution;
pub mod graph;
pub mod organization;
pub mod trigger;
pub mod usage;

pub use audit::{AuditAction, AuditEntry};
pub use connection::{Connection, ConnectionSummary};
pub use execution::{
    Durability, ExecutionRecord, ExecutionStatus, NodeRunDetail, NodeRunStatus, QueueRunRequest,
    RetryPolicy, TriggerData, TriggerType,
};
pub use graph::{
    ConditionConfig, ConditionRule, GraphValidationError, LoopConfig, NodeData, NodePosition,
    NodeRole, NodeType, ParameterValue, WorkflowEdge, WorkflowGraph, WorkflowNode,
};
pub use organization::{
    billing_window, ComplianceSettings, MemberRole, Membership, NetworkPolicy, Organization,
    OrganizationQuota, OrganizationStatus, PlanTier, QuotaLimits, QuotaUsage, SecuritySettings,
};
pub use trigger::{
    DedupeRing, DedupeRingSnapshot, OutboxStatus, PollingTriggerConfig, TriggerRegistration,
    WebhookOutboxRecord, WebhookTriggerConfig, WorkflowTrigger, DEFAULT_DEDUPE_CAPACITY,
};
pub use usage::{
    MeteringEvent, MeteringKind, QuotaCheck, UsageAlert, UsageResource, UsageTracking,
};

use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};

/// A saved workflow: its graph plus ownership and naming.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    pub name: String,
    pub organization_id: String,
    pub user_id: String,
    pub graph: WorkflowGraph,
    /// Stop the whole run on the first node failure instead of continuing
    /// independent branches.
    #[serde(default)]
    pub stop_on_error: bool,
    /// Per-workflow execution deadline override, seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_seconds: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
