// Append-only audit trail entries

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Actions worth an audit trail entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    TriggerDeployed,
    TriggerDeactivated,
    TriggerDeleted,
    ExecutionEnqueued,
    ExecutionRejected,
    ExecutionFinished,
    OutboxExhausted,
    OutboxReplayed,
    QuotaOverage,
    ConnectionRevoked,
}

/// One append-only audit record. Never mutated or deleted inside the
/// retention window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub organization_id: String,
    /// User or system principal that caused the transition.
    pub actor: String,
    pub action: AuditAction,
    /// Identifier of the affected entity (trigger id, execution id, ...).
    pub subject_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
    pub recorded_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(
        organization_id: &str,
        actor: &str,
        action: AuditAction,
        subject_id: &str,
        detail: Option<Value>,
    ) -> Self {
        AuditEntry {
            id: Uuid::new_v4(),
            organization_id: organization_id.to_string(),
            actor: actor.to_string(),
            action,
            subject_id: subject_id.to_string(),
            detail,
            recorded_at: Utc::now(),
        }
    }
}
