// Execution records - one run of a workflow graph, node by node

//! # Execution Models
//!
//! An [`ExecutionRecord`] is created at enqueue time, mutated by the
//! dispatcher and runtime as nodes complete, and immutable once it reaches a
//! terminal status. [`QueueRunRequest`] is the canonical on-wire shape that
//! travels from ingestion through the outbox to the queue driver.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// What started an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Manual,
    Webhook,
    Polling,
    Scheduled,
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TriggerType::Manual => "manual",
            TriggerType::Webhook => "webhook",
            TriggerType::Polling => "polling",
            TriggerType::Scheduled => "scheduled",
        };
        write!(f, "{label}")
    }
}

/// Execution lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    /// Terminal states may not be mutated further.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Succeeded | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

/// Trigger event payload carried by a [`QueueRunRequest`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriggerData {
    /// Connector id of the originating trigger, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,
    /// Trigger function id, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_id: Option<String>,
    /// The event body.
    pub payload: Value,
    /// Request headers for webhook events (already lower-cased).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
    /// Token that suppressed duplicates of this event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedupe_token: Option<String>,
    /// Event receipt time, RFC3339.
    pub timestamp: DateTime<Utc>,
    /// Where the event came from: `webhook`, `polling`, `manual`, `api`.
    pub source: String,
}

/// Canonical on-wire run request: ingestion writes it into the outbox, the
/// relay hands it to the queue, the dispatcher hydrates a runtime from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueRunRequest {
    pub workflow_id: String,
    pub organization_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub trigger_type: TriggerType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_data: Option<TriggerData>,
}

/// Retry policy for an action node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Single attempt.
    None,
    /// Fixed delay between attempts.
    Fixed { max_attempts: u32, delay_ms: u64 },
    /// Exponential backoff: `delay = base * multiplier^attempt`, plus up to
    /// `jitter` fraction of random spread.
    Exponential {
        max_attempts: u32,
        base_delay_ms: u64,
        multiplier: f64,
        #[serde(default)]
        jitter: f64,
    },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::Exponential {
            max_attempts: 3,
            base_delay_ms: 1_000,
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn max_attempts(&self) -> u32 {
        match self {
            RetryPolicy::None => 1,
            RetryPolicy::Fixed { max_attempts, .. }
            | RetryPolicy::Exponential { max_attempts, .. } => (*max_attempts).max(1),
        }
    }

    /// Delay before the given retry attempt (1-based: attempt 1 is the
    /// first retry). Jitter is sampled by the caller so policy math stays
    /// deterministic and testable.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        match self {
            RetryPolicy::None => Duration::ZERO,
            RetryPolicy::Fixed { delay_ms, .. } => Duration::from_millis(*delay_ms),
            RetryPolicy::Exponential {
                base_delay_ms,
                multiplier,
                ..
            } => {
                let factor = multiplier.powi(attempt.saturating_sub(1) as i32);
                Duration::from_millis((*base_delay_ms as f64 * factor) as u64)
            }
        }
    }

    /// Jitter fraction (0.0 when the policy has none).
    pub fn jitter(&self) -> f64 {
        match self {
            RetryPolicy::Exponential { jitter, .. } => *jitter,
            _ => 0.0,
        }
    }
}

/// Per-node execution detail recorded into the execution record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeRunDetail {
    /// One-line human summary of what the node did.
    #[serde(default)]
    pub summary: String,
    /// Full node output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Truncated output for the builder UI (arrays <= 5, objects <= 10 keys).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview: Option<Value>,
    /// Resolved parameters the node ran with. Secrets never land here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
    #[serde(default)]
    pub logs: Vec<String>,
    /// Structured diagnostics: selected branch, retry counts, timings.
    #[serde(default)]
    pub diagnostics: Map<String, Value>,
    pub status: NodeRunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// Node-level outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRunStatus {
    #[default]
    Pending,
    Succeeded,
    Failed,
    Skipped,
}

/// Queue durability label stamped onto executions admitted through the
/// dev-mode in-memory driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Durability {
    Durable,
    InMemory,
}

impl Default for Durability {
    fn default() -> Self {
        Durability::Durable
    }
}

/// One run of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: Uuid,
    pub workflow_id: String,
    pub organization_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub trigger_type: TriggerType,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub durability: Durability,
    /// Per-node details, keyed by node id, in completion order.
    #[serde(default)]
    pub nodes: HashMap<String, NodeRunDetail>,
    /// Node ids in the order they finished; preserves topological evidence
    /// that a plain map would lose.
    #[serde(default)]
    pub node_order: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl ExecutionRecord {
    /// Create a queued record for an admitted run request.
    pub fn queued(request: &QueueRunRequest, durability: Durability) -> Self {
        ExecutionRecord {
            id: Uuid::new_v4(),
            workflow_id: request.workflow_id.clone(),
            organization_id: request.organization_id.clone(),
            user_id: request.user_id.clone(),
            trigger_type: request.trigger_type,
            status: ExecutionStatus::Queued,
            durability,
            nodes: HashMap::new(),
            node_order: Vec::new(),
            error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Idempotency key for a connector call within this execution.
    pub fn idempotency_key(&self, node_id: &str) -> String {
        format!("{}:{}", self.id, node_id)
    }

    /// Record one node's detail, preserving completion order.
    pub fn record_node(&mut self, node_id: &str, detail: NodeRunDetail) {
        if !self.nodes.contains_key(node_id) {
            self.node_order.push(node_id.to_string());
        }
        self.nodes.insert(node_id.to_string(), detail);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn terminal_statuses() {
        assert!(!ExecutionStatus::Queued.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(ExecutionStatus::Succeeded.is_terminal());
        assert!(ExecutionStatus::Cancelled.is_terminal());
    }

    #[test]
    fn exponential_backoff_grows() {
        let policy = RetryPolicy::Exponential {
            max_attempts: 5,
            base_delay_ms: 2_000,
            multiplier: 2.0,
            jitter: 0.0,
        };
        assert_eq!(policy.base_delay(1), Duration::from_millis(2_000));
        assert_eq!(policy.base_delay(2), Duration::from_millis(4_000));
        assert_eq!(policy.base_delay(3), Duration::from_millis(8_000));
    }

    #[test]
    fn idempotency_key_is_execution_scoped() {
        let request = QueueRunRequest {
            workflow_id: "wf".into(),
            organization_id: "org".into(),
            user_id: None,
            trigger_type: TriggerType::Manual,
            trigger_data: None,
        };
        let record = ExecutionRecord::queued(&request, Durability::Durable);
        let key = record.idempotency_key("send");
        assert_eq!(key, format!("{}:send", record.id));
    }

    #[test]
    fn node_order_tracks_first_completion() {
        let request = QueueRunRequest {
            workflow_id: "wf".into(),
            organization_id: "org".into(),
            user_id: None,
            trigger_type: TriggerType::Webhook,
            trigger_data: Some(TriggerData {
                payload: json!({"ok": true}),
                timestamp: Utc::now(),
                source: "webhook".into(),
                ..TriggerData::default()
            }),
        };
        let mut record = ExecutionRecord::queued(&request, Durability::Durable);
        record.record_node("a", NodeRunDetail::default());
        record.record_node("b", NodeRunDetail::default());
        record.record_node("a", NodeRunDetail::default()); // overwrite keeps order
        assert_eq!(record.node_order, vec!["a".to_string(), "b".to_string()]);
    }
}
