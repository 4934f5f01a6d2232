// Trigger registrations - webhooks, polled sources, dedupe state, outbox

//! # Trigger Models
//!
//! A [`WorkflowTrigger`] is a persisted registration that starts executions:
//! either a webhook endpoint (signed vendor callbacks) or a polled source
//! (interval + watermark). Both carry a bounded [`DedupeRing`] of recently
//! seen event tokens; the ring is the causal-ordering primitive for
//! at-most-once-effect delivery.
//!
//! [`WebhookOutboxRecord`] is the durable hand-off between ingestion and the
//! execution queue: rows move `pending -> dispatched | failed` and stuck
//! rows are replayed with bounded backoff.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use uuid::Uuid;

use super::execution::QueueRunRequest;

/// Default dedupe ring capacity.
pub const DEFAULT_DEDUPE_CAPACITY: usize = 500;

/// Bounded FIFO of dedupe tokens with a hash-set index.
///
/// Insertion past capacity evicts the oldest token. The ring serializes as
/// its token vector (plus capacity); the index is rebuilt on load.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "DedupeRingSnapshot", into = "DedupeRingSnapshot")]
pub struct DedupeRing {
    tokens: VecDeque<String>,
    index: HashSet<String>,
    capacity: usize,
}

/// Persisted shape of a [`DedupeRing`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupeRingSnapshot {
    #[serde(default)]
    pub tokens: Vec<String>,
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

fn default_capacity() -> usize {
    DEFAULT_DEDUPE_CAPACITY
}

impl Default for DedupeRing {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_DEDUPE_CAPACITY)
    }
}

impl DedupeRing {
    pub fn with_capacity(capacity: usize) -> Self {
        DedupeRing {
            tokens: VecDeque::new(),
            index: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn contains(&self, token: &str) -> bool {
        self.index.contains(token)
    }

    /// Insert a token. Returns `true` when the token was fresh; a duplicate
    /// leaves the ring untouched and returns `false`.
    pub fn insert(&mut self, token: &str) -> bool {
        if self.index.contains(token) {
            return false;
        }
        if self.tokens.len() >= self.capacity {
            if let Some(evicted) = self.tokens.pop_front() {
                self.index.remove(&evicted);
            }
        }
        self.tokens.push_back(token.to_string());
        self.index.insert(token.to_string());
        true
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl From<DedupeRingSnapshot> for DedupeRing {
    fn from(snap: DedupeRingSnapshot) -> Self {
        let mut ring = DedupeRing::with_capacity(snap.capacity);
        for token in snap.tokens {
            ring.insert(&token);
        }
        ring
    }
}

impl From<DedupeRing> for DedupeRingSnapshot {
    fn from(ring: DedupeRing) -> Self {
        DedupeRingSnapshot {
            tokens: ring.tokens.into_iter().collect(),
            capacity: ring.capacity,
        }
    }
}

/// Webhook-specific registration fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookTriggerConfig {
    /// Endpoint path component: `POST /api/webhooks/{endpoint_id}`.
    pub endpoint_id: String,
    /// Shared secret for signature verification. Never logged.
    pub secret: String,
    /// Signature template id, normally the connector id (`slack`, `stripe`).
    pub provider: String,
}

/// Polling-specific registration fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingTriggerConfig {
    /// Poll interval in seconds.
    pub interval_seconds: u64,
    /// Watermark of the last completed poll; feeds the `since` parameter.
    #[serde(default)]
    pub last_poll: Option<DateTime<Utc>>,
    /// Next scheduled poll.
    #[serde(default)]
    pub next_poll_at: Option<DateTime<Utc>>,
    /// Item field used to build dedupe tokens; absent falls back to the
    /// event-hash scheme.
    #[serde(default)]
    pub dedupe_key: Option<String>,
    /// Override for the client poll method name; absent derives
    /// `poll<PascalCase(trigger_function)>`.
    #[serde(default)]
    pub poll_method: Option<String>,
}

/// Registration kind with its kind-specific fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerRegistration {
    Webhook(WebhookTriggerConfig),
    Polling(PollingTriggerConfig),
}

/// A persisted trigger registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowTrigger {
    pub id: String,
    pub workflow_id: String,
    pub organization_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    /// Connector id this trigger belongs to.
    pub app_id: String,
    /// Trigger function id within the connector.
    pub trigger_id: String,
    #[serde(flatten)]
    pub registration: TriggerRegistration,
    pub active: bool,
    /// Dot-path filters an event must satisfy to be forwarded. The value
    /// `contains:x` checks substring containment; anything else is
    /// compared for equality against the value at the path.
    #[serde(default)]
    pub filters: HashMap<String, String>,
    /// Free-form registration metadata (resolved trigger parameters).
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub dedupe: DedupeRing,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_triggered_at: Option<DateTime<Utc>>,
}

impl WorkflowTrigger {
    /// Apply the dot-path filters to an event payload.
    ///
    /// Every filter must pass. A filter over a missing path fails. This is
    /// intentionally simpler than the expression evaluator: filters run on
    /// the hot ingestion path before anything is persisted.
    pub fn filters_match(&self, payload: &Value) -> bool {
        self.filters.iter().all(|(path, expected)| {
            let Some(actual) = lookup_dot_path(payload, path) else {
                return false;
            };
            let actual_str = value_as_string(actual);
            match expected.strip_prefix("contains:") {
                Some(needle) => actual_str.contains(needle),
                None => actual_str == *expected,
            }
        })
    }

    /// Webhook configuration, when this is a webhook trigger.
    pub fn webhook(&self) -> Option<&WebhookTriggerConfig> {
        match &self.registration {
            TriggerRegistration::Webhook(w) => Some(w),
            TriggerRegistration::Polling(_) => None,
        }
    }

    /// Polling configuration, when this is a polling trigger.
    pub fn polling(&self) -> Option<&PollingTriggerConfig> {
        match &self.registration {
            TriggerRegistration::Polling(p) => Some(p),
            TriggerRegistration::Webhook(_) => None,
        }
    }
}

/// Walk a `a.b.c` path into a JSON value. No array indexing here; filter
/// paths address object fields only.
pub fn lookup_dot_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// String form used for filter comparison: bare text for strings, JSON
/// rendering for everything else.
fn value_as_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Outbox row status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    Dispatched,
    Failed,
}

/// Durable staging row between ingestion and the execution queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookOutboxRecord {
    pub id: Uuid,
    pub payload: QueueRunRequest,
    pub status: OutboxStatus,
    pub attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl WebhookOutboxRecord {
    pub fn new(payload: QueueRunRequest) -> Self {
        WebhookOutboxRecord {
            id: Uuid::new_v4(),
            payload,
            status: OutboxStatus::Pending,
            attempts: 0,
            last_error: None,
            created_at: Utc::now(),
            last_attempt_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn webhook_trigger(filters: HashMap<String, String>) -> WorkflowTrigger {
        WorkflowTrigger {
            id: "trg-1".into(),
            workflow_id: "wf-1".into(),
            organization_id: "org-1".into(),
            user_id: None,
            app_id: "shopify".into(),
            trigger_id: "order_created".into(),
            registration: TriggerRegistration::Webhook(WebhookTriggerConfig {
                endpoint_id: "hook-1".into(),
                secret: "s3cret".into(),
                provider: "shopify".into(),
            }),
            active: true,
            filters,
            metadata: Map::new(),
            dedupe: DedupeRing::default(),
            created_at: Utc::now(),
            last_triggered_at: None,
        }
    }

    #[test]
    fn ring_dedupes_and_evicts_fifo() {
        let mut ring = DedupeRing::with_capacity(3);
        assert!(ring.insert("a"));
        assert!(!ring.insert("a"));
        assert!(ring.insert("b"));
        assert!(ring.insert("c"));
        assert!(ring.insert("d")); // evicts "a"
        assert_eq!(ring.len(), 3);
        assert!(!ring.contains("a"));
        assert!(ring.contains("d"));
        // "a" can come back after eviction; the bound is the contract.
        assert!(ring.insert("a"));
    }

    #[test]
    fn ring_round_trips_through_serde() {
        let mut ring = DedupeRing::with_capacity(10);
        ring.insert("x");
        ring.insert("y");
        let json = serde_json::to_value(&ring).unwrap();
        let back: DedupeRing = serde_json::from_value(json).unwrap();
        assert!(back.contains("x"));
        assert!(back.contains("y"));
        assert_eq!(back.len(), 2);
    }

    #[test]
    fn filters_equality_and_contains() {
        let mut filters = HashMap::new();
        filters.insert("event.type".to_string(), "order.created".to_string());
        let trigger = webhook_trigger(filters);

        assert!(trigger.filters_match(&json!({"event": {"type": "order.created"}})));
        assert!(!trigger.filters_match(&json!({"event": {"type": "order.updated"}})));
        assert!(!trigger.filters_match(&json!({"event": {}})));

        let mut filters = HashMap::new();
        filters.insert("event.tags".to_string(), "contains:vip".to_string());
        let trigger = webhook_trigger(filters);
        assert!(trigger.filters_match(&json!({"event": {"tags": "vip,eu"}})));
        assert!(!trigger.filters_match(&json!({"event": {"tags": "basic"}})));
    }

    #[test]
    fn registration_kind_round_trips() {
        let trigger = webhook_trigger(HashMap::new());
        let json = serde_json::to_value(&trigger).unwrap();
        assert_eq!(json["kind"], "webhook");
        let back: WorkflowTrigger = serde_json::from_value(json).unwrap();
        assert!(back.webhook().is_some());
        assert!(back.polling().is_none());
    }
}
