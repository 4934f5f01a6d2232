// Webhook ingestion - verify, filter, dedupe, stage in the outbox

//! # Webhook Ingestion
//!
//! `POST /api/webhooks/{webhookId}` lands here. The flow is strict and
//! ordered: look up the trigger, verify the vendor signature over the raw
//! bytes, apply the trigger's metadata filters, dedupe by event hash, and
//! only then append the canonical run request to the outbox. Duplicates
//! and filtered events still answer 2xx so vendors do not retry them.

pub mod signature;

use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

use crate::models::{
    QueueRunRequest, TriggerData, TriggerType, WebhookOutboxRecord, WorkflowTrigger,
};
use crate::SwitchyardError;

use self::signature::{RequestHeaders, VerificationFailure, VerifyRequest};
use crate::engine::storage::{OutboxStore, PlatformStore, TriggerStore};

/// Why an ingestion attempt was refused.
#[derive(Debug, Error)]
pub enum IngestError {
    /// No active trigger is registered at this endpoint.
    #[error("webhook endpoint not found")]
    NotFound,
    /// The trigger exists but is deactivated.
    #[error("webhook endpoint inactive")]
    Inactive,
    /// Signature verification failed with the given reason.
    #[error("signature verification failed: {}", .0.code())]
    Verification(VerificationFailure),
    /// The body was not parseable JSON.
    #[error("payload is not valid JSON")]
    BadPayload,
    /// Storage-level failure.
    #[error(transparent)]
    Storage(#[from] SwitchyardError),
}

/// What happened to an accepted delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Forwarded to the outbox.
    Accepted { dedupe_token: String },
    /// Same event seen before; dropped without side effects.
    Duplicate { dedupe_token: String },
    /// Metadata filters did not match; acknowledged but not forwarded.
    Filtered,
}

/// Dedupe token for an event: `md5(workflowId|webhookId|triggerId|source|payload)`
/// over the canonical (sorted-key) payload rendering.
pub fn event_hash(
    workflow_id: &str,
    webhook_id: &str,
    trigger_id: &str,
    source: &str,
    canonical_payload: &str,
) -> String {
    let input = format!("{workflow_id}|{webhook_id}|{trigger_id}|{source}|{canonical_payload}");
    format!("{:x}", md5::compute(input.as_bytes()))
}

/// The ingestion service.
pub struct WebhookIngestion {
    store: Arc<dyn PlatformStore>,
}

impl WebhookIngestion {
    pub fn new(store: Arc<dyn PlatformStore>) -> Self {
        WebhookIngestion { store }
    }

    /// Ingest one delivery. `raw_body` is the request body exactly as
    /// received; `host`/`path` feed URL-signing schemes.
    pub async fn ingest(
        &self,
        webhook_id: &str,
        headers: RequestHeaders,
        raw_body: &[u8],
        host: &str,
        path: &str,
    ) -> Result<IngestOutcome, IngestError> {
        let mut trigger = self
            .store
            .get_trigger_by_endpoint(webhook_id)
            .await?
            .ok_or(IngestError::NotFound)?;
        if !trigger.active {
            return Err(IngestError::Inactive);
        }
        let webhook = trigger.webhook().cloned().ok_or(IngestError::NotFound)?;

        // Raw bytes into the verifier; JSON parsing happens afterwards.
        let verify_request = VerifyRequest {
            provider: &webhook.provider,
            secret: &webhook.secret,
            headers: &headers,
            raw_body,
            host,
            path,
            now: Utc::now(),
        };
        if let Err(reason) = signature::verify(&verify_request) {
            tracing::warn!(
                webhook = webhook_id,
                provider = %webhook.provider,
                reason = reason.code(),
                "webhook signature rejected"
            );
            return Err(IngestError::Verification(reason));
        }

        let payload: Value =
            serde_json::from_slice(raw_body).map_err(|_| IngestError::BadPayload)?;

        // Metadata filters: accepted at HTTP level, not forwarded.
        if !trigger.filters_match(&payload) {
            tracing::debug!(webhook = webhook_id, "event dropped by trigger filters");
            return Ok(IngestOutcome::Filtered);
        }

        // serde_json renders maps with sorted keys, which makes this the
        // canonical form the dedupe hash needs.
        let canonical = payload.to_string();
        let token = event_hash(
            &trigger.workflow_id,
            webhook_id,
            &trigger.trigger_id,
            "webhook",
            &canonical,
        );

        if trigger.dedupe.contains(&token) {
            tracing::debug!(webhook = webhook_id, token = %token, "duplicate delivery dropped");
            return Ok(IngestOutcome::Duplicate {
                dedupe_token: token,
            });
        }
        trigger.dedupe.insert(&token);
        trigger.last_triggered_at = Some(Utc::now());
        // Persist ring + last-triggered before the outbox append: a crash
        // between the two suppresses a redelivery instead of doubling it.
        self.store.put_trigger(trigger.clone()).await?;

        let request = build_run_request(&trigger, payload, &headers, &token);
        self.store
            .append_outbox(WebhookOutboxRecord::new(request))
            .await?;

        Ok(IngestOutcome::Accepted {
            dedupe_token: token,
        })
    }
}

/// Canonical run request for a webhook event.
fn build_run_request(
    trigger: &WorkflowTrigger,
    payload: Value,
    headers: &RequestHeaders,
    dedupe_token: &str,
) -> QueueRunRequest {
    QueueRunRequest {
        workflow_id: trigger.workflow_id.clone(),
        organization_id: trigger.organization_id.clone(),
        user_id: trigger.user_id.clone(),
        trigger_type: TriggerType::Webhook,
        trigger_data: Some(TriggerData {
            app_id: Some(trigger.app_id.clone()),
            trigger_id: Some(trigger.trigger_id.clone()),
            payload,
            headers: Some(headers.clone().into_inner()),
            dedupe_token: Some(dedupe_token.to_string()),
            timestamp: Utc::now(),
            source: "webhook".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::storage::{InMemoryStorage, OutboxStore, TriggerStore};
    use crate::models::{
        DedupeRing, OutboxStatus, TriggerRegistration, WebhookTriggerConfig,
    };
    use hmac::Mac;
    use serde_json::json;
    use std::collections::HashMap;

    fn sig_for(secret: &str, body: &[u8]) -> String {
        let mut mac = hmac::Hmac::<sha2::Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    fn trigger(filters: HashMap<String, String>) -> WorkflowTrigger {
        WorkflowTrigger {
            id: "trg-1".into(),
            workflow_id: "wf-1".into(),
            organization_id: "org-1".into(),
            user_id: Some("u-1".into()),
            app_id: "somevendor".into(),
            trigger_id: "order_created".into(),
            registration: TriggerRegistration::Webhook(WebhookTriggerConfig {
                endpoint_id: "hook-1".into(),
                secret: "hook-secret".into(),
                provider: "somevendor".into(),
            }),
            active: true,
            filters,
            metadata: serde_json::Map::new(),
            dedupe: DedupeRing::default(),
            created_at: Utc::now(),
            last_triggered_at: None,
        }
    }

    async fn ingestion_with(
        trigger: WorkflowTrigger,
    ) -> (WebhookIngestion, Arc<InMemoryStorage>) {
        let store = Arc::new(InMemoryStorage::new());
        store.put_trigger(trigger).await.unwrap();
        (WebhookIngestion::new(store.clone()), store)
    }

    fn signed_headers(secret: &str, body: &[u8]) -> RequestHeaders {
        RequestHeaders::from_pairs([("x-webhook-signature", sig_for(secret, body).as_str())])
    }

    #[tokio::test]
    async fn accepted_event_reaches_outbox_once() {
        let (ingestion, store) = ingestion_with(trigger(HashMap::new())).await;
        let body = br#"{"event":{"type":"order.created"},"id":"e-1"}"#;
        let headers = signed_headers("hook-secret", body);

        let first = ingestion
            .ingest("hook-1", headers.clone(), body, "h", "/p")
            .await
            .unwrap();
        let token = match first {
            IngestOutcome::Accepted { dedupe_token } => dedupe_token,
            other => panic!("expected accept, got {other:?}"),
        };

        // Same delivery again: duplicate, no second outbox row.
        let second = ingestion
            .ingest("hook-1", headers, body, "h", "/p")
            .await
            .unwrap();
        assert_eq!(
            second,
            IngestOutcome::Duplicate {
                dedupe_token: token.clone()
            }
        );
        assert_eq!(store.count_outbox(OutboxStatus::Pending).await.unwrap(), 1);

        let rows = store.list_outbox(None, 10).await.unwrap();
        let data = rows[0].payload.trigger_data.as_ref().unwrap();
        assert_eq!(data.dedupe_token.as_deref(), Some(token.as_str()));
        assert_eq!(data.source, "webhook");
    }

    #[tokio::test]
    async fn filtered_event_is_acknowledged_but_not_forwarded() {
        let mut filters = HashMap::new();
        filters.insert("event.type".to_string(), "order.created".to_string());
        let (ingestion, store) = ingestion_with(trigger(filters)).await;

        let body = br#"{"event":{"type":"order.updated"}}"#;
        let outcome = ingestion
            .ingest("hook-1", signed_headers("hook-secret", body), body, "h", "/p")
            .await
            .unwrap();
        assert_eq!(outcome, IngestOutcome::Filtered);
        assert_eq!(store.count_outbox(OutboxStatus::Pending).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn bad_signature_is_a_typed_rejection() {
        let (ingestion, store) = ingestion_with(trigger(HashMap::new())).await;
        let body = br#"{"x":1}"#;
        let headers = signed_headers("wrong-secret", body);
        let err = ingestion
            .ingest("hook-1", headers, body, "h", "/p")
            .await
            .unwrap_err();
        match err {
            IngestError::Verification(reason) => {
                assert_eq!(reason.code(), "SIGNATURE_MISMATCH")
            }
            other => panic!("expected verification failure, got {other:?}"),
        }
        assert_eq!(store.count_outbox(OutboxStatus::Pending).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn inactive_and_unknown_endpoints() {
        let mut t = trigger(HashMap::new());
        t.active = false;
        let (ingestion, _) = ingestion_with(t).await;
        let body = b"{}";
        let headers = signed_headers("hook-secret", body);
        assert!(matches!(
            ingestion
                .ingest("hook-1", headers.clone(), body, "h", "/p")
                .await,
            Err(IngestError::Inactive)
        ));
        assert!(matches!(
            ingestion.ingest("ghost", headers, body, "h", "/p").await,
            Err(IngestError::NotFound)
        ));
    }

    #[tokio::test]
    async fn dedupe_state_survives_reload() {
        let (ingestion, store) = ingestion_with(trigger(HashMap::new())).await;
        let body = br#"{"id":"stable"}"#;
        ingestion
            .ingest("hook-1", signed_headers("hook-secret", body), body, "h", "/p")
            .await
            .unwrap();

        // The persisted trigger carries the token.
        let stored = store.get_trigger("trg-1").await.unwrap().unwrap();
        assert_eq!(stored.dedupe.len(), 1);
        assert!(stored.last_triggered_at.is_some());
    }

    #[test]
    fn event_hash_is_stable_and_input_sensitive() {
        let a = event_hash("wf", "hook", "trg", "webhook", r#"{"a":1}"#);
        let b = event_hash("wf", "hook", "trg", "webhook", r#"{"a":1}"#);
        let c = event_hash("wf", "hook", "trg", "webhook", r#"{"a":2}"#);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 32); // md5 hex
    }
}
