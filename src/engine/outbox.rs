// Outbox relay - durable hand-off from ingestion to the execution queue

//! # Outbox Relay
//!
//! Ingestion appends [`WebhookOutboxRecord`](crate::models::WebhookOutboxRecord)
//! rows; this relay drains them into the execution queue. Rows move
//! `pending -> dispatched` on success. Infrastructure failures replay with
//! exponential backoff (x2, base 2s, cap 5m, 5 attempts); admission
//! rejections are terminal because replaying a quota rejection only burns
//! the same quota again. Exhausted rows park as `failed`, raise an
//! operator alert event, and wait for an admin requeue.
//!
//! Multiple relay workers may run; the storage row lease prevents double
//! dispatch.

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::models::{AuditAction, AuditEntry, OutboxStatus, WebhookOutboxRecord};
use crate::{Result, SwitchyardError};

use super::queue::ExecutionQueue;
use super::storage::{AuditStore, OutboxStore, PlatformStore};

/// Replay policy constants.
const MAX_ATTEMPTS: u32 = 5;
const BASE_BACKOFF: Duration = Duration::from_secs(2);
const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Relay tuning.
#[derive(Debug, Clone)]
pub struct OutboxRelayConfig {
    /// Rows claimed per cycle.
    pub batch_size: usize,
    /// Sleep between cycles when the outbox is drained.
    pub idle_interval: Duration,
    /// Row lease while a dispatch is in flight.
    pub lease: Duration,
    /// Pending-row count past which the pipeline reports backpressure.
    pub high_water_mark: u64,
}

impl Default for OutboxRelayConfig {
    fn default() -> Self {
        OutboxRelayConfig {
            batch_size: 32,
            idle_interval: Duration::from_millis(500),
            lease: Duration::from_secs(30),
            high_water_mark: 1_000,
        }
    }
}

/// Backoff before the given replay attempt (1-based), doubling from the
/// base and capped.
pub fn replay_backoff(attempt: u32) -> Duration {
    let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
    let delay = BASE_BACKOFF.saturating_mul(factor as u32);
    delay.min(MAX_BACKOFF)
}

/// The relay service.
pub struct OutboxRelay {
    store: Arc<dyn PlatformStore>,
    queue: Arc<ExecutionQueue>,
    config: OutboxRelayConfig,
}

impl OutboxRelay {
    pub fn new(
        store: Arc<dyn PlatformStore>,
        queue: Arc<ExecutionQueue>,
        config: OutboxRelayConfig,
    ) -> Self {
        OutboxRelay {
            store,
            queue,
            config,
        }
    }

    /// Is the outbox past its high-water mark? The polling scheduler
    /// throttles on this signal.
    pub async fn is_backpressured(&self) -> bool {
        match self.store.count_outbox(OutboxStatus::Pending).await {
            Ok(pending) if pending > self.config.high_water_mark => {
                tracing::warn!(pending, hwm = self.config.high_water_mark, "outbox backpressure");
                true
            }
            Ok(_) => false,
            Err(e) => {
                tracing::error!(error = %e, "outbox depth check failed");
                false
            }
        }
    }

    /// Run one relay cycle: claim due rows, dispatch each, resolve. Returns
    /// the number of rows handled.
    pub async fn run_once(&self) -> Result<usize> {
        let claimed = self
            .store
            .claim_pending_outbox(self.config.batch_size, self.config.lease)
            .await?;

        let now = Utc::now();
        let mut handled = 0;
        for record in claimed {
            // Backoff eligibility: a row replays only after its delay from
            // the last attempt has elapsed.
            if record.attempts > 0 {
                let due = record.last_attempt_at.unwrap_or(record.created_at)
                    + ChronoDuration::from_std(replay_backoff(record.attempts))
                        .unwrap_or_else(|_| ChronoDuration::seconds(2));
                if due > now {
                    continue;
                }
            }
            self.dispatch(record).await;
            handled += 1;
        }
        Ok(handled)
    }

    async fn dispatch(&self, record: WebhookOutboxRecord) {
        match self.queue.enqueue(record.payload.clone()).await {
            Ok(execution_id) => {
                tracing::debug!(outbox = %record.id, execution = %execution_id, "outbox dispatched");
                if let Err(e) = self.store.mark_outbox_dispatched(&record.id).await {
                    tracing::error!(outbox = %record.id, error = %e, "dispatch mark failed");
                }
            }
            Err(e) => {
                let terminal = match &e {
                    // Retrying infrastructure failures can succeed later.
                    SwitchyardError::QueueUnavailable(_)
                    | SwitchyardError::Storage(_)
                    | SwitchyardError::Database(_) => record.attempts + 1 >= MAX_ATTEMPTS,
                    // Admission rejections are deterministic; park the row.
                    _ => true,
                };
                tracing::warn!(
                    outbox = %record.id,
                    error = %e,
                    attempts = record.attempts + 1,
                    terminal,
                    "outbox dispatch failed"
                );
                if let Err(mark_err) = self
                    .store
                    .mark_outbox_failed(&record.id, &e.to_string(), terminal)
                    .await
                {
                    tracing::error!(outbox = %record.id, error = %mark_err, "failure mark failed");
                }
                if terminal {
                    self.alert_exhausted(&record, &e).await;
                }
            }
        }
    }

    /// Operator-facing alert for an exhausted row.
    async fn alert_exhausted(&self, record: &WebhookOutboxRecord, error: &SwitchyardError) {
        tracing::error!(
            outbox = %record.id,
            workflow = %record.payload.workflow_id,
            error = %error,
            "outbox entry exhausted; operator action required"
        );
        let entry = AuditEntry::new(
            &record.payload.organization_id,
            "outbox-relay",
            AuditAction::OutboxExhausted,
            &record.id.to_string(),
            Some(serde_json::json!({
                "error": error.to_string(),
                "code": error.code(),
            })),
        );
        if let Err(e) = self.store.append_audit(entry).await {
            tracing::error!(error = %e, "audit append failed");
        }
    }

    /// Spawn the relay loop until cancellation.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!("outbox relay started");
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("outbox relay stopping");
                        break;
                    }
                    result = self.run_once() => {
                        match result {
                            Ok(0) => tokio::time::sleep(self.config.idle_interval).await,
                            Ok(_) => {}
                            Err(e) => {
                                tracing::error!(error = %e, "relay cycle failed");
                                tokio::time::sleep(self.config.idle_interval).await;
                            }
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::queue::{ExecutionQueue, InMemoryQueueDriver};
    use crate::engine::storage::{InMemoryStorage, OrganizationStore, OutboxStore};
    use crate::models::{Organization, PlanTier, QueueRunRequest, TriggerType};

    fn request(org: &str) -> QueueRunRequest {
        QueueRunRequest {
            workflow_id: "wf-1".into(),
            organization_id: org.into(),
            user_id: None,
            trigger_type: TriggerType::Webhook,
            trigger_data: None,
        }
    }

    async fn relay_with_org() -> (Arc<OutboxRelay>, Arc<InMemoryStorage>, Arc<ExecutionQueue>) {
        let store = Arc::new(InMemoryStorage::new());
        store
            .put_organization(Organization::new("org-1", "Acme", PlanTier::Starter, "us"))
            .await
            .unwrap();
        let queue = Arc::new(ExecutionQueue::new(
            store.clone(),
            Arc::new(InMemoryQueueDriver::new()),
            true,
        ));
        let relay = Arc::new(OutboxRelay::new(
            store.clone(),
            queue.clone(),
            OutboxRelayConfig::default(),
        ));
        (relay, store, queue)
    }

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(replay_backoff(1), Duration::from_secs(2));
        assert_eq!(replay_backoff(2), Duration::from_secs(4));
        assert_eq!(replay_backoff(3), Duration::from_secs(8));
        assert_eq!(replay_backoff(20), MAX_BACKOFF);
    }

    #[tokio::test]
    async fn pending_rows_dispatch_to_the_queue() {
        let (relay, store, queue) = relay_with_org().await;
        store
            .append_outbox(WebhookOutboxRecord::new(request("org-1")))
            .await
            .unwrap();

        let handled = relay.run_once().await.unwrap();
        assert_eq!(handled, 1);
        assert_eq!(store.count_outbox(OutboxStatus::Dispatched).await.unwrap(), 1);
        assert_eq!(queue.driver().depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn admission_rejection_parks_the_row() {
        let (relay, store, _) = relay_with_org().await;
        // Unknown organization: deterministic admission rejection.
        store
            .append_outbox(WebhookOutboxRecord::new(request("ghost-org")))
            .await
            .unwrap();

        relay.run_once().await.unwrap();
        assert_eq!(store.count_outbox(OutboxStatus::Failed).await.unwrap(), 1);
        let rows = store
            .list_outbox(Some(OutboxStatus::Failed), 10)
            .await
            .unwrap();
        assert!(rows[0].last_error.as_deref().unwrap().contains("organization"));
    }

    #[tokio::test]
    async fn backpressure_reports_past_high_water_mark() {
        let (_, store, queue) = relay_with_org().await;
        let relay = OutboxRelay::new(
            store.clone(),
            queue,
            OutboxRelayConfig {
                high_water_mark: 1,
                ..OutboxRelayConfig::default()
            },
        );
        assert!(!relay.is_backpressured().await);
        for _ in 0..3 {
            store
                .append_outbox(WebhookOutboxRecord::new(request("org-1")))
                .await
                .unwrap();
        }
        assert!(relay.is_backpressured().await);
    }
}
