// Polling scheduler - interval triggers with watermarks and dedupe

//! # Polling Scheduler
//!
//! Maintains a min-heap of active polling triggers ordered by
//! `next_poll_at`. Each cycle pops due triggers, resolves credentials,
//! invokes the connector's poll method with a `since` watermark, dedupes
//! the returned items, and stages fresh ones in the outbox.
//!
//! Scheduling rules that matter:
//!
//! - missed ticks do NOT stack: the next poll is computed from `now`, not
//!   from the missed target (`next = max(previous_next, now + interval)`);
//! - the trigger's runtime state (watermark + dedupe ring) persists in one
//!   write, atomically with the ring insertions that poll produced;
//! - when the outbox is past its high-water mark the partition throttles
//!   with an exponential delay and emits a warning instead of polling.
//!
//! One scheduler instance owns one partition; dedupe rings and watermarks
//! are mutated only by their owning partition.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::{json, Value};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::connectors::{derive_poll_method, ExecuteOptions};
use crate::models::{
    PollingTriggerConfig, QueueRunRequest, TriggerData, TriggerRegistration, TriggerType,
    WebhookOutboxRecord, WorkflowTrigger,
};
use crate::webhooks::event_hash;
use crate::Result;

use super::credentials::CredentialResolver;
use super::outbox::OutboxRelay;
use super::registry::ConnectorRegistry;
use super::storage::{OrganizationStore, OutboxStore, PlatformStore, TriggerStore};

/// Scheduler tuning.
#[derive(Debug, Clone)]
pub struct PollingSchedulerConfig {
    /// Partition label for logs and lease scoping.
    pub partition: String,
    /// Sleep between scheduler cycles.
    pub tick_interval: Duration,
    /// Base throttle delay under outbox backpressure; doubles per
    /// consecutive throttled cycle up to 2^6.
    pub backpressure_base: Duration,
}

impl Default for PollingSchedulerConfig {
    fn default() -> Self {
        PollingSchedulerConfig {
            partition: "p0".to_string(),
            tick_interval: Duration::from_secs(5),
            backpressure_base: Duration::from_secs(2),
        }
    }
}

/// The scheduler service.
pub struct PollingScheduler {
    store: Arc<dyn PlatformStore>,
    registry: Arc<ConnectorRegistry>,
    credentials: Arc<CredentialResolver>,
    relay: Arc<OutboxRelay>,
    config: PollingSchedulerConfig,
}

impl PollingScheduler {
    pub fn new(
        store: Arc<dyn PlatformStore>,
        registry: Arc<ConnectorRegistry>,
        credentials: Arc<CredentialResolver>,
        relay: Arc<OutboxRelay>,
        config: PollingSchedulerConfig,
    ) -> Self {
        PollingScheduler {
            store,
            registry,
            credentials,
            relay,
            config,
        }
    }

    /// One scheduler cycle: drain every due trigger. Returns how many
    /// triggers were polled.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<usize> {
        let due = self.store.list_due_polling(now).await?;
        if due.is_empty() {
            return Ok(0);
        }

        // Min-heap over (next_poll_at, trigger id) so the most overdue
        // trigger polls first.
        let mut heap: BinaryHeap<Reverse<(DateTime<Utc>, String)>> = due
            .iter()
            .filter_map(|t| {
                t.polling()
                    .map(|p| Reverse((p.next_poll_at.unwrap_or(now), t.id.clone())))
            })
            .collect();
        let mut by_id: std::collections::HashMap<String, WorkflowTrigger> =
            due.into_iter().map(|t| (t.id.clone(), t)).collect();

        let mut polled = 0;
        while let Some(Reverse((_, id))) = heap.pop() {
            let Some(trigger) = by_id.remove(&id) else { continue };
            if let Err(e) = self.poll_trigger(trigger, now).await {
                tracing::warn!(trigger = %id, error = %e, "poll cycle failed");
            }
            polled += 1;
        }
        Ok(polled)
    }

    async fn poll_trigger(&self, mut trigger: WorkflowTrigger, now: DateTime<Utc>) -> Result<()> {
        let Some(polling) = trigger.polling().cloned() else {
            return Ok(());
        };

        let items = match self.fetch_items(&trigger, &polling).await {
            Ok(items) => items,
            Err(e) => {
                // A failed poll still advances the schedule so one broken
                // trigger cannot hot-loop the partition.
                self.advance_schedule(&mut trigger, &polling, now).await?;
                return Err(e);
            }
        };

        let mut fresh = 0usize;
        for item in items {
            let token = dedupe_token_for(&trigger, &polling, &item);
            if !trigger.dedupe.insert(&token) {
                continue;
            }
            fresh += 1;
            let request = QueueRunRequest {
                workflow_id: trigger.workflow_id.clone(),
                organization_id: trigger.organization_id.clone(),
                user_id: trigger.user_id.clone(),
                trigger_type: TriggerType::Polling,
                trigger_data: Some(TriggerData {
                    app_id: Some(trigger.app_id.clone()),
                    trigger_id: Some(trigger.trigger_id.clone()),
                    payload: item,
                    headers: None,
                    dedupe_token: Some(token),
                    timestamp: now,
                    source: "polling".to_string(),
                }),
            };
            self.store
                .append_outbox(WebhookOutboxRecord::new(request))
                .await?;
        }
        if fresh > 0 {
            trigger.last_triggered_at = Some(now);
            tracing::debug!(trigger = %trigger.id, fresh, "poll produced events");
        }

        self.advance_schedule(&mut trigger, &polling, now).await
    }

    /// Invoke the connector poll method with the `since` watermark.
    async fn fetch_items(
        &self,
        trigger: &WorkflowTrigger,
        polling: &PollingTriggerConfig,
    ) -> Result<Vec<Value>> {
        let organization = self
            .store
            .get_organization(&trigger.organization_id)
            .await?
            .ok_or(crate::SwitchyardError::OrganizationRequired)?;

        let connection_id = trigger
            .metadata
            .get("connection_id")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                crate::SwitchyardError::MissingConnection(format!("trigger {}", trigger.id))
            })?;
        let bundle = self
            .credentials
            .resolve_connection(connection_id, &organization)
            .await?;

        let client = self
            .registry
            .get_api_client(&trigger.app_id)
            .ok_or_else(|| crate::SwitchyardError::RuntimeUnavailable {
                connector: trigger.app_id.clone(),
                function: trigger.trigger_id.clone(),
            })?;

        let method = polling
            .poll_method
            .clone()
            .unwrap_or_else(|| derive_poll_method(&trigger.trigger_id));

        // Registration parameters enriched with the watermark.
        let mut params = trigger
            .metadata
            .get("parameters")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        if let Some(last_poll) = polling.last_poll {
            params.insert("since".to_string(), json!(last_poll.to_rfc3339()));
        }

        let opts = ExecuteOptions::new(bundle, "poll", &trigger.id);
        let result = client.poll(&method, &Value::Object(params), &opts).await;
        Ok(result.items)
    }

    /// Persist watermark + schedule + dedupe ring in one write. Missed
    /// ticks compute from `now`.
    async fn advance_schedule(
        &self,
        trigger: &mut WorkflowTrigger,
        polling: &PollingTriggerConfig,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let interval = ChronoDuration::seconds(polling.interval_seconds.max(1) as i64);
        let from_now = now + interval;
        let next = match polling.next_poll_at {
            Some(previous) => previous.max(from_now),
            None => from_now,
        };
        if let TriggerRegistration::Polling(p) = &mut trigger.registration {
            p.last_poll = Some(now);
            p.next_poll_at = Some(next);
        }
        self.store.put_trigger(trigger.clone()).await?;
        Ok(())
    }

    /// Spawn the scheduler loop until cancellation.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        use tokio_stream::{wrappers::IntervalStream, StreamExt};

        tokio::spawn(async move {
            tracing::info!(partition = %self.config.partition, "polling scheduler started");
            let mut ticks = IntervalStream::new(tokio::time::interval(self.config.tick_interval));
            let mut throttle_level: u32 = 0;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!(partition = %self.config.partition, "polling scheduler stopping");
                        break;
                    }
                    _ = ticks.next() => {}
                }

                if self.relay.is_backpressured().await {
                    // Exponential throttle while the outbox drains.
                    throttle_level = (throttle_level + 1).min(6);
                    let delay = self.config.backpressure_base * 2u32.pow(throttle_level);
                    tracing::warn!(
                        partition = %self.config.partition,
                        delay_secs = delay.as_secs(),
                        "polling throttled by outbox backpressure"
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => continue,
                    }
                }
                throttle_level = 0;

                if let Err(e) = self.run_once(Utc::now()).await {
                    tracing::error!(error = %e, "polling cycle failed");
                }
            }
        })
    }
}

/// Dedupe token: `md5(triggerId + "-" + item[dedupeKey])` when the trigger
/// declares a dedupe key, else the generic event hash over the canonical
/// item rendering.
fn dedupe_token_for(
    trigger: &WorkflowTrigger,
    polling: &PollingTriggerConfig,
    item: &Value,
) -> String {
    if let Some(key) = &polling.dedupe_key {
        if let Some(field) = item.get(key) {
            let rendered = match field {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            let input = format!("{}-{}", trigger.id, rendered);
            return format!("{:x}", md5::compute(input.as_bytes()));
        }
    }
    event_hash(
        &trigger.workflow_id,
        &trigger.id,
        &trigger.trigger_id,
        "polling",
        &item.to_string(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::{ClientResult, ConnectorClient, PollResult};
    use crate::engine::credentials::{CredentialBundle, CredentialCipher};
    use crate::engine::queue::{ExecutionQueue, InMemoryQueueDriver};
    use crate::engine::registry::{ConnectorManifest, ConnectorRegistry};
    use crate::engine::storage::{
        ConnectionStore, InMemoryStorage, OrganizationStore, OutboxStore, TriggerStore,
    };
    use crate::models::{Connection, DedupeRing, Organization, OutboxStatus, PlanTier};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Poll client returning scripted pages per call.
    struct PagedClient {
        pages: Mutex<Vec<Vec<Value>>>,
        seen_since: Mutex<Vec<Option<String>>>,
    }

    #[async_trait]
    impl ConnectorClient for PagedClient {
        fn connector_id(&self) -> &str {
            "sheets"
        }

        async fn test_connection(&self, _credentials: &CredentialBundle) -> ClientResult {
            ClientResult::ok(json!({}), Duration::ZERO)
        }

        async fn execute(
            &self,
            _function_id: &str,
            _params: &Value,
            _opts: &ExecuteOptions,
        ) -> ClientResult {
            ClientResult::failed("not an action client", Some(400))
        }

        async fn poll(&self, method: &str, params: &Value, _opts: &ExecuteOptions) -> PollResult {
            assert_eq!(method, "pollNewRows");
            self.seen_since
                .lock()
                .unwrap()
                .push(params.get("since").and_then(Value::as_str).map(String::from));
            let mut pages = self.pages.lock().unwrap();
            PollResult {
                items: if pages.is_empty() { Vec::new() } else { pages.remove(0) },
            }
        }
    }

    async fn scheduler_with(
        pages: Vec<Vec<Value>>,
    ) -> (PollingScheduler, Arc<InMemoryStorage>, Arc<PagedClient>) {
        let store = Arc::new(InMemoryStorage::new());
        store
            .put_organization(Organization::new("org-1", "Acme", PlanTier::Starter, "us"))
            .await
            .unwrap();

        let cipher =
            CredentialCipher::from_master_key("AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=")
                .unwrap();
        let sealed = cipher.seal(&json!({"api_key": "k"})).unwrap();
        store
            .put_connection(Connection {
                id: "conn-1".into(),
                organization_id: "org-1".into(),
                user_id: "u-1".into(),
                connector_id: "sheets".into(),
                credentials_ciphertext: sealed,
                metadata: serde_json::Map::new(),
                additional_config: None,
                created_at: Utc::now(),
                updated_at: Utc::now(),
                revoked: false,
            })
            .await
            .unwrap();

        let client = Arc::new(PagedClient {
            pages: Mutex::new(pages),
            seen_since: Mutex::new(Vec::new()),
        });
        let manifest: ConnectorManifest = serde_json::from_value(json!({
            "connectors": [{
                "id": "sheets",
                "name": "Sheets",
                "availability": "stable",
                "triggers": [{"id": "new_rows"}]
            }]
        }))
        .unwrap();
        let mut registry = ConnectorRegistry::new(manifest);
        registry.bind_client(client.clone());

        let credentials = Arc::new(CredentialResolver::new(
            store.clone(),
            CredentialCipher::from_master_key("AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=")
                .unwrap(),
        ));
        let queue = Arc::new(ExecutionQueue::new(
            store.clone(),
            Arc::new(InMemoryQueueDriver::new()),
            true,
        ));
        let relay = Arc::new(OutboxRelay::new(
            store.clone(),
            queue,
            Default::default(),
        ));
        let scheduler = PollingScheduler::new(
            store.clone(),
            Arc::new(registry),
            credentials,
            relay,
            PollingSchedulerConfig::default(),
        );
        (scheduler, store, client)
    }

    fn polling_trigger(dedupe_key: Option<&str>) -> WorkflowTrigger {
        let mut metadata = serde_json::Map::new();
        metadata.insert("connection_id".into(), json!("conn-1"));
        WorkflowTrigger {
            id: "trg-p1".into(),
            workflow_id: "wf-1".into(),
            organization_id: "org-1".into(),
            user_id: Some("u-1".into()),
            app_id: "sheets".into(),
            trigger_id: "new_rows".into(),
            registration: TriggerRegistration::Polling(PollingTriggerConfig {
                interval_seconds: 60,
                last_poll: None,
                next_poll_at: None,
                dedupe_key: dedupe_key.map(String::from),
                poll_method: None,
            }),
            active: true,
            filters: Default::default(),
            metadata,
            dedupe: DedupeRing::default(),
            created_at: Utc::now(),
            last_triggered_at: None,
        }
    }

    #[tokio::test]
    async fn overlapping_pages_dedupe_across_polls() {
        // Page 1: A, B. Page 2: B, C. Outbox must see exactly A, B, C.
        let (scheduler, store, _) = scheduler_with(vec![
            vec![json!({"id": "A"}), json!({"id": "B"})],
            vec![json!({"id": "B"}), json!({"id": "C"})],
        ])
        .await;
        store.put_trigger(polling_trigger(Some("id"))).await.unwrap();

        let now = Utc::now();
        assert_eq!(scheduler.run_once(now).await.unwrap(), 1);
        assert_eq!(store.count_outbox(OutboxStatus::Pending).await.unwrap(), 2);

        // Force the next poll due now.
        let mut t = store.get_trigger("trg-p1").await.unwrap().unwrap();
        if let TriggerRegistration::Polling(p) = &mut t.registration {
            p.next_poll_at = Some(now);
        }
        store.put_trigger(t).await.unwrap();

        assert_eq!(scheduler.run_once(now).await.unwrap(), 1);
        assert_eq!(store.count_outbox(OutboxStatus::Pending).await.unwrap(), 3);

        let rows = store.list_outbox(None, 10).await.unwrap();
        let ids: Vec<String> = rows
            .iter()
            .map(|r| {
                r.payload.trigger_data.as_ref().unwrap().payload["id"]
                    .as_str()
                    .unwrap()
                    .to_string()
            })
            .collect();
        assert_eq!(ids, vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn since_watermark_follows_last_poll() {
        let (scheduler, store, client) = scheduler_with(vec![vec![], vec![]]).await;
        store.put_trigger(polling_trigger(Some("id"))).await.unwrap();

        let now = Utc::now();
        scheduler.run_once(now).await.unwrap();
        // First poll: no watermark yet.
        assert_eq!(client.seen_since.lock().unwrap()[0], None);

        let mut t = store.get_trigger("trg-p1").await.unwrap().unwrap();
        if let TriggerRegistration::Polling(p) = &mut t.registration {
            assert_eq!(p.last_poll, Some(now));
            p.next_poll_at = Some(now);
        }
        store.put_trigger(t).await.unwrap();

        scheduler.run_once(now).await.unwrap();
        // Second poll carries the first poll's watermark.
        let since = client.seen_since.lock().unwrap()[1].clone();
        assert!(since.is_some());
    }

    #[tokio::test]
    async fn missed_ticks_do_not_stack() {
        let (scheduler, store, _) = scheduler_with(vec![vec![]]).await;
        let mut trigger = polling_trigger(None);
        // The trigger is long overdue: next_poll_at far in the past.
        if let TriggerRegistration::Polling(p) = &mut trigger.registration {
            p.next_poll_at = Some(Utc::now() - ChronoDuration::hours(10));
        }
        store.put_trigger(trigger).await.unwrap();

        let now = Utc::now();
        scheduler.run_once(now).await.unwrap();

        let stored = store.get_trigger("trg-p1").await.unwrap().unwrap();
        let next = stored.polling().unwrap().next_poll_at.unwrap();
        // Next poll is interval-from-now, not a backlog of missed ticks.
        assert!(next >= now + ChronoDuration::seconds(60));
        assert!(next <= now + ChronoDuration::seconds(61));
    }
}
