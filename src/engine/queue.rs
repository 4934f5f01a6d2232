// Execution queue - tenant-aware admission and the pluggable queue driver

//! # Execution Queue
//!
//! [`ExecutionQueue::enqueue`] is the single admission gate for workflow
//! runs. It resolves the organization's quota profile and rejects with
//! typed errors (`EXECUTION_QUOTA_EXCEEDED`, `CONNECTOR_CONCURRENCY_EXCEEDED`,
//! `USAGE_QUOTA_EXCEEDED`, `QUEUE_UNAVAILABLE`) before any state changes;
//! admission then atomically bumps the concurrency and window counters,
//! creates the `queued` execution record, and publishes a job to the
//! driver.
//!
//! Two drivers exist: [`NatsQueueDriver`] (JetStream work queue, durable)
//! and [`InMemoryQueueDriver`] (weighted round-robin across organizations,
//! process-lifetime retention). The in-memory driver only admits traffic
//! when `ENABLE_DEV_IGNORE_QUEUE` is set, and every execution it carries is
//! labeled `durability=in_memory` so queue-health telemetry can surface it.
//!
//! Rate limiting is a sliding one-minute window per organization. Jobs over
//! the window are deferred (delayed publish), not failed, up to one extra
//! window's worth; past that cap admission rejects.

use async_nats::jetstream::{self, consumer, stream};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::models::{
    AuditAction, AuditEntry, Durability, ExecutionRecord, OrganizationQuota, QueueRunRequest,
};
use crate::{Result, SwitchyardError};

use super::storage::{AuditStore, ExecutionStore, OrganizationStore, PlatformStore};

/// One published run job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueJob {
    pub execution_id: Uuid,
    pub request: QueueRunRequest,
    /// Fair-share weight, derived from the organization's plan rank.
    pub weight: u32,
    pub enqueued_at: DateTime<Utc>,
}

/// Queue driver health snapshot, surfaced to the UI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueHealth {
    pub driver: String,
    pub durable: bool,
    pub depth: u64,
}

/// The pluggable queue transport.
#[async_trait]
pub trait QueueDriver: Send + Sync {
    fn name(&self) -> &'static str;
    /// Durable drivers survive process restart; the dev in-memory driver
    /// does not (its jobs live for the process lifetime only).
    fn durable(&self) -> bool;
    async fn publish(&self, job: QueueJob) -> Result<()>;
    /// Claim the next ready job, or `None` when the queue is empty.
    async fn next(&self) -> Result<Option<QueueJob>>;
    async fn depth(&self) -> Result<u64>;
}

// ---------------------------------------------------------------------
// In-memory driver (dev mode)
// ---------------------------------------------------------------------

/// Non-durable driver: per-organization FIFO lanes served by weighted
/// round-robin. An organization's jobs never starve another tenant; within
/// a lane, strict FIFO.
#[derive(Default)]
pub struct InMemoryQueueDriver {
    lanes: Mutex<InMemoryLanes>,
}

#[derive(Default)]
struct InMemoryLanes {
    by_org: HashMap<String, VecDeque<QueueJob>>,
    /// Rotation order; organizations are appended on first publish.
    rotation: Vec<String>,
    cursor: usize,
    /// Jobs served to the current organization in this rotation slot.
    served: u32,
}

impl InMemoryQueueDriver {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueDriver for InMemoryQueueDriver {
    fn name(&self) -> &'static str {
        "in_memory"
    }

    fn durable(&self) -> bool {
        false
    }

    async fn publish(&self, job: QueueJob) -> Result<()> {
        let mut lanes = self.lanes.lock().await;
        let org = job.request.organization_id.clone();
        if !lanes.by_org.contains_key(&org) {
            lanes.rotation.push(org.clone());
        }
        lanes.by_org.entry(org).or_default().push_back(job);
        Ok(())
    }

    async fn next(&self) -> Result<Option<QueueJob>> {
        let mut lanes = self.lanes.lock().await;
        if lanes.rotation.is_empty() {
            return Ok(None);
        }
        let org_count = lanes.rotation.len();
        // Visit at most one full rotation looking for a non-empty lane.
        for _ in 0..org_count {
            let cursor = lanes.cursor % lanes.rotation.len();
            let org = lanes.rotation[cursor].clone();
            let (job, weight) = match lanes.by_org.get_mut(&org) {
                Some(lane) => match lane.pop_front() {
                    Some(job) => {
                        let weight = job.weight.max(1);
                        (Some(job), weight)
                    }
                    None => (None, 1),
                },
                None => (None, 1),
            };
            match job {
                Some(job) => {
                    // Higher-weight organizations get more consecutive
                    // slots before the cursor moves on.
                    lanes.served += 1;
                    if lanes.served >= weight {
                        lanes.cursor = (cursor + 1) % lanes.rotation.len();
                        lanes.served = 0;
                    }
                    return Ok(Some(job));
                }
                None => {
                    lanes.cursor = (cursor + 1) % lanes.rotation.len();
                    lanes.served = 0;
                }
            }
        }
        Ok(None)
    }

    async fn depth(&self) -> Result<u64> {
        let lanes = self.lanes.lock().await;
        Ok(lanes.by_org.values().map(|l| l.len() as u64).sum())
    }
}

// ---------------------------------------------------------------------
// NATS JetStream driver (durable)
// ---------------------------------------------------------------------

const STREAM_NAME: &str = "SWITCHYARD_EXECUTIONS";
const SUBJECT_PREFIX: &str = "switchyard.executions";
const CONSUMER_NAME: &str = "dispatcher";

/// Durable work-queue driver on NATS JetStream.
pub struct NatsQueueDriver {
    jetstream: jetstream::Context,
    consumer: consumer::PullConsumer,
}

impl NatsQueueDriver {
    /// Connect, ensure the stream and the shared durable consumer exist.
    pub async fn connect(nats_url: &str) -> Result<Self> {
        let client = async_nats::connect(nats_url)
            .await
            .map_err(|e| SwitchyardError::QueueUnavailable(format!("nats connect: {e}")))?;
        let jetstream = jetstream::new(client);

        let stream = jetstream
            .get_or_create_stream(stream::Config {
                name: STREAM_NAME.to_string(),
                subjects: vec![format!("{SUBJECT_PREFIX}.>")],
                retention: stream::RetentionPolicy::WorkQueue,
                storage: stream::StorageType::File,
                num_replicas: 1,
                duplicate_window: Duration::from_secs(120),
                ..Default::default()
            })
            .await
            .map_err(|e| SwitchyardError::QueueUnavailable(format!("stream setup: {e}")))?;

        let consumer = stream
            .get_or_create_consumer(
                CONSUMER_NAME,
                consumer::pull::Config {
                    durable_name: Some(CONSUMER_NAME.to_string()),
                    ack_policy: consumer::AckPolicy::Explicit,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| SwitchyardError::QueueUnavailable(format!("consumer setup: {e}")))?;

        Ok(NatsQueueDriver {
            jetstream,
            consumer,
        })
    }
}

#[async_trait]
impl QueueDriver for NatsQueueDriver {
    fn name(&self) -> &'static str {
        "nats_jetstream"
    }

    fn durable(&self) -> bool {
        true
    }

    async fn publish(&self, job: QueueJob) -> Result<()> {
        let subject = format!("{SUBJECT_PREFIX}.{}", job.request.organization_id);
        let payload = serde_json::to_vec(&job)?;
        let ack = self
            .jetstream
            .publish(subject, payload.into())
            .await
            .map_err(|e| SwitchyardError::QueueUnavailable(format!("publish: {e}")))?;
        ack.await
            .map_err(|e| SwitchyardError::QueueUnavailable(format!("publish ack: {e}")))?;
        Ok(())
    }

    async fn next(&self) -> Result<Option<QueueJob>> {
        let mut messages = self
            .consumer
            .fetch()
            .max_messages(1)
            .expires(Duration::from_secs(2))
            .messages()
            .await
            .map_err(|e| SwitchyardError::QueueUnavailable(format!("fetch: {e}")))?;

        while let Some(message) = messages.next().await {
            let message =
                message.map_err(|e| SwitchyardError::QueueUnavailable(format!("receive: {e}")))?;
            // Ack on receipt: the execution-store lease makes re-processing
            // of a redelivered job a no-op, and acking here keeps a
            // poisoned payload from wedging the work queue.
            let _ = message.ack().await;
            match serde_json::from_slice::<QueueJob>(&message.payload) {
                Ok(job) => return Ok(Some(job)),
                Err(e) => {
                    tracing::error!(error = %e, "dropping undecodable queue payload");
                    continue;
                }
            }
        }
        Ok(None)
    }

    async fn depth(&self) -> Result<u64> {
        // Cached consumer info is enough for health telemetry.
        Ok(self.consumer.cached_info().num_pending)
    }
}

// ---------------------------------------------------------------------
// Sliding-window rate limiter
// ---------------------------------------------------------------------

/// Per-organization sliding one-minute window.
#[derive(Default)]
pub struct RateLimiter {
    windows: DashMap<String, VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record-and-check: returns `true` when the event fits the window.
    pub fn try_admit(&self, organization_id: &str, max_per_minute: u64) -> bool {
        let now = Instant::now();
        let mut window = self.windows.entry(organization_id.to_string()).or_default();
        while let Some(front) = window.front() {
            if now.duration_since(*front) > Duration::from_secs(60) {
                window.pop_front();
            } else {
                break;
            }
        }
        if (window.len() as u64) < max_per_minute {
            window.push_back(now);
            true
        } else {
            false
        }
    }
}

// ---------------------------------------------------------------------
// The admission service
// ---------------------------------------------------------------------

/// Overage tolerance on metered resources before admission refuses runs.
const USAGE_OVERAGE_TOLERANCE: f64 = 1.10;
/// Delay applied to rate-deferred jobs before publish.
const DEFER_DELAY: Duration = Duration::from_secs(15);

/// Tenant-aware admission front of the execution pipeline.
pub struct ExecutionQueue {
    store: Arc<dyn PlatformStore>,
    driver: Arc<dyn QueueDriver>,
    limiter: RateLimiter,
    /// In-flight deferred publishes per organization.
    deferrals: DashMap<String, Arc<AtomicUsize>>,
    allow_in_memory: bool,
}

impl ExecutionQueue {
    pub fn new(
        store: Arc<dyn PlatformStore>,
        driver: Arc<dyn QueueDriver>,
        allow_in_memory: bool,
    ) -> Self {
        ExecutionQueue {
            store,
            driver,
            limiter: RateLimiter::new(),
            deferrals: DashMap::new(),
            allow_in_memory,
        }
    }

    pub fn driver(&self) -> Arc<dyn QueueDriver> {
        self.driver.clone()
    }

    pub async fn health(&self) -> QueueHealth {
        QueueHealth {
            driver: self.driver.name().to_string(),
            durable: self.driver.durable(),
            depth: self.driver.depth().await.unwrap_or(0),
        }
    }

    /// Admit one run request. Returns the new execution id.
    pub async fn enqueue(&self, request: QueueRunRequest) -> Result<Uuid> {
        if request.organization_id.is_empty() {
            return Err(SwitchyardError::OrganizationRequired);
        }
        let organization = self
            .store
            .get_organization(&request.organization_id)
            .await?
            .ok_or(SwitchyardError::OrganizationRequired)?;

        // Non-durable driver only serves dev mode.
        if !self.driver.durable() && !self.allow_in_memory {
            return Err(SwitchyardError::QueueUnavailable(
                "queue driver is non-durable and durability is required".into(),
            ));
        }

        // Quota profile, window rolled to now.
        let now = Utc::now();
        let mut quota = match self.store.get_quota(&organization.id).await? {
            Some(quota) => quota,
            None => {
                let fresh = OrganizationQuota::for_month(&organization.id, organization.plan, now);
                self.store.put_quota(fresh.clone()).await?;
                fresh
            }
        };
        if now >= quota.period_end {
            quota.roll_window(now);
            self.store.put_quota(quota.clone()).await?;
        }

        self.check_admission(&quota, &request).await?;

        // Sliding-window rate limit: over-limit jobs defer, then reject.
        let deferred = if self
            .limiter
            .try_admit(&organization.id, quota.limits.max_executions_per_minute)
        {
            false
        } else {
            let counter = self
                .deferrals
                .entry(organization.id.clone())
                .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
                .clone();
            let cap = quota.limits.max_executions_per_minute as usize;
            if counter.load(Ordering::SeqCst) >= cap {
                return Err(SwitchyardError::ExecutionQuotaExceeded {
                    current: quota.usage.executions_in_current_window
                        + counter.load(Ordering::SeqCst) as u64,
                    limit: quota.limits.max_executions_per_minute,
                });
            }
            counter.fetch_add(1, Ordering::SeqCst);
            true
        };

        // Point of no return: counters move, the record exists, the job is
        // published (now or after the deferral delay).
        self.store
            .adjust_concurrent_executions(&organization.id, 1)
            .await?;
        self.store
            .record_admitted_execution(&organization.id)
            .await?;

        let durability = if self.driver.durable() {
            Durability::Durable
        } else {
            Durability::InMemory
        };
        let record = ExecutionRecord::queued(&request, durability);
        let execution_id = record.id;
        self.store.create_execution(record).await?;

        let job = QueueJob {
            execution_id,
            request: request.clone(),
            weight: u32::from(organization.plan.rank()) + 1,
            enqueued_at: now,
        };

        if deferred {
            let driver = self.driver.clone();
            let counter = self
                .deferrals
                .get(&organization.id)
                .map(|c| c.clone())
                .unwrap_or_else(|| Arc::new(AtomicUsize::new(1)));
            tokio::spawn(async move {
                tokio::time::sleep(DEFER_DELAY).await;
                counter.fetch_sub(1, Ordering::SeqCst);
                if let Err(e) = driver.publish(job).await {
                    tracing::error!(error = %e, "deferred publish failed");
                }
            });
            tracing::warn!(
                organization = %organization.id,
                execution = %execution_id,
                "rate window full; run deferred"
            );
        } else {
            self.driver.publish(job).await?;
        }

        self.store
            .append_audit(AuditEntry::new(
                &organization.id,
                request.user_id.as_deref().unwrap_or("system"),
                AuditAction::ExecutionEnqueued,
                &execution_id.to_string(),
                None,
            ))
            .await?;

        Ok(execution_id)
    }

    /// Pure admission checks; no state changes.
    async fn check_admission(
        &self,
        quota: &OrganizationQuota,
        request: &QueueRunRequest,
    ) -> Result<()> {
        let limits = &quota.limits;
        let usage = &quota.usage;

        if usage.executions_this_month >= limits.max_executions_per_month {
            self.audit_rejection(request, "EXECUTION_QUOTA_EXCEEDED").await;
            return Err(SwitchyardError::ExecutionQuotaExceeded {
                current: usage.executions_this_month,
                limit: limits.max_executions_per_month,
            });
        }

        if usage.concurrent_executions >= limits.max_concurrent_executions {
            self.audit_rejection(request, "CONNECTOR_CONCURRENCY_EXCEEDED")
                .await;
            return Err(SwitchyardError::ConnectorConcurrencyExceeded {
                current: usage.concurrent_executions,
                limit: limits.max_concurrent_executions,
            });
        }

        let api_ceiling =
            (limits.max_api_calls_per_month as f64 * USAGE_OVERAGE_TOLERANCE) as u64;
        if usage.api_calls_this_month > api_ceiling {
            self.audit_rejection(request, "USAGE_QUOTA_EXCEEDED").await;
            return Err(SwitchyardError::UsageQuotaExceeded {
                resource: "api_calls".into(),
                current: usage.api_calls_this_month,
                limit: limits.max_api_calls_per_month,
            });
        }
        let token_ceiling = (limits.max_tokens_per_month as f64 * USAGE_OVERAGE_TOLERANCE) as u64;
        if usage.tokens_this_month > token_ceiling {
            self.audit_rejection(request, "USAGE_QUOTA_EXCEEDED").await;
            return Err(SwitchyardError::UsageQuotaExceeded {
                resource: "tokens".into(),
                current: usage.tokens_this_month,
                limit: limits.max_tokens_per_month,
            });
        }

        Ok(())
    }

    async fn audit_rejection(&self, request: &QueueRunRequest, code: &str) {
        let entry = AuditEntry::new(
            &request.organization_id,
            request.user_id.as_deref().unwrap_or("system"),
            AuditAction::ExecutionRejected,
            &request.workflow_id,
            Some(serde_json::json!({ "code": code })),
        );
        if let Err(e) = self.store.append_audit(entry).await {
            tracing::error!(error = %e, "audit append failed");
        }
    }
}
