// Storage abstraction for the platform
// Persistence is the synchronization point for every crash-consistent step

//! # Storage Abstraction Layer
//!
//! One trait per logical table group, composed into [`PlatformStore`].
//! Services depend on `Arc<dyn PlatformStore>` and never on a concrete
//! backend; [`InMemoryStorage`] backs development and tests, the Postgres
//! backend (`engine::postgres`) backs production.
//!
//! Contract notes that matter for correctness:
//!
//! - `adjust_concurrent_executions` is atomic and saturates at zero; the
//!   quota invariant `usage.concurrent_executions >= 0` is enforced here,
//!   not by callers.
//! - `claim_pending_outbox` takes a row lease so multiple relay workers
//!   never double-dispatch one record.
//! - `claim_execution` grants at most one worker per execution.
//! - `put_trigger` replaces the whole record, which persists dedupe rings
//!   and polling watermarks atomically with their trigger.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::{
    AuditEntry, Connection, ExecutionRecord, Organization, OrganizationQuota, OutboxStatus,
    TriggerRegistration, UsageTracking, WebhookOutboxRecord, Workflow, WorkflowTrigger,
};
use crate::Result;

/// Counter deltas applied by one usage increment.
#[derive(Debug, Clone, Copy, Default)]
pub struct UsageDelta {
    pub api_calls: u64,
    pub tokens: u64,
    pub workflow_runs: u64,
    pub storage_bytes: u64,
    pub cost_cents: u64,
}

/// Workflow definitions.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    async fn put_workflow(&self, workflow: Workflow) -> Result<Workflow>;
    async fn get_workflow(&self, id: &str) -> Result<Option<Workflow>>;
    async fn list_workflows(&self, organization_id: &str) -> Result<Vec<Workflow>>;
    async fn delete_workflow(&self, id: &str) -> Result<bool>;
}

/// Organizations and their quota profiles.
#[async_trait]
pub trait OrganizationStore: Send + Sync {
    async fn put_organization(&self, organization: Organization) -> Result<Organization>;
    async fn get_organization(&self, id: &str) -> Result<Option<Organization>>;
    async fn put_quota(&self, quota: OrganizationQuota) -> Result<OrganizationQuota>;
    async fn get_quota(&self, organization_id: &str) -> Result<Option<OrganizationQuota>>;

    /// Atomically adjust the concurrent-execution counter, saturating at
    /// zero. Returns the post-adjustment value.
    async fn adjust_concurrent_executions(&self, organization_id: &str, delta: i64) -> Result<u64>;

    /// Count one admitted run against the monthly and per-minute windows.
    async fn record_admitted_execution(&self, organization_id: &str) -> Result<()>;

    /// Atomically add metered API usage to the organization's window
    /// counters.
    async fn add_quota_usage(
        &self,
        organization_id: &str,
        api_calls: u64,
        tokens: u64,
    ) -> Result<()>;
}

/// Stored connections.
#[async_trait]
pub trait ConnectionStore: Send + Sync {
    async fn put_connection(&self, connection: Connection) -> Result<Connection>;
    async fn get_connection(&self, id: &str) -> Result<Option<Connection>>;
    async fn list_connections(
        &self,
        organization_id: &str,
        user_id: &str,
    ) -> Result<Vec<Connection>>;
    async fn revoke_connection(&self, id: &str) -> Result<bool>;
}

/// Trigger registrations (webhook + polling, unified).
#[async_trait]
pub trait TriggerStore: Send + Sync {
    async fn put_trigger(&self, trigger: WorkflowTrigger) -> Result<WorkflowTrigger>;
    async fn get_trigger(&self, id: &str) -> Result<Option<WorkflowTrigger>>;
    async fn get_trigger_by_endpoint(&self, endpoint_id: &str) -> Result<Option<WorkflowTrigger>>;
    async fn list_triggers(&self, organization_id: Option<&str>) -> Result<Vec<WorkflowTrigger>>;
    /// Active polling triggers whose `next_poll_at` is due.
    async fn list_due_polling(&self, now: DateTime<Utc>) -> Result<Vec<WorkflowTrigger>>;
    async fn set_trigger_active(&self, id: &str, active: bool) -> Result<bool>;
    async fn delete_trigger(&self, id: &str) -> Result<bool>;
}

/// The webhook outbox.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    async fn append_outbox(&self, record: WebhookOutboxRecord) -> Result<WebhookOutboxRecord>;

    /// Claim up to `limit` pending rows under a lease. Rows stay claimed
    /// until the lease expires or the claimer resolves them.
    async fn claim_pending_outbox(
        &self,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<WebhookOutboxRecord>>;

    async fn mark_outbox_dispatched(&self, id: &Uuid) -> Result<()>;

    /// Record a dispatch failure. Non-terminal failures return the row to
    /// `pending` for replay; terminal ones park it as `failed`.
    async fn mark_outbox_failed(&self, id: &Uuid, error: &str, terminal: bool) -> Result<()>;

    async fn count_outbox(&self, status: OutboxStatus) -> Result<u64>;
    async fn list_outbox(
        &self,
        status: Option<OutboxStatus>,
        limit: usize,
    ) -> Result<Vec<WebhookOutboxRecord>>;

    /// Admin replay: `failed -> pending`, attempts reset.
    async fn requeue_outbox(&self, id: &Uuid) -> Result<bool>;

    /// Retention sweep: drop dispatched rows older than the cutoff.
    async fn delete_outbox_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// Execution records.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn create_execution(&self, record: ExecutionRecord) -> Result<ExecutionRecord>;
    async fn get_execution(&self, id: &Uuid) -> Result<Option<ExecutionRecord>>;
    /// Incremental persistence; called after every node completes and at
    /// terminal transitions.
    async fn update_execution(&self, record: ExecutionRecord) -> Result<ExecutionRecord>;
    /// At-most-one-worker lease. True when this worker now owns the run.
    async fn claim_execution(&self, id: &Uuid, worker: &str, lease: Duration) -> Result<bool>;
    async fn list_executions(
        &self,
        organization_id: &str,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>>;
    /// Flag an execution for cancellation; observed at node boundaries.
    async fn request_cancel(&self, id: &Uuid) -> Result<bool>;
    async fn is_cancel_requested(&self, id: &Uuid) -> Result<bool>;
}

/// Per-month usage counters.
#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Apply deltas transactionally and return the post-increment row.
    async fn add_usage(
        &self,
        user_id: &str,
        organization_id: &str,
        year: i32,
        month: u32,
        delta: UsageDelta,
    ) -> Result<UsageTracking>;
    async fn get_usage(
        &self,
        user_id: &str,
        organization_id: &str,
        year: i32,
        month: u32,
    ) -> Result<Option<UsageTracking>>;
    async fn list_usage_for_month(&self, year: i32, month: u32) -> Result<Vec<UsageTracking>>;
}

/// Append-only audit trail.
#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn append_audit(&self, entry: AuditEntry) -> Result<()>;
    async fn list_audit(&self, organization_id: &str, limit: usize) -> Result<Vec<AuditEntry>>;
}

/// The composed storage surface services depend on.
pub trait PlatformStore:
    WorkflowStore
    + OrganizationStore
    + ConnectionStore
    + TriggerStore
    + OutboxStore
    + ExecutionStore
    + UsageStore
    + AuditStore
{
}

impl<T> PlatformStore for T where
    T: WorkflowStore
        + OrganizationStore
        + ConnectionStore
        + TriggerStore
        + OutboxStore
        + ExecutionStore
        + UsageStore
        + AuditStore
{
}

// ---------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------

/// Development/test backend. Concurrent maps for most tables; quota rows
/// live behind an `RwLock` so check-and-increment stays atomic.
#[derive(Default)]
pub struct InMemoryStorage {
    workflows: DashMap<String, Workflow>,
    organizations: DashMap<String, Organization>,
    quotas: RwLock<std::collections::HashMap<String, OrganizationQuota>>,
    connections: DashMap<String, Connection>,
    triggers: DashMap<String, WorkflowTrigger>,
    outbox: RwLock<Vec<WebhookOutboxRecord>>,
    outbox_leases: DashMap<Uuid, DateTime<Utc>>,
    executions: DashMap<Uuid, ExecutionRecord>,
    execution_leases: DashMap<Uuid, (String, DateTime<Utc>)>,
    cancel_flags: DashMap<Uuid, bool>,
    usage: RwLock<std::collections::HashMap<(String, String, i32, u32), UsageTracking>>,
    audit: RwLock<Vec<AuditEntry>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkflowStore for InMemoryStorage {
    async fn put_workflow(&self, workflow: Workflow) -> Result<Workflow> {
        self.workflows.insert(workflow.id.clone(), workflow.clone());
        Ok(workflow)
    }

    async fn get_workflow(&self, id: &str) -> Result<Option<Workflow>> {
        Ok(self.workflows.get(id).map(|w| w.clone()))
    }

    async fn list_workflows(&self, organization_id: &str) -> Result<Vec<Workflow>> {
        let mut out: Vec<Workflow> = self
            .workflows
            .iter()
            .filter(|w| w.organization_id == organization_id)
            .map(|w| w.clone())
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }

    async fn delete_workflow(&self, id: &str) -> Result<bool> {
        Ok(self.workflows.remove(id).is_some())
    }
}

#[async_trait]
impl OrganizationStore for InMemoryStorage {
    async fn put_organization(&self, organization: Organization) -> Result<Organization> {
        self.organizations
            .insert(organization.id.clone(), organization.clone());
        Ok(organization)
    }

    async fn get_organization(&self, id: &str) -> Result<Option<Organization>> {
        Ok(self.organizations.get(id).map(|o| o.clone()))
    }

    async fn put_quota(&self, quota: OrganizationQuota) -> Result<OrganizationQuota> {
        self.quotas
            .write()
            .await
            .insert(quota.organization_id.clone(), quota.clone());
        Ok(quota)
    }

    async fn get_quota(&self, organization_id: &str) -> Result<Option<OrganizationQuota>> {
        Ok(self.quotas.read().await.get(organization_id).cloned())
    }

    async fn adjust_concurrent_executions(&self, organization_id: &str, delta: i64) -> Result<u64> {
        let mut quotas = self.quotas.write().await;
        let Some(quota) = quotas.get_mut(organization_id) else {
            return Ok(0);
        };
        let current = quota.usage.concurrent_executions as i64;
        let next = (current + delta).max(0) as u64;
        quota.usage.concurrent_executions = next;
        Ok(next)
    }

    async fn record_admitted_execution(&self, organization_id: &str) -> Result<()> {
        let mut quotas = self.quotas.write().await;
        if let Some(quota) = quotas.get_mut(organization_id) {
            quota.usage.executions_this_month += 1;
            quota.usage.executions_in_current_window += 1;
        }
        Ok(())
    }

    async fn add_quota_usage(
        &self,
        organization_id: &str,
        api_calls: u64,
        tokens: u64,
    ) -> Result<()> {
        let mut quotas = self.quotas.write().await;
        if let Some(quota) = quotas.get_mut(organization_id) {
            quota.usage.api_calls_this_month += api_calls;
            quota.usage.tokens_this_month += tokens;
        }
        Ok(())
    }
}

#[async_trait]
impl ConnectionStore for InMemoryStorage {
    async fn put_connection(&self, connection: Connection) -> Result<Connection> {
        self.connections
            .insert(connection.id.clone(), connection.clone());
        Ok(connection)
    }

    async fn get_connection(&self, id: &str) -> Result<Option<Connection>> {
        Ok(self.connections.get(id).map(|c| c.clone()))
    }

    async fn list_connections(
        &self,
        organization_id: &str,
        user_id: &str,
    ) -> Result<Vec<Connection>> {
        let mut out: Vec<Connection> = self
            .connections
            .iter()
            .filter(|c| c.organization_id == organization_id && c.user_id == user_id)
            .map(|c| c.clone())
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }

    async fn revoke_connection(&self, id: &str) -> Result<bool> {
        match self.connections.get_mut(id) {
            Some(mut connection) => {
                connection.revoked = true;
                connection.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl TriggerStore for InMemoryStorage {
    async fn put_trigger(&self, trigger: WorkflowTrigger) -> Result<WorkflowTrigger> {
        self.triggers.insert(trigger.id.clone(), trigger.clone());
        Ok(trigger)
    }

    async fn get_trigger(&self, id: &str) -> Result<Option<WorkflowTrigger>> {
        Ok(self.triggers.get(id).map(|t| t.clone()))
    }

    async fn get_trigger_by_endpoint(&self, endpoint_id: &str) -> Result<Option<WorkflowTrigger>> {
        Ok(self
            .triggers
            .iter()
            .find(|t| {
                matches!(&t.registration, TriggerRegistration::Webhook(w)
                    if w.endpoint_id == endpoint_id)
            })
            .map(|t| t.clone()))
    }

    async fn list_triggers(&self, organization_id: Option<&str>) -> Result<Vec<WorkflowTrigger>> {
        let mut out: Vec<WorkflowTrigger> = self
            .triggers
            .iter()
            .filter(|t| organization_id.map_or(true, |org| t.organization_id == org))
            .map(|t| t.clone())
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }

    async fn list_due_polling(&self, now: DateTime<Utc>) -> Result<Vec<WorkflowTrigger>> {
        Ok(self
            .triggers
            .iter()
            .filter(|t| t.active)
            .filter(|t| {
                matches!(&t.registration, TriggerRegistration::Polling(p)
                    if p.next_poll_at.map_or(true, |due| due <= now))
            })
            .map(|t| t.clone())
            .collect())
    }

    async fn set_trigger_active(&self, id: &str, active: bool) -> Result<bool> {
        match self.triggers.get_mut(id) {
            Some(mut trigger) => {
                trigger.active = active;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_trigger(&self, id: &str) -> Result<bool> {
        Ok(self.triggers.remove(id).is_some())
    }
}

#[async_trait]
impl OutboxStore for InMemoryStorage {
    async fn append_outbox(&self, record: WebhookOutboxRecord) -> Result<WebhookOutboxRecord> {
        self.outbox.write().await.push(record.clone());
        Ok(record)
    }

    async fn claim_pending_outbox(
        &self,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<WebhookOutboxRecord>> {
        let now = Utc::now();
        let lease_until = now
            + ChronoDuration::from_std(lease)
                .unwrap_or_else(|_| ChronoDuration::seconds(30));
        let outbox = self.outbox.read().await;
        let mut claimed = Vec::new();
        for record in outbox.iter() {
            if claimed.len() >= limit {
                break;
            }
            if record.status != OutboxStatus::Pending {
                continue;
            }
            let leased = self
                .outbox_leases
                .get(&record.id)
                .map(|until| *until > now)
                .unwrap_or(false);
            if leased {
                continue;
            }
            self.outbox_leases.insert(record.id, lease_until);
            claimed.push(record.clone());
        }
        Ok(claimed)
    }

    async fn mark_outbox_dispatched(&self, id: &Uuid) -> Result<()> {
        let mut outbox = self.outbox.write().await;
        if let Some(record) = outbox.iter_mut().find(|r| r.id == *id) {
            record.status = OutboxStatus::Dispatched;
            record.last_attempt_at = Some(Utc::now());
        }
        self.outbox_leases.remove(id);
        Ok(())
    }

    async fn mark_outbox_failed(&self, id: &Uuid, error: &str, terminal: bool) -> Result<()> {
        let mut outbox = self.outbox.write().await;
        if let Some(record) = outbox.iter_mut().find(|r| r.id == *id) {
            record.attempts += 1;
            record.last_error = Some(error.to_string());
            record.last_attempt_at = Some(Utc::now());
            record.status = if terminal {
                OutboxStatus::Failed
            } else {
                OutboxStatus::Pending
            };
        }
        self.outbox_leases.remove(id);
        Ok(())
    }

    async fn count_outbox(&self, status: OutboxStatus) -> Result<u64> {
        Ok(self
            .outbox
            .read()
            .await
            .iter()
            .filter(|r| r.status == status)
            .count() as u64)
    }

    async fn list_outbox(
        &self,
        status: Option<OutboxStatus>,
        limit: usize,
    ) -> Result<Vec<WebhookOutboxRecord>> {
        Ok(self
            .outbox
            .read()
            .await
            .iter()
            .filter(|r| status.map_or(true, |s| r.status == s))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn requeue_outbox(&self, id: &Uuid) -> Result<bool> {
        let mut outbox = self.outbox.write().await;
        match outbox
            .iter_mut()
            .find(|r| r.id == *id && r.status == OutboxStatus::Failed)
        {
            Some(record) => {
                record.status = OutboxStatus::Pending;
                record.attempts = 0;
                record.last_error = None;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_outbox_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut outbox = self.outbox.write().await;
        let before = outbox.len();
        outbox.retain(|r| r.status != OutboxStatus::Dispatched || r.created_at >= cutoff);
        Ok((before - outbox.len()) as u64)
    }
}

#[async_trait]
impl ExecutionStore for InMemoryStorage {
    async fn create_execution(&self, record: ExecutionRecord) -> Result<ExecutionRecord> {
        self.executions.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_execution(&self, id: &Uuid) -> Result<Option<ExecutionRecord>> {
        Ok(self.executions.get(id).map(|e| e.clone()))
    }

    async fn update_execution(&self, record: ExecutionRecord) -> Result<ExecutionRecord> {
        self.executions.insert(record.id, record.clone());
        Ok(record)
    }

    async fn claim_execution(&self, id: &Uuid, worker: &str, lease: Duration) -> Result<bool> {
        let now = Utc::now();
        let lease_until = now
            + ChronoDuration::from_std(lease)
                .unwrap_or_else(|_| ChronoDuration::seconds(60));
        // Entry-based upsert keeps check-and-claim atomic per execution.
        let mut entry = self
            .execution_leases
            .entry(*id)
            .or_insert((worker.to_string(), lease_until));
        let (owner, until) = entry.value().clone();
        if owner == worker {
            *entry.value_mut() = (worker.to_string(), lease_until);
            return Ok(true);
        }
        if until <= now {
            *entry.value_mut() = (worker.to_string(), lease_until);
            return Ok(true);
        }
        Ok(false)
    }

    async fn list_executions(
        &self,
        organization_id: &str,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>> {
        let mut out: Vec<ExecutionRecord> = self
            .executions
            .iter()
            .filter(|e| e.organization_id == organization_id)
            .map(|e| e.clone())
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out.truncate(limit);
        Ok(out)
    }

    async fn request_cancel(&self, id: &Uuid) -> Result<bool> {
        if self.executions.contains_key(id) {
            self.cancel_flags.insert(*id, true);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn is_cancel_requested(&self, id: &Uuid) -> Result<bool> {
        Ok(self.cancel_flags.get(id).map(|f| *f).unwrap_or(false))
    }
}

#[async_trait]
impl UsageStore for InMemoryStorage {
    async fn add_usage(
        &self,
        user_id: &str,
        organization_id: &str,
        year: i32,
        month: u32,
        delta: UsageDelta,
    ) -> Result<UsageTracking> {
        let mut usage = self.usage.write().await;
        let key = (
            user_id.to_string(),
            organization_id.to_string(),
            year,
            month,
        );
        let row = usage
            .entry(key)
            .or_insert_with(|| UsageTracking::empty(user_id, organization_id, year, month));
        row.api_calls += delta.api_calls;
        row.tokens_used += delta.tokens;
        row.workflow_runs += delta.workflow_runs;
        row.storage_used += delta.storage_bytes;
        row.estimated_cost_cents += delta.cost_cents;
        row.updated_at = Utc::now();
        Ok(row.clone())
    }

    async fn get_usage(
        &self,
        user_id: &str,
        organization_id: &str,
        year: i32,
        month: u32,
    ) -> Result<Option<UsageTracking>> {
        let key = (
            user_id.to_string(),
            organization_id.to_string(),
            year,
            month,
        );
        Ok(self.usage.read().await.get(&key).cloned())
    }

    async fn list_usage_for_month(&self, year: i32, month: u32) -> Result<Vec<UsageTracking>> {
        let mut out: Vec<UsageTracking> = self
            .usage
            .read()
            .await
            .values()
            .filter(|row| row.year == year && row.month == month)
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            (a.organization_id.as_str(), a.user_id.as_str())
                .cmp(&(b.organization_id.as_str(), b.user_id.as_str()))
        });
        Ok(out)
    }
}

#[async_trait]
impl AuditStore for InMemoryStorage {
    async fn append_audit(&self, entry: AuditEntry) -> Result<()> {
        self.audit.write().await.push(entry);
        Ok(())
    }

    async fn list_audit(&self, organization_id: &str, limit: usize) -> Result<Vec<AuditEntry>> {
        Ok(self
            .audit
            .read()
            .await
            .iter()
            .rev()
            .filter(|e| e.organization_id == organization_id)
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PlanTier, QueueRunRequest, TriggerType};

    fn run_request() -> QueueRunRequest {
        QueueRunRequest {
            workflow_id: "wf-1".into(),
            organization_id: "org-1".into(),
            user_id: None,
            trigger_type: TriggerType::Webhook,
            trigger_data: None,
        }
    }

    #[tokio::test]
    async fn concurrency_counter_saturates_at_zero() {
        let store = InMemoryStorage::new();
        let quota = OrganizationQuota::for_month("org-1", PlanTier::Starter, Utc::now());
        store.put_quota(quota).await.unwrap();

        assert_eq!(store.adjust_concurrent_executions("org-1", 2).await.unwrap(), 2);
        assert_eq!(store.adjust_concurrent_executions("org-1", -1).await.unwrap(), 1);
        assert_eq!(store.adjust_concurrent_executions("org-1", -5).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn outbox_claim_leases_rows() {
        let store = InMemoryStorage::new();
        let record = WebhookOutboxRecord::new(run_request());
        let id = record.id;
        store.append_outbox(record).await.unwrap();

        let first = store
            .claim_pending_outbox(10, Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(first.len(), 1);

        // Still leased: a second claimer gets nothing.
        let second = store
            .claim_pending_outbox(10, Duration::from_secs(30))
            .await
            .unwrap();
        assert!(second.is_empty());

        store.mark_outbox_dispatched(&id).await.unwrap();
        assert_eq!(store.count_outbox(OutboxStatus::Dispatched).await.unwrap(), 1);
        assert_eq!(store.count_outbox(OutboxStatus::Pending).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn outbox_failure_and_replay() {
        let store = InMemoryStorage::new();
        let record = WebhookOutboxRecord::new(run_request());
        let id = record.id;
        store.append_outbox(record).await.unwrap();

        store
            .mark_outbox_failed(&id, "queue down", false)
            .await
            .unwrap();
        assert_eq!(store.count_outbox(OutboxStatus::Pending).await.unwrap(), 1);

        store
            .mark_outbox_failed(&id, "queue still down", true)
            .await
            .unwrap();
        assert_eq!(store.count_outbox(OutboxStatus::Failed).await.unwrap(), 1);
        let failed = store
            .list_outbox(Some(OutboxStatus::Failed), 10)
            .await
            .unwrap();
        assert_eq!(failed[0].attempts, 2);
        assert_eq!(failed[0].last_error.as_deref(), Some("queue still down"));

        assert!(store.requeue_outbox(&id).await.unwrap());
        assert_eq!(store.count_outbox(OutboxStatus::Pending).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn execution_lease_is_exclusive() {
        let store = InMemoryStorage::new();
        let record = ExecutionRecord::queued(&run_request(), crate::models::Durability::Durable);
        let id = record.id;
        store.create_execution(record).await.unwrap();

        assert!(store
            .claim_execution(&id, "worker-a", Duration::from_secs(60))
            .await
            .unwrap());
        assert!(!store
            .claim_execution(&id, "worker-b", Duration::from_secs(60))
            .await
            .unwrap());
        // Re-claim by the owner refreshes the lease.
        assert!(store
            .claim_execution(&id, "worker-a", Duration::from_secs(60))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn usage_increments_accumulate() {
        let store = InMemoryStorage::new();
        let delta = UsageDelta {
            api_calls: 2,
            tokens: 100,
            ..UsageDelta::default()
        };
        store.add_usage("u1", "org-1", 2024, 5, delta).await.unwrap();
        let row = store
            .add_usage("u1", "org-1", 2024, 5, delta)
            .await
            .unwrap();
        assert_eq!(row.api_calls, 4);
        assert_eq!(row.tokens_used, 200);
        assert!(store.get_usage("u1", "org-1", 2024, 6).await.unwrap().is_none());
    }
}
