// Postgres storage backend
// Runtime-bound queries; documents ride in JSONB, hot counters in columns

//! # Postgres Storage
//!
//! Production backend for the [`PlatformStore`](super::storage::PlatformStore)
//! traits. Entities serialize to JSONB documents with the columns the
//! engine filters or atomically mutates pulled out: quota counters are
//! plain `BIGINT`s so admission math happens inside Postgres, outbox and
//! execution leases use `FOR UPDATE SKIP LOCKED` claims, and dedupe rings
//! persist inside the trigger document in the same write as the watermark
//! that produced them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::time::Duration;
use uuid::Uuid;

use crate::models::{
    AuditEntry, Connection, ExecutionRecord, Organization, OrganizationQuota, OutboxStatus,
    QuotaUsage, TriggerRegistration, UsageTracking, WebhookOutboxRecord, Workflow,
    WorkflowTrigger,
};
use crate::Result;

use super::storage::{
    AuditStore, ConnectionStore, ExecutionStore, OrganizationStore, OutboxStore, TriggerStore,
    UsageDelta, UsageStore, WorkflowStore,
};

/// Postgres-backed platform store.
pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    /// Connect and ensure the schema exists.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .connect(database_url)
            .await?;
        let store = PostgresStorage { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub fn from_pool(pool: PgPool) -> Self {
        PostgresStorage { pool }
    }

    /// Idempotent schema setup.
    async fn migrate(&self) -> Result<()> {
        const DDL: &[&str] = &[
            "CREATE TABLE IF NOT EXISTS organizations (
                id TEXT PRIMARY KEY,
                doc JSONB NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS organization_quotas (
                organization_id TEXT PRIMARY KEY,
                period_start TIMESTAMPTZ NOT NULL,
                period_end TIMESTAMPTZ NOT NULL,
                limits JSONB NOT NULL,
                workflows BIGINT NOT NULL DEFAULT 0,
                executions_this_month BIGINT NOT NULL DEFAULT 0,
                concurrent_executions BIGINT NOT NULL DEFAULT 0,
                executions_in_window BIGINT NOT NULL DEFAULT 0,
                storage_bytes BIGINT NOT NULL DEFAULT 0,
                users BIGINT NOT NULL DEFAULT 0,
                api_calls_this_month BIGINT NOT NULL DEFAULT 0,
                tokens_this_month BIGINT NOT NULL DEFAULT 0
            )",
            "CREATE TABLE IF NOT EXISTS workflows (
                id TEXT PRIMARY KEY,
                organization_id TEXT NOT NULL,
                doc JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS connections (
                id TEXT PRIMARY KEY,
                organization_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                doc JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS workflow_triggers (
                id TEXT PRIMARY KEY,
                organization_id TEXT NOT NULL,
                endpoint_id TEXT,
                kind TEXT NOT NULL,
                active BOOLEAN NOT NULL,
                next_poll_at TIMESTAMPTZ,
                doc JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS workflow_triggers_endpoint
                ON workflow_triggers (endpoint_id) WHERE endpoint_id IS NOT NULL",
            "CREATE INDEX IF NOT EXISTS workflow_triggers_due
                ON workflow_triggers (next_poll_at) WHERE active",
            "CREATE TABLE IF NOT EXISTS webhook_outbox (
                id UUID PRIMARY KEY,
                status TEXT NOT NULL,
                attempts INT NOT NULL DEFAULT 0,
                last_error TEXT,
                payload JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                last_attempt_at TIMESTAMPTZ,
                lease_until TIMESTAMPTZ
            )",
            "CREATE INDEX IF NOT EXISTS webhook_outbox_pending
                ON webhook_outbox (created_at) WHERE status = 'pending'",
            "CREATE TABLE IF NOT EXISTS executions (
                id UUID PRIMARY KEY,
                organization_id TEXT NOT NULL,
                status TEXT NOT NULL,
                cancel_requested BOOLEAN NOT NULL DEFAULT FALSE,
                worker TEXT,
                lease_until TIMESTAMPTZ,
                doc JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS executions_org
                ON executions (organization_id, created_at DESC)",
            "CREATE TABLE IF NOT EXISTS usage_tracking (
                user_id TEXT NOT NULL,
                organization_id TEXT NOT NULL,
                year INT NOT NULL,
                month INT NOT NULL,
                api_calls BIGINT NOT NULL DEFAULT 0,
                tokens_used BIGINT NOT NULL DEFAULT 0,
                workflow_runs BIGINT NOT NULL DEFAULT 0,
                storage_used BIGINT NOT NULL DEFAULT 0,
                estimated_cost_cents BIGINT NOT NULL DEFAULT 0,
                updated_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (user_id, organization_id, year, month)
            )",
            "CREATE TABLE IF NOT EXISTS audit_log (
                id UUID PRIMARY KEY,
                organization_id TEXT NOT NULL,
                doc JSONB NOT NULL,
                recorded_at TIMESTAMPTZ NOT NULL
            )",
        ];
        for statement in DDL {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

fn decode_doc<T: serde::de::DeserializeOwned>(doc: serde_json::Value) -> Result<T> {
    Ok(serde_json::from_value(doc)?)
}

fn outbox_status_str(status: OutboxStatus) -> &'static str {
    match status {
        OutboxStatus::Pending => "pending",
        OutboxStatus::Dispatched => "dispatched",
        OutboxStatus::Failed => "failed",
    }
}

fn row_to_outbox(row: &sqlx::postgres::PgRow) -> Result<WebhookOutboxRecord> {
    let status: String = row.try_get("status")?;
    let status = match status.as_str() {
        "pending" => OutboxStatus::Pending,
        "dispatched" => OutboxStatus::Dispatched,
        _ => OutboxStatus::Failed,
    };
    Ok(WebhookOutboxRecord {
        id: row.try_get("id")?,
        payload: decode_doc(row.try_get::<serde_json::Value, _>("payload")?)?,
        status,
        attempts: row.try_get::<i32, _>("attempts")? as u32,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
        last_attempt_at: row.try_get("last_attempt_at")?,
    })
}

#[async_trait]
impl WorkflowStore for PostgresStorage {
    async fn put_workflow(&self, workflow: Workflow) -> Result<Workflow> {
        sqlx::query(
            "INSERT INTO workflows (id, organization_id, doc, created_at)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (id) DO UPDATE SET doc = EXCLUDED.doc",
        )
        .bind(&workflow.id)
        .bind(&workflow.organization_id)
        .bind(serde_json::to_value(&workflow)?)
        .bind(workflow.created_at)
        .execute(&self.pool)
        .await?;
        Ok(workflow)
    }

    async fn get_workflow(&self, id: &str) -> Result<Option<Workflow>> {
        let row = sqlx::query("SELECT doc FROM workflows WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| decode_doc(r.get::<serde_json::Value, _>("doc")))
            .transpose()
    }

    async fn list_workflows(&self, organization_id: &str) -> Result<Vec<Workflow>> {
        let rows = sqlx::query(
            "SELECT doc FROM workflows WHERE organization_id = $1 ORDER BY created_at",
        )
        .bind(organization_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|r| decode_doc(r.get::<serde_json::Value, _>("doc")))
            .collect()
    }

    async fn delete_workflow(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM workflows WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl OrganizationStore for PostgresStorage {
    async fn put_organization(&self, organization: Organization) -> Result<Organization> {
        sqlx::query(
            "INSERT INTO organizations (id, doc) VALUES ($1, $2)
             ON CONFLICT (id) DO UPDATE SET doc = EXCLUDED.doc",
        )
        .bind(&organization.id)
        .bind(serde_json::to_value(&organization)?)
        .execute(&self.pool)
        .await?;
        Ok(organization)
    }

    async fn get_organization(&self, id: &str) -> Result<Option<Organization>> {
        let row = sqlx::query("SELECT doc FROM organizations WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| decode_doc(r.get::<serde_json::Value, _>("doc")))
            .transpose()
    }

    async fn put_quota(&self, quota: OrganizationQuota) -> Result<OrganizationQuota> {
        sqlx::query(
            "INSERT INTO organization_quotas
                (organization_id, period_start, period_end, limits, workflows,
                 executions_this_month, concurrent_executions, executions_in_window,
                 storage_bytes, users, api_calls_this_month, tokens_this_month)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
             ON CONFLICT (organization_id) DO UPDATE SET
                period_start = EXCLUDED.period_start,
                period_end = EXCLUDED.period_end,
                limits = EXCLUDED.limits,
                workflows = EXCLUDED.workflows,
                executions_this_month = EXCLUDED.executions_this_month,
                concurrent_executions = EXCLUDED.concurrent_executions,
                executions_in_window = EXCLUDED.executions_in_window,
                storage_bytes = EXCLUDED.storage_bytes,
                users = EXCLUDED.users,
                api_calls_this_month = EXCLUDED.api_calls_this_month,
                tokens_this_month = EXCLUDED.tokens_this_month",
        )
        .bind(&quota.organization_id)
        .bind(quota.period_start)
        .bind(quota.period_end)
        .bind(serde_json::to_value(&quota.limits)?)
        .bind(quota.usage.workflows as i64)
        .bind(quota.usage.executions_this_month as i64)
        .bind(quota.usage.concurrent_executions as i64)
        .bind(quota.usage.executions_in_current_window as i64)
        .bind(quota.usage.storage_bytes as i64)
        .bind(quota.usage.users as i64)
        .bind(quota.usage.api_calls_this_month as i64)
        .bind(quota.usage.tokens_this_month as i64)
        .execute(&self.pool)
        .await?;
        Ok(quota)
    }

    async fn get_quota(&self, organization_id: &str) -> Result<Option<OrganizationQuota>> {
        let row = sqlx::query("SELECT * FROM organization_quotas WHERE organization_id = $1")
            .bind(organization_id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else { return Ok(None) };
        Ok(Some(OrganizationQuota {
            organization_id: row.try_get("organization_id")?,
            period_start: row.try_get("period_start")?,
            period_end: row.try_get("period_end")?,
            limits: decode_doc(row.try_get::<serde_json::Value, _>("limits")?)?,
            usage: QuotaUsage {
                workflows: row.try_get::<i64, _>("workflows")? as u64,
                executions_this_month: row.try_get::<i64, _>("executions_this_month")? as u64,
                concurrent_executions: row.try_get::<i64, _>("concurrent_executions")? as u64,
                executions_in_current_window: row.try_get::<i64, _>("executions_in_window")?
                    as u64,
                storage_bytes: row.try_get::<i64, _>("storage_bytes")? as u64,
                users: row.try_get::<i64, _>("users")? as u64,
                api_calls_this_month: row.try_get::<i64, _>("api_calls_this_month")? as u64,
                tokens_this_month: row.try_get::<i64, _>("tokens_this_month")? as u64,
            },
        }))
    }

    async fn adjust_concurrent_executions(&self, organization_id: &str, delta: i64) -> Result<u64> {
        let row = sqlx::query(
            "UPDATE organization_quotas
             SET concurrent_executions = GREATEST(concurrent_executions + $2, 0)
             WHERE organization_id = $1
             RETURNING concurrent_executions",
        )
        .bind(organization_id)
        .bind(delta)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row
            .map(|r| r.get::<i64, _>("concurrent_executions") as u64)
            .unwrap_or(0))
    }

    async fn record_admitted_execution(&self, organization_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE organization_quotas
             SET executions_this_month = executions_this_month + 1,
                 executions_in_window = executions_in_window + 1
             WHERE organization_id = $1",
        )
        .bind(organization_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn add_quota_usage(
        &self,
        organization_id: &str,
        api_calls: u64,
        tokens: u64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE organization_quotas
             SET api_calls_this_month = api_calls_this_month + $2,
                 tokens_this_month = tokens_this_month + $3
             WHERE organization_id = $1",
        )
        .bind(organization_id)
        .bind(api_calls as i64)
        .bind(tokens as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ConnectionStore for PostgresStorage {
    async fn put_connection(&self, connection: Connection) -> Result<Connection> {
        sqlx::query(
            "INSERT INTO connections (id, organization_id, user_id, doc, created_at)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (id) DO UPDATE SET doc = EXCLUDED.doc",
        )
        .bind(&connection.id)
        .bind(&connection.organization_id)
        .bind(&connection.user_id)
        .bind(serde_json::to_value(&connection)?)
        .bind(connection.created_at)
        .execute(&self.pool)
        .await?;
        Ok(connection)
    }

    async fn get_connection(&self, id: &str) -> Result<Option<Connection>> {
        let row = sqlx::query("SELECT doc FROM connections WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| decode_doc(r.get::<serde_json::Value, _>("doc")))
            .transpose()
    }

    async fn list_connections(
        &self,
        organization_id: &str,
        user_id: &str,
    ) -> Result<Vec<Connection>> {
        let rows = sqlx::query(
            "SELECT doc FROM connections
             WHERE organization_id = $1 AND user_id = $2 ORDER BY created_at",
        )
        .bind(organization_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|r| decode_doc(r.get::<serde_json::Value, _>("doc")))
            .collect()
    }

    async fn revoke_connection(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE connections
             SET doc = jsonb_set(doc, '{revoked}', 'true')
             WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl TriggerStore for PostgresStorage {
    async fn put_trigger(&self, trigger: WorkflowTrigger) -> Result<WorkflowTrigger> {
        let (kind, endpoint_id, next_poll_at) = match &trigger.registration {
            TriggerRegistration::Webhook(w) => ("webhook", Some(w.endpoint_id.clone()), None),
            TriggerRegistration::Polling(p) => ("polling", None, p.next_poll_at),
        };
        sqlx::query(
            "INSERT INTO workflow_triggers
                (id, organization_id, endpoint_id, kind, active, next_poll_at, doc, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (id) DO UPDATE SET
                endpoint_id = EXCLUDED.endpoint_id,
                active = EXCLUDED.active,
                next_poll_at = EXCLUDED.next_poll_at,
                doc = EXCLUDED.doc",
        )
        .bind(&trigger.id)
        .bind(&trigger.organization_id)
        .bind(endpoint_id)
        .bind(kind)
        .bind(trigger.active)
        .bind(next_poll_at)
        .bind(serde_json::to_value(&trigger)?)
        .bind(trigger.created_at)
        .execute(&self.pool)
        .await?;
        Ok(trigger)
    }

    async fn get_trigger(&self, id: &str) -> Result<Option<WorkflowTrigger>> {
        let row = sqlx::query("SELECT doc FROM workflow_triggers WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| decode_doc(r.get::<serde_json::Value, _>("doc")))
            .transpose()
    }

    async fn get_trigger_by_endpoint(&self, endpoint_id: &str) -> Result<Option<WorkflowTrigger>> {
        let row = sqlx::query("SELECT doc FROM workflow_triggers WHERE endpoint_id = $1")
            .bind(endpoint_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| decode_doc(r.get::<serde_json::Value, _>("doc")))
            .transpose()
    }

    async fn list_triggers(&self, organization_id: Option<&str>) -> Result<Vec<WorkflowTrigger>> {
        let rows = match organization_id {
            Some(org) => {
                sqlx::query(
                    "SELECT doc FROM workflow_triggers
                     WHERE organization_id = $1 ORDER BY created_at",
                )
                .bind(org)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT doc FROM workflow_triggers ORDER BY created_at")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.into_iter()
            .map(|r| decode_doc(r.get::<serde_json::Value, _>("doc")))
            .collect()
    }

    async fn list_due_polling(&self, now: DateTime<Utc>) -> Result<Vec<WorkflowTrigger>> {
        let rows = sqlx::query(
            "SELECT doc FROM workflow_triggers
             WHERE active AND kind = 'polling'
               AND (next_poll_at IS NULL OR next_poll_at <= $1)",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|r| decode_doc(r.get::<serde_json::Value, _>("doc")))
            .collect()
    }

    async fn set_trigger_active(&self, id: &str, active: bool) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE workflow_triggers
             SET active = $2, doc = jsonb_set(doc, '{active}', to_jsonb($2))
             WHERE id = $1",
        )
        .bind(id)
        .bind(active)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_trigger(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM workflow_triggers WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl OutboxStore for PostgresStorage {
    async fn append_outbox(&self, record: WebhookOutboxRecord) -> Result<WebhookOutboxRecord> {
        sqlx::query(
            "INSERT INTO webhook_outbox
                (id, status, attempts, last_error, payload, created_at, last_attempt_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(record.id)
        .bind(outbox_status_str(record.status))
        .bind(record.attempts as i32)
        .bind(&record.last_error)
        .bind(serde_json::to_value(&record.payload)?)
        .bind(record.created_at)
        .bind(record.last_attempt_at)
        .execute(&self.pool)
        .await?;
        Ok(record)
    }

    async fn claim_pending_outbox(
        &self,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<WebhookOutboxRecord>> {
        let rows = sqlx::query(
            "UPDATE webhook_outbox SET lease_until = now() + make_interval(secs => $2)
             WHERE id IN (
                SELECT id FROM webhook_outbox
                WHERE status = 'pending' AND (lease_until IS NULL OR lease_until < now())
                ORDER BY created_at
                LIMIT $1
                FOR UPDATE SKIP LOCKED
             )
             RETURNING *",
        )
        .bind(limit as i64)
        .bind(lease.as_secs_f64())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_outbox).collect()
    }

    async fn mark_outbox_dispatched(&self, id: &Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE webhook_outbox
             SET status = 'dispatched', last_attempt_at = now(), lease_until = NULL
             WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_outbox_failed(&self, id: &Uuid, error: &str, terminal: bool) -> Result<()> {
        sqlx::query(
            "UPDATE webhook_outbox
             SET status = $3, attempts = attempts + 1, last_error = $2,
                 last_attempt_at = now(), lease_until = NULL
             WHERE id = $1",
        )
        .bind(id)
        .bind(error)
        .bind(if terminal { "failed" } else { "pending" })
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn count_outbox(&self, status: OutboxStatus) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM webhook_outbox WHERE status = $1")
            .bind(outbox_status_str(status))
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("n") as u64)
    }

    async fn list_outbox(
        &self,
        status: Option<OutboxStatus>,
        limit: usize,
    ) -> Result<Vec<WebhookOutboxRecord>> {
        let rows = match status {
            Some(status) => {
                sqlx::query(
                    "SELECT * FROM webhook_outbox WHERE status = $1
                     ORDER BY created_at LIMIT $2",
                )
                .bind(outbox_status_str(status))
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM webhook_outbox ORDER BY created_at LIMIT $1")
                    .bind(limit as i64)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(row_to_outbox).collect()
    }

    async fn requeue_outbox(&self, id: &Uuid) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE webhook_outbox
             SET status = 'pending', attempts = 0, last_error = NULL, lease_until = NULL
             WHERE id = $1 AND status = 'failed'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_outbox_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM webhook_outbox WHERE status = 'dispatched' AND created_at < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl ExecutionStore for PostgresStorage {
    async fn create_execution(&self, record: ExecutionRecord) -> Result<ExecutionRecord> {
        sqlx::query(
            "INSERT INTO executions (id, organization_id, status, doc, created_at)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(record.id)
        .bind(&record.organization_id)
        .bind(status_str(&record))
        .bind(serde_json::to_value(&record)?)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;
        Ok(record)
    }

    async fn get_execution(&self, id: &Uuid) -> Result<Option<ExecutionRecord>> {
        let row = sqlx::query("SELECT doc FROM executions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| decode_doc(r.get::<serde_json::Value, _>("doc")))
            .transpose()
    }

    async fn update_execution(&self, record: ExecutionRecord) -> Result<ExecutionRecord> {
        sqlx::query("UPDATE executions SET status = $2, doc = $3 WHERE id = $1")
            .bind(record.id)
            .bind(status_str(&record))
            .bind(serde_json::to_value(&record)?)
            .execute(&self.pool)
            .await?;
        Ok(record)
    }

    async fn claim_execution(&self, id: &Uuid, worker: &str, lease: Duration) -> Result<bool> {
        let row = sqlx::query(
            "UPDATE executions
             SET worker = $2, lease_until = now() + make_interval(secs => $3)
             WHERE id = $1
               AND (worker IS NULL OR worker = $2 OR lease_until < now())
             RETURNING id",
        )
        .bind(id)
        .bind(worker)
        .bind(lease.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    async fn list_executions(
        &self,
        organization_id: &str,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>> {
        let rows = sqlx::query(
            "SELECT doc FROM executions WHERE organization_id = $1
             ORDER BY created_at DESC LIMIT $2",
        )
        .bind(organization_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|r| decode_doc(r.get::<serde_json::Value, _>("doc")))
            .collect()
    }

    async fn request_cancel(&self, id: &Uuid) -> Result<bool> {
        let result = sqlx::query("UPDATE executions SET cancel_requested = TRUE WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn is_cancel_requested(&self, id: &Uuid) -> Result<bool> {
        let row = sqlx::query("SELECT cancel_requested FROM executions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("cancel_requested")).unwrap_or(false))
    }
}

fn status_str(record: &ExecutionRecord) -> &'static str {
    use crate::models::ExecutionStatus;
    match record.status {
        ExecutionStatus::Queued => "queued",
        ExecutionStatus::Running => "running",
        ExecutionStatus::Succeeded => "succeeded",
        ExecutionStatus::Failed => "failed",
        ExecutionStatus::Cancelled => "cancelled",
    }
}

#[async_trait]
impl UsageStore for PostgresStorage {
    async fn add_usage(
        &self,
        user_id: &str,
        organization_id: &str,
        year: i32,
        month: u32,
        delta: UsageDelta,
    ) -> Result<UsageTracking> {
        let row = sqlx::query(
            "INSERT INTO usage_tracking
                (user_id, organization_id, year, month, api_calls, tokens_used,
                 workflow_runs, storage_used, estimated_cost_cents, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, now())
             ON CONFLICT (user_id, organization_id, year, month) DO UPDATE SET
                api_calls = usage_tracking.api_calls + EXCLUDED.api_calls,
                tokens_used = usage_tracking.tokens_used + EXCLUDED.tokens_used,
                workflow_runs = usage_tracking.workflow_runs + EXCLUDED.workflow_runs,
                storage_used = usage_tracking.storage_used + EXCLUDED.storage_used,
                estimated_cost_cents =
                    usage_tracking.estimated_cost_cents + EXCLUDED.estimated_cost_cents,
                updated_at = now()
             RETURNING *",
        )
        .bind(user_id)
        .bind(organization_id)
        .bind(year)
        .bind(month as i32)
        .bind(delta.api_calls as i64)
        .bind(delta.tokens as i64)
        .bind(delta.workflow_runs as i64)
        .bind(delta.storage_bytes as i64)
        .bind(delta.cost_cents as i64)
        .fetch_one(&self.pool)
        .await?;
        row_to_usage(&row)
    }

    async fn get_usage(
        &self,
        user_id: &str,
        organization_id: &str,
        year: i32,
        month: u32,
    ) -> Result<Option<UsageTracking>> {
        let row = sqlx::query(
            "SELECT * FROM usage_tracking
             WHERE user_id = $1 AND organization_id = $2 AND year = $3 AND month = $4",
        )
        .bind(user_id)
        .bind(organization_id)
        .bind(year)
        .bind(month as i32)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_usage).transpose()
    }

    async fn list_usage_for_month(&self, year: i32, month: u32) -> Result<Vec<UsageTracking>> {
        let rows = sqlx::query(
            "SELECT * FROM usage_tracking WHERE year = $1 AND month = $2
             ORDER BY organization_id, user_id",
        )
        .bind(year)
        .bind(month as i32)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_usage).collect()
    }
}

fn row_to_usage(row: &sqlx::postgres::PgRow) -> Result<UsageTracking> {
    Ok(UsageTracking {
        user_id: row.try_get("user_id")?,
        organization_id: row.try_get("organization_id")?,
        year: row.try_get("year")?,
        month: row.try_get::<i32, _>("month")? as u32,
        api_calls: row.try_get::<i64, _>("api_calls")? as u64,
        tokens_used: row.try_get::<i64, _>("tokens_used")? as u64,
        workflow_runs: row.try_get::<i64, _>("workflow_runs")? as u64,
        storage_used: row.try_get::<i64, _>("storage_used")? as u64,
        estimated_cost_cents: row.try_get::<i64, _>("estimated_cost_cents")? as u64,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl AuditStore for PostgresStorage {
    async fn append_audit(&self, entry: AuditEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO audit_log (id, organization_id, doc, recorded_at)
             VALUES ($1, $2, $3, $4)",
        )
        .bind(entry.id)
        .bind(&entry.organization_id)
        .bind(serde_json::to_value(&entry)?)
        .bind(entry.recorded_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_audit(&self, organization_id: &str, limit: usize) -> Result<Vec<AuditEntry>> {
        let rows = sqlx::query(
            "SELECT doc FROM audit_log WHERE organization_id = $1
             ORDER BY recorded_at DESC LIMIT $2",
        )
        .bind(organization_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|r| decode_doc(r.get::<serde_json::Value, _>("doc")))
            .collect()
    }
}
