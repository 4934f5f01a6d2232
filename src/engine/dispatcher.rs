// Dispatcher - claims queued jobs and drives the runtime

//! # Dispatcher
//!
//! Worker loop between the queue driver and the runtime. Each worker
//! claims a job, takes the execution lease (at most one worker per
//! execution, redeliveries become no-ops), loads the workflow graph, and
//! runs it. On any terminal outcome the worker decrements the
//! organization's concurrency counter, finalizes the execution record,
//! meters the run, and writes the audit entry.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::models::{AuditAction, AuditEntry, ExecutionStatus, TriggerData};
use crate::Result;

use super::meter::UsageMeter;
use super::queue::{QueueDriver, QueueJob};
use super::runtime::WorkflowRuntime;
use super::storage::{
    AuditStore, ExecutionStore, OrganizationStore, PlatformStore, WorkflowStore,
};

/// Lease held while one worker runs one execution.
const EXECUTION_LEASE: Duration = Duration::from_secs(600);
/// Idle sleep when the queue is empty.
const IDLE_SLEEP: Duration = Duration::from_millis(500);

pub struct Dispatcher {
    store: Arc<dyn PlatformStore>,
    driver: Arc<dyn QueueDriver>,
    runtime: Arc<WorkflowRuntime>,
    meter: Arc<UsageMeter>,
    worker_id: String,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn PlatformStore>,
        driver: Arc<dyn QueueDriver>,
        runtime: Arc<WorkflowRuntime>,
        meter: Arc<UsageMeter>,
        worker_id: impl Into<String>,
    ) -> Self {
        Dispatcher {
            store,
            driver,
            runtime,
            meter,
            worker_id: worker_id.into(),
        }
    }

    /// Handle one claimed job end to end. Public for tests; the spawned
    /// loop calls this.
    pub async fn process(&self, job: QueueJob) -> Result<()> {
        let claimed = self
            .store
            .claim_execution(&job.execution_id, &self.worker_id, EXECUTION_LEASE)
            .await?;
        if !claimed {
            tracing::debug!(execution = %job.execution_id, "already claimed elsewhere; skipping");
            return Ok(());
        }

        let Some(mut record) = self.store.get_execution(&job.execution_id).await? else {
            tracing::error!(execution = %job.execution_id, "job without execution record");
            return Ok(());
        };
        if record.status.is_terminal() {
            // Redelivery of a finished run.
            return Ok(());
        }

        let organization = match self
            .store
            .get_organization(&job.request.organization_id)
            .await?
        {
            Some(org) => org,
            None => {
                record.status = ExecutionStatus::Failed;
                record.error = Some("organization vanished before dispatch".into());
                self.finalize(&job, record).await;
                return Ok(());
            }
        };

        let workflow = match self.store.get_workflow(&job.request.workflow_id).await? {
            Some(wf) => wf,
            None => {
                record.status = ExecutionStatus::Failed;
                record.error = Some(format!("workflow {} not found", job.request.workflow_id));
                self.finalize(&job, record).await;
                return Ok(());
            }
        };

        let initial: Option<TriggerData> = job.request.trigger_data.clone();
        let outcome = self
            .runtime
            .execute(&workflow, &organization, initial, &mut record, false)
            .await;

        match outcome {
            Ok(status) => {
                tracing::info!(
                    execution = %record.id,
                    workflow = %workflow.id,
                    status = ?status,
                    "execution finished"
                );
                let user = record.user_id.as_deref().unwrap_or("system");
                if let Err(e) = self
                    .meter
                    .record_workflow_execution(user, &organization)
                    .await
                {
                    tracing::error!(error = %e, "metering failed");
                }
                // One billable api_call per completed action node; retries
                // within a node share its idempotency key and do not bill
                // again.
                let api_calls = record
                    .nodes
                    .values()
                    .filter(|n| {
                        n.status == crate::models::NodeRunStatus::Succeeded
                            && n.diagnostics.contains_key("runtime")
                    })
                    .count() as u64;
                if api_calls > 0 {
                    if let Err(e) = self
                        .meter
                        .record_api_usage(user, &organization, api_calls, 0)
                        .await
                    {
                        tracing::error!(error = %e, "api metering failed");
                    }
                }
            }
            Err(e) => {
                tracing::error!(execution = %record.id, error = %e, "runtime error");
                record.status = ExecutionStatus::Failed;
                record.error = Some(e.to_string());
            }
        }
        self.finalize(&job, record).await;
        Ok(())
    }

    /// Decrement concurrency, persist the terminal record, audit.
    async fn finalize(&self, job: &QueueJob, record: crate::models::ExecutionRecord) {
        if let Err(e) = self
            .store
            .adjust_concurrent_executions(&job.request.organization_id, -1)
            .await
        {
            tracing::error!(error = %e, "concurrency decrement failed");
        }
        let status = record.status;
        if let Err(e) = self.store.update_execution(record.clone()).await {
            tracing::error!(execution = %record.id, error = %e, "final persist failed");
        }
        let entry = AuditEntry::new(
            &job.request.organization_id,
            &self.worker_id,
            AuditAction::ExecutionFinished,
            &record.id.to_string(),
            Some(serde_json::json!({ "status": status })),
        );
        if let Err(e) = self.store.append_audit(entry).await {
            tracing::error!(error = %e, "audit append failed");
        }
    }

    /// Spawn the worker loop until cancellation.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(worker = %self.worker_id, "dispatcher started");
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!(worker = %self.worker_id, "dispatcher stopping");
                        break;
                    }
                    next = self.driver.next() => {
                        match next {
                            Ok(Some(job)) => {
                                if let Err(e) = self.process(job).await {
                                    tracing::error!(error = %e, "job processing failed");
                                }
                            }
                            Ok(None) => tokio::time::sleep(IDLE_SLEEP).await,
                            Err(e) => {
                                tracing::error!(error = %e, "queue claim failed");
                                tokio::time::sleep(IDLE_SLEEP).await;
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
    use crate::config::PlatformConfig;
    use crate::engine::credentials::{CredentialCipher, CredentialResolver};
    use crate::engine::meter::TracingBillingAdapter;
    use crate::engine::queue::{ExecutionQueue, InMemoryQueueDriver};
    use crate::engine::registry::{ConnectorManifest, ConnectorRegistry};
    use crate::engine::storage::{
        ExecutionStore, InMemoryStorage, OrganizationStore, WorkflowStore,
    };
    use crate::models::{
        Organization, PlanTier, QueueRunRequest, TriggerType, Workflow,
    };
    use chrono::Utc;
    use serde_json::json;

    async fn harness() -> (Arc<Dispatcher>, Arc<InMemoryStorage>, Arc<ExecutionQueue>) {
        let store = Arc::new(InMemoryStorage::new());
        store
            .put_organization(Organization::new("org-1", "Acme", PlanTier::Starter, "us"))
            .await
            .unwrap();
        store
            .put_workflow(Workflow {
                id: "wf-1".into(),
                name: "wf".into(),
                organization_id: "org-1".into(),
                user_id: "u-1".into(),
                graph: serde_json::from_value(json!({
                    "nodes": [
                        {"id": "start", "type": "trigger.x.tick", "data": {"app": "x", "function": "tick"}},
                        {"id": "shape", "type": "transform", "data": {"parameters": {"ok": true}}}
                    ],
                    "edges": [{"source": "start", "target": "shape"}]
                }))
                .unwrap(),
                stop_on_error: false,
                deadline_seconds: None,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .await
            .unwrap();

        let driver = Arc::new(InMemoryQueueDriver::new());
        let queue = Arc::new(ExecutionQueue::new(store.clone(), driver.clone(), true));
        let registry = Arc::new(ConnectorRegistry::new(ConnectorManifest::default()));
        let credentials = Arc::new(CredentialResolver::new(
            store.clone(),
            CredentialCipher::from_master_key("AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=")
                .unwrap(),
        ));
        let runtime = Arc::new(WorkflowRuntime::new(
            registry,
            credentials,
            store.clone(),
            Arc::new(PlatformConfig::default()),
        ));
        let meter = Arc::new(UsageMeter::new(
            store.clone(),
            Arc::new(TracingBillingAdapter),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            driver,
            runtime,
            meter,
            "worker-test",
        ));
        (dispatcher, store, queue)
    }

    fn request() -> QueueRunRequest {
        QueueRunRequest {
            workflow_id: "wf-1".into(),
            organization_id: "org-1".into(),
            user_id: Some("u-1".into()),
            trigger_type: TriggerType::Manual,
            trigger_data: None,
        }
    }

    #[tokio::test]
    async fn dispatch_runs_and_releases_concurrency() {
        let (dispatcher, store, queue) = harness().await;
        let execution_id = queue.enqueue(request()).await.unwrap();
        let job = queue.driver().next().await.unwrap().unwrap();

        dispatcher.process(job).await.unwrap();

        let record = store.get_execution(&execution_id).await.unwrap().unwrap();
        assert_eq!(record.status, ExecutionStatus::Succeeded);
        let quota = store.get_quota("org-1").await.unwrap().unwrap();
        // Enqueue incremented, finalize decremented.
        assert_eq!(quota.usage.concurrent_executions, 0);
    }

    #[tokio::test]
    async fn missing_workflow_fails_the_record() {
        let (dispatcher, store, queue) = harness().await;
        let mut req = request();
        req.workflow_id = "ghost".into();
        let execution_id = queue.enqueue(req).await.unwrap();
        let job = queue.driver().next().await.unwrap().unwrap();

        dispatcher.process(job).await.unwrap();
        let record = store.get_execution(&execution_id).await.unwrap().unwrap();
        assert_eq!(record.status, ExecutionStatus::Failed);
        assert!(record.error.as_deref().unwrap().contains("ghost"));
    }

    #[tokio::test]
    async fn redelivered_job_is_a_noop_after_terminal() {
        let (dispatcher, store, queue) = harness().await;
        let execution_id = queue.enqueue(request()).await.unwrap();
        let job = queue.driver().next().await.unwrap().unwrap();

        dispatcher.process(job.clone()).await.unwrap();
        let quota_before = store.get_quota("org-1").await.unwrap().unwrap();
        dispatcher.process(job).await.unwrap();
        let quota_after = store.get_quota("org-1").await.unwrap().unwrap();

        // No double decrement, record untouched.
        assert_eq!(
            quota_before.usage.concurrent_executions,
            quota_after.usage.concurrent_executions
        );
        let record = store.get_execution(&execution_id).await.unwrap().unwrap();
        assert_eq!(record.status, ExecutionStatus::Succeeded);
    }
}
