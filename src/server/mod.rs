// Application root - construct services once, wire them, spawn workers

//! # Server Module
//!
//! [`Application`] owns the lifetime of every service: storage backend,
//! queue driver, connector registry, resolvers, queue, runtime, meter,
//! relay, scheduler and dispatchers. Construction order matters only at
//! the edges (storage and queue driver connect first; the registry parity
//! check runs before anything serves traffic). Everything is passed down
//! as `Arc`s; nothing is global.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::{ApiServer, ApiState};
use crate::config::PlatformConfig;
use crate::connectors::slack::SlackClient;
use crate::engine::{
    ConnectorManifest, ConnectorRegistry, CredentialCipher, CredentialResolver, Dispatcher,
    ExecutionQueue, InMemoryQueueDriver, InMemoryStorage, NatsQueueDriver, OutboxRelay,
    OutboxRelayConfig, PlatformStore, PollingScheduler, PollingSchedulerConfig, PostgresStorage,
    QueueDriver, TracingBillingAdapter, UsageMeter, WorkflowRuntime,
};
use crate::webhooks::WebhookIngestion;
use crate::Result;

/// Built-in connector manifest. Deployments override it with
/// [`Application::build_with_manifest`]; this set keeps a bare checkout
/// useful.
const DEFAULT_MANIFEST: &str = r#"{
  "connectors": [
    {
      "id": "slack",
      "name": "Slack",
      "category": "communication",
      "availability": "stable",
      "actions": [
        {"id": "send_message", "name": "Send Message"},
        {"id": "add_reaction", "name": "Add Reaction"},
        {"id": "create_channel", "name": "Create Channel"}
      ],
      "triggers": [
        {"id": "message_received", "name": "Message Received"}
      ]
    },
    {
      "id": "stripe",
      "name": "Stripe",
      "category": "payments",
      "availability": "stable",
      "pricing_tier": "starter",
      "base_url": "https://api.stripe.com/v1",
      "actions": [
        {"id": "create_refund", "name": "Create Refund",
         "endpoint": {"method": "POST", "path": "/refunds"}}
      ],
      "triggers": [
        {"id": "payment_succeeded", "name": "Payment Succeeded"}
      ]
    },
    {
      "id": "shopify",
      "name": "Shopify",
      "category": "commerce",
      "availability": "experimental",
      "triggers": [
        {"id": "order_created", "name": "Order Created"}
      ]
    },
    {
      "id": "webflow",
      "name": "Webflow",
      "category": "cms",
      "availability": "stable",
      "pricing_tier": "professional",
      "base_url": "https://api.webflow.com",
      "actions": [
        {"id": "publish_site", "name": "Publish Site",
         "endpoint": {"method": "POST", "path": "/sites/{site_id}/publish"}}
      ]
    },
    {
      "id": "paypal",
      "name": "PayPal",
      "category": "payments",
      "availability": "disabled",
      "triggers": [
        {"id": "payment_received", "name": "Payment Received"}
      ]
    }
  ]
}"#;

/// Number of dispatcher workers per process.
const DISPATCHER_WORKERS: usize = 2;

/// The application root.
#[derive(Debug)]
pub struct Application {
    pub state: ApiState,
    relay: Arc<OutboxRelay>,
    scheduler: Arc<PollingScheduler>,
    dispatchers: Vec<Arc<Dispatcher>>,
    shutdown: CancellationToken,
}

impl Application {
    /// Build with the built-in manifest.
    pub async fn build(config: PlatformConfig) -> Result<Self> {
        let manifest = ConnectorManifest::from_json(DEFAULT_MANIFEST)?;
        Self::build_with_manifest(config, manifest).await
    }

    /// Build every service from configuration. Fails fast on storage or
    /// queue connectivity and on the registry parity rule.
    pub async fn build_with_manifest(
        config: PlatformConfig,
        manifest: ConnectorManifest,
    ) -> Result<Self> {
        let config = Arc::new(config);

        let store: Arc<dyn PlatformStore> = match &config.database_url {
            Some(url) => {
                tracing::info!("storage backend: postgres");
                Arc::new(PostgresStorage::connect(url).await?)
            }
            None => {
                tracing::warn!("storage backend: in-memory (state will not survive restart)");
                Arc::new(InMemoryStorage::new())
            }
        };

        let driver: Arc<dyn QueueDriver> = match &config.nats_url {
            Some(url) => {
                tracing::info!("queue driver: nats jetstream");
                Arc::new(NatsQueueDriver::connect(url).await?)
            }
            None => {
                tracing::warn!("queue driver: in-memory (non-durable)");
                Arc::new(InMemoryQueueDriver::new())
            }
        };

        let mut registry = ConnectorRegistry::new(manifest);
        registry.bind_client(Arc::new(SlackClient::new()));
        if config.generic_executor_enabled {
            registry.auto_bind_generic();
        }
        // Fatal: stable claims without implementations do not get to boot.
        registry.verify_parity()?;
        let registry = Arc::new(registry);

        let cipher = CredentialCipher::from_master_key(&config.credential_master_key)?;
        let credentials = Arc::new(CredentialResolver::new(store.clone(), cipher));

        let queue = Arc::new(ExecutionQueue::new(
            store.clone(),
            driver.clone(),
            config.enable_dev_ignore_queue,
        ));
        let runtime = Arc::new(WorkflowRuntime::new(
            registry.clone(),
            credentials.clone(),
            store.clone(),
            config.clone(),
        ));
        let meter = Arc::new(UsageMeter::new(
            store.clone(),
            Arc::new(TracingBillingAdapter),
        ));
        let ingestion = Arc::new(WebhookIngestion::new(store.clone()));

        let relay = Arc::new(OutboxRelay::new(
            store.clone(),
            queue.clone(),
            OutboxRelayConfig::default(),
        ));
        let scheduler = Arc::new(PollingScheduler::new(
            store.clone(),
            registry.clone(),
            credentials,
            relay.clone(),
            PollingSchedulerConfig::default(),
        ));
        let dispatchers = (0..DISPATCHER_WORKERS)
            .map(|i| {
                Arc::new(Dispatcher::new(
                    store.clone(),
                    driver.clone(),
                    runtime.clone(),
                    meter.clone(),
                    format!("dispatcher-{i}"),
                ))
            })
            .collect();

        let state = ApiState {
            store,
            registry,
            queue,
            runtime,
            meter,
            ingestion,
            config,
        };

        Ok(Application {
            state,
            relay,
            scheduler,
            dispatchers,
            shutdown: CancellationToken::new(),
        })
    }

    /// Spawn the background workers: outbox relay, polling scheduler and
    /// the dispatcher pool.
    pub fn spawn_workers(&self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        handles.push(self.relay.clone().spawn(self.shutdown.clone()));
        handles.push(self.scheduler.clone().spawn(self.shutdown.clone()));
        for dispatcher in &self.dispatchers {
            handles.push(dispatcher.clone().spawn(self.shutdown.clone()));
        }
        handles
    }

    /// Signal every worker to stop at its next boundary.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Serve HTTP and run workers until the process ends.
    pub async fn run(self) -> Result<()> {
        let workers = self.spawn_workers();
        let server = ApiServer::new(self.state.clone());
        let result = server.run().await;
        self.shutdown();
        for handle in workers {
            let _ = handle.await;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn default_manifest_boots_and_passes_parity() {
        let config = PlatformConfig {
            enable_dev_ignore_queue: true,
            ..PlatformConfig::default()
        };
        let app = Application::build(config).await.unwrap();
        // Slack is bound natively, stripe/webflow through the generic
        // client; shopify stays experimental, paypal disabled.
        use crate::engine::Availability;
        assert_eq!(app.state.registry.availability("slack"), Availability::Stable);
        assert_eq!(app.state.registry.availability("stripe"), Availability::Stable);
        assert_eq!(
            app.state.registry.availability("shopify"),
            Availability::Experimental
        );
        assert_eq!(
            app.state.registry.availability("paypal"),
            Availability::Disabled
        );
    }

    #[tokio::test]
    async fn parity_violation_fails_boot() {
        let manifest = ConnectorManifest::from_json(
            r#"{"connectors": [{"id": "ghost", "name": "Ghost", "availability": "stable",
                 "actions": [{"id": "boo"}]}]}"#,
        )
        .unwrap();
        let config = PlatformConfig::default();
        let err = Application::build_with_manifest(config, manifest)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("parity"));
        assert!(err.to_string().contains("ghost"));
    }
}
