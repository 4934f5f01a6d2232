// Switchyard engine layer
// Execution services between the domain models and the outside world

//! # Engine Module
//!
//! Everything that moves: the connector registry, parameter and credential
//! resolution, the storage abstraction with its in-memory and Postgres
//! backends, the admission queue with its drivers, the dispatcher, the
//! workflow runtime, the outbox relay, the polling scheduler, and the
//! usage meter.
//!
//! Services are constructed once at the application root
//! ([`crate::server::Application`]) and shared as `Arc`s; none of them is
//! a global. The audit trail has no service of its own: writers append
//! [`crate::models::AuditEntry`] rows through the storage layer at each
//! significant transition.

/// Connector manifest, availability resolution, tier gating, parity check.
pub mod registry;

/// Ref-path parameter resolution (`steps.X.path`, filter predicates).
pub mod resolver;

/// Sandboxed inline-expression evaluator.
pub mod expression;

/// Credential resolution and sealing.
pub mod credentials;

/// Storage traits + in-memory backend.
pub mod storage;

/// Postgres backend.
pub mod postgres;

/// Admission queue, queue drivers, rate limiting.
pub mod queue;

/// Worker loop claiming jobs into the runtime.
pub mod dispatcher;

/// Graph execution.
pub mod runtime;

/// Ingestion-to-queue relay with bounded replay.
pub mod outbox;

/// Interval polling with watermarks and dedupe.
pub mod polling;

/// Metering, quota checks, alerts, exports, proration.
pub mod meter;

pub use credentials::{CredentialBundle, CredentialCipher, CredentialResolver, CredentialSource};
pub use dispatcher::Dispatcher;
pub use expression::{EvalOutcome, EvalScope};
pub use meter::{BillingAdapter, TracingBillingAdapter, UsageMeter};
pub use outbox::{OutboxRelay, OutboxRelayConfig};
pub use polling::{PollingScheduler, PollingSchedulerConfig};
pub use postgres::PostgresStorage;
pub use queue::{ExecutionQueue, InMemoryQueueDriver, NatsQueueDriver, QueueDriver, QueueHealth};
pub use registry::{
    Availability, ConnectorDefinition, ConnectorFilter, ConnectorManifest, ConnectorRegistry,
};
pub use resolver::ParameterResolver;
pub use runtime::WorkflowRuntime;
pub use storage::{InMemoryStorage, PlatformStore};
