// Connector client contract
// Every vendor binding implements the same uniform surface

//! # Connector Clients
//!
//! A connector client speaks one vendor's API on behalf of workflow action
//! and trigger nodes. All clients implement [`ConnectorClient`]; the
//! registry binds connector ids to client instances and the runtime invokes
//! them through the trait only, so vendor quirks never leak upward.
//!
//! Cross-cutting rules every implementation observes:
//!
//! - The credentials bundle's network policy is enforced before any
//!   outbound request: hosts outside the tenant allowlist are refused.
//! - Upstream HTTP status codes are surfaced on the result so the runtime
//!   can classify retryability.
//! - The `idempotency_key` is forwarded to vendors that support one;
//!   duplicate keys must be treated as no-ops returning the prior result.
//! - Credentials never appear in logs or error strings.

pub mod generic;
pub mod slack;

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use crate::engine::credentials::CredentialBundle;

/// Outcome of a connector invocation.
#[derive(Debug, Clone, Default)]
pub struct ClientResult {
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<String>,
    /// Upstream HTTP status, when the call got far enough to have one.
    pub status_code: Option<u16>,
    /// Parsed `Retry-After`, honored by the runtime's retry machinery.
    pub retry_after: Option<Duration>,
    pub execution_time: Duration,
}

impl ClientResult {
    pub fn ok(data: Value, execution_time: Duration) -> Self {
        ClientResult {
            success: true,
            data: Some(data),
            error: None,
            status_code: Some(200),
            retry_after: None,
            execution_time,
        }
    }

    pub fn failed(error: impl Into<String>, status_code: Option<u16>) -> Self {
        ClientResult {
            success: false,
            data: None,
            error: Some(error.into()),
            status_code,
            retry_after: None,
            execution_time: Duration::ZERO,
        }
    }
}

/// Items returned by a trigger poll.
#[derive(Debug, Clone, Default)]
pub struct PollResult {
    pub items: Vec<Value>,
}

/// Per-invocation options handed to a client.
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    pub credentials: CredentialBundle,
    pub execution_id: String,
    pub node_id: String,
    /// `executionId:nodeId`; composes with vendor-side dedupe to make
    /// retries safe where the vendor supports it.
    pub idempotency_key: String,
    /// Soft timeout for the underlying HTTP call.
    pub timeout: Duration,
}

impl ExecuteOptions {
    pub fn new(credentials: CredentialBundle, execution_id: &str, node_id: &str) -> Self {
        ExecuteOptions {
            credentials,
            execution_id: execution_id.to_string(),
            node_id: node_id.to_string(),
            idempotency_key: format!("{execution_id}:{node_id}"),
            timeout: Duration::from_secs(30),
        }
    }
}

/// The uniform client contract.
#[async_trait]
pub trait ConnectorClient: Send + Sync {
    /// Connector id this client serves.
    fn connector_id(&self) -> &str;

    /// Cheap credential check, used by the connections UI.
    async fn test_connection(&self, credentials: &CredentialBundle) -> ClientResult;

    /// Invoke one declared action.
    async fn execute(&self, function_id: &str, params: &Value, opts: &ExecuteOptions)
        -> ClientResult;

    /// Invoke a polling method (`pollNewRows`, `pollMessages`...). The
    /// default refuses; clients with polling triggers override.
    async fn poll(&self, method: &str, _params: &Value, _opts: &ExecuteOptions) -> PollResult {
        tracing::debug!(method, connector = self.connector_id(), "poll not supported");
        PollResult::default()
    }
}

/// Enforce the tenant egress policy for a target URL. Returns the refusal
/// message when the host is not allowlisted.
pub fn check_egress(credentials: &CredentialBundle, url: &url::Url) -> Option<String> {
    let policy = &credentials.network_policy;
    if policy.is_unrestricted() {
        return None;
    }
    let host = url.host_str().unwrap_or_default();
    if policy.permits_host(host) {
        None
    } else {
        Some(format!(
            "egress to {host} refused by organization network policy"
        ))
    }
}

/// Derive the poll method name for a trigger function id:
/// `new_rows` / `new-rows` / `newRows` all become `pollNewRows`.
pub fn derive_poll_method(trigger_id: &str) -> String {
    let mut out = String::from("poll");
    let mut upper_next = true;
    for c in trigger_id.chars() {
        if c == '_' || c == '-' || c == '.' {
            upper_next = true;
            continue;
        }
        if upper_next {
            out.extend(c.to_uppercase());
            upper_next = false;
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_method_derivation() {
        assert_eq!(derive_poll_method("new_rows"), "pollNewRows");
        assert_eq!(derive_poll_method("message-received"), "pollMessageReceived");
        assert_eq!(derive_poll_method("newRows"), "pollNewRows");
        assert_eq!(derive_poll_method("tick"), "pollTick");
    }
}
