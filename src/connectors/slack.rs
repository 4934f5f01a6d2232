// Slack connector client

//! Hand-written binding for the Slack Web API. Action functions map onto
//! Web API methods; the poll method backs the `message_received` trigger
//! via `conversations.history` with the watermark as `oldest`.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use url::Url;

use crate::engine::credentials::CredentialBundle;

use super::{check_egress, ClientResult, ConnectorClient, ExecuteOptions, PollResult};

const SLACK_API_BASE: &str = "https://slack.com/api";

pub struct SlackClient {
    http: reqwest::Client,
    base_url: String,
}

impl SlackClient {
    pub fn new() -> Self {
        SlackClient {
            http: reqwest::Client::new(),
            base_url: SLACK_API_BASE.to_string(),
        }
    }

    /// Test seam: point the client at a fake server.
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        SlackClient {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    fn token(credentials: &CredentialBundle) -> Option<&str> {
        credentials
            .credentials
            .get("access_token")
            .or_else(|| credentials.credentials.get("token"))
            .and_then(Value::as_str)
    }

    /// Map a declared function id onto a Slack Web API method.
    fn api_method(function_id: &str) -> &str {
        match function_id {
            "send_message" => "chat.postMessage",
            "update_message" => "chat.update",
            "add_reaction" => "reactions.add",
            "create_channel" => "conversations.create",
            "invite_to_channel" => "conversations.invite",
            "upload_file" => "files.upload",
            // Raw Web API method names pass through for power users.
            other => other,
        }
    }

    async fn call(
        &self,
        method: &str,
        body: &Value,
        credentials: &CredentialBundle,
        timeout: Duration,
        idempotency_key: Option<&str>,
    ) -> ClientResult {
        let raw = format!("{}/{}", self.base_url.trim_end_matches('/'), method);
        let url = match Url::parse(&raw) {
            Ok(url) => url,
            Err(e) => return ClientResult::failed(format!("bad url: {e}"), None),
        };
        if let Some(refusal) = check_egress(credentials, &url) {
            return ClientResult::failed(refusal, None);
        }
        let Some(token) = Self::token(credentials) else {
            return ClientResult::failed("slack: no token in credentials", Some(401));
        };

        let mut request = self
            .http
            .post(url)
            .bearer_auth(token)
            .timeout(timeout)
            .json(body);
        if let Some(key) = idempotency_key {
            // Slack dedupes on client_msg_id for message posts.
            request = request.header("X-Idempotency-Key", key);
        }

        let started = Instant::now();
        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => return ClientResult::failed(format!("slack: network error: {e}"), None),
        };
        let elapsed = started.elapsed();
        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs);
        let payload: Value = response.json().await.unwrap_or(Value::Null);

        // Slack reports failures in-band: {"ok": false, "error": "..."}.
        let ok = payload.get("ok").and_then(Value::as_bool).unwrap_or(false);
        if ok {
            ClientResult {
                success: true,
                data: Some(payload),
                error: None,
                status_code: Some(status),
                retry_after: None,
                execution_time: elapsed,
            }
        } else {
            let reason = payload
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown_error");
            ClientResult {
                success: false,
                data: Some(payload.clone()),
                error: Some(format!("slack: {reason} (HTTP {status})")),
                status_code: Some(status),
                retry_after,
                execution_time: elapsed,
            }
        }
    }
}

impl Default for SlackClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConnectorClient for SlackClient {
    fn connector_id(&self) -> &str {
        "slack"
    }

    async fn test_connection(&self, credentials: &CredentialBundle) -> ClientResult {
        self.call("auth.test", &json!({}), credentials, Duration::from_secs(10), None)
            .await
    }

    async fn execute(
        &self,
        function_id: &str,
        params: &Value,
        opts: &ExecuteOptions,
    ) -> ClientResult {
        let method = Self::api_method(function_id);
        let mut body = params.clone();
        if method == "chat.postMessage" {
            // client_msg_id carries the idempotency key so retried posts
            // collapse into one message.
            if let Value::Object(map) = &mut body {
                map.entry("client_msg_id".to_string())
                    .or_insert_with(|| json!(opts.idempotency_key));
            }
        }
        self.call(
            method,
            &body,
            &opts.credentials,
            opts.timeout,
            Some(&opts.idempotency_key),
        )
        .await
    }

    async fn poll(&self, method: &str, params: &Value, opts: &ExecuteOptions) -> PollResult {
        if method != "pollMessageReceived" {
            tracing::debug!(method, "slack: unsupported poll method");
            return PollResult::default();
        }
        let mut body = json!({
            "channel": params.get("channel").cloned().unwrap_or(Value::Null),
            "limit": 100,
        });
        if let Some(since) = params.get("since").and_then(Value::as_str) {
            // conversations.history takes a Unix `oldest` watermark.
            if let Ok(ts) = chrono::DateTime::parse_from_rfc3339(since) {
                body["oldest"] = json!(ts.timestamp().to_string());
            }
        }
        let result = self
            .call(
                "conversations.history",
                &body,
                &opts.credentials,
                opts.timeout,
                None,
            )
            .await;
        let items = result
            .data
            .as_ref()
            .and_then(|d| d.get("messages"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        PollResult { items }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn function_id_mapping() {
        assert_eq!(SlackClient::api_method("send_message"), "chat.postMessage");
        assert_eq!(SlackClient::api_method("add_reaction"), "reactions.add");
        assert_eq!(SlackClient::api_method("chat.meMessage"), "chat.meMessage");
    }

    #[tokio::test]
    async fn missing_token_fails_fast() {
        let client = SlackClient::new();
        let bundle = CredentialBundle::inline(json!({}), "org-1");
        let opts = ExecuteOptions::new(bundle, "exec", "node");
        let result = client.execute("send_message", &json!({}), &opts).await;
        assert!(!result.success);
        assert_eq!(result.status_code, Some(401));
        assert!(result.error.unwrap().contains("no token"));
    }

    #[tokio::test]
    async fn network_policy_blocks_slack_when_not_allowlisted() {
        let client = SlackClient::new();
        let mut bundle = CredentialBundle::inline(json!({"token": "xoxb"}), "org-1");
        bundle.network_policy = crate::models::NetworkPolicy {
            allowed_domains: vec!["internal.only".into()],
            allowed_ip_ranges: vec![],
        };
        let opts = ExecuteOptions::new(bundle, "exec", "node");
        let result = client.execute("send_message", &json!({}), &opts).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("network policy"));
    }
}
