// Generic HTTP client - executes JSON-declared connector endpoints

//! # Generic HTTP Client
//!
//! Connectors whose manifest declares a `base_url` and endpoint templates
//! run through this client instead of a hand-written binding. A template
//! names the method, a path with `{param}` placeholders, the parameters
//! copied into the query string, and an optional body template; resolved
//! node parameters fill the placeholders.
//!
//! The client enforces the tenant network policy before every request and
//! surfaces upstream status codes (plus `Retry-After` on 429) so the
//! runtime can classify retries.

use async_trait::async_trait;
use reqwest::Method;
use serde_json::{Map, Value};
use std::time::{Duration, Instant};
use url::Url;

use crate::engine::credentials::CredentialBundle;
use crate::engine::registry::{ConnectorDefinition, ConnectorFunction, EndpointTemplate};

use super::{check_egress, ClientResult, ConnectorClient, ExecuteOptions, PollResult};

pub struct GenericHttpClient {
    definition: ConnectorDefinition,
    http: reqwest::Client,
}

impl GenericHttpClient {
    pub fn new(definition: ConnectorDefinition) -> Self {
        GenericHttpClient {
            definition,
            http: reqwest::Client::new(),
        }
    }

    fn find_action(&self, function_id: &str) -> Option<&ConnectorFunction> {
        self.definition.actions.iter().find(|f| f.id == function_id)
    }

    fn find_trigger_by_poll_method(&self, method: &str) -> Option<&ConnectorFunction> {
        self.definition
            .triggers
            .iter()
            .find(|f| super::derive_poll_method(&f.id) == method)
    }

    /// Build the request URL from the endpoint template and parameters.
    fn build_url(&self, endpoint: &EndpointTemplate, params: &Value) -> Result<Url, String> {
        let base = self
            .definition
            .base_url
            .as_deref()
            .ok_or_else(|| "connector has no base_url".to_string())?;

        let mut path = endpoint.path.clone();
        if let Some(map) = params.as_object() {
            for (key, value) in map {
                let placeholder = format!("{{{key}}}");
                if path.contains(&placeholder) {
                    let rendered = match value {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    path = path.replace(&placeholder, &urlencoding::encode(&rendered));
                }
            }
        }
        if path.contains('{') {
            return Err(format!("unfilled path placeholder in {path}"));
        }

        let mut url = Url::parse(&format!("{}{}", base.trim_end_matches('/'), path))
            .map_err(|e| format!("bad endpoint url: {e}"))?;

        if let Some(map) = params.as_object() {
            let mut query = url.query_pairs_mut();
            for name in &endpoint.query {
                if let Some(value) = map.get(name) {
                    let rendered = match value {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    query.append_pair(name, &rendered);
                }
            }
        }
        Ok(url)
    }

    /// Body: template with `{param}` substitution in string positions, or
    /// the raw parameters for body-carrying methods without a template.
    fn build_body(endpoint: &EndpointTemplate, method: &Method, params: &Value) -> Option<Value> {
        match &endpoint.body {
            Some(template) => Some(fill_template(template, params)),
            None if matches!(*method, Method::POST | Method::PUT | Method::PATCH) => {
                Some(params.clone())
            }
            None => None,
        }
    }

    fn apply_auth(
        &self,
        request: reqwest::RequestBuilder,
        credentials: &CredentialBundle,
    ) -> reqwest::RequestBuilder {
        let creds = &credentials.credentials;
        if let Some(token) = creds
            .get("api_key")
            .or_else(|| creds.get("token"))
            .or_else(|| creds.get("access_token"))
            .and_then(Value::as_str)
        {
            return request.bearer_auth(token);
        }
        if let (Some(user), password) = (
            creds.get("username").and_then(Value::as_str),
            creds.get("password").and_then(Value::as_str),
        ) {
            return request.basic_auth(user, password);
        }
        request
    }

    async fn send(
        &self,
        method: Method,
        endpoint: &EndpointTemplate,
        params: &Value,
        opts: &ExecuteOptions,
    ) -> ClientResult {
        let url = match self.build_url(endpoint, params) {
            Ok(url) => url,
            Err(e) => return ClientResult::failed(e, None),
        };
        if let Some(refusal) = check_egress(&opts.credentials, &url) {
            return ClientResult::failed(refusal, None);
        }

        let mut request = self
            .http
            .request(method.clone(), url)
            .timeout(opts.timeout)
            .header("Idempotency-Key", &opts.idempotency_key);
        request = self.apply_auth(request, &opts.credentials);
        if let Some(body) = Self::build_body(endpoint, &method, params) {
            request = request.json(&body);
        }

        let started = Instant::now();
        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                return ClientResult::failed(
                    format!("{}: network error: {e}", self.definition.id),
                    None,
                )
            }
        };
        let elapsed = started.elapsed();
        let status = response.status();
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs);

        let body: Value = match response.json().await {
            Ok(body) => body,
            Err(_) => Value::Null,
        };

        if status.is_success() {
            ClientResult {
                success: true,
                data: Some(body),
                error: None,
                status_code: Some(status.as_u16()),
                retry_after: None,
                execution_time: elapsed,
            }
        } else {
            ClientResult {
                success: false,
                data: Some(body),
                error: Some(format!(
                    "{} returned {} for org {}",
                    self.definition.id,
                    status.as_u16(),
                    opts.credentials.organization_id
                )),
                status_code: Some(status.as_u16()),
                retry_after,
                execution_time: elapsed,
            }
        }
    }
}

/// Replace `{param}` placeholders in string positions of a body template.
fn fill_template(template: &Value, params: &Value) -> Value {
    match template {
        Value::String(s) => {
            let mut out = s.clone();
            if let Some(map) = params.as_object() {
                for (key, value) in map {
                    let placeholder = format!("{{{key}}}");
                    if out.contains(&placeholder) {
                        let rendered = match value {
                            Value::String(v) => v.clone(),
                            other => other.to_string(),
                        };
                        out = out.replace(&placeholder, &rendered);
                    }
                }
            }
            Value::String(out)
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), fill_template(v, params)))
                .collect::<Map<String, Value>>(),
        ),
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| fill_template(v, params)).collect())
        }
        other => other.clone(),
    }
}

#[async_trait]
impl ConnectorClient for GenericHttpClient {
    fn connector_id(&self) -> &str {
        &self.definition.id
    }

    async fn test_connection(&self, credentials: &CredentialBundle) -> ClientResult {
        let Some(base) = self.definition.base_url.as_deref() else {
            return ClientResult::failed("connector has no base_url", None);
        };
        let url = match Url::parse(base) {
            Ok(url) => url,
            Err(e) => return ClientResult::failed(format!("bad base_url: {e}"), None),
        };
        if !credentials.network_policy.permits_host(url.host_str().unwrap_or_default()) {
            return ClientResult::failed("base_url refused by network policy", None);
        }

        let started = Instant::now();
        let mut request = self.http.get(url).timeout(Duration::from_secs(10));
        request = self.apply_auth(
            request,
            credentials,
        );
        match request.send().await {
            Ok(response) => {
                let code = response.status().as_u16();
                if response.status().is_success() || code == 401 || code == 403 {
                    // Reaching the API at all proves the endpoint; auth
                    // errors are reported as data for the connections UI.
                    ClientResult {
                        success: code < 400,
                        data: Some(serde_json::json!({"status": code})),
                        error: (code >= 400).then(|| format!("authentication failed ({code})")),
                        status_code: Some(code),
                        retry_after: None,
                        execution_time: started.elapsed(),
                    }
                } else {
                    ClientResult::failed(format!("endpoint returned {code}"), Some(code))
                }
            }
            Err(e) => ClientResult::failed(format!("network error: {e}"), None),
        }
    }

    async fn execute(
        &self,
        function_id: &str,
        params: &Value,
        opts: &ExecuteOptions,
    ) -> ClientResult {
        let Some(function) = self.find_action(function_id) else {
            return ClientResult::failed(
                format!("{} does not declare action {function_id}", self.definition.id),
                Some(404),
            );
        };
        let Some(endpoint) = &function.endpoint else {
            return ClientResult::failed(
                format!("action {function_id} has no endpoint template"),
                None,
            );
        };
        let method = endpoint
            .method
            .parse::<Method>()
            .unwrap_or(Method::POST);
        self.send(method, endpoint, params, opts).await
    }

    async fn poll(&self, method: &str, params: &Value, opts: &ExecuteOptions) -> PollResult {
        let Some(trigger) = self.find_trigger_by_poll_method(method) else {
            tracing::debug!(connector = %self.definition.id, method, "no trigger for poll method");
            return PollResult::default();
        };
        let Some(endpoint) = &trigger.endpoint else {
            return PollResult::default();
        };
        let http_method = endpoint.method.parse::<Method>().unwrap_or(Method::GET);
        let result = self.send(http_method, endpoint, params, opts).await;

        let items = result
            .data
            .as_ref()
            .map(extract_items)
            .unwrap_or_default();
        PollResult { items }
    }
}

/// Pull the item list out of common poll-response shapes: a bare array,
/// `{items: [...]}`, `{data: [...]}` or `{results: [...]}`.
fn extract_items(body: &Value) -> Vec<Value> {
    match body {
        Value::Array(items) => items.clone(),
        Value::Object(map) => ["items", "data", "results"]
            .iter()
            .find_map(|key| map.get(*key).and_then(Value::as_array))
            .cloned()
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NetworkPolicy;
    use serde_json::json;

    fn definition() -> ConnectorDefinition {
        serde_json::from_value(json!({
            "id": "webflow",
            "name": "Webflow",
            "availability": "stable",
            "base_url": "https://api.webflow.com",
            "actions": [{
                "id": "publish_site",
                "endpoint": {
                    "method": "POST",
                    "path": "/sites/{site_id}/publish",
                    "query": ["dry"],
                    "body": {"domains": "{domains}"}
                }
            }],
            "triggers": [{
                "id": "form_submission",
                "endpoint": {"method": "GET", "path": "/forms/{form_id}/submissions"}
            }]
        }))
        .unwrap()
    }

    #[test]
    fn url_building_substitutes_and_encodes() {
        let client = GenericHttpClient::new(definition());
        let endpoint = definition().actions[0].endpoint.clone().unwrap();
        let url = client
            .build_url(&endpoint, &json!({"site_id": "my site", "dry": true}))
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://api.webflow.com/sites/my%20site/publish?dry=true"
        );
    }

    #[test]
    fn unfilled_placeholder_is_an_error() {
        let client = GenericHttpClient::new(definition());
        let endpoint = definition().actions[0].endpoint.clone().unwrap();
        let err = client.build_url(&endpoint, &json!({})).unwrap_err();
        assert!(err.contains("unfilled"));
    }

    #[test]
    fn body_template_substitution() {
        let endpoint = definition().actions[0].endpoint.clone().unwrap();
        let body = GenericHttpClient::build_body(
            &endpoint,
            &Method::POST,
            &json!({"domains": "example.com"}),
        )
        .unwrap();
        assert_eq!(body, json!({"domains": "example.com"}));
    }

    #[test]
    fn poll_method_maps_to_trigger() {
        let client = GenericHttpClient::new(definition());
        assert!(client.find_trigger_by_poll_method("pollFormSubmission").is_some());
        assert!(client.find_trigger_by_poll_method("pollGhost").is_none());
    }

    #[test]
    fn item_extraction_shapes() {
        assert_eq!(extract_items(&json!([1, 2])), vec![json!(1), json!(2)]);
        assert_eq!(extract_items(&json!({"items": [1]})), vec![json!(1)]);
        assert_eq!(extract_items(&json!({"data": [2]})), vec![json!(2)]);
        assert_eq!(extract_items(&json!({"other": [3]})), Vec::<Value>::new());
    }

    #[tokio::test]
    async fn egress_policy_blocks_disallowed_host() {
        let client = GenericHttpClient::new(definition());
        let mut bundle = CredentialBundle::inline(json!({"api_key": "k"}), "org-1");
        bundle.network_policy = NetworkPolicy {
            allowed_domains: vec!["internal.example.com".into()],
            allowed_ip_ranges: vec![],
        };
        let opts = ExecuteOptions::new(bundle, "exec-1", "node-1");
        let result = client
            .execute("publish_site", &json!({"site_id": "s1", "domains": "d"}), &opts)
            .await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("network policy"));
    }
}
