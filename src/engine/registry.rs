// Connector registry - the single source of truth for "what can a workflow do"

//! # Connector Registry
//!
//! Connector definitions come from a JSON manifest (actions, triggers,
//! authentication descriptor, pricing tier, optional base URL). The
//! registry binds definitions to concrete [`ConnectorClient`]
//! implementations, resolves effective availability, gates listings by the
//! caller's plan tier, and answers O(1) `role.connector.function` lookups
//! for the runtime.
//!
//! ## Availability resolution (strict)
//!
//! The effective availability of a connector is the intersection of its
//! declared availability and "has a bound client":
//!
//! - declared `disabled` always wins;
//! - no bound client caps the result at `experimental`, regardless of what
//!   the JSON claims;
//! - `stable` therefore means "declared stable AND executable".
//!
//! ## Startup parity rule
//!
//! After binding (including generic auto-registration), every connector
//! that DECLARES `stable` must have a client. [`ConnectorRegistry::verify_parity`]
//! fails startup with the full offender listing otherwise; silent drift
//! between manifest and implementations is the failure mode this exists to
//! prevent.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::connectors::{generic::GenericHttpClient, ConnectorClient};
use crate::models::{Organization, PlanTier};
use crate::{Result, SwitchyardError};

/// Availability as declared in the manifest and as resolved by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    Stable,
    Experimental,
    Disabled,
}

impl Default for Availability {
    fn default() -> Self {
        Availability::Experimental
    }
}

/// Whether a function is an action or a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FunctionKind {
    Action,
    Trigger,
}

/// HTTP endpoint template for generic-client execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointTemplate {
    pub method: String,
    /// Path with `{param}` placeholders, joined onto the connector base URL.
    pub path: String,
    /// Parameter names copied into the query string.
    #[serde(default)]
    pub query: Vec<String>,
    /// JSON body template; `{param}` placeholders in string positions are
    /// substituted from the resolved parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

/// One declared action or trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorFunction {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON schema for the function's parameters, when declared.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
    /// Endpoint template for the generic HTTP client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<EndpointTemplate>,
    /// Native runtimes, in preference order. Defaults to `["native"]`.
    #[serde(default = "default_runtimes")]
    pub runtimes: Vec<String>,
    /// Fallback runtimes tried when no native runtime is available.
    #[serde(default)]
    pub fallback_runtimes: Vec<String>,
}

fn default_runtimes() -> Vec<String> {
    vec!["native".to_string()]
}

/// Rate-limit hints from the manifest, forwarded to the queue.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitHints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests_per_minute: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<u32>,
}

/// One connector definition from the manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorDefinition {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub availability: Availability,
    #[serde(default)]
    pub hidden: bool,
    /// Minimum plan tier that may use this connector.
    #[serde(default = "default_tier")]
    pub pricing_tier: PlanTier,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Authentication descriptor (scheme, fields). Opaque to the engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication: Option<Value>,
    #[serde(default)]
    pub actions: Vec<ConnectorFunction>,
    #[serde(default)]
    pub triggers: Vec<ConnectorFunction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limits: Option<RateLimitHints>,
}

fn default_tier() -> PlanTier {
    PlanTier::Free
}

impl ConnectorDefinition {
    /// Eligible for generic auto-binding: a base URL and at least one
    /// declared function.
    pub fn generic_bindable(&self) -> bool {
        self.base_url.is_some() && (!self.actions.is_empty() || !self.triggers.is_empty())
    }

    pub fn function(&self, kind: FunctionKind, id: &str) -> Option<&ConnectorFunction> {
        let list = match kind {
            FunctionKind::Action => &self.actions,
            FunctionKind::Trigger => &self.triggers,
        };
        list.iter().find(|f| f.id == id)
    }
}

/// The whole manifest document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectorManifest {
    pub connectors: Vec<ConnectorDefinition>,
}

impl ConnectorManifest {
    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| SwitchyardError::Internal(format!("manifest read: {e}")))?;
        Self::from_json(&raw)
    }
}

/// Resolved runtime choice for one connector operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeChoice {
    Native(String),
    Fallback(String),
    /// The only viable runtime is Apps Script and its gate is off.
    AppsScriptBlocked,
    Unavailable,
}

/// Listing entry returned to API callers and the node catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorListing {
    pub id: String,
    pub name: String,
    pub category: String,
    pub availability: Availability,
    /// Human status: `Ready`, `Preview`, `Disabled`.
    pub status_label: String,
    pub has_implementation: bool,
    pub pricing_tier: PlanTier,
}

/// Listing filter.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectorFilter<'a> {
    pub organization: Option<&'a Organization>,
    pub include_hidden: bool,
    pub include_disabled: bool,
}

/// O(1) function lookup payload.
#[derive(Debug, Clone)]
pub struct FunctionEntry {
    pub connector_id: String,
    pub kind: FunctionKind,
    pub function: ConnectorFunction,
}

/// The registry proper.
pub struct ConnectorRegistry {
    definitions: HashMap<String, ConnectorDefinition>,
    /// Declaration order of the manifest, for stable listings.
    order: Vec<String>,
    clients: HashMap<String, Arc<dyn ConnectorClient>>,
    functions: HashMap<String, FunctionEntry>,
}

impl ConnectorRegistry {
    /// Build from a manifest. Bind concrete clients with
    /// [`bind_client`](Self::bind_client), optionally auto-bind generic
    /// clients, then call [`verify_parity`](Self::verify_parity) before
    /// serving traffic.
    pub fn new(manifest: ConnectorManifest) -> Self {
        let mut definitions = HashMap::new();
        let mut order = Vec::new();
        let mut functions = HashMap::new();

        for def in manifest.connectors {
            for action in &def.actions {
                functions.insert(
                    format!("action.{}.{}", def.id, action.id),
                    FunctionEntry {
                        connector_id: def.id.clone(),
                        kind: FunctionKind::Action,
                        function: action.clone(),
                    },
                );
            }
            for trigger in &def.triggers {
                functions.insert(
                    format!("trigger.{}.{}", def.id, trigger.id),
                    FunctionEntry {
                        connector_id: def.id.clone(),
                        kind: FunctionKind::Trigger,
                        function: trigger.clone(),
                    },
                );
            }
            order.push(def.id.clone());
            definitions.insert(def.id.clone(), def);
        }

        ConnectorRegistry {
            definitions,
            order,
            clients: HashMap::new(),
            functions,
        }
    }

    /// Bind a concrete client. The client's `connector_id` picks the slot.
    pub fn bind_client(&mut self, client: Arc<dyn ConnectorClient>) {
        self.clients.insert(client.connector_id().to_string(), client);
    }

    /// Auto-bind the generic HTTP client to every eligible connector that
    /// has no concrete binding yet.
    pub fn auto_bind_generic(&mut self) {
        let eligible: Vec<String> = self
            .order
            .iter()
            .filter(|id| {
                !self.clients.contains_key(*id)
                    && self
                        .definitions
                        .get(*id)
                        .map(ConnectorDefinition::generic_bindable)
                        .unwrap_or(false)
            })
            .cloned()
            .collect();
        for id in eligible {
            if let Some(def) = self.definitions.get(&id) {
                tracing::info!(connector = %id, "auto-binding generic HTTP client");
                self.clients
                    .insert(id.clone(), Arc::new(GenericHttpClient::new(def.clone())));
            }
        }
    }

    /// Fatal startup check: every connector that declares `stable` must
    /// have a bound client. Returns the full offender list in the error.
    pub fn verify_parity(&self) -> Result<()> {
        let mut missing: Vec<&str> = self
            .order
            .iter()
            .filter(|id| {
                self.definitions
                    .get(*id)
                    .map(|d| d.availability == Availability::Stable)
                    .unwrap_or(false)
                    && !self.clients.contains_key(*id)
            })
            .map(String::as_str)
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        missing.sort_unstable();
        Err(SwitchyardError::Internal(format!(
            "connector parity violation: stable connectors without a client: {}",
            missing.join(", ")
        )))
    }

    pub fn definition(&self, connector_id: &str) -> Option<&ConnectorDefinition> {
        self.definitions.get(connector_id)
    }

    /// Effective availability under the strict resolver.
    pub fn availability(&self, connector_id: &str) -> Availability {
        let Some(def) = self.definitions.get(connector_id) else {
            return Availability::Disabled;
        };
        match def.availability {
            Availability::Disabled => Availability::Disabled,
            declared => {
                if self.clients.contains_key(connector_id) {
                    declared
                } else {
                    // No client binding caps the claim at experimental.
                    Availability::Experimental
                }
            }
        }
    }

    /// Client lookup, only for connectors whose effective availability is
    /// stable. Experimental connectors execute only through dry-runs.
    pub fn get_api_client(&self, connector_id: &str) -> Option<Arc<dyn ConnectorClient>> {
        if self.availability(connector_id) != Availability::Stable {
            return None;
        }
        self.clients.get(connector_id).cloned()
    }

    /// Client lookup regardless of availability; dry-runs and connection
    /// tests use this.
    pub fn get_any_client(&self, connector_id: &str) -> Option<Arc<dyn ConnectorClient>> {
        self.clients.get(connector_id).cloned()
    }

    /// O(1) lookup by full node type (`action.slack.send_message`).
    pub fn get_function_by_type(&self, node_type: &str) -> Option<&FunctionEntry> {
        self.functions.get(node_type)
    }

    /// Is `organization` allowed to use this connector? Plan rank must
    /// reach the connector's tier unless a per-org override flag grants it.
    pub fn tier_allows(&self, def: &ConnectorDefinition, organization: &Organization) -> bool {
        organization.plan.rank() >= def.pricing_tier.rank()
            || organization.feature_enabled(&format!("connector_override_{}", def.id))
    }

    /// Filtered listing for API callers.
    pub fn list_connectors(&self, filter: ConnectorFilter<'_>) -> Vec<ConnectorListing> {
        self.order
            .iter()
            .filter_map(|id| self.definitions.get(id))
            .filter(|def| filter.include_hidden || !def.hidden)
            .filter(|def| {
                filter.include_disabled || self.availability(&def.id) != Availability::Disabled
            })
            .filter(|def| match filter.organization {
                Some(org) => self.tier_allows(def, org),
                None => true,
            })
            .map(|def| self.listing_for(def))
            .collect()
    }

    fn listing_for(&self, def: &ConnectorDefinition) -> ConnectorListing {
        let availability = self.availability(&def.id);
        let has_implementation = self.clients.contains_key(&def.id);
        let status_label = match availability {
            Availability::Stable => "Ready",
            Availability::Experimental => "Preview",
            Availability::Disabled => "Disabled",
        };
        ConnectorListing {
            id: def.id.clone(),
            name: def.name.clone(),
            category: def.category.clone(),
            availability,
            status_label: status_label.to_string(),
            has_implementation,
            pricing_tier: def.pricing_tier,
        }
    }

    /// Aggregated shape for the visual builder: implemented connectors
    /// first, then by manifest order, each with its functions.
    pub fn node_catalog(&self) -> Vec<CatalogEntry> {
        let mut entries: Vec<CatalogEntry> = self
            .order
            .iter()
            .filter_map(|id| self.definitions.get(id))
            .filter(|def| !def.hidden && self.availability(&def.id) != Availability::Disabled)
            .map(|def| CatalogEntry {
                connector: self.listing_for(def),
                actions: def.actions.clone(),
                triggers: def.triggers.clone(),
            })
            .collect();
        entries.sort_by_key(|e| !e.connector.has_implementation);
        entries
    }

    /// Resolve the runtime for one connector operation.
    pub fn resolve_runtime(
        &self,
        connector_id: &str,
        function: &ConnectorFunction,
        apps_script_enabled: bool,
    ) -> RuntimeChoice {
        let has_client = self.clients.contains_key(connector_id);
        let viable = |runtime: &str| match runtime {
            "apps_script" => apps_script_enabled,
            _ => has_client,
        };

        for runtime in &function.runtimes {
            if viable(runtime) {
                return RuntimeChoice::Native(runtime.clone());
            }
        }
        for runtime in &function.fallback_runtimes {
            if viable(runtime) {
                return RuntimeChoice::Fallback(runtime.clone());
            }
        }

        // Nothing viable. Distinguish "everything was apps_script and the
        // gate is off" so the caller can surface the precise reason.
        let all = function
            .runtimes
            .iter()
            .chain(function.fallback_runtimes.iter());
        let mut saw_any = false;
        let mut all_apps_script = true;
        for runtime in all {
            saw_any = true;
            if runtime != "apps_script" {
                all_apps_script = false;
            }
        }
        if saw_any && all_apps_script {
            RuntimeChoice::AppsScriptBlocked
        } else {
            RuntimeChoice::Unavailable
        }
    }
}

/// One node-catalog row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub connector: ConnectorListing,
    pub actions: Vec<ConnectorFunction>,
    pub triggers: Vec<ConnectorFunction>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::slack::SlackClient;

    fn manifest() -> ConnectorManifest {
        serde_json::from_value(serde_json::json!({
            "connectors": [
                {
                    "id": "slack",
                    "name": "Slack",
                    "category": "communication",
                    "availability": "stable",
                    "actions": [{"id": "send_message", "name": "Send Message"}],
                    "triggers": [{"id": "message_received", "name": "Message Received"}]
                },
                {
                    "id": "webflow",
                    "name": "Webflow",
                    "category": "cms",
                    "availability": "stable",
                    "pricing_tier": "professional",
                    "base_url": "https://api.webflow.com",
                    "actions": [{"id": "publish_site", "name": "Publish Site",
                                  "endpoint": {"method": "POST", "path": "/sites/{site_id}/publish"}}]
                },
                {
                    "id": "legacy",
                    "name": "Legacy Thing",
                    "availability": "disabled",
                    "actions": [{"id": "noop"}]
                },
                {
                    "id": "wishful",
                    "name": "Wishful",
                    "availability": "stable",
                    "actions": [{"id": "dream"}]
                }
            ]
        }))
        .unwrap()
    }

    fn org(plan: PlanTier) -> Organization {
        Organization::new("org-1", "Acme", plan, "us-east-1")
    }

    #[test]
    fn strict_availability_caps_unbound_connectors() {
        let registry = ConnectorRegistry::new(manifest());
        // Declared stable but nothing bound: experimental.
        assert_eq!(registry.availability("slack"), Availability::Experimental);
        assert_eq!(registry.availability("legacy"), Availability::Disabled);
        assert_eq!(registry.availability("ghost"), Availability::Disabled);
    }

    #[test]
    fn binding_restores_declared_stability() {
        let mut registry = ConnectorRegistry::new(manifest());
        registry.bind_client(Arc::new(SlackClient::new()));
        assert_eq!(registry.availability("slack"), Availability::Stable);
        assert!(registry.get_api_client("slack").is_some());
        // Experimental connectors never serve production clients.
        assert!(registry.get_api_client("wishful").is_none());
    }

    #[test]
    fn generic_auto_binding_covers_declared_endpoints() {
        let mut registry = ConnectorRegistry::new(manifest());
        registry.auto_bind_generic();
        assert_eq!(registry.availability("webflow"), Availability::Stable);
        // No base_url: not eligible.
        assert_eq!(registry.availability("wishful"), Availability::Experimental);
    }

    #[test]
    fn parity_check_lists_all_offenders() {
        let mut registry = ConnectorRegistry::new(manifest());
        registry.auto_bind_generic();
        let err = registry.verify_parity().unwrap_err().to_string();
        assert!(err.contains("slack"));
        assert!(err.contains("wishful"));
        assert!(!err.contains("webflow"));

        registry.bind_client(Arc::new(SlackClient::new()));
        let err = registry.verify_parity().unwrap_err().to_string();
        assert!(!err.contains("slack"));
    }

    #[test]
    fn tier_gating_with_override() {
        let registry = ConnectorRegistry::new(manifest());
        let webflow = registry.definition("webflow").unwrap();

        assert!(!registry.tier_allows(webflow, &org(PlanTier::Free)));
        assert!(registry.tier_allows(webflow, &org(PlanTier::Professional)));
        assert!(registry.tier_allows(webflow, &org(PlanTier::EnterprisePlus)));

        let mut free = org(PlanTier::Free);
        free.feature_flags
            .insert("connector_override_webflow".into(), true);
        assert!(registry.tier_allows(webflow, &free));
    }

    #[test]
    fn listing_respects_tier_and_hidden() {
        let mut registry = ConnectorRegistry::new(manifest());
        registry.auto_bind_generic();
        let free = org(PlanTier::Free);
        let listed = registry.list_connectors(ConnectorFilter {
            organization: Some(&free),
            ..ConnectorFilter::default()
        });
        let ids: Vec<&str> = listed.iter().map(|l| l.id.as_str()).collect();
        assert!(ids.contains(&"slack"));
        assert!(!ids.contains(&"webflow")); // tier-gated
        assert!(!ids.contains(&"legacy")); // disabled
    }

    #[test]
    fn function_lookup_is_by_full_type() {
        let registry = ConnectorRegistry::new(manifest());
        let entry = registry
            .get_function_by_type("action.slack.send_message")
            .unwrap();
        assert_eq!(entry.connector_id, "slack");
        assert_eq!(entry.kind, FunctionKind::Action);
        assert!(registry.get_function_by_type("action.slack.nope").is_none());
        assert!(registry
            .get_function_by_type("trigger.slack.message_received")
            .is_some());
    }

    #[test]
    fn catalog_orders_implemented_first() {
        let mut registry = ConnectorRegistry::new(manifest());
        registry.auto_bind_generic();
        let catalog = registry.node_catalog();
        assert!(catalog[0].connector.has_implementation);
    }

    #[test]
    fn runtime_resolution() {
        let mut registry = ConnectorRegistry::new(manifest());
        registry.bind_client(Arc::new(SlackClient::new()));
        let send = registry
            .get_function_by_type("action.slack.send_message")
            .unwrap()
            .function
            .clone();
        assert_eq!(
            registry.resolve_runtime("slack", &send, false),
            RuntimeChoice::Native("native".into())
        );

        let gated: ConnectorFunction = serde_json::from_value(serde_json::json!({
            "id": "script_only",
            "runtimes": ["apps_script"]
        }))
        .unwrap();
        assert_eq!(
            registry.resolve_runtime("slack", &gated, false),
            RuntimeChoice::AppsScriptBlocked
        );
        assert_eq!(
            registry.resolve_runtime("slack", &gated, true),
            RuntimeChoice::Native("apps_script".into())
        );

        let unbound: ConnectorFunction = serde_json::from_value(serde_json::json!({
            "id": "dream"
        }))
        .unwrap();
        assert_eq!(
            registry.resolve_runtime("wishful", &unbound, false),
            RuntimeChoice::Unavailable
        );
    }
}
