// Typed environment configuration
// Read once at startup; everything downstream takes a borrowed or cloned copy.

//! # Platform Configuration
//!
//! All recognized environment variables are read here, exactly once, into a
//! [`PlatformConfig`]. Nothing else in the crate touches `std::env` at
//! runtime; services receive the values they need through their
//! constructors.
//!
//! Recognized variables:
//!
//! | Variable | Meaning | Default |
//! |---|---|---|
//! | `PORT` | HTTP listen port | `4000` |
//! | `HOST` | HTTP bind address | `0.0.0.0` |
//! | `DEFAULT_ORGANIZATION_REGION` | data-residency default | `us-east-1` |
//! | `ENABLE_DEV_IGNORE_QUEUE` | allow the non-durable in-memory queue | off |
//! | `GENERIC_EXECUTOR_ENABLED` | auto-bind the generic HTTP client | on |
//! | `APPS_SCRIPT_CONNECTOR_<ID>` | per-connector Apps-Script runtime gate | off |
//! | `GIT_SHA` | build id reported by `/health/app` | `unknown` |
//! | `DATABASE_URL` | Postgres DSN (omit for in-memory storage) | — |
//! | `NATS_URL` | JetStream queue driver URL (omit for in-memory) | — |
//! | `JWT_SECRET` | HS256 key for API sessions | dev default |
//! | `CREDENTIAL_MASTER_KEY` | base64 32-byte AES key for connections | dev default |

use config::{Config, Environment};
use std::collections::HashMap;

use crate::{Result, SwitchyardError};

/// Immutable configuration snapshot for the whole platform.
#[derive(Debug, Clone)]
pub struct PlatformConfig {
    /// HTTP bind host.
    pub host: String,
    /// HTTP listen port.
    pub port: u16,
    /// Default residency region stamped onto new organizations.
    pub default_organization_region: String,
    /// When set, enqueue may fall back to the non-durable in-memory driver.
    pub enable_dev_ignore_queue: bool,
    /// When set, connectors with a declared base URL auto-bind the generic
    /// HTTP client.
    pub generic_executor_enabled: bool,
    /// Per-connector Apps-Script runtime gates, keyed by connector id.
    pub apps_script_connectors: HashMap<String, bool>,
    /// Build identifier surfaced by the liveness endpoint.
    pub git_sha: String,
    /// Postgres DSN; `None` selects the in-memory storage backend.
    pub database_url: Option<String>,
    /// NATS URL; `None` selects the in-memory queue driver.
    pub nats_url: Option<String>,
    /// HS256 signing secret for API bearer tokens.
    pub jwt_secret: String,
    /// Base64-encoded 32-byte master key sealing connection credentials.
    pub credential_master_key: String,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 4000,
            default_organization_region: "us-east-1".to_string(),
            enable_dev_ignore_queue: false,
            generic_executor_enabled: true,
            apps_script_connectors: HashMap::new(),
            git_sha: "unknown".to_string(),
            database_url: None,
            nats_url: None,
            jwt_secret: "switchyard-dev-secret".to_string(),
            // Base64 of 32 zero bytes; fine for dev, replaced in production.
            credential_master_key: "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=".to_string(),
        }
    }
}

impl PlatformConfig {
    /// Load configuration from the process environment.
    ///
    /// Callers are expected to have loaded `.env` already (the binaries do).
    pub fn from_env() -> Result<Self> {
        let cfg = Config::builder()
            .add_source(Environment::default())
            .build()
            .map_err(|e| SwitchyardError::Internal(format!("config: {e}")))?;

        let defaults = Self::default();
        let mut out = Self {
            host: cfg.get_string("host").unwrap_or(defaults.host),
            port: cfg
                .get_string("port")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            default_organization_region: cfg
                .get_string("default_organization_region")
                .unwrap_or(defaults.default_organization_region),
            enable_dev_ignore_queue: cfg
                .get_string("enable_dev_ignore_queue")
                .map(|v| truthy(&v))
                .unwrap_or(false),
            generic_executor_enabled: cfg
                .get_string("generic_executor_enabled")
                .map(|v| truthy(&v))
                .unwrap_or(true),
            apps_script_connectors: HashMap::new(),
            git_sha: cfg.get_string("git_sha").unwrap_or(defaults.git_sha),
            database_url: cfg.get_string("database_url").ok(),
            nats_url: cfg.get_string("nats_url").ok(),
            jwt_secret: cfg.get_string("jwt_secret").unwrap_or(defaults.jwt_secret),
            credential_master_key: cfg
                .get_string("credential_master_key")
                .unwrap_or(defaults.credential_master_key),
        };

        // APPS_SCRIPT_CONNECTOR_<ID> flags are dynamic; scan the raw
        // environment rather than enumerating ids up front.
        for (key, value) in std::env::vars() {
            if let Some(id) = key.strip_prefix("APPS_SCRIPT_CONNECTOR_") {
                out.apps_script_connectors
                    .insert(id.to_ascii_lowercase(), truthy(&value));
            }
        }

        Ok(out)
    }

    /// Is the Apps-Script runtime enabled for the given connector id?
    pub fn apps_script_enabled(&self, connector_id: &str) -> bool {
        self.apps_script_connectors
            .get(&connector_id.to_ascii_lowercase())
            .copied()
            .unwrap_or(false)
    }
}

/// Interpret common env-var truthiness spellings.
fn truthy(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthy_spellings() {
        assert!(truthy("1"));
        assert!(truthy("TRUE"));
        assert!(truthy("on"));
        assert!(!truthy("0"));
        assert!(!truthy(""));
        assert!(!truthy("disabled"));
    }

    #[test]
    fn apps_script_lookup_is_case_insensitive() {
        let mut cfg = PlatformConfig::default();
        cfg.apps_script_connectors.insert("sheets".into(), true);
        assert!(cfg.apps_script_enabled("SHEETS"));
        assert!(!cfg.apps_script_enabled("slack"));
    }
}
