// Credential resolution - decrypt on use, attach tenant egress policy

//! # Credential Resolver
//!
//! Action and trigger nodes either carry inline credentials (explicit
//! attributes on the node, used by dry-runs and tests) or reference a
//! stored [`Connection`](crate::models::Connection) by id. The resolver
//! produces a [`CredentialBundle`]: decrypted credentials, their source,
//! connector extras, and the organization's network policy so clients can
//! enforce egress constraints.
//!
//! Plaintext credentials exist only inside this module's call stack and
//! the connector client invocation that receives the bundle. They are
//! never serialized into logs, previews or execution records; the bundle's
//! `Debug` impl redacts them.

use base64::{engine::general_purpose, Engine as _};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use crate::models::{NetworkPolicy, Organization, WorkflowNode};
use crate::{Result, SwitchyardError};

use super::storage::{ConnectionStore, PlatformStore};

/// Where a bundle's credentials came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    Inline,
    Connection,
}

/// Decrypted credentials plus the context connector clients need.
#[derive(Clone)]
pub struct CredentialBundle {
    /// Decrypted credential object. Redacted from `Debug`.
    pub credentials: Value,
    pub source: CredentialSource,
    pub additional_config: Option<Value>,
    pub connection_id: Option<String>,
    /// Tenant egress constraints, enforced by every client. The reserved
    /// `__organizationNetworkPolicy` key in serialized form.
    pub network_policy: NetworkPolicy,
    pub organization_id: String,
    pub user_id: Option<String>,
}

impl fmt::Debug for CredentialBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialBundle")
            .field("credentials", &"<redacted>")
            .field("source", &self.source)
            .field("connection_id", &self.connection_id)
            .field("organization_id", &self.organization_id)
            .finish()
    }
}

impl CredentialBundle {
    /// Inline bundle with no tenant policy; used by dry-runs and tests.
    pub fn inline(credentials: Value, organization_id: &str) -> Self {
        CredentialBundle {
            credentials,
            source: CredentialSource::Inline,
            additional_config: None,
            connection_id: None,
            network_policy: NetworkPolicy::default(),
            organization_id: organization_id.to_string(),
            user_id: None,
        }
    }
}

/// AES-256-GCM sealer for connection credentials.
///
/// Ciphertext layout: `base64(nonce || ciphertext || tag)`. The nonce is
/// random per seal; the master key comes from `CREDENTIAL_MASTER_KEY`.
pub struct CredentialCipher {
    key_bytes: [u8; 32],
    rng: SystemRandom,
}

impl CredentialCipher {
    /// Build from a base64-encoded 32-byte master key.
    pub fn from_master_key(master_key_b64: &str) -> Result<Self> {
        let raw = general_purpose::STANDARD
            .decode(master_key_b64)
            .map_err(|e| SwitchyardError::Internal(format!("master key is not base64: {e}")))?;
        let key_bytes: [u8; 32] = raw
            .try_into()
            .map_err(|_| SwitchyardError::Internal("master key must be 32 bytes".into()))?;
        Ok(CredentialCipher {
            key_bytes,
            rng: SystemRandom::new(),
        })
    }

    fn key(&self) -> Result<LessSafeKey> {
        let unbound = UnboundKey::new(&AES_256_GCM, &self.key_bytes)
            .map_err(|_| SwitchyardError::Internal("bad AES key".into()))?;
        Ok(LessSafeKey::new(unbound))
    }

    /// Seal a credential object.
    pub fn seal(&self, credentials: &Value) -> Result<String> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| SwitchyardError::Internal("rng failure".into()))?;

        let mut in_out = serde_json::to_vec(credentials)?;
        self.key()?
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::empty(),
                &mut in_out,
            )
            .map_err(|_| SwitchyardError::Internal("seal failure".into()))?;

        let mut blob = nonce_bytes.to_vec();
        blob.extend_from_slice(&in_out);
        Ok(general_purpose::STANDARD.encode(blob))
    }

    /// Open a sealed credential blob.
    pub fn open(&self, ciphertext_b64: &str) -> Result<Value> {
        let blob = general_purpose::STANDARD
            .decode(ciphertext_b64)
            .map_err(|e| SwitchyardError::Internal(format!("ciphertext is not base64: {e}")))?;
        if blob.len() <= NONCE_LEN {
            return Err(SwitchyardError::Internal("ciphertext too short".into()));
        }
        let (nonce_bytes, sealed) = blob.split_at(NONCE_LEN);
        let nonce: [u8; NONCE_LEN] = nonce_bytes
            .try_into()
            .map_err(|_| SwitchyardError::Internal("bad nonce".into()))?;

        let mut in_out = sealed.to_vec();
        let plaintext = self
            .key()?
            .open_in_place(Nonce::assume_unique_for_key(nonce), Aad::empty(), &mut in_out)
            .map_err(|_| SwitchyardError::Internal("credential decrypt failure".into()))?;
        Ok(serde_json::from_slice(plaintext)?)
    }
}

/// Resolves node credential references against stored connections.
pub struct CredentialResolver {
    store: Arc<dyn PlatformStore>,
    cipher: CredentialCipher,
}

impl CredentialResolver {
    pub fn new(store: Arc<dyn PlatformStore>, cipher: CredentialCipher) -> Self {
        CredentialResolver { store, cipher }
    }

    /// Seal credentials for storage; used by the connection-save path.
    pub fn seal(&self, credentials: &Value) -> Result<String> {
        self.cipher.seal(credentials)
    }

    /// Resolve credentials for a node.
    ///
    /// Preference order: inline `credentials` attribute on the node, then
    /// the stored connection named by `connection_id`. Typed failures:
    /// [`SwitchyardError::MissingConnection`] when the node names neither,
    /// [`SwitchyardError::ConnectionNotFound`] for a dangling reference,
    /// [`SwitchyardError::Forbidden`] for a cross-tenant reference.
    pub async fn resolve(
        &self,
        node: &WorkflowNode,
        organization: &Organization,
        user_id: Option<&str>,
    ) -> Result<CredentialBundle> {
        // Inline credentials win; dry-runs use them to avoid touching the
        // connection store at all.
        if let Some(inline) = node.data.parameters.get("credentials") {
            let mut bundle = CredentialBundle::inline(inline.clone(), &organization.id);
            bundle.network_policy = organization.security.network_policy.clone();
            bundle.user_id = user_id.map(str::to_string);
            return Ok(bundle);
        }

        let connection_id = node
            .data
            .connection_id
            .as_deref()
            .ok_or_else(|| SwitchyardError::MissingConnection(node.id.clone()))?;

        self.resolve_connection(connection_id, organization).await
    }

    /// Resolve a stored connection by id. The polling scheduler uses this
    /// directly since trigger registrations carry a connection id, not a
    /// node.
    pub async fn resolve_connection(
        &self,
        connection_id: &str,
        organization: &Organization,
    ) -> Result<CredentialBundle> {
        let connection = self
            .store
            .get_connection(connection_id)
            .await
            .map_err(|e| SwitchyardError::ConnectionServiceUnavailable(e.to_string()))?
            .ok_or_else(|| SwitchyardError::ConnectionNotFound(connection_id.to_string()))?;

        if connection.organization_id != organization.id {
            return Err(SwitchyardError::Forbidden(format!(
                "connection {connection_id} belongs to another organization"
            )));
        }
        if connection.revoked {
            return Err(SwitchyardError::ConnectionNotFound(format!(
                "{connection_id} (revoked)"
            )));
        }

        let credentials = self.cipher.open(&connection.credentials_ciphertext)?;

        Ok(CredentialBundle {
            credentials,
            source: CredentialSource::Connection,
            additional_config: connection.additional_config.clone(),
            connection_id: Some(connection.id.clone()),
            network_policy: organization.security.network_policy.clone(),
            organization_id: organization.id.clone(),
            user_id: Some(connection.user_id.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cipher() -> CredentialCipher {
        // 32 zero bytes, base64.
        CredentialCipher::from_master_key("AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=").unwrap()
    }

    #[test]
    fn seal_open_round_trip() {
        let c = cipher();
        let secret = json!({"token": "xoxb-123", "team": "T1"});
        let sealed = c.seal(&secret).unwrap();
        assert_ne!(sealed, secret.to_string());
        let opened = c.open(&sealed).unwrap();
        assert_eq!(opened, secret);
    }

    #[test]
    fn distinct_nonces_produce_distinct_ciphertext() {
        let c = cipher();
        let secret = json!({"k": "v"});
        let a = c.seal(&secret).unwrap();
        let b = c.seal(&secret).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn tampered_ciphertext_fails_closed() {
        let c = cipher();
        let sealed = c.seal(&json!({"k": "v"})).unwrap();
        let mut blob = general_purpose::STANDARD.decode(&sealed).unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0x01;
        let tampered = general_purpose::STANDARD.encode(blob);
        assert!(c.open(&tampered).is_err());
    }

    #[test]
    fn debug_redacts_credentials() {
        let bundle = CredentialBundle::inline(json!({"token": "super-secret"}), "org-1");
        let rendered = format!("{bundle:?}");
        assert!(!rendered.contains("super-secret"));
        assert!(rendered.contains("<redacted>"));
    }
}
