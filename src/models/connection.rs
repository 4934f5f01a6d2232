// Stored connector connections - ciphertext at rest, decrypted on use

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A tenant's stored connection to a connector.
///
/// `credentials_ciphertext` is the AES-256-GCM sealed credential blob
/// (base64, nonce-prefixed); it is only ever opened inside the credential
/// resolver and the plaintext never reaches logs, previews or API output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub id: String,
    pub organization_id: String,
    pub user_id: String,
    pub connector_id: String,
    pub credentials_ciphertext: String,
    /// Display metadata: account label, scopes, token expiry.
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Connector-specific extras forwarded to the client (subdomain,
    /// instance URL). Not secret.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_config: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub revoked: bool,
}

/// API-safe view of a connection: everything except the ciphertext.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSummary {
    pub id: String,
    pub connector_id: String,
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub revoked: bool,
}

impl From<&Connection> for ConnectionSummary {
    fn from(c: &Connection) -> Self {
        ConnectionSummary {
            id: c.id.clone(),
            connector_id: c.connector_id.clone(),
            metadata: c.metadata.clone(),
            created_at: c.created_at,
            revoked: c.revoked,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_omits_ciphertext() {
        let conn = Connection {
            id: "conn-1".into(),
            organization_id: "org-1".into(),
            user_id: "user-1".into(),
            connector_id: "slack".into(),
            credentials_ciphertext: "AAAA".into(),
            metadata: Map::new(),
            additional_config: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            revoked: false,
        };
        let summary = ConnectionSummary::from(&conn);
        let json = serde_json::to_value(&summary).unwrap();
        assert!(json.get("credentials_ciphertext").is_none());
        assert_eq!(json["connector_id"], "slack");
    }
}
