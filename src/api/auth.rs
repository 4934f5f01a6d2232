// JWT session auth for the REST surface

//! # API Authentication
//!
//! Bearer JWTs (HS256) carry the caller's user id, organization id and
//! role. The middleware validates the token and parks an [`AuthContext`]
//! in request extensions; handlers read it with `Extension`. Webhook
//! receipt and the health probes stay public.

use axum::extract::State;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;
use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::models::MemberRole;

use super::types::ApiError;
use super::ApiState;

/// JWT claims for API sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClaims {
    /// User id.
    pub sub: String,
    /// Organization id.
    pub org: String,
    pub role: MemberRole,
    pub exp: i64,
    pub iat: i64,
}

/// Authenticated caller context available to handlers.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: String,
    pub organization_id: String,
    pub role: MemberRole,
}

impl AuthContext {
    pub fn require_admin(&self) -> Result<(), ApiError> {
        if self.role.is_admin() {
            Ok(())
        } else {
            Err(ApiError::from(crate::SwitchyardError::Forbidden(
                "admin role required".into(),
            )))
        }
    }
}

/// Issue a session token; the admin CLI and tests use this.
pub fn issue_token(
    secret: &str,
    user_id: &str,
    organization_id: &str,
    role: MemberRole,
    ttl_hours: i64,
) -> Result<String, ApiError> {
    let now = Utc::now().timestamp();
    let claims = SessionClaims {
        sub: user_id.to_string(),
        org: organization_id.to_string(),
        role,
        iat: now,
        exp: now + ttl_hours * 3600,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| {
        ApiError::from(crate::SwitchyardError::Internal(format!(
            "token issue failed: {e}"
        )))
    })
}

fn decode_token(secret: &str, token: &str) -> Result<SessionClaims, ApiError> {
    decode::<SessionClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::new(Algorithm::HS256),
    )
    .map(|data| data.claims)
    .map_err(|_| ApiError::from(crate::SwitchyardError::Unauthenticated))
}

/// Axum middleware enforcing a valid bearer token.
pub async fn require_auth<B>(
    State(state): State<ApiState>,
    mut request: Request<B>,
    next: Next<B>,
) -> Result<Response, ApiError> {
    let header = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::from(crate::SwitchyardError::Unauthenticated))?;
    let token = header
        .strip_prefix("Bearer ")
        .ok_or_else(|| ApiError::from(crate::SwitchyardError::Unauthenticated))?;

    let claims = decode_token(&state.config.jwt_secret, token)?;
    request.extensions_mut().insert(AuthContext {
        user_id: claims.sub,
        organization_id: claims.org,
        role: claims.role,
    });
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_round_trip() {
        let token = issue_token("secret", "u-1", "org-1", MemberRole::Admin, 1).unwrap();
        let claims = decode_token("secret", &token).unwrap();
        assert_eq!(claims.sub, "u-1");
        assert_eq!(claims.org, "org-1");
        assert!(matches!(claims.role, MemberRole::Admin));
    }

    #[test]
    fn wrong_secret_rejected() {
        let token = issue_token("secret", "u-1", "org-1", MemberRole::Member, 1).unwrap();
        assert!(decode_token("other", &token).is_err());
    }

    #[test]
    fn admin_gate() {
        let admin = AuthContext {
            user_id: "u".into(),
            organization_id: "o".into(),
            role: MemberRole::Owner,
        };
        assert!(admin.require_admin().is_ok());
        let viewer = AuthContext {
            role: MemberRole::Viewer,
            ..admin
        };
        assert!(viewer.require_admin().is_err());
    }
}
