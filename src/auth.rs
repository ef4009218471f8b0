//! Authentication glue for the `authenticate` handshake frame. HMAC JWTs
//! keyed by a single shared `jwt_secret` rather than an RSA keypair — a
//! single shared secret per deployment, so `validate_token` here verifies
//! HS256 directly instead of managing a signing keypair.

use chrono::Utc;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::AuthConfig;
use crate::error::HubError;

/// JWT claims carried by every token the hub accepts.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub username: String,
    pub iat: i64,
    pub exp: i64,
}

/// Validate and decode a bearer token against the configured HMAC secret.
pub fn validate_token(config: &AuthConfig, token: &str) -> Result<Claims, HubError> {
    let decoding_key = DecodingKey::from_secret(config.jwt_secret.as_bytes());
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = true;

    let token_data = decode::<Claims>(token, &decoding_key, &validation).map_err(|e| {
        tracing::debug!(error = %e, "token validation failed");
        HubError::Unauthenticated
    })?;

    Ok(token_data.claims)
}

pub fn user_id_from_claims(claims: &Claims) -> Result<Uuid, HubError> {
    Uuid::parse_str(&claims.sub).map_err(|_| HubError::Unauthenticated)
}

/// Whether a token is still within its expiry window — used by
/// `Claims::exp` checks surfaced outside jsonwebtoken's own validation path.
pub fn is_expired(claims: &Claims) -> bool {
    claims.exp < Utc::now().timestamp()
}
