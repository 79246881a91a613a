//! Bearer-token authentication.
//!
//! Tokens are HS256 JWTs whose `sub` is the numeric user id. The server only
//! verifies them; [`issue_token`] exists for operators (the `create-user`
//! command) and tests.

use crate::api::error::ApiError;
use crate::api::state::AppState;
use crate::model::User;
use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// User id, as a decimal string.
    pub sub: String,
    /// Expiry, seconds since the epoch.
    pub exp: i64,
}

/// Verifies bearer tokens against the server secret.
#[derive(Clone)]
pub struct TokenVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl fmt::Debug for TokenVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TokenVerifier(HS256)")
    }
}

impl TokenVerifier {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            key: DecodingKey::from_secret(secret),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    /// The user id carried by a valid token.
    pub fn verify(&self, token: &str) -> Result<i64, ApiError> {
        let data = decode::<Claims>(token, &self.key, &self.validation).map_err(|e| {
            debug!(error = %e, "Token rejected");
            ApiError::Unauthorized("Invalid or expired token".into())
        })?;
        data.claims
            .sub
            .parse()
            .map_err(|_| ApiError::Unauthorized("Invalid token subject".into()))
    }
}

/// Sign a token for `user_id` valid for `ttl`.
pub fn issue_token(
    secret: &[u8],
    user_id: i64,
    ttl: Duration,
) -> Result<String, jsonwebtoken::errors::Error> {
    let claims = Claims {
        sub: user_id.to_string(),
        exp: (Utc::now() + ttl).timestamp(),
    };
    encode(&Header::new(Algorithm::HS256), &claims, &EncodingKey::from_secret(secret))
}

/// The authenticated caller, loaded fresh from the store on every request.
#[derive(Debug, Clone)]
pub struct AuthUser(pub User);

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ApiError::Unauthorized("Authentication credentials were not provided".into()))?;
        let token = header
            .strip_prefix("Bearer ")
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ApiError::Unauthorized("Expected a Bearer token".into()))?;

        let user_id = state.tokens.verify(token)?;
        let user = state
            .users
            .find(user_id)
            .await?
            .ok_or_else(|| ApiError::Unauthorized("User not found".into()))?;
        Ok(AuthUser(user))
    }
}
