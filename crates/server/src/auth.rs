use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Duration, Utc};
use nkata_core::Identity;
use nkata_crypto::{
    generate_signing_key, open, seal, signing_key_from_base64, signing_key_to_base64,
    verifying_key_from, SigningKey, VerifyingKey,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{config::AuthConfig, AppState, ErrorBody};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing bearer credential")]
    Missing,
    #[error("malformed bearer credential")]
    Malformed,
    #[error("bearer credential signature is invalid")]
    InvalidSignature,
    #[error("bearer credential has expired")]
    Expired,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        tracing::debug!(reason = %self, "rejecting unauthenticated request");
        (StatusCode::UNAUTHORIZED, Json(ErrorBody::new("unauthorized"))).into_response()
    }
}

/// Resolves a bearer credential into the caller's identity.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve(&self, bearer: &str) -> Result<Identity, AuthError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct TokenClaims {
    username: String,
    expires_at: DateTime<Utc>,
}

pub struct SignedTokenResolver {
    verifying_key: VerifyingKey,
}

impl SignedTokenResolver {
    pub fn new(verifying_key: VerifyingKey) -> Self {
        Self { verifying_key }
    }
}

#[async_trait]
impl IdentityResolver for SignedTokenResolver {
    async fn resolve(&self, bearer: &str) -> Result<Identity, AuthError> {
        if !bearer.contains('.') {
            return Err(AuthError::Malformed);
        }
        let payload =
            open(&self.verifying_key, bearer).map_err(|_| AuthError::InvalidSignature)?;
        let claims: TokenClaims =
            serde_json::from_slice(&payload).map_err(|_| AuthError::Malformed)?;
        if claims.expires_at <= Utc::now() {
            return Err(AuthError::Expired);
        }
        Identity::new(claims.username).map_err(|_| AuthError::Malformed)
    }
}

/// Signs bearer tokens for the CLI and for tests.
pub struct TokenIssuer {
    signing_key: SigningKey,
    ephemeral: bool,
}

impl TokenIssuer {
    pub fn from_config(config: &AuthConfig) -> Result<Self> {
        match config.signing_key.as_deref() {
            Some(raw) => Ok(Self {
                signing_key: signing_key_from_base64(raw)?,
                ephemeral: false,
            }),
            None => Ok(Self::ephemeral()),
        }
    }

    pub fn ephemeral() -> Self {
        Self {
            signing_key: generate_signing_key(),
            ephemeral: true,
        }
    }

    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral
    }

    pub fn signing_key_base64(&self) -> String {
        signing_key_to_base64(&self.signing_key)
    }

    pub fn resolver(&self) -> Arc<dyn IdentityResolver> {
        Arc::new(SignedTokenResolver::new(verifying_key_from(
            &self.signing_key,
        )))
    }

    pub fn issue(&self, identity: &Identity, ttl: Duration) -> Result<String> {
        let claims = TokenClaims {
            username: identity.handle().to_string(),
            expires_at: Utc::now() + ttl,
        };
        let payload = serde_json::to_vec(&claims)?;
        Ok(seal(&self.signing_key, &payload))
    }
}

/// Caller identity taken from `Authorization: Bearer <token>`.
#[derive(Debug, Clone)]
pub struct Authenticated(pub Identity);

impl FromRequestParts<AppState> for Authenticated {
    type Rejection = AuthError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .ok_or(AuthError::Missing)?;
        let value = header.to_str().map_err(|_| AuthError::Malformed)?;
        let token = value
            .strip_prefix("Bearer ")
            .or_else(|| value.strip_prefix("bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or(AuthError::Malformed)?;

        let identity = state.identity_resolver().resolve(token).await?;
        Ok(Authenticated(identity))
    }
}
