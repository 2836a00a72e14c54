//! Identity gate: resolves bearer tokens to user identities.
//!
//! Tokens are issued elsewhere and signed with the issuer's Ed25519 key;
//! this side only verifies them.

use axum::http::HeaderMap;
use tracing::debug;

use murmur_shared::token::{check_auth_token_with_key, AuthToken, VerifiedIdentity};

use crate::error::ServerError;

#[derive(Clone)]
pub struct IdentityGate {
    issuer_pubkey: [u8; 32],
}

impl IdentityGate {
    pub fn new(issuer_pubkey: [u8; 32]) -> Self {
        Self { issuer_pubkey }
    }

    /// `verify(credential) -> userId | Unauthenticated`.
    pub fn verify(&self, credential: &str) -> Result<VerifiedIdentity, ServerError> {
        let token = AuthToken::decode(credential)
            .map_err(|e| ServerError::Unauthenticated(e.to_string()))?;

        check_auth_token_with_key(&token, &self.issuer_pubkey).map_err(|e| {
            debug!(user = %token.user_id, error = %e, "Token rejected");
            ServerError::Unauthenticated(e.to_string())
        })
    }

    /// Verify the `Authorization: Bearer` header of a REST request.
    pub fn verify_headers(&self, headers: &HeaderMap) -> Result<VerifiedIdentity, ServerError> {
        let token = bearer_token(headers)
            .ok_or_else(|| ServerError::Unauthenticated("missing bearer token".into()))?;
        self.verify(token)
    }
}

/// Extract the token from `Authorization: Bearer <token>`.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}
