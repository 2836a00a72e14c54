//! Bearer tokens issued by the upstream auth service.
//!
//! The server only ever verifies tokens; `create_auth_token` exists for the
//! issuer and for tests.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::error::TokenError;
use crate::types::UserId;

// Token signed by the auth service, presented as `Authorization: Bearer ...`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthToken {
    pub user_id: UserId,
    pub name: String,
    pub valid_until: DateTime<Utc>,
    pub signature: Vec<u8>,
}

/// The identity a verified token resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedIdentity {
    pub user_id: UserId,
    pub name: String,
}

fn signing_payload(user_id: &UserId, name: &str, valid_until: &DateTime<Utc>) -> Vec<u8> {
    // payload = user_id || \n || name || \n || valid_until (rfc3339)
    let mut payload = Vec::new();
    payload.extend_from_slice(user_id.as_str().as_bytes());
    payload.push(b'\n');
    payload.extend_from_slice(name.as_bytes());
    payload.push(b'\n');
    payload.extend_from_slice(valid_until.to_rfc3339().as_bytes());
    payload
}

impl AuthToken {
    /// Encode for transport: base64url(json(token)).
    pub fn encode(&self) -> String {
        // Serializing a struct of strings and bytes cannot fail.
        let json = serde_json::to_vec(self).unwrap_or_default();
        URL_SAFE_NO_PAD.encode(json)
    }

    pub fn decode(encoded: &str) -> Result<Self, TokenError> {
        let raw = URL_SAFE_NO_PAD
            .decode(encoded.trim())
            .map_err(|e| TokenError::Malformed(format!("base64: {e}")))?;
        serde_json::from_slice(&raw).map_err(|e| TokenError::Malformed(format!("json: {e}")))
    }
}

pub fn check_auth_token_with_key(
    token: &AuthToken,
    issuer_pubkey: &[u8; 32],
) -> Result<VerifiedIdentity, TokenError> {
    if Utc::now() > token.valid_until {
        return Err(TokenError::Expired);
    }
    if token.user_id.is_empty() {
        return Err(TokenError::Malformed("empty user id".into()));
    }

    let verifying_key =
        VerifyingKey::from_bytes(issuer_pubkey).map_err(|_| TokenError::InvalidIssuerKey)?;

    let signature =
        Signature::from_slice(&token.signature).map_err(|_| TokenError::BadSignature)?;

    let payload = signing_payload(&token.user_id, &token.name, &token.valid_until);
    verifying_key
        .verify(&payload, &signature)
        .map_err(|_| TokenError::BadSignature)?;

    Ok(VerifiedIdentity {
        user_id: token.user_id.clone(),
        name: token.name.clone(),
    })
}

pub fn create_auth_token(
    user_id: &UserId,
    name: &str,
    valid_until: DateTime<Utc>,
    issuer_signing_key: &ed25519_dalek::SigningKey,
) -> AuthToken {
    use ed25519_dalek::Signer;

    let payload = signing_payload(user_id, name, &valid_until);
    let signature = issuer_signing_key.sign(&payload);

    AuthToken {
        user_id: user_id.clone(),
        name: name.to_string(),
        valid_until,
        signature: signature.to_bytes().to_vec(),
    }
}
