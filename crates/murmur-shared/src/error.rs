use thiserror::Error;

#[derive(Error, Debug)]
pub enum TokenError {
    #[error("Malformed token: {0}")]
    Malformed(String),

    #[error("Token expired")]
    Expired,

    #[error("Invalid issuer key")]
    InvalidIssuerKey,

    #[error("Bad token signature")]
    BadSignature,
}
