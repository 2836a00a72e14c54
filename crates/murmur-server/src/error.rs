use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use murmur_store::StoreError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Invalid signaling payload: {0}")]
    InvalidSignalingPayload(String),

    /// Never surfaced to a sender; relay paths log and swallow it.
    #[error("Delivery failed: {0}")]
    DeliveryFailure(String),

    #[error("Attachment migration failed: {0}")]
    MigrationFailure(String),

    #[error("Attachment too large: {size} bytes (max {max})")]
    AttachmentTooLarge { size: usize, max: usize },

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Store error: {0}")]
    Store(StoreError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServerError {
    /// Short machine-readable tag sent in realtime `error` events.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerError::Unauthenticated(_) => "unauthenticated",
            ServerError::Forbidden(_) => "forbidden",
            ServerError::NotFound(_) => "not-found",
            ServerError::InvalidMessage(_) => "invalid-message",
            ServerError::InvalidSignalingPayload(_) => "invalid-signaling-payload",
            ServerError::DeliveryFailure(_) => "delivery-failure",
            ServerError::MigrationFailure(_) => "migration-failure",
            ServerError::AttachmentTooLarge { .. } => "attachment-too-large",
            ServerError::BadRequest(_) => "bad-request",
            ServerError::Store(_) | ServerError::Internal(_) => "internal",
        }
    }

    /// Message safe to show a client; internal details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            ServerError::Store(_) => "Storage error".to_string(),
            ServerError::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<StoreError> for ServerError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => ServerError::NotFound("record does not exist".into()),
            StoreError::Constraint(msg) => ServerError::BadRequest(msg),
            other => ServerError::Store(other),
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = match &self {
            ServerError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            ServerError::Forbidden(_) => StatusCode::FORBIDDEN,
            ServerError::NotFound(_) => StatusCode::NOT_FOUND,
            ServerError::InvalidMessage(_)
            | ServerError::InvalidSignalingPayload(_)
            | ServerError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServerError::AttachmentTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ServerError::DeliveryFailure(_)
            | ServerError::MigrationFailure(_)
            | ServerError::Store(_)
            | ServerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }

        let body = serde_json::json!({
            "error": self.public_message(),
        });

        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_errors_map_to_taxonomy() {
        assert!(matches!(
            ServerError::from(StoreError::NotFound),
            ServerError::NotFound(_)
        ));
        assert!(matches!(
            ServerError::from(StoreError::Constraint("x".into())),
            ServerError::BadRequest(_)
        ));
        assert!(matches!(
            ServerError::from(StoreError::Task("cancelled".into())),
            ServerError::Store(_)
        ));
    }

    #[test]
    fn test_status_codes() {
        let cases = [
            (ServerError::Unauthenticated("t".into()), StatusCode::UNAUTHORIZED),
            (ServerError::Forbidden("f".into()), StatusCode::FORBIDDEN),
            (ServerError::NotFound("n".into()), StatusCode::NOT_FOUND),
            (ServerError::InvalidMessage("m".into()), StatusCode::BAD_REQUEST),
            (ServerError::Internal("boom".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(err.into_response().status(), status);
        }
    }

    #[test]
    fn test_internal_details_hidden() {
        let err = ServerError::Internal("sql: table users is locked".into());
        assert_eq!(err.public_message(), "Internal server error");
    }
}
