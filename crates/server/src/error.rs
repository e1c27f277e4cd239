use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use db::IdentityStoreError;
use serde::Serialize;
use services::services::{
    federation::FederationError, oauth::HandshakeError, password::PasswordError,
    ticket::TicketError,
};
use thiserror::Error;
use tracing::error;

/// Error type returned by route handlers and pipeline stages.
///
/// 5xx bodies carry the raw diagnostic; in Production the exception stage
/// replaces them with the generic error document before they leave the
/// process.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("forbidden")]
    Forbidden,
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error(transparent)]
    Federation(#[from] FederationError),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error(transparent)]
    Store(#[from] IdentityStoreError),
    #[error(transparent)]
    Ticket(#[from] TicketError),
    #[error(transparent)]
    Password(#[from] PasswordError),
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            ApiError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "unauthorized"),
            ApiError::Forbidden => (StatusCode::FORBIDDEN, "forbidden"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            ApiError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            ApiError::Federation(e) => match e {
                FederationError::InvalidIdentity(_) => (StatusCode::BAD_REQUEST, "invalid_identity"),
                FederationError::AlreadyLinked { .. } => (StatusCode::CONFLICT, "already_linked"),
                FederationError::AccountNotFound => (StatusCode::NOT_FOUND, "account_not_found"),
                FederationError::LoginNotFound(_) => (StatusCode::NOT_FOUND, "login_not_found"),
                FederationError::Store(e) => store_status(e),
            },
            ApiError::Handshake(e) => match e {
                HandshakeError::UnknownProvider(_) => (StatusCode::NOT_FOUND, "unknown_provider"),
                HandshakeError::InvalidState
                | HandshakeError::CorrelationFailed
                | HandshakeError::StateExpired
                | HandshakeError::ProviderMismatch { .. } => {
                    (StatusCode::BAD_REQUEST, "invalid_state")
                }
                HandshakeError::Denied(_) => (StatusCode::UNAUTHORIZED, "access_denied"),
                HandshakeError::Provider { .. }
                | HandshakeError::MissingSubject
                | HandshakeError::Http(_) => (StatusCode::BAD_GATEWAY, "provider_error"),
                HandshakeError::InvalidUrl(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
                }
            },
            ApiError::Store(e) => store_status(e),
            ApiError::Ticket(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
            ApiError::Password(PasswordError::TooShort(_)) => {
                (StatusCode::BAD_REQUEST, "weak_password")
            }
            ApiError::Password(PasswordError::Hash(_)) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
            }
        }
    }
}

fn store_status(error: &IdentityStoreError) -> (StatusCode, &'static str) {
    match error {
        IdentityStoreError::NotFound => (StatusCode::NOT_FOUND, "not_found"),
        IdentityStoreError::RoleNotFound(_) => (StatusCode::NOT_FOUND, "role_not_found"),
        IdentityStoreError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
        IdentityStoreError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "persistence_error"),
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if status.is_server_error() {
            error!(error = %self, "Request failed");
        } else {
            tracing::debug!(error = %self, status = status.as_u16(), "Request rejected");
        }

        let body = ErrorBody {
            error: code,
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persistence_failures_are_500() {
        let err = ApiError::Store(IdentityStoreError::Database(sqlx::Error::PoolClosed));
        assert_eq!(
            err.status_and_code(),
            (StatusCode::INTERNAL_SERVER_ERROR, "persistence_error")
        );
    }

    #[test]
    fn federation_conflicts_are_409() {
        let err = ApiError::from(FederationError::AlreadyLinked {
            provider: "google".into(),
        });
        assert_eq!(err.status_and_code().0, StatusCode::CONFLICT);
    }

    #[test]
    fn stale_handshake_state_is_client_error() {
        for e in [
            HandshakeError::InvalidState,
            HandshakeError::CorrelationFailed,
            HandshakeError::StateExpired,
            HandshakeError::ProviderMismatch {
                expected: "google".into(),
            },
        ] {
            assert_eq!(ApiError::from(e).status_and_code().0, StatusCode::BAD_REQUEST);
        }
    }
}
