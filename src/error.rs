//! Error types for DashGate

use std::io;
use std::time::Duration;

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

use crate::crypto::secret::SecretError;

/// Result type alias for DashGate
pub type Result<T> = std::result::Result<T, Error>;

/// Uniform message returned for every credential mismatch.
pub const INVALID_CREDENTIALS: &str = "invalid credentials";

/// DashGate errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error (bad URL, bad path, malformed YAML)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Any credential mismatch during interactive login
    #[error("{}", INVALID_CREDENTIALS)]
    InvalidCredentials,

    /// No identity could be resolved for the request
    #[error("Authentication required")]
    Unauthenticated,

    /// Authenticated but not permitted
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Unique-constraint violation, pinned source, and similar state conflicts
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Missing row
    #[error("Not found: {0}")]
    NotFound(String),

    /// Too many attempts from one address
    #[error("Rate limit exceeded, retry in {}s", retry_after.as_secs())]
    RateLimited {
        /// Time until the next attempt is admitted
        retry_after: Duration,
    },

    /// Request body exceeded the configured cap
    #[error("Request body too large")]
    PayloadTooLarge,

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Secret-at-rest codec error
    #[error("Secret codec error: {0}")]
    Secret(#[from] SecretError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// HTTP status for this error
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Config(_) => StatusCode::BAD_REQUEST,
            Self::InvalidCredentials | Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Database(sqlx::Error::RowNotFound) => StatusCode::NOT_FOUND,
            Self::Database(e) if is_unique_violation(e) => StatusCode::CONFLICT,
            Self::Database(_)
            | Self::Secret(_)
            | Self::Io(_)
            | Self::Json(_)
            | Self::Yaml(_)
            | Self::Http(_)
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to show to the client
    fn public_message(&self) -> String {
        match self {
            Self::Database(e) if is_unique_violation(e) => "already exists".to_string(),
            Self::Database(sqlx::Error::RowNotFound) => "not found".to_string(),
            _ if self.status().is_server_error() => "internal server error".to_string(),
            Self::Config(msg) | Self::Forbidden(msg) | Self::Conflict(msg) | Self::NotFound(msg) => {
                msg.clone()
            }
            other => other.to_string(),
        }
    }
}

/// Whether a database error is a UNIQUE / PRIMARY KEY constraint failure
#[must_use]
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.is_unique_violation(),
        _ => false,
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }

        let mut response = (status, Json(json!({ "error": self.public_message() }))).into_response();

        if let Self::RateLimited { retry_after } = &self {
            let secs = retry_after.as_secs().max(1);
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_follows_taxonomy() {
        assert_eq!(Error::Config("x".into()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(Error::InvalidCredentials.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(Error::Forbidden("x".into()).status(), StatusCode::FORBIDDEN);
        assert_eq!(Error::Conflict("x".into()).status(), StatusCode::CONFLICT);
        assert_eq!(Error::NotFound("x".into()).status(), StatusCode::NOT_FOUND);
        assert_eq!(
            Error::Internal("disk on fire".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn internal_details_are_not_leaked() {
        let err = Error::Internal("secret path /var/lib/x".into());
        assert_eq!(err.public_message(), "internal server error");
    }

    #[test]
    fn rate_limited_sets_retry_after() {
        let response = Error::RateLimited {
            retry_after: Duration::from_secs(120),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "120");
    }

    #[test]
    fn invalid_credentials_message_is_uniform() {
        assert_eq!(Error::InvalidCredentials.to_string(), INVALID_CREDENTIALS);
    }
}
