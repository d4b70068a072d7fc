//! Route handlers

pub mod admin;
pub mod auth;
pub mod dashboard;

use axum::http::{HeaderValue, header};
use axum::response::Response;
use tracing::warn;

use crate::crypto::password::{hash_password, hash_secret};
use crate::{Error, Result};

/// Minimum length of a local password
pub const MIN_PASSWORD_LEN: usize = 8;

/// Append a `Set-Cookie` header
pub(crate) fn set_cookie(response: &mut Response, cookie: &str) {
    match HeaderValue::from_str(cookie) {
        Ok(value) => {
            response.headers_mut().append(header::SET_COOKIE, value);
        }
        Err(e) => warn!(error = %e, "Dropping malformed cookie"),
    }
}

/// Argon2 off the async workers
pub(crate) async fn hash_password_blocking(password: String) -> Result<String> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(Error::Config(format!(
            "password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    tokio::task::spawn_blocking(move || hash_password(&password))
        .await
        .map_err(|e| Error::Internal(format!("hashing task failed: {e}")))?
}

/// Argon2 of an API key off the async workers
pub(crate) async fn hash_secret_blocking(secret: String) -> Result<String> {
    tokio::task::spawn_blocking(move || hash_secret(&secret))
        .await
        .map_err(|e| Error::Internal(format!("hashing task failed: {e}")))?
}

/// Trimmed, de-duplicated, non-empty group names in their original order
pub(crate) fn clean_groups(groups: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(groups.len());
    for group in groups.iter().map(|g| g.trim()).filter(|g| !g.is_empty()) {
        if !out.iter().any(|g| g == group) {
            out.push(group.to_string());
        }
    }
    out
}
