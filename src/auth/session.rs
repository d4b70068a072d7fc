//! Server-side sessions and their cookies

use std::time::Duration;

use axum::http::{HeaderMap, header};
use tracing::{debug, info};

use crate::Result;
use crate::config::AuthConfig;
use crate::crypto::token;
use crate::store::{Session, SessionUser, Store, now_secs};

/// Session cookie name
pub const SESSION_COOKIE: &str = "dashgate_session";

/// Anti-forgery cookie name
pub const CSRF_COOKIE: &str = "dashgate_csrf";

/// Issues, validates and revokes cookie sessions
#[derive(Debug, Clone)]
pub struct SessionManager {
    store: Store,
    lifetime: Duration,
    secure: bool,
}

impl SessionManager {
    /// Manager using the configured lifetime and cookie flags
    #[must_use]
    pub fn new(store: Store, config: &AuthConfig) -> Self {
        Self {
            store,
            lifetime: config.session_lifetime(),
            secure: config.cookie_secure,
        }
    }

    /// Session lifetime
    #[must_use]
    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    /// Replace every session of `user_id` with a fresh one
    pub async fn issue(&self, user_id: i64) -> Result<Session> {
        let revoked = self.store.delete_user_sessions(user_id).await?;
        if revoked > 0 {
            debug!(user_id, revoked, "Previous sessions revoked at login");
        }
        let lifetime = i64::try_from(self.lifetime.as_secs()).unwrap_or(i64::MAX);
        let expires_at = now_secs().saturating_add(lifetime);
        self.store
            .create_session(user_id, &token::session_token(), expires_at)
            .await
    }

    /// Live session for a token
    pub async fn validate(&self, token: &str) -> Result<Option<SessionUser>> {
        if token.is_empty() {
            return Ok(None);
        }
        self.store.lookup_session_by_token(token, now_secs()).await
    }

    /// Delete one session (logout)
    pub async fn revoke(&self, token: &str) -> Result<bool> {
        self.store.delete_session(token).await
    }

    /// Delete every session of a user
    pub async fn invalidate_user(&self, user_id: i64) -> Result<u64> {
        let count = self.store.delete_user_sessions(user_id).await?;
        if count > 0 {
            info!(user_id, count, "Sessions invalidated");
        }
        Ok(count)
    }

    fn secure_attr(&self) -> &'static str {
        if self.secure { "; Secure" } else { "" }
    }

    /// `Set-Cookie` value carrying a session token
    #[must_use]
    pub fn session_cookie(&self, token: &str) -> String {
        format!(
            "{SESSION_COOKIE}={token}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}{}",
            self.lifetime.as_secs(),
            self.secure_attr()
        )
    }

    /// `Set-Cookie` value expiring the session cookie
    #[must_use]
    pub fn clear_session_cookie(&self) -> String {
        format!(
            "{SESSION_COOKIE}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0{}",
            self.secure_attr()
        )
    }

    /// `Set-Cookie` value carrying an anti-forgery token. Readable by
    /// scripts so they can echo it in `X-CSRF-Token`.
    #[must_use]
    pub fn csrf_cookie(&self, token: &str) -> String {
        format!(
            "{CSRF_COOKIE}={token}; Path=/; SameSite=Strict; Max-Age={}{}",
            self.lifetime.as_secs(),
            self.secure_attr()
        )
    }
}

/// Every value of cookie `name` across all `Cookie` headers
#[must_use]
pub fn cookie_values<'a>(headers: &'a HeaderMap, name: &str) -> Vec<&'a str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .filter(|(k, _)| *k == name)
        .map(|(_, v)| v.trim())
        .collect()
}
