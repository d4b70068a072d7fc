//! Single-use OIDC state rows

use sqlx::FromRow;

use super::{Store, now_secs};
use crate::Result;

/// Maximum age of a pending authorization request
pub const OIDC_STATE_TTL_SECS: i64 = 600;

/// A pending authorization request
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct OidcState {
    /// Random state parameter
    pub state: String,
    /// Validated relative path to land on after login
    pub redirect_to: String,
    /// PKCE code verifier bound to this state
    pub code_verifier: String,
    /// Creation time (Unix seconds)
    pub created_at: i64,
}

impl Store {
    /// Persist a pending authorization request
    pub async fn insert_oidc_state(&self, state: &str, redirect_to: &str, code_verifier: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO oidc_states (state, redirect_to, code_verifier, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(state)
        .bind(redirect_to)
        .bind(code_verifier)
        .bind(now_secs())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Remove and return a state row. Returns `None` when the state is
    /// unknown, already consumed, or older than [`OIDC_STATE_TTL_SECS`].
    pub async fn consume_oidc_state(&self, state: &str, now: i64) -> Result<Option<OidcState>> {
        let row = sqlx::query_as::<_, OidcState>(
            "DELETE FROM oidc_states WHERE state = ?
             RETURNING state, redirect_to, code_verifier, created_at",
        )
        .bind(state)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.filter(|r| now - r.created_at < OIDC_STATE_TTL_SECS))
    }

    /// Delete states older than the TTL
    pub async fn delete_stale_oidc_states(&self, now: i64) -> Result<u64> {
        Ok(sqlx::query("DELETE FROM oidc_states WHERE created_at <= ?")
            .bind(now - OIDC_STATE_TTL_SECS)
            .execute(&self.pool)
            .await?
            .rows_affected())
    }
}
