//! Audit log rows
//!
//! Every security-relevant action is written to `audit_log` and mirrored as a
//! structured `tracing` event on the `audit` target.
//!
//! # Actions
//!
//! | Action | When |
//! |--------|------|
//! | `login.success` / `login.failure` | Interactive login outcome |
//! | `logout` | Session cookie destroyed |
//! | `user.create` / `user.update` / `user.delete` / `user.password` | Admin user management |
//! | `apikey.create` / `apikey.delete` | API key lifecycle |
//! | `settings.update` | System configuration changed |
//! | `discovery.update` | Discovery source settings changed |
//! | `override.update` / `override.delete` | Discovered-app override changed |

use serde::Serialize;
use sqlx::FromRow;
use tracing::{info, warn};

use super::{Store, now_secs};
use crate::Result;

const MAX_ACTOR: usize = 128;
const MAX_ACTION: usize = 64;
const MAX_DETAIL: usize = 1024;
const MAX_SOURCE: usize = 64;

/// One audit row
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct AuditEntry {
    /// Row id
    pub id: i64,
    /// Time (Unix seconds)
    pub created_at: i64,
    /// Username or `anonymous`
    pub actor: String,
    /// Action tag
    pub action: String,
    /// Free-form detail
    pub detail: String,
    /// Client address
    pub source_ip: String,
}

fn truncate(value: &str, max: usize) -> &str {
    if value.len() <= max {
        return value;
    }
    let mut end = max;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}

impl Store {
    /// Append an audit row. Failures are logged and swallowed.
    pub async fn record_audit(&self, actor: &str, action: &str, detail: &str, source_ip: &str) {
        let actor = truncate(actor, MAX_ACTOR);
        let action = truncate(action, MAX_ACTION);
        let detail = truncate(detail, MAX_DETAIL);
        let source_ip = truncate(source_ip, MAX_SOURCE);

        info!(target: "audit", actor, action, detail, source_ip, "audit");

        let result = sqlx::query(
            "INSERT INTO audit_log (created_at, actor, action, detail, source_ip) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(now_secs())
        .bind(actor)
        .bind(action)
        .bind(detail)
        .bind(source_ip)
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            warn!(error = %e, action, "Failed to write audit row");
        }
    }

    /// Newest rows first
    pub async fn list_audit(&self, limit: i64) -> Result<Vec<AuditEntry>> {
        Ok(sqlx::query_as::<_, AuditEntry>(
            "SELECT id, created_at, actor, action, detail, source_ip
             FROM audit_log ORDER BY id DESC LIMIT ?",
        )
        .bind(limit.clamp(1, 1000))
        .fetch_all(&self.pool)
        .await?)
    }

    /// Keep only the newest `keep` rows
    pub async fn prune_audit(&self, keep: i64) -> Result<u64> {
        Ok(sqlx::query(
            "DELETE FROM audit_log WHERE id NOT IN (SELECT id FROM audit_log ORDER BY id DESC LIMIT ?)",
        )
        .bind(keep)
        .execute(&self.pool)
        .await?
        .rows_affected())
    }
}
