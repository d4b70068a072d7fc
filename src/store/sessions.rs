//! Session rows

use sqlx::FromRow;

use super::{Store, User, decode_list, now_secs};
use crate::Result;

/// A persisted cookie session
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct Session {
    /// Row id
    pub id: i64,
    /// Owning user
    pub user_id: i64,
    /// Opaque token carried in the cookie
    pub token: String,
    /// Expiry (Unix seconds)
    pub expires_at: i64,
    /// Creation time (Unix seconds)
    pub created_at: i64,
}

/// A live session joined with its user
#[derive(Debug, Clone)]
pub struct SessionUser {
    /// Session row
    pub session: Session,
    /// Owning user
    pub user: User,
}

#[derive(FromRow)]
struct JoinedRow {
    session_id: i64,
    token: String,
    expires_at: i64,
    session_created_at: i64,
    user_id: i64,
    username: String,
    email: Option<String>,
    display_name: String,
    groups: String,
    password_hash: String,
    user_created_at: i64,
}

impl From<JoinedRow> for SessionUser {
    fn from(row: JoinedRow) -> Self {
        Self {
            session: Session {
                id: row.session_id,
                user_id: row.user_id,
                token: row.token,
                expires_at: row.expires_at,
                created_at: row.session_created_at,
            },
            user: User {
                id: row.user_id,
                username: row.username,
                email: row.email,
                display_name: row.display_name,
                groups: decode_list(&row.groups),
                password_hash: row.password_hash,
                created_at: row.user_created_at,
            },
        }
    }
}

impl Store {
    /// Insert a session
    pub async fn create_session(&self, user_id: i64, token: &str, expires_at: i64) -> Result<Session> {
        let now = now_secs();
        let id = sqlx::query(
            "INSERT INTO sessions (user_id, token, expires_at, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(user_id)
        .bind(token)
        .bind(expires_at)
        .bind(now)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        Ok(Session {
            id,
            user_id,
            token: token.to_string(),
            expires_at,
            created_at: now,
        })
    }

    /// Resolve a token to a live session and its user (`expires_at > now`)
    pub async fn lookup_session_by_token(&self, token: &str, now: i64) -> Result<Option<SessionUser>> {
        let row = sqlx::query_as::<_, JoinedRow>(
            "SELECT s.id AS session_id, s.token, s.expires_at, s.created_at AS session_created_at,
                    u.id AS user_id, u.username, u.email, u.display_name, u.groups, u.password_hash,
                    u.created_at AS user_created_at
             FROM sessions s JOIN users u ON u.id = s.user_id
             WHERE s.token = ? AND s.expires_at > ?",
        )
        .bind(token)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(SessionUser::from))
    }

    /// Delete one session by token
    pub async fn delete_session(&self, token: &str) -> Result<bool> {
        let affected = sqlx::query("DELETE FROM sessions WHERE token = ?")
            .bind(token)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(affected > 0)
    }

    /// Delete every session of a user
    pub async fn delete_user_sessions(&self, user_id: i64) -> Result<u64> {
        Ok(sqlx::query("DELETE FROM sessions WHERE user_id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await?
            .rows_affected())
    }

    /// Delete sessions whose expiry has passed
    pub async fn delete_expired_sessions(&self, now: i64) -> Result<u64> {
        Ok(sqlx::query("DELETE FROM sessions WHERE expires_at <= ?")
            .bind(now)
            .execute(&self.pool)
            .await?
            .rows_affected())
    }

    /// Number of sessions held by a user
    pub async fn count_user_sessions(&self, user_id: i64) -> Result<i64> {
        Ok(sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM sessions WHERE user_id = ?")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?)
    }
}
