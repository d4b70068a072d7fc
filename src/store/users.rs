//! User rows

use serde::Serialize;
use sqlx::FromRow;
use tracing::warn;

use super::{Store, decode_list, encode_list, now_secs};
use crate::crypto::password::is_external_tag;
use crate::{Error, Result};

/// A persisted user
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct User {
    /// Row id
    pub id: i64,
    /// Unique login name
    pub username: String,
    /// Optional unique email
    pub email: Option<String>,
    /// Display name
    pub display_name: String,
    /// Ordered group list
    pub groups: Vec<String>,
    /// Argon2 PHC string, `LDAP_USER` or `OIDC_USER`
    #[serde(skip)]
    pub password_hash: String,
    /// Creation time (Unix seconds)
    pub created_at: i64,
}

impl User {
    /// Whether the user has a local password credential
    #[must_use]
    pub fn is_local(&self) -> bool {
        !is_external_tag(&self.password_hash)
    }
}

#[derive(FromRow)]
struct UserRow {
    id: i64,
    username: String,
    email: Option<String>,
    display_name: String,
    groups: String,
    password_hash: String,
    created_at: i64,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        Self {
            id: row.id,
            username: row.username,
            email: row.email,
            display_name: row.display_name,
            groups: decode_list(&row.groups),
            password_hash: row.password_hash,
            created_at: row.created_at,
        }
    }
}

/// Fields for a new user
#[derive(Debug, Clone, Default)]
pub struct NewUser {
    /// Login name
    pub username: String,
    /// Optional email
    pub email: Option<String>,
    /// Display name
    pub display_name: String,
    /// Group list
    pub groups: Vec<String>,
    /// Already-hashed credential or external tag
    pub password_hash: String,
}

/// Admin-editable fields
#[derive(Debug, Clone, Default)]
pub struct UserUpdate {
    /// New email (`None` clears it)
    pub email: Option<String>,
    /// New display name
    pub display_name: String,
    /// New group list
    pub groups: Vec<String>,
}

/// Profile asserted by an external provider at login
#[derive(Debug, Clone, Default)]
pub struct ExternalUser {
    /// Login name
    pub username: String,
    /// Email, if the provider supplied one
    pub email: Option<String>,
    /// Display name
    pub display_name: String,
    /// Groups asserted by the provider
    pub groups: Vec<String>,
}

const USER_COLUMNS: &str = "id, username, email, display_name, groups, password_hash, created_at";

fn normalize_email(email: Option<&str>) -> Option<String> {
    email
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .map(ToString::to_string)
}

impl Store {
    /// Insert a user
    pub async fn create_user(&self, user: &NewUser) -> Result<User> {
        let now = now_secs();
        let id = sqlx::query(
            "INSERT INTO users (username, email, display_name, groups, password_hash, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(user.username.trim())
        .bind(normalize_email(user.email.as_deref()))
        .bind(&user.display_name)
        .bind(encode_list(&user.groups)?)
        .bind(&user.password_hash)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        self.get_user(id)
            .await?
            .ok_or_else(|| Error::Internal("inserted user vanished".to_string()))
    }

    /// Fetch a user by id
    pub async fn get_user(&self, id: i64) -> Result<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(User::from))
    }

    /// Fetch a user by login name
    pub async fn lookup_user_by_username(&self, username: &str) -> Result<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE username = ?"
        ))
        .bind(username.trim())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(User::from))
    }

    /// All users ordered by name
    pub async fn list_users(&self) -> Result<Vec<User>> {
        let rows = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users ORDER BY username COLLATE NOCASE"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(User::from).collect())
    }

    /// Update the editable profile fields
    pub async fn update_user(&self, id: i64, update: &UserUpdate) -> Result<User> {
        let affected = sqlx::query(
            "UPDATE users SET email = ?, display_name = ?, groups = ?, updated_at = ? WHERE id = ?",
        )
        .bind(normalize_email(update.email.as_deref()))
        .bind(&update.display_name)
        .bind(encode_list(&update.groups)?)
        .bind(now_secs())
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if affected == 0 {
            return Err(Error::NotFound(format!("user {id}")));
        }
        self.get_user(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("user {id}")))
    }

    /// Replace the stored credential
    pub async fn set_password_hash(&self, id: i64, password_hash: &str) -> Result<()> {
        let affected = sqlx::query("UPDATE users SET password_hash = ?, updated_at = ? WHERE id = ?")
            .bind(password_hash)
            .bind(now_secs())
            .bind(id)
            .execute(&self.pool)
            .await?
            .rows_affected();

        if affected == 0 {
            return Err(Error::NotFound(format!("user {id}")));
        }
        Ok(())
    }

    /// Delete a user; sessions and preferences cascade
    pub async fn delete_user(&self, id: i64) -> Result<bool> {
        let affected = sqlx::query("DELETE FROM users WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(affected > 0)
    }

    /// Number of users
    pub async fn count_users(&self) -> Result<i64> {
        Ok(sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM users")
            .fetch_one(&self.pool)
            .await?)
    }

    /// Create or refresh a user asserted by an external provider.
    ///
    /// A local account with the same name is never converted: the call fails
    /// with [`Error::Conflict`]. An email already owned by another user is
    /// dropped rather than failing the login.
    pub async fn upsert_external_user(&self, profile: &ExternalUser, tag: &str) -> Result<User> {
        let mut tx = self.begin().await?;
        let now = now_secs();
        let username = profile.username.trim();

        let existing = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE username = ?"
        ))
        .bind(username)
        .fetch_optional(&mut *tx)
        .await?
        .map(User::from);

        let mut email = normalize_email(profile.email.as_deref());
        if let Some(candidate) = email.as_deref() {
            let owner: Option<i64> = sqlx::query_scalar("SELECT id FROM users WHERE email = ?")
                .bind(candidate)
                .fetch_optional(&mut *tx)
                .await?;
            if owner.is_some_and(|id| existing.as_ref().is_none_or(|u| u.id != id)) {
                warn!(username, "External email already belongs to another user; not stored");
                email = None;
            }
        }

        let id = match existing {
            Some(user) if user.is_local() => {
                return Err(Error::Conflict(format!(
                    "local user {username} cannot sign in through an external provider"
                )));
            }
            Some(user) => {
                sqlx::query(
                    "UPDATE users SET email = ?, display_name = ?, groups = ?, password_hash = ?, updated_at = ?
                     WHERE id = ?",
                )
                .bind(&email)
                .bind(&profile.display_name)
                .bind(encode_list(&profile.groups)?)
                .bind(tag)
                .bind(now)
                .bind(user.id)
                .execute(&mut *tx)
                .await?;
                user.id
            }
            None => sqlx::query(
                "INSERT INTO users (username, email, display_name, groups, password_hash, created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(username)
            .bind(&email)
            .bind(&profile.display_name)
            .bind(encode_list(&profile.groups)?)
            .bind(tag)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?
            .last_insert_rowid(),
        };

        tx.commit().await?;

        self.get_user(id)
            .await?
            .ok_or_else(|| Error::Internal("upserted user vanished".to_string()))
    }
}
