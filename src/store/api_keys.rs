//! API key rows

use serde::Serialize;
use sqlx::FromRow;

use super::{Store, decode_list, encode_list, now_secs};
use crate::{Error, Result};

/// A persisted API key (never holds the plaintext)
#[derive(Debug, Clone, Serialize)]
pub struct ApiKey {
    /// Row id
    pub id: i64,
    /// Human label
    pub name: String,
    /// Argon2 hash of the full key
    #[serde(skip)]
    pub key_hash: String,
    /// First eight characters of the key
    pub key_prefix: String,
    /// Identity the key acts as
    pub username: String,
    /// Groups granted to the key
    pub groups: Vec<String>,
    /// Free-form permission tags
    pub permissions: Vec<String>,
    /// Optional expiry (Unix seconds)
    pub expires_at: Option<i64>,
    /// Last successful use (Unix seconds)
    pub last_used_at: Option<i64>,
    /// Creation time (Unix seconds)
    pub created_at: i64,
}

impl ApiKey {
    /// Whether the key is past its expiry
    #[must_use]
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now)
    }
}

#[derive(FromRow)]
struct ApiKeyRow {
    id: i64,
    name: String,
    key_hash: String,
    key_prefix: String,
    username: String,
    groups: String,
    permissions: String,
    expires_at: Option<i64>,
    last_used_at: Option<i64>,
    created_at: i64,
}

impl From<ApiKeyRow> for ApiKey {
    fn from(row: ApiKeyRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            key_hash: row.key_hash,
            key_prefix: row.key_prefix,
            username: row.username,
            groups: decode_list(&row.groups),
            permissions: decode_list(&row.permissions),
            expires_at: row.expires_at,
            last_used_at: row.last_used_at,
            created_at: row.created_at,
        }
    }
}

/// Fields for a new API key
#[derive(Debug, Clone, Default)]
pub struct NewApiKey {
    /// Human label
    pub name: String,
    /// Argon2 hash of the full key
    pub key_hash: String,
    /// First eight characters of the key
    pub key_prefix: String,
    /// Identity the key acts as
    pub username: String,
    /// Groups granted to the key
    pub groups: Vec<String>,
    /// Permission tags
    pub permissions: Vec<String>,
    /// Optional expiry (Unix seconds)
    pub expires_at: Option<i64>,
}

const KEY_COLUMNS: &str = "id, name, key_hash, key_prefix, username, groups, permissions, expires_at, last_used_at, created_at";

impl Store {
    /// Insert an API key
    pub async fn insert_api_key(&self, key: &NewApiKey) -> Result<ApiKey> {
        let now = now_secs();
        let id = sqlx::query(
            "INSERT INTO api_keys (name, key_hash, key_prefix, username, groups, permissions, expires_at, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&key.name)
        .bind(&key.key_hash)
        .bind(&key.key_prefix)
        .bind(&key.username)
        .bind(encode_list(&key.groups)?)
        .bind(encode_list(&key.permissions)?)
        .bind(key.expires_at)
        .bind(now)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        let row = sqlx::query_as::<_, ApiKeyRow>(&format!(
            "SELECT {KEY_COLUMNS} FROM api_keys WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(ApiKey::from)
            .ok_or_else(|| Error::Internal("inserted api key vanished".to_string()))
    }

    /// All keys, newest first
    pub async fn list_api_keys(&self) -> Result<Vec<ApiKey>> {
        let rows = sqlx::query_as::<_, ApiKeyRow>(&format!(
            "SELECT {KEY_COLUMNS} FROM api_keys ORDER BY created_at DESC, id DESC"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ApiKey::from).collect())
    }

    /// Keys sharing a lookup prefix, oldest first
    pub async fn list_api_keys_by_prefix(&self, prefix: &str) -> Result<Vec<ApiKey>> {
        let rows = sqlx::query_as::<_, ApiKeyRow>(&format!(
            "SELECT {KEY_COLUMNS} FROM api_keys WHERE key_prefix = ? ORDER BY id"
        ))
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ApiKey::from).collect())
    }

    /// Record a successful use
    pub async fn touch_api_key(&self, id: i64, now: i64) -> Result<()> {
        sqlx::query("UPDATE api_keys SET last_used_at = ? WHERE id = ?")
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Revoke a key
    pub async fn delete_api_key(&self, id: i64) -> Result<bool> {
        let affected = sqlx::query("DELETE FROM api_keys WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(affected > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(prefix: &str) -> NewApiKey {
        NewApiKey {
            name: "ci".into(),
            key_hash: "$argon2id$x".into(),
            key_prefix: prefix.into(),
            username: "ci-bot".into(),
            groups: vec!["automation".into()],
            permissions: vec!["read".into()],
            expires_at: None,
        }
    }

    #[tokio::test]
    async fn prefix_lookup_and_touch() {
        let store = Store::in_memory().await.unwrap();
        let inserted = store.insert_api_key(&key("abcd1234")).await.unwrap();
        store.insert_api_key(&key("ffff0000")).await.unwrap();

        let matches = store.list_api_keys_by_prefix("abcd1234").await.unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].groups, vec!["automation"]);
        assert!(matches[0].last_used_at.is_none());

        store.touch_api_key(inserted.id, 1_700_000_000).await.unwrap();
        let matches = store.list_api_keys_by_prefix("abcd1234").await.unwrap();
        assert_eq!(matches[0].last_used_at, Some(1_700_000_000));
    }

    #[tokio::test]
    async fn delete_reports_missing_rows() {
        let store = Store::in_memory().await.unwrap();
        let inserted = store.insert_api_key(&key("abcd1234")).await.unwrap();
        assert!(store.delete_api_key(inserted.id).await.unwrap());
        assert!(!store.delete_api_key(inserted.id).await.unwrap());
    }

    #[test]
    fn expiry_check() {
        let mut k = ApiKey::from(ApiKeyRow {
            id: 1,
            name: String::new(),
            key_hash: String::new(),
            key_prefix: String::new(),
            username: String::new(),
            groups: "[]".into(),
            permissions: "[]".into(),
            expires_at: Some(100),
            last_used_at: None,
            created_at: 0,
        });
        assert!(k.is_expired(100));
        assert!(!k.is_expired(99));
        k.expires_at = None;
        assert!(!k.is_expired(i64::MAX));
    }
}
