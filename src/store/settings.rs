//! Settings and secrets rows

use std::collections::HashMap;

use super::{Store, now_secs};
use crate::Result;

impl Store {
    /// Every persisted setting
    pub async fn load_settings(&self) -> Result<HashMap<String, String>> {
        let rows: Vec<(String, String)> = sqlx::query_as("SELECT key, value FROM system_settings")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().collect())
    }

    /// Upsert one setting
    pub async fn save_setting(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO system_settings (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Upsert several settings in one transaction
    pub async fn save_settings(&self, pairs: &[(String, String)]) -> Result<()> {
        let mut tx = self.begin().await?;
        for (key, value) in pairs {
            sqlx::query(
                "INSERT INTO system_settings (key, value) VALUES (?, ?)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            )
            .bind(key)
            .bind(value)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Read a row from `system_secrets`
    pub async fn get_secret(&self, name: &str) -> Result<Option<String>> {
        Ok(sqlx::query_scalar("SELECT value FROM system_secrets WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?)
    }

    /// Write a row to `system_secrets`
    pub async fn put_secret(&self, name: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO system_secrets (name, value, created_at) VALUES (?, ?, ?)
             ON CONFLICT(name) DO UPDATE SET value = excluded.value",
        )
        .bind(name)
        .bind(value)
        .bind(now_secs())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn settings_upsert() {
        let store = Store::in_memory().await.unwrap();
        store.save_setting("a", "1").await.unwrap();
        store
            .save_settings(&[("a".into(), "2".into()), ("b".into(), "3".into())])
            .await
            .unwrap();

        let all = store.load_settings().await.unwrap();
        assert_eq!(all["a"], "2");
        assert_eq!(all["b"], "3");
    }

    #[tokio::test]
    async fn secrets_are_separate_from_settings() {
        let store = Store::in_memory().await.unwrap();
        store.put_secret("k", "v").await.unwrap();
        assert_eq!(store.get_secret("k").await.unwrap().as_deref(), Some("v"));
        assert!(store.load_settings().await.unwrap().is_empty());
    }
}
