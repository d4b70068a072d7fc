//! Per-user preference rows

use std::collections::BTreeMap;

use super::Store;
use crate::Result;

impl Store {
    /// All preferences of a user
    pub async fn get_preferences(&self, user_id: i64) -> Result<BTreeMap<String, String>> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT key, value FROM user_preferences WHERE user_id = ?")
                .bind(user_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().collect())
    }

    /// Upsert one preference
    pub async fn set_preference(&self, user_id: i64, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO user_preferences (user_id, key, value) VALUES (?, ?, ?)
             ON CONFLICT(user_id, key) DO UPDATE SET value = excluded.value",
        )
        .bind(user_id)
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
