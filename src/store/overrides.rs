//! Discovered-app override rows

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::{Store, decode_list, encode_list, now_secs};
use crate::Result;

/// Admin decision about one discovered URL
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveredOverride {
    /// Discovered URL this row applies to
    pub url: String,
    /// Replacement name
    pub name: Option<String>,
    /// Replacement URL
    pub new_url: Option<String>,
    /// Replacement icon
    pub icon: Option<String>,
    /// Replacement description
    pub description: Option<String>,
    /// Target category
    pub category: Option<String>,
    /// Group allow-list
    pub groups: Vec<String>,
    /// Drop the entry from the dashboard
    pub hidden: bool,
}

#[derive(FromRow)]
struct OverrideRow {
    url: String,
    name: Option<String>,
    new_url: Option<String>,
    icon: Option<String>,
    description: Option<String>,
    category: Option<String>,
    groups: String,
    hidden: bool,
}

impl From<OverrideRow> for DiscoveredOverride {
    fn from(row: OverrideRow) -> Self {
        Self {
            url: row.url,
            name: row.name,
            new_url: row.new_url,
            icon: row.icon,
            description: row.description,
            category: row.category,
            groups: decode_list(&row.groups),
            hidden: row.hidden,
        }
    }
}

fn non_empty(value: Option<&String>) -> Option<&str> {
    value.map(|v| v.trim()).filter(|v| !v.is_empty())
}

const OVERRIDE_COLUMNS: &str = "url, name, new_url, icon, description, category, groups, hidden";

impl Store {
    /// All overrides
    pub async fn list_overrides(&self) -> Result<Vec<DiscoveredOverride>> {
        let rows = sqlx::query_as::<_, OverrideRow>(&format!(
            "SELECT {OVERRIDE_COLUMNS} FROM discovered_overrides ORDER BY url"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(DiscoveredOverride::from).collect())
    }

    /// Override for one URL
    pub async fn get_override(&self, url: &str) -> Result<Option<DiscoveredOverride>> {
        let row = sqlx::query_as::<_, OverrideRow>(&format!(
            "SELECT {OVERRIDE_COLUMNS} FROM discovered_overrides WHERE url = ?"
        ))
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(DiscoveredOverride::from))
    }

    /// Create or replace the override for `o.url`. Blank strings are stored as NULL.
    pub async fn upsert_override(&self, o: &DiscoveredOverride) -> Result<()> {
        sqlx::query(
            "INSERT INTO discovered_overrides (url, name, new_url, icon, description, category, groups, hidden, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(url) DO UPDATE SET
                name = excluded.name, new_url = excluded.new_url, icon = excluded.icon,
                description = excluded.description, category = excluded.category,
                groups = excluded.groups, hidden = excluded.hidden, updated_at = excluded.updated_at",
        )
        .bind(&o.url)
        .bind(non_empty(o.name.as_ref()))
        .bind(non_empty(o.new_url.as_ref()))
        .bind(non_empty(o.icon.as_ref()))
        .bind(non_empty(o.description.as_ref()))
        .bind(non_empty(o.category.as_ref()))
        .bind(encode_list(&o.groups)?)
        .bind(o.hidden)
        .bind(now_secs())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Remove the override for one URL
    pub async fn delete_override(&self, url: &str) -> Result<bool> {
        let affected = sqlx::query("DELETE FROM discovered_overrides WHERE url = ?")
            .bind(url)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(affected > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_replaces_and_blanks_become_null() {
        let store = Store::in_memory().await.unwrap();
        let mut o = DiscoveredOverride {
            url: "https://grafana.lan".into(),
            name: Some("Grafana".into()),
            icon: Some("  ".into()),
            groups: vec!["ops".into()],
            ..DiscoveredOverride::default()
        };
        store.upsert_override(&o).await.unwrap();
        let stored = store.get_override(&o.url).await.unwrap().unwrap();
        assert_eq!(stored.icon, None);
        assert_eq!(stored.groups, vec!["ops"]);

        o.hidden = true;
        store.upsert_override(&o).await.unwrap();
        assert!(store.get_override(&o.url).await.unwrap().unwrap().hidden);
        assert_eq!(store.list_overrides().await.unwrap().len(), 1);

        assert!(store.delete_override(&o.url).await.unwrap());
        assert!(store.get_override(&o.url).await.unwrap().is_none());
    }
}
