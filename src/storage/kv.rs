use anyhow::Result;

use super::schema::Database;

impl Database {
    // ========================================================================
    // Key-Value Operations
    // ========================================================================

    /// Get a single stored value by key.
    ///
    /// # Returns
    ///
    /// The value if the key exists, or `None` if it was never set.
    pub async fn get_value(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM kv_store WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|(value,)| value))
    }

    /// Set a value (UPSERT). Last write wins.
    pub async fn set_value(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO kv_store (key, value, updated_at)
            VALUES (?, ?, datetime('now'))
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
        "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Remove a key. Returns whether it existed.
    pub async fn delete_value(&self, key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM kv_store WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::Database;
    use pretty_assertions::assert_eq;

    async fn test_db() -> Database {
        Database::open(":memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_get_value_missing() {
        let db = test_db().await;
        let value = db.get_value("nonexistent.key").await.unwrap();
        assert_eq!(value, None);
    }

    #[tokio::test]
    async fn test_set_and_get_value() {
        let db = test_db().await;
        db.set_value("watchlist.keywords", r#"["ransomware"]"#)
            .await
            .unwrap();

        let value = db.get_value("watchlist.keywords").await.unwrap();
        assert_eq!(value, Some(r#"["ransomware"]"#.to_string()));
    }

    #[tokio::test]
    async fn test_set_value_last_write_wins() {
        let db = test_db().await;
        db.set_value("k", "first").await.unwrap();
        db.set_value("k", "second").await.unwrap();

        assert_eq!(db.get_value("k").await.unwrap(), Some("second".to_string()));
    }

    #[tokio::test]
    async fn test_delete_value() {
        let db = test_db().await;
        db.set_value("k", "v").await.unwrap();

        assert!(db.delete_value("k").await.unwrap());
        assert!(!db.delete_value("k").await.unwrap());
        assert_eq!(db.get_value("k").await.unwrap(), None);
    }
}
