use anyhow::Result;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};
use std::str::FromStr;
use std::time::Duration;

use super::types::DatabaseError;

// ============================================================================
// Database
// ============================================================================

/// Handle to the local state database.
///
/// Cheap to clone; all clones share one connection pool.
#[derive(Clone)]
pub struct Database {
    pub(crate) pool: SqlitePool,
}

impl Database {
    /// Open a database connection and run migrations
    ///
    /// `":memory:"` opens a private in-memory database, used by tests.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError::InstanceLocked` if another instance of
    /// feedsentry has the database locked (SQLITE_BUSY, SQLITE_LOCKED,
    /// SQLITE_CANTOPEN).
    /// Returns `DatabaseError::Other` for other database errors.
    pub async fn open(path: &str) -> Result<Self, DatabaseError> {
        let url = format!("sqlite:{}?mode=rwc", path);

        // Create the file owner-only before SQLite opens it
        #[cfg(unix)]
        if path != ":memory:" {
            use std::os::unix::fs::OpenOptionsExt;
            let db_path = std::path::Path::new(path);
            if !db_path.exists() && db_path.parent().is_some_and(|p| p.exists()) {
                // If creation fails, SQLite reports the error at connect_with.
                let _file = std::fs::OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .mode(0o600)
                    .open(db_path)
                    .ok();
            }
        }

        let options = SqliteConnectOptions::from_str(&url)
            .map_err(DatabaseError::from_sqlx)?
            .pragma("busy_timeout", "5000");
        // Watchlist and source writes are rare; a small pool is plenty.
        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(DatabaseError::from_sqlx)?;

        let db = Self { pool };
        db.migrate().await.map_err(|e| {
            let error_string = e.to_string().to_lowercase();
            if error_string.contains("database is locked")
                || error_string.contains("database table is locked")
            {
                DatabaseError::InstanceLocked
            } else {
                DatabaseError::Migration(e.to_string())
            }
        })?;

        tracing::debug!(path = %path, "Opened state database");
        Ok(db)
    }

    /// Run database migrations atomically within a transaction.
    ///
    /// All statements use `IF NOT EXISTS`, so re-running on an existing
    /// database is a no-op.
    async fn migrate(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        // Generic key-value store; keys use dotted convention (watchlist.keywords)
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv_store (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // User-added feed sources; built-in defaults live in config
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feed_sources (
                url TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                description TEXT,
                added_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_memory_creates_tables() {
        let db = Database::open(":memory:").await.unwrap();

        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name IN ('kv_store', 'feed_sources') ORDER BY name",
        )
        .fetch_all(&db.pool)
        .await
        .unwrap();

        assert_eq!(
            tables,
            vec![("feed_sources".to_string(),), ("kv_store".to_string(),)]
        );
    }

    #[tokio::test]
    async fn test_migrate_is_idempotent() {
        let db = Database::open(":memory:").await.unwrap();
        db.migrate().await.unwrap();
        db.migrate().await.unwrap();
    }
}
