use anyhow::Result;
use sqlx::QueryBuilder;

use super::schema::Database;
use crate::feed::FeedSource;

impl Database {
    // ========================================================================
    // Feed Source Operations
    // ========================================================================

    /// User-added sources, oldest first.
    pub async fn load_sources(&self) -> Result<Vec<FeedSource>> {
        let rows: Vec<(String, String, Option<String>)> = sqlx::query_as(
            "SELECT title, url, description FROM feed_sources ORDER BY added_at, rowid",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(title, url, description)| FeedSource {
                title,
                url,
                description,
            })
            .collect())
    }

    /// Insert or update a source, keyed by URL.
    pub async fn save_source(&self, source: &FeedSource) -> Result<()> {
        self.save_sources(std::slice::from_ref(source)).await
    }

    /// Batch upsert, used by OPML import.
    pub async fn save_sources(&self, sources: &[FeedSource]) -> Result<()> {
        if sources.is_empty() {
            return Ok(());
        }

        const BATCH_SIZE: usize = 100;
        let mut tx = self.pool.begin().await?;

        for chunk in sources.chunks(BATCH_SIZE) {
            let mut builder: QueryBuilder<sqlx::Sqlite> =
                QueryBuilder::new("INSERT INTO feed_sources (title, url, description) ");

            builder.push_values(chunk, |mut b, source| {
                b.push_bind(&source.title)
                    .push_bind(&source.url)
                    .push_bind(&source.description);
            });

            builder.push(
                " ON CONFLICT(url) DO UPDATE SET title = excluded.title, description = excluded.description",
            );

            builder.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Delete a source by URL. Returns whether it existed.
    pub async fn delete_source(&self, url: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM feed_sources WHERE url = ?")
            .bind(url)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
