use anyhow::Result;
use sqlx::QueryBuilder;

use super::schema::Database;
use super::types::{Feed, FeedDbRow, NewFeed};

const FEED_COLUMNS: &str = "id, title, url, link, description, category, image_url, \
     script_path, last_updated, last_error, proxy_enabled, proxy_url";

impl Database {
    // ========================================================================
    // Feed Operations
    // ========================================================================

    /// Subscribe to a feed, returning its ID.
    ///
    /// Subscribing to an existing URL updates its title, category and script
    /// and returns the existing ID (ON CONFLICT DO UPDATE).
    pub async fn insert_feed(&self, feed: &NewFeed) -> Result<i64> {
        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO feeds (title, url, category, script_path)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(url) DO UPDATE SET
                title = excluded.title,
                category = excluded.category,
                script_path = excluded.script_path
            RETURNING id
        "#,
        )
        .bind(&feed.title)
        .bind(&feed.url)
        .bind(&feed.category)
        .bind(&feed.script_path)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    /// Get all feeds ordered by title
    pub async fn get_feeds(&self) -> Result<Vec<Feed>> {
        let sql = format!("SELECT {FEED_COLUMNS} FROM feeds ORDER BY title, id");
        let rows = sqlx::query_as::<_, FeedDbRow>(&sql)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(FeedDbRow::into_feed).collect())
    }

    /// Get a single feed by its ID
    pub async fn get_feed_by_id(&self, feed_id: i64) -> Result<Option<Feed>> {
        let sql = format!("SELECT {FEED_COLUMNS} FROM feeds WHERE id = ?");
        let row = sqlx::query_as::<_, FeedDbRow>(&sql)
            .bind(feed_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(FeedDbRow::into_feed))
    }

    /// Get feeds by ID, returned in the order the IDs were given.
    ///
    /// Unknown IDs are skipped. Duplicate IDs yield one feed.
    pub async fn get_feeds_by_ids(&self, ids: &[i64]) -> Result<Vec<Feed>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        const CHUNK_SIZE: usize = 500;
        let mut found = std::collections::HashMap::new();

        for chunk in ids.chunks(CHUNK_SIZE) {
            let mut builder: QueryBuilder<sqlx::Sqlite> =
                QueryBuilder::new(format!("SELECT {FEED_COLUMNS} FROM feeds WHERE id IN ("));
            let mut separated = builder.separated(", ");
            for id in chunk {
                separated.push_bind(*id);
            }
            separated.push_unseparated(")");

            let rows: Vec<FeedDbRow> = builder.build_query_as().fetch_all(&self.pool).await?;
            for row in rows {
                found.insert(row.id, row.into_feed());
            }
        }

        Ok(ids.iter().filter_map(|id| found.remove(id)).collect())
    }

    /// Set or clear the last error for a feed
    pub async fn update_feed_error(&self, feed_id: i64, error: Option<&str>) -> Result<()> {
        sqlx::query("UPDATE feeds SET last_error = ? WHERE id = ?")
            .bind(error)
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Touch the last-updated timestamp for a feed
    pub async fn update_feed_last_updated(&self, feed_id: i64) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query("UPDATE feeds SET last_updated = ? WHERE id = ?")
            .bind(now)
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Back-fill the image and homepage link discovered while parsing.
    ///
    /// Each value is written only if the stored one is still empty, so a
    /// user-edited image or link is never overwritten.
    pub async fn update_feed_discovered(
        &self,
        feed_id: i64,
        image_url: Option<&str>,
        link: Option<&str>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        if let Some(image_url) = image_url.filter(|s| !s.is_empty()) {
            sqlx::query("UPDATE feeds SET image_url = ? WHERE id = ? AND image_url = ''")
                .bind(image_url)
                .bind(feed_id)
                .execute(&mut *tx)
                .await?;
        }
        if let Some(link) = link.filter(|s| !s.is_empty()) {
            sqlx::query("UPDATE feeds SET link = ? WHERE id = ? AND link = ''")
                .bind(link)
                .bind(feed_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Clear the stored error of every feed, returns the number of feeds cleared
    pub async fn clear_all_feed_errors(&self) -> Result<u64> {
        let result = sqlx::query("UPDATE feeds SET last_error = NULL WHERE last_error IS NOT NULL")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Switch the per-feed proxy override on or off
    pub async fn set_feed_proxy(&self, feed_id: i64, proxy_url: Option<&str>) -> Result<()> {
        sqlx::query("UPDATE feeds SET proxy_enabled = ?, proxy_url = ? WHERE id = ?")
            .bind(proxy_url.is_some())
            .bind(proxy_url)
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
