use anyhow::Result;
use sqlx::QueryBuilder;

use super::schema::Database;
use super::types::{Article, ArticleDbRow, ArticleFilter, ArticleFlag, NewArticle};

// ============================================================================
// Query Limit Constants
// ============================================================================

/// Maximum number of articles to return from any single query (OOM protection)
const MAX_ARTICLES: i64 = 2000;

const ARTICLE_COLUMNS: &str = "id, feed_id, title, url, image_url, content, translated_title, \
     summary, published_at, is_read, is_favorite, is_hidden, is_read_later, unique_id";

impl Database {
    // ========================================================================
    // Article Operations
    // ========================================================================

    /// Upsert articles keyed by URL, returns the number of rows written.
    ///
    /// Idempotent: saving the same batch twice leaves one row per URL.
    /// Existing rows keep their user state (read, favorite, hidden,
    /// read-later) and keep stored content/image when the new value is empty.
    /// Batch size of 50 keeps us well under SQLite's bind-parameter limit
    /// (10 columns * 50 = 500).
    pub async fn save_articles(&self, articles: &[NewArticle]) -> Result<usize> {
        if articles.is_empty() {
            return Ok(0);
        }

        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        const BATCH_SIZE: usize = 50;
        let mut written: usize = 0;

        for chunk in articles.chunks(BATCH_SIZE) {
            let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
                "INSERT INTO articles (feed_id, title, url, image_url, content, translated_title, \
                 summary, published_at, unique_id, fetched_at) ",
            );

            builder.push_values(chunk, |mut b, article| {
                b.push_bind(article.feed_id)
                    .push_bind(&article.title)
                    .push_bind(&article.url)
                    .push_bind(&article.image_url)
                    .push_bind(&article.content)
                    .push_bind(&article.translated_title)
                    .push_bind(&article.summary)
                    .push_bind(article.published_at)
                    .push_bind(&article.unique_id)
                    .push_bind(now);
            });

            builder.push(
                " ON CONFLICT(url) DO UPDATE SET \
                 title = excluded.title, \
                 image_url = CASE WHEN excluded.image_url <> '' THEN excluded.image_url ELSE articles.image_url END, \
                 content = CASE WHEN excluded.content <> '' THEN excluded.content ELSE articles.content END, \
                 translated_title = CASE WHEN excluded.translated_title <> '' THEN excluded.translated_title ELSE articles.translated_title END, \
                 published_at = COALESCE(excluded.published_at, articles.published_at), \
                 unique_id = excluded.unique_id",
            );

            let result = builder.build().execute(&mut *tx).await?;
            written += result.rows_affected() as usize;
        }

        tx.commit().await?;
        Ok(written)
    }

    // ========================================================================
    // Article Queries
    // ========================================================================

    /// Get articles matching a filter, newest first.
    ///
    /// Limit defaults to 500 and is capped at MAX_ARTICLES (2000).
    pub async fn get_articles(&self, filter: &ArticleFilter) -> Result<Vec<Article>> {
        let limit = filter.limit.unwrap_or(500).clamp(0, MAX_ARTICLES);

        let mut builder: QueryBuilder<sqlx::Sqlite> =
            QueryBuilder::new(format!("SELECT {ARTICLE_COLUMNS} FROM articles WHERE 1 = 1"));
        if let Some(feed_id) = filter.feed_id {
            builder.push(" AND feed_id = ").push_bind(feed_id);
        }
        if filter.unread_only {
            builder.push(" AND is_read = 0");
        }
        if filter.favorites_only {
            builder.push(" AND is_favorite = 1");
        }
        if filter.read_later_only {
            builder.push(" AND is_read_later = 1");
        }
        if !filter.include_hidden {
            builder.push(" AND is_hidden = 0");
        }
        builder
            .push(" ORDER BY published_at DESC, id DESC LIMIT ")
            .push_bind(limit);

        let rows: Vec<ArticleDbRow> = builder.build_query_as().fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(ArticleDbRow::into_article).collect())
    }

    /// Get a single article by its ID.
    pub async fn get_article_by_id(&self, article_id: i64) -> Result<Option<Article>> {
        let sql = format!("SELECT {ARTICLE_COLUMNS} FROM articles WHERE id = ?");
        let row = sqlx::query_as::<_, ArticleDbRow>(&sql)
            .bind(article_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(ArticleDbRow::into_article))
    }

    /// Every stored article URL for a feed (dedup input for the fetch pipeline)
    pub async fn get_article_urls_for_feed(&self, feed_id: i64) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT url FROM articles WHERE feed_id = ?")
            .bind(feed_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(url,)| url).collect())
    }

    /// `(id, url)` of the feed's articles stored without a body
    pub async fn get_articles_missing_content(&self, feed_id: i64) -> Result<Vec<(i64, String)>> {
        let rows: Vec<(i64, String)> =
            sqlx::query_as("SELECT id, url FROM articles WHERE feed_id = ? AND content = ''")
                .bind(feed_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows)
    }

    /// Every non-empty content identity stored for a feed
    pub async fn get_unique_ids_for_feed(&self, feed_id: i64) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT unique_id FROM articles WHERE feed_id = ? AND unique_id <> ''",
        )
        .bind(feed_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Read back articles by URL, at most `limit` rows.
    ///
    /// Chunks at 500 URLs per query to avoid SQLite bind-parameter limits.
    pub async fn get_articles_by_urls(&self, urls: &[String], limit: usize) -> Result<Vec<Article>> {
        if urls.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        const CHUNK_SIZE: usize = 500;
        let mut result = Vec::new();

        for chunk in urls.chunks(CHUNK_SIZE) {
            let remaining = limit.saturating_sub(result.len());
            if remaining == 0 {
                break;
            }

            let mut builder: QueryBuilder<sqlx::Sqlite> =
                QueryBuilder::new(format!("SELECT {ARTICLE_COLUMNS} FROM articles WHERE url IN ("));
            let mut separated = builder.separated(", ");
            for url in chunk {
                separated.push_bind(url);
            }
            separated.push_unseparated(")");
            builder.push(" ORDER BY id LIMIT ").push_bind(remaining as i64);

            let rows: Vec<ArticleDbRow> = builder.build_query_as().fetch_all(&self.pool).await?;
            result.extend(rows.into_iter().map(ArticleDbRow::into_article));
        }

        Ok(result)
    }

    // ========================================================================
    // Article Mutations
    // ========================================================================

    /// Set a boolean user-state flag, returns whether the row changed
    pub async fn set_article_flag(
        &self,
        article_id: i64,
        flag: ArticleFlag,
        value: bool,
    ) -> Result<bool> {
        let column = flag.column();
        let sql = format!("UPDATE articles SET {column} = ? WHERE id = ? AND {column} <> ?");
        let result = sqlx::query(&sql)
            .bind(value)
            .bind(article_id)
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Back-fill the HTML body of an article that was saved without one
    pub async fn set_article_content(&self, article_id: i64, content: &str) -> Result<()> {
        sqlx::query("UPDATE articles SET content = ? WHERE id = ?")
            .bind(content)
            .bind(article_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Delete articles published (or first seen) before `cutoff`.
    ///
    /// Favorites and read-later articles are always kept. Returns the number
    /// of rows deleted.
    pub async fn delete_articles_older_than(&self, cutoff: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM articles
            WHERE is_favorite = 0
              AND is_read_later = 0
              AND COALESCE(published_at, fetched_at) < ?
        "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::{ArticleFilter, ArticleFlag, Database, NewArticle, NewFeed};

    async fn setup() -> (Database, i64) {
        let db = Database::open(":memory:").await.unwrap();
        let feed_id = db
            .insert_feed(&NewFeed {
                title: "Test".into(),
                url: "https://example.com/rss".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        (db, feed_id)
    }

    fn article(feed_id: i64, n: usize) -> NewArticle {
        NewArticle {
            feed_id,
            title: format!("Article {n}"),
            url: format!("https://example.com/{n}"),
            content: format!("<p>Body {n}</p>"),
            published_at: Some(1_704_067_200 + n as i64),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_save_is_idempotent_by_url() {
        let (db, feed_id) = setup().await;
        let batch: Vec<_> = (0..3).map(|n| article(feed_id, n)).collect();

        db.save_articles(&batch).await.unwrap();
        db.save_articles(&batch).await.unwrap();

        let stored = db.get_articles(&ArticleFilter::default()).await.unwrap();
        assert_eq!(stored.len(), 3);
    }

    #[tokio::test]
    async fn test_save_preserves_user_state_and_content() {
        let (db, feed_id) = setup().await;
        db.save_articles(&[article(feed_id, 1)]).await.unwrap();
        let id = db.get_articles(&ArticleFilter::default()).await.unwrap()[0].id;
        db.set_article_flag(id, ArticleFlag::Favorite, true).await.unwrap();

        let mut update = article(feed_id, 1);
        update.title = "Renamed".into();
        update.content = String::new();
        db.save_articles(&[update]).await.unwrap();

        let stored = db.get_article_by_id(id).await.unwrap().unwrap();
        assert_eq!(stored.title, "Renamed");
        assert!(stored.is_favorite);
        assert_eq!(&*stored.content, "<p>Body 1</p>");
    }

    #[tokio::test]
    async fn test_get_articles_filters() {
        let (db, feed_id) = setup().await;
        let batch: Vec<_> = (0..4).map(|n| article(feed_id, n)).collect();
        db.save_articles(&batch).await.unwrap();
        let all = db.get_articles(&ArticleFilter::default()).await.unwrap();
        // Newest first
        assert_eq!(all[0].title, "Article 3");

        db.set_article_flag(all[0].id, ArticleFlag::Hidden, true).await.unwrap();
        db.set_article_flag(all[1].id, ArticleFlag::Read, true).await.unwrap();

        let visible = db.get_articles(&ArticleFilter::default()).await.unwrap();
        assert_eq!(visible.len(), 3);

        let unread = db
            .get_articles(&ArticleFilter {
                unread_only: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(unread.len(), 2);

        let limited = db
            .get_articles(&ArticleFilter {
                feed_id: Some(feed_id),
                include_hidden: true,
                limit: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn test_get_articles_by_urls_respects_limit() {
        let (db, feed_id) = setup().await;
        let batch: Vec<_> = (0..5).map(|n| article(feed_id, n)).collect();
        db.save_articles(&batch).await.unwrap();

        let urls: Vec<String> = batch.iter().map(|a| a.url.clone()).collect();
        assert_eq!(db.get_articles_by_urls(&urls, 3).await.unwrap().len(), 3);
        assert_eq!(db.get_articles_by_urls(&urls, 10).await.unwrap().len(), 5);
        assert!(db.get_articles_by_urls(&[], 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_set_flag_reports_change() {
        let (db, feed_id) = setup().await;
        db.save_articles(&[article(feed_id, 1)]).await.unwrap();
        let id = db.get_articles(&ArticleFilter::default()).await.unwrap()[0].id;

        assert!(db.set_article_flag(id, ArticleFlag::ReadLater, true).await.unwrap());
        assert!(!db.set_article_flag(id, ArticleFlag::ReadLater, true).await.unwrap());
        assert!(db.set_article_flag(id, ArticleFlag::ReadLater, false).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_old_keeps_favorites() {
        let (db, feed_id) = setup().await;
        let mut old = article(feed_id, 1);
        old.published_at = Some(1_000);
        let mut old_fav = article(feed_id, 2);
        old_fav.published_at = Some(1_000);
        let fresh = article(feed_id, 3);
        db.save_articles(&[old, old_fav, fresh]).await.unwrap();

        let fav = db
            .get_articles(&ArticleFilter::default())
            .await
            .unwrap()
            .into_iter()
            .find(|a| a.title == "Article 2")
            .unwrap();
        db.set_article_flag(fav.id, ArticleFlag::Favorite, true).await.unwrap();

        let deleted = db.delete_articles_older_than(1_000_000).await.unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(db.get_articles(&ArticleFilter::default()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_content_backfill() {
        let (db, feed_id) = setup().await;
        let mut a = article(feed_id, 1);
        a.content = String::new();
        db.save_articles(&[a]).await.unwrap();
        let id = db.get_articles(&ArticleFilter::default()).await.unwrap()[0].id;

        db.set_article_content(id, "<p>late</p>").await.unwrap();
        let stored = db.get_article_by_id(id).await.unwrap().unwrap();
        assert_eq!(&*stored.content, "<p>late</p>");
    }
}
