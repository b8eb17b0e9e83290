use std::sync::Arc;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Database-specific errors with user-friendly messages
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another process holds the database lock
    #[error("The feed database is locked by another process. Please close it and try again.")]
    Locked,

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Check if a sqlx error indicates database locking
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        let error_string = err.to_string().to_lowercase();

        // SQLITE_BUSY (5): database is locked
        // SQLITE_LOCKED (6): database table is locked
        // SQLITE_CANTOPEN (14): unable to open database file
        if error_string.contains("database is locked")
            || error_string.contains("database table is locked")
            || error_string.contains("unable to open database file")
        {
            return DatabaseError::Locked;
        }

        DatabaseError::Other(err)
    }
}

// ============================================================================
// Feeds
// ============================================================================

/// Internal row type for feed queries (used by sqlx FromRow)
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct FeedDbRow {
    pub id: i64,
    pub title: String,
    pub url: String,
    pub link: String,
    pub description: String,
    pub category: String,
    pub image_url: String,
    pub script_path: Option<String>,
    pub last_updated: Option<i64>,
    pub last_error: Option<String>,
    pub proxy_enabled: bool,
    pub proxy_url: Option<String>,
}

impl FeedDbRow {
    pub(crate) fn into_feed(self) -> Feed {
        Feed {
            id: self.id,
            title: Arc::from(self.title),
            url: self.url,
            link: self.link,
            description: self.description,
            category: self.category,
            image_url: self.image_url,
            script_path: self.script_path.filter(|p| !p.trim().is_empty()),
            last_updated: self.last_updated,
            last_error: self.last_error,
            proxy_enabled: self.proxy_enabled,
            proxy_url: self.proxy_url,
        }
    }
}

/// A subscribed feed.
///
/// `title` is an `Arc<str>` because refresh tasks, the op-log and progress
/// snapshots all hold a copy of it.
#[derive(Debug, Clone)]
pub struct Feed {
    pub id: i64,
    pub title: Arc<str>,
    pub url: String,
    /// Homepage of the feed, back-filled from the parsed feed when empty
    pub link: String,
    pub description: String,
    pub category: String,
    pub image_url: String,
    /// Custom fetch script (relative to the scripts directory)
    pub script_path: Option<String>,
    /// Unix timestamp of the last refresh attempt, successful or not
    pub last_updated: Option<i64>,
    pub last_error: Option<String>,
    pub proxy_enabled: bool,
    pub proxy_url: Option<String>,
}

impl Feed {
    /// Proxy to use for this feed, if its override is switched on.
    pub fn proxy(&self) -> Option<&str> {
        if !self.proxy_enabled {
            return None;
        }
        self.proxy_url.as_deref().filter(|p| !p.trim().is_empty())
    }
}

/// Fields needed to subscribe to a feed
#[derive(Debug, Clone, Default)]
pub struct NewFeed {
    pub title: String,
    pub url: String,
    pub category: String,
    pub script_path: Option<String>,
}

// ============================================================================
// Articles
// ============================================================================

/// Article produced by the fetch pipeline, ready to be upserted by URL
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewArticle {
    pub feed_id: i64,
    pub title: String,
    pub url: String,
    pub image_url: String,
    pub content: String,
    pub translated_title: String,
    pub summary: String,
    pub published_at: Option<i64>,
    pub unique_id: String,
}

/// Internal row type for Article queries (used by sqlx FromRow)
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ArticleDbRow {
    pub id: i64,
    pub feed_id: i64,
    pub title: String,
    pub url: String,
    pub image_url: String,
    pub content: String,
    pub translated_title: String,
    pub summary: String,
    pub published_at: Option<i64>,
    pub is_read: bool,
    pub is_favorite: bool,
    pub is_hidden: bool,
    pub is_read_later: bool,
    pub unique_id: String,
}

impl ArticleDbRow {
    pub(crate) fn into_article(self) -> Article {
        Article {
            id: self.id,
            feed_id: self.feed_id,
            title: self.title,
            url: self.url,
            image_url: self.image_url,
            content: Arc::from(self.content),
            translated_title: self.translated_title,
            summary: self.summary,
            published_at: self.published_at,
            is_read: self.is_read,
            is_favorite: self.is_favorite,
            is_hidden: self.is_hidden,
            is_read_later: self.is_read_later,
            unique_id: self.unique_id,
        }
    }
}

/// Article data from database
///
/// `content` is an `Arc<str>` so the content cache can hold it without
/// copying the HTML body.
#[derive(Debug, Clone)]
pub struct Article {
    pub id: i64,
    pub feed_id: i64,
    pub title: String,
    pub url: String,
    pub image_url: String,
    pub content: Arc<str>,
    pub translated_title: String,
    pub summary: String,
    pub published_at: Option<i64>,
    pub is_read: bool,
    pub is_favorite: bool,
    pub is_hidden: bool,
    pub is_read_later: bool,
    pub unique_id: String,
}

/// Boolean user-state columns on an article
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArticleFlag {
    Read,
    Favorite,
    Hidden,
    ReadLater,
}

impl ArticleFlag {
    /// Column backing this flag. Only ever interpolated from this fixed set.
    pub(crate) fn column(self) -> &'static str {
        match self {
            ArticleFlag::Read => "is_read",
            ArticleFlag::Favorite => "is_favorite",
            ArticleFlag::Hidden => "is_hidden",
            ArticleFlag::ReadLater => "is_read_later",
        }
    }
}

/// Filters for [`Database::get_articles`](super::Database::get_articles)
#[derive(Debug, Clone, Default)]
pub struct ArticleFilter {
    pub feed_id: Option<i64>,
    pub unread_only: bool,
    pub favorites_only: bool,
    pub read_later_only: bool,
    /// Hidden articles are excluded unless this is set
    pub include_hidden: bool,
    pub limit: Option<i64>,
}
