mod articles;
mod feeds;
mod schema;
mod settings;
mod types;

pub use schema::Database;
pub use settings::{
    MAX_ARTICLE_AGE_DAYS_KEY, RULES_KEY, TARGET_LANGUAGE_KEY, TRANSLATION_ENABLED_KEY,
};
pub use types::{
    Article, ArticleFilter, ArticleFlag, DatabaseError, Feed, NewArticle, NewFeed,
};
