//! Feed retrieval and the per-feed refresh pipeline.
//!
//! - [`parser`] - HTTP download and `feed-rs` parsing behind the [`FeedParser`] trait
//! - [`script`] - custom fetch scripts whose stdout is a feed document
//! - [`extract`] - title, image and content extraction from parsed items
//! - [`translate`] - optional title translation
//! - [`fetcher`] - [`Fetcher::fetch_one`], one refresh of one feed
//!
//! Retry, deadlines and concurrency live in [`crate::tasks`]; a fetch here
//! is a single attempt.

mod extract;
mod fetcher;
mod parser;
mod script;
mod translate;

pub use extract::{extract_articles, extract_content, extract_image, extract_title};
pub use fetcher::{FeedFetch, FetchError, FetchReport, Fetcher, DEFAULT_TRANSLATION_BUDGET};
pub use parser::{
    parse_feed_bytes, Enclosure, FeedParser, HttpFeedParser, ParseError, ParsedFeed, ParsedItem,
    MAX_FEED_SIZE,
};
pub use script::{ProcessScriptExecutor, ScriptExecutor};
pub use translate::{
    configured_target_language, translate_titles, Translator, DEFAULT_TARGET_LANGUAGE,
};
