//! Utility functions shared by the fetch pipeline and the rule engine.
//!
//! - **Dedup**: URL comparison tolerant of tracking parameters, and the
//!   day-granular article identity hash
//! - **Text processing**: HTML to plain text, Unicode-aware truncation
//!
//! # Examples
//!
//! ```
//! use refeed::util::{excerpt, urls_match};
//!
//! assert!(urls_match("https://a.com/post?utm_source=rss", "https://a.com/post"));
//! assert_eq!(excerpt("<p>Hello <b>world</b></p>", 40), "Hello world");
//! ```

mod dedup;
mod text;

pub use dedup::{generate_article_unique_id, normalize_url_for_comparison, urls_match, KnownUrls};
pub use text::{display_width, excerpt, html_to_text, truncate_to_width};
