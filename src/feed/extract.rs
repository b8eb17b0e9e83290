//! Turns parsed feed items into storable articles.

use std::sync::OnceLock;

use regex::Regex;

use super::parser::ParsedItem;
use crate::storage::NewArticle;
use crate::util::{excerpt, generate_article_unique_id};

/// Column width of the excerpt used when an item has no title
pub const TITLE_EXCERPT_WIDTH: usize = 100;
const UNTITLED: &str = "Untitled";

const IMAGE_EXTENSIONS: &[&str] = &[".jpg", ".jpeg", ".png", ".gif", ".webp", ".avif"];

static IMG_SRC_RE: OnceLock<Regex> = OnceLock::new();

fn img_src_re() -> &'static Regex {
    IMG_SRC_RE.get_or_init(|| {
        Regex::new(r#"(?i)<img\b[^>]*?\bsrc\s*=\s*["']([^"']+)["']"#)
            .expect("img pattern is valid")
    })
}

/// Convert every linkable item of a feed into a [`NewArticle`].
///
/// Items without a link are skipped. The unique ID is always computed; it
/// is only used for dedup when `published_at` is set.
pub fn extract_articles(feed_id: i64, items: &[ParsedItem]) -> Vec<NewArticle> {
    let mut skipped = 0usize;
    let articles: Vec<NewArticle> = items
        .iter()
        .filter_map(|item| {
            let url = item.link.trim();
            if url.is_empty() {
                skipped += 1;
                return None;
            }
            let title = extract_title(item);
            Some(NewArticle {
                feed_id,
                unique_id: generate_article_unique_id(&title, feed_id, item.published),
                title,
                url: url.to_string(),
                image_url: extract_image(item),
                content: extract_content(item).to_string(),
                published_at: item.published.map(|dt| dt.timestamp()),
                ..Default::default()
            })
        })
        .collect();

    if skipped > 0 {
        tracing::debug!(feed_id, skipped, "Items without a link skipped");
    }
    articles
}

/// Item title, else a plain-text excerpt of its body, else "Untitled".
pub fn extract_title(item: &ParsedItem) -> String {
    let title = item.title.trim();
    if !title.is_empty() {
        return title.to_string();
    }

    let fallback = excerpt(extract_content(item), TITLE_EXCERPT_WIDTH);
    if fallback.is_empty() {
        UNTITLED.to_string()
    } else {
        fallback
    }
}

/// Explicit image, then the first image enclosure, then the first `<img>`
/// in the body. Empty when none is found.
pub fn extract_image(item: &ParsedItem) -> String {
    if !item.image_url.trim().is_empty() {
        return item.image_url.trim().to_string();
    }

    if let Some(enclosure) = item
        .enclosures
        .iter()
        .find(|e| e.is_image() || (e.media_type.is_empty() && has_image_extension(&e.url)))
    {
        return enclosure.url.clone();
    }

    [item.content.as_str(), item.description.as_str()]
        .into_iter()
        .find_map(|html| img_src_re().captures(html))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_default()
}

/// Full content when present, otherwise the description.
pub fn extract_content(item: &ParsedItem) -> &str {
    if item.content.trim().is_empty() {
        &item.description
    } else {
        &item.content
    }
}

fn has_image_extension(url: &str) -> bool {
    let path = url.split(['?', '#']).next().unwrap_or_default().to_ascii_lowercase();
    IMAGE_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
}
