//! Article identity and URL comparison.
//!
//! Feeds routinely serve the same article under different URLs between
//! crawls: tracking parameters are appended, parameter order changes, a
//! trailing slash comes and goes. These helpers give the fetch pipeline a
//! stable notion of "already stored".

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use url::Url;

/// Query parameters that never identify content.
const TRACKING_PARAMS: &[&str] = &[
    "fbclid", "gclid", "gclsrc", "dclid", "msclkid", "yclid", "twclid", "ttclid", "igshid",
    "li_fat_id", "mc_cid", "mc_eid", "mkt_tok", "_ga", "_gl", "_hsenc", "_hsmi", "ref",
    "ref_src", "ref_url", "referrer", "spm", "scm", "share", "si", "cmpid", "ncid", "ocid",
    "icid", "trk", "s_cid", "rss", "feed", "xtor",
];

/// Parameter families used by analytics suites (`utm_source`, `pk_campaign`, ...).
const TRACKING_PREFIXES: &[&str] = &["utm_", "pk_", "mtm_", "hsa_", "oly_"];

/// Parameter names that usually select different content.
const MEANINGFUL_PARAMS: &[&str] = &[
    "id", "p", "page", "lang", "language", "hl", "type", "category", "cat", "tag", "q",
    "query", "s", "search", "v", "article", "post", "story", "item", "year", "month", "day",
    "section", "edition", "chapter", "episode", "format", "slug",
];

/// Values at or under this length with low entropy are kept as-is.
const SHORT_VALUE_LEN: usize = 12;
/// Minimum length before a value can be treated as an opaque token.
const TOKEN_MIN_LEN: usize = 16;
/// Bits per character above which a mixed-class value looks random.
const TOKEN_MIN_ENTROPY: f64 = 3.5;

/// Reduces a URL to `scheme://host[:port]/path`.
///
/// The query string and fragment are removed entirely. Input that does not
/// parse as an absolute URL is returned trimmed, cut at the first `?` or `#`.
///
/// ```
/// use refeed::util::normalize_url_for_comparison;
///
/// assert_eq!(
///     normalize_url_for_comparison("https://a.com/x?utm_source=y#top"),
///     "https://a.com/x"
/// );
/// ```
pub fn normalize_url_for_comparison(url: &str) -> String {
    let trimmed = url.trim();
    match Url::parse(trimmed) {
        Ok(parsed) if parsed.host_str().is_some() => {
            format!("{}{}", origin(&parsed), parsed.path())
        }
        _ => trimmed
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .to_string(),
    }
}

/// Whether two article URLs point at the same content.
///
/// Exact string equality first, then a comparison of both URLs with
/// tracking parameters and opaque tokens removed, parameter order sorted,
/// fragment and trailing slash dropped.
///
/// ```
/// use refeed::util::urls_match;
///
/// assert!(urls_match("https://a.com/x?utm_source=y", "https://a.com/x"));
/// assert!(!urls_match("https://a.com/x?id=1", "https://a.com/x?id=2"));
/// ```
pub fn urls_match(a: &str, b: &str) -> bool {
    a == b || canonical_url(a) == canonical_url(b)
}

/// Stable identity of an article from `title | feed_id | publish day`.
///
/// The publish time is truncated to its UTC calendar day and left out
/// entirely when the feed gave no valid date. Returns a hex SHA-256 digest.
pub fn generate_article_unique_id(
    title: &str,
    feed_id: i64,
    published: Option<DateTime<Utc>>,
) -> String {
    let title = title.trim();
    let input = match published {
        Some(dt) => format!("{}|{}|{}", title, feed_id, dt.format("%Y-%m-%d")),
        None => format!("{}|{}", title, feed_id),
    };
    let hash = Sha256::digest(input.as_bytes());
    format!("{:x}", hash)
}

/// Set of already-known article URLs supporting [`urls_match`] lookups in
/// constant time.
#[derive(Debug, Default)]
pub struct KnownUrls {
    exact: HashSet<String>,
    canonical: HashSet<String>,
}

impl KnownUrls {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if `url` matches any URL inserted so far.
    pub fn contains(&self, url: &str) -> bool {
        self.exact.contains(url) || self.canonical.contains(&canonical_url(url))
    }

    /// Record a URL, returns false if a matching one was already known.
    pub fn insert(&mut self, url: &str) -> bool {
        if self.contains(url) {
            return false;
        }
        self.exact.insert(url.to_string());
        self.canonical.insert(canonical_url(url));
        true
    }

    pub fn len(&self) -> usize {
        self.exact.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty()
    }
}

impl<S: AsRef<str>> FromIterator<S> for KnownUrls {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut known = KnownUrls::new();
        for url in iter {
            known.insert(url.as_ref());
        }
        known
    }
}

fn origin(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
    match url.port() {
        Some(port) => format!("{}://{}:{}", url.scheme(), host, port),
        None => format!("{}://{}", url.scheme(), host),
    }
}

/// Comparison form used by [`urls_match`] once exact equality failed.
fn canonical_url(url: &str) -> String {
    let trimmed = url.trim();
    let parsed = match Url::parse(trimmed) {
        Ok(parsed) if parsed.host_str().is_some() => parsed,
        _ => return trimmed.to_string(),
    };

    let path = parsed.path();
    let path = if path.len() > 1 {
        path.trim_end_matches('/')
    } else {
        ""
    };

    let mut params: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(key, value)| keep_param(key, value))
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    params.sort();

    let mut out = format!("{}{}", origin(&parsed), path);
    if !params.is_empty() {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(params)
            .finish();
        out.push('?');
        out.push_str(&query);
    }
    out
}

fn keep_param(key: &str, value: &str) -> bool {
    let key = key.to_ascii_lowercase();

    if TRACKING_PARAMS.contains(&key.as_str())
        || TRACKING_PREFIXES.iter().any(|prefix| key.starts_with(prefix))
    {
        return false;
    }

    if MEANINGFUL_PARAMS.contains(&key.as_str()) || is_id_like(&key) {
        return true;
    }

    if value.chars().count() <= SHORT_VALUE_LEN && shannon_entropy(value) < TOKEN_MIN_ENTROPY {
        return true;
    }

    !looks_like_token(value)
}

fn is_id_like(key: &str) -> bool {
    key.ends_with("_id") || key.ends_with("-id") || (key.ends_with("id") && key.len() <= 10)
}

/// Long value mixing letter case and/or digits with near-random distribution.
fn looks_like_token(value: &str) -> bool {
    if value.chars().count() < TOKEN_MIN_LEN {
        return false;
    }

    let classes = [
        value.chars().any(|c| c.is_ascii_lowercase()),
        value.chars().any(|c| c.is_ascii_uppercase()),
        value.chars().any(|c| c.is_ascii_digit()),
    ]
    .iter()
    .filter(|present| **present)
    .count();

    classes >= 2 && shannon_entropy(value) >= TOKEN_MIN_ENTROPY
}

/// Shannon entropy in bits per character.
fn shannon_entropy(value: &str) -> f64 {
    let total = value.chars().count();
    if total == 0 {
        return 0.0;
    }

    let mut counts: HashMap<char, usize> = HashMap::new();
    for c in value.chars() {
        *counts.entry(c).or_insert(0) += 1;
    }

    counts
        .values()
        .map(|&count| {
            let p = count as f64 / total as f64;
            -p * p.log2()
        })
        .sum()
}
