use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use reqwest::redirect::Policy;
use thiserror::Error;

/// Response bodies above this size are rejected (10MB)
pub const MAX_FEED_SIZE: usize = 10 * 1024 * 1024;

const MAX_REDIRECTS: usize = 5;

/// Errors produced while obtaining and parsing a feed document.
///
/// Every variant is transient from the orchestrator's point of view: the
/// refresh task retries on its next attempt.
#[derive(Debug, Error)]
pub enum ParseError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// The HTTP client gave up waiting
    #[error("Request timed out")]
    Timeout,
    /// Response body exceeded the size limit
    #[error("Response too large")]
    ResponseTooLarge,
    /// Response was incomplete (received fewer bytes than Content-Length)
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
    /// Body could not be parsed as RSS, Atom or JSON Feed
    #[error("Malformed feed: {0}")]
    Malformed(String),
    /// Proxy URL rejected by the HTTP client
    #[error("Invalid proxy {0}")]
    InvalidProxy(String),
    /// Custom fetch script failed or was rejected
    #[error("Script failed: {0}")]
    Script(String),
}

impl ParseError {
    fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ParseError::Timeout
        } else {
            ParseError::Network(err)
        }
    }
}

/// Feed document reduced to what the refresh pipeline consumes.
#[derive(Debug, Clone, Default)]
pub struct ParsedFeed {
    pub title: String,
    /// Homepage link of the site publishing the feed
    pub link: String,
    pub description: String,
    pub image_url: String,
    pub items: Vec<ParsedItem>,
}

#[derive(Debug, Clone, Default)]
pub struct ParsedItem {
    pub title: String,
    pub link: String,
    /// Full body (`content:encoded`, Atom `content`)
    pub content: String,
    /// Short body (`description`, Atom `summary`)
    pub description: String,
    /// Explicit item image (`media:thumbnail`)
    pub image_url: String,
    pub enclosures: Vec<Enclosure>,
    /// Publish time, falling back to the update time
    pub published: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Enclosure {
    pub url: String,
    /// MIME essence such as `image/jpeg`, empty when the feed omits it
    pub media_type: String,
}

impl Enclosure {
    pub fn is_image(&self) -> bool {
        self.media_type.starts_with("image/")
    }
}

/// Source of parsed feeds by URL.
///
/// Dropping the returned future must abort the request.
#[async_trait]
pub trait FeedParser: Send + Sync {
    async fn parse_url(&self, url: &str, proxy: Option<&str>) -> Result<ParsedFeed, ParseError>;
}

/// [`FeedParser`] over HTTP(S) using `reqwest` and `feed-rs`.
///
/// One client is kept per distinct proxy URL so connection pools survive
/// between refreshes.
pub struct HttpFeedParser {
    client: reqwest::Client,
    user_agent: String,
    proxied: Mutex<HashMap<String, reqwest::Client>>,
    max_body: usize,
}

impl HttpFeedParser {
    /// Create a parser. `proxy` applies to every feed without its own override.
    pub fn new(user_agent: &str, proxy: Option<&str>) -> Result<Self, ParseError> {
        Ok(Self {
            client: build_client(user_agent, proxy)?,
            user_agent: user_agent.to_string(),
            proxied: Mutex::new(HashMap::new()),
            max_body: MAX_FEED_SIZE,
        })
    }

    /// Override the response size limit.
    pub fn with_max_body_size(mut self, limit: usize) -> Self {
        self.max_body = limit;
        self
    }

    fn client_for(&self, proxy: Option<&str>) -> Result<reqwest::Client, ParseError> {
        let Some(proxy) = proxy else {
            return Ok(self.client.clone());
        };

        let mut proxied = self.proxied.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(client) = proxied.get(proxy) {
            return Ok(client.clone());
        }
        let client = build_client(&self.user_agent, Some(proxy))?;
        proxied.insert(proxy.to_string(), client.clone());
        Ok(client)
    }
}

#[async_trait]
impl FeedParser for HttpFeedParser {
    async fn parse_url(&self, url: &str, proxy: Option<&str>) -> Result<ParsedFeed, ParseError> {
        let client = self.client_for(proxy)?;
        let response = client
            .get(url)
            .send()
            .await
            .map_err(ParseError::from_reqwest)?;

        if !response.status().is_success() {
            return Err(ParseError::HttpStatus(response.status().as_u16()));
        }

        let bytes = read_limited_bytes(response, self.max_body).await?;
        parse_feed_bytes(&bytes)
    }
}

fn build_client(user_agent: &str, proxy: Option<&str>) -> Result<reqwest::Client, ParseError> {
    let mut builder = reqwest::Client::builder()
        .user_agent(user_agent)
        .redirect(create_redirect_policy())
        .pool_max_idle_per_host(4)
        .pool_idle_timeout(Duration::from_secs(30))
        .connect_timeout(Duration::from_secs(10));

    if let Some(proxy) = proxy {
        let proxy = reqwest::Proxy::all(proxy)
            .map_err(|e| ParseError::InvalidProxy(format!("{proxy}: {e}")))?;
        builder = builder.proxy(proxy);
    }

    builder.build().map_err(ParseError::Network)
}

fn create_redirect_policy() -> Policy {
    Policy::custom(|attempt| {
        if attempt.previous().len() >= MAX_REDIRECTS {
            return attempt.error("Too many redirects");
        }

        let url = attempt.url();
        if attempt.previous().iter().any(|prev| prev.as_str() == url.as_str()) {
            return attempt.error("Redirect loop detected");
        }

        tracing::debug!(
            to = %url,
            hop = attempt.previous().len() + 1,
            "Following feed redirect"
        );
        attempt.follow()
    })
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, ParseError> {
    let expected_length = response.content_length();

    // Fast path: check Content-Length header
    if let Some(len) = expected_length {
        if len > limit as u64 {
            return Err(ParseError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(ParseError::from_reqwest)?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(ParseError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(ParseError::IncompleteResponse {
                expected,
                received: bytes.len(),
            });
        }
    }

    Ok(bytes)
}

/// Parse an RSS, Atom or JSON Feed document.
pub fn parse_feed_bytes(bytes: &[u8]) -> Result<ParsedFeed, ParseError> {
    let feed = feed_rs::parser::parse(bytes).map_err(|e| ParseError::Malformed(e.to_string()))?;

    Ok(ParsedFeed {
        title: feed.title.map(|t| t.content.trim().to_string()).unwrap_or_default(),
        link: preferred_link(&feed.links),
        description: feed.description.map(|d| d.content).unwrap_or_default(),
        image_url: feed
            .logo
            .or(feed.icon)
            .map(|image| image.uri)
            .unwrap_or_default(),
        items: feed.entries.into_iter().map(convert_entry).collect(),
    })
}

fn convert_entry(entry: feed_rs::model::Entry) -> ParsedItem {
    let mut image_url = String::new();
    let mut enclosures = Vec::new();

    for media in entry.media {
        if image_url.is_empty() {
            if let Some(thumbnail) = media.thumbnails.first() {
                image_url = thumbnail.image.uri.trim().to_string();
            }
        }
        for content in media.content {
            if let Some(url) = content.url {
                enclosures.push(Enclosure {
                    url: url.to_string(),
                    media_type: content
                        .content_type
                        .map(|mime| mime.essence().to_string())
                        .unwrap_or_default(),
                });
            }
        }
    }

    ParsedItem {
        title: entry.title.map(|t| t.content.trim().to_string()).unwrap_or_default(),
        link: preferred_link(&entry.links),
        content: entry.content.and_then(|c| c.body).unwrap_or_default(),
        description: entry.summary.map(|s| s.content).unwrap_or_default(),
        image_url,
        enclosures,
        published: entry.published.or(entry.updated),
    }
}

/// `rel="alternate"` (or unlabelled) link first, so Atom `self` links are
/// never mistaken for the article.
fn preferred_link(links: &[feed_rs::model::Link]) -> String {
    links
        .iter()
        .find(|l| l.rel.as_deref().map_or(true, |rel| rel == "alternate"))
        .or_else(|| links.first())
        .map(|l| l.href.trim().to_string())
        .unwrap_or_default()
}
