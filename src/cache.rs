//! In-memory content cache.
//!
//! Holds two independent maps, one from article ID to HTML content and one
//! from feed ID to the last parsed feed. Entries expire after a fixed TTL and
//! each map holds at most `capacity` entries. When a map is full, the entry
//! with the oldest set-time is evicted. Reads never extend an entry's life.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use lru::LruCache;

use crate::feed::ParsedFeed;

/// Default number of entries per map
pub const DEFAULT_CACHE_CAPACITY: usize = 500;
/// Default entry lifetime (30 minutes)
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(30 * 60);

#[derive(Debug)]
struct Entry<T> {
    value: T,
    expires_at: Instant,
}

impl<T> Entry<T> {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

struct Maps {
    content: LruCache<i64, Entry<Arc<str>>>,
    feeds: LruCache<i64, Entry<Arc<ParsedFeed>>>,
}

/// Shared cache of article bodies and parsed feeds.
///
/// Cheap to share behind an `Arc`. All operations take a short internal lock
/// and never block on I/O.
pub struct ContentCache {
    maps: Mutex<Maps>,
    ttl: Duration,
}

impl ContentCache {
    /// Create a cache holding at most `capacity` entries per map.
    ///
    /// A capacity of zero is treated as one.
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            maps: Mutex::new(Maps {
                content: LruCache::new(capacity),
                feeds: LruCache::new(capacity),
            }),
            ttl,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Maps> {
        self.maps.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Cached content for an article, `None` on miss or expiry.
    pub fn get(&self, article_id: i64) -> Option<Arc<str>> {
        let mut maps = self.lock();
        lookup(&mut maps.content, article_id)
    }

    /// Store content for an article, evicting the oldest entry when full.
    pub fn set(&self, article_id: i64, content: Arc<str>) {
        let expires_at = Instant::now() + self.ttl;
        let mut maps = self.lock();
        maps.content.push(
            article_id,
            Entry {
                value: content,
                expires_at,
            },
        );
    }

    /// Last parsed feed, `None` on miss or expiry.
    pub fn get_feed(&self, feed_id: i64) -> Option<Arc<ParsedFeed>> {
        let mut maps = self.lock();
        lookup(&mut maps.feeds, feed_id)
    }

    pub fn set_feed(&self, feed_id: i64, feed: Arc<ParsedFeed>) {
        let expires_at = Instant::now() + self.ttl;
        let mut maps = self.lock();
        maps.feeds.push(
            feed_id,
            Entry {
                value: feed,
                expires_at,
            },
        );
    }

    /// Drop every entry from both maps.
    pub fn clear(&self) {
        let mut maps = self.lock();
        maps.content.clear();
        maps.feeds.clear();
    }

    /// Combined entry count of both maps, expired entries included until
    /// they are next read.
    pub fn size(&self) -> usize {
        let maps = self.lock();
        maps.content.len() + maps.feeds.len()
    }
}

impl Default for ContentCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY, DEFAULT_CACHE_TTL)
    }
}

impl std::fmt::Debug for ContentCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentCache")
            .field("size", &self.size())
            .field("ttl", &self.ttl)
            .finish()
    }
}

/// `peek` keeps insertion order intact, so eviction stays oldest-by-set-time.
fn lookup<T: Clone>(map: &mut LruCache<i64, Entry<T>>, key: i64) -> Option<T> {
    let expired = match map.peek(&key) {
        None => return None,
        Some(entry) => entry.is_expired(Instant::now()),
    };
    if expired {
        map.pop(&key);
        return None;
    }
    map.peek(&key).map(|entry| entry.value.clone())
}
