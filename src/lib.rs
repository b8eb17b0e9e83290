//! Feed refresh orchestration.
//!
//! - [`tasks`] - prioritized refresh queue and bounded worker pool
//! - [`feed`] - download, parse, dedup and persist one feed
//! - [`rules`] - automation rules applied to new articles
//! - [`cache`] - article content and parsed-feed cache
//! - [`refresh`] - request entry points used by the binary and UIs
//! - [`cleanup`] - retention purge run after each refresh batch

pub mod cache;
pub mod cleanup;
pub mod config;
pub mod feed;
pub mod refresh;
pub mod rules;
pub mod storage;
pub mod tasks;
pub mod util;
