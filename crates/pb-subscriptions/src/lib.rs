//! Durable subscription registry (spec.md §4.2): a `(topic, subscriber)` set
//! with TTL expiry, queried on every publish.

pub mod error;
pub mod sqlite;

pub use error::{Result, SubscriptionError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// A durable record that `subscriber_uri` wishes to receive publications on
/// `topic` until `expires`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub topic: String,
    pub subscriber_uri: String,
    pub expires: DateTime<Utc>,
}

/// Stand-in for "never expires": far enough in the future that no TTL
/// arithmetic will reach it, but still a concrete, comparable instant.
pub fn far_future() -> DateTime<Utc> {
    DateTime::<Utc>::MAX_UTC
}

pub fn expiry_for_ttl(ttl: Option<Duration>) -> DateTime<Utc> {
    match ttl {
        Some(ttl) if !ttl.is_zero() => Utc::now() + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero()),
        _ => far_future(),
    }
}

/// Durable `(topic, subscriber)` set, keyed by `(topic, subscriber_uri)`.
///
/// `add_subscription` upserts the expiry; `get_subscribers` returns only
/// subscribers whose most recent add has not expired and have not since been
/// removed (spec.md §8 invariant 9). Expired rows may remain in storage and
/// are filtered only on read — no sweeper is required (spec.md §9 open
/// question (a)).
#[async_trait]
pub trait SubscriptionRegistry: Send + Sync {
    async fn add_subscription(&self, topic: &str, subscriber_uri: &str, ttl: Option<Duration>) -> Result<()>;

    async fn remove_subscription(&self, topic: &str, subscriber_uri: &str) -> Result<()>;

    /// Lock-free on the read path: served from the in-memory cache, never
    /// the backing store.
    async fn get_subscribers(&self, topic: &str) -> Result<Vec<String>>;
}
