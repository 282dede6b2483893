use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sqlx::{Pool, Row, Sqlite};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::info;

use crate::{expiry_for_ttl, Result, SubscriptionRegistry};

/// SQLite-backed subscription registry with a read-through cache grouped by
/// topic. The backing store is the source of truth; the cache is rebuilt by
/// a full scan on [`SqliteSubscriptionRegistry::create`] and kept in sync by
/// every mutation. Reads never touch storage; mutations take a per-topic
/// lock so two concurrent writers for the same topic never race on the
/// cache/store pair.
pub struct SqliteSubscriptionRegistry {
    pool: Pool<Sqlite>,
    // topic -> subscriber_uri -> expires
    cache: DashMap<String, DashMap<String, DateTime<Utc>>>,
    topic_locks: DashMap<String, Arc<AsyncMutex<()>>>,
}

impl SqliteSubscriptionRegistry {
    pub async fn create(pool: Pool<Sqlite>) -> Result<Arc<Self>> {
        create_schema(&pool).await?;
        let registry = Arc::new(Self {
            pool,
            cache: DashMap::new(),
            topic_locks: DashMap::new(),
        });
        registry.reload_cache().await?;
        info!("subscription registry cache loaded from storage");
        Ok(registry)
    }

    async fn reload_cache(&self) -> Result<()> {
        let rows = sqlx::query("SELECT topic, subscriber, expires FROM subscriptions")
            .fetch_all(&self.pool)
            .await?;
        for row in rows {
            let topic: String = row.get("topic");
            let subscriber: String = row.get("subscriber");
            let expires_millis: i64 = row.get("expires");
            let expires = millis_to_datetime(expires_millis);
            self.cache.entry(topic).or_default().insert(subscriber, expires);
        }
        Ok(())
    }

    async fn lock_for(&self, topic: &str) -> Arc<AsyncMutex<()>> {
        self.topic_locks.entry(topic.to_string()).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }
}

#[async_trait]
impl SubscriptionRegistry for SqliteSubscriptionRegistry {
    async fn add_subscription(&self, topic: &str, subscriber_uri: &str, ttl: Option<Duration>) -> Result<()> {
        let expires = expiry_for_ttl(ttl);
        let lock = self.lock_for(topic).await;
        let _guard = lock.lock().await;

        sqlx::query(
            "INSERT INTO subscriptions (topic, subscriber, expires) VALUES (?, ?, ?) \
             ON CONFLICT(topic, subscriber) DO UPDATE SET expires = excluded.expires",
        )
        .bind(topic)
        .bind(subscriber_uri)
        .bind(datetime_to_millis(expires))
        .execute(&self.pool)
        .await?;

        self.cache
            .entry(topic.to_string())
            .or_default()
            .insert(subscriber_uri.to_string(), expires);
        Ok(())
    }

    async fn remove_subscription(&self, topic: &str, subscriber_uri: &str) -> Result<()> {
        let lock = self.lock_for(topic).await;
        let _guard = lock.lock().await;

        sqlx::query("DELETE FROM subscriptions WHERE topic = ? AND subscriber = ?")
            .bind(topic)
            .bind(subscriber_uri)
            .execute(&self.pool)
            .await?;

        if let Some(topic_cache) = self.cache.get(topic) {
            topic_cache.remove(subscriber_uri);
        }
        Ok(())
    }

    async fn get_subscribers(&self, topic: &str) -> Result<Vec<String>> {
        let now = Utc::now();
        let Some(topic_cache) = self.cache.get(topic) else {
            return Ok(Vec::new());
        };
        Ok(topic_cache
            .iter()
            .filter(|entry| *entry.value() > now)
            .map(|entry| entry.key().clone())
            .collect())
    }
}

fn datetime_to_millis(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(millis).unwrap_or_else(crate::far_future)
}

async fn create_schema(pool: &Pool<Sqlite>) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS subscriptions (
            topic TEXT NOT NULL,
            subscriber TEXT NOT NULL,
            expires INTEGER NOT NULL,
            PRIMARY KEY (topic, subscriber)
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_pool() -> Pool<Sqlite> {
        SqlitePoolOptions::new().connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn add_then_get_returns_subscriber() {
        let registry = SqliteSubscriptionRegistry::create(test_pool().await).await.unwrap();
        registry.add_subscription("orders", "http://a/", None).await.unwrap();
        let subs = registry.get_subscribers("orders").await.unwrap();
        assert_eq!(subs, vec!["http://a/".to_string()]);
    }

    #[tokio::test]
    async fn re_add_refreshes_expiry_without_duplicating() {
        let registry = SqliteSubscriptionRegistry::create(test_pool().await).await.unwrap();
        registry.add_subscription("orders", "http://a/", Some(Duration::from_secs(1))).await.unwrap();
        registry.add_subscription("orders", "http://a/", Some(Duration::from_secs(100))).await.unwrap();
        let subs = registry.get_subscribers("orders").await.unwrap();
        assert_eq!(subs.len(), 1);

        let count: i64 = sqlx::query("SELECT COUNT(*) as c FROM subscriptions")
            .fetch_one(&registry.pool)
            .await
            .unwrap()
            .get("c");
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn expired_subscription_is_excluded_from_reads() {
        let registry = SqliteSubscriptionRegistry::create(test_pool().await).await.unwrap();
        registry.add_subscription("orders", "http://a/", Some(Duration::from_millis(1))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let subs = registry.get_subscribers("orders").await.unwrap();
        assert!(subs.is_empty());
    }

    #[tokio::test]
    async fn remove_drops_subscriber() {
        let registry = SqliteSubscriptionRegistry::create(test_pool().await).await.unwrap();
        registry.add_subscription("orders", "http://a/", None).await.unwrap();
        registry.remove_subscription("orders", "http://a/").await.unwrap();
        assert!(registry.get_subscribers("orders").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cache_is_rebuilt_from_storage_on_restart() {
        let pool = test_pool().await;
        {
            let registry = SqliteSubscriptionRegistry::create(pool.clone()).await.unwrap();
            registry.add_subscription("orders", "http://a/", None).await.unwrap();
        }
        let registry2 = SqliteSubscriptionRegistry::create(pool).await.unwrap();
        let subs = registry2.get_subscribers("orders").await.unwrap();
        assert_eq!(subs, vec!["http://a/".to_string()]);
    }

    #[tokio::test]
    async fn unknown_topic_returns_empty() {
        let registry = SqliteSubscriptionRegistry::create(test_pool().await).await.unwrap();
        assert!(registry.get_subscribers("nobody-subscribed").await.unwrap().is_empty());
    }
}
