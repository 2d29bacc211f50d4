// Persistent state store. Redis is the authoritative KV with TTL enforcement;
// an in-process map stands in when Redis is unreachable. The downgrade is
// transparent to callers and logged exactly once per transition.

use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::types::ConversationId;

/// Bounded ping deadline used while constructing the Redis store.
pub const PING_TIMEOUT: Duration = Duration::from_secs(2);

/// Conversations live this long after their last mutation.
pub const CONVERSATION_TTL: Duration = Duration::from_secs(60 * 60);

pub const CONVERSATION_KEY_PREFIX: &str = "conversation:";

/// Keyed KV operations every backing store implements.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn put(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Option<String>>;
    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> Result<bool>;
    async fn exists(&self, key: &str) -> Result<bool>;
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;
    /// Remaining TTL, or None for missing keys and keys without expiry.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>>;
    async fn zadd(&self, set: &str, member: &str, score: f64) -> Result<()>;
    /// Members ordered by ascending score.
    async fn zrange(&self, set: &str) -> Result<Vec<String>>;
    async fn zrem(&self, set: &str, member: &str) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Redis implementation
// ---------------------------------------------------------------------------

/// Redis-backed store. All TTLs are enforced server-side.
pub struct RedisStateStore {
    manager: ConnectionManager,
}

impl RedisStateStore {
    /// Connect and verify the server answers a PING within the bounded timeout.
    pub async fn connect(host: &str, port: u16) -> Result<Self> {
        let client = redis::Client::open(format!("redis://{host}:{port}"))
            .context("invalid KV connection parameters")?;
        let mut manager = tokio::time::timeout(PING_TIMEOUT, ConnectionManager::new(client))
            .await
            .context("KV connection timed out")?
            .context("KV connection failed")?;
        let pong: String = tokio::time::timeout(
            PING_TIMEOUT,
            redis::cmd("PING").query_async(&mut manager),
        )
        .await
        .context("KV ping timed out")?
        .context("KV ping failed")?;
        anyhow::ensure!(pong == "PONG", "unexpected KV ping reply: {pong}");
        Ok(Self { manager })
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

#[async_trait]
impl StateStore for RedisStateStore {
    async fn put(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn();
        match ttl {
            Some(ttl) => {
                let secs = ttl.as_secs().max(1);
                conn.set_ex::<_, _, ()>(key, value, secs).await?;
            }
            None => conn.set::<_, _, ()>(key, value).await?,
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn();
        Ok(conn.get(key).await?)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn();
        let removed: u64 = conn.del(key).await?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn();
        Ok(conn.exists(key).await?)
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut conn = self.conn();
        let mut keys: Vec<String> = conn.keys(format!("{prefix}*")).await?;
        keys.sort();
        Ok(keys)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let mut conn = self.conn();
        let ttl: i64 = conn.ttl(key).await?;
        // -2 = missing key, -1 = no expiry.
        Ok((ttl >= 0).then(|| Duration::from_secs(ttl as u64)))
    }

    async fn zadd(&self, set: &str, member: &str, score: f64) -> Result<()> {
        let mut conn = self.conn();
        conn.zadd::<_, _, _, ()>(set, member, score).await?;
        Ok(())
    }

    async fn zrange(&self, set: &str) -> Result<Vec<String>> {
        let mut conn = self.conn();
        Ok(conn.zrange(set, 0, -1).await?)
    }

    async fn zrem(&self, set: &str, member: &str) -> Result<()> {
        let mut conn = self.conn();
        conn.zrem::<_, _, ()>(set, member).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // ConnectionManager has no explicit shutdown; dropping closes sockets.
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-process fallback
// ---------------------------------------------------------------------------

struct MemoryEntry {
    value: String,
    expires_at: Option<Instant>,
}

/// In-process fallback store. Keys are removed only by explicit delete; the
/// recorded deadline exists solely to answer `ttl`.
#[derive(Default)]
pub struct MemoryStateStore {
    entries: DashMap<String, MemoryEntry>,
    sorted_sets: Mutex<HashMap<String, Vec<(f64, String)>>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn put(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()> {
        self.entries.insert(
            key.to_string(),
            MemoryEntry {
                value,
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.get(key).map(|e| e.value.clone()))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.entries.remove(key).is_some())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.entries.contains_key(key))
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        Ok(self.entries.get(key).and_then(|e| {
            e.expires_at
                .map(|at| at.saturating_duration_since(Instant::now()))
        }))
    }

    async fn zadd(&self, set: &str, member: &str, score: f64) -> Result<()> {
        let mut sets = self.sorted_sets.lock();
        let entries = sets.entry(set.to_string()).or_default();
        entries.retain(|(_, m)| m != member);
        entries.push((score, member.to_string()));
        entries.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        Ok(())
    }

    async fn zrange(&self, set: &str) -> Result<Vec<String>> {
        let sets = self.sorted_sets.lock();
        Ok(sets
            .get(set)
            .map(|entries| entries.iter().map(|(_, m)| m.clone()).collect())
            .unwrap_or_default())
    }

    async fn zrem(&self, set: &str, member: &str) -> Result<()> {
        let mut sets = self.sorted_sets.lock();
        if let Some(entries) = sets.get_mut(set) {
            entries.retain(|(_, m)| m != member);
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Downgrading wrapper
// ---------------------------------------------------------------------------

/// Store that prefers Redis and falls back to the in-process map after the
/// first failed operation. The downgrade is sticky for the process lifetime.
pub struct FallbackStore {
    primary: Option<RedisStateStore>,
    fallback: MemoryStateStore,
    degraded: AtomicBool,
}

impl FallbackStore {
    /// Try Redis first; start degraded when it is unreachable.
    pub async fn connect(host: &str, port: u16) -> Arc<Self> {
        match RedisStateStore::connect(host, port).await {
            Ok(primary) => {
                info!("state store connected to KV at {host}:{port}");
                Arc::new(Self {
                    primary: Some(primary),
                    fallback: MemoryStateStore::new(),
                    degraded: AtomicBool::new(false),
                })
            }
            Err(e) => {
                warn!("KV unreachable, using in-process state store: {e:#}");
                Arc::new(Self {
                    primary: None,
                    fallback: MemoryStateStore::new(),
                    degraded: AtomicBool::new(true),
                })
            }
        }
    }

    /// Purely in-process store, used by tests and minimal deployments.
    pub fn in_memory() -> Arc<Self> {
        Arc::new(Self {
            primary: None,
            fallback: MemoryStateStore::new(),
            degraded: AtomicBool::new(true),
        })
    }

    pub fn mode(&self) -> &'static str {
        if self.degraded.load(Ordering::Relaxed) {
            "memory"
        } else {
            "redis"
        }
    }

    fn mark_degraded(&self, error: &anyhow::Error) {
        if self
            .degraded
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            warn!("KV operation failed, downgrading to in-process state store: {error:#}");
        }
    }

    async fn dispatch<'a, T, F, Fut, G, GFut>(&'a self, primary_op: F, fallback_op: G) -> Result<T>
    where
        F: FnOnce(&'a RedisStateStore) -> Fut,
        Fut: std::future::Future<Output = Result<T>> + 'a,
        G: FnOnce(&'a MemoryStateStore) -> GFut,
        GFut: std::future::Future<Output = Result<T>> + 'a,
    {
        if !self.degraded.load(Ordering::Relaxed) {
            if let Some(primary) = &self.primary {
                match primary_op(primary).await {
                    Ok(value) => return Ok(value),
                    Err(e) => self.mark_degraded(&e),
                }
            }
        }
        fallback_op(&self.fallback).await
    }
}

#[async_trait]
impl StateStore for FallbackStore {
    async fn put(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()> {
        let cloned = value.clone();
        self.dispatch(
            move |p| p.put(key, cloned, ttl),
            move |f| f.put(key, value, ttl),
        )
        .await
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.dispatch(|p| p.get(key), |f| f.get(key)).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.dispatch(|p| p.delete(key), |f| f.delete(key)).await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.dispatch(|p| p.exists(key), |f| f.exists(key)).await
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        self.dispatch(|p| p.keys_with_prefix(prefix), |f| f.keys_with_prefix(prefix))
            .await
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        self.dispatch(|p| p.ttl(key), |f| f.ttl(key)).await
    }

    async fn zadd(&self, set: &str, member: &str, score: f64) -> Result<()> {
        self.dispatch(|p| p.zadd(set, member, score), |f| f.zadd(set, member, score))
            .await
    }

    async fn zrange(&self, set: &str) -> Result<Vec<String>> {
        self.dispatch(|p| p.zrange(set), |f| f.zrange(set)).await
    }

    async fn zrem(&self, set: &str, member: &str) -> Result<()> {
        self.dispatch(|p| p.zrem(set, member), |f| f.zrem(set, member))
            .await
    }

    async fn close(&self) -> Result<()> {
        if let Some(primary) = &self.primary {
            primary.close().await?;
        }
        self.fallback.close().await
    }
}

/// Key for one conversation's persisted state.
pub fn conversation_key(id: &ConversationId) -> String {
    format!("{CONVERSATION_KEY_PREFIX}{id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_put_get_delete() -> Result<()> {
        let store = MemoryStateStore::new();
        store.put("k", "v".to_string(), None).await?;
        assert_eq!(store.get("k").await?, Some("v".to_string()));
        assert!(store.exists("k").await?);
        assert!(store.delete("k").await?);
        assert!(!store.delete("k").await?);
        assert_eq!(store.get("k").await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_memory_keeps_expired_keys_until_deleted() -> Result<()> {
        let store = MemoryStateStore::new();
        store
            .put("k", "v".to_string(), Some(Duration::from_millis(1)))
            .await?;
        tokio::time::sleep(Duration::from_millis(10)).await;
        // No background expiry in the fallback store.
        assert!(store.exists("k").await?);
        assert_eq!(store.ttl("k").await?, Some(Duration::ZERO));
        Ok(())
    }

    #[tokio::test]
    async fn test_memory_prefix_scan_is_sorted() -> Result<()> {
        let store = MemoryStateStore::new();
        store.put("conversation:b", "1".into(), None).await?;
        store.put("conversation:a", "2".into(), None).await?;
        store.put("metrics:query:x", "3".into(), None).await?;
        let keys = store.keys_with_prefix("conversation:").await?;
        assert_eq!(keys, vec!["conversation:a", "conversation:b"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_memory_sorted_set_orders_by_score() -> Result<()> {
        let store = MemoryStateStore::new();
        store.zadd("pending", "late", 200.0).await?;
        store.zadd("pending", "early", 100.0).await?;
        assert_eq!(store.zrange("pending").await?, vec!["early", "late"]);

        // Re-adding a member updates its score instead of duplicating.
        store.zadd("pending", "late", 50.0).await?;
        assert_eq!(store.zrange("pending").await?, vec!["late", "early"]);

        store.zrem("pending", "early").await?;
        assert_eq!(store.zrange("pending").await?, vec!["late"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_fallback_store_in_memory_mode() -> Result<()> {
        let store = FallbackStore::in_memory();
        assert_eq!(store.mode(), "memory");
        store.put("k", "v".to_string(), None).await?;
        assert_eq!(store.get("k").await?, Some("v".to_string()));
        Ok(())
    }

    #[test]
    fn test_conversation_key_shape() {
        let id = ConversationId::new();
        let key = conversation_key(&id);
        assert!(key.starts_with("conversation:"));
        assert!(key.len() > "conversation:".len());
    }
}
