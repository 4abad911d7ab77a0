//! Keyed TTL cache
//!
//! An explicit, injectable store for short-lived derived data (the public
//! business page being the main consumer). Multiple service instances each
//! hold their own cache; entries expire independently, so a stale read is
//! bounded by the TTL rather than by process lifetime.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

struct Entry<V> {
    value: V,
    inserted_at: Instant,
}

/// Clone-able handle to a shared TTL cache
#[derive(Clone)]
pub struct TtlCache<K, V> {
    entries: Arc<RwLock<HashMap<K, Entry<V>>>>,
    ttl: Duration,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }

    /// Fetch a value if present and still fresh; expired entries are evicted
    /// on the next write rather than here, keeping the read path lock-light.
    pub async fn get(&self, key: &K) -> Option<V> {
        let entries = self.entries.read().await;
        let entry = entries.get(key)?;
        if entry.inserted_at.elapsed() > self.ttl {
            return None;
        }
        Some(entry.value.clone())
    }

    pub async fn insert(&self, key: K, value: V) {
        let mut entries = self.entries.write().await;
        entries.retain(|_, e| e.inserted_at.elapsed() <= self.ttl);
        entries.insert(
            key,
            Entry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Drop a key eagerly, e.g. after the underlying record changes
    pub async fn invalidate(&self, key: &K) {
        self.entries.write().await.remove(key);
    }
}
