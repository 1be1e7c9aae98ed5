use std::{collections::HashMap, sync::Arc};

use tokio::{
    sync::Mutex,
    time::{Duration, Instant},
};

pub const DEFAULT_METADATA_TTL: Duration = Duration::from_secs(600);
pub const CACHE_PURGE_INTERVAL: Duration = Duration::from_secs(120);
const MAX_CACHE_ENTRIES: usize = 5_000;

struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
    inserted_at: Instant,
}

/// In-memory key/value store whose entries expire after a per-entry TTL.
///
/// Reads hand out clones, so callers never share state with the cache.
#[derive(Clone)]
pub struct TtlCache<V> {
    entries: Arc<Mutex<HashMap<String, CacheEntry<V>>>>,
    default_ttl: Duration,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            default_ttl,
        }
    }

    pub async fn get(&self, key: &str) -> Option<V> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();

        let expired = match entries.get(key) {
            Some(entry) if entry.expires_at > now => return Some(entry.value.clone()),
            Some(_) => true,
            None => false,
        };

        if expired {
            entries.remove(key);
        }
        None
    }

    pub async fn set(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.into(),
            CacheEntry {
                value,
                expires_at: now + ttl,
                inserted_at: now,
            },
        );
        trim_cache_entries(&mut entries);
    }

    pub async fn set_default(&self, key: impl Into<String>, value: V) {
        self.set(key, value, self.default_ttl).await;
    }

    pub async fn remove(&self, key: &str) -> Option<V> {
        self.entries.lock().await.remove(key).map(|entry| entry.value)
    }

    /// Drops every expired entry and returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

fn trim_cache_entries<V>(entries: &mut HashMap<String, CacheEntry<V>>) {
    if entries.len() <= MAX_CACHE_ENTRIES {
        return;
    }

    let overflow = entries.len() - MAX_CACHE_ENTRIES;
    let mut oldest = entries
        .iter()
        .map(|(key, entry)| (key.clone(), entry.inserted_at))
        .collect::<Vec<_>>();
    oldest.sort_by_key(|(_, inserted_at)| *inserted_at);

    for (key, _) in oldest.into_iter().take(overflow) {
        entries.remove(&key);
    }
}
