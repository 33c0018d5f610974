//! Response caching for single-sample judges.
//!
//! Identical prompt views sent to the same backend get the same answer
//! without another paid call. Multi-sample judges never use the cache so
//! their samples stay independent.

use moka::future::Cache;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use labelwise_core::{CacheSettings, JudgeResponse, PromptView};

/// Cache key: backend instance plus a hash of the rendered view content.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ResponseKey {
    backend: String,
    view_hash: u64,
}

impl ResponseKey {
    pub fn new(backend: &str, view: &PromptView) -> Self {
        let mut hasher = DefaultHasher::new();
        view.cache_key().hash(&mut hasher);
        Self {
            backend: backend.to_string(),
            view_hash: hasher.finish(),
        }
    }
}

/// Judge response cache using moka.
pub struct ResponseCache {
    cache: Cache<ResponseKey, JudgeResponse>,
}

impl ResponseCache {
    pub fn new(max_entries: u64, ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_entries)
            .time_to_live(ttl)
            .build();

        Self { cache }
    }

    pub fn from_settings(settings: &CacheSettings) -> Self {
        Self::new(settings.max_entries, settings.ttl)
    }

    pub async fn get(&self, key: &ResponseKey) -> Option<JudgeResponse> {
        self.cache.get(key).await
    }

    pub async fn insert(&self, key: ResponseKey, response: JudgeResponse) {
        self.cache.insert(key, response).await;
    }

    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::from_settings(&CacheSettings::default())
    }
}
