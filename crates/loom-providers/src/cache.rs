use std::num::NonZeroUsize;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use loom_core::{Request, Response};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub memory_cache_size: usize,
    pub ttl: Duration,
    pub enable_disk_cache: bool,
    pub disk_cache_dir: Option<String>,
    pub enable_compression: bool,
    pub max_entry_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_cache_size: 1000,
            ttl: Duration::from_secs(3600),
            enable_disk_cache: true,
            disk_cache_dir: None,
            enable_compression: true,
            max_entry_size: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry {
    response: Response,
    created_at: u64,
    ttl_seconds: u64,
}

impl CacheEntry {
    fn new(response: Response, ttl: Duration) -> Self {
        Self {
            response,
            created_at: now_secs(),
            ttl_seconds: ttl.as_secs(),
        }
    }

    fn is_expired(&self) -> bool {
        now_secs().saturating_sub(self.created_at) > self.ttl_seconds
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// A composite cache key built from the provider/model and the request's
/// canonicalized (sort-then-hash) prompt and params, so that param
/// insertion order never produces a spurious cache miss.
#[derive(Debug, Clone)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn generate(provider: &str, model: &str, request: &Request) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(provider.as_bytes());
        hasher.update(b":");
        hasher.update(model.as_bytes());
        hasher.update(b":");
        hasher.update(request.prompt.as_bytes());
        hasher.update(b":");
        hasher.update(request.canonical_params().as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub memory_hits: u64,
    pub memory_misses: u64,
    pub disk_hits: u64,
    pub disk_misses: u64,
    pub inserts: u64,
    pub evictions: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let hits = self.memory_hits + self.disk_hits;
        let total = hits + self.memory_misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

/// Two-tier response cache: an in-memory LRU backed by an embedded `sled`
/// KV store for entries that survive process restarts. Cache hits are never
/// charged against a budget (§4.4).
pub struct ResponseCache {
    config: CacheConfig,
    memory: RwLock<LruCache<String, CacheEntry>>,
    disk: Option<sled::Db>,
    stats: StdMutex<CacheStats>,
}

impl ResponseCache {
    pub fn new(config: CacheConfig) -> anyhow::Result<Self> {
        let size = NonZeroUsize::new(config.memory_cache_size.max(1)).unwrap();
        let disk = if config.enable_disk_cache {
            let dir = config.disk_cache_dir.as_deref().unwrap_or("loom_cache");
            Some(sled::open(dir)?)
        } else {
            None
        };
        Ok(Self {
            config,
            memory: RwLock::new(LruCache::new(size)),
            disk,
            stats: StdMutex::new(CacheStats::default()),
        })
    }

    pub async fn get(&self, key: &CacheKey) -> Option<Response> {
        {
            let mut memory = self.memory.write().await;
            if let Some(entry) = memory.peek(key.as_str()) {
                if !entry.is_expired() {
                    let response = memory.get_mut(key.as_str()).unwrap().response.clone();
                    self.with_stats(|s| s.memory_hits += 1);
                    return Some(response);
                }
                memory.pop(key.as_str());
                self.with_stats(|s| s.evictions += 1);
            }
        }
        self.with_stats(|s| s.memory_misses += 1);

        if let Some(disk) = &self.disk {
            if let Ok(Some(raw)) = disk.get(key.as_str()) {
                let decompressed = if self.config.enable_compression {
                    lz4_flex::decompress_size_prepended(&raw).ok()
                } else {
                    Some(raw.to_vec())
                };
                if let Some(bytes) = decompressed {
                    if let Ok(entry) = serde_json::from_slice::<CacheEntry>(&bytes) {
                        if !entry.is_expired() {
                            self.with_stats(|s| s.disk_hits += 1);
                            let mut memory = self.memory.write().await;
                            memory.put(key.as_str().to_string(), entry.clone());
                            return Some(entry.response);
                        }
                        let _ = disk.remove(key.as_str());
                    }
                }
            }
        }
        self.with_stats(|s| s.disk_misses += 1);
        None
    }

    pub async fn insert(&self, key: &CacheKey, response: &Response) -> anyhow::Result<()> {
        if response.meta.degraded {
            return Ok(());
        }
        let entry = CacheEntry::new(response.clone(), self.config.ttl);
        let encoded = serde_json::to_vec(&entry)?;
        if encoded.len() > self.config.max_entry_size {
            return Ok(());
        }

        {
            let mut memory = self.memory.write().await;
            memory.put(key.as_str().to_string(), entry.clone());
        }

        if let Some(disk) = &self.disk {
            let payload = if self.config.enable_compression {
                lz4_flex::compress_prepend_size(&encoded)
            } else {
                encoded
            };
            disk.insert(key.as_str(), payload)?;
        }

        self.with_stats(|s| s.inserts += 1);
        Ok(())
    }

    pub async fn cleanup_expired(&self) -> anyhow::Result<()> {
        let mut evicted = 0u64;
        {
            let mut memory = self.memory.write().await;
            let expired: Vec<String> = memory
                .iter()
                .filter(|(_, e)| e.is_expired())
                .map(|(k, _)| k.clone())
                .collect();
            for k in expired {
                memory.pop(&k);
                evicted += 1;
            }
        }
        if let Some(disk) = &self.disk {
            let mut expired_keys = Vec::new();
            for item in disk.iter().flatten() {
                let (k, v) = item;
                if let Ok(entry) = serde_json::from_slice::<CacheEntry>(&v) {
                    if entry.is_expired() {
                        expired_keys.push(k);
                    }
                }
            }
            for k in expired_keys {
                disk.remove(k)?;
                evicted += 1;
            }
        }
        self.with_stats(|s| s.evictions += evicted);
        Ok(())
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.lock().unwrap().clone()
    }

    fn with_stats<F: FnOnce(&mut CacheStats)>(&self, f: F) {
        f(&mut self.stats.lock().unwrap());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loom_core::{ResponseMeta, Usage};
    use uuid::Uuid;

    fn sample_response() -> Response {
        Response {
            content: "hello world".to_string(),
            model: "gpt-4".to_string(),
            usage: Usage::new(3, 2),
            meta: ResponseMeta {
                provider: "openai".to_string(),
                request_id: Uuid::new_v4(),
                finish_reason: Some("stop".to_string()),
                degraded: false,
                thinking_enabled: None,
            },
        }
    }

    fn cache_with_tempdir() -> (tempfile::TempDir, ResponseCache) {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig {
            disk_cache_dir: Some(dir.path().to_string_lossy().to_string()),
            ..CacheConfig::default()
        };
        let cache = ResponseCache::new(config).unwrap();
        (dir, cache)
    }

    #[tokio::test]
    async fn memory_hit_after_insert() {
        let (_dir, cache) = cache_with_tempdir();
        let request = Request::new("hi");
        let key = CacheKey::generate("openai", "gpt-4", &request);
        cache.insert(&key, &sample_response()).await.unwrap();
        let hit = cache.get(&key).await;
        assert!(hit.is_some());
        assert_eq!(cache.stats().memory_hits, 1);
    }

    #[tokio::test]
    async fn cache_key_ignores_param_insertion_order() {
        let mut a = Request::new("hi");
        a.params.insert("temperature".into(), serde_json::json!(0.5));
        a.params.insert("top_p".into(), serde_json::json!(1));

        let mut b = Request::new("hi");
        b.params.insert("top_p".into(), serde_json::json!(1));
        b.params.insert("temperature".into(), serde_json::json!(0.5));

        let key_a = CacheKey::generate("openai", "gpt-4", &a);
        let key_b = CacheKey::generate("openai", "gpt-4", &b);
        assert_eq!(key_a.as_str(), key_b.as_str());
    }

    #[tokio::test]
    async fn degraded_responses_are_never_cached() {
        let (_dir, cache) = cache_with_tempdir();
        let request = Request::new("hi");
        let key = CacheKey::generate("openai", "gpt-4", &request);
        let degraded = Response::degraded(Uuid::new_v4(), "circuit open");
        cache.insert(&key, &degraded).await.unwrap();
        assert!(cache.get(&key).await.is_none());
    }

    #[tokio::test]
    async fn cleanup_expired_removes_stale_entries() {
        let (_dir, cache) = {
            let dir = tempfile::tempdir().unwrap();
            let config = CacheConfig {
                disk_cache_dir: Some(dir.path().to_string_lossy().to_string()),
                ttl: Duration::from_millis(1),
                ..CacheConfig::default()
            };
            (dir, ResponseCache::new(config).unwrap())
        };
        let request = Request::new("hi");
        let key = CacheKey::generate("openai", "gpt-4", &request);
        cache.insert(&key, &sample_response()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        cache.cleanup_expired().await.unwrap();
        assert!(cache.get(&key).await.is_none());
    }
}
