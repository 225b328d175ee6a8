use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, warn};
use tokio::sync::Mutex;

/// Tunables for the per-provider HTTP client pool (§5, "HTTP client pool").
#[derive(Debug, Clone)]
pub struct ConnectionPoolConfig {
    pub max_clients_per_host: usize,
    pub max_idle_time: Duration,
    pub connection_timeout: Duration,
    pub request_timeout: Duration,
    pub keep_alive_timeout: Duration,
}

impl Default for ConnectionPoolConfig {
    fn default() -> Self {
        Self {
            max_clients_per_host: 10,
            max_idle_time: Duration::from_secs(300),
            connection_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            keep_alive_timeout: Duration::from_secs(90),
        }
    }
}

struct PooledClient {
    client: reqwest::Client,
    created_at: Instant,
    last_used: Instant,
    use_count: u64,
    health_check_failures: u32,
}

impl PooledClient {
    fn new(client: reqwest::Client) -> Self {
        let now = Instant::now();
        Self {
            client,
            created_at: now,
            last_used: now,
            use_count: 0,
            health_check_failures: 0,
        }
    }

    fn mark_used(&mut self) {
        self.last_used = Instant::now();
        self.use_count += 1;
    }

    fn is_expired(&self, max_idle: Duration) -> bool {
        self.last_used.elapsed() > max_idle
    }

    fn mark_unhealthy(&mut self) -> bool {
        self.health_check_failures += 1;
        self.health_check_failures >= 3
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PoolStats {
    pub clients_created: u64,
    pub clients_reused: u64,
    pub clients_evicted: u64,
}

/// A connection pool owned by whoever assembles the gateway at startup
/// (Design Notes §9: "global singletons → dependency-injected
/// configuration"). Each provider gets its own bounded set of pooled
/// `reqwest::Client`s, built once per host key and reused across requests.
pub struct ConnectionPool {
    pools: Mutex<HashMap<String, Vec<PooledClient>>>,
    config: ConnectionPoolConfig,
    stats: Mutex<PoolStats>,
}

impl ConnectionPool {
    pub fn new(config: ConnectionPoolConfig) -> Self {
        Self {
            pools: Mutex::new(HashMap::new()),
            config,
            stats: Mutex::new(PoolStats::default()),
        }
    }

    /// Fetch a reusable client for `host_key`, or build one via `build` if
    /// none is idle. `build` runs only on a pool miss.
    pub async fn get_client<F>(&self, host_key: &str, build: F) -> reqwest::Client
    where
        F: FnOnce() -> reqwest::Client,
    {
        let mut pools = self.pools.lock().await;
        let bucket = pools.entry(host_key.to_string()).or_default();

        if let Some(mut pooled) = bucket.pop() {
            if !pooled.is_expired(self.config.max_idle_time) {
                pooled.mark_used();
                let client = pooled.client.clone();
                // Only add back to the pool if we haven't exceeded the per-host limit;
                // otherwise the returned client is the caller's only handle to it.
                if bucket.len() < self.config.max_clients_per_host {
                    bucket.push(pooled);
                } else {
                    self.stats.lock().await.clients_evicted += 1;
                }
                self.stats.lock().await.clients_reused += 1;
                return client;
            }
            self.stats.lock().await.clients_evicted += 1;
        }

        let client = build();
        let mut pooled = PooledClient::new(client.clone());
        pooled.mark_used();
        if bucket.len() < self.config.max_clients_per_host {
            bucket.push(pooled);
        }
        self.stats.lock().await.clients_created += 1;
        debug!("created new pooled client for {}", host_key);
        client
    }

    /// Drop expired idle clients across all hosts. Run from a periodic
    /// background sweeper owned by whoever holds the pool.
    pub async fn cleanup_expired(&self) {
        let mut pools = self.pools.lock().await;
        let mut evicted = 0u64;
        for bucket in pools.values_mut() {
            let before = bucket.len();
            bucket.retain(|c| !c.is_expired(self.config.max_idle_time));
            evicted += (before - bucket.len()) as u64;
        }
        pools.retain(|_, bucket| !bucket.is_empty());
        if evicted > 0 {
            self.stats.lock().await.clients_evicted += evicted;
            debug!("connection pool cleanup evicted {} idle clients", evicted);
        }
    }

    pub async fn mark_host_unhealthy(&self, host_key: &str) {
        let mut pools = self.pools.lock().await;
        if let Some(bucket) = pools.get_mut(host_key) {
            bucket.retain_mut(|c| !c.mark_unhealthy());
        }
    }

    pub async fn stats(&self) -> PoolStats {
        *self.stats.lock().await
    }

    pub async fn pool_size(&self, host_key: &str) -> usize {
        self.pools
            .lock()
            .await
            .get(host_key)
            .map(|b| b.len())
            .unwrap_or(0)
    }

    pub fn config(&self) -> &ConnectionPoolConfig {
        &self.config
    }
}

/// Owned background task that periodically sweeps expired idle clients.
/// Matches the cancellation-token/join-handle pattern used for every other
/// long-lived task in the gateway (Design Notes §9).
pub fn spawn_cleanup_task(
    pool: Arc<ConnectionPool>,
    interval: Duration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    pool.cleanup_expired().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        warn!("connection pool cleanup task shutting down");
                        break;
                    }
                }
            }
        }
    })
}

/// Builds the `protocol://host:port` key used to bucket pooled clients.
pub fn host_key(base_url: &url::Url) -> String {
    format!(
        "{}://{}:{}",
        base_url.scheme(),
        base_url.host_str().unwrap_or("unknown"),
        base_url.port_or_known_default().unwrap_or(443)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_client_reuses_pooled_client() {
        let pool = ConnectionPool::new(ConnectionPoolConfig::default());
        let _c1 = pool.get_client("openai", reqwest::Client::new).await;
        let _c2 = pool.get_client("openai", reqwest::Client::new).await;
        let stats = pool.stats().await;
        assert_eq!(stats.clients_created, 1);
        assert_eq!(stats.clients_reused, 1);
    }

    #[tokio::test]
    async fn separate_hosts_get_separate_pools() {
        let pool = ConnectionPool::new(ConnectionPoolConfig::default());
        let _ = pool.get_client("openai", reqwest::Client::new).await;
        let _ = pool.get_client("anthropic", reqwest::Client::new).await;
        assert_eq!(pool.pool_size("openai").await, 1);
        assert_eq!(pool.pool_size("anthropic").await, 1);
    }

    #[tokio::test]
    async fn cleanup_expired_evicts_idle_clients() {
        let mut config = ConnectionPoolConfig::default();
        config.max_idle_time = Duration::from_millis(1);
        let pool = ConnectionPool::new(config);
        let _ = pool.get_client("openai", reqwest::Client::new).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        pool.cleanup_expired().await;
        assert_eq!(pool.pool_size("openai").await, 0);
    }

    #[test]
    fn host_key_formats_scheme_host_port() {
        let url = url::Url::parse("https://api.openai.com/v1/chat/completions").unwrap();
        assert_eq!(host_key(&url), "https://api.openai.com:443");
    }
}
