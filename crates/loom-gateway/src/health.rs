use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::Utc;
use loom_core::{BreakerState, HealthRecord};
use tokio::sync::RwLock;
use tokio::time::Instant;

const RING_BUFFER_CAPACITY: usize = 100;
const CONSECUTIVE_FAILURE_THRESHOLD: u32 = 5;

/// Per-provider breaker state plus the ring buffers the registry derives
/// `avg_latency`/`p95_latency` from. Transitions follow §4.3: closed→open on
/// five consecutive high-severity failures, open→half_open after
/// `reset_timeout`, half_open→closed on one success or back to open on any
/// failure.
struct ProviderHealth {
    record: HealthRecord,
    breaker: BreakerState,
    opened_at: Option<Instant>,
    latencies_ms: VecDeque<f64>,
    half_open_token_taken: bool,
}

impl ProviderHealth {
    fn new() -> Self {
        Self {
            record: HealthRecord::default(),
            breaker: BreakerState::Closed,
            opened_at: None,
            latencies_ms: VecDeque::with_capacity(RING_BUFFER_CAPACITY),
            half_open_token_taken: false,
        }
    }

    fn push_latency(&mut self, latency_ms: f64) {
        if self.latencies_ms.len() == RING_BUFFER_CAPACITY {
            self.latencies_ms.pop_front();
        }
        self.latencies_ms.push_back(latency_ms);
        self.record.avg_latency_ms =
            self.latencies_ms.iter().sum::<f64>() / self.latencies_ms.len() as f64;
        let mut sorted: Vec<f64> = self.latencies_ms.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let idx = ((sorted.len() as f64 * 0.95).ceil() as usize).saturating_sub(1);
        self.record.p95_latency_ms = sorted.get(idx).copied().unwrap_or(0.0);
    }
}

/// Tracks health and circuit-breaker state for every registered provider.
/// Owned by the `Gateway` (no global singleton, per DESIGN.md).
pub struct HealthRegistry {
    providers: RwLock<HashMap<String, ProviderHealth>>,
    reset_timeout: Duration,
}

impl HealthRegistry {
    pub fn new(reset_timeout: Duration) -> Self {
        Self {
            providers: RwLock::new(HashMap::new()),
            reset_timeout,
        }
    }

    pub async fn register(&self, provider_id: &str) {
        self.providers
            .write()
            .await
            .entry(provider_id.to_string())
            .or_insert_with(ProviderHealth::new);
    }

    pub async fn deregister(&self, provider_id: &str) {
        self.providers.write().await.remove(provider_id);
    }

    pub async fn record_success(&self, provider_id: &str, latency_ms: f64) {
        let mut providers = self.providers.write().await;
        if let Some(health) = providers.get_mut(provider_id) {
            health.record.healthy = true;
            health.record.last_check = Some(Utc::now());
            health.record.last_success = Some(Utc::now());
            health.record.consecutive_failures = 0;
            health.record.last_error_kind = None;
            health.push_latency(latency_ms);
            health.record.rolling_success_rate =
                (health.record.rolling_success_rate * 0.9 + 0.1).min(1.0);

            match health.breaker {
                BreakerState::HalfOpen => {
                    health.breaker = BreakerState::Closed;
                    health.opened_at = None;
                    health.half_open_token_taken = false;
                }
                _ => {}
            }
        }
    }

    pub async fn record_failure(&self, provider_id: &str, severity: loom_core::Severity, error_kind: &str) {
        let mut providers = self.providers.write().await;
        if let Some(health) = providers.get_mut(provider_id) {
            health.record.healthy = false;
            health.record.last_check = Some(Utc::now());
            health.record.consecutive_failures += 1;
            health.record.last_error_kind = Some(error_kind.to_string());
            health.record.rolling_success_rate = (health.record.rolling_success_rate * 0.9).max(0.0);

            match health.breaker {
                BreakerState::HalfOpen => {
                    health.breaker = BreakerState::Open;
                    health.opened_at = Some(Instant::now());
                    health.half_open_token_taken = false;
                }
                BreakerState::Closed
                    if health.record.consecutive_failures >= CONSECUTIVE_FAILURE_THRESHOLD
                        && severity >= loom_core::Severity::High =>
                {
                    health.breaker = BreakerState::Open;
                    health.opened_at = Some(Instant::now());
                }
                _ => {}
            }
        }
    }

    /// Whether `provider_id` may currently receive a dispatch. A half-open
    /// breaker allows exactly one concurrent probe via a single-use token.
    pub async fn is_selectable(&self, provider_id: &str) -> bool {
        let mut providers = self.providers.write().await;
        let Some(health) = providers.get_mut(provider_id) else {
            return false;
        };
        match health.breaker {
            BreakerState::Closed => true,
            BreakerState::Open => {
                if let Some(opened_at) = health.opened_at {
                    if opened_at.elapsed() >= self.reset_timeout {
                        health.breaker = BreakerState::HalfOpen;
                        health.half_open_token_taken = true;
                        return true;
                    }
                }
                false
            }
            BreakerState::HalfOpen => {
                if health.half_open_token_taken {
                    false
                } else {
                    health.half_open_token_taken = true;
                    true
                }
            }
        }
    }

    pub async fn snapshot(&self, provider_id: &str) -> Option<HealthRecord> {
        self.providers
            .read()
            .await
            .get(provider_id)
            .map(|h| h.record.clone())
    }

    pub async fn breaker_state(&self, provider_id: &str) -> Option<BreakerState> {
        self.providers.read().await.get(provider_id).map(|h| h.breaker)
    }

    pub async fn snapshot_all(&self) -> HashMap<String, HealthRecord> {
        self.providers
            .read()
            .await
            .iter()
            .map(|(id, h)| (id.clone(), h.record.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loom_core::Severity;

    #[tokio::test]
    async fn breaker_opens_after_five_consecutive_high_severity_failures() {
        let registry = HealthRegistry::new(Duration::from_secs(60));
        registry.register("a").await;
        for _ in 0..4 {
            registry.record_failure("a", Severity::High, "server_error").await;
        }
        assert_eq!(registry.breaker_state("a").await, Some(BreakerState::Closed));
        registry.record_failure("a", Severity::High, "server_error").await;
        assert_eq!(registry.breaker_state("a").await, Some(BreakerState::Open));
        assert!(!registry.is_selectable("a").await);
    }

    #[tokio::test]
    async fn half_open_allows_single_probe_after_reset_timeout() {
        let registry = HealthRegistry::new(Duration::from_millis(10));
        registry.register("a").await;
        for _ in 0..5 {
            registry.record_failure("a", Severity::High, "server_error").await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(registry.is_selectable("a").await);
        assert!(!registry.is_selectable("a").await);
    }

    #[tokio::test]
    async fn half_open_success_closes_breaker() {
        let registry = HealthRegistry::new(Duration::from_millis(1));
        registry.register("a").await;
        for _ in 0..5 {
            registry.record_failure("a", Severity::High, "server_error").await;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(registry.is_selectable("a").await);
        registry.record_success("a", 12.0).await;
        assert_eq!(registry.breaker_state("a").await, Some(BreakerState::Closed));
    }

    #[tokio::test]
    async fn low_severity_failures_never_open_breaker() {
        let registry = HealthRegistry::new(Duration::from_secs(60));
        registry.register("a").await;
        for _ in 0..10 {
            registry.record_failure("a", Severity::Medium, "timeout").await;
        }
        assert_eq!(registry.breaker_state("a").await, Some(BreakerState::Closed));
    }
}
