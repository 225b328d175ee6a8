use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use loom_core::{Alert, Metric, MetricKind};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, Default)]
pub struct MetricStoreStats {
    pub total_metrics: usize,
    pub total_alerts: usize,
}

struct Inner {
    metrics: VecDeque<Metric>,
    by_kind: HashMap<MetricKind, Vec<usize>>,
    by_name: HashMap<String, Vec<usize>>,
    alerts: VecDeque<Alert>,
}

/// Bounded, time-indexed store of `Metric` values (§4.5). A single lock
/// guards mutation and index rebuild after eviction; queries copy results
/// out of the lock before returning.
pub struct MetricStore {
    max_metrics: usize,
    retention_days: i64,
    inner: RwLock<Inner>,
}

impl MetricStore {
    pub fn new(max_metrics: usize, retention_days: i64) -> Self {
        Self {
            max_metrics,
            retention_days,
            inner: RwLock::new(Inner {
                metrics: VecDeque::with_capacity(max_metrics),
                by_kind: HashMap::new(),
                by_name: HashMap::new(),
                alerts: VecDeque::new(),
            }),
        }
    }

    /// Amortized O(1); evicts the oldest metric when full or past retention,
    /// then rebuilds the secondary indexes.
    pub async fn store(&self, metric: Metric) {
        let mut inner = self.inner.write().await;
        let cutoff = Utc::now() - ChronoDuration::days(self.retention_days);

        let needs_eviction =
            inner.metrics.len() >= self.max_metrics || inner.metrics.front().map(|m| m.timestamp < cutoff).unwrap_or(false);

        if needs_eviction {
            while inner.metrics.len() >= self.max_metrics {
                inner.metrics.pop_front();
            }
            while inner.metrics.front().map(|m| m.timestamp < cutoff).unwrap_or(false) {
                inner.metrics.pop_front();
            }
            Self::rebuild_indexes(&mut inner);
        }

        let idx = inner.metrics.len();
        inner.by_kind.entry(metric.kind).or_default().push(idx);
        inner.by_name.entry(metric.name.clone()).or_default().push(idx);
        inner.metrics.push_back(metric);
    }

    /// Evicts everything past `retention_days` independent of inserts, for
    /// the periodic eviction/retention sweeper (§5, "one metric-eviction/
    /// retention sweeper").
    pub async fn sweep_retention(&self) -> usize {
        let mut inner = self.inner.write().await;
        let cutoff = Utc::now() - ChronoDuration::days(self.retention_days);
        let before = inner.metrics.len();
        while inner.metrics.front().map(|m| m.timestamp < cutoff).unwrap_or(false) {
            inner.metrics.pop_front();
        }
        let evicted = before - inner.metrics.len();
        if evicted > 0 {
            Self::rebuild_indexes(&mut inner);
        }
        evicted
    }

    fn rebuild_indexes(inner: &mut Inner) {
        inner.by_kind.clear();
        inner.by_name.clear();
        for (idx, metric) in inner.metrics.iter().enumerate() {
            inner.by_kind.entry(metric.kind).or_default().push(idx);
            inner.by_name.entry(metric.name.clone()).or_default().push(idx);
        }
    }

    /// Uses the kind/name secondary indexes to narrow candidates before
    /// filtering by time range and tags, per §4.5.
    pub async fn query(
        &self,
        kind: Option<MetricKind>,
        name: Option<&str>,
        time_range: Option<(DateTime<Utc>, DateTime<Utc>)>,
        tags: Option<&HashMap<String, String>>,
    ) -> Vec<Metric> {
        let inner = self.inner.read().await;

        let kind_set: Option<HashSet<usize>> = kind.map(|k| {
            inner.by_kind.get(&k).cloned().unwrap_or_default().into_iter().collect()
        });
        let name_set: Option<HashSet<usize>> = name.map(|n| {
            inner.by_name.get(n).cloned().unwrap_or_default().into_iter().collect()
        });

        let candidate_indexes: Vec<usize> = match (kind_set, name_set) {
            (Some(a), Some(b)) => a.intersection(&b).copied().collect(),
            (Some(a), None) => a.into_iter().collect(),
            (None, Some(b)) => b.into_iter().collect(),
            (None, None) => (0..inner.metrics.len()).collect(),
        };

        candidate_indexes
            .into_iter()
            .filter_map(|idx| inner.metrics.get(idx))
            .filter(|m| {
                time_range
                    .map(|(start, end)| m.timestamp >= start && m.timestamp <= end)
                    .unwrap_or(true)
            })
            .filter(|m| {
                tags.map(|wanted| wanted.iter().all(|(k, v)| m.tags.get(k) == Some(v)))
                    .unwrap_or(true)
            })
            .cloned()
            .collect()
    }

    pub async fn store_alert(&self, alert: Alert) {
        self.inner.write().await.alerts.push_back(alert);
    }

    pub async fn get_alerts(&self, severity: Option<loom_core::AlertSeverity>) -> Vec<Alert> {
        self.inner
            .read()
            .await
            .alerts
            .iter()
            .filter(|a| severity.map(|s| a.severity == s).unwrap_or(true))
            .cloned()
            .collect()
    }

    pub async fn stats(&self) -> MetricStoreStats {
        let inner = self.inner.read().await;
        MetricStoreStats {
            total_metrics: inner.metrics.len(),
            total_alerts: inner.alerts.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn store_never_deduplicates() {
        let store = MetricStore::new(100, 30);
        store.store(Metric::new("latency", 1.0, MetricKind::Latency)).await;
        store.store(Metric::new("latency", 1.0, MetricKind::Latency)).await;
        let results = store.query(None, Some("latency"), None, None).await;
        assert_eq!(results.len(), 2);
    }

    #[tokio::test]
    async fn size_never_exceeds_max_metrics() {
        let store = MetricStore::new(5, 30);
        for i in 0..20 {
            store.store(Metric::new(format!("m{}", i), i as f64, MetricKind::Custom)).await;
        }
        assert_eq!(store.stats().await.total_metrics, 5);
    }

    #[tokio::test]
    async fn query_by_kind_uses_secondary_index() {
        let store = MetricStore::new(100, 30);
        store.store(Metric::new("lat", 1.0, MetricKind::Latency)).await;
        store.store(Metric::new("cost", 2.0, MetricKind::Cost)).await;
        let latency_only = store.query(Some(MetricKind::Latency), None, None, None).await;
        assert_eq!(latency_only.len(), 1);
        assert_eq!(latency_only[0].name, "lat");
    }

    #[tokio::test]
    async fn indexes_remain_consistent_after_eviction() {
        let store = MetricStore::new(3, 30);
        for i in 0..10 {
            store.store(Metric::new("m", i as f64, MetricKind::Throughput)).await;
        }
        let all = store.query(Some(MetricKind::Throughput), None, None, None).await;
        assert_eq!(all.len(), 3);
    }
}
