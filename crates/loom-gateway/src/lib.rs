pub mod cost_guard;
pub mod health;
pub mod selector;

pub use cost_guard::{AlertLevel, BudgetAlert, CostGuard, OptimizationSuggestion};
pub use health::HealthRegistry;
pub use selector::{Candidate, SessionMapping, Selector};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use loom_core::{
    ClassifiedError, ErrorKind, GatewayError, GatewayResult, Metric, MetricKind, ProviderKind, Request,
    Response, ResponseMeta, RetryPolicy,
};
use loom_providers::{CacheKey, ResponseCache};
use loom_telemetry::{AlertEngine, MetricStore, PrometheusExporter};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;

const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// A registered provider: its adapter, retry policy, and whether it
/// currently participates in fallback/selection.
pub struct ProviderEntry {
    pub id: String,
    pub adapter: Arc<dyn loom_core::Adapter>,
    pub model: String,
    pub enabled: bool,
    pub weight: f64,
    pub retry_policy: RetryPolicy,
    pub timeout: Duration,
    pub caching_enabled: bool,
}

/// Single entry point combining provider dispatch, intelligent selection,
/// health/circuit-breaker tracking, budget enforcement, and the optional
/// response cache (§4.1).
pub struct Gateway {
    providers: RwLock<HashMap<String, ProviderEntry>>,
    fallback_order: RwLock<Vec<String>>,
    selector: Selector,
    health: Arc<HealthRegistry>,
    cost_guard: CostGuard,
    cache: Option<Arc<ResponseCache>>,
    health_check_interval: Duration,
    health_tasks: RwLock<HashMap<String, (watch::Sender<bool>, JoinHandle<()>)>>,
    metric_store: Option<Arc<MetricStore>>,
    alert_engine: Option<Arc<AlertEngine>>,
    prometheus_exporter: Option<Arc<PrometheusExporter>>,
    background_tasks: RwLock<Vec<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl Gateway {
    pub fn new(
        selector: Selector,
        health: HealthRegistry,
        cost_guard: CostGuard,
        cache: Option<Arc<ResponseCache>>,
        fallback_order: Vec<String>,
    ) -> Self {
        Self {
            providers: RwLock::new(HashMap::new()),
            fallback_order: RwLock::new(fallback_order),
            selector,
            health: Arc::new(health),
            cost_guard,
            cache,
            health_check_interval: DEFAULT_HEALTH_CHECK_INTERVAL,
            health_tasks: RwLock::new(HashMap::new()),
            metric_store: None,
            alert_engine: None,
            prometheus_exporter: None,
            background_tasks: RwLock::new(Vec::new()),
        }
    }

    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    /// Attaches the `MetricStore` that `dispatch_with_retry` records
    /// latency/cost/error-rate metrics into (§4.5, §6).
    pub fn with_metric_store(mut self, metric_store: Arc<MetricStore>) -> Self {
        self.metric_store = Some(metric_store);
        self
    }

    /// Attaches the optional alert-notifier (§4.6, §5: "optional
    /// alert-notifier worker"). Every metric recorded while this is set is
    /// also evaluated against the engine's rules on a detached task so a
    /// slow sink never adds latency to `generate`.
    pub fn with_alert_engine(mut self, alert_engine: Arc<AlertEngine>) -> Self {
        self.alert_engine = Some(alert_engine);
        self
    }

    /// Attaches the Prometheus exposition registry (§6). Every metric
    /// recorded while this is set is mirrored into the matching metric
    /// family alongside the `MetricStore` entry.
    pub fn with_prometheus_exporter(mut self, exporter: Arc<PrometheusExporter>) -> Self {
        self.prometheus_exporter = Some(exporter);
        self
    }

    pub fn prometheus_exporter(&self) -> Option<&Arc<PrometheusExporter>> {
        self.prometheus_exporter.as_ref()
    }

    /// Keeps a background task's cancellation sender alive for the
    /// Gateway's lifetime so dropping it doesn't make the receiver's
    /// `changed()` resolve immediately in a busy loop.
    pub async fn adopt_background_task(&self, tx: watch::Sender<bool>, handle: JoinHandle<()>) {
        self.background_tasks.write().await.push((tx, handle));
    }

    /// Registers the provider and spawns an owned background task that
    /// calls `adapter.health_probe()` on `health_check_interval` and feeds
    /// the result into the `HealthRegistry` (§4.3).
    pub async fn register_provider(&self, entry: ProviderEntry) {
        self.health.register(&entry.id).await;
        let id = entry.id.clone();
        let adapter = entry.adapter.clone();
        self.providers.write().await.insert(entry.id.clone(), entry);

        let (tx, mut rx) = watch::channel(false);
        let health = self.health.clone();
        let interval = self.health_check_interval;
        let task_id = id.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = rx.changed() => {
                        if changed.is_err() || *rx.borrow() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(interval) => {
                        let started = Instant::now();
                        let deadline = started + HEALTH_PROBE_TIMEOUT;
                        match adapter.health_probe(deadline).await {
                            Ok(_) => {
                                let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
                                health.record_success(&task_id, latency_ms).await;
                            }
                            Err(classified) => {
                                health
                                    .record_failure(&task_id, classified.kind.severity(), &classified.kind.to_string())
                                    .await;
                            }
                        }
                    }
                }
            }
        });
        self.health_tasks.write().await.insert(id, (tx, handle));
    }

    /// Cancels the provider's background health-probe task and awaits its
    /// handle before removing the provider and its health record (§4.3).
    pub async fn deregister_provider(&self, id: &str) {
        if let Some((tx, handle)) = self.health_tasks.write().await.remove(id) {
            let _ = tx.send(true);
            let _ = handle.await;
        }
        if let Some(entry) = self.providers.write().await.remove(id) {
            entry.adapter.close().await;
        }
        self.health.deregister(id).await;
        let mut order = self.fallback_order.write().await;
        order.retain(|p| p != id);
    }

    /// Unifies the legacy mechanical path and the intelligent-selection path
    /// behind a single entry point (DESIGN.md, Open Question resolution).
    pub async fn generate(&self, request: Request) -> GatewayResult<Response> {
        self.generate_with_intelligent_fallback(request).await
    }

    /// Routes primary selection through the `Selector`'s strategies, then
    /// falls back mechanically through `fallback_order` on failure.
    pub async fn generate_with_intelligent_fallback(&self, request: Request) -> GatewayResult<Response> {
        self.run_generate(request, true).await
    }

    /// Mechanical fallback through `fallback_order` only, bypassing the
    /// Selector's strategies. Kept for callers that want deterministic,
    /// config-driven ordering.
    pub async fn generate_with_fallback(&self, request: Request) -> GatewayResult<Response> {
        self.run_generate(request, false).await
    }

    async fn run_generate(&self, request: Request, use_selector: bool) -> GatewayResult<Response> {
        let deadline = request
            .policy
            .deadline_ms
            .map(|ms| Instant::now() + Duration::from_millis(ms))
            .unwrap_or_else(|| Instant::now() + Duration::from_secs(120));

        if deadline <= Instant::now() {
            return Ok(Response::degraded(request.request_id, "deadline already elapsed"));
        }

        let estimated_cost = request
            .policy
            .estimated_cost
            .unwrap_or_else(|| self.cost_guard.estimate_default_cost(&request));
        let (allowed, reason) = self.cost_guard.can_make(estimated_cost).await;
        if !allowed {
            return Err(GatewayError::BudgetExceeded {
                reason: reason.unwrap_or_else(|| "budget exceeded".to_string()),
            });
        }

        let first_pick = self.select_provider(&request, use_selector).await;
        let Some(first_provider) = first_pick else {
            return Err(GatewayError::NoHealthyProvider);
        };

        let mut tried: Vec<String> = Vec::new();
        let mut next_provider = Some(first_provider);

        while let Some(provider_id) = next_provider.take() {
            if Instant::now() >= deadline {
                break;
            }
            tried.push(provider_id.clone());

            if let Some(cache) = &self.cache {
                if let Some(cached) = self.try_cache(&provider_id, cache, &request).await {
                    return Ok(cached);
                }
            }

            match self.dispatch_with_retry(&provider_id, &request, deadline).await {
                Ok(response) => {
                    if let Some(cache) = &self.cache {
                        self.maybe_cache(&provider_id, cache, &request, &response).await;
                    }
                    return Ok(response);
                }
                Err(classified) => {
                    warn!(
                        "dispatch to {} failed: {} (correlation {})",
                        provider_id, classified, classified.correlation_id
                    );
                    next_provider = self
                        .next_fallback_candidate(&tried, &request, use_selector)
                        .await;
                }
            }
        }

        info!(
            "exhausted all providers for request {}; returning degraded response",
            request.request_id
        );
        Ok(Response::degraded(
            request.request_id,
            "no provider completed the request before the deadline",
        ))
    }

    async fn select_provider(&self, request: &Request, use_selector: bool) -> Option<String> {
        let candidates = self.collect_candidates(request, &[]).await;
        if candidates.is_empty() {
            return None;
        }
        if use_selector {
            self.selector.choose(request, &candidates)
        } else {
            let order = self.fallback_order.read().await;
            order
                .iter()
                .find(|id| candidates.iter().any(|c| &c.provider_id == *id))
                .cloned()
        }
    }

    async fn next_fallback_candidate(&self, tried: &[String], request: &Request, use_selector: bool) -> Option<String> {
        let candidates = self.collect_candidates(request, tried).await;
        if candidates.is_empty() {
            return None;
        }
        if use_selector {
            self.selector.choose(request, &candidates)
        } else {
            let order = self.fallback_order.read().await;
            order
                .iter()
                .find(|id| !tried.contains(id) && candidates.iter().any(|c| &c.provider_id == *id))
                .cloned()
        }
    }

    async fn collect_candidates(&self, request: &Request, exclude: &[String]) -> Vec<Candidate> {
        let providers = self.providers.read().await;
        let mut candidates = Vec::new();
        for (id, entry) in providers.iter() {
            if !entry.enabled || exclude.contains(id) {
                continue;
            }
            if !self.health.is_selectable(id).await {
                continue;
            }
            let health = self.health.snapshot(id).await.unwrap_or_default();
            let estimated_cost = self.cost_guard.estimate_request_cost(id, &entry.model, request);
            candidates.push(Candidate {
                provider_id: id.clone(),
                health,
                weight: entry.weight,
                estimated_cost,
            });
        }
        candidates
    }

    async fn dispatch_with_retry(
        &self,
        provider_id: &str,
        request: &Request,
        deadline: Instant,
    ) -> Result<Response, ClassifiedError> {
        let (adapter, retry_policy, provider_timeout) = {
            let providers = self.providers.read().await;
            let entry = providers
                .get(provider_id)
                .ok_or_else(|| ClassifiedError::new(provider_id, ErrorKind::Unknown, "provider not registered"))?;
            (entry.adapter.clone(), entry.retry_policy.clone(), entry.timeout)
        };

        let mut attempt = 1u32;
        loop {
            let per_call_deadline = std::cmp::min(deadline, Instant::now() + provider_timeout);
            let started = Instant::now();
            match adapter.dispatch(request, per_call_deadline).await {
                Ok(response) => {
                    let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
                    self.health.record_success(provider_id, latency_ms).await;
                    let cost = self.cost_guard.charge(provider_id, &response, request.request_id).await;
                    self.record_dispatch_metrics(provider_id, &response.model, latency_ms, cost).await;
                    return Ok(response);
                }
                Err(classified) => {
                    self.health
                        .record_failure(provider_id, classified.kind.severity(), &classified.kind.to_string())
                        .await;
                    self.record_error_metric(provider_id).await;

                    let retryable = classified.kind.is_retryable();
                    let retries_left = attempt <= retry_policy.max_retries;
                    if retryable && retries_left && Instant::now() < deadline {
                        let delay = retry_policy.backoff(attempt);
                        debug!(
                            "retrying {} attempt {} after {:?} ({})",
                            provider_id, attempt, delay, classified.kind
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(classified);
                }
            }
        }
    }

    async fn record_dispatch_metrics(&self, provider_id: &str, model: &str, latency_ms: f64, cost: f64) {
        if let Some(exporter) = &self.prometheus_exporter {
            exporter
                .latency_seconds
                .with_label_values(&["generate", "dispatch"])
                .observe(latency_ms / 1000.0);
            exporter
                .requests_total
                .with_label_values(&["generate", "dispatch", "ok"])
                .inc();
            exporter.cost_total.with_label_values(&[provider_id, model]).inc_by(cost);
        }

        let Some(store) = &self.metric_store else {
            return;
        };
        let mut latency = Metric::new("dispatch_latency_ms", latency_ms, MetricKind::Latency);
        latency.tags.insert("provider".to_string(), provider_id.to_string());
        self.store_and_alert(store, latency).await;

        let mut cost_metric = Metric::new("dispatch_cost_usd", cost, MetricKind::Cost);
        cost_metric.tags.insert("provider".to_string(), provider_id.to_string());
        self.store_and_alert(store, cost_metric).await;
    }

    async fn record_error_metric(&self, provider_id: &str) {
        if let Some(exporter) = &self.prometheus_exporter {
            exporter
                .requests_total
                .with_label_values(&["generate", "dispatch", "error"])
                .inc();
            exporter.error_rate.with_label_values(&[provider_id]).set(1.0);
        }

        let Some(store) = &self.metric_store else {
            return;
        };
        let mut metric = Metric::new("dispatch_error", 1.0, MetricKind::ErrorRate);
        metric.tags.insert("provider".to_string(), provider_id.to_string());
        self.store_and_alert(store, metric).await;
    }

    async fn store_and_alert(&self, store: &Arc<MetricStore>, metric: Metric) {
        store.store(metric.clone()).await;
        if let Some(engine) = self.alert_engine.clone() {
            tokio::spawn(async move {
                engine.check(&metric).await;
            });
        }
    }

    async fn try_cache(&self, provider_id: &str, cache: &Arc<ResponseCache>, request: &Request) -> Option<Response> {
        let providers = self.providers.read().await;
        let entry = providers.get(provider_id)?;
        if !entry.caching_enabled {
            return None;
        }
        let key = CacheKey::generate(provider_id, &entry.model, request);
        drop(providers);
        cache.get(&key).await
    }

    async fn maybe_cache(&self, provider_id: &str, cache: &Arc<ResponseCache>, request: &Request, response: &Response) {
        let providers = self.providers.read().await;
        let Some(entry) = providers.get(provider_id) else {
            return;
        };
        if !entry.caching_enabled {
            return;
        }
        let key = CacheKey::generate(provider_id, &entry.model, request);
        drop(providers);
        if let Err(e) = cache.insert(&key, response).await {
            warn!("failed to insert response into cache: {}", e);
        }
    }

    /// Best-effort parallel batch; each item gets the same guarantees as a
    /// standalone `generate` call (§4.1).
    pub async fn generate_batch(&self, requests: Vec<Request>) -> Vec<GatewayResult<Response>> {
        let futures = requests.into_iter().map(|r| self.generate(r));
        futures::future::join_all(futures).await
    }

    pub async fn health_snapshot(&self) -> HashMap<String, loom_core::HealthRecord> {
        self.health.snapshot_all().await
    }

    pub fn cost_guard(&self) -> &CostGuard {
        &self.cost_guard
    }

    pub async fn degrade_with_message(&self, request_id: uuid::Uuid, message: impl Into<String>) -> Response {
        Response::degraded(request_id, message)
    }
}

pub fn provider_kind_label(kind: ProviderKind) -> &'static str {
    match kind {
        ProviderKind::OpenAi => "openai",
        ProviderKind::Anthropic => "anthropic",
        ProviderKind::Google => "google",
        ProviderKind::Azure => "azure",
        ProviderKind::DeepSeek => "deepseek",
        ProviderKind::Local => "local",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures::stream::BoxStream;
    use loom_core::{ClassifiedResult, HealthRecord};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ScriptedAdapter {
        kind: ProviderKind,
        responses: std::sync::Mutex<Vec<ClassifiedResult<Response>>>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl loom_core::Adapter for ScriptedAdapter {
        fn kind(&self) -> ProviderKind {
            self.kind
        }

        async fn dispatch(&self, request: &Request, _deadline: Instant) -> ClassifiedResult<Response> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return Err(ClassifiedError::new("scripted", ErrorKind::Unknown, "exhausted script"));
            }
            let mut result = responses.remove(0);
            if let Ok(r) = &mut result {
                r.meta.request_id = request.request_id;
            }
            result
        }

        async fn stream(
            &self,
            _request: &Request,
            _deadline: Instant,
        ) -> ClassifiedResult<BoxStream<'static, loom_core::adapter::StreamChunk>> {
            unimplemented!()
        }

        async fn health_probe(&self, _deadline: Instant) -> ClassifiedResult<HealthRecord> {
            Ok(HealthRecord::default())
        }

        async fn close(&self) {}
    }

    fn ok_response(content: &str, model: &str) -> ClassifiedResult<Response> {
        Ok(Response {
            content: content.to_string(),
            model: model.to_string(),
            usage: loom_core::Usage::new(3, 1),
            meta: ResponseMeta {
                provider: "scripted".to_string(),
                request_id: uuid::Uuid::new_v4(),
                finish_reason: Some("stop".to_string()),
                degraded: false,
                thinking_enabled: None,
            },
        })
    }

    fn test_gateway(fallback_order: Vec<String>) -> Gateway {
        Gateway::new(
            Selector::new(HashMap::new()),
            HealthRegistry::new(Duration::from_secs(60)),
            CostGuard::new(
                loom_core::BudgetLimit {
                    total: 100.0,
                    daily: 100.0,
                    monthly: 100.0,
                    per_request: 10.0,
                },
                HashMap::new(),
                3600,
            ),
            None,
            fallback_order,
        )
    }

    #[tokio::test]
    async fn falls_back_to_next_provider_on_server_error() {
        let gateway = test_gateway(vec!["a".to_string(), "b".to_string()]);

        gateway
            .register_provider(ProviderEntry {
                id: "a".to_string(),
                adapter: Arc::new(ScriptedAdapter {
                    kind: ProviderKind::OpenAi,
                    responses: std::sync::Mutex::new(vec![Err(ClassifiedError::new(
                        "a",
                        ErrorKind::ServerError { status: 500 },
                        "boom",
                    ))]),
                    calls: AtomicU32::new(0),
                }),
                model: "m".to_string(),
                enabled: true,
                weight: 1.0,
                retry_policy: RetryPolicy {
                    max_retries: 0,
                    ..RetryPolicy::default()
                },
                timeout: Duration::from_secs(5),
                caching_enabled: false,
            })
            .await;

        gateway
            .register_provider(ProviderEntry {
                id: "b".to_string(),
                adapter: Arc::new(ScriptedAdapter {
                    kind: ProviderKind::Anthropic,
                    responses: std::sync::Mutex::new(vec![ok_response("hi", "m")]),
                    calls: AtomicU32::new(0),
                }),
                model: "m".to_string(),
                enabled: true,
                weight: 1.0,
                retry_policy: RetryPolicy {
                    max_retries: 0,
                    ..RetryPolicy::default()
                },
                timeout: Duration::from_secs(5),
                caching_enabled: false,
            })
            .await;

        let request = Request::new("hello");
        let response = gateway.generate_with_fallback(request).await.unwrap();
        assert_eq!(response.content, "hi");
        assert_eq!(gateway.cost_guard.log_len().await, 1);
    }

    #[tokio::test]
    async fn zero_providers_yields_no_healthy_provider_without_io() {
        let gateway = test_gateway(vec![]);
        let request = Request::new("hello");
        let err = gateway.generate(request).await.unwrap_err();
        matches!(err, GatewayError::NoHealthyProvider);
    }

    #[tokio::test]
    async fn past_deadline_returns_degraded_response_without_dispatch() {
        let gateway = test_gateway(vec!["a".to_string()]);
        gateway
            .register_provider(ProviderEntry {
                id: "a".to_string(),
                adapter: Arc::new(ScriptedAdapter {
                    kind: ProviderKind::OpenAi,
                    responses: std::sync::Mutex::new(vec![ok_response("should not be reached", "m")]),
                    calls: AtomicU32::new(0),
                }),
                model: "m".to_string(),
                enabled: true,
                weight: 1.0,
                retry_policy: RetryPolicy::default(),
                timeout: Duration::from_secs(5),
                caching_enabled: false,
            })
            .await;

        let mut request = Request::new("hello");
        request.policy.deadline_ms = Some(0);
        tokio::time::sleep(Duration::from_millis(5)).await;
        let response = gateway.generate(request).await.unwrap();
        assert!(response.meta.degraded);
    }

    #[tokio::test]
    async fn per_request_budget_veto_blocks_before_selection() {
        let gateway = Gateway::new(
            Selector::new(HashMap::new()),
            HealthRegistry::new(Duration::from_secs(60)),
            CostGuard::new(
                loom_core::BudgetLimit {
                    total: 100.0,
                    daily: 100.0,
                    monthly: 100.0,
                    per_request: 0.0001,
                },
                HashMap::new(),
                3600,
            ),
            None,
            vec!["a".to_string()],
        );
        gateway
            .register_provider(ProviderEntry {
                id: "a".to_string(),
                adapter: Arc::new(ScriptedAdapter {
                    kind: ProviderKind::OpenAi,
                    responses: std::sync::Mutex::new(vec![ok_response("hi", "m")]),
                    calls: AtomicU32::new(0),
                }),
                model: "m".to_string(),
                enabled: true,
                weight: 1.0,
                retry_policy: RetryPolicy::default(),
                timeout: Duration::from_secs(5),
                caching_enabled: false,
            })
            .await;

        let request = Request::new("a very very very very long prompt to estimate a nonzero cost");
        let err = gateway.generate(request).await.unwrap_err();
        matches!(err, GatewayError::BudgetExceeded { .. });
    }
}
