use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use loom_core::config::{AlertRuleConfig, GatewayConfig, NotificationChannelConfig};
use loom_core::keys::KeyStore;
use loom_core::{AlertSeverity, MetricKind, ProviderKind, RetryPolicy};
use loom_gateway::{CostGuard, Gateway, HealthRegistry, Selector, SessionMapping};
use loom_gateway::ProviderEntry;
use loom_providers::{
    host_key, spawn_cleanup_task, AnthropicAdapter, CacheConfig, ConnectionPool, ConnectionPoolConfig,
    GoogleAdapter, LocalAdapter, OpenAiCompatibleAdapter, ResponseCache,
};
use loom_telemetry::{
    AlertEngine, AlertRule, AlertSink, CompareOp, LogSink, MetricStore, PrometheusExporter,
    ResourceAnalyzer, ResourceThresholds, WebhookSink,
};

const CONNECTION_POOL_SWEEP_INTERVAL: Duration = Duration::from_secs(120);
const METRIC_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

fn default_base_url(kind: ProviderKind) -> &'static str {
    match kind {
        ProviderKind::OpenAi => "https://api.openai.com/v1",
        ProviderKind::Azure => "https://YOUR-RESOURCE.openai.azure.com/openai/deployments/YOUR-DEPLOYMENT",
        ProviderKind::DeepSeek => "https://api.deepseek.com/v1",
        ProviderKind::Anthropic => "https://api.anthropic.com/v1",
        ProviderKind::Google => "https://generativelanguage.googleapis.com/v1beta",
        ProviderKind::Local => "http://localhost:11434",
    }
}

fn parse_metric_kind(s: &str) -> Option<MetricKind> {
    match s {
        "latency" => Some(MetricKind::Latency),
        "throughput" => Some(MetricKind::Throughput),
        "error_rate" => Some(MetricKind::ErrorRate),
        "memory" => Some(MetricKind::Memory),
        "cpu" => Some(MetricKind::Cpu),
        "tokens" => Some(MetricKind::Tokens),
        "cost" => Some(MetricKind::Cost),
        "custom" => Some(MetricKind::Custom),
        _ => None,
    }
}

fn parse_alert_severity(s: &str) -> AlertSeverity {
    match s {
        "info" => AlertSeverity::Info,
        "error" => AlertSeverity::Error,
        "critical" => AlertSeverity::Critical,
        _ => AlertSeverity::Warning,
    }
}

fn parse_compare_op(s: &str) -> Option<CompareOp> {
    match s {
        ">" | "gt" | "greater_than" => Some(CompareOp::GreaterThan),
        "<" | "lt" | "less_than" => Some(CompareOp::LessThan),
        ">=" | "ge" | "greater_or_equal" => Some(CompareOp::GreaterOrEqual),
        "<=" | "le" | "less_or_equal" => Some(CompareOp::LessOrEqual),
        "==" | "eq" | "equal" => Some(CompareOp::Equal),
        "!=" | "ne" | "not_equal" => Some(CompareOp::NotEqual),
        _ => None,
    }
}

fn build_alert_rule(rule: &AlertRuleConfig) -> Option<AlertRule> {
    let op = parse_compare_op(&rule.op)?;
    Some(AlertRule {
        name: rule.name.clone(),
        match_kind: rule.match_kind.as_deref().and_then(parse_metric_kind),
        match_name: rule.match_name.clone(),
        op,
        threshold: rule.threshold,
        severity: parse_alert_severity(&rule.severity),
        message_template: rule.message_template.clone(),
        cooldown: Duration::from_secs(rule.cooldown_secs),
    })
}

fn build_notification_sink(channel: &NotificationChannelConfig) -> Option<Box<dyn AlertSink>> {
    match channel.kind.as_str() {
        "log" => Some(Box::new(LogSink)),
        "webhook" => channel
            .target
            .as_ref()
            .map(|url| Box::new(WebhookSink::new(url.clone())) as Box<dyn AlertSink>),
        _ => None,
    }
}

/// Builds a fully wired `Gateway` from a parsed `GatewayConfig`: resolves
/// API keys through the `KeyStore` precedence chain, builds one pooled
/// `reqwest::Client` per provider host, constructs the matching wire-
/// protocol adapter, and registers everything along with the configured
/// selection/health/cost/cache subsystems. Also constructs the
/// monitoring/resource-analysis subsystems from `config.monitoring` and
/// `config.resource_analysis` and spawns the mandatory background tasks
/// (§5: connection-pool sweep, metric-eviction/retention sweep,
/// resource-collection).
pub async fn build_gateway(config: &GatewayConfig, config_dir: &std::path::Path) -> Result<Gateway> {
    let mut key_store = KeyStore::new(config_dir).context("opening key store")?;
    let pool = Arc::new(ConnectionPool::new(ConnectionPoolConfig::default()));

    let session_mappings: HashMap<String, SessionMapping> = config
        .provider_selection
        .session_type_mapping
        .iter()
        .map(|(class, mapping)| {
            (
                class.clone(),
                SessionMapping {
                    preferred_provider: mapping.preferred_provider.clone(),
                    fallback_to: mapping.fallback_to.clone().into_iter().collect(),
                },
            )
        })
        .collect();

    let cache = if config.llm_providers.values().any(|p| p.enable_caching) {
        Some(Arc::new(
            ResponseCache::new(CacheConfig::default()).context("constructing response cache")?,
        ))
    } else {
        None
    };

    let metric_store = Arc::new(MetricStore::new(
        config.monitoring.metrics_store.max_metrics,
        config.monitoring.metrics_store.retention_days as i64,
    ));

    let alert_rules: Vec<AlertRule> = config.monitoring.alert_rules.iter().filter_map(build_alert_rule).collect();
    let alert_sinks: Vec<Box<dyn AlertSink>> = config
        .monitoring
        .notification_channels
        .iter()
        .filter_map(build_notification_sink)
        .collect();
    let alert_engine = if alert_rules.is_empty() {
        None
    } else {
        Some(Arc::new(AlertEngine::new(alert_rules, alert_sinks)))
    };

    let prometheus_exporter = if config.monitoring.enable_prometheus {
        Some(Arc::new(
            PrometheusExporter::new(&config.monitoring.metrics_prefix).context("constructing prometheus exporter")?,
        ))
    } else {
        None
    };

    let mut gateway = Gateway::new(
        Selector::new(session_mappings),
        HealthRegistry::new(Duration::from_secs(60)),
        CostGuard::new(config.budget.clone(), config.pricing.clone(), 3600),
        cache,
        config.provider_selection.fallback_order.clone(),
    )
    .with_metric_store(metric_store.clone());
    if let Some(engine) = alert_engine.clone() {
        gateway = gateway.with_alert_engine(engine);
    }
    if let Some(exporter) = prometheus_exporter.clone() {
        gateway = gateway.with_prometheus_exporter(exporter);
    }

    for (id, provider_config) in &config.llm_providers {
        if !provider_config.enabled {
            continue;
        }

        let api_key = provider_config
            .api_key
            .clone()
            .filter(|k| !k.is_empty())
            .or_else(|| key_store.get_key(id))
            .unwrap_or_default();

        let base_url = provider_config
            .base_url
            .clone()
            .unwrap_or_else(|| default_base_url(provider_config.kind).to_string());

        let host = host_key(&url::Url::parse(&base_url).map_err(|e| anyhow!("invalid base_url for {id}: {e}"))?);
        let request_timeout = Duration::from_secs(provider_config.timeout_secs);
        let pool_for_client = pool.clone();
        let client = pool_for_client
            .get_client(&host, || {
                reqwest::Client::builder()
                    .timeout(request_timeout)
                    .build()
                    .expect("building reqwest client")
            })
            .await;

        let adapter: Arc<dyn loom_core::Adapter> = match provider_config.kind {
            ProviderKind::OpenAi | ProviderKind::Azure | ProviderKind::DeepSeek => Arc::new(
                OpenAiCompatibleAdapter::new(provider_config.kind, base_url, &provider_config.model, api_key, client),
            ),
            ProviderKind::Anthropic => {
                Arc::new(AnthropicAdapter::new(base_url, &provider_config.model, api_key, client))
            }
            ProviderKind::Google => {
                Arc::new(GoogleAdapter::new(base_url, &provider_config.model, api_key, client))
            }
            ProviderKind::Local => Arc::new(LocalAdapter::new(base_url, &provider_config.model, client)),
        };

        gateway
            .register_provider(ProviderEntry {
                id: id.clone(),
                adapter,
                model: provider_config.model.clone(),
                enabled: provider_config.enabled,
                weight: 1.0,
                retry_policy: RetryPolicy {
                    max_retries: provider_config.max_retries,
                    base_delay: Duration::from_millis(provider_config.retry_delay_ms),
                    ..RetryPolicy::default()
                },
                timeout: Duration::from_secs(provider_config.timeout_secs),
                caching_enabled: provider_config.enable_caching,
            })
            .await;
    }

    let (pool_shutdown_tx, pool_shutdown_rx) = tokio::sync::watch::channel(false);
    let pool_cleanup_handle = spawn_cleanup_task(pool.clone(), CONNECTION_POOL_SWEEP_INTERVAL, pool_shutdown_rx);
    gateway.adopt_background_task(pool_shutdown_tx, pool_cleanup_handle).await;

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(METRIC_SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            metric_store.sweep_retention().await;
        }
    });

    let resource_config = &config.resource_analysis;
    let thresholds = ResourceThresholds {
        leak_threshold_mb_per_hour: resource_config.leak_threshold_mb_per_hour,
        high_memory_threshold: resource_config.high_memory_threshold,
        high_cpu_threshold: resource_config.high_cpu_threshold,
        low_disk_threshold: resource_config.disk.low_disk_threshold,
        thread_leak_threshold: resource_config.thread_leak_threshold as usize,
        monitored_paths: resource_config.disk.monitored_paths.iter().map(PathBuf::from).collect(),
        max_history: resource_config.history_size,
    };
    let resource_analyzer = Arc::new(ResourceAnalyzer::new(thresholds));
    let collection_interval = Duration::from_secs(resource_config.collection_interval_secs);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(collection_interval);
        loop {
            ticker.tick().await;
            let sample = resource_analyzer.collect().await;
            for issue in resource_analyzer.detect_issues(sample).await {
                log::warn!("resource issue [{:?}]: {}", issue.severity, issue.description);
            }
        }
    });

    Ok(gateway)
}
