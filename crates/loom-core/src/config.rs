use std::collections::HashMap;
use std::env;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{BudgetLimit, Priority, ProviderKind, ProviderPricing};

/// Per-provider settings (§6, "Configuration").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(rename = "type")]
    pub kind: ProviderKind,
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_pool_size")]
    pub connection_pool_size: usize,
    #[serde(default)]
    pub enable_caching: bool,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_true")]
    pub fallback_enabled: bool,
    pub pricing: Option<ProviderPricing>,
}

fn default_true() -> bool {
    true
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    500
}
fn default_pool_size() -> usize {
    10
}
fn default_cache_ttl_secs() -> u64 {
    3600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMapping {
    pub preferred_provider: String,
    pub preferred_model: Option<String>,
    pub fallback_to: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSelectionConfig {
    pub default_provider: String,
    #[serde(default)]
    pub fallback_order: Vec<String>,
    #[serde(default)]
    pub session_type_mapping: HashMap<String, SessionMapping>,
    #[serde(default)]
    pub selection_strategy: Priority,
}

/// A single alerting rule, deserialized as plain data here; `loom-telemetry`
/// compiles these into its runtime `Rule` type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRuleConfig {
    pub name: String,
    pub match_kind: Option<String>,
    pub match_name: Option<String>,
    pub op: String,
    pub threshold: f64,
    pub severity: String,
    pub message_template: String,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

fn default_cooldown_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationChannelConfig {
    pub kind: String, // log | webhook | email
    pub target: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsStoreConfig {
    #[serde(default = "default_max_metrics")]
    pub max_metrics: usize,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

fn default_max_metrics() -> usize {
    10_000
}
fn default_retention_days() -> u32 {
    7
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    #[serde(default)]
    pub enable_system_metrics: bool,
    #[serde(default)]
    pub enable_prometheus: bool,
    #[serde(default)]
    pub metrics_store: MetricsStoreConfig,
    #[serde(default)]
    pub alert_rules: Vec<AlertRuleConfig>,
    #[serde(default)]
    pub notification_channels: Vec<NotificationChannelConfig>,
    pub prometheus_port: Option<u16>,
    #[serde(default = "default_metrics_prefix")]
    pub metrics_prefix: String,
}

fn default_metrics_prefix() -> String {
    "loom_".to_string()
}

impl Default for MetricsStoreConfig {
    fn default() -> Self {
        Self {
            max_metrics: default_max_metrics(),
            retention_days: default_retention_days(),
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enable_system_metrics: false,
            enable_prometheus: false,
            metrics_store: MetricsStoreConfig::default(),
            alert_rules: Vec::new(),
            notification_channels: Vec::new(),
            prometheus_port: None,
            metrics_prefix: default_metrics_prefix(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkConfig {
    #[serde(rename = "type", default = "default_benchmark_type")]
    pub kind: String,
    #[serde(default = "default_iterations")]
    pub iterations: u32,
    #[serde(default)]
    pub warmup_iterations: u32,
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,
    #[serde(default = "default_benchmark_timeout")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub parameters: HashMap<String, Value>,
}

fn default_benchmark_type() -> String {
    "latency".to_string()
}
fn default_iterations() -> u32 {
    10
}
fn default_concurrency() -> u32 {
    1
}
fn default_benchmark_timeout() -> u64 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ResultsStoreConfig {
    pub storage_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskAnalysisConfig {
    #[serde(default)]
    pub monitored_paths: Vec<String>,
    #[serde(default = "default_low_disk_threshold")]
    pub low_disk_threshold: f64,
}

fn default_low_disk_threshold() -> f64 {
    10.0
}

impl Default for DiskAnalysisConfig {
    fn default() -> Self {
        Self {
            monitored_paths: Vec::new(),
            low_disk_threshold: default_low_disk_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceAnalysisConfig {
    #[serde(default = "default_collection_interval")]
    pub collection_interval_secs: u64,
    #[serde(default = "default_high_memory_threshold")]
    pub high_memory_threshold: f64,
    #[serde(default = "default_leak_threshold")]
    pub leak_threshold_mb_per_hour: f64,
    #[serde(default = "default_high_cpu_threshold")]
    pub high_cpu_threshold: f64,
    #[serde(default)]
    pub disk: DiskAnalysisConfig,
    #[serde(default = "default_thread_leak_threshold")]
    pub thread_leak_threshold: u32,
    #[serde(default = "default_history_size")]
    pub history_size: usize,
}

fn default_collection_interval() -> u64 {
    60
}
fn default_high_memory_threshold() -> f64 {
    85.0
}
fn default_leak_threshold() -> f64 {
    50.0
}
fn default_high_cpu_threshold() -> f64 {
    90.0
}
fn default_thread_leak_threshold() -> u32 {
    500
}
fn default_history_size() -> usize {
    1000
}

impl Default for ResourceAnalysisConfig {
    fn default() -> Self {
        Self {
            collection_interval_secs: default_collection_interval(),
            high_memory_threshold: default_high_memory_threshold(),
            leak_threshold_mb_per_hour: default_leak_threshold(),
            high_cpu_threshold: default_high_cpu_threshold(),
            disk: DiskAnalysisConfig::default(),
            thread_leak_threshold: default_thread_leak_threshold(),
            history_size: default_history_size(),
        }
    }
}

/// Top-level configuration, loaded once at startup and held behind an
/// `Arc<RwLock<...>>` by the caller so it can be hot-reloaded without
/// restarting in-flight gateways.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub llm_providers: HashMap<String, ProviderConfig>,
    pub provider_selection: ProviderSelectionConfig,
    pub budget: BudgetLimit,
    #[serde(default)]
    pub pricing: HashMap<String, ProviderPricing>,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
    #[serde(default)]
    pub benchmarks: HashMap<String, BenchmarkConfig>,
    #[serde(default)]
    pub results_store: ResultsStoreConfig,
    #[serde(default)]
    pub resource_analysis: ResourceAnalysisConfig,
}

impl GatewayConfig {
    pub fn validate(&self) -> Result<(), String> {
        self.budget.validate()?;
        if !self
            .llm_providers
            .contains_key(&self.provider_selection.default_provider)
        {
            return Err(format!(
                "default_provider '{}' is not a registered provider",
                self.provider_selection.default_provider
            ));
        }
        Ok(())
    }
}

/// A single step in the variable-resolution chain: given a raw string from
/// the config file, either substitute it or pass it through unchanged.
pub trait VariableResolver: Send + Sync {
    fn resolve(&self, raw: &str) -> String;
}

/// Resolves `${VAR}` interpolation and a bare `ENV_`-prefixed indirection
/// against the process environment. Deliberately does not set resolved
/// secrets back into the environment for child processes.
pub struct EnvVarResolver;

impl VariableResolver for EnvVarResolver {
    fn resolve(&self, raw: &str) -> String {
        if let Some(var_name) = raw.strip_prefix("ENV_") {
            if let Ok(value) = env::var(var_name) {
                return value;
            }
        }
        if raw.starts_with("${") && raw.ends_with('}') {
            let var_name = &raw[2..raw.len() - 1];
            if let Ok(value) = env::var(var_name) {
                return value;
            }
        }
        raw.to_string()
    }
}

/// Resolves `CREDENTIAL_<name>` indirection against an injected map, used
/// when secrets arrive from an external key store rather than the process
/// environment.
pub struct CredentialResolver {
    credentials: HashMap<String, String>,
}

impl CredentialResolver {
    pub fn new(credentials: HashMap<String, String>) -> Self {
        Self { credentials }
    }
}

impl VariableResolver for CredentialResolver {
    fn resolve(&self, raw: &str) -> String {
        if let Some(name) = raw.strip_prefix("CREDENTIAL_") {
            if let Some(value) = self.credentials.get(name) {
                return value.clone();
            }
        }
        raw.to_string()
    }
}

/// Chains resolvers in order; the first one that changes the value wins.
pub struct VariableResolverProcessor {
    resolvers: Vec<Box<dyn VariableResolver>>,
}

impl VariableResolverProcessor {
    pub fn new(resolvers: Vec<Box<dyn VariableResolver>>) -> Self {
        Self { resolvers }
    }

    pub fn resolve(&self, raw: &str) -> String {
        for resolver in &self.resolvers {
            let resolved = resolver.resolve(raw);
            if resolved != raw {
                return resolved;
            }
        }
        raw.to_string()
    }

    /// Apply the resolver chain recursively to every string leaf of a JSON
    /// value, leaving the structure otherwise intact.
    pub fn resolve_value(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => Value::String(self.resolve(s)),
            Value::Array(items) => {
                Value::Array(items.iter().map(|v| self.resolve_value(v)).collect())
            }
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.resolve_value(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}

/// Parses a config file (TOML or YAML, by extension) into a `GatewayConfig`,
/// then applies environment-variable overrides for provider API keys:
/// `<PROVIDER>_API_KEY` overrides the config value only when the config
/// left it empty, per §6.
pub fn load_config(path: &Path) -> Result<GatewayConfig, String> {
    let raw = std::fs::read_to_string(path).map_err(|e| format!("reading {:?}: {}", path, e))?;
    let mut config: GatewayConfig = match path.extension().and_then(|e| e.to_str()) {
        Some("yaml") | Some("yml") => {
            serde_yaml::from_str(&raw).map_err(|e| format!("parsing YAML config: {}", e))?
        }
        Some("toml") => toml::from_str(&raw).map_err(|e| format!("parsing TOML config: {}", e))?,
        _ => serde_json::from_str(&raw).map_err(|e| format!("parsing JSON config: {}", e))?,
    };
    apply_env_overrides(&mut config);
    config.validate()?;
    Ok(config)
}

fn apply_env_overrides(config: &mut GatewayConfig) {
    for (id, provider) in config.llm_providers.iter_mut() {
        if provider.api_key.as_deref().unwrap_or("").is_empty() {
            let env_key = format!("{}_API_KEY", id.to_uppercase());
            if let Ok(value) = env::var(&env_key) {
                if !value.is_empty() {
                    provider.api_key = Some(value);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_config_toml() -> String {
        r#"
[llm_providers.openai]
type = "open_ai"
model = "gpt-4o-mini"
api_key = ""

[provider_selection]
default_provider = "openai"
fallback_order = ["openai"]
selection_strategy = "balanced"

[budget]
total = 100.0
daily = 10.0
monthly = 50.0
per_request = 1.0
"#
        .to_string()
    }

    #[test]
    fn env_var_resolver_substitutes_prefixed_var() {
        std::env::set_var("LOOM_TEST_TOKEN", "abc123");
        let resolver = EnvVarResolver;
        assert_eq!(resolver.resolve("ENV_LOOM_TEST_TOKEN"), "abc123");
        assert_eq!(resolver.resolve("${LOOM_TEST_TOKEN}"), "abc123");
        std::env::remove_var("LOOM_TEST_TOKEN");
    }

    #[test]
    fn credential_resolver_looks_up_injected_map() {
        let mut creds = HashMap::new();
        creds.insert("openai".to_string(), "sk-injected".to_string());
        let resolver = CredentialResolver::new(creds);
        assert_eq!(resolver.resolve("CREDENTIAL_openai"), "sk-injected");
        assert_eq!(resolver.resolve("CREDENTIAL_missing"), "CREDENTIAL_missing");
    }

    #[test]
    fn load_config_applies_env_override_when_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("loom.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(sample_config_toml().as_bytes()).unwrap();

        std::env::set_var("OPENAI_API_KEY", "sk-from-env");
        let config = load_config(&path).unwrap();
        std::env::remove_var("OPENAI_API_KEY");

        assert_eq!(
            config.llm_providers["openai"].api_key.as_deref(),
            Some("sk-from-env")
        );
    }

    #[test]
    fn validate_rejects_unknown_default_provider() {
        let mut config: GatewayConfig = {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("loom.toml");
            std::fs::write(&path, sample_config_toml()).unwrap();
            load_config(&path).unwrap()
        };
        config.provider_selection.default_provider = "missing".to_string();
        assert!(config.validate().is_err());
    }
}
