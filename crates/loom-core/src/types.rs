use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Selection priority a caller attaches to a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Cost,
    Speed,
    Quality,
    Balanced,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Balanced
    }
}

/// The kind of backend a provider talks to. The adapter implementation is
/// chosen once at registration time and stored alongside the handle; see
/// `loom_providers::Adapter`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    Google,
    Azure,
    DeepSeek,
    Local,
}

/// Caller-supplied routing policy. `preferred_provider` always wins over
/// `session_class` when both are present (see DESIGN.md).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Policy {
    #[serde(default)]
    pub priority: Priority,
    pub session_class: Option<String>,
    pub preferred_provider: Option<String>,
    pub estimated_cost: Option<f64>,
    pub deadline_ms: Option<u64>,
}

/// Immutable input to the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub prompt: String,
    #[serde(default)]
    pub params: HashMap<String, Value>,
    #[serde(default)]
    pub policy: Policy,
    #[serde(default = "Uuid::new_v4")]
    pub request_id: Uuid,
}

impl Request {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            params: HashMap::new(),
            policy: Policy::default(),
            request_id: Uuid::new_v4(),
        }
    }

    pub fn with_policy(mut self, policy: Policy) -> Self {
        self.policy = policy;
        self
    }

    /// Canonical key material for cache lookups: params are serialized
    /// through a sorted `BTreeMap` so that key-insertion order never
    /// produces spurious cache misses (DESIGN.md, cache key normalization).
    pub fn canonical_params(&self) -> String {
        let sorted: std::collections::BTreeMap<_, _> = self.params.iter().collect();
        serde_json::to_string(&sorted).unwrap_or_default()
    }
}

/// Token accounting reported by (or estimated for) a backend.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }

    /// `len(content) / 4` split 50/50, used when a backend does not report
    /// usage at all (§4.4).
    pub fn estimate_from_content(content: &str) -> Self {
        let total = (content.len() as u32 / 4).max(1);
        let prompt = total / 2;
        let completion = total - prompt;
        Self {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: total,
        }
    }
}

/// Metadata attached to a normalized response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMeta {
    pub provider: String,
    pub request_id: Uuid,
    pub finish_reason: Option<String>,
    #[serde(default)]
    pub degraded: bool,
    pub thinking_enabled: Option<bool>,
}

/// Normalized output returned by the gateway, regardless of which backend
/// served it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub content: String,
    pub model: String,
    pub usage: Usage,
    pub meta: ResponseMeta,
}

impl Response {
    pub fn degraded(request_id: Uuid, message: impl Into<String>) -> Self {
        let content = message.into();
        let usage = Usage::estimate_from_content(&content);
        Self {
            content,
            model: "none".to_string(),
            usage,
            meta: ResponseMeta {
                provider: "none".to_string(),
                request_id,
                finish_reason: Some("degraded".to_string()),
                degraded: true,
                thinking_enabled: None,
            },
        }
    }
}

/// Per-(provider, model) pricing, expressed per 1k tokens to match the
/// budgeting math in §4.4.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

/// Pricing table for a single provider: exact model match, then provider
/// default, then the caller's global default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderPricing {
    pub models: HashMap<String, ModelPricing>,
    pub default: Option<ModelPricing>,
}

impl ProviderPricing {
    pub fn lookup(&self, model: &str) -> Option<ModelPricing> {
        self.models.get(model).copied().or(self.default)
    }
}

/// A registered backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderHandle {
    pub id: String,
    pub kind: ProviderKind,
    pub enabled: bool,
    pub model_default: String,
    pub pricing: ProviderPricing,
}

/// Rolling health snapshot for a provider, updated on every completed
/// request (§3, "Health record").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthRecord {
    pub healthy: bool,
    pub last_check: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub rolling_success_rate: f64,
    pub avg_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub last_error_kind: Option<String>,
}

impl Default for HealthRecord {
    fn default() -> Self {
        Self {
            healthy: true,
            last_check: None,
            last_success: None,
            consecutive_failures: 0,
            rolling_success_rate: 1.0,
            avg_latency_ms: 0.0,
            p95_latency_ms: 0.0,
            last_error_kind: None,
        }
    }
}

/// Circuit breaker state machine, transitions documented in §4.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Append-only billing record. `meta` carries free-form context (e.g. the
/// session class that routed the request) for audit purposes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostRecord {
    pub timestamp: DateTime<Utc>,
    pub provider: String,
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost_usd: f64,
    pub request_id: Uuid,
    #[serde(default)]
    pub meta: HashMap<String, String>,
}

/// Multi-window budget limits. All windows are required and positive;
/// `daily`/`monthly` are validated against `total` at config-load time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BudgetLimit {
    pub total: f64,
    pub daily: f64,
    pub monthly: f64,
    pub per_request: f64,
}

impl BudgetLimit {
    pub fn validate(&self) -> Result<(), String> {
        if self.total <= 0.0 || self.daily < 0.0 || self.monthly < 0.0 || self.per_request < 0.0 {
            return Err("all budget limits must be positive".to_string());
        }
        if self.daily > self.total {
            return Err("daily limit must not exceed total".to_string());
        }
        if self.monthly > self.total {
            return Err("monthly limit must not exceed total".to_string());
        }
        Ok(())
    }
}

/// The kind of value a `Metric` carries; used for the MetricStore's
/// secondary index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Latency,
    Throughput,
    ErrorRate,
    Memory,
    Cpu,
    Tokens,
    Cost,
    Custom,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    pub value: f64,
    pub kind: MetricKind,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

impl Metric {
    pub fn new(name: impl Into<String>, value: f64, kind: MetricKind) -> Self {
        Self {
            name: name.into(),
            value,
            kind,
            timestamp: Utc::now(),
            tags: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub severity: AlertSeverity,
    pub message: String,
    pub triggering_metric: Option<String>,
    pub triggered_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_params_ignores_insertion_order() {
        let mut a = Request::new("hello");
        a.params.insert("temperature".into(), Value::from(0.7));
        a.params.insert("top_p".into(), Value::from(0.9));

        let mut b = Request::new("hello");
        b.params.insert("top_p".into(), Value::from(0.9));
        b.params.insert("temperature".into(), Value::from(0.7));

        assert_eq!(a.canonical_params(), b.canonical_params());
    }

    #[test]
    fn usage_estimate_splits_evenly() {
        let usage = Usage::estimate_from_content(&"x".repeat(400));
        assert_eq!(usage.total_tokens, 100);
        assert_eq!(usage.prompt_tokens + usage.completion_tokens, 100);
    }

    #[test]
    fn budget_rejects_daily_above_total() {
        let budget = BudgetLimit {
            total: 10.0,
            daily: 20.0,
            monthly: 10.0,
            per_request: 1.0,
        };
        assert!(budget.validate().is_err());
    }

    #[test]
    fn pricing_falls_back_to_provider_default() {
        let mut pricing = ProviderPricing::default();
        pricing.default = Some(ModelPricing {
            input_per_1k: 0.001,
            output_per_1k: 0.002,
        });
        let looked_up = pricing.lookup("unknown-model").unwrap();
        assert_eq!(looked_up.input_per_1k, 0.001);
    }
}
