use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Datelike, Duration as ChronoDuration, Utc};
use loom_core::{BudgetLimit, CostRecord, ProviderPricing, Request, Response, Usage};
use tokio::sync::RwLock;
use uuid::Uuid;

const MAX_LOG_ENTRIES: usize = 1000;
const RECENT_WINDOW_DAYS: i64 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
    Exceeded,
}

impl AlertLevel {
    fn from_ratio(ratio: f64) -> Self {
        if ratio >= 1.0 {
            AlertLevel::Exceeded
        } else if ratio >= 0.9 {
            AlertLevel::Critical
        } else if ratio >= 0.8 {
            AlertLevel::Warning
        } else {
            AlertLevel::Info
        }
    }
}

#[derive(Debug, Clone)]
pub struct BudgetAlert {
    pub level: AlertLevel,
    pub window: &'static str,
    pub ratio: f64,
    pub hour_bucket: i64,
}

#[derive(Debug, Clone)]
pub struct OptimizationSuggestion {
    pub priority: u8,
    pub message: String,
}

/// Default price (USD per 1k tokens) when neither the model nor the
/// provider has a pricing entry.
#[derive(Debug, Clone, Copy)]
pub struct DefaultPricing {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

impl Default for DefaultPricing {
    fn default() -> Self {
        Self {
            input_per_1k: 0.002,
            output_per_1k: 0.002,
        }
    }
}

struct Inner {
    log: VecDeque<CostRecord>,
    last_alert_bucket: HashMap<(&'static str, AlertLevel), i64>,
}

/// Append-only billing ledger plus the budget veto, alerting, and
/// optimization-advice logic of §4.4. A cache hit never reaches `charge`.
pub struct CostGuard {
    budget: BudgetLimit,
    pricing: HashMap<String, ProviderPricing>,
    default_pricing: DefaultPricing,
    alert_cooldown_secs: i64,
    inner: RwLock<Inner>,
}

impl CostGuard {
    pub fn new(budget: BudgetLimit, pricing: HashMap<String, ProviderPricing>, alert_cooldown_secs: i64) -> Self {
        Self {
            budget,
            pricing,
            default_pricing: DefaultPricing::default(),
            alert_cooldown_secs,
            inner: RwLock::new(Inner {
                log: VecDeque::with_capacity(MAX_LOG_ENTRIES),
                last_alert_bucket: HashMap::new(),
            }),
        }
    }

    pub fn estimate_cost(&self, provider: &str, model: &str, usage: Usage) -> f64 {
        let pricing = self
            .pricing
            .get(provider)
            .and_then(|p| p.lookup(model))
            .unwrap_or_else(|| loom_core::ModelPricing {
                input_per_1k: self.default_pricing.input_per_1k,
                output_per_1k: self.default_pricing.output_per_1k,
            });
        (usage.prompt_tokens as f64 / 1000.0) * pricing.input_per_1k
            + (usage.completion_tokens as f64 / 1000.0) * pricing.output_per_1k
    }

    /// Estimate the cost of `request` before dispatch, using a content-length
    /// based token estimate since no usage is known yet.
    pub fn estimate_request_cost(&self, provider: &str, model: &str, request: &Request) -> f64 {
        let usage = Usage::estimate_from_content(&request.prompt);
        self.estimate_cost(provider, model, usage)
    }

    /// Provider-agnostic cost estimate for the budget gate (§4.1 phase 1),
    /// which runs before a provider has been selected. Uses the default
    /// per-1k pricing rather than any specific provider/model entry.
    pub fn estimate_default_cost(&self, request: &Request) -> f64 {
        let usage = Usage::estimate_from_content(&request.prompt);
        (usage.prompt_tokens as f64 / 1000.0) * self.default_pricing.input_per_1k
            + (usage.completion_tokens as f64 / 1000.0) * self.default_pricing.output_per_1k
    }

    /// `(allowed, reason)` per the four-window veto in §4.4.
    pub async fn can_make(&self, est_cost: f64) -> (bool, Option<String>) {
        if est_cost > self.budget.per_request {
            return (
                false,
                Some(format!(
                    "estimated cost {:.4} exceeds per-request limit {:.4}",
                    est_cost, self.budget.per_request
                )),
            );
        }

        let inner = self.inner.read().await;
        let now = Utc::now();
        let total: f64 = inner.log.iter().map(|r| r.cost_usd).sum();
        let daily = Self::window_sum(&inner.log, now, Self::same_day);
        let monthly = Self::window_sum(&inner.log, now, Self::same_month);

        if total + est_cost > self.budget.total {
            return (false, Some("estimated cost would exceed total budget".to_string()));
        }
        if daily + est_cost > self.budget.daily {
            return (false, Some("estimated cost would exceed daily limit".to_string()));
        }
        if monthly + est_cost > self.budget.monthly {
            return (false, Some("estimated cost would exceed monthly limit".to_string()));
        }
        (true, None)
    }

    fn same_day(a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
        a.date_naive() == b.date_naive()
    }

    fn same_month(a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
        a.year() == b.year() && a.month() == b.month()
    }

    fn window_sum(log: &VecDeque<CostRecord>, now: DateTime<Utc>, same_window: fn(DateTime<Utc>, DateTime<Utc>) -> bool) -> f64 {
        log.iter()
            .filter(|r| same_window(r.timestamp, now))
            .map(|r| r.cost_usd)
            .sum()
    }

    /// Record a successful dispatch. Never called for degraded responses or
    /// cache hits (§7, "cost records never recorded for degraded responses").
    pub async fn charge(&self, provider: &str, response: &Response, request_id: Uuid) -> f64 {
        let cost = self.estimate_cost(provider, &response.model, response.usage);
        let record = CostRecord {
            timestamp: Utc::now(),
            provider: provider.to_string(),
            model: response.model.clone(),
            input_tokens: response.usage.prompt_tokens,
            output_tokens: response.usage.completion_tokens,
            cost_usd: cost,
            request_id,
            meta: HashMap::new(),
        };

        let mut inner = self.inner.write().await;
        if inner.log.len() >= MAX_LOG_ENTRIES {
            inner.log.pop_front();
        }
        inner.log.push_back(record);
        cost
    }

    /// Evaluate current usage ratios against all four windows and return any
    /// alerts not suppressed by `alert_cooldown_secs` within their hour bucket.
    pub async fn check_alerts(&self) -> Vec<BudgetAlert> {
        let mut inner = self.inner.write().await;
        let now = Utc::now();
        let total: f64 = inner.log.iter().map(|r| r.cost_usd).sum();
        let daily = Self::window_sum(&inner.log, now, Self::same_day);
        let monthly = Self::window_sum(&inner.log, now, Self::same_month);

        let windows = [
            ("total", total / self.budget.total.max(f64::MIN_POSITIVE)),
            ("daily", daily / self.budget.daily.max(f64::MIN_POSITIVE)),
            ("monthly", monthly / self.budget.monthly.max(f64::MIN_POSITIVE)),
        ];

        let hour_bucket = now.timestamp() / 3600;
        let mut alerts = Vec::new();
        for (window, ratio) in windows {
            let level = AlertLevel::from_ratio(ratio);
            let key = (window, level);
            let last_bucket = inner.last_alert_bucket.get(&key).copied();
            let cooldown_buckets = (self.alert_cooldown_secs / 3600).max(1);
            if last_bucket.map(|b| hour_bucket - b < cooldown_buckets).unwrap_or(false) {
                continue;
            }
            inner.last_alert_bucket.insert(key, hour_bucket);
            alerts.push(BudgetAlert {
                level,
                window,
                ratio,
                hour_bucket,
            });
        }
        alerts
    }

    /// Scan the last 7 days and emit structured advice, sorted most-urgent
    /// first (§4.4, "Optimization suggestions").
    pub async fn optimization_suggestions(&self) -> Vec<OptimizationSuggestion> {
        let inner = self.inner.read().await;
        let cutoff = Utc::now() - ChronoDuration::days(RECENT_WINDOW_DAYS);
        let recent: Vec<&CostRecord> = inner.log.iter().filter(|r| r.timestamp >= cutoff).collect();
        if recent.is_empty() {
            return Vec::new();
        }

        let total: f64 = recent.iter().map(|r| r.cost_usd).sum();
        let mut suggestions = Vec::new();

        let mut by_provider: HashMap<&str, f64> = HashMap::new();
        for r in &recent {
            *by_provider.entry(r.provider.as_str()).or_default() += r.cost_usd;
        }
        for (provider, cost) in &by_provider {
            if total > 0.0 && cost / total > 0.5 {
                suggestions.push(OptimizationSuggestion {
                    priority: 1,
                    message: format!("provider '{}' accounts for over 50% of recent spend", provider),
                });
            }
        }

        let mut by_model: HashMap<&str, f64> = HashMap::new();
        for r in &recent {
            *by_model.entry(r.model.as_str()).or_default() += r.cost_usd;
        }
        for (model, cost) in &by_model {
            if total > 0.0 && cost / total > 0.3 {
                suggestions.push(OptimizationSuggestion {
                    priority: 2,
                    message: format!("model '{}' accounts for over 30% of recent spend", model),
                });
            }
        }

        let means: Vec<f64> = by_provider.values().copied().collect();
        let max = means.iter().cloned().reduce(f64::max);
        let min = means.iter().cloned().reduce(f64::min);
        if let (Some(max), Some(min)) = (max, min) {
            if min > 0.0 && max / min > 2.0 {
                suggestions.push(OptimizationSuggestion {
                    priority: 3,
                    message: "consider shifting to cheaper provider where quality allows".to_string(),
                });
            }
        }

        suggestions.sort_by_key(|s| s.priority);
        suggestions
    }

    pub async fn log_len(&self) -> usize {
        self.inner.read().await.log.len()
    }

    pub async fn total_spent(&self) -> f64 {
        self.inner.read().await.log.iter().map(|r| r.cost_usd).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loom_core::{ResponseMeta, Usage};

    fn guard_with_budget(per_request: f64) -> CostGuard {
        CostGuard::new(
            BudgetLimit {
                total: 100.0,
                daily: 50.0,
                monthly: 80.0,
                per_request,
            },
            HashMap::new(),
            3600,
        )
    }

    #[tokio::test]
    async fn per_request_zero_vetoes_any_positive_cost() {
        let guard = guard_with_budget(0.0);
        let (allowed, reason) = guard.can_make(0.01).await;
        assert!(!allowed);
        assert!(reason.is_some());
    }

    #[tokio::test]
    async fn charge_is_reflected_in_total_spent() {
        let guard = guard_with_budget(10.0);
        let response = Response {
            content: "hi".to_string(),
            model: "gpt-4".to_string(),
            usage: Usage::new(100, 50),
            meta: ResponseMeta {
                provider: "openai".to_string(),
                request_id: Uuid::new_v4(),
                finish_reason: None,
                degraded: false,
                thinking_enabled: None,
            },
        };
        let cost = guard.charge("openai", &response, Uuid::new_v4()).await;
        assert!(cost > 0.0);
        assert_eq!(guard.total_spent().await, cost);
        assert_eq!(guard.log_len().await, 1);
    }

    #[tokio::test]
    async fn log_is_capped_at_max_entries() {
        let guard = guard_with_budget(1000.0);
        for _ in 0..(MAX_LOG_ENTRIES + 10) {
            let response = Response {
                content: "hi".to_string(),
                model: "gpt-4".to_string(),
                usage: Usage::new(1, 1),
                meta: ResponseMeta {
                    provider: "openai".to_string(),
                    request_id: Uuid::new_v4(),
                    finish_reason: None,
                    degraded: false,
                    thinking_enabled: None,
                },
            };
            guard.charge("openai", &response, Uuid::new_v4()).await;
        }
        assert_eq!(guard.log_len().await, MAX_LOG_ENTRIES);
    }

    #[tokio::test]
    async fn second_alert_within_cooldown_is_suppressed() {
        let guard = CostGuard::new(
            BudgetLimit {
                total: 1.0,
                daily: 1.0,
                monthly: 1.0,
                per_request: 1.0,
            },
            HashMap::new(),
            3600,
        );
        let response = Response {
            content: "hi".to_string(),
            model: "gpt-4".to_string(),
            usage: Usage::new(1_000_000, 1_000_000),
            meta: ResponseMeta {
                provider: "openai".to_string(),
                request_id: Uuid::new_v4(),
                finish_reason: None,
                degraded: false,
                thinking_enabled: None,
            },
        };
        guard.charge("openai", &response, Uuid::new_v4()).await;
        let first = guard.check_alerts().await;
        assert!(!first.is_empty());
        let second = guard.check_alerts().await;
        assert!(second.is_empty());
    }
}
