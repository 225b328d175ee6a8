use std::collections::HashMap;
use std::time::Duration;

use loom_core::{Alert, AlertSeverity, Metric, MetricKind};
use log::warn;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CompareOp {
    GreaterThan,
    LessThan,
    GreaterOrEqual,
    LessOrEqual,
    Equal,
    NotEqual,
}

impl CompareOp {
    fn holds(self, value: f64, threshold: f64) -> bool {
        match self {
            CompareOp::GreaterThan => value > threshold,
            CompareOp::LessThan => value < threshold,
            CompareOp::GreaterOrEqual => value >= threshold,
            CompareOp::LessOrEqual => value <= threshold,
            CompareOp::Equal => (value - threshold).abs() < f64::EPSILON,
            CompareOp::NotEqual => (value - threshold).abs() >= f64::EPSILON,
        }
    }
}

/// A compiled rule: `{match:{kind?,name?}, compare:{op,threshold}, severity,
/// message_template, cooldown}` (§4.6).
#[derive(Debug, Clone)]
pub struct AlertRule {
    pub name: String,
    pub match_kind: Option<MetricKind>,
    pub match_name: Option<String>,
    pub op: CompareOp,
    pub threshold: f64,
    pub severity: AlertSeverity,
    pub message_template: String,
    pub cooldown: Duration,
}

impl AlertRule {
    fn matches(&self, metric: &Metric) -> bool {
        self.match_kind.map(|k| k == metric.kind).unwrap_or(true)
            && self.match_name.as_deref().map(|n| n == metric.name).unwrap_or(true)
    }

    fn render(&self, metric: &Metric) -> String {
        self.message_template
            .replace("{name}", &metric.name)
            .replace("{value}", &format!("{:.4}", metric.value))
            .replace("{threshold}", &format!("{:.4}", self.threshold))
    }
}

/// Where a fired alert is delivered. Delivery failure never blocks metric
/// ingestion (§4.6) -- sinks are best-effort.
#[async_trait::async_trait]
pub trait AlertSink: Send + Sync {
    async fn deliver(&self, alert: &Alert);
}

pub struct LogSink;

#[async_trait::async_trait]
impl AlertSink for LogSink {
    async fn deliver(&self, alert: &Alert) {
        warn!("[{:?}] {}", alert.severity, alert.message);
    }
}

pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait::async_trait]
impl AlertSink for WebhookSink {
    async fn deliver(&self, alert: &Alert) {
        let payload = serde_json::json!({
            "id": alert.id,
            "severity": alert.severity,
            "message": alert.message,
            "triggering_metric": alert.triggering_metric,
            "triggered_at": alert.triggered_at,
        });
        if let Err(err) = self.client.post(&self.url).json(&payload).send().await {
            warn!("alert webhook delivery failed: {err}");
        }
    }
}

/// Evaluates incoming metrics against a set of compiled rules and fans out
/// fired alerts to sinks, suppressing repeats per rule+metric-identity
/// within `cooldown` (§4.6).
pub struct AlertEngine {
    rules: Vec<AlertRule>,
    sinks: Vec<Box<dyn AlertSink>>,
    last_fired: Mutex<HashMap<(String, String), chrono::DateTime<chrono::Utc>>>,
}

impl AlertEngine {
    pub fn new(rules: Vec<AlertRule>, sinks: Vec<Box<dyn AlertSink>>) -> Self {
        Self {
            rules,
            sinks,
            last_fired: Mutex::new(HashMap::new()),
        }
    }

    /// Evaluates `metric` against every matching rule, returning the alerts
    /// that fired (after cooldown suppression) and delivering each to every
    /// sink. A sink error is logged and does not prevent the others from
    /// running or the metric from having been processed.
    pub async fn check(&self, metric: &Metric) -> Vec<Alert> {
        let mut fired = Vec::new();
        let mut last_fired = self.last_fired.lock().await;

        for rule in &self.rules {
            if !rule.matches(metric) {
                continue;
            }
            if !rule.op.holds(metric.value, rule.threshold) {
                continue;
            }

            let identity = (rule.name.clone(), metric.name.clone());
            let now = chrono::Utc::now();
            if let Some(last) = last_fired.get(&identity) {
                let elapsed = now.signed_duration_since(*last);
                if elapsed.num_milliseconds() >= 0
                    && (elapsed.num_milliseconds() as u128) < rule.cooldown.as_millis()
                {
                    continue;
                }
            }
            last_fired.insert(identity, now);

            let alert = Alert {
                id: Uuid::new_v4(),
                severity: rule.severity,
                message: rule.render(metric),
                triggering_metric: Some(metric.name.clone()),
                triggered_at: now,
                resolved_at: None,
            };
            fired.push(alert);
        }
        drop(last_fired);

        for alert in &fired {
            for sink in &self.sinks {
                sink.deliver(alert).await;
            }
        }

        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(threshold: f64, cooldown_ms: u64) -> AlertRule {
        AlertRule {
            name: "high_error_rate".to_string(),
            match_kind: Some(MetricKind::ErrorRate),
            match_name: None,
            op: CompareOp::GreaterThan,
            threshold,
            severity: AlertSeverity::Warning,
            message_template: "{name} at {value}, over {threshold}".to_string(),
            cooldown: Duration::from_millis(cooldown_ms),
        }
    }

    #[tokio::test]
    async fn metric_above_threshold_fires_alert() {
        let engine = AlertEngine::new(vec![rule(0.1, 60_000)], vec![]);
        let metric = Metric::new("error_rate", 0.5, MetricKind::ErrorRate);
        let fired = engine.check(&metric).await;
        assert_eq!(fired.len(), 1);
        assert!(fired[0].message.contains("0.5000"));
    }

    #[tokio::test]
    async fn metric_below_threshold_does_not_fire() {
        let engine = AlertEngine::new(vec![rule(0.9, 60_000)], vec![]);
        let metric = Metric::new("error_rate", 0.5, MetricKind::ErrorRate);
        assert!(engine.check(&metric).await.is_empty());
    }

    #[tokio::test]
    async fn second_fire_within_cooldown_is_suppressed() {
        let engine = AlertEngine::new(vec![rule(0.1, 60_000)], vec![]);
        let metric = Metric::new("error_rate", 0.5, MetricKind::ErrorRate);
        assert_eq!(engine.check(&metric).await.len(), 1);
        assert_eq!(engine.check(&metric).await.len(), 0);
    }

    #[tokio::test]
    async fn non_matching_kind_is_ignored() {
        let engine = AlertEngine::new(vec![rule(0.1, 60_000)], vec![]);
        let metric = Metric::new("latency", 0.5, MetricKind::Latency);
        assert!(engine.check(&metric).await.is_empty());
    }
}
