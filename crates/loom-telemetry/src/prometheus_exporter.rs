use prometheus::{CounterVec, GaugeVec, HistogramVec, Opts, Registry};

/// Prometheus metric families for the exposition endpoint (§6), all sharing
/// a configurable name prefix and registered against one `Registry` so
/// `gather()`/`TextEncoder` can serve them from a single handler.
pub struct PrometheusExporter {
    registry: Registry,
    pub latency_seconds: HistogramVec,
    pub requests_total: CounterVec,
    pub error_rate: GaugeVec,
    pub memory_usage_bytes: GaugeVec,
    pub cpu_usage_percent: GaugeVec,
    pub tokens_total: CounterVec,
    pub cost_total: CounterVec,
}

impl PrometheusExporter {
    pub fn new(prefix: &str) -> prometheus::Result<Self> {
        let registry = Registry::new();

        let latency_seconds = HistogramVec::new(
            prometheus::HistogramOpts::new(format!("{prefix}latency_seconds"), "request latency in seconds"),
            &["endpoint", "method"],
        )?;
        let requests_total = CounterVec::new(
            Opts::new(format!("{prefix}requests_total"), "total requests processed"),
            &["endpoint", "method", "status"],
        )?;
        let error_rate = GaugeVec::new(
            Opts::new(format!("{prefix}error_rate"), "rolling error rate"),
            &["endpoint"],
        )?;
        let memory_usage_bytes = GaugeVec::new(
            Opts::new(format!("{prefix}memory_usage_bytes"), "memory usage in bytes"),
            &["type"],
        )?;
        let cpu_usage_percent = GaugeVec::new(
            Opts::new(format!("{prefix}cpu_usage_percent"), "cpu usage percent"),
            &[] as &[&str],
        )?;
        let tokens_total = CounterVec::new(
            Opts::new(format!("{prefix}tokens_total"), "total tokens processed"),
            &["provider", "model", "type"],
        )?;
        let cost_total = CounterVec::new(
            Opts::new(format!("{prefix}cost_total"), "total cost in USD"),
            &["provider", "model"],
        )?;

        registry.register(Box::new(latency_seconds.clone()))?;
        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(error_rate.clone()))?;
        registry.register(Box::new(memory_usage_bytes.clone()))?;
        registry.register(Box::new(cpu_usage_percent.clone()))?;
        registry.register(Box::new(tokens_total.clone()))?;
        registry.register(Box::new(cost_total.clone()))?;

        Ok(Self {
            registry,
            latency_seconds,
            requests_total,
            error_rate,
            memory_usage_bytes,
            cpu_usage_percent,
            tokens_total,
            cost_total,
        })
    }

    /// Renders every registered family in the text exposition format.
    pub fn gather_text(&self) -> prometheus::Result<String> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gather_text_includes_prefixed_family_names() {
        let exporter = PrometheusExporter::new("loom_").unwrap();
        exporter
            .requests_total
            .with_label_values(&["/generate", "POST", "200"])
            .inc();
        let text = exporter.gather_text().unwrap();
        assert!(text.contains("loom_requests_total"));
    }

    #[test]
    fn cost_total_accumulates_across_calls() {
        let exporter = PrometheusExporter::new("loom_").unwrap();
        exporter.cost_total.with_label_values(&["openai", "gpt-4"]).inc_by(0.02);
        exporter.cost_total.with_label_values(&["openai", "gpt-4"]).inc_by(0.03);
        assert!((exporter.cost_total.with_label_values(&["openai", "gpt-4"]).get() - 0.05).abs() < 1e-9);
    }
}
