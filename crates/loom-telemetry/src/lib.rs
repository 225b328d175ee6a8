pub mod alerts;
pub mod benchmark;
pub mod metric_store;
pub mod prometheus_exporter;
pub mod resources;

pub use alerts::{AlertEngine, AlertRule, AlertSink, CompareOp, LogSink, WebhookSink};
pub use benchmark::{
    BenchmarkConfig, BenchmarkFn, BenchmarkHarness, BenchmarkResult, BenchmarkStatus, BenchmarkType,
    Comparison, ErrorRecord, RegressionFlag,
};
pub use metric_store::{MetricStore, MetricStoreStats};
pub use prometheus_exporter::PrometheusExporter;
pub use resources::{Issue, IssueKind, IssueSeverity, ResourceAnalyzer, ResourceSample, ResourceThresholds};
