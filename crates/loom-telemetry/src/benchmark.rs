use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, Semaphore};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BenchmarkType {
    Latency,
    Throughput,
    Load,
    Stress,
    Endurance,
    Functional,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkConfig {
    #[serde(rename = "type")]
    pub kind: BenchmarkType,
    pub iterations: usize,
    pub warmup_iterations: usize,
    pub concurrency: usize,
    pub timeout_seconds: u64,
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BenchmarkStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub iteration: usize,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkResult {
    pub id: String,
    pub config: BenchmarkConfig,
    pub status: BenchmarkStatus,
    pub start_time: chrono::DateTime<chrono::Utc>,
    pub end_time: Option<chrono::DateTime<chrono::Utc>>,
    pub samples: HashMap<String, Vec<f64>>,
    pub errors: Vec<ErrorRecord>,
}

#[derive(Debug, Clone)]
pub struct RegressionFlag {
    pub metric: String,
    pub relative_change: f64,
}

#[derive(Debug, Clone)]
pub struct Comparison {
    pub mean_deltas: HashMap<String, f64>,
    pub regressions: Vec<RegressionFlag>,
}

pub type BenchmarkOutput = HashMap<String, f64>;
type BenchmarkFuture = Pin<Box<dyn Future<Output = Result<BenchmarkOutput>> + Send>>;
pub type BenchmarkFn = Arc<dyn Fn() -> BenchmarkFuture + Send + Sync>;

/// Registers named benchmark callables and runs them under a warmup +
/// iteration + concurrency + timeout envelope, persisting completed results
/// as JSON (§4.7).
pub struct BenchmarkHarness {
    benchmarks: RwLock<HashMap<String, BenchmarkFn>>,
    storage_path: Option<PathBuf>,
    regression_threshold: f64,
}

impl BenchmarkHarness {
    pub fn new(storage_path: Option<PathBuf>) -> Self {
        Self {
            benchmarks: RwLock::new(HashMap::new()),
            storage_path,
            regression_threshold: 0.10,
        }
    }

    pub fn with_regression_threshold(mut self, threshold: f64) -> Self {
        self.regression_threshold = threshold;
        self
    }

    pub async fn register<F, Fut>(&self, name: impl Into<String>, benchmark: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<BenchmarkOutput>> + Send + 'static,
    {
        let boxed: BenchmarkFn = Arc::new(move || Box::pin(benchmark()));
        self.benchmarks.write().await.insert(name.into(), boxed);
    }

    /// Warmup runs are executed first (errors logged, never recorded), then
    /// `config.iterations` runs proceed honoring `concurrency`, the whole
    /// run bounded by `timeout_seconds`. Per-iteration latency is always
    /// recorded under the `latency_ms` sample series.
    pub async fn run(&self, name: &str, config: BenchmarkConfig) -> Result<BenchmarkResult> {
        let benchmark = self
            .benchmarks
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow!("no benchmark registered under name '{name}'"))?;

        let id = Uuid::new_v4().to_string();
        let start_time = chrono::Utc::now();

        for _ in 0..config.warmup_iterations {
            if let Err(err) = benchmark().await {
                log::warn!("benchmark '{name}' warmup iteration failed: {err}");
            }
        }

        let timeout = Duration::from_secs(config.timeout_seconds);
        let run_future = Self::run_iterations(benchmark, config.iterations, config.concurrency);

        let (samples, errors, timed_out) = match tokio::time::timeout(timeout, run_future).await {
            Ok((samples, errors)) => (samples, errors, false),
            Err(_) => (HashMap::new(), Vec::new(), true),
        };

        let status = if timed_out {
            BenchmarkStatus::Failed
        } else if !errors.is_empty() && samples.get("latency_ms").map(|v| v.is_empty()).unwrap_or(true) {
            BenchmarkStatus::Failed
        } else {
            BenchmarkStatus::Completed
        };

        let result = BenchmarkResult {
            id,
            config,
            status,
            start_time,
            end_time: Some(chrono::Utc::now()),
            samples,
            errors,
        };

        if result.status == BenchmarkStatus::Completed {
            self.persist(&result).await?;
        }

        Ok(result)
    }

    async fn run_iterations(
        benchmark: BenchmarkFn,
        iterations: usize,
        concurrency: usize,
    ) -> (HashMap<String, Vec<f64>>, Vec<ErrorRecord>) {
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
        let mut handles = Vec::with_capacity(iterations);

        for iteration in 0..iterations {
            let permit = semaphore.clone().acquire_owned().await.expect("semaphore open");
            let benchmark = benchmark.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                let started = Instant::now();
                let outcome = benchmark().await;
                let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
                (iteration, latency_ms, outcome)
            }));
        }

        let mut samples: HashMap<String, Vec<f64>> = HashMap::new();
        let mut errors = Vec::new();

        for handle in handles {
            match handle.await {
                Ok((_iteration, latency_ms, Ok(extra))) => {
                    samples.entry("latency_ms".to_string()).or_default().push(latency_ms);
                    for (metric, value) in extra {
                        samples.entry(metric).or_default().push(value);
                    }
                }
                Ok((iteration, _latency_ms, Err(err))) => {
                    errors.push(ErrorRecord {
                        iteration,
                        message: err.to_string(),
                    });
                }
                Err(join_err) => {
                    errors.push(ErrorRecord {
                        iteration: usize::MAX,
                        message: join_err.to_string(),
                    });
                }
            }
        }

        (samples, errors)
    }

    async fn persist(&self, result: &BenchmarkResult) -> Result<()> {
        let Some(dir) = &self.storage_path else {
            return Ok(());
        };
        tokio::fs::create_dir_all(dir).await.context("creating results_store directory")?;
        let path = dir.join(format!("{}.json", result.id));
        let json = serde_json::to_vec_pretty(result).context("serializing benchmark result")?;
        tokio::fs::write(path, json).await.context("writing benchmark result")?;
        Ok(())
    }

    /// Per-metric mean deltas between two results; flags a regression when
    /// the relative change exceeds `regression_threshold` (default 10%).
    pub fn compare(&self, a: &BenchmarkResult, b: &BenchmarkResult) -> Comparison {
        let mut mean_deltas = HashMap::new();
        let mut regressions = Vec::new();

        for (metric, a_samples) in &a.samples {
            let Some(b_samples) = b.samples.get(metric) else {
                continue;
            };
            let mean_a = mean(a_samples);
            let mean_b = mean(b_samples);
            let delta = mean_b - mean_a;
            mean_deltas.insert(metric.clone(), delta);

            if mean_a.abs() > f64::EPSILON {
                let relative_change = delta / mean_a;
                if relative_change.abs() > self.regression_threshold {
                    regressions.push(RegressionFlag {
                        metric: metric.clone(),
                        relative_change,
                    });
                }
            }
        }

        Comparison { mean_deltas, regressions }
    }
}

fn mean(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        0.0
    } else {
        samples.iter().sum::<f64>() / samples.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(iterations: usize) -> BenchmarkConfig {
        BenchmarkConfig {
            kind: BenchmarkType::Latency,
            iterations,
            warmup_iterations: 1,
            concurrency: 4,
            timeout_seconds: 5,
            parameters: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn run_records_latency_for_every_iteration() {
        let harness = BenchmarkHarness::new(None);
        harness.register("noop", || async { Ok(HashMap::new()) }).await;
        let result = harness.run("noop", config(5)).await.unwrap();
        assert_eq!(result.status, BenchmarkStatus::Completed);
        assert_eq!(result.samples["latency_ms"].len(), 5);
    }

    #[tokio::test]
    async fn timeout_marks_run_failed() {
        let harness = BenchmarkHarness::new(None);
        harness
            .register("slow", || async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(HashMap::new())
            })
            .await;
        let mut cfg = config(20);
        cfg.timeout_seconds = 0;
        cfg.concurrency = 1;
        let result = harness.run("slow", cfg).await.unwrap();
        assert_eq!(result.status, BenchmarkStatus::Failed);
    }

    #[tokio::test]
    async fn compare_same_result_yields_no_regression() {
        let harness = BenchmarkHarness::new(None);
        harness.register("noop", || async { Ok(HashMap::new()) }).await;
        let result = harness.run("noop", config(10)).await.unwrap();
        let comparison = harness.compare(&result, &result);
        assert!(comparison.regressions.is_empty());
    }

    #[tokio::test]
    async fn compare_flags_regression_above_threshold() {
        let harness = BenchmarkHarness::new(None);
        let mut a = BenchmarkResult {
            id: "a".to_string(),
            config: config(1),
            status: BenchmarkStatus::Completed,
            start_time: chrono::Utc::now(),
            end_time: None,
            samples: HashMap::new(),
            errors: vec![],
        };
        a.samples.insert("latency_ms".to_string(), vec![100.0, 100.0]);
        let mut b = a.clone();
        b.samples.insert("latency_ms".to_string(), vec![200.0, 200.0]);
        let comparison = harness.compare(&a, &b);
        assert_eq!(comparison.regressions.len(), 1);
        assert_eq!(comparison.regressions[0].metric, "latency_ms");
    }
}
