use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use loom_core::Request;
use loom_gateway::Gateway;
use loom_telemetry::{BenchmarkConfig, BenchmarkHarness, BenchmarkType};

pub async fn run(gateway: Arc<Gateway>, name: String, iterations: usize, concurrency: usize) -> Result<()> {
    let harness = BenchmarkHarness::new(None);
    let gateway_for_bench = gateway.clone();
    let bench_name = name.clone();
    harness
        .register(bench_name.clone(), move || {
            let gateway = gateway_for_bench.clone();
            let prompt = bench_name.clone();
            async move {
                let request = Request::new(format!("benchmark prompt for {prompt}"));
                gateway
                    .generate(request)
                    .await
                    .map(|_| HashMap::new())
                    .map_err(|e| anyhow!("generate failed: {e}"))
            }
        })
        .await;

    let config = BenchmarkConfig {
        kind: BenchmarkType::Latency,
        iterations,
        warmup_iterations: (iterations / 10).max(1),
        concurrency,
        timeout_seconds: 60,
        parameters: HashMap::new(),
    };

    let result = harness.run(&name, config).await?;
    println!("status: {:?}", result.status);
    if let Some(latencies) = result.samples.get("latency_ms") {
        let mean = latencies.iter().sum::<f64>() / latencies.len().max(1) as f64;
        println!("iterations: {} mean_latency_ms: {:.2}", latencies.len(), mean);
    }
    if !result.errors.is_empty() {
        println!("errors: {}", result.errors.len());
    }

    Ok(())
}
