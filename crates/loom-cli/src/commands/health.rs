use anyhow::Result;
use loom_gateway::Gateway;

pub async fn run(gateway: &Gateway) -> Result<()> {
    let snapshot = gateway.health_snapshot().await;
    if snapshot.is_empty() {
        println!("no providers registered");
        return Ok(());
    }

    for (id, record) in snapshot {
        println!(
            "{id}: healthy={} success_rate={:.2} avg_latency_ms={:.1} p95_latency_ms={:.1} consecutive_failures={}",
            record.healthy,
            record.rolling_success_rate,
            record.avg_latency_ms,
            record.p95_latency_ms,
            record.consecutive_failures,
        );
    }

    Ok(())
}
