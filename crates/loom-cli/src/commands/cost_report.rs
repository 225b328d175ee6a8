use anyhow::Result;
use loom_gateway::Gateway;

pub async fn run(gateway: &Gateway) -> Result<()> {
    let cost_guard = gateway.cost_guard();
    println!("total spent: {:.4}", cost_guard.total_spent().await);
    println!("ledger entries: {}", cost_guard.log_len().await);

    let alerts = cost_guard.check_alerts().await;
    if alerts.is_empty() {
        println!("no active budget alerts");
    } else {
        for alert in alerts {
            println!("[{:?}] {} window at {:.1}% of budget", alert.level, alert.window, alert.ratio * 100.0);
        }
    }

    for suggestion in cost_guard.optimization_suggestions().await {
        println!("suggestion (priority {}): {}", suggestion.priority, suggestion.message);
    }

    Ok(())
}
