use anyhow::Result;
use loom_gateway::Gateway;

pub async fn run(gateway: &Gateway) -> Result<()> {
    match gateway.prometheus_exporter() {
        Some(exporter) => print!("{}", exporter.gather_text()?),
        None => println!("prometheus export is disabled (monitoring.enable_prometheus = false)"),
    }
    Ok(())
}
