mod args;
mod assembly;
mod commands;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Error, Result};
use clap::Parser;
use log::info;

use args::{LoomArgs, LoomCommand};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = LoomArgs::parse();

    let config_path = Path::new(&args.config);
    let config = loom_core::config::load_config(config_path).map_err(Error::msg)?;
    let config_dir = config_path.parent().unwrap_or_else(|| Path::new("."));

    let gateway = Arc::new(assembly::build_gateway(&config, config_dir).await?);
    info!("gateway ready with {} configured provider(s)", config.llm_providers.len());

    match args.command {
        LoomCommand::Generate { prompt, provider, session_class } => {
            commands::generate::run(&gateway, prompt, provider, session_class).await?;
        }
        LoomCommand::Health => {
            commands::health::run(&gateway).await?;
        }
        LoomCommand::CostReport => {
            commands::cost_report::run(&gateway).await?;
        }
        LoomCommand::Metrics => {
            commands::metrics::run(&gateway).await?;
        }
        LoomCommand::Benchmark { name, iterations, concurrency } => {
            commands::benchmark::run(gateway.clone(), name, iterations, concurrency).await?;
        }
    }

    Ok(())
}
