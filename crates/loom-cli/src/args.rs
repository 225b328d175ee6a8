use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "loom-cli", about = "Command-line client for the loom LLM gateway")]
pub struct LoomArgs {
    #[arg(short, long, value_name = "FILE", default_value = "loom.toml")]
    pub config: String,

    #[command(subcommand)]
    pub command: LoomCommand,
}

#[derive(Subcommand, Debug)]
pub enum LoomCommand {
    /// Send a single prompt through the gateway and print the response.
    Generate {
        #[arg(help = "The prompt to send")]
        prompt: String,

        #[arg(short, long, help = "Preferred provider id, overrides selection")]
        provider: Option<String>,

        #[arg(short, long, help = "Session class used for routing")]
        session_class: Option<String>,
    },

    /// Print the health snapshot for every registered provider.
    Health,

    /// Print the current cost guard totals and recent alerts.
    CostReport,

    /// Print the Prometheus text exposition for the metrics gathered so far.
    Metrics,

    /// Run a registered benchmark and print the result summary.
    Benchmark {
        #[arg(help = "Name of the benchmark to run")]
        name: String,

        #[arg(long, default_value_t = 10)]
        iterations: usize,

        #[arg(long, default_value_t = 1)]
        concurrency: usize,
    },
}
