mod bias;
mod config;
mod error;
mod group;
mod ids;
mod ingest;
mod models;
mod pipeline;
mod summarize;

use clap::Parser;
use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Scheduled news-processing engine: fetch outlets, group shared stories,
/// synthesize cited summaries and audit for bias indicators.
#[derive(Parser)]
#[command(name = "talkless", version)]
struct Cli {
    /// Path to the pipeline configuration file.
    #[arg(long)]
    config: std::path::PathBuf,

    /// Run one pipeline pass and exit (the default).
    #[arg(long, conflicts_with = "scheduled")]
    once: bool,

    /// Keep running a pass on the configured interval.
    #[arg(long)]
    scheduled: bool,
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    if config::env_var("DB_URL").is_some() {
        tracing::debug!("DB_URL is set; persistence is handled by the serving collaborator");
    }

    // Configuration problems are the only failures that reach the exit code;
    // per-source and per-group trouble stays inside the run report.
    let config = config::EngineConfig::load(&cli.config)?;
    let orchestrator = pipeline::Orchestrator::from_config(config)?;

    let scheduled = cli.scheduled && !cli.once;
    if scheduled {
        let interval = orchestrator.schedule_interval();
        tracing::info!(?interval, "Running on a schedule");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = orchestrator.run().await {
                tracing::error!(?err, "Pipeline run failed");
            }
        }
    }

    let output = orchestrator.run().await?;
    tracing::info!(
        articles = output.articles.len(),
        groups = output.groups.len(),
        summaries = output.summaries.len(),
        failures = output.report.failures.len(),
        "Run complete"
    );
    Ok(())
}

fn init_tracing() {
    let filter = config::env_var("LOG_LEVEL")
        .or_else(|| config::env_var("RUST_LOG"))
        .unwrap_or_else(|| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .init();
}
