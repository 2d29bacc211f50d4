// Quarry CLI - codebase-intelligence gateway
use anyhow::Result;
use clap::{Parser, Subcommand};

use quarry::confidence::{ConfidenceMeter, ConfidenceTuner};
use quarry::providers::{EmbeddingChain, SynthesisChain};
use quarry::query_metrics::MetricsRecorder;
use quarry::state_store::{FallbackStore, StateStore};
use quarry::{init_logging_with_level, GatewayConfig};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "quarry", about = "Request-coordination gateway for codebase intelligence")]
struct Cli {
    /// Enable debug logging
    #[arg(long, global = true)]
    verbose: bool,

    /// Suppress all output except errors
    #[arg(long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the gateway (default)
    Serve,
    /// Exercise every configured provider once and print a status table.
    /// Exits 0 only when at least one embedding and one synthesis provider work.
    CheckProviders,
    /// Run one offline tuning pass over the recent feedback window.
    TuneConfidence {
        /// Trailing window of metrics to consume, in days
        #[arg(long, default_value_t = 7)]
        window_days: i64,
        /// Where to write recommendations that do not meet the auto-apply gate
        #[arg(long, default_value = "./confidence-recommendations")]
        recommendation_dir: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging_with_level(cli.verbose, cli.quiet)?;

    let config = GatewayConfig::from_env()?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => quarry::start_server(config).await,
        Command::CheckProviders => check_providers(config).await,
        Command::TuneConfidence {
            window_days,
            recommendation_dir,
        } => tune_confidence(config, window_days, &recommendation_dir).await,
    }
}

async fn tune_confidence(
    config: GatewayConfig,
    window_days: i64,
    recommendation_dir: &str,
) -> Result<()> {
    let store = FallbackStore::connect(&config.kv.host, config.kv.port).await;
    let metrics = MetricsRecorder::new(Arc::clone(&store) as Arc<dyn StateStore>);
    let meter = match &config.confidence_config_path {
        Some(path) => ConfidenceMeter::load(path)?,
        None => ConfidenceMeter::with_defaults(),
    };

    let window = metrics.feedback_window(window_days).await?;
    let outcome = ConfidenceTuner::new(&meter)
        .with_recommendation_dir(recommendation_dir)
        .tune(&window)?;

    println!(
        "samples={} useful={} confidence={:.2} applied={}",
        outcome.sample_count, outcome.useful_count, outcome.overall_confidence, outcome.applied
    );
    if let Some(path) = &outcome.recommendation_path {
        println!("recommendation written to {path}");
    }
    store.close().await
}

async fn check_providers(config: GatewayConfig) -> Result<()> {
    let embedding =
        EmbeddingChain::new(config.embedding_providers.clone(), config.embedding_dimensions)?;
    let synthesis = SynthesisChain::new(config.synthesis_providers.clone())?;

    println!("{:<16} {:<12} {:<8} DETAIL", "PROVIDER", "CHAIN", "STATUS");

    let mut embedding_ok = 0usize;
    for id in embedding.provider_ids() {
        match embedding.check_provider(&id).await {
            Ok(()) => {
                embedding_ok += 1;
                println!("{id:<16} {:<12} {:<8}", "embedding", "ok");
            }
            Err(e) => println!("{id:<16} {:<12} {:<8} {e:#}", "embedding", "failed"),
        }
    }

    let mut synthesis_ok = 0usize;
    for id in synthesis.provider_ids() {
        match synthesis.check_provider(&id).await {
            Ok(()) => {
                synthesis_ok += 1;
                println!("{id:<16} {:<12} {:<8}", "synthesis", "ok");
            }
            Err(e) => println!("{id:<16} {:<12} {:<8} {e:#}", "synthesis", "failed"),
        }
    }

    println!(
        "\n{embedding_ok} embedding and {synthesis_ok} synthesis providers reachable"
    );

    if embedding_ok >= 1 && synthesis_ok >= 1 {
        Ok(())
    } else {
        std::process::exit(1);
    }
}
