use anyhow::{Context, Result};
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use adaptive_waf::config::{Config, LoggingConfig};
use adaptive_waf::observability::MetricsCollector;
use adaptive_waf::server::ApiServer;
use adaptive_waf::waf::DecisionPipeline;

#[derive(Parser, Debug)]
#[command(name = "adaptive-waf")]
#[command(about = "Adaptive WAF decision engine with a learned, safety-constrained policy")]
struct Args {
    #[arg(short, long, default_value = "config.yaml")]
    config: String,

    #[arg(short, long)]
    validate_config: bool,

    /// Enforce decisions instead of observing them
    #[arg(short, long)]
    enforce: bool,

    #[arg(long)]
    exploration_rate: Option<f64>,

    #[arg(short, long)]
    port: Option<u16>,
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let registry = tracing_subscriber::registry().with(filter);

    if logging.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_found = Path::new(&args.config).exists();
    let mut config = if config_found {
        Config::load(&args.config).await?
    } else {
        Config::default()
    };

    if args.enforce {
        config.pipeline.observe_only = false;
    }
    if let Some(rate) = args.exploration_rate {
        config.policy.exploration_rate = rate;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    config.validate().context("Invalid configuration after applying command line overrides")?;

    init_tracing(&config.logging);

    if !config_found {
        warn!("Config file {} not found, using defaults", args.config);
    }

    if args.validate_config {
        info!("Configuration is valid");
        return Ok(());
    }

    info!("Starting adaptive WAF");
    info!(
        "Mode: {} | exploration rate: {} | checkpoint: {}",
        if config.pipeline.observe_only { "observe-only" } else { "enforce" },
        config.policy.exploration_rate,
        config.pipeline.checkpoint_path
    );

    let metrics_collector = Arc::new(MetricsCollector::new(&config.metrics)?);
    let pipeline = Arc::new(DecisionPipeline::from_config(&config, metrics_collector.clone()).await?);

    let metrics_task = if metrics_collector.is_enabled() {
        let metrics_collector = metrics_collector.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = metrics_collector.start_server().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    let server = ApiServer::new(&config.server, pipeline.clone());
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
        }
        info!("Received shutdown signal");
    };

    if let Err(e) = server.start(shutdown).await {
        error!("API server error: {}", e);
    }

    if let Some(metrics_task) = metrics_task {
        metrics_task.abort();
    }

    if let Err(e) = pipeline.shutdown().await {
        error!("Final checkpoint failed: {}", e);
    }

    info!("Adaptive WAF shutdown complete");
    Ok(())
}
