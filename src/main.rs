use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};
use wikigraph_cdc::{App, Config};

#[derive(Parser, Debug)]
#[command(name = "wikigraph-cdc")]
#[command(about = "Wikipedia link-graph crawler with PostgreSQL to Kafka change capture", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
    config: PathBuf,

    /// Overrides `seed_file` from the configuration
    #[arg(short, long, value_name = "FILE")]
    seeds: Option<PathBuf>,

    #[arg(short, long, help = "Enable JSON output for logs")]
    json_logs: bool,

    #[arg(short, long, help = "Verbose logging")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(args.json_logs, args.verbose);

    info!("Starting wikigraph-cdc");
    info!("Loading configuration from {:?}", args.config);

    let mut config = Config::from_file(&args.config)
        .with_context(|| format!("Failed to load configuration from {:?}", args.config))?;
    if let Some(seeds) = args.seeds {
        config.seed_file = Some(seeds);
    }

    info!(
        postgres_host = %config.postgres.host,
        postgres_port = %config.postgres.port,
        postgres_database = %config.postgres.database,
        slot = %config.replication.slot_name,
        publication = %config.replication.publication,
        kafka_brokers = ?config.kafka.brokers,
        kafka_topic_prefix = %config.kafka.topic_prefix,
        workers = config.ingestion.workers,
        "Configuration summary"
    );

    let mut app = App::new(config).await.context("Failed to initialise")?;

    if let Err(e) = app.start().await {
        error!("Startup failed: {}", e);
        app.stop().await;
        return Err(e).context("Failed to start");
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    app.stop().await;
    Ok(())
}

fn init_logging(json: bool, verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("wikigraph_cdc=debug,info")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("wikigraph_cdc=info,warn"))
    };

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
