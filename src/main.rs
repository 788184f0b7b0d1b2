//! Service binary for action-ingest
//!
//! Starts one consumer per configured topic, the health scheduler and the
//! diagnostic HTTP interface, then runs until interrupted.

use anyhow::{bail, Context};
use action_ingest::consumer::MemoryBroker;
use action_ingest::pipeline::{DeadLetterSink, MemoryDeadLetterSink};
use action_ingest::store::{MemoryActionItemRepository, MemoryErrorStore};
use action_ingest::{Collaborators, IngestApp, IngestConfig};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "action-ingest")]
#[command(about = "Action item ingestion pipeline", long_about = None)]
struct Args {
    /// Configuration file path (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Kafka brokers, overrides the config file
    #[arg(long)]
    brokers: Option<String>,

    /// Topics to consume, comma separated; overrides the config file
    #[arg(long, value_delimiter = ',')]
    topics: Vec<String>,

    /// Diagnostic HTTP bind address, overrides the config file
    #[arg(long)]
    http_addr: Option<String>,

    /// Key required to trigger health probes over HTTP
    #[arg(long)]
    api_key: Option<String>,

    /// Use the in-memory broker instead of Kafka
    #[arg(long)]
    memory: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Log as JSON
    #[arg(long)]
    json_logs: bool,
}

fn load_config(args: &Args) -> anyhow::Result<IngestConfig> {
    let mut config = match &args.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            IngestConfig::from_file(path)
                .with_context(|| format!("failed to load {}", path.display()))?
        }
        None => IngestConfig::default(),
    };

    if let Some(brokers) = &args.brokers {
        config.brokers = brokers.clone();
    }
    if !args.topics.is_empty() {
        config.topics = args.topics.clone();
    }
    if let Some(addr) = &args.http_addr {
        config.http_addr = addr.clone();
    }

    config.ensure_valid()?;
    Ok(config)
}

/// Collaborators plus the in-memory broker when running with `--memory`
fn collaborators(
    args: &Args,
    config: &IngestConfig,
) -> anyhow::Result<(Collaborators, Option<MemoryBroker>)> {
    // The relational store is provided by the deployment; until one is
    // plugged in, items and errors are kept in memory.
    let repository = MemoryActionItemRepository::new();
    let errors = MemoryErrorStore::new();

    if args.memory {
        let broker = MemoryBroker::new();
        let mut collaborators = Collaborators::in_memory(&broker, &repository, &errors);
        if config.dead_letter_topic.is_some() {
            let sink: Arc<dyn DeadLetterSink> = Arc::new(MemoryDeadLetterSink::new());
            collaborators = collaborators.with_dead_letter(sink);
        }
        return Ok((collaborators, Some(broker)));
    }

    Ok((kafka_collaborators(config, repository, errors)?, None))
}

/// Produce each stdin line to `topic` on the in-memory broker
fn feed_stdin(broker: MemoryBroker, topic: String) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => {
                    broker.produce(&topic, 0, None, line.as_bytes());
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("Failed to read stdin: {}", e);
                    break;
                }
            }
        }
        info!("Finished reading records from stdin");
    });
}

#[cfg(feature = "kafka")]
fn kafka_collaborators(
    config: &IngestConfig,
    repository: MemoryActionItemRepository,
    errors: MemoryErrorStore,
) -> anyhow::Result<Collaborators> {
    use action_ingest::consumer::{KafkaDeadLetterProducer, KafkaSourceFactory};

    warn!("No persistent store configured, action items are kept in memory");
    let mut collaborators = Collaborators::new(
        Arc::new(KafkaSourceFactory::new(config.clone())),
        Arc::new(repository),
        Arc::new(errors),
    );
    if let Some(topic) = &config.dead_letter_topic {
        collaborators =
            collaborators.with_dead_letter(Arc::new(KafkaDeadLetterProducer::new(config, topic.clone())?));
    }
    Ok(collaborators)
}

#[cfg(not(feature = "kafka"))]
fn kafka_collaborators(
    _config: &IngestConfig,
    _repository: MemoryActionItemRepository,
    _errors: MemoryErrorStore,
) -> anyhow::Result<Collaborators> {
    bail!("built without the `kafka` feature; run with --memory or rebuild with --features kafka")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = if args.debug { "debug" } else { "info" };
    action_ingest::init_tracing_with(level, args.json_logs);

    info!(version = action_ingest::VERSION, "Starting action-ingest");

    let config = load_config(&args)?;
    let addr: SocketAddr = config
        .http_addr
        .parse()
        .with_context(|| format!("invalid http_addr '{}'", config.http_addr))?;

    let (collaborators, memory_broker) = collaborators(&args, &config)?;
    let app = IngestApp::start(config.clone(), collaborators)
        .await
        .context("failed to start ingestion pipeline")?;

    if let (Some(broker), Some(topic)) = (memory_broker, config.topics.first()) {
        info!(topic = %topic, "Reading JSON records from stdin");
        feed_stdin(broker, topic.clone());
    }

    let mut service = app.diagnostic_service();
    if let Some(key) = &args.api_key {
        service = service.with_api_key(key.clone());
    }

    let mut stop = app.shutdown_state().subscribe();
    let server = tokio::spawn(async move {
        let signal = async move {
            let _ = stop.wait_for(|stopping| *stopping).await;
        };
        if let Err(e) = service.serve(addr, signal).await {
            error!("Diagnostic service failed: {}", e);
        }
    });

    app.start_consumers();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    let result = app.shutdown().await;
    if let Err(e) = server.await {
        error!("Diagnostic service task failed: {}", e);
    }

    if let Err(e) = result {
        warn!("Shutdown incomplete: {}", e);
        bail!(e);
    }

    info!("action-ingest stopped");
    Ok(())
}
