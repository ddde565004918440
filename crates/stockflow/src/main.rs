//! stockflow binary entry point

use std::num::NonZeroU32;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stockflow::server::{run_server, ServerState};
use stockflow::{
    AlphaVantageSource, Config, DailyCsvSink, EventCodec, IngestionLoop, JsonCodec, Publisher,
    StockflowError, Subscriber, SyntheticTrades,
};
use stockflow_middleware::create_transport;

#[derive(Parser, Debug)]
#[command(name = "stockflow")]
#[command(about = "Stock price ticks to a partitioned trade log, and the log to daily CSV files")]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// AlphaVantage API key
    #[arg(long, env = "ALPHAVANTAGE_API_KEY", hide_env_values = true)]
    api_key: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config = Config::load(&args.config).map_err(|e| {
        error!(error = %e, "Failed to load config");
        e
    })?;
    let interval = config.source.interval()?;
    let poll_timeout = config.subscriber.poll_timeout()?;
    let partitions = NonZeroU32::new(config.transport.partitions)
        .ok_or_else(|| StockflowError::Config("partitions must be greater than zero".to_string()))?;
    let topic = config.transport.topic.clone();

    info!(
        transport = ?config.transport.settings.kind,
        topic = %topic,
        partitions = partitions.get(),
        symbol = %config.source.symbol,
        sink = ?config.sink.path,
        "Starting stockflow"
    );

    let transport = create_transport(&config.transport.settings).await.map_err(|e| {
        error!(error = %e, "Failed to create transport");
        e
    })?;
    // Refuses to reuse a topic laid out with a different partition count
    transport
        .create_topic(&topic, partitions.get())
        .await
        .map_err(|e| {
            error!(topic = %topic, error = %e, "Failed to prepare topic");
            e
        })?;

    let codec: Arc<dyn EventCodec> = Arc::new(JsonCodec);

    let publisher = Publisher::connect(
        Arc::clone(&transport),
        Arc::clone(&codec),
        &topic,
        config.publisher.batch_size,
    )
    .await?;
    let source = AlphaVantageSource::new(config.source.base_url.as_str(), args.api_key)?;
    let ingest = IngestionLoop::new(
        config.source.symbol.as_str(),
        interval,
        Arc::new(source),
        Box::new(SyntheticTrades::new(config.source.seed)),
        publisher,
    );

    let sink = DailyCsvSink::open(&config.sink.path)?;
    let subscriber = Subscriber::connect(
        transport.as_ref(),
        &topic,
        &config.subscriber.group,
        &config.subscriber.partitions,
        codec,
        sink,
        poll_timeout,
    )
    .await?;

    let shutdown = CancellationToken::new();

    if let Some(server_config) = &config.server {
        let state = ServerState::new(
            ingest.running_handle(),
            subscriber.running_handle(),
            subscriber.last_persisted_handle(),
        );
        let addr = server_config.listen_addr;
        let shutdown = shutdown.clone();
        info!(%addr, "Starting health server");
        tokio::spawn(async move {
            if let Err(e) = run_server(addr, state, shutdown).await {
                error!(error = %e, "Health server failed");
            }
        });
    }

    let ingest_task = tokio::spawn(ingest.run(shutdown.clone()));
    let subscriber_task = tokio::spawn(subscriber.run(shutdown.clone()));

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    info!("stockflow running, waiting for SIGTERM/SIGINT to stop");

    tokio::select! {
        _ = sigterm.recv() => info!("SIGTERM received, shutting down gracefully"),
        _ = sigint.recv() => info!("SIGINT received, shutting down gracefully"),
        _ = tokio::signal::ctrl_c() => info!("Ctrl-C received, shutting down gracefully"),
    }
    shutdown.cancel();

    match ingest_task.await {
        Ok(stats) => info!(
            cycles = stats.cycles,
            samples = stats.samples,
            delivered = stats.delivered,
            failed = stats.failed,
            rejected = stats.rejected,
            "Ingestion loop finished"
        ),
        Err(e) => error!(error = %e, "Ingestion task panicked"),
    }
    match subscriber_task.await {
        Ok(stats) => info!(
            persisted = stats.persisted,
            committed = stats.committed,
            persist_failures = stats.persist_failures,
            decode_failures = stats.decode_failures,
            "Subscriber finished"
        ),
        Err(e) => error!(error = %e, "Subscriber task panicked"),
    }

    info!("stockflow stopped");
    Ok(())
}
