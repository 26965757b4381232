use std::path::PathBuf;
use std::time::Duration;

use cdh_ingest::{
    Config, CursorStore, FeedClient, FileCursorStore, LogSink, MemoryCursorStore,
    SqliteCursorStore, StorageConfig,
};
use clap::Parser;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "cdh-ingest")]
#[command(about = "CDH telemetry feed ingestion daemon")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "cdh-ingest.toml")]
    config: PathBuf,

    /// Forget the stored cursor and exit. The next run starts from the
    /// feed's default position.
    #[arg(long)]
    reset_cursor: bool,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let filter =
        std::env::var("RUST_LOG").unwrap_or_else(|_| "tracing=info,cdh_ingest=info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(tracing_subscriber::fmt::format::FmtSpan::CLOSE)
        .init();

    let cli = Cli::parse();

    let config = if cli.config.exists() {
        info!(path = ?cli.config, "Loading configuration");
        Config::load(&cli.config)?
    } else {
        info!("No configuration file found, using defaults");
        Config::default()
    };

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        warn!("A rustls crypto provider was already installed");
    }

    info!(
        url = %config.feed.url,
        partition = config.feed.event_partition,
        max_event_count = config.feed.max_event_count,
        "Starting cdh-ingest"
    );

    match config.storage {
        StorageConfig::Memory => {
            info!("Using in-memory cursor storage");
            let store = MemoryCursorStore::default();
            run(config, store, cli.reset_cursor).await
        }
        StorageConfig::File { ref path } => {
            info!(path = ?path, "Using file cursor storage");
            let store = FileCursorStore::new(path);
            run(config, store, cli.reset_cursor).await
        }
        StorageConfig::Sqlite { ref path } => {
            info!(path = ?path, "Using SQLite cursor storage");
            let store = SqliteCursorStore::new(path).await?;
            run(config, store, cli.reset_cursor).await
        }
    }
}

async fn run<S: CursorStore>(config: Config, store: S, reset_cursor: bool) -> color_eyre::Result<()> {
    if reset_cursor {
        store.reset().await?;
        info!("Cursor reset, next run starts from the feed's default position");
        return Ok(());
    }

    let client = FeedClient::new(config.feed, &config.tls, store)?;
    client.start(LogSink).await?;

    let mut status_interval =
        tokio::time::interval(Duration::from_secs(config.daemon.status_log_interval_secs.max(1)));
    status_interval.tick().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
                break;
            }
            _ = status_interval.tick() => {
                let status = client.status().await;
                info!(
                    state = ?status.state,
                    connected = status.connected,
                    total_events_received = status.total_events_received,
                    duplicates_skipped = status.duplicates_skipped,
                    errors = status.errors,
                    faults = status.faults,
                    sink_errors = status.sink_errors,
                    reconnect_attempts = status.reconnect_attempts,
                    last_event_id = ?status.last_event_id,
                    device_count = status.device_count,
                    "Feed status"
                );

                if status.state.is_terminal() {
                    error!(state = ?status.state, "Feed client is no longer running");
                    break;
                }
            }
        }
    }

    client.stop().await?;
    info!("cdh-ingest shut down complete");
    Ok(())
}
