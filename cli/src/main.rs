//! evmlog-downloader — process entry point. Loads configuration, initializes
//! structured logging, registers indexers, and runs the Downloader
//! Orchestrator to completion or cancellation (spec §4.8, §9, §10).

mod config;
mod indexer;
mod logging;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use downloader_evm::{DownloaderBuilder, HttpRpcTransport};
use downloader_storage::{InMemoryStorage, SqliteStorage};

use crate::config::StorageSettings;
use crate::indexer::LoggingIndexer;

#[derive(Parser, Debug)]
#[command(name = "evmlog-downloader", version, about = "Reorg-safe EVM log downloader")]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(long, env = "DOWNLOADER_CONFIG")]
    config: Option<String>,

    /// Override the JSON-RPC endpoint.
    #[arg(long)]
    rpc_endpoint: Option<String>,

    /// Override the first block to index when no sync state exists.
    #[arg(long)]
    start_block: Option<u64>,

    /// "pretty" or "json".
    #[arg(long)]
    log_format: Option<String>,

    /// An `EnvFilter` directive, e.g. "info" or "downloader_evm=debug".
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut settings = config::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(endpoint) = cli.rpc_endpoint {
        settings.rpc_endpoint = endpoint;
    }
    if let Some(start_block) = cli.start_block {
        settings.start_block = start_block;
    }
    if let Some(format) = cli.log_format {
        settings.log_format = format;
    }
    if let Some(level) = cli.log_level {
        settings.log_level = level;
    }

    let _logging_guard = logging::init(
        &settings.log_level,
        settings.log_format == "json",
        settings.log_file.as_deref(),
    );

    info!(rpc_endpoint = %settings.rpc_endpoint, chunk_size = settings.chunk_size, "starting downloader");

    let mut builder = DownloaderBuilder::new(settings.rpc_endpoint.clone())
        .chunk_size(settings.chunk_size)
        .finality((&settings.finality).into())
        .start_block(settings.start_block)
        .block_time_secs(settings.block_time_secs)
        .too_many_results_markers(settings.too_many_results_markers.clone());

    builder = match &settings.storage {
        StorageSettings::Memory => builder.storage(Arc::new(InMemoryStorage::new())),
        StorageSettings::Sqlite { path } => {
            let storage = SqliteStorage::open(path).await.context("opening sqlite storage")?;
            builder.storage(Arc::new(storage))
        }
        StorageSettings::Postgres { database_url } => connect_postgres(builder, database_url).await?,
    };

    for watch in &settings.watch {
        builder = builder.register_indexer(Arc::new(LoggingIndexer::new(
            format!("{}-watcher", watch.address),
            watch.address.clone(),
            watch.topics.clone(),
            watch.start_block,
        )));
    }

    let orchestrator = builder.build().context("building orchestrator")?;

    let cancel = CancellationToken::new();
    let cancel_for_signal = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
        cancel_for_signal.cancel();
    });

    orchestrator.run(&cancel).await.context("downloader run failed")?;
    Ok(())
}

/// Connects the Postgres storage backend. Only reachable when the binary is
/// built with `--features postgres`; otherwise rejected as a configuration
/// error rather than failing with an unrelated compile-time symbol error.
#[cfg(feature = "postgres")]
async fn connect_postgres(
    builder: DownloaderBuilder<HttpRpcTransport>,
    database_url: &str,
) -> anyhow::Result<DownloaderBuilder<HttpRpcTransport>> {
    let storage = downloader_storage::PostgresStorage::connect(database_url)
        .await
        .context("connecting to postgres storage")?;
    Ok(builder.storage(Arc::new(storage)))
}

#[cfg(not(feature = "postgres"))]
async fn connect_postgres(
    _builder: DownloaderBuilder<HttpRpcTransport>,
    _database_url: &str,
) -> anyhow::Result<DownloaderBuilder<HttpRpcTransport>> {
    anyhow::bail!("storage.backend = \"postgres\" requires building with --features postgres")
}
