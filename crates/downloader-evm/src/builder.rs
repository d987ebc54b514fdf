//! Fluent builder that assembles a [`Orchestrator`](crate::orchestrator::Orchestrator)
//! from an RPC endpoint, a storage backend, and a set of registered indexers.
//!
//! # Example
//!
//! ```rust,no_run
//! use downloader_evm::DownloaderBuilder;
//!
//! # async fn run(indexer: std::sync::Arc<dyn downloader_core::Indexer>) -> Result<(), downloader_core::DownloaderError> {
//! let orchestrator = DownloaderBuilder::new("https://rpc.example.invalid")
//!     .chunk_size(2_000)
//!     .start_block(19_000_000)
//!     .register_indexer(indexer)
//!     .build()?;
//!
//! let cancel = tokio_util::sync::CancellationToken::new();
//! orchestrator.run(&cancel).await
//! # }
//! ```

use std::sync::Arc;

use downloader_core::{
    Coordinator, DownloaderConfig, DownloaderError, Finality, Indexer, InMemorySyncStateStore,
    ReorgLedger, SyncStateStore,
};
use downloader_storage::{InMemoryStorage, LogCache};

use crate::orchestrator::Orchestrator;
use crate::rpc::{HttpRpcTransport, RpcClient, RpcTransport};

/// Fluent builder for [`Orchestrator`]. Defaults to an in-memory storage
/// backend; call [`DownloaderBuilder::storage`] to wire a persistent one
/// (e.g. `downloader-storage`'s `SqliteStorage`/`PostgresStorage`).
pub struct DownloaderBuilder<T: RpcTransport> {
    transport: T,
    config: DownloaderConfig,
    coordinator: Coordinator,
    cache: Arc<dyn LogCache>,
    ledger: Arc<dyn ReorgLedger>,
    sync_state: Arc<dyn SyncStateStore>,
}

impl DownloaderBuilder<HttpRpcTransport> {
    /// Start a builder talking to a live JSON-RPC endpoint over HTTP.
    pub fn new(rpc_endpoint: impl Into<String>) -> Self {
        Self::with_transport(HttpRpcTransport::new(rpc_endpoint))
    }
}

impl<T: RpcTransport> DownloaderBuilder<T> {
    /// Start a builder over any [`RpcTransport`] — tests plug in a fake one.
    pub fn with_transport(transport: T) -> Self {
        let storage = Arc::new(InMemoryStorage::new());
        Self {
            transport,
            config: DownloaderConfig::default(),
            coordinator: Coordinator::new(),
            cache: storage.clone(),
            ledger: storage.clone(),
            sync_state: Arc::new(InMemorySyncStateStore::new()),
        }
    }

    /// Preferred block span per `eth_getLogs` call before any overflow split.
    pub fn chunk_size(mut self, n: u64) -> Self {
        self.config.chunk_size = n;
        self
    }

    /// The finality tag that bounds how far the downloader is allowed to index.
    pub fn finality(mut self, finality: Finality) -> Self {
        self.config.finality = finality;
        self
    }

    /// First block to index when no sync state exists yet.
    pub fn start_block(mut self, block: u64) -> Self {
        self.config.start_block = block;
        self
    }

    /// Expected seconds between blocks; drives the live-mode poll interval.
    pub fn block_time_secs(mut self, secs: u64) -> Self {
        self.config.block_time_secs = secs;
        self
    }

    /// Regex fragments recognized in provider "too many results" error bodies.
    pub fn too_many_results_markers(mut self, markers: Vec<String>) -> Self {
        self.config.too_many_results_markers = markers;
        self
    }

    /// Replace the default in-memory storage with a durable backend that
    /// implements all three roles: Log Cache, Reorg Ledger, Sync State Store.
    pub fn storage<S>(mut self, storage: Arc<S>) -> Self
    where
        S: LogCache + ReorgLedger + SyncStateStore + 'static,
    {
        self.cache = storage.clone();
        self.ledger = storage.clone();
        self.sync_state = storage;
        self
    }

    /// Register an indexer to receive dispatched logs and reorg notifications.
    pub fn register_indexer(mut self, indexer: Arc<dyn Indexer>) -> Self {
        self.coordinator.register(indexer);
        self
    }

    /// Validate the configuration and assemble the Orchestrator.
    pub fn build(self) -> Result<Orchestrator<T>, DownloaderError> {
        self.config.validate().map_err(DownloaderError::Configuration)?;
        let rpc = RpcClient::new(self.transport, self.config.too_many_results_markers.clone());
        Ok(Orchestrator::new(
            rpc,
            self.cache,
            self.ledger,
            self.sync_state,
            self.coordinator,
            self.config,
        ))
    }
}
