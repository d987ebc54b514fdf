//! downloader-core — shared types, error taxonomy, and the chain-agnostic
//! half of the reorg-safe EVM log downloader pipeline.
//!
//! # Architecture
//!
//! ```text
//! Downloader Orchestrator (downloader-evm)
//!        ├── Log Fetcher       (downloader-evm)
//!        │      └── Reorg Verifier   (this crate)
//!        │             └── Reorg Ledger   (this crate, trait; persisted impls in downloader-storage)
//!        ├── Log Cache          (downloader-storage, trait defined there)
//!        ├── Indexer Coordinator (this crate)
//!        └── Sync State Store   (this crate, trait; persisted impls in downloader-storage)
//! ```

pub mod coordinator;
pub mod error;
pub mod indexer;
pub mod ledger;
pub mod sync_state;
pub mod types;
pub mod verifier;

pub use coordinator::{Coordinator, Indexer};
pub use error::{DownloaderError, ReorgError};
pub use indexer::DownloaderConfig;
pub use ledger::{InMemoryReorgLedger, ReorgLedger};
pub use sync_state::{InMemorySyncStateStore, SyncState, SyncStateStore};
pub use types::{
    BlockHeader, BlockRange, CoverageRange, FetchResult, FilterSet, FilterTriple, Finality,
    LogRecord, SyncMode,
};
pub use verifier::{HeaderSource, ReorgVerifier};
