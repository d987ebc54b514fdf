//! downloader-storage — pluggable storage backends for the reorg-safe EVM
//! log downloader. Each backend implements all three durable roles the
//! pipeline needs: the Sync State Store and Reorg Ledger (traits from
//! `downloader-core`), and the Log Cache (trait defined in [`cache`]).
//!
//! Backends:
//! - [`memory`] — in-memory (dev/testing, no persistence)
//! - [`sqlite`] — SQLite via `sqlx` (embedded, single-file persistence)
//! - [`postgres`] — PostgreSQL via `sqlx` (production, high-throughput)

pub mod cache;
pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use cache::{LogCache, UnsyncedTopic};
pub use memory::InMemoryStorage;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStorage;

#[cfg(feature = "postgres")]
pub use postgres::PostgresStorage;
