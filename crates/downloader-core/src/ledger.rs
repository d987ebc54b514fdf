//! Reorg Ledger — append/replace store of `(block_number -> (hash, parent_hash))`.
//!
//! Headers are recorded here even when no logs exist in a range, because
//! reorg detection depends on header continuity alone; the Log Cache is
//! irrelevant to empty ranges (spec §9 design note).

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::error::DownloaderError;
use crate::types::BlockHeader;

/// Durable store of canonical block headers, queried by the Reorg Verifier.
///
/// Every mutation happens inside a single transactional unit per call so a
/// partial failure leaves the ledger untouched (spec §4.2).
#[async_trait]
pub trait ReorgLedger: Send + Sync {
    /// Insert-or-replace every header, by block number, in one transaction.
    async fn record(&self, headers: &[BlockHeader]) -> Result<(), DownloaderError>;

    /// Delete entries below `n`.
    async fn prune_below(&self, n: u64) -> Result<(), DownloaderError>;

    /// The canonical hash recorded for `n`, if any.
    async fn canonical_hash(&self, n: u64) -> Result<Option<String>, DownloaderError>;

    /// Release any held resources (connections, file handles).
    async fn close(&self) -> Result<(), DownloaderError>;
}

/// In-memory reference implementation — used by tests and ephemeral runs.
#[derive(Default)]
pub struct InMemoryReorgLedger {
    headers: Mutex<BTreeMap<u64, BlockHeader>>,
}

impl InMemoryReorgLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReorgLedger for InMemoryReorgLedger {
    async fn record(&self, headers: &[BlockHeader]) -> Result<(), DownloaderError> {
        let mut map = self.headers.lock().unwrap();
        for h in headers {
            map.insert(h.number, h.clone());
        }
        Ok(())
    }

    async fn prune_below(&self, n: u64) -> Result<(), DownloaderError> {
        let mut map = self.headers.lock().unwrap();
        let keep = map.split_off(&n);
        *map = keep;
        Ok(())
    }

    async fn canonical_hash(&self, n: u64) -> Result<Option<String>, DownloaderError> {
        Ok(self.headers.lock().unwrap().get(&n).map(|h| h.hash.clone()))
    }

    async fn close(&self) -> Result<(), DownloaderError> {
        Ok(())
    }
}
