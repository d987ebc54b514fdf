//! Reorg Verifier — the sole decision authority for declaring a reorg
//! (spec §4.4). Pure logic over an already-fetched batch of logs and the
//! headers for the same range; it is the only component allowed to persist
//! headers to the Reorg Ledger.

use async_trait::async_trait;
use std::collections::HashMap;

use crate::error::{DownloaderError, ReorgError};
use crate::ledger::ReorgLedger;
use crate::types::{BlockHeader, LogRecord};

/// Abstracts "fetch headers for a block range" so the Verifier does not
/// depend on a concrete RPC client crate. Implemented by the EVM RPC Client.
#[async_trait]
pub trait HeaderSource: Send + Sync {
    async fn headers_for_range(
        &self,
        from: u64,
        to: u64,
    ) -> Result<Vec<BlockHeader>, DownloaderError>;
}

/// Verifies that a fetched batch of logs is consistent with the canonical
/// chain, records accepted headers to the Reorg Ledger, and otherwise
/// reports the first block at which a reorg occurred.
pub struct ReorgVerifier<'a> {
    headers: &'a dyn HeaderSource,
    ledger: &'a dyn ReorgLedger,
}

impl<'a> ReorgVerifier<'a> {
    pub fn new(headers: &'a dyn HeaderSource, ledger: &'a dyn ReorgLedger) -> Self {
        Self { headers, ledger }
    }

    /// Run the five-step verification algorithm from spec §4.4 and, on
    /// success, persist the headers.
    pub async fn verify(
        &self,
        logs: &[LogRecord],
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<BlockHeader>, DownloaderError> {
        let headers = self.headers.headers_for_range(from_block, to_block).await?;

        // Step 2: build logHash[n] / headerHash[n].
        let mut log_hash: HashMap<u64, &str> = HashMap::new();
        for log in logs {
            // Multiple logs can share a block; they must all agree (same hash).
            log_hash.insert(log.block_number, log.block_hash.as_str());
        }
        let header_hash: HashMap<u64, &str> =
            headers.iter().map(|h| (h.number, h.hash.as_str())).collect();

        // Step 3: cross-RPC hash agreement. Scan in block-ascending order so
        // a batch with more than one mismatch reports the lowest-numbered
        // one, matching the rollback contract (P1).
        let mut mismatched_numbers: Vec<u64> = log_hash
            .iter()
            .filter(|(number, lh)| header_hash.get(*number).is_some_and(|hh| hh != **lh))
            .map(|(&number, _)| number)
            .collect();
        mismatched_numbers.sort_unstable();
        if let Some(&first_reorg_block) = mismatched_numbers.first() {
            return Err(ReorgError { first_reorg_block }.into());
        }

        // Step 4: parent-hash continuity across adjacent headers.
        let mut sorted = headers.clone();
        sorted.sort_by_key(|h| h.number);
        for pair in sorted.windows(2) {
            let (prev, cur) = (&pair[0], &pair[1]);
            if cur.parent_hash != prev.hash {
                return Err(ReorgError {
                    first_reorg_block: cur.number,
                }
                .into());
            }
        }

        // Step 5: agreement with the previously recorded canonical chain.
        for header in &sorted {
            if let Some(existing) = self.ledger.canonical_hash(header.number).await? {
                if existing != header.hash {
                    return Err(ReorgError {
                        first_reorg_block: header.number,
                    }
                    .into());
                }
            }
        }

        // Step 6: persist and return.
        self.ledger.record(&sorted).await?;
        Ok(sorted)
    }
}
