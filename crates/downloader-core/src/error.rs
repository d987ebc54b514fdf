//! Error taxonomy for the downloader pipeline.
//!
//! These are *behavioral* categories (spec §7), not a grab-bag of wrapped
//! library errors: each variant tells the Orchestrator exactly what it is
//! allowed to do next (abort the cycle, retry inside the Fetcher, or
//! recover via reorg rollback).

use thiserror::Error;

/// A reorg detected by the Reorg Verifier — the sole decision authority for
/// declaring one (spec §4.4).
#[derive(Debug, Clone, Error)]
#[error("reorg detected at block {first_reorg_block}")]
pub struct ReorgError {
    /// The first block number at which the chain diverged.
    pub first_reorg_block: u64,
}

/// Top-level error the Downloader Orchestrator surfaces to its caller.
#[derive(Debug, Error)]
pub enum DownloaderError {
    /// Network failure talking to the RPC endpoint. The current cycle
    /// aborts without advancing the checkpoint; recovery is an external
    /// restart loop.
    #[error("transport error: {0}")]
    Transport(String),

    /// A single block still overflows the provider's result-size limit
    /// after recursive halving — the range cannot be served at all.
    #[error("indivisible range: block {block} alone returns too many results")]
    IndivisibleRange { block: u64 },

    /// Cross-RPC disagreement or parent-hash discontinuity. Always
    /// recovered by cache invalidation + indexer reorg fanout + sync-state
    /// rewind; never fatal.
    #[error(transparent)]
    Inconsistency(#[from] ReorgError),

    /// An indexer's `handle_logs` or `handle_reorg` returned an error. The
    /// cycle aborts without saving the checkpoint so the range replays.
    #[error("indexer '{indexer}' failed: {reason}")]
    IndexerFailure { indexer: String, reason: String },

    /// A durable store (sync state, reorg ledger, log cache) failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// Detected at startup only; refuses to start.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl DownloaderError {
    /// Returns `true` if this error is a reorg (always recoverable in-cycle).
    pub fn is_reorg(&self) -> bool {
        matches!(self, Self::Inconsistency(_))
    }

    /// The first reorg block, if this is a reorg error.
    pub fn first_reorg_block(&self) -> Option<u64> {
        match self {
            Self::Inconsistency(e) => Some(e.first_reorg_block),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reorg_error_is_reorg() {
        let err = DownloaderError::Inconsistency(ReorgError {
            first_reorg_block: 150,
        });
        assert!(err.is_reorg());
        assert_eq!(err.first_reorg_block(), Some(150));
    }

    #[test]
    fn non_reorg_errors_are_not_reorgs() {
        assert!(!DownloaderError::Transport("timeout".into()).is_reorg());
        assert!(!DownloaderError::IndivisibleRange { block: 5 }.is_reorg());
        assert_eq!(
            DownloaderError::Storage("disk full".into()).first_reorg_block(),
            None
        );
    }
}
