//! Log Cache — content-addressable store of already-downloaded logs keyed by
//! `(address, topic, block_range)`, with reorg invalidation, finality
//! pruning, and coverage-range bookkeeping (spec §4.3).

use async_trait::async_trait;

use downloader_core::{BlockRange, CoverageRange, DownloaderError, LogRecord};

/// An `(address, topic0)` pair whose coverage does not yet reach the
/// requested block, paired with the highest block already covered (0 if
/// nothing is covered at all).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsyncedTopic {
    pub address: String,
    pub topic0: Option<String>,
    pub covered_tail: u64,
}

/// Durable, content-addressable cache of downloaded logs and the coverage
/// ranges that prove which `(address, block)` pairs have been fully fetched.
#[async_trait]
pub trait LogCache: Send + Sync {
    /// Every non-removed log stored for `(address, topic0 ∈ [from,to])`, plus
    /// the coverage ranges intersecting the query. `topic0 = None` matches
    /// logs regardless of `topic0`.
    async fn get_logs(
        &self,
        address: &str,
        topic0: Option<&str>,
        from: u64,
        to: u64,
    ) -> Result<(Vec<LogRecord>, Vec<CoverageRange>), DownloaderError>;

    /// Insert `logs` idempotently (uniqueness on `(tx_hash, log_index)`) and
    /// record one coverage row per `(address, from, to)` in `addresses`.
    async fn store_logs(
        &self,
        addresses: &[String],
        logs: &[LogRecord],
        from: u64,
        to: u64,
    ) -> Result<(), DownloaderError>;

    /// Mark logs with `block_number >= first_reorg_block` as removed and
    /// delete coverage rows whose `to_block >= first_reorg_block`.
    async fn handle_reorg(&self, first_reorg_block: u64) -> Result<(), DownloaderError>;

    /// Delete logs and coverage rows below `n`.
    async fn prune_below(&self, n: u64) -> Result<(), DownloaderError>;

    /// For each `(address, topic0)` in `filters` whose coverage does not yet
    /// reach `up_to_block`, the highest block already covered.
    async fn get_unsynced_topics(
        &self,
        filters: &[(String, Option<String>)],
        up_to_block: u64,
    ) -> Result<Vec<UnsyncedTopic>, DownloaderError>;
}

/// Merge `range` into a sorted, non-overlapping set of coverage ranges for
/// one address, in place. Shared by every backend so the merge algebra is
/// tested once (spec §4.3, I4).
pub fn merge_coverage(existing: &mut Vec<BlockRange>, range: BlockRange) {
    existing.push(range);
    existing.sort_by_key(|r| r.from);

    let mut merged: Vec<BlockRange> = Vec::with_capacity(existing.len());
    for r in existing.drain(..) {
        match merged.last_mut() {
            Some(last) if last.overlaps_or_touches(&r) => *last = last.merge(&r),
            _ => merged.push(r),
        }
    }
    *existing = merged;
}

/// The highest block continuously covered starting from the lowest recorded
/// range — NOT simply the maximum `to` across all ranges, since coverage can
/// have gaps (e.g. a late-joining indexer backfilling from the middle).
/// Returns `0` if nothing is covered.
pub fn covered_tail(ranges: &[BlockRange], up_to_block: u64) -> u64 {
    ranges
        .iter()
        .filter(|r| r.from == 0 || ranges.iter().any(|other| other.to.saturating_add(1) == r.from))
        .map(|r| r.to)
        .filter(|&to| to <= up_to_block)
        .max()
        .unwrap_or(0)
}

/// The coverage ranges intersecting `[from, to]`.
pub fn ranges_intersecting(ranges: &[BlockRange], from: u64, to: u64) -> Vec<CoverageRange> {
    let query = match BlockRange::new(from, to) {
        Some(q) => q,
        None => return Vec::new(),
    };
    ranges
        .iter()
        .filter_map(|r| r.intersection(&query))
        .map(|r| CoverageRange {
            address: String::new(), // filled in by the caller, which knows the address
            from_block: r.from,
            to_block: r.to,
        })
        .collect()
}
