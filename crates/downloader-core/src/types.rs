//! Shared data types for the downloader pipeline.

use serde::{Deserialize, Serialize};

// ─── Block header ────────────────────────────────────────────────────────────

/// A minimal block header — enough to verify parent-hash continuity and to
/// cross-check log block hashes during reorg verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Block number.
    pub number: u64,
    /// Block hash (`0x…`, 32 bytes hex-encoded).
    pub hash: String,
    /// Parent block hash (`0x…`).
    pub parent_hash: String,
}

impl BlockHeader {
    /// Returns `true` if `self` is the direct child of `parent` (number and
    /// parent-hash both line up).
    pub fn extends(&self, parent: &BlockHeader) -> bool {
        self.number == parent.number + 1 && self.parent_hash == parent.hash
    }
}

// ─── Log record ──────────────────────────────────────────────────────────────

/// A single EVM log as delivered to indexers.
///
/// Uniqueness key: `(tx_hash, log_index)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub address: String,
    /// Up to four indexed topics; `topics[0]` is the event signature when present.
    pub topics: Vec<String>,
    /// Opaque, non-indexed log data.
    pub data: String,
    pub block_number: u64,
    pub block_hash: String,
    pub tx_hash: String,
    pub tx_index: u32,
    pub log_index: u32,
    /// Set when this log has since been dropped by a reorg.
    pub removed: bool,
}

impl LogRecord {
    /// `topic0` — the event signature, if any topics are present.
    pub fn topic0(&self) -> Option<&str> {
        self.topics.first().map(String::as_str)
    }

    /// The `(tx_hash, log_index)` uniqueness key.
    pub fn key(&self) -> (String, u32) {
        (self.tx_hash.clone(), self.log_index)
    }
}

// ─── Block range / filter triple ─────────────────────────────────────────────

/// An inclusive, non-empty block range. `from <= to` is an invariant enforced
/// by [`BlockRange::new`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockRange {
    pub from: u64,
    pub to: u64,
}

impl BlockRange {
    /// Construct a range, returning `None` if `from > to`.
    pub fn new(from: u64, to: u64) -> Option<Self> {
        (from <= to).then_some(Self { from, to })
    }

    pub fn len(&self) -> u64 {
        self.to - self.from + 1
    }

    pub fn contains(&self, block: u64) -> bool {
        block >= self.from && block <= self.to
    }

    /// Returns `true` if `self` and `other` overlap or touch (share at least
    /// one block, or are adjacent and thus mergeable).
    pub fn overlaps_or_touches(&self, other: &BlockRange) -> bool {
        self.from <= other.to.saturating_add(1) && other.from <= self.to.saturating_add(1)
    }

    /// Merge two overlapping/adjacent ranges into their union. Debug-asserts
    /// that the ranges actually overlap or touch — callers must check first.
    pub fn merge(&self, other: &BlockRange) -> BlockRange {
        debug_assert!(self.overlaps_or_touches(other));
        BlockRange {
            from: self.from.min(other.from),
            to: self.to.max(other.to),
        }
    }

    /// Returns the sub-range of `self` that intersects `other`, if any.
    pub fn intersection(&self, other: &BlockRange) -> Option<BlockRange> {
        BlockRange::new(self.from.max(other.from), self.to.min(other.to))
    }
}

/// The `(address, topic0, block_range)` triple the Fetcher and Log Cache key
/// their work on. An empty `topic0` means "every event at this address".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterTriple {
    pub address: String,
    pub topic0: Option<String>,
    pub range: BlockRange,
}

// ─── Active filter set ───────────────────────────────────────────────────────

/// The aggregated address/topic matrix the Orchestrator builds from every
/// registered indexer's interests, plus the minimum start block per address.
#[derive(Debug, Clone, Default)]
pub struct FilterSet {
    /// Addresses of interest, each paired with its topic0 set (empty = all topics).
    pub addresses: Vec<String>,
    pub topics: Vec<Vec<String>>,
    /// Lowest `start_block` across all indexers interested in this address.
    pub address_start_blocks: std::collections::HashMap<String, u64>,
}

impl FilterSet {
    /// Addresses (and their aligned topic sets) active for a candidate
    /// range — i.e. those whose start block has already been reached by `from`.
    pub fn active_for(&self, from: u64) -> (Vec<String>, Vec<Vec<String>>) {
        let mut addrs = Vec::new();
        let mut topics = Vec::new();
        for (addr, topic_set) in self.addresses.iter().zip(self.topics.iter()) {
            let start = self.address_start_blocks.get(addr).copied().unwrap_or(0);
            if from >= start {
                addrs.push(addr.clone());
                topics.push(topic_set.clone());
            }
        }
        (addrs, topics)
    }
}

// ─── Coverage range ──────────────────────────────────────────────────────────

/// States "every log matching `address` (for every topic an indexer has
/// registered) has been stored for `[from_block, to_block]`".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageRange {
    pub address: String,
    pub from_block: u64,
    pub to_block: u64,
}

// ─── Sync mode / finality ─────────────────────────────────────────────────────

/// The downloader's current operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMode {
    /// Catching up toward the finalized head in large chunks.
    Backfill,
    /// Tailing newly finalized blocks.
    Live,
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Backfill => write!(f, "backfill"),
            Self::Live => write!(f, "live"),
        }
    }
}

/// The block finality tag a deployment resolves "the head we are allowed to
/// index up to" against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Finality {
    Finalized,
    Safe,
    /// `latest`, offset back by `lag` blocks (saturating at 0). `lag == 0`
    /// is rejected as a configuration error — see spec §9.
    Latest { lag: u64 },
}

// ─── FetchResult ─────────────────────────────────────────────────────────────

/// What one Fetcher cycle produced: the matching logs, dense headers for
/// every block in the effective range, and the range actually served (which
/// may be narrower than requested if an overflow split occurred).
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub logs: Vec<LogRecord>,
    pub headers: Vec<BlockHeader>,
    pub effective_from: u64,
    pub effective_to: u64,
}
