//! Downloader-level configuration — the knobs the Orchestrator and Fetcher
//! read every cycle (spec §4.6, §4.8, §9).

use serde::{Deserialize, Serialize};

use crate::types::Finality;

/// Configuration shared by the Log Fetcher and Downloader Orchestrator.
///
/// `finality == Latest { lag: 0 }` is rejected at validation time — the spec
/// treats "latest with zero lag" as an unsafe configuration, not a runtime
/// error (spec §9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloaderConfig {
    /// Preferred block span per `eth_getLogs` call before any overflow split.
    pub chunk_size: u64,
    /// The finality tag that bounds how far the downloader is allowed to index.
    pub finality: Finality,
    /// First block to index when no sync state exists yet.
    pub start_block: u64,
    /// Expected seconds between blocks; drives the live-mode poll interval.
    pub block_time_secs: u64,
    /// Regex fragments recognized in "too many results" error bodies,
    /// keyed by provider family (spec §4.1 step 3).
    pub too_many_results_markers: Vec<String>,
}

impl DownloaderConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.chunk_size == 0 {
            return Err("chunk_size must be at least 1".to_string());
        }
        if matches!(self.finality, Finality::Latest { lag: 0 }) {
            return Err(
                "finality = latest with lag = 0 is not a safe configuration; set a lag or use safe/finalized"
                    .to_string(),
            );
        }
        if self.block_time_secs == 0 {
            return Err("block_time_secs must be at least 1".to_string());
        }
        Ok(())
    }
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            chunk_size: 5_000,
            finality: Finality::Finalized,
            start_block: 0,
            block_time_secs: 12,
            too_many_results_markers: vec![
                "query returned more than".to_string(),
                "block range is too large".to_string(),
                "limit exceeded".to_string(),
            ],
        }
    }
}
