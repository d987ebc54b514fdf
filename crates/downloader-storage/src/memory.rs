//! In-memory backend — implements the Sync State Store, Reorg Ledger, and
//! Log Cache entirely in RAM. No persistence across restarts; useful for
//! tests and ephemeral runs.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use downloader_core::{
    BlockHeader, BlockRange, CoverageRange, DownloaderError, LogRecord, ReorgLedger, SyncMode,
    SyncState, SyncStateStore,
};

use crate::cache::{covered_tail, merge_coverage, ranges_intersecting, LogCache, UnsyncedTopic};

/// All three durable roles backed by plain in-memory collections.
#[derive(Default)]
pub struct InMemoryStorage {
    sync_state: Mutex<Option<SyncState>>,
    headers: Mutex<BTreeMap<u64, BlockHeader>>,
    logs: Mutex<HashMap<(String, u32), LogRecord>>,
    coverage: Mutex<HashMap<String, Vec<BlockRange>>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

// ─── Sync State Store ────────────────────────────────────────────────────────

#[async_trait]
impl SyncStateStore for InMemoryStorage {
    async fn get(&self) -> Result<SyncState, DownloaderError> {
        let mut guard = self.sync_state.lock().unwrap();
        if guard.is_none() {
            *guard = Some(SyncState::genesis(chrono::Utc::now().timestamp()));
        }
        Ok(guard.clone().unwrap())
    }

    async fn save_checkpoint(&self, block: u64, hash: &str, mode: SyncMode) -> Result<(), DownloaderError> {
        *self.sync_state.lock().unwrap() = Some(SyncState {
            last_indexed_block: block,
            last_indexed_block_hash: hash.to_string(),
            last_indexed_timestamp: chrono::Utc::now().timestamp(),
            mode,
        });
        Ok(())
    }

    async fn set_mode(&self, mode: SyncMode) -> Result<(), DownloaderError> {
        let mut guard = self.sync_state.lock().unwrap();
        match guard.as_mut() {
            Some(s) => s.mode = mode,
            None => *guard = Some(SyncState { mode, ..SyncState::genesis(chrono::Utc::now().timestamp()) }),
        }
        Ok(())
    }

    async fn reset(&self, start_block: u64) -> Result<(), DownloaderError> {
        *self.sync_state.lock().unwrap() = Some(SyncState {
            last_indexed_block: start_block,
            last_indexed_block_hash: "0x".to_string() + &"0".repeat(64),
            last_indexed_timestamp: chrono::Utc::now().timestamp(),
            mode: SyncMode::Backfill,
        });
        Ok(())
    }

    async fn close(&self) -> Result<(), DownloaderError> {
        Ok(())
    }
}

// ─── Reorg Ledger ────────────────────────────────────────────────────────────

#[async_trait]
impl ReorgLedger for InMemoryStorage {
    async fn record(&self, headers: &[BlockHeader]) -> Result<(), DownloaderError> {
        let mut map = self.headers.lock().unwrap();
        for h in headers {
            map.insert(h.number, h.clone());
        }
        Ok(())
    }

    async fn prune_below(&self, n: u64) -> Result<(), DownloaderError> {
        let mut map = self.headers.lock().unwrap();
        *map = map.split_off(&n);
        Ok(())
    }

    async fn canonical_hash(&self, n: u64) -> Result<Option<String>, DownloaderError> {
        Ok(self.headers.lock().unwrap().get(&n).map(|h| h.hash.clone()))
    }

    async fn close(&self) -> Result<(), DownloaderError> {
        Ok(())
    }
}

// ─── Log Cache ───────────────────────────────────────────────────────────────

#[async_trait]
impl LogCache for InMemoryStorage {
    async fn get_logs(
        &self,
        address: &str,
        topic0: Option<&str>,
        from: u64,
        to: u64,
    ) -> Result<(Vec<LogRecord>, Vec<CoverageRange>), DownloaderError> {
        let logs = self
            .logs
            .lock()
            .unwrap()
            .values()
            .filter(|l| {
                !l.removed
                    && l.address.eq_ignore_ascii_case(address)
                    && l.block_number >= from
                    && l.block_number <= to
                    && topic0.map_or(true, |t| l.topic0() == Some(t))
            })
            .cloned()
            .collect();

        let ranges = self.coverage.lock().unwrap();
        let mut hits = ranges_intersecting(ranges.get(address).map(Vec::as_slice).unwrap_or(&[]), from, to);
        for hit in &mut hits {
            hit.address = address.to_string();
        }
        Ok((logs, hits))
    }

    async fn store_logs(
        &self,
        addresses: &[String],
        logs: &[LogRecord],
        from: u64,
        to: u64,
    ) -> Result<(), DownloaderError> {
        {
            let mut store = self.logs.lock().unwrap();
            for log in logs {
                store.insert(log.key(), log.clone());
            }
        }
        let range = BlockRange::new(from, to)
            .ok_or_else(|| DownloaderError::Storage(format!("invalid coverage range [{from},{to}]")))?;
        let mut coverage = self.coverage.lock().unwrap();
        for address in addresses {
            merge_coverage(coverage.entry(address.clone()).or_default(), range);
        }
        Ok(())
    }

    async fn handle_reorg(&self, first_reorg_block: u64) -> Result<(), DownloaderError> {
        {
            let mut store = self.logs.lock().unwrap();
            for log in store.values_mut() {
                if log.block_number >= first_reorg_block {
                    log.removed = true;
                }
            }
        }
        let mut coverage = self.coverage.lock().unwrap();
        for ranges in coverage.values_mut() {
            ranges.retain(|r| r.to < first_reorg_block);
        }
        Ok(())
    }

    async fn prune_below(&self, n: u64) -> Result<(), DownloaderError> {
        self.logs.lock().unwrap().retain(|_, log| log.block_number >= n);
        let mut coverage = self.coverage.lock().unwrap();
        for ranges in coverage.values_mut() {
            ranges.retain(|r| r.to >= n);
        }
        Ok(())
    }

    async fn get_unsynced_topics(
        &self,
        filters: &[(String, Option<String>)],
        up_to_block: u64,
    ) -> Result<Vec<UnsyncedTopic>, DownloaderError> {
        let coverage = self.coverage.lock().unwrap();
        let mut out = Vec::new();
        for (address, topic0) in filters {
            let tail = covered_tail(coverage.get(address).map(Vec::as_slice).unwrap_or(&[]), up_to_block);
            if tail < up_to_block {
                out.push(UnsyncedTopic {
                    address: address.clone(),
                    topic0: topic0.clone(),
                    covered_tail: tail,
                });
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log(address: &str, topic0: &str, block: u64) -> LogRecord {
        LogRecord {
            address: address.into(),
            topics: vec![topic0.into()],
            data: "0x".into(),
            block_number: block,
            block_hash: "0xh".into(),
            tx_hash: format!("0xtx{block}"),
            tx_index: 0,
            log_index: 0,
            removed: false,
        }
    }

    #[tokio::test]
    async fn sync_state_genesis_then_checkpoint() {
        let store = InMemoryStorage::new();
        assert_eq!(SyncStateStore::get(&store).await.unwrap().last_indexed_block, 0);
        store.save_checkpoint(100, "0xabc", SyncMode::Live).await.unwrap();
        assert_eq!(SyncStateStore::get(&store).await.unwrap().last_indexed_block, 100);
    }

    #[tokio::test]
    async fn reorg_ledger_record_and_query() {
        let store = InMemoryStorage::new();
        ReorgLedger::record(&store, &[BlockHeader { number: 100, hash: "0xa".into(), parent_hash: "0x0".into() }])
            .await
            .unwrap();
        assert_eq!(store.canonical_hash(100).await.unwrap(), Some("0xa".into()));
    }

    #[tokio::test]
    async fn log_cache_store_and_query() {
        let store = InMemoryStorage::new();
        let logs = vec![log("0xabc", "0xevt", 100), log("0xabc", "0xevt", 101)];
        store.store_logs(&["0xabc".to_string()], &logs, 100, 199).await.unwrap();

        let (found, coverage) = store.get_logs("0xabc", Some("0xevt"), 0, 200).await.unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(coverage.len(), 1);
        assert_eq!(coverage[0].to_block, 199);
    }

    #[tokio::test]
    async fn log_cache_idempotent_store() {
        let store = InMemoryStorage::new();
        let logs = vec![log("0xabc", "0xevt", 100)];
        store.store_logs(&["0xabc".to_string()], &logs, 100, 100).await.unwrap();
        store.store_logs(&["0xabc".to_string()], &logs, 100, 100).await.unwrap();

        let (found, _) = store.get_logs("0xabc", None, 0, 200).await.unwrap();
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn log_cache_reorg_marks_removed_and_drops_coverage() {
        let store = InMemoryStorage::new();
        let logs = vec![log("0xabc", "0xevt", 100), log("0xabc", "0xevt", 200)];
        store.store_logs(&["0xabc".to_string()], &logs, 100, 200).await.unwrap();

        store.handle_reorg(150).await.unwrap();

        let (found, coverage) = store.get_logs("0xabc", None, 0, 300).await.unwrap();
        assert_eq!(found.len(), 1); // block 100 survives, 200 removed
        assert!(coverage.is_empty()); // the [100,200] row's to_block >= 150
    }

    #[tokio::test]
    async fn get_unsynced_topics_reports_tail_for_late_joiner() {
        let store = InMemoryStorage::new();
        let logs: Vec<_> = (0..1000).map(|n| log("0xabc", "0xevt", n)).collect();
        store.store_logs(&["0xabc".to_string()], &logs, 0, 999).await.unwrap();

        let filters = vec![("0xabc".to_string(), Some("0xevt".to_string()))];
        let unsynced = store.get_unsynced_topics(&filters, 1_000_000).await.unwrap();
        assert_eq!(unsynced.len(), 1);
        assert_eq!(unsynced[0].covered_tail, 999);
    }
}
