//! Downloader Orchestrator — the top-level cycle that owns the Sync State
//! Store, drives the Log Fetcher, and fans results out through the Indexer
//! Coordinator (spec §4.8).
//!
//! Generalizes the teacher's `IndexLoop::run` in `index_loop.rs`: where that
//! loop owned one chain/one indexer, this orchestrator aggregates every
//! registered indexer's interests into a single [`FilterSet`] and drives one
//! shared [`LogFetcher`] cycle per tick, fanning the result out through a
//! [`Coordinator`].

use std::collections::HashSet;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use downloader_core::{
    Coordinator, DownloaderConfig, DownloaderError, FilterSet, ReorgLedger, SyncMode,
    SyncStateStore,
};
use downloader_storage::LogCache;

use crate::fetcher_loop::{FetchNextOutcome, LogFetcher};
use crate::rpc::{RpcClient, RpcTransport};

/// Builds the aggregated [`FilterSet`] the Fetcher narrows per cycle from
/// every indexer the [`Coordinator`] has registered.
fn build_filter_set(coordinator: &Coordinator) -> FilterSet {
    let mut filters = FilterSet::default();
    let mut seen_addresses: HashSet<String> = HashSet::new();

    for (address, topics, start_block) in coordinator.filter_triples() {
        let address = address.to_lowercase();
        let entry = filters
            .address_start_blocks
            .entry(address.clone())
            .or_insert(start_block);
        *entry = (*entry).min(start_block);

        if seen_addresses.insert(address.clone()) {
            filters.addresses.push(address);
            filters.topics.push(topics);
        } else {
            // Merge this indexer's topic interest into the address's set;
            // an empty set ("every topic") takes precedence.
            let idx = filters.addresses.iter().position(|a| a == &address).unwrap();
            if !filters.topics[idx].is_empty() {
                if topics.is_empty() {
                    filters.topics[idx].clear();
                } else {
                    for t in topics {
                        if !filters.topics[idx].contains(&t) {
                            filters.topics[idx].push(t);
                        }
                    }
                }
            }
        }
    }

    filters
}

/// Drives one run of the downloader pipeline to completion or cancellation
/// (spec §4.8). Returns once `cancel` is observed during a live-mode wait;
/// any other error aborts the run without advancing the checkpoint, so the
/// range replays on restart.
pub struct Orchestrator<T: RpcTransport> {
    fetcher: LogFetcher<T>,
    coordinator: Coordinator,
    sync_state: Arc<dyn SyncStateStore>,
    reorg_ledger: Arc<dyn ReorgLedger>,
    cache: Arc<dyn LogCache>,
}

impl<T: RpcTransport> Orchestrator<T> {
    pub fn new(
        rpc: RpcClient<T>,
        cache: Arc<dyn LogCache>,
        reorg_ledger: Arc<dyn ReorgLedger>,
        sync_state: Arc<dyn SyncStateStore>,
        coordinator: Coordinator,
        config: DownloaderConfig,
    ) -> Self {
        let filters = build_filter_set(&coordinator);
        let fetcher = LogFetcher::new(rpc, cache.clone(), reorg_ledger.clone(), filters, config);
        Self { fetcher, coordinator, sync_state, reorg_ledger, cache }
    }

    /// Runs cycles until `cancel` fires. Each cycle is one `FetchNext` call
    /// followed by coordinator dispatch and a checkpoint write, in that
    /// order (spec §5's write-ordering: verify and cache-store already
    /// happen inside the Fetcher, so the remaining order this loop owns is
    /// "deliver to indexers, then move the checkpoint").
    pub async fn run(&self, cancel: &CancellationToken) -> Result<(), DownloaderError> {
        loop {
            if cancel.is_cancelled() {
                break;
            }

            let state = self.sync_state.get().await?;

            match self.fetcher.fetch_next(state.last_indexed_block, state.mode, cancel).await {
                Ok(FetchNextOutcome::Cancelled) => break,
                Ok(FetchNextOutcome::Fetched { result, mode }) => {
                    if let Err(e) = self.coordinator.handle_logs(&result.logs).await {
                        error!(error = %e, "indexer rejected a batch; checkpoint not advanced");
                        return Err(DownloaderError::IndexerFailure {
                            indexer: "coordinator".to_string(),
                            reason: e,
                        });
                    }

                    let last_header = result
                        .headers
                        .iter()
                        .max_by_key(|h| h.number)
                        .cloned();
                    let (block, hash) = match last_header {
                        Some(h) => (h.number, h.hash),
                        None => (result.effective_to, state.last_indexed_block_hash.clone()),
                    };

                    self.sync_state.save_checkpoint(block, &hash, mode).await?;
                    if mode != state.mode {
                        info!(from = %state.mode, to = %mode, "sync mode transition");
                    }
                }
                Err(e) if e.is_reorg() => {
                    let first_reorg_block = e.first_reorg_block().unwrap();
                    warn!(first_reorg_block, "reorg detected; rewinding");

                    if let Err(reason) = self.coordinator.handle_reorg(first_reorg_block).await {
                        error!(error = %reason, "indexer failed to roll back on reorg");
                        return Err(DownloaderError::IndexerFailure {
                            indexer: "coordinator".to_string(),
                            reason,
                        });
                    }

                    self.sync_state.reset(first_reorg_block.saturating_sub(1)).await?;
                }
                Err(e) => {
                    error!(error = %e, "fetch cycle aborted");
                    return Err(e);
                }
            }
        }

        self.shutdown().await
    }

    /// Releases durable resources in dependency order: sync state, then the
    /// reorg ledger, then the log cache.
    async fn shutdown(&self) -> Result<(), DownloaderError> {
        self.sync_state.close().await?;
        self.reorg_ledger.close().await?;
        self.cache.close().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use downloader_core::{BlockHeader, Finality, Indexer, LogRecord};
    use downloader_storage::InMemoryStorage;
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Mutex as AsyncMutex;

    use crate::rpc::{RpcError, RpcTransport};

    struct FakeTransport {
        chain: Vec<BlockHeader>,
    }

    fn hdr(n: u64, hash: &str, parent: &str) -> BlockHeader {
        BlockHeader { number: n, hash: hash.into(), parent_hash: parent.into() }
    }

    fn dense_chain(from: u64, to: u64) -> Vec<BlockHeader> {
        let mut out = Vec::new();
        let mut parent = "0x0".to_string();
        for n in from..=to {
            let hash = format!("0xh{n}");
            out.push(hdr(n, &hash, &parent));
            parent = hash;
        }
        out
    }

    fn to_hex(n: u64) -> String {
        format!("0x{n:x}")
    }

    fn parse_hex(s: &str) -> u64 {
        u64::from_str_radix(s.strip_prefix("0x").unwrap_or(s), 16).unwrap_or(0)
    }

    #[async_trait]
    impl RpcTransport for FakeTransport {
        async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
            match method {
                "eth_getBlockByNumber" => {
                    let requested = params[0].as_str().unwrap();
                    let number = match requested {
                        "latest" | "safe" | "finalized" => self.chain.last().map(|h| h.number).unwrap_or(0),
                        hex => parse_hex(hex),
                    };
                    let header = self.chain.iter().find(|h| h.number == number).cloned();
                    Ok(header
                        .map(|h| json!({"number": to_hex(h.number), "hash": h.hash, "parentHash": h.parent_hash}))
                        .unwrap_or(Value::Null))
                }
                "eth_getLogs" => Ok(json!([])),
                other => panic!("unexpected method {other}"),
            }
        }

        async fn batch_call(&self, calls: Vec<(&str, Value)>) -> Result<Vec<Value>, RpcError> {
            let mut out = Vec::new();
            for (method, params) in calls {
                out.push(self.call(method, params).await?);
            }
            Ok(out)
        }
    }

    struct RecordingIndexer {
        address: String,
        received: AsyncMutex<Vec<LogRecord>>,
        reorg_calls: StdMutex<Vec<u64>>,
    }

    #[async_trait]
    impl Indexer for RecordingIndexer {
        fn events_to_index(&self) -> HashMap<String, HashSet<String>> {
            [(self.address.clone(), HashSet::new())].into_iter().collect()
        }

        fn start_block(&self) -> u64 {
            0
        }

        async fn handle_logs(&self, logs: &[LogRecord]) -> Result<(), String> {
            self.received.lock().await.extend_from_slice(logs);
            Ok(())
        }

        async fn handle_reorg(&self, first_reorg_block: u64) -> Result<(), String> {
            self.reorg_calls.lock().unwrap().push(first_reorg_block);
            Ok(())
        }

        fn get_type(&self) -> &str {
            "test"
        }

        fn get_name(&self) -> &str {
            "recorder"
        }
    }

    fn config() -> DownloaderConfig {
        DownloaderConfig {
            chunk_size: 100,
            finality: Finality::Finalized,
            start_block: 0,
            block_time_secs: 60,
            too_many_results_markers: vec!["too many results".into()],
        }
    }

    #[tokio::test]
    async fn backfill_reaches_finalized_then_cancels_on_live_wait() {
        let chain = dense_chain(0, 10);
        let transport = FakeTransport { chain };
        let rpc = RpcClient::new(transport, config().too_many_results_markers.clone());

        let storage = Arc::new(InMemoryStorage::new());
        let cache: Arc<dyn LogCache> = storage.clone();
        let ledger: Arc<dyn ReorgLedger> = storage.clone();
        let sync_state: Arc<dyn SyncStateStore> =
            Arc::new(downloader_core::InMemorySyncStateStore::new());

        let mut coordinator = Coordinator::new();
        let indexer = Arc::new(RecordingIndexer {
            address: "0xabc".to_string(),
            received: AsyncMutex::new(Vec::new()),
            reorg_calls: StdMutex::new(Vec::new()),
        });
        coordinator.register(indexer.clone());

        let orchestrator =
            Orchestrator::new(rpc, cache, ledger, sync_state.clone(), coordinator, config());

        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            cancel_clone.cancel();
        });

        orchestrator.run(&cancel).await.unwrap();

        let state = sync_state.get().await.unwrap();
        assert_eq!(state.last_indexed_block, 10);
    }
}
