//! Log Fetcher — `FetchRange` (overflow-retry + verify + store) and
//! `FetchNext` (the backfill/live driver), spec §4.6.
//!
//! Generalizes the teacher's backfill/live split in `index_loop.rs` into the
//! cache-consult, finality-resolution, and overflow-retry algorithm spec'd
//! here. Unlike the teacher, live-mode catch-up waits *iteratively*
//! (loop + sleep) rather than recursing — an unbounded live deployment would
//! otherwise grow its call stack without bound.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use downloader_core::{
    DownloaderConfig, DownloaderError, FetchResult, FilterSet, Finality, ReorgLedger, ReorgVerifier,
    SyncMode,
};
use downloader_storage::LogCache;

use crate::rpc::{FinalityTag, GetLogsFilter, RpcClient, RpcError, RpcTransport};

/// What one `fetch_next` call produced.
pub enum FetchNextOutcome {
    /// A batch was fetched, verified, and stored; `mode` is the mode the
    /// *next* cycle should run in (may have flipped from backfill to live).
    Fetched { result: FetchResult, mode: SyncMode },
    /// Cancellation was observed while waiting for the next live block.
    Cancelled,
}

/// The Log Fetcher: narrows the aggregated filter set per call, retries
/// provider overflow errors, verifies against the Reorg Verifier, and
/// persists accepted batches to the Log Cache.
pub struct LogFetcher<T: RpcTransport> {
    rpc: RpcClient<T>,
    cache: Arc<dyn LogCache>,
    ledger: Arc<dyn ReorgLedger>,
    filters: FilterSet,
    config: DownloaderConfig,
}

impl<T: RpcTransport> LogFetcher<T> {
    pub fn new(
        rpc: RpcClient<T>,
        cache: Arc<dyn LogCache>,
        ledger: Arc<dyn ReorgLedger>,
        filters: FilterSet,
        config: DownloaderConfig,
    ) -> Self {
        Self { rpc, cache, ledger, filters, config }
    }

    /// Every `(address, topic0)` pair this fetcher is configured to track;
    /// an address with no topics registered matches `None` (every topic).
    fn filter_pairs(&self) -> Vec<(String, Option<String>)> {
        self.filters
            .addresses
            .iter()
            .zip(self.filters.topics.iter())
            .flat_map(|(addr, topics)| {
                if topics.is_empty() {
                    vec![(addr.clone(), None)]
                } else {
                    topics.iter().map(|t| (addr.clone(), Some(t.clone()))).collect::<Vec<_>>()
                }
            })
            .collect()
    }

    async fn resolve_finalized_block(&self) -> Result<u64, DownloaderError> {
        let header = match self.config.finality {
            Finality::Finalized => self.rpc.get_block_header_by_tag(FinalityTag::Finalized).await,
            Finality::Safe => self.rpc.get_block_header_by_tag(FinalityTag::Safe).await,
            Finality::Latest { lag } => {
                let latest = self.rpc.get_block_header_by_tag(FinalityTag::Latest).await?;
                let target = latest.number.saturating_sub(lag);
                if target == latest.number {
                    Ok(latest)
                } else {
                    self.rpc.get_block_header_by_number(target).await
                }
            }
        }
        .map_err(DownloaderError::from)?;
        Ok(header.number)
    }

    /// `FetchRange` (spec §4.6.3): narrow, call, retry on overflow, verify,
    /// store. `addresses`/`topics` are already the active, aligned subset.
    async fn fetch_range(
        &self,
        addresses: &[String],
        topics: &[Vec<String>],
        from: u64,
        to: u64,
    ) -> Result<FetchResult, DownloaderError> {
        let mut cur_from = from;
        let mut cur_to = to;

        loop {
            let logs = if addresses.is_empty() {
                Vec::new()
            } else {
                let filter = GetLogsFilter {
                    addresses: addresses.to_vec(),
                    topics: topics.to_vec(),
                    from_block: cur_from,
                    to_block: cur_to,
                };
                match self.rpc.get_logs(&filter).await {
                    Ok(logs) => logs,
                    Err(RpcError::TooManyResults { suggested_range: Some((s, e)) }) => {
                        cur_from = s;
                        cur_to = e;
                        continue;
                    }
                    Err(RpcError::TooManyResults { suggested_range: None }) => {
                        let mid = (cur_from + cur_to) / 2;
                        if mid == cur_from {
                            return Err(DownloaderError::IndivisibleRange { block: cur_from });
                        }
                        cur_to = mid;
                        continue;
                    }
                    Err(e) => return Err(DownloaderError::from(e)),
                }
            };

            let verifier = ReorgVerifier::new(&self.rpc, self.ledger.as_ref());
            return match verifier.verify(&logs, cur_from, cur_to).await {
                Ok(headers) => {
                    self.cache.store_logs(addresses, &logs, cur_from, cur_to).await?;
                    Ok(FetchResult { logs, headers, effective_from: cur_from, effective_to: cur_to })
                }
                Err(e) => {
                    if let Some(block) = e.first_reorg_block() {
                        self.cache.handle_reorg(block).await?;
                    }
                    Err(e)
                }
            };
        }
    }

    /// `FetchNext` (spec §4.6.4): the driver one Orchestrator cycle calls.
    pub async fn fetch_next(
        &self,
        last_indexed_block: u64,
        mode: SyncMode,
        cancel: &CancellationToken,
    ) -> Result<FetchNextOutcome, DownloaderError> {
        // Step 1: cache-consult catch-up. A late-joining indexer registers
        // with its own `start_block`, which can sit well above the
        // downloader's global `start_block` (spec scenario S5); gate on the
        // per-address start so that indexer's gap gets backfilled instead of
        // silently skipped. `to` is re-anchored to `from` (not to
        // `covered_tail`) so the range stays `from <= to` even when `from`
        // jumps ahead to a late start_block.
        let pairs = self.filter_pairs();
        if !pairs.is_empty() {
            let unsynced = self.cache.get_unsynced_topics(&pairs, last_indexed_block).await?;
            let address_start = |address: &str| {
                self.filters
                    .address_start_blocks
                    .get(address)
                    .copied()
                    .unwrap_or(self.config.start_block)
            };
            if let Some(u) = unsynced.iter().find(|u| u.covered_tail < address_start(&u.address)) {
                let from = address_start(&u.address).max(u.covered_tail + 1);
                let to = (from + self.config.chunk_size - 1).min(last_indexed_block);
                if from <= to {
                    let addrs = vec![u.address.clone()];
                    let topics = vec![u.topic0.clone().into_iter().collect()];
                    let result = self.fetch_range(&addrs, &topics, from, to).await?;
                    return Ok(FetchNextOutcome::Fetched { result, mode });
                }
            }
        }

        let mut finalized = self.resolve_finalized_block().await?;
        let mut mode = mode;

        loop {
            match mode {
                SyncMode::Backfill => {
                    if last_indexed_block + 1 > finalized {
                        mode = SyncMode::Live;
                        continue;
                    }
                    let from = last_indexed_block + 1;
                    let to = (last_indexed_block + self.config.chunk_size).min(finalized);
                    let (addrs, topics) = self.filters.active_for(from);
                    let result = self.fetch_range(&addrs, &topics, from, to).await?;
                    return Ok(FetchNextOutcome::Fetched { result, mode });
                }
                SyncMode::Live => {
                    if last_indexed_block + 1 > finalized {
                        if cancel.is_cancelled() {
                            return Ok(FetchNextOutcome::Cancelled);
                        }
                        tokio::select! {
                            _ = cancel.cancelled() => return Ok(FetchNextOutcome::Cancelled),
                            _ = tokio::time::sleep(Duration::from_secs(self.config.block_time_secs)) => {}
                        }
                        finalized = self.resolve_finalized_block().await?;
                        continue;
                    }
                    let from = last_indexed_block + 1;
                    let to = (last_indexed_block + self.config.chunk_size).min(finalized);
                    let (addrs, topics) = self.filters.active_for(from);
                    let result = self.fetch_range(&addrs, &topics, from, to).await?;
                    return Ok(FetchNextOutcome::Fetched { result, mode });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use downloader_core::BlockHeader;
    use downloader_storage::InMemoryStorage;
    use serde_json::{json, Value};
    use std::sync::Mutex as StdMutex;

    struct FakeTransport {
        chain: Vec<BlockHeader>,
        logs_by_range: StdMutex<Vec<((u64, u64), Result<Value, RpcError>)>>,
    }

    fn hdr(n: u64, hash: &str, parent: &str) -> BlockHeader {
        BlockHeader { number: n, hash: hash.into(), parent_hash: parent.into() }
    }

    fn to_hex(n: u64) -> String {
        format!("0x{n:x}")
    }

    fn parse_hex(s: &str) -> u64 {
        u64::from_str_radix(s.strip_prefix("0x").unwrap_or(s), 16).unwrap_or(0)
    }

    fn raw_log(address: &str, topic0: &str, block: u64, log_index: u64) -> Value {
        json!({
            "address": address,
            "topics": [topic0],
            "data": "0x",
            "blockNumber": to_hex(block),
            "blockHash": format!("0xh{block}"),
            "transactionHash": format!("0xtx{block}-{log_index}"),
            "transactionIndex": "0x0",
            "logIndex": to_hex(log_index),
            "removed": false,
        })
    }

    #[async_trait::async_trait]
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
                "eth_getLogs" => {
                    let from = parse_hex(params[0]["fromBlock"].as_str().unwrap());
                    let to = parse_hex(params[0]["toBlock"].as_str().unwrap());
                    let mut queue = self.logs_by_range.lock().unwrap();
                    if let Some(pos) = queue.iter().position(|((f, t), _)| *f == from && *t == to) {
                        queue.remove(pos).1
                    } else {
                        Ok(json!([]))
                    }
                }
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

    fn fetcher_with(
        chain: Vec<BlockHeader>,
        logs: Vec<((u64, u64), Result<Value, RpcError>)>,
        addresses: Vec<String>,
        topics: Vec<Vec<String>>,
        config: DownloaderConfig,
    ) -> (LogFetcher<FakeTransport>, Arc<InMemoryStorage>) {
        let storage = Arc::new(InMemoryStorage::new());
        let transport = FakeTransport { chain, logs_by_range: StdMutex::new(logs) };
        let rpc = RpcClient::new(transport, config.too_many_results_markers.clone());
        let cache: Arc<dyn LogCache> = storage.clone();
        let ledger: Arc<dyn ReorgLedger> = storage.clone();
        let mut filters = FilterSet::default();
        for (addr, t) in addresses.into_iter().zip(topics.into_iter()) {
            filters.addresses.push(addr.clone());
            filters.topics.push(t);
            filters.address_start_blocks.insert(addr, 0);
        }
        (LogFetcher::new(rpc, cache, ledger, filters, config), storage)
    }

    fn base_config() -> DownloaderConfig {
        DownloaderConfig {
            chunk_size: 100,
            finality: Finality::Finalized,
            start_block: 0,
            block_time_secs: 0,
            too_many_results_markers: vec!["too many results".into()],
        }
    }

    #[tokio::test]
    async fn backfill_fetches_up_to_finalized_and_switches_to_live() {
        let chain = dense_chain(0, 50);
        let logs = vec![((1, 50), Ok(json!([raw_log("0xabc", "0xevt", 10, 0)])))];
        let (fetcher, _storage) = fetcher_with(
            chain,
            logs,
            vec!["0xabc".to_string()],
            vec![vec!["0xevt".to_string()]],
            base_config(),
        );

        let cancel = CancellationToken::new();
        match fetcher.fetch_next(0, SyncMode::Backfill, &cancel).await.unwrap() {
            FetchNextOutcome::Fetched { result, mode } => {
                assert_eq!(result.effective_from, 1);
                assert_eq!(result.effective_to, 50);
                assert_eq!(result.logs.len(), 1);
                assert_eq!(mode, SyncMode::Backfill);
            }
            FetchNextOutcome::Cancelled => panic!("unexpected cancellation"),
        }

        // Now last_indexed_block catches up to the finalized head: backfill
        // flips to live, which then waits for a new block. Cancel up front
        // so the wait resolves immediately instead of polling forever.
        cancel.cancel();
        match fetcher.fetch_next(50, SyncMode::Backfill, &cancel).await.unwrap() {
            FetchNextOutcome::Cancelled => {}
            FetchNextOutcome::Fetched { .. } => panic!("nothing new past the finalized head"),
        }
    }

    #[tokio::test]
    async fn too_many_results_with_suggested_range_narrows_effective_range() {
        let chain = dense_chain(0, 2000);
        let logs = vec![
            (
                (1, 2000),
                Err(RpcError::TooManyResults { suggested_range: Some((1, 500)) }),
            ),
            ((1, 500), Ok(json!([]))),
        ];
        let mut config = base_config();
        config.chunk_size = 2000;
        let (fetcher, _storage) = fetcher_with(chain, logs, vec!["0xabc".to_string()], vec![vec![]], config);

        let cancel = CancellationToken::new();
        match fetcher.fetch_next(0, SyncMode::Backfill, &cancel).await.unwrap() {
            FetchNextOutcome::Fetched { result, .. } => {
                assert_eq!(result.effective_from, 1);
                assert_eq!(result.effective_to, 500);
            }
            FetchNextOutcome::Cancelled => panic!("unexpected cancellation"),
        }
    }

    #[tokio::test]
    async fn overflow_without_suggestion_halves_until_success() {
        let chain = dense_chain(0, 2000);
        let logs = vec![
            ((1, 2000), Err(RpcError::TooManyResults { suggested_range: None })),
            ((1, 1000), Err(RpcError::TooManyResults { suggested_range: None })),
            ((1, 500), Ok(json!([]))),
        ];
        let mut config = base_config();
        config.chunk_size = 2000;
        let (fetcher, _storage) = fetcher_with(chain, logs, vec!["0xabc".to_string()], vec![vec![]], config);

        let cancel = CancellationToken::new();
        match fetcher.fetch_next(0, SyncMode::Backfill, &cancel).await.unwrap() {
            FetchNextOutcome::Fetched { result, .. } => {
                assert_eq!(result.effective_from, 1);
                assert_eq!(result.effective_to, 500);
            }
            FetchNextOutcome::Cancelled => panic!("unexpected cancellation"),
        }
    }

    #[tokio::test]
    async fn single_block_overflow_is_indivisible() {
        let chain = dense_chain(0, 10);
        let logs = vec![((5, 5), Err(RpcError::TooManyResults { suggested_range: None }))];
        let mut config = base_config();
        config.chunk_size = 1;
        let (fetcher, _storage) = fetcher_with(chain, logs, vec!["0xabc".to_string()], vec![vec![]], config);

        let cancel = CancellationToken::new();
        let err = fetcher.fetch_next(4, SyncMode::Backfill, &cancel).await.unwrap_err();
        assert!(matches!(err, DownloaderError::IndivisibleRange { block: 5 }));
    }

    #[tokio::test]
    async fn reorg_during_verify_invalidates_cache() {
        let mut chain = dense_chain(0, 10);
        // Corrupt the continuity at block 6 so verification fails there.
        chain[6].parent_hash = "0xWRONG".into();
        let logs = vec![((1, 10), Ok(json!([])))];
        let mut config = base_config();
        config.chunk_size = 10;
        let (fetcher, storage) = fetcher_with(chain, logs, vec!["0xabc".to_string()], vec![vec![]], config);

        storage.store_logs(&["0xabc".to_string()], &[], 0, 8).await.unwrap();

        let cancel = CancellationToken::new();
        let err = fetcher.fetch_next(0, SyncMode::Backfill, &cancel).await.unwrap_err();
        assert_eq!(err.first_reorg_block(), Some(6));

        let (_, coverage) = storage.get_logs("0xabc", None, 0, 8).await.unwrap();
        assert!(coverage.is_empty(), "coverage overlapping the reorg point must be invalidated");
    }

    #[tokio::test]
    async fn cancellation_during_live_wait_is_observed() {
        let chain = dense_chain(0, 10);
        let mut config = base_config();
        config.block_time_secs = 60;
        let (fetcher, _storage) = fetcher_with(chain, vec![], vec!["0xabc".to_string()], vec![vec![]], config);

        let cancel = CancellationToken::new();
        cancel.cancel();
        match fetcher.fetch_next(10, SyncMode::Live, &cancel).await.unwrap() {
            FetchNextOutcome::Cancelled => {}
            FetchNextOutcome::Fetched { .. } => panic!("expected cancellation, not a fetch"),
        }
    }
}
