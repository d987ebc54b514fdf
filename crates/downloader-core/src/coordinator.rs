//! Indexer Coordinator — routes each log to the indexers interested in its
//! `(address, topic0)` pair, fans out concurrently, and waits for the whole
//! batch before returning (spec §4.7).

use async_trait::async_trait;
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::types::LogRecord;

/// The capability set every consumer implements (spec §6 "Indexer contract").
#[async_trait]
pub trait Indexer: Send + Sync {
    /// `address -> topic0 set`. An empty topic set means "every event at
    /// this address".
    fn events_to_index(&self) -> HashMap<String, HashSet<String>>;

    fn start_block(&self) -> u64;

    /// Called with a filtered bucket, in block-ascending order within a
    /// cycle. Implementations must be idempotent per `(tx_hash, log_index)`
    /// since a failed cycle replays on restart (spec §7).
    async fn handle_logs(&self, logs: &[LogRecord]) -> Result<(), String>;

    /// Must remove or invalidate any locally persisted state with
    /// `block_number >= first_reorg_block`.
    async fn handle_reorg(&self, first_reorg_block: u64) -> Result<(), String>;

    fn get_type(&self) -> &str;
    fn get_name(&self) -> &str;
}

struct Registration {
    indexer: Arc<dyn Indexer>,
    start_block: u64,
}

/// Builds the `address_topic -> [indexer]` and `address_all -> [indexer]`
/// routing maps at startup and dispatches per cycle.
#[derive(Default)]
pub struct Coordinator {
    address_topic: HashMap<(String, String), Vec<usize>>,
    address_all: HashMap<String, Vec<usize>>,
    registrations: Vec<Registration>,
}

impl Coordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an indexer, building its routing entries.
    pub fn register(&mut self, indexer: Arc<dyn Indexer>) {
        let idx = self.registrations.len();
        let start_block = indexer.start_block();
        let interests = indexer.events_to_index();

        for (address, topics) in interests {
            let address = address.to_lowercase();
            if topics.is_empty() {
                self.address_all.entry(address).or_default().push(idx);
            } else {
                for topic in topics {
                    self.address_topic
                        .entry((address.clone(), topic.to_lowercase()))
                        .or_default()
                        .push(idx);
                }
            }
        }

        self.registrations.push(Registration { indexer, start_block });
    }

    /// The deduplicated set of registration indices interested in `log`.
    fn interested_in(&self, log: &LogRecord) -> HashSet<usize> {
        let address = log.address.to_lowercase();
        let mut set = HashSet::new();

        if let Some(v) = self.address_all.get(&address) {
            set.extend(v.iter().copied());
        }
        if let Some(topic0) = log.topic0() {
            if let Some(v) = self.address_topic.get(&(address, topic0.to_lowercase())) {
                set.extend(v.iter().copied());
            }
        }
        set
    }

    /// Dispatch a FetchResult's logs to every interested indexer, respecting
    /// each indexer's `start_block`, concurrently, returning the first error
    /// (others still run to completion — spec §4.7 step 5).
    pub async fn handle_logs(&self, logs: &[LogRecord]) -> Result<(), String> {
        let mut buckets: HashMap<usize, Vec<LogRecord>> = HashMap::new();

        for log in logs {
            for idx in self.interested_in(log) {
                let reg = &self.registrations[idx];
                if log.block_number < reg.start_block {
                    continue; // I5: no-double-deliver-below-start
                }
                buckets.entry(idx).or_default().push(log.clone());
            }
        }

        let dispatches = buckets.into_iter().map(|(idx, mut bucket)| {
            bucket.sort_by(|a, b| (a.block_number, a.log_index).cmp(&(b.block_number, b.log_index)));
            let indexer = self.registrations[idx].indexer.clone();
            async move { indexer.handle_logs(&bucket).await }
        });

        let results = join_all(dispatches).await;
        results.into_iter().find_map(Result::err).map_or(Ok(()), Err)
    }

    /// Notify every registered indexer of a reorg, sequentially, stopping at
    /// (and returning) the first error.
    pub async fn handle_reorg(&self, first_reorg_block: u64) -> Result<(), String> {
        for reg in &self.registrations {
            reg.indexer.handle_reorg(first_reorg_block).await?;
        }
        Ok(())
    }

    /// One `(address, topics, start_block)` triple per registered indexer's
    /// interest, for the Orchestrator to aggregate into a [`crate::FilterSet`].
    /// An empty topic vec means "every event at this address".
    pub fn filter_triples(&self) -> Vec<(String, Vec<String>, u64)> {
        let mut out = Vec::new();
        for reg in &self.registrations {
            for (address, topics) in reg.indexer.events_to_index() {
                out.push((address, topics.into_iter().collect(), reg.start_block));
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }
}
