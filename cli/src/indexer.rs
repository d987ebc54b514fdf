//! A minimal built-in indexer that logs every delivered event. Individual
//! indexer schemas are out of scope for this binary (spec.md §1
//! Non-goals); this exists only so the downloader has somewhere to send
//! logs without requiring every deployment to embed its own.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use downloader_core::{Indexer, LogRecord};
use tracing::{info, warn};

pub struct LoggingIndexer {
    name: String,
    address: String,
    topics: HashSet<String>,
    start_block: u64,
}

impl LoggingIndexer {
    pub fn new(name: impl Into<String>, address: String, topics: Vec<String>, start_block: u64) -> Self {
        Self {
            name: name.into(),
            address: address.to_lowercase(),
            topics: topics.into_iter().map(|t| t.to_lowercase()).collect(),
            start_block,
        }
    }
}

#[async_trait]
impl Indexer for LoggingIndexer {
    fn events_to_index(&self) -> HashMap<String, HashSet<String>> {
        [(self.address.clone(), self.topics.clone())].into_iter().collect()
    }

    fn start_block(&self) -> u64 {
        self.start_block
    }

    async fn handle_logs(&self, logs: &[LogRecord]) -> Result<(), String> {
        for log in logs {
            info!(
                indexer = %self.name,
                address = %log.address,
                block = log.block_number,
                tx_hash = %log.tx_hash,
                log_index = log.log_index,
                "log delivered"
            );
        }
        Ok(())
    }

    async fn handle_reorg(&self, first_reorg_block: u64) -> Result<(), String> {
        warn!(indexer = %self.name, first_reorg_block, "rolling back past reorg point");
        Ok(())
    }

    fn get_type(&self) -> &str {
        "logging"
    }

    fn get_name(&self) -> &str {
        &self.name
    }
}
