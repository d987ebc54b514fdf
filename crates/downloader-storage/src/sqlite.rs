//! SQLite backend — persists the Sync State, Reorg Ledger, and Log Cache to
//! a single SQLite file via `sqlx` (spec §6's four tables).

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use downloader_core::{
    BlockHeader, BlockRange, CoverageRange, DownloaderError, LogRecord, ReorgLedger, SyncMode,
    SyncState, SyncStateStore,
};

use crate::cache::{merge_coverage, LogCache, UnsyncedTopic};

/// SQLite-backed persistence for the sync state row, the reorg ledger, and
/// the log cache.
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (or create) a SQLite database at `path`. Accepts a bare file
    /// path or a full `sqlite:` URL.
    pub async fn open(path: &str) -> Result<Self, DownloaderError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };
        let pool = SqlitePool::connect(&url)
            .await
            .map_err(|e| DownloaderError::Storage(e.to_string()))?;
        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    /// In-memory SQLite database — useful for tests that want real SQL
    /// semantics without a file on disk.
    pub async fn in_memory() -> Result<Self, DownloaderError> {
        let pool = SqlitePool::connect("sqlite::memory:")
            .await
            .map_err(|e| DownloaderError::Storage(e.to_string()))?;
        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    async fn init_schema(&self) -> Result<(), DownloaderError> {
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await
            .map_err(|e| DownloaderError::Storage(e.to_string()))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS sync_state (
                id                       INTEGER PRIMARY KEY CHECK (id = 1),
                last_indexed_block       INTEGER NOT NULL,
                last_indexed_block_hash  TEXT    NOT NULL,
                last_indexed_timestamp   INTEGER NOT NULL,
                mode                     TEXT    NOT NULL
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| DownloaderError::Storage(e.to_string()))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS block_hashes (
                block_number INTEGER PRIMARY KEY,
                block_hash   TEXT    NOT NULL,
                parent_hash  TEXT    NOT NULL
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| DownloaderError::Storage(e.to_string()))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS event_logs (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                address      TEXT    NOT NULL,
                block_number INTEGER NOT NULL,
                block_hash   TEXT    NOT NULL,
                tx_hash      TEXT    NOT NULL,
                tx_index     INTEGER NOT NULL,
                log_index    INTEGER NOT NULL,
                topic0       TEXT,
                topic1       TEXT,
                topic2       TEXT,
                topic3       TEXT,
                data         TEXT    NOT NULL,
                removed      INTEGER NOT NULL DEFAULT 0,
                created_at   INTEGER NOT NULL,
                UNIQUE (tx_hash, log_index)
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| DownloaderError::Storage(e.to_string()))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_event_logs_address_block ON event_logs (address, block_number);")
            .execute(&self.pool)
            .await
            .map_err(|e| DownloaderError::Storage(e.to_string()))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS log_coverage (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                address    TEXT    NOT NULL,
                from_block INTEGER NOT NULL,
                to_block   INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                UNIQUE (address, from_block, to_block)
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| DownloaderError::Storage(e.to_string()))?;

        Ok(())
    }

    async fn coverage_ranges(&self, address: &str) -> Result<Vec<BlockRange>, DownloaderError> {
        let rows = sqlx::query("SELECT from_block, to_block FROM log_coverage WHERE address = ? ORDER BY from_block")
            .bind(address)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| DownloaderError::Storage(e.to_string()))?;
        Ok(rows
            .into_iter()
            .filter_map(|r| BlockRange::new(r.get::<i64, _>("from_block") as u64, r.get::<i64, _>("to_block") as u64))
            .collect())
    }

    async fn replace_coverage(&self, address: &str, ranges: &[BlockRange]) -> Result<(), DownloaderError> {
        let mut tx = self.pool.begin().await.map_err(|e| DownloaderError::Storage(e.to_string()))?;
        sqlx::query("DELETE FROM log_coverage WHERE address = ?")
            .bind(address)
            .execute(&mut *tx)
            .await
            .map_err(|e| DownloaderError::Storage(e.to_string()))?;
        for r in ranges {
            sqlx::query("INSERT INTO log_coverage (address, from_block, to_block, created_at) VALUES (?, ?, ?, ?)")
                .bind(address)
                .bind(r.from as i64)
                .bind(r.to as i64)
                .bind(chrono::Utc::now().timestamp())
                .execute(&mut *tx)
                .await
                .map_err(|e| DownloaderError::Storage(e.to_string()))?;
        }
        tx.commit().await.map_err(|e| DownloaderError::Storage(e.to_string()))
    }
}

fn row_to_log(row: &sqlx::sqlite::SqliteRow) -> LogRecord {
    let mut topics = Vec::new();
    for col in ["topic0", "topic1", "topic2", "topic3"] {
        if let Some(t) = row.get::<Option<String>, _>(col) {
            topics.push(t);
        }
    }
    LogRecord {
        address: row.get("address"),
        topics,
        data: row.get("data"),
        block_number: row.get::<i64, _>("block_number") as u64,
        block_hash: row.get("block_hash"),
        tx_hash: row.get("tx_hash"),
        tx_index: row.get::<i64, _>("tx_index") as u32,
        log_index: row.get::<i64, _>("log_index") as u32,
        removed: row.get::<i64, _>("removed") != 0,
    }
}

// ─── Sync State Store ────────────────────────────────────────────────────────

#[async_trait]
impl SyncStateStore for SqliteStorage {
    async fn get(&self) -> Result<SyncState, DownloaderError> {
        let row = sqlx::query("SELECT last_indexed_block, last_indexed_block_hash, last_indexed_timestamp, mode FROM sync_state WHERE id = 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| DownloaderError::Storage(e.to_string()))?;

        match row {
            Some(row) => Ok(SyncState {
                last_indexed_block: row.get::<i64, _>("last_indexed_block") as u64,
                last_indexed_block_hash: row.get("last_indexed_block_hash"),
                last_indexed_timestamp: row.get("last_indexed_timestamp"),
                mode: if row.get::<String, _>("mode") == "live" { SyncMode::Live } else { SyncMode::Backfill },
            }),
            None => {
                let genesis = SyncState::genesis(chrono::Utc::now().timestamp());
                self.save_checkpoint(genesis.last_indexed_block, &genesis.last_indexed_block_hash, genesis.mode).await?;
                Ok(genesis)
            }
        }
    }

    async fn save_checkpoint(&self, block: u64, hash: &str, mode: SyncMode) -> Result<(), DownloaderError> {
        sqlx::query(
            "INSERT INTO sync_state (id, last_indexed_block, last_indexed_block_hash, last_indexed_timestamp, mode)
             VALUES (1, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                last_indexed_block = excluded.last_indexed_block,
                last_indexed_block_hash = excluded.last_indexed_block_hash,
                last_indexed_timestamp = excluded.last_indexed_timestamp,
                mode = excluded.mode",
        )
        .bind(block as i64)
        .bind(hash)
        .bind(chrono::Utc::now().timestamp())
        .bind(mode.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| DownloaderError::Storage(e.to_string()))?;

        debug!(block, mode = %mode, "checkpoint saved");
        Ok(())
    }

    async fn set_mode(&self, mode: SyncMode) -> Result<(), DownloaderError> {
        let current = self.get().await?;
        self.save_checkpoint(current.last_indexed_block, &current.last_indexed_block_hash, mode).await
    }

    async fn reset(&self, start_block: u64) -> Result<(), DownloaderError> {
        self.save_checkpoint(start_block, &("0x".to_string() + &"0".repeat(64)), SyncMode::Backfill).await
    }

    async fn close(&self) -> Result<(), DownloaderError> {
        self.pool.close().await;
        Ok(())
    }
}

// ─── Reorg Ledger ────────────────────────────────────────────────────────────

#[async_trait]
impl ReorgLedger for SqliteStorage {
    async fn record(&self, headers: &[BlockHeader]) -> Result<(), DownloaderError> {
        let mut tx = self.pool.begin().await.map_err(|e| DownloaderError::Storage(e.to_string()))?;
        for h in headers {
            sqlx::query(
                "INSERT INTO block_hashes (block_number, block_hash, parent_hash) VALUES (?, ?, ?)
                 ON CONFLICT(block_number) DO UPDATE SET block_hash = excluded.block_hash, parent_hash = excluded.parent_hash",
            )
            .bind(h.number as i64)
            .bind(&h.hash)
            .bind(&h.parent_hash)
            .execute(&mut *tx)
            .await
            .map_err(|e| DownloaderError::Storage(e.to_string()))?;
        }
        tx.commit().await.map_err(|e| DownloaderError::Storage(e.to_string()))
    }

    async fn prune_below(&self, n: u64) -> Result<(), DownloaderError> {
        sqlx::query("DELETE FROM block_hashes WHERE block_number < ?")
            .bind(n as i64)
            .execute(&self.pool)
            .await
            .map_err(|e| DownloaderError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn canonical_hash(&self, n: u64) -> Result<Option<String>, DownloaderError> {
        let row = sqlx::query("SELECT block_hash FROM block_hashes WHERE block_number = ?")
            .bind(n as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| DownloaderError::Storage(e.to_string()))?;
        Ok(row.map(|r| r.get("block_hash")))
    }

    async fn close(&self) -> Result<(), DownloaderError> {
        Ok(())
    }
}

// ─── Log Cache ───────────────────────────────────────────────────────────────

#[async_trait]
impl LogCache for SqliteStorage {
    async fn get_logs(
        &self,
        address: &str,
        topic0: Option<&str>,
        from: u64,
        to: u64,
    ) -> Result<(Vec<LogRecord>, Vec<CoverageRange>), DownloaderError> {
        // The topic filter is applied in Rust rather than SQL, mirroring the
        // in-memory backend's filter and keeping both implementations
        // identical in observable behavior.
        let rows = sqlx::query(
            "SELECT address, block_number, block_hash, tx_hash, tx_index, log_index, topic0, topic1, topic2, topic3, data, removed
             FROM event_logs
             WHERE address = ? AND removed = 0 AND block_number BETWEEN ? AND ?",
        )
        .bind(address)
        .bind(from as i64)
        .bind(to as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| DownloaderError::Storage(e.to_string()))?;

        let logs: Vec<LogRecord> = rows
            .iter()
            .map(row_to_log)
            .filter(|l| topic0.map_or(true, |t| l.topic0() == Some(t)))
            .collect();

        let ranges = self.coverage_ranges(address).await?;
        let mut hits = crate::cache::ranges_intersecting(&ranges, from, to);
        for hit in &mut hits {
            hit.address = address.to_string();
        }
        Ok((logs, hits))
    }

    async fn store_logs(&self, addresses: &[String], logs: &[LogRecord], from: u64, to: u64) -> Result<(), DownloaderError> {
        let mut tx = self.pool.begin().await.map_err(|e| DownloaderError::Storage(e.to_string()))?;
        for log in logs {
            let topics = [log.topics.first(), log.topics.get(1), log.topics.get(2), log.topics.get(3)];
            sqlx::query(
                "INSERT INTO event_logs (address, block_number, block_hash, tx_hash, tx_index, log_index, topic0, topic1, topic2, topic3, data, removed, created_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?)
                 ON CONFLICT(tx_hash, log_index) DO NOTHING",
            )
            .bind(&log.address)
            .bind(log.block_number as i64)
            .bind(&log.block_hash)
            .bind(&log.tx_hash)
            .bind(log.tx_index as i64)
            .bind(log.log_index as i64)
            .bind(topics[0])
            .bind(topics[1])
            .bind(topics[2])
            .bind(topics[3])
            .bind(&log.data)
            .bind(chrono::Utc::now().timestamp())
            .execute(&mut *tx)
            .await
            .map_err(|e| DownloaderError::Storage(e.to_string()))?;
        }
        tx.commit().await.map_err(|e| DownloaderError::Storage(e.to_string()))?;

        let range = BlockRange::new(from, to)
            .ok_or_else(|| DownloaderError::Storage(format!("invalid coverage range [{from},{to}]")))?;
        for address in addresses {
            let mut ranges = self.coverage_ranges(address).await?;
            merge_coverage(&mut ranges, range);
            self.replace_coverage(address, &ranges).await?;
        }
        Ok(())
    }

    async fn handle_reorg(&self, first_reorg_block: u64) -> Result<(), DownloaderError> {
        let mut tx = self.pool.begin().await.map_err(|e| DownloaderError::Storage(e.to_string()))?;
        sqlx::query("UPDATE event_logs SET removed = 1 WHERE block_number >= ?")
            .bind(first_reorg_block as i64)
            .execute(&mut *tx)
            .await
            .map_err(|e| DownloaderError::Storage(e.to_string()))?;
        sqlx::query("DELETE FROM log_coverage WHERE to_block >= ?")
            .bind(first_reorg_block as i64)
            .execute(&mut *tx)
            .await
            .map_err(|e| DownloaderError::Storage(e.to_string()))?;
        tx.commit().await.map_err(|e| DownloaderError::Storage(e.to_string()))
    }

    async fn prune_below(&self, n: u64) -> Result<(), DownloaderError> {
        let mut tx = self.pool.begin().await.map_err(|e| DownloaderError::Storage(e.to_string()))?;
        sqlx::query("DELETE FROM event_logs WHERE block_number < ?")
            .bind(n as i64)
            .execute(&mut *tx)
            .await
            .map_err(|e| DownloaderError::Storage(e.to_string()))?;
        sqlx::query("DELETE FROM log_coverage WHERE to_block < ?")
            .bind(n as i64)
            .execute(&mut *tx)
            .await
            .map_err(|e| DownloaderError::Storage(e.to_string()))?;
        tx.commit().await.map_err(|e| DownloaderError::Storage(e.to_string()))
    }

    async fn get_unsynced_topics(&self, filters: &[(String, Option<String>)], up_to_block: u64) -> Result<Vec<UnsyncedTopic>, DownloaderError> {
        let mut out = Vec::new();
        for (address, topic0) in filters {
            let ranges = self.coverage_ranges(address).await?;
            let tail = crate::cache::covered_tail(&ranges, up_to_block);
            if tail < up_to_block {
                out.push(UnsyncedTopic { address: address.clone(), topic0: topic0.clone(), covered_tail: tail });
            }
        }
        Ok(out)
    }
}
