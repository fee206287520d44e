// src/storage/rocks.rs
// RocksDB-backed ledger store
//
// Every record is written twice in one batch: once under a time-ordered key
// (`ledger:<time>:<id>`) and once per involved address
// (`addr:<address>:<time>:<id>`). Values are JSON.

use super::{LedgerRecord, LedgerStore};
use crate::error::{ConsensusError, Result};
use chrono::{DateTime, Utc};
use log::{info, warn};
use rocksdb::{Direction, IteratorMode, Options, WriteBatch, DB};
use std::path::Path;
use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;
use uuid::Uuid;

const LEDGER_PREFIX: &str = "ledger:";
const ADDRESS_PREFIX: &str = "addr:";

fn storage_err(e: impl std::fmt::Display) -> ConsensusError {
    ConsensusError::Storage(e.to_string())
}

/// Order-preserving fixed-width encoding of a signed millisecond timestamp.
fn time_key(t: DateTime<Utc>) -> String {
    let ordered = (t.timestamp_millis() as u64) ^ (1u64 << 63);
    format!("{:020}", ordered)
}

pub struct RocksStore {
    db: Arc<DB>,
}

impl RocksStore {
    /// Open (or create) the store, retrying with backoff while the database is locked.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut attempt = 0u32;
        let max_attempts = 5u32;
        let mut wait = 100u64;

        loop {
            let mut opts = Options::default();
            opts.create_if_missing(true);
            match DB::open(&opts, path) {
                Ok(db) => {
                    info!("Opened ledger store at {}", path.display());
                    return Ok(Self { db: Arc::new(db) });
                }
                Err(e) => {
                    attempt += 1;
                    if attempt >= max_attempts {
                        return Err(ConsensusError::Storage(format!(
                            "failed to open RocksDB at '{}' after {} attempts: {}",
                            path.display(),
                            attempt,
                            e
                        )));
                    }
                    warn!(
                        "open attempt {}/{} failed: {}, retrying in {}ms",
                        attempt, max_attempts, e, wait
                    );
                    sleep(Duration::from_millis(wait));
                    wait = std::cmp::min(wait * 2, 1000);
                }
            }
        }
    }

    /// Deserialize every value whose key starts with `prefix`.
    fn scan_prefix(&self, prefix: &str) -> Result<Vec<LedgerRecord>> {
        let mut out = Vec::new();
        let iter = self
            .db
            .iterator(IteratorMode::From(prefix.as_bytes(), Direction::Forward));
        for item in iter {
            let (key, value) = item.map_err(storage_err)?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            out.push(serde_json::from_slice(&value)?);
        }
        Ok(out)
    }
}

impl LedgerStore for RocksStore {
    fn insert(&self, record: LedgerRecord) -> Result<()> {
        let value = serde_json::to_vec(&record)?;
        let suffix = format!("{}:{}", time_key(record.timestamp()), Uuid::new_v4());

        let mut batch = WriteBatch::default();
        batch.put(format!("{}{}", LEDGER_PREFIX, suffix), &value);
        for address in record.addresses() {
            batch.put(format!("{}{}:{}", ADDRESS_PREFIX, address, suffix), &value);
        }
        self.db.write(batch).map_err(storage_err)
    }

    fn by_address(&self, address: &str) -> Result<Vec<LedgerRecord>> {
        self.scan_prefix(&format!("{}{}:", ADDRESS_PREFIX, address))
    }

    fn by_time_range(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<LedgerRecord>> {
        let start = format!("{}{}", LEDGER_PREFIX, time_key(from));
        let mut out = Vec::new();
        for item in self
            .db
            .iterator(IteratorMode::From(start.as_bytes(), Direction::Forward))
        {
            let (key, value) = item.map_err(storage_err)?;
            if !key.starts_with(LEDGER_PREFIX.as_bytes()) {
                break;
            }
            let record: LedgerRecord = serde_json::from_slice(&value)?;
            if record.timestamp() > to {
                break;
            }
            out.push(record);
        }
        Ok(out)
    }
}
