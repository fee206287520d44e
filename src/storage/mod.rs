// src/storage/mod.rs
// Persistence collaborator for stake history, slash events and fork logs.
//
// The core only appends records and reads them back by address or by time
// range. `MemoryStore` is the default; `RocksStore` keeps them on disk.

#[cfg(feature = "rocksdb-store")]
pub mod rocks;

#[cfg(feature = "rocksdb-store")]
pub use rocks::RocksStore;

use crate::error::Result;
use crate::fork::ForkInfo;
use crate::slashing::SlashEvent;
use crate::staking::StakeRecord;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "record", rename_all = "snake_case")]
pub enum LedgerRecord {
    Stake(StakeRecord),
    Slash(SlashEvent),
    Fork(ForkInfo),
}

impl LedgerRecord {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            LedgerRecord::Stake(r) => r.timestamp,
            LedgerRecord::Slash(e) => e.timestamp,
            LedgerRecord::Fork(f) => f.detected_at,
        }
    }

    /// Addresses this record is indexed under. Fork records carry none.
    pub fn addresses(&self) -> Vec<&str> {
        match self {
            LedgerRecord::Stake(r) if r.staker != r.validator => {
                vec![r.validator.as_str(), r.staker.as_str()]
            }
            LedgerRecord::Stake(r) => vec![r.validator.as_str()],
            LedgerRecord::Slash(e) => vec![e.validator.as_str()],
            LedgerRecord::Fork(_) => Vec::new(),
        }
    }

    pub fn involves(&self, address: &str) -> bool {
        self.addresses().contains(&address)
    }
}

pub trait LedgerStore: Send + Sync {
    fn insert(&self, record: LedgerRecord) -> Result<()>;

    /// Records involving `address`, oldest first.
    fn by_address(&self, address: &str) -> Result<Vec<LedgerRecord>>;

    /// Records with `from <= timestamp <= to`, oldest first.
    fn by_time_range(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<LedgerRecord>>;
}

/// Append-only in-memory store.
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<Vec<LedgerRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl LedgerStore for MemoryStore {
    fn insert(&self, record: LedgerRecord) -> Result<()> {
        let mut records = self.records.write();
        // Keep time order even if records arrive slightly out of order
        let at = records.partition_point(|r| r.timestamp() <= record.timestamp());
        records.insert(at, record);
        Ok(())
    }

    fn by_address(&self, address: &str) -> Result<Vec<LedgerRecord>> {
        Ok(self
            .records
            .read()
            .iter()
            .filter(|r| r.involves(address))
            .cloned()
            .collect())
    }

    fn by_time_range(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<LedgerRecord>> {
        Ok(self
            .records
            .read()
            .iter()
            .filter(|r| r.timestamp() >= from && r.timestamp() <= to)
            .cloned()
            .collect())
    }
}
