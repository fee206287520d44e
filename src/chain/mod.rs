// src/chain/mod.rs
// Block and chain model consumed by the consensus core.
//
// The chain itself is owned by the surrounding node. Inside this crate it is
// only mutated through two paths: the node's block-append path
// (`ChainHandle::append`) and the fork resolver's swap (`ChainHandle::swap`).

use crate::error::{ConsensusError, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Validator / staker / miner address.
pub type Address = String;

/// Previous-hash marker carried by a genesis block.
pub const GENESIS_PREVIOUS_HASH: &str = "0";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub sender: Address,
    pub recipient: Address,
    pub amount: u64,
    pub fee: u64,
}

impl Transaction {
    pub fn new(sender: &str, recipient: &str, amount: u64, fee: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender: sender.to_string(),
            recipient: recipient.to_string(),
            amount,
            fee,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub index: u64,
    pub previous_hash: String,
    pub hash: String,
    pub timestamp: DateTime<Utc>,
    pub difficulty: u64,
    pub nonce: u64,
    pub validator: Address,
    pub transactions: Vec<Transaction>,
    /// Producer signature over `hash` (empty when unsigned)
    #[serde(default)]
    pub signature: Vec<u8>,
}

impl Block {
    /// Build a block and seal its hash.
    pub fn new(
        index: u64,
        previous_hash: &str,
        timestamp: DateTime<Utc>,
        difficulty: u64,
        validator: &str,
        transactions: Vec<Transaction>,
    ) -> Self {
        let mut block = Block {
            index,
            previous_hash: previous_hash.to_string(),
            hash: String::new(),
            timestamp,
            difficulty,
            nonce: 0,
            validator: validator.to_string(),
            transactions,
            signature: Vec::new(),
        };
        block.hash = block.calculate_hash();
        block
    }

    pub fn genesis(timestamp: DateTime<Utc>, difficulty: u64) -> Self {
        Block::new(0, GENESIS_PREVIOUS_HASH, timestamp, difficulty, "genesis", vec![])
    }

    /// Child of `previous` at the next index.
    pub fn next(
        previous: &Block,
        timestamp: DateTime<Utc>,
        difficulty: u64,
        validator: &str,
        transactions: Vec<Transaction>,
    ) -> Self {
        Block::new(
            previous.index + 1,
            &previous.hash,
            timestamp,
            difficulty,
            validator,
            transactions,
        )
    }

    /// SHA-256 over the header fields and transaction ids, hex encoded.
    pub fn calculate_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.index.to_be_bytes());
        hasher.update(self.previous_hash.as_bytes());
        hasher.update(self.timestamp.timestamp_millis().to_be_bytes());
        hasher.update(self.difficulty.to_be_bytes());
        hasher.update(self.nonce.to_be_bytes());
        hasher.update(self.validator.as_bytes());
        for tx in &self.transactions {
            hasher.update(tx.id.as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    pub fn has_valid_hash(&self) -> bool {
        self.hash == self.calculate_hash()
    }

    /// Re-seal after mutating header fields (nonce search, validator change).
    pub fn reseal(&mut self) {
        self.hash = self.calculate_hash();
    }

    pub fn total_fees(&self) -> u64 {
        self.transactions.iter().map(|tx| tx.fee).sum()
    }

    /// Standard linkage against the predecessor: index + 1 and previous_hash.
    pub fn links_to(&self, previous: &Block) -> bool {
        self.index == previous.index + 1 && self.previous_hash == previous.hash
    }
}

/// Ordered block sequence plus a hash -> position index. Only the blocks
/// are serialized; the index is rebuilt on load.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "ChainRepr", into = "ChainRepr")]
pub struct Blockchain {
    chain: Vec<Block>,
    hash_index: HashMap<String, usize>,
}

#[derive(Serialize, Deserialize)]
struct ChainRepr {
    chain: Vec<Block>,
}

impl From<ChainRepr> for Blockchain {
    fn from(repr: ChainRepr) -> Self {
        Blockchain::from_blocks(repr.chain)
    }
}

impl From<Blockchain> for ChainRepr {
    fn from(chain: Blockchain) -> Self {
        ChainRepr { chain: chain.chain }
    }
}

impl Blockchain {
    pub fn new(genesis: Block) -> Self {
        Self::from_blocks(vec![genesis])
    }

    /// Adopt a block sequence as-is and rebuild the hash index.
    pub fn from_blocks(chain: Vec<Block>) -> Self {
        let hash_index = chain
            .iter()
            .enumerate()
            .map(|(i, b)| (b.hash.clone(), i))
            .collect();
        Self { chain, hash_index }
    }

    pub fn blocks(&self) -> &[Block] {
        &self.chain
    }

    pub fn len(&self) -> usize {
        self.chain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    pub fn last(&self) -> Option<&Block> {
        self.chain.last()
    }

    pub fn get(&self, index: usize) -> Option<&Block> {
        self.chain.get(index)
    }

    pub fn get_by_hash(&self, hash: &str) -> Option<&Block> {
        self.hash_index.get(hash).and_then(|&i| self.chain.get(i))
    }

    pub fn contains_hash(&self, hash: &str) -> bool {
        self.hash_index.contains_key(hash)
    }

    pub fn cumulative_difficulty(&self) -> u128 {
        self.chain.iter().map(|b| b.difficulty as u128).sum()
    }

    /// Append after checking index continuity, linkage and hash seal.
    pub fn append(&mut self, block: Block) -> Result<()> {
        self.check_append(&block)?;
        self.hash_index.insert(block.hash.clone(), self.chain.len());
        self.chain.push(block);
        Ok(())
    }

    fn check_append(&self, block: &Block) -> Result<()> {
        if let Some(tip) = self.chain.last() {
            if !block.links_to(tip) {
                return Err(ConsensusError::InvalidBlock(format!(
                    "block {} does not link to tip {} ({})",
                    block.index, tip.index, tip.hash
                )));
            }
        }
        if !block.has_valid_hash() {
            return Err(ConsensusError::InvalidBlock(format!(
                "block {} hash does not match its contents",
                block.index
            )));
        }
        Ok(())
    }
}

/// Shared, copy-on-write handle to the node's chain.
///
/// Readers take an `Arc` snapshot and never observe a partial splice.
/// Appends update the chain in place unless a reader still holds it, in
/// which case they copy first. Reorgs publish a whole chain with one
/// pointer swap.
#[derive(Clone)]
pub struct ChainHandle {
    inner: Arc<RwLock<Arc<Blockchain>>>,
}

impl ChainHandle {
    pub fn new(chain: Blockchain) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(chain))),
        }
    }

    pub fn snapshot(&self) -> Arc<Blockchain> {
        self.inner.read().clone()
    }

    pub fn height(&self) -> u64 {
        self.inner.read().last().map(|b| b.index).unwrap_or(0)
    }

    pub fn tip(&self) -> Option<Block> {
        self.inner.read().last().cloned()
    }

    /// Append to the current chain. Readers holding an older snapshot keep it.
    pub fn append(&self, block: Block) -> Result<()> {
        let mut guard = self.inner.write();
        guard.check_append(&block)?;
        Arc::make_mut(&mut *guard).append(block)
    }

    /// Replace the chain iff it is still `expected`. Returns false when a
    /// concurrent writer got there first.
    pub fn swap(&self, expected: &Arc<Blockchain>, replacement: Blockchain) -> bool {
        let mut guard = self.inner.write();
        if !Arc::ptr_eq(&guard, expected) {
            return false;
        }
        *guard = Arc::new(replacement);
        true
    }
}
