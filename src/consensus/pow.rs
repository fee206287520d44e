// src/consensus/pow.rs
// Proof-of-Work: leading-zero hash target, fixed block reward.

use super::{standard_linkage, ConsensusStrategy, PeerStatus};
use crate::chain::{Address, Block, Blockchain, Transaction};
use crate::clock::Clock;
use crate::error::{ConsensusError, Result};
use log::{debug, info};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub const POW_BLOCK_REWARD: u64 = 50;

/// A SHA-256 hex digest has 64 characters.
const MAX_POW_DIFFICULTY: u64 = 64;

pub struct ProofOfWork {
    name: String,
    difficulty: AtomicU64,
    miner: Address,
    clock: Arc<dyn Clock>,
    max_nonce: u64,
}

impl ProofOfWork {
    pub fn new(difficulty: u64, miner: &str, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: "pow".to_string(),
            difficulty: AtomicU64::new(difficulty),
            miner: miner.to_string(),
            clock,
            max_nonce: u64::MAX,
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Give up after trying this many nonces.
    pub fn with_max_nonce(mut self, max_nonce: u64) -> Self {
        self.max_nonce = max_nonce;
        self
    }

    pub fn meets_target(hash: &str, difficulty: u64) -> bool {
        hash.len() >= difficulty as usize && hash.bytes().take(difficulty as usize).all(|b| b == b'0')
    }
}

impl ConsensusStrategy for ProofOfWork {
    fn name(&self) -> &str {
        &self.name
    }

    /// The hash must meet the difficulty the header claims. Whether that
    /// claim is the right one for its height is a chain-level rule.
    fn validate_block(&self, block: &Block, previous: &Block) -> bool {
        if block.difficulty == 0 || !Self::meets_target(&block.hash, block.difficulty) {
            debug!(
                "Block {} hash {} misses claimed difficulty {}",
                block.index, block.hash, block.difficulty
            );
            return false;
        }
        standard_linkage(block, previous)
    }

    fn mine_block(&self, transactions: Vec<Transaction>, previous: &Block) -> Result<Block> {
        let difficulty = self.difficulty.load(Ordering::Relaxed);
        if difficulty > MAX_POW_DIFFICULTY {
            return Err(ConsensusError::policy(format!(
                "difficulty {} exceeds hash length",
                difficulty
            )));
        }

        let mut block = Block::next(previous, self.clock.now(), difficulty, &self.miner, transactions);
        for nonce in 0..=self.max_nonce {
            block.nonce = nonce;
            block.reseal();
            if Self::meets_target(&block.hash, difficulty) {
                info!(
                    "Mined block {} at difficulty {} (nonce {})",
                    block.index, difficulty, nonce
                );
                return Ok(block);
            }
        }

        Err(ConsensusError::NoEligibleProducer(format!(
            "nonce space exhausted at difficulty {}",
            difficulty
        )))
    }

    fn calculate_reward(&self, _block: &Block) -> u64 {
        POW_BLOCK_REWARD
    }

    /// No peer may be strictly ahead of us.
    fn is_consensus_achieved(&self, chain: &Blockchain, peers: &[PeerStatus]) -> bool {
        let height = chain.last().map_or(0, |b| b.index);
        peers.iter().all(|p| p.height <= height)
    }

    /// The local miner produces whatever it finds.
    fn select_validator(&self, _candidates: &[Address], _previous: &Block) -> Option<Address> {
        Some(self.miner.clone())
    }

    fn retarget(&self, difficulty: u64) {
        let old = self.difficulty.swap(difficulty, Ordering::Relaxed);
        if old != difficulty {
            info!("PoW difficulty retargeted {} -> {}", old, difficulty);
        }
    }

    fn difficulty(&self) -> Option<u64> {
        Some(self.difficulty.load(Ordering::Relaxed))
    }
}
