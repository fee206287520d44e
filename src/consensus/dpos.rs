// src/consensus/dpos.rs
// Delegated Proof-of-Stake: elected delegates take turns by height.

use super::{majority_on_tip, sign_block, standard_linkage, ConsensusStrategy, DelegateAuthority, PeerStatus};
use crate::chain::{Address, Block, Blockchain, Transaction};
use crate::clock::Clock;
use crate::crypto::BlockSigner;
use crate::error::{ConsensusError, Result};
use log::debug;
use std::sync::Arc;

pub const DPOS_BLOCK_REWARD: u64 = 15;

pub struct DelegatedProofOfStake {
    authority: Arc<dyn DelegateAuthority>,
    clock: Arc<dyn Clock>,
    signer: Option<Arc<dyn BlockSigner>>,
}

impl DelegatedProofOfStake {
    pub fn new(authority: Arc<dyn DelegateAuthority>, clock: Arc<dyn Clock>) -> Self {
        Self {
            authority,
            clock,
            signer: None,
        }
    }

    pub fn with_signer(mut self, signer: Arc<dyn BlockSigner>) -> Self {
        self.signer = Some(signer);
        self
    }
}

impl ConsensusStrategy for DelegatedProofOfStake {
    fn name(&self) -> &str {
        "dpos"
    }

    fn validate_block(&self, block: &Block, previous: &Block) -> bool {
        if !self.authority.validate_block(block) {
            return false;
        }
        standard_linkage(block, previous)
    }

    fn mine_block(&self, transactions: Vec<Transaction>, previous: &Block) -> Result<Block> {
        let height = previous.index + 1;
        let delegate = self
            .authority
            .select_delegate(height)
            .ok_or_else(|| ConsensusError::NoEligibleProducer("no elected delegates".into()))?;

        let mut block = Block::next(
            previous,
            self.clock.now(),
            previous.difficulty,
            &delegate,
            transactions,
        );
        sign_block(&mut block, self.signer.as_deref());
        debug!("Delegate {} produced block {}", delegate, height);
        Ok(block)
    }

    fn calculate_reward(&self, _block: &Block) -> u64 {
        DPOS_BLOCK_REWARD
    }

    fn is_consensus_achieved(&self, chain: &Blockchain, peers: &[PeerStatus]) -> bool {
        match chain.last() {
            Some(tip) => majority_on_tip(&tip.hash, peers),
            None => peers.is_empty(),
        }
    }

    /// The delegate scheduled for the next height.
    fn select_validator(&self, _candidates: &[Address], previous: &Block) -> Option<Address> {
        self.authority.select_delegate(previous.index + 1)
    }
}
