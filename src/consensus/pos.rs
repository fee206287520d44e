// src/consensus/pos.rs
// Proof-of-Stake: the validator authority decides who may produce.

use super::{majority_on_tip, sign_block, standard_linkage, ConsensusStrategy, PeerStatus, ValidatorAuthority};
use crate::chain::{Address, Block, Blockchain, Transaction};
use crate::clock::Clock;
use crate::crypto::BlockSigner;
use crate::error::{ConsensusError, Result};
use crate::staking::rewards::{mul_div, to_ppm, PPM};
use log::debug;
use std::sync::Arc;

pub const POS_BLOCK_REWARD: u64 = 25;

pub struct ProofOfStake {
    authority: Arc<dyn ValidatorAuthority>,
    clock: Arc<dyn Clock>,
    signer: Option<Arc<dyn BlockSigner>>,
    fee_share_ppm: u64,
}

impl ProofOfStake {
    pub fn new(authority: Arc<dyn ValidatorAuthority>, clock: Arc<dyn Clock>, fee_share: f64) -> Self {
        Self {
            authority,
            clock,
            signer: None,
            fee_share_ppm: to_ppm(fee_share),
        }
    }

    pub fn with_signer(mut self, signer: Arc<dyn BlockSigner>) -> Self {
        self.signer = Some(signer);
        self
    }
}

impl ConsensusStrategy for ProofOfStake {
    fn name(&self) -> &str {
        "pos"
    }

    fn validate_block(&self, block: &Block, previous: &Block) -> bool {
        if !self.authority.validate_block(block) {
            return false;
        }
        standard_linkage(block, previous)
    }

    fn mine_block(&self, transactions: Vec<Transaction>, previous: &Block) -> Result<Block> {
        let producer = self.authority.select_validator(previous).ok_or_else(|| {
            ConsensusError::NoEligibleProducer("no staked validator is eligible".into())
        })?;

        let mut block = Block::next(
            previous,
            self.clock.now(),
            previous.difficulty,
            &producer,
            transactions,
        );
        sign_block(&mut block, self.signer.as_deref());
        debug!("Forged PoS block {} by {}", block.index, producer);
        Ok(block)
    }

    /// Fixed reward plus the fee share.
    fn calculate_reward(&self, block: &Block) -> u64 {
        POS_BLOCK_REWARD + mul_div(block.total_fees(), self.fee_share_ppm, PPM)
    }

    fn is_consensus_achieved(&self, chain: &Blockchain, peers: &[PeerStatus]) -> bool {
        match chain.last() {
            Some(tip) => majority_on_tip(&tip.hash, peers),
            None => peers.is_empty(),
        }
    }

    fn select_validator(&self, _candidates: &[Address], previous: &Block) -> Option<Address> {
        self.authority.select_validator(previous)
    }
}
