// src/consensus/pbft.rs
// PBFT-style strategy: round-robin proposer, 2f+1 agreement for finality.

use super::quorum::{quorum_for, round_robin};
use super::{sign_block, standard_linkage, AgreementCollector, ConsensusStrategy, PeerStatus, ValidatorAuthority};
use crate::chain::{Address, Block, Blockchain, Transaction};
use crate::clock::Clock;
use crate::crypto::BlockSigner;
use crate::error::{ConsensusError, Result};
use log::debug;
use std::sync::Arc;

pub const PBFT_BLOCK_REWARD: u64 = 10;

pub struct Pbft {
    authority: Arc<dyn ValidatorAuthority>,
    agreements: Arc<dyn AgreementCollector>,
    fault_tolerance: usize,
    clock: Arc<dyn Clock>,
    signer: Option<Arc<dyn BlockSigner>>,
}

impl Pbft {
    pub fn new(
        authority: Arc<dyn ValidatorAuthority>,
        agreements: Arc<dyn AgreementCollector>,
        fault_tolerance: usize,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            authority,
            agreements,
            fault_tolerance,
            clock,
            signer: None,
        }
    }

    pub fn with_signer(mut self, signer: Arc<dyn BlockSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn quorum(&self) -> usize {
        quorum_for(self.fault_tolerance)
    }
}

impl ConsensusStrategy for Pbft {
    fn name(&self) -> &str {
        "pbft"
    }

    fn validate_block(&self, block: &Block, previous: &Block) -> bool {
        if !self.authority.validate_block(block) {
            return false;
        }
        standard_linkage(block, previous)
    }

    fn mine_block(&self, transactions: Vec<Transaction>, previous: &Block) -> Result<Block> {
        let candidates = self.authority.eligible_validators();
        let proposer = self.select_validator(&candidates, previous).ok_or_else(|| {
            ConsensusError::NoEligibleProducer("empty PBFT validator set".into())
        })?;

        let mut block = Block::next(
            previous,
            self.clock.now(),
            previous.difficulty,
            &proposer,
            transactions,
        );
        sign_block(&mut block, self.signer.as_deref());
        debug!("PBFT proposer {} produced block {}", proposer, block.index);
        Ok(block)
    }

    fn calculate_reward(&self, _block: &Block) -> u64 {
        PBFT_BLOCK_REWARD
    }

    /// Holds once at least 2f+1 distinct peers agree on our head.
    fn is_consensus_achieved(&self, chain: &Blockchain, peers: &[PeerStatus]) -> bool {
        let agreements = self.agreements.collect_agreements(chain, peers);
        agreements.len() >= self.quorum()
    }

    /// `candidates[previous.index mod len]`
    fn select_validator(&self, candidates: &[Address], previous: &Block) -> Option<Address> {
        round_robin(candidates, previous.index).cloned()
    }
}
