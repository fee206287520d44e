// src/consensus/mod.rs
// Pluggable consensus.
//
// Every mechanism implements `ConsensusStrategy`. The node talks to exactly
// one of them at a time through `ConsensusCoordinator`, which can switch the
// active mechanism at runtime.

pub mod authority;
pub mod coordinator;
pub mod dpos;
pub mod pbft;
pub mod pos;
pub mod pow;
pub mod quorum;

pub use authority::{DelegateAuthority, DelegateElection, StakeAuthority, ValidatorAuthority};
pub use coordinator::{
    ConsensusCoordinator, ConsensusFactory, CoordinatorEvent, CoordinatorObserver, StrategyParams,
};
pub use dpos::DelegatedProofOfStake;
pub use pbft::Pbft;
pub use pos::ProofOfStake;
pub use pow::ProofOfWork;
pub use quorum::{AgreementCollector, VoteBook};

use crate::chain::{Address, Block, Blockchain, Transaction};
use crate::crypto::BlockSigner;
use crate::error::{ConsensusError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Built-in consensus mechanisms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsensusKind {
    Pow,
    Pos,
    Dpos,
    Pbft,
}

impl ConsensusKind {
    pub const ALL: [ConsensusKind; 4] = [
        ConsensusKind::Pow,
        ConsensusKind::Pos,
        ConsensusKind::Dpos,
        ConsensusKind::Pbft,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConsensusKind::Pow => "pow",
            ConsensusKind::Pos => "pos",
            ConsensusKind::Dpos => "dpos",
            ConsensusKind::Pbft => "pbft",
        }
    }
}

impl fmt::Display for ConsensusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConsensusKind {
    type Err = ConsensusError;

    fn from_str(s: &str) -> Result<Self> {
        ConsensusKind::ALL
            .iter()
            .find(|k| k.as_str() == s)
            .copied()
            .ok_or_else(|| ConsensusError::config(format!("unknown consensus type: {}", s)))
    }
}

/// What a connected peer last reported about its chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerStatus {
    pub id: String,
    pub height: u64,
    pub head_hash: String,
}

impl PeerStatus {
    pub fn new(id: &str, height: u64, head_hash: &str) -> Self {
        Self {
            id: id.to_string(),
            height,
            head_hash: head_hash.to_string(),
        }
    }
}

pub trait ConsensusStrategy: Send + Sync {
    /// Registry tag this strategy was built under.
    fn name(&self) -> &str;

    /// False on any rule or linkage failure. Never errors.
    fn validate_block(&self, block: &Block, previous: &Block) -> bool;

    fn mine_block(&self, transactions: Vec<Transaction>, previous: &Block) -> Result<Block>;

    fn calculate_reward(&self, block: &Block) -> u64;

    fn is_consensus_achieved(&self, chain: &Blockchain, peers: &[PeerStatus]) -> bool;

    /// Producer for the block after `previous`. None when nobody qualifies.
    fn select_validator(&self, candidates: &[Address], previous: &Block) -> Option<Address>;

    /// Push a new mining difficulty. Ignored by mechanisms that do not mine.
    fn retarget(&self, _difficulty: u64) {}

    /// Current mining difficulty, if this mechanism mines.
    fn difficulty(&self) -> Option<u64> {
        None
    }
}

/// Index continuity, previous-hash linkage and an intact hash seal.
pub fn standard_linkage(block: &Block, previous: &Block) -> bool {
    block.links_to(previous) && block.has_valid_hash()
}

/// True when a strict majority of peers report `tip_hash` as their head.
/// An empty peer set is trivially in agreement.
pub fn majority_on_tip(tip_hash: &str, peers: &[PeerStatus]) -> bool {
    if peers.is_empty() {
        return true;
    }
    let agreeing = peers.iter().filter(|p| p.head_hash == tip_hash).count();
    agreeing * 2 > peers.len()
}

/// Attach the producer's signature over the block hash when a signer holds its key.
pub(crate) fn sign_block(block: &mut Block, signer: Option<&dyn BlockSigner>) {
    if let Some(signature) = signer.and_then(|s| s.sign(&block.validator, block.hash.as_bytes())) {
        block.signature = signature;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_parsing() {
        assert_eq!("dpos".parse::<ConsensusKind>().unwrap(), ConsensusKind::Dpos);
        assert!(matches!(
            "raft".parse::<ConsensusKind>(),
            Err(ConsensusError::Configuration(_))
        ));
    }

    #[test]
    fn test_majority_on_tip() {
        let peers = vec![
            PeerStatus::new("a", 5, "h1"),
            PeerStatus::new("b", 5, "h1"),
            PeerStatus::new("c", 5, "h2"),
            PeerStatus::new("d", 6, "h3"),
        ];
        assert!(!majority_on_tip("h1", &peers));
        assert!(majority_on_tip("h1", &peers[..3]));
        assert!(majority_on_tip("anything", &[]));
    }
}
