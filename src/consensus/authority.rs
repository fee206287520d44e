// src/consensus/authority.rs
// Validator and delegate authorities backing the stake-based strategies.
//
// An authority answers two questions for a strategy: may this address
// produce this block, and who produces the next one. Both are answered from
// the staking ledger (weight) and the slashing tracker (eligibility).

use super::quorum::round_robin;
use crate::chain::{Address, Block};
use crate::crypto::SignatureVerifier;
use crate::slashing::SlashingTracker;
use crate::staking::StakingLedger;
use log::debug;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;

pub trait ValidatorAuthority: Send + Sync {
    /// Producer of `block` is allowed to produce it (and signed it, when
    /// signatures are enforced).
    fn validate_block(&self, block: &Block) -> bool;

    /// Producer for the block after `previous`.
    fn select_validator(&self, previous: &Block) -> Option<Address>;

    /// Eligible validators in address order.
    fn eligible_validators(&self) -> Vec<Address>;
}

pub trait DelegateAuthority: Send + Sync {
    fn validate_block(&self, block: &Block) -> bool;

    /// Delegate scheduled for `height`.
    fn select_delegate(&self, height: u64) -> Option<Address>;

    /// Currently elected delegates in schedule order.
    fn delegates(&self) -> Vec<Address>;
}

/// Public keys for producer-signature checks.
struct SignatureCheck {
    verifier: Arc<dyn SignatureVerifier>,
    keys: RwLock<HashMap<Address, Vec<u8>>>,
}

impl SignatureCheck {
    fn verify(&self, block: &Block) -> bool {
        let keys = self.keys.read();
        let Some(public_key) = keys.get(&block.validator) else {
            debug!("No public key registered for producer {}", block.validator);
            return false;
        };
        self.verifier
            .verify(block.hash.as_bytes(), &block.signature, public_key)
    }
}

/// Eligible validators with their total stake, address order.
fn eligible_stakes(staking: &StakingLedger, slashing: &SlashingTracker) -> Vec<(Address, u64)> {
    let mut eligible: Vec<(Address, u64)> = staking
        .validators()
        .into_iter()
        .filter(|v| v.self_stake > 0 && v.total_stake >= staking.min_stake())
        .filter(|v| slashing.is_validator_eligible(&v.address))
        .map(|v| (v.address, v.total_stake))
        .collect();
    eligible.sort_by(|a, b| a.0.cmp(&b.0));
    eligible
}

/// 64-bit selection seed derived from a block hash.
fn seed_from(hash: &str) -> u64 {
    let digest = Sha256::digest(hash.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

/// Stake-weighted authority over the staking ledger.
///
/// A validator is eligible while it has self-stake, its total stake meets the
/// minimum and it is not cooling down from a slash. The next producer is
/// drawn deterministically, weighted by stake, from the previous block hash.
pub struct StakeAuthority {
    staking: Arc<StakingLedger>,
    slashing: Arc<SlashingTracker>,
    signatures: Option<SignatureCheck>,
}

impl StakeAuthority {
    pub fn new(staking: Arc<StakingLedger>, slashing: Arc<SlashingTracker>) -> Self {
        Self {
            staking,
            slashing,
            signatures: None,
        }
    }

    /// Require producer signatures checked against registered keys.
    pub fn with_verifier(mut self, verifier: Arc<dyn SignatureVerifier>) -> Self {
        self.signatures = Some(SignatureCheck {
            verifier,
            keys: RwLock::new(HashMap::new()),
        });
        self
    }

    /// No-op unless a verifier is installed.
    pub fn register_key(&self, validator: &str, public_key: Vec<u8>) {
        if let Some(check) = &self.signatures {
            check.keys.write().insert(validator.to_string(), public_key);
        }
    }
}

impl ValidatorAuthority for StakeAuthority {
    fn validate_block(&self, block: &Block) -> bool {
        let eligible = eligible_stakes(&self.staking, &self.slashing);
        if !eligible.iter().any(|(addr, _)| *addr == block.validator) {
            debug!("Producer {} of block {} is not eligible", block.validator, block.index);
            return false;
        }
        self.signatures.as_ref().map_or(true, |check| check.verify(block))
    }

    fn select_validator(&self, previous: &Block) -> Option<Address> {
        let eligible = eligible_stakes(&self.staking, &self.slashing);
        let total: u64 = eligible.iter().map(|(_, stake)| stake).sum();
        if total == 0 {
            return None;
        }

        let mut target = seed_from(&previous.hash) % total;
        for (address, stake) in eligible {
            if target < stake {
                return Some(address);
            }
            target -= stake;
        }
        None
    }

    fn eligible_validators(&self) -> Vec<Address> {
        eligible_stakes(&self.staking, &self.slashing)
            .into_iter()
            .map(|(addr, _)| addr)
            .collect()
    }
}

/// Delegate election: the top `delegate_count` eligible validators by total
/// stake (ties broken by address) produce blocks in round-robin by height.
pub struct DelegateElection {
    staking: Arc<StakingLedger>,
    slashing: Arc<SlashingTracker>,
    delegate_count: usize,
    signatures: Option<SignatureCheck>,
}

impl DelegateElection {
    pub fn new(
        staking: Arc<StakingLedger>,
        slashing: Arc<SlashingTracker>,
        delegate_count: usize,
    ) -> Self {
        Self {
            staking,
            slashing,
            delegate_count,
            signatures: None,
        }
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn SignatureVerifier>) -> Self {
        self.signatures = Some(SignatureCheck {
            verifier,
            keys: RwLock::new(HashMap::new()),
        });
        self
    }

    pub fn register_key(&self, validator: &str, public_key: Vec<u8>) {
        if let Some(check) = &self.signatures {
            check.keys.write().insert(validator.to_string(), public_key);
        }
    }
}

impl DelegateAuthority for DelegateElection {
    fn validate_block(&self, block: &Block) -> bool {
        if !self.delegates().contains(&block.validator) {
            debug!("Producer {} of block {} is not an elected delegate", block.validator, block.index);
            return false;
        }
        self.signatures.as_ref().map_or(true, |check| check.verify(block))
    }

    fn select_delegate(&self, height: u64) -> Option<Address> {
        round_robin(&self.delegates(), height).cloned()
    }

    fn delegates(&self) -> Vec<Address> {
        let mut ranked = eligible_stakes(&self.staking, &self.slashing);
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        ranked.truncate(self.delegate_count);

        // Schedule in address order so it does not reshuffle on small stake moves
        let mut delegates: Vec<Address> = ranked.into_iter().map(|(addr, _)| addr).collect();
        delegates.sort();
        delegates
    }
}
