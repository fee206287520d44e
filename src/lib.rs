// src/lib.rs
// Chain-integrity core: pluggable consensus, fork resolution, difficulty
// retargeting, validator slashing and staking for one blockchain instance.

pub mod chain;
pub mod clock;
pub mod config;
pub mod consensus;
pub mod crypto;
pub mod difficulty;
pub mod error;
pub mod fork;
pub mod node;
pub mod slashing;
pub mod staking;
pub mod storage;

pub use chain::{Address, Block, Blockchain, ChainHandle, Transaction};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::CoreConfig;
pub use consensus::{
    ConsensusCoordinator, ConsensusFactory, ConsensusKind, ConsensusStrategy, PeerStatus,
};
pub use difficulty::DifficultyAdjuster;
pub use error::{ConsensusError, Result};
pub use fork::{ForkInfo, ForkResolver, ResolutionStrategy};
pub use node::{BlockVerdict, CoreOptions, LedgerCore, LedgerStatus, PeerChainOutcome};
pub use slashing::{Behavior, SlashEvent, SlashReason, SlashingTracker};
pub use staking::StakingLedger;
pub use storage::{LedgerRecord, LedgerStore, MemoryStore};
