// src/node.rs
// LedgerCore: owns one blockchain instance and every component guarding it.
//
// All state-changing entry points take the writer lock, so block
// acceptance, peer-driven reorgs, slashing, staking and settlement never
// interleave. Read-only queries go straight to the components, which hand
// out snapshots.

use crate::chain::{Address, Block, Blockchain, ChainHandle, Transaction};
use crate::clock::Clock;
use crate::config::CoreConfig;
use crate::consensus::{
    AgreementCollector, ConsensusCoordinator, ConsensusFactory, CoordinatorObserver,
    DelegateAuthority, DelegateElection, PeerStatus, StakeAuthority, StrategyParams,
    ValidatorAuthority, VoteBook,
};
use crate::crypto::{verify_bytes, BlockSigner, Ed25519Verifier, Keyring};
use crate::difficulty::DifficultyAdjuster;
use crate::error::{ConsensusError, Result};
use crate::fork::{ForkResolver, ForkStats};
use crate::slashing::{Behavior, SlashEvent, SlashReason, SlashingTracker};
use crate::staking::{RewardPayout, StakingLedger, UnstakeRequest};
use crate::storage::{LedgerRecord, LedgerStore};
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Optional collaborators for `LedgerCore::with_options`.
#[derive(Default)]
pub struct CoreOptions {
    pub observer: Option<Arc<dyn CoordinatorObserver>>,
    /// When set, produced blocks are signed and producer signatures are
    /// verified against the keys registered through `register_validator_key`.
    pub keyring: Option<Arc<Keyring>>,
    /// Replaces the built-in strategy registry
    pub factory: Option<ConsensusFactory>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AcceptedBlock {
    pub index: u64,
    pub hash: String,
    pub validator: Address,
    /// Reward the active strategy assigns to this block
    pub consensus_reward: u64,
    /// Amount credited to the staking reward pool
    pub pooled: u64,
    /// New mining difficulty, when this block closed an adjustment interval
    pub retargeted: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum BlockVerdict {
    Accepted(AcceptedBlock),
    Rejected { reason: String },
}

impl BlockVerdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, BlockVerdict::Accepted(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum PeerChainOutcome {
    /// Peer chain extended ours; this many blocks were appended
    Extended(usize),
    /// Local chain replaced by the peer chain
    Reorganized { old_height: u64, new_height: u64 },
    Ignored,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SettlementReport {
    pub height: u64,
    pub released: Vec<UnstakeRequest>,
    pub payouts: Vec<RewardPayout>,
    pub forks_pruned: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerStatus {
    pub height: u64,
    pub tip_hash: String,
    pub consensus: String,
    pub difficulty: Option<u64>,
    pub total_stake: u64,
    pub reward_pool: u64,
    pub validator_count: usize,
    pub pending_unstakes: usize,
    pub slash_events: usize,
    pub forks: ForkStats,
}

struct WriterState {
    /// Number of staking history entries already written to the store
    persisted_history: usize,
    /// Pool credits per block hash not yet paid out by a settlement
    pending_credits: HashMap<String, u64>,
}

pub struct LedgerCore {
    config: CoreConfig,
    chain: ChainHandle,
    staking: Arc<StakingLedger>,
    slashing: Arc<SlashingTracker>,
    stake_authority: Arc<StakeAuthority>,
    delegate_election: Arc<DelegateElection>,
    votes: Arc<VoteBook>,
    coordinator: Arc<ConsensusCoordinator>,
    difficulty: Arc<RwLock<DifficultyAdjuster>>,
    forks: ForkResolver,
    store: Arc<dyn LedgerStore>,
    keyring: Option<Arc<Keyring>>,
    writer: Mutex<WriterState>,
}

impl LedgerCore {
    pub fn new(config: CoreConfig, clock: Arc<dyn Clock>, store: Arc<dyn LedgerStore>) -> Result<Self> {
        Self::with_options(config, clock, store, CoreOptions::default())
    }

    pub fn with_options(
        config: CoreConfig,
        clock: Arc<dyn Clock>,
        store: Arc<dyn LedgerStore>,
        options: CoreOptions,
    ) -> Result<Self> {
        config.ensure_valid()?;

        let genesis = Block::genesis(clock.now(), config.consensus.pow_difficulty);
        let chain = ChainHandle::new(Blockchain::new(genesis));

        let staking = Arc::new(StakingLedger::new(&config.staking, clock.clone()));
        let slashing = Arc::new(SlashingTracker::new(&config.slashing, clock.clone()));

        let mut stake_authority = StakeAuthority::new(staking.clone(), slashing.clone());
        let mut delegate_election = DelegateElection::new(
            staking.clone(),
            slashing.clone(),
            config.consensus.dpos_delegate_count,
        );
        if options.keyring.is_some() {
            stake_authority = stake_authority.with_verifier(Arc::new(Ed25519Verifier));
            delegate_election = delegate_election.with_verifier(Arc::new(Ed25519Verifier));
        }
        let stake_authority = Arc::new(stake_authority);
        let delegate_election = Arc::new(delegate_election);
        let votes = Arc::new(VoteBook::new());

        let mut params = StrategyParams::new(clock.clone());
        params.difficulty = config.consensus.pow_difficulty;
        params.miner = config.consensus.node_address.clone();
        params.fault_tolerance = config.consensus.pbft_fault_tolerance;
        params.fee_share = config.staking.transaction_fee_share;
        params.validator_authority = Some(stake_authority.clone() as Arc<dyn ValidatorAuthority>);
        params.delegate_authority = Some(delegate_election.clone() as Arc<dyn DelegateAuthority>);
        params.agreements = Some(votes.clone() as Arc<dyn AgreementCollector>);
        if let Some(keyring) = &options.keyring {
            params.signer = Some(keyring.clone() as Arc<dyn BlockSigner>);
        }

        let factory = options.factory.unwrap_or_default();
        let coordinator = Arc::new(ConsensusCoordinator::with_observer(
            factory,
            params,
            &config.consensus.kind,
            options.observer,
        )?);

        let difficulty = Arc::new(RwLock::new(DifficultyAdjuster::from_config(&config.difficulty)));
        let forks = ForkResolver::new(&config.fork, chain.clone(), coordinator.clone(), clock)?
            .with_difficulty_rules(difficulty.clone());

        info!(
            "Ledger core ready: {} consensus, difficulty {}, fork threshold {}",
            config.consensus.kind, config.consensus.pow_difficulty, config.fork.fork_threshold
        );

        Ok(Self {
            config,
            chain,
            staking,
            slashing,
            stake_authority,
            delegate_election,
            votes,
            coordinator,
            difficulty,
            forks,
            store,
            keyring: options.keyring,
            writer: Mutex::new(WriterState {
                persisted_history: 0,
                pending_credits: HashMap::new(),
            }),
        })
    }

    /// Register a producer's signing seed. Only meaningful when the core was
    /// built with a keyring; returns the public key.
    pub fn register_validator_key(&self, validator: &str, seed: [u8; 32]) -> Result<Vec<u8>> {
        let keyring = self
            .keyring
            .as_ref()
            .ok_or_else(|| ConsensusError::config("ledger core was built without a keyring"))?;
        let public_key = keyring.insert(validator, seed);
        self.stake_authority.register_key(validator, public_key.clone());
        self.delegate_election.register_key(validator, public_key.clone());
        Ok(public_key)
    }

    // ---- write side ----

    /// Validate `block` against the current tip and append it.
    pub fn submit_block(&self, block: Block) -> Result<BlockVerdict> {
        let mut writer = self.writer.lock();
        self.accept_block(&mut writer, block)
    }

    /// Mine the next block with the active strategy and append it.
    pub fn produce_block(&self, transactions: Vec<Transaction>) -> Result<Block> {
        let mut writer = self.writer.lock();
        let tip = self.tip()?;
        let block = self.coordinator.mine_block(transactions, &tip)?;
        match self.accept_block(&mut writer, block.clone())? {
            BlockVerdict::Accepted(_) => Ok(block),
            BlockVerdict::Rejected { reason } => Err(ConsensusError::InvalidBlock(format!(
                "locally produced block {} rejected: {}",
                block.index, reason
            ))),
        }
    }

    /// Process a chain received from a peer: append it when it simply
    /// extends ours, otherwise hand it to fork resolution.
    pub fn handle_peer_chain(&self, peer_chain: &[Block]) -> Result<PeerChainOutcome> {
        let mut writer = self.writer.lock();
        let (local_len, extends_local) = {
            let local = self.chain.snapshot();
            let extends = peer_chain.len() > local.len()
                && local
                    .blocks()
                    .iter()
                    .zip(peer_chain.iter())
                    .all(|(l, p)| l.hash == p.hash);
            (local.len(), extends)
        };
        if extends_local {
            let mut appended = 0;
            for block in &peer_chain[local_len..] {
                match self.accept_block(&mut writer, block.clone())? {
                    BlockVerdict::Accepted(_) => appended += 1,
                    BlockVerdict::Rejected { reason } => {
                        warn!("Stopped extending from peer chain at block {}: {}", block.index, reason);
                        break;
                    }
                }
            }
            return Ok(if appended > 0 {
                PeerChainOutcome::Extended(appended)
            } else {
                PeerChainOutcome::Ignored
            });
        }

        let known_forks = self.forks.fork_stats().total_forks;
        let before = self.chain.snapshot();
        let replaced = self.forks.resolve_fork(peer_chain);

        for info in self.forks.forks().into_iter().skip(known_forks) {
            self.store.insert(LedgerRecord::Fork(info))?;
        }
        if !replaced {
            return Ok(PeerChainOutcome::Ignored);
        }

        let adopted = self.chain.snapshot();
        self.rebase_rewards(&mut writer, &before, &adopted);
        self.sync_difficulty();
        let hashes: Vec<&str> = adopted.blocks().iter().map(|b| b.hash.as_str()).collect();
        self.votes.retain_hashes(&hashes);

        Ok(PeerChainOutcome::Reorganized {
            old_height: before.last().map_or(0, |b| b.index),
            new_height: adopted.last().map_or(0, |b| b.index),
        })
    }

    /// Feed a network observation (online/offline) into the slashing tracker.
    pub fn report_behavior(&self, validator: &str, behavior: Behavior) -> Result<Vec<SlashEvent>> {
        let mut writer = self.writer.lock();
        let height = self.chain.height();
        self.slashing.record_validator_behavior(validator, behavior, Some(height));
        self.auto_slash(&mut writer, validator, height)
    }

    /// Slash explicitly. The stake cut is applied to the staking ledger.
    pub fn slash(&self, validator: &str, reason: SlashReason, amount: Option<f64>) -> Result<SlashEvent> {
        let mut writer = self.writer.lock();
        let height = self.chain.height();
        self.apply_slash(&mut writer, validator, reason, amount, height)
    }

    pub fn stake(&self, validator: &str, staker: &str, amount: u64) -> Result<bool> {
        let mut writer = self.writer.lock();
        let staked = self.staking.stake(validator, staker, amount);
        self.persist_staking_history(&mut writer)?;
        Ok(staked)
    }

    pub fn unstake(&self, validator: &str, staker: &str, amount: u64) -> Result<bool> {
        let mut writer = self.writer.lock();
        let queued = self.staking.unstake(validator, staker, amount);
        self.persist_staking_history(&mut writer)?;
        Ok(queued)
    }

    /// Release matured unstakes, pay out the reward pool and drop fork
    /// records older than the configured age.
    pub fn settle(&self, height: u64) -> Result<SettlementReport> {
        let mut writer = self.writer.lock();
        let released = self.staking.process_unstaking();
        let payouts = self.staking.distribute_rewards(height);
        if self.staking.reward_pool() == 0 {
            writer.pending_credits.clear();
        }
        let forks_pruned = self.forks.clean_up_old_forks(self.config.fork.fork_max_age_secs);
        self.persist_staking_history(&mut writer)?;

        if !released.is_empty() || !payouts.is_empty() {
            debug!(
                "Settlement at height {}: {} release(s), {} payout(s)",
                height,
                released.len(),
                payouts.len()
            );
        }
        Ok(SettlementReport {
            height,
            released,
            payouts,
            forks_pruned,
        })
    }

    /// Switch strategies without touching the chain. A mining strategy
    /// picks up the difficulty the chain calls for next.
    pub fn switch_consensus(&self, tag: &str) -> Result<()> {
        let _writer = self.writer.lock();
        self.coordinator.switch(tag)?;
        self.sync_difficulty();
        Ok(())
    }

    /// Run `settle` at the current height every `period` until the task is
    /// aborted or the core is dropped.
    pub fn spawn_settlement(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let core = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let Some(core) = core.upgrade() else {
                    debug!("Ledger core dropped; settlement task exiting");
                    break;
                };
                if let Err(e) = core.settle(core.height()) {
                    warn!("Periodic settlement failed: {}", e);
                }
            }
        })
    }

    // ---- read side ----

    pub fn status(&self) -> LedgerStatus {
        let snapshot = self.chain.snapshot();
        let staking = self.staking.staking_stats();
        LedgerStatus {
            height: snapshot.last().map(|b| b.index).unwrap_or(0),
            tip_hash: snapshot.last().map(|b| b.hash.clone()).unwrap_or_default(),
            consensus: self.coordinator.current_kind(),
            difficulty: self.coordinator.difficulty(),
            total_stake: staking.total_stake,
            reward_pool: staking.reward_pool,
            validator_count: staking.validator_count,
            pending_unstakes: staking.pending_unstakes,
            slash_events: self.slashing.statistics().total_events,
            forks: self.forks.fork_stats(),
        }
    }

    pub fn is_consensus_achieved(&self, peers: &[PeerStatus]) -> bool {
        self.coordinator.is_consensus_achieved(&self.chain.snapshot(), peers)
    }

    /// Record a peer's agreement on a block hash (PBFT).
    pub fn record_vote(&self, block_hash: &str, voter: &str) -> usize {
        self.votes.record_vote(block_hash, voter)
    }

    pub fn height(&self) -> u64 {
        self.chain.height()
    }

    pub fn chain(&self) -> Arc<Blockchain> {
        self.chain.snapshot()
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn staking(&self) -> &StakingLedger {
        &self.staking
    }

    pub fn slashing(&self) -> &SlashingTracker {
        &self.slashing
    }

    pub fn forks(&self) -> &ForkResolver {
        &self.forks
    }

    pub fn coordinator(&self) -> &ConsensusCoordinator {
        &self.coordinator
    }

    pub fn store(&self) -> &dyn LedgerStore {
        self.store.as_ref()
    }

    // ---- internals (writer lock held) ----

    fn tip(&self) -> Result<Block> {
        self.chain
            .tip()
            .ok_or_else(|| ConsensusError::InvalidBlock("chain has no genesis block".into()))
    }

    fn accept_block(&self, writer: &mut WriterState, block: Block) -> Result<BlockVerdict> {
        let tip = self.tip()?;

        let header_ok = {
            let snapshot = self.chain.snapshot();
            if snapshot.contains_hash(&block.hash) {
                return Ok(BlockVerdict::Rejected {
                    reason: format!("block {} already known", block.hash),
                });
            }
            // Stale or mangled blocks say nothing about the producer they name
            if !block.has_valid_hash() || !block.links_to(&tip) {
                debug!(
                    "Dropped block {} naming {}: does not extend tip {}",
                    block.index, block.validator, tip.index
                );
                return Ok(BlockVerdict::Rejected {
                    reason: format!("block {} does not extend tip {}", block.index, tip.index),
                });
            }
            let work_based = self.coordinator.difficulty().is_some();
            let rules = self.difficulty.read();
            rules.check_header(&block, &tip, snapshot.blocks(), work_based)
        };

        let rejection = if !header_ok {
            Some(format!(
                "block {} carries difficulty {}, not the scheduled one",
                block.index, block.difficulty
            ))
        } else if !self.coordinator.validate_block(&block, &tip) {
            Some(format!(
                "{} consensus rejected block {}",
                self.coordinator.current_kind(),
                block.index
            ))
        } else {
            None
        };
        if let Some(reason) = rejection {
            warn!("Rejected block {} from {}: {}", block.index, block.validator, reason);
            if self.is_authenticated(&block) {
                self.slashing.record_validator_behavior(
                    &block.validator,
                    Behavior::InvalidBlock,
                    Some(block.index),
                );
                self.auto_slash(writer, &block.validator, block.index)?;
            } else {
                debug!(
                    "Not penalising {}: block {} carries no verifiable signature",
                    block.validator, block.index
                );
            }
            return Ok(BlockVerdict::Rejected { reason });
        }

        let consensus_reward = self.coordinator.calculate_reward(&block);
        let fees = block.total_fees();
        let index = block.index;
        let hash = block.hash.clone();
        let validator = block.validator.clone();
        self.chain.append(block)?;

        self.slashing
            .record_validator_behavior(&validator, Behavior::ValidBlock, Some(index));
        let pooled = self.staking.add_rewards(self.staking.block_reward(), fees);
        writer.pending_credits.insert(hash.clone(), pooled);
        let retargeted = self.sync_difficulty();

        debug!("Accepted block {} ({}) from {}", index, hash, validator);
        Ok(BlockVerdict::Accepted(AcceptedBlock {
            index,
            hash,
            validator,
            consensus_reward,
            pooled,
            retargeted,
        }))
    }

    /// True when the block carries a valid signature by the producer it
    /// names. Only such blocks may count against that producer.
    fn is_authenticated(&self, block: &Block) -> bool {
        let Some(keyring) = &self.keyring else {
            return false;
        };
        let Some(public_key) = keyring.public_key(&block.validator) else {
            return false;
        };
        verify_bytes(&public_key, block.hash.as_bytes(), &block.signature)
    }

    /// Point the active mining strategy at the difficulty the next block
    /// must carry. Returns the new difficulty when it changed.
    fn sync_difficulty(&self) -> Option<u64> {
        let current = self.coordinator.difficulty()?;
        let snapshot = self.chain.snapshot();
        let tip = snapshot.last()?;
        let rules = self.difficulty.read();
        let next = rules.expected_next(snapshot.blocks(), true)?;
        if next == current {
            return None;
        }
        match rules.adjustment_info(snapshot.blocks(), tip.difficulty) {
            Some(record) if rules.should_adjust_difficulty(tip.index) => info!(
                "Difficulty retarget at block {}: {} -> {} ({:.1}s actual vs {:.1}s expected)",
                tip.index, current, next, record.actual_secs, record.expected_secs
            ),
            _ => info!("Difficulty realigned with chain at block {}: {} -> {}", tip.index, current, next),
        }
        self.coordinator.retarget(next);
        Some(next)
    }

    /// Move pool credits from blocks a reorg orphaned to the blocks it
    /// adopted. Credits already paid out by a settlement stay paid.
    fn rebase_rewards(&self, writer: &mut WriterState, before: &Blockchain, adopted: &Blockchain) {
        let shared = before
            .blocks()
            .iter()
            .zip(adopted.blocks())
            .take_while(|(old, new)| old.hash == new.hash)
            .count();

        let orphaned: u64 = before.blocks()[shared..]
            .iter()
            .filter_map(|b| writer.pending_credits.remove(&b.hash))
            .sum();
        let reclaimed = self.staking.reclaim_rewards(orphaned);

        let mut credited = 0u64;
        for block in &adopted.blocks()[shared..] {
            let pooled = self
                .staking
                .add_rewards(self.staking.block_reward(), block.total_fees());
            writer.pending_credits.insert(block.hash.clone(), pooled);
            credited = credited.saturating_add(pooled);
        }
        info!(
            "Reorg rewards: {} reclaimed from {} orphaned block(s), {} credited for {} adopted",
            reclaimed,
            before.len() - shared,
            credited,
            adopted.len() - shared
        );
    }

    fn auto_slash(&self, writer: &mut WriterState, validator: &str, height: u64) -> Result<Vec<SlashEvent>> {
        if !self.config.slashing.auto_slash {
            return Ok(Vec::new());
        }
        // Conditions are empty during cooldown, so at most one slash lands
        let Some(reason) = self.slashing.check_slashing_conditions(validator).into_iter().next() else {
            return Ok(Vec::new());
        };
        let event = self.apply_slash(writer, validator, reason, None, height)?;
        self.slashing.clear_behavior_history(validator);
        Ok(vec![event])
    }

    fn apply_slash(
        &self,
        writer: &mut WriterState,
        validator: &str,
        reason: SlashReason,
        amount: Option<f64>,
        height: u64,
    ) -> Result<SlashEvent> {
        let event = self.slashing.slash_validator(validator, reason, amount, Some(height))?;
        self.staking.apply_slash(validator, event.amount);
        self.store.insert(LedgerRecord::Slash(event.clone()))?;
        self.persist_staking_history(writer)?;
        Ok(event)
    }

    fn persist_staking_history(&self, writer: &mut WriterState) -> Result<()> {
        let pending = self.staking.history_since(writer.persisted_history);
        for record in pending {
            self.store.insert(LedgerRecord::Stake(record))?;
            writer.persisted_history += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::MemoryStore;

    fn core(kind: &str) -> (LedgerCore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::at_unix(1_700_000_000));
        let mut config = CoreConfig::default();
        config.consensus.kind = kind.to_string();
        config.consensus.pow_difficulty = 1;
        let core = LedgerCore::new(config, clock.clone(), Arc::new(MemoryStore::new())).unwrap();
        (core, clock)
    }

    #[test]
    fn test_produce_and_status() {
        let (core, clock) = core("pow");
        clock.advance_secs(60);
        let block = core
            .produce_block(vec![Transaction::new("alice", "bob", 10, 4)])
            .unwrap();
        assert_eq!(block.index, 1);
        assert_eq!(block.validator, "node");

        let status = core.status();
        assert_eq!(status.height, 1);
        assert_eq!(status.tip_hash, block.hash);
        assert_eq!(status.consensus, "pow");
        // block_reward 50 + half of the 4 fee units
        assert_eq!(status.reward_pool, 52);
    }

    #[test]
    fn test_duplicate_block_rejected_without_penalty() {
        let (core, clock) = core("pow");
        clock.advance_secs(60);
        let block = core.produce_block(vec![]).unwrap();
        let verdict = core.submit_block(block.clone()).unwrap();
        assert!(!verdict.is_accepted());
        assert!(core.slashing().behavior_record("node").map_or(true, |r| r.invalid_blocks == 0));
    }

    #[test]
    fn test_unknown_switch_keeps_current() {
        let (core, _) = core("pow");
        assert!(matches!(
            core.switch_consensus("raft"),
            Err(ConsensusError::Configuration(_))
        ));
        assert_eq!(core.coordinator().current_kind(), "pow");
    }

    #[test]
    fn test_keyring_required_for_key_registration() {
        let (core, _) = core("pow");
        assert!(core.register_validator_key("v1", [1u8; 32]).is_err());
    }

    #[test]
    fn test_invalid_initial_config_rejected() {
        let clock = Arc::new(ManualClock::at_unix(1_700_000_000));
        let mut config = CoreConfig::default();
        config.consensus.kind = "raft".into();
        let result = LedgerCore::new(config, clock, Arc::new(MemoryStore::new()));
        assert!(matches!(result, Err(ConsensusError::Configuration(_))));
    }
}
