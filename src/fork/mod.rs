// src/fork/mod.rs
// Fork detection and resolution against peer chains.
//
// Detection walks both chains from genesis while hashes match; the last
// match is the common ancestor. Resolution only replaces the local chain
// when the peer chain is strictly stronger under the configured comparator
// AND passes full re-validation, header difficulty included. The replacement is published with a single
// pointer swap, so concurrent readers see either chain in full.

use crate::chain::{Block, Blockchain, ChainHandle};
use crate::clock::Clock;
use crate::config::{DifficultyConfig, ForkConfig};
use crate::consensus::{standard_linkage, ConsensusCoordinator};
use crate::difficulty::DifficultyAdjuster;
use crate::error::{ConsensusError, Result};
use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    LongestChain,
    CumulativeDifficulty,
    LatestTimestamp,
}

impl ResolutionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionStrategy::LongestChain => "longest_chain",
            ResolutionStrategy::CumulativeDifficulty => "cumulative_difficulty",
            ResolutionStrategy::LatestTimestamp => "latest_timestamp",
        }
    }

    /// True when `peer` beats `local` strictly. Ties never win.
    pub fn prefers(&self, local: &[Block], peer: &[Block]) -> bool {
        match self {
            ResolutionStrategy::LongestChain => peer.len() > local.len(),
            ResolutionStrategy::CumulativeDifficulty => {
                let sum = |c: &[Block]| c.iter().map(|b| b.difficulty as u128).sum::<u128>();
                sum(peer) > sum(local)
            }
            ResolutionStrategy::LatestTimestamp => match (local.last(), peer.last()) {
                (Some(l), Some(p)) => p.timestamp > l.timestamp,
                (None, Some(_)) => true,
                _ => false,
            },
        }
    }
}

impl fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResolutionStrategy {
    type Err = ConsensusError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "longest_chain" => Ok(ResolutionStrategy::LongestChain),
            "cumulative_difficulty" => Ok(ResolutionStrategy::CumulativeDifficulty),
            "latest_timestamp" => Ok(ResolutionStrategy::LatestTimestamp),
            other => Err(ConsensusError::config(format!(
                "unsupported resolution strategy: {}",
                other
            ))),
        }
    }
}

/// A detected divergence between the local chain and a peer chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForkInfo {
    pub common_ancestor_index: u64,
    pub common_ancestor_hash: String,
    /// Local blocks after the common ancestor
    pub local_fork_depth: u64,
    /// Peer blocks after the common ancestor
    pub peer_fork_depth: u64,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForkStats {
    pub total_forks: usize,
    /// Mean of local + peer depth per fork
    pub average_fork_depth: f64,
    pub last_fork_time: Option<DateTime<Utc>>,
}

struct ResolverSettings {
    fork_threshold: u64,
    strategy: ResolutionStrategy,
}

pub struct ForkResolver {
    chain: ChainHandle,
    consensus: Arc<ConsensusCoordinator>,
    difficulty: Arc<RwLock<DifficultyAdjuster>>,
    clock: Arc<dyn Clock>,
    settings: RwLock<ResolverSettings>,
    forks: Mutex<Vec<ForkInfo>>,
}

impl ForkResolver {
    pub fn new(
        config: &ForkConfig,
        chain: ChainHandle,
        consensus: Arc<ConsensusCoordinator>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let strategy = ResolutionStrategy::from_str(&config.resolution_strategy)?;
        if config.fork_threshold < 1 {
            return Err(ConsensusError::policy("fork threshold must be at least 1"));
        }
        Ok(Self {
            chain,
            consensus,
            difficulty: Arc::new(RwLock::new(DifficultyAdjuster::from_config(
                &DifficultyConfig::default(),
            ))),
            clock,
            settings: RwLock::new(ResolverSettings {
                fork_threshold: config.fork_threshold,
                strategy,
            }),
            forks: Mutex::new(Vec::new()),
        })
    }

    /// Check peer headers against `rules` instead of the default retarget
    /// settings. The ledger core shares its own adjuster here.
    pub fn with_difficulty_rules(mut self, rules: Arc<RwLock<DifficultyAdjuster>>) -> Self {
        self.difficulty = rules;
        self
    }

    /// Common ancestor and divergence depths, if the two chains diverge by
    /// at least the fork threshold on either side.
    fn find_fork(&self, local: &[Block], peer: &[Block], now: DateTime<Utc>) -> Option<ForkInfo> {
        if local.len() < 2 || peer.len() < 2 {
            return None;
        }

        let min_len = local.len().min(peer.len());
        let matching = local
            .iter()
            .zip(peer.iter())
            .take_while(|(l, p)| l.hash == p.hash)
            .count();

        // No shared genesis, or one chain is a prefix of the other
        if matching == 0 || matching == min_len {
            return None;
        }

        let ancestor = matching - 1;
        let local_depth = (local.len() - matching) as u64;
        let peer_depth = (peer.len() - matching) as u64;
        let threshold = self.settings.read().fork_threshold;
        if local_depth < threshold && peer_depth < threshold {
            debug!(
                "Divergence after index {} below threshold {} (local {}, peer {})",
                ancestor, threshold, local_depth, peer_depth
            );
            return None;
        }

        Some(ForkInfo {
            common_ancestor_index: local[ancestor].index,
            common_ancestor_hash: local[ancestor].hash.clone(),
            local_fork_depth: local_depth,
            peer_fork_depth: peer_depth,
            detected_at: now,
        })
    }

    fn record(&self, info: &ForkInfo) {
        warn!(
            "Fork detected at index {} ({}): local depth {}, peer depth {}",
            info.common_ancestor_index, info.common_ancestor_hash, info.local_fork_depth, info.peer_fork_depth
        );
        self.forks.lock().push(info.clone());
    }

    /// Compare the local chain with `peer_chain`; record and report a fork.
    pub fn detect_fork(&self, peer_chain: &[Block]) -> bool {
        let now = self.clock.now();
        let local = self.chain.snapshot();
        match self.find_fork(local.blocks(), peer_chain, now) {
            Some(info) => {
                self.record(&info);
                true
            }
            None => false,
        }
    }

    /// Full re-validation of every block after genesis: index continuity,
    /// linkage, the difficulty its height calls for, and the active
    /// consensus rules. Each header is judged against its own history.
    pub fn is_chain_valid(&self, chain: &[Block]) -> bool {
        let work_based = self.consensus.difficulty().is_some();
        let rules = self.difficulty.read();
        chain.windows(2).enumerate().all(|(i, pair)| {
            let (previous, block) = (&pair[0], &pair[1]);
            if !rules.check_header(block, previous, &chain[..=i], work_based) {
                debug!(
                    "Block {} claims difficulty {} after {}",
                    block.index, block.difficulty, previous.difficulty
                );
                return false;
            }
            standard_linkage(block, previous) && self.consensus.validate_block(block, previous)
        })
    }

    /// Adopt `peer_chain` if a fork exists, the peer chain is strictly
    /// stronger and it validates. Returns whether the local chain was replaced.
    pub fn resolve_fork(&self, peer_chain: &[Block]) -> bool {
        let now = self.clock.now();
        let local = self.chain.snapshot();

        let Some(info) = self.find_fork(local.blocks(), peer_chain, now) else {
            return false;
        };
        self.record(&info);

        let strategy = self.settings.read().strategy;
        if !strategy.prefers(local.blocks(), peer_chain) {
            info!("Keeping local chain: peer chain is not stronger by {}", strategy);
            return false;
        }
        if !self.is_chain_valid(peer_chain) {
            warn!("Rejecting peer chain of length {}: validation failed", peer_chain.len());
            return false;
        }

        let replacement = Blockchain::from_blocks(peer_chain.to_vec());
        if !self.chain.swap(&local, replacement) {
            warn!("Local chain changed during fork resolution; swap aborted");
            return false;
        }

        info!(
            "Adopted peer chain by {}: {} -> {} blocks (reorg depth {})",
            strategy,
            local.len(),
            peer_chain.len(),
            info.local_fork_depth
        );
        true
    }

    pub fn forks(&self) -> Vec<ForkInfo> {
        self.forks.lock().clone()
    }

    pub fn fork_stats(&self) -> ForkStats {
        let forks = self.forks.lock();
        let average_fork_depth = if forks.is_empty() {
            0.0
        } else {
            forks
                .iter()
                .map(|f| (f.local_fork_depth + f.peer_fork_depth) as f64)
                .sum::<f64>()
                / forks.len() as f64
        };
        ForkStats {
            total_forks: forks.len(),
            average_fork_depth,
            last_fork_time: forks.last().map(|f| f.detected_at),
        }
    }

    /// Forget forks detected more than `max_age_secs` ago. Returns how many were dropped.
    pub fn clean_up_old_forks(&self, max_age_secs: i64) -> usize {
        let now = self.clock.now();
        let max_age = Duration::seconds(max_age_secs);
        let mut forks = self.forks.lock();
        let before = forks.len();
        forks.retain(|f| now - f.detected_at <= max_age);
        before - forks.len()
    }

    pub fn resolution_strategy(&self) -> ResolutionStrategy {
        self.settings.read().strategy
    }

    pub fn set_resolution_strategy(&self, strategy: &str) -> Result<()> {
        let parsed = ResolutionStrategy::from_str(strategy)?;
        self.settings.write().strategy = parsed;
        info!("Fork resolution strategy set to {}", parsed);
        Ok(())
    }

    pub fn fork_threshold(&self) -> u64 {
        self.settings.read().fork_threshold
    }

    pub fn set_fork_threshold(&self, threshold: u64) -> Result<()> {
        if threshold < 1 {
            return Err(ConsensusError::policy("fork threshold must be at least 1"));
        }
        self.settings.write().fork_threshold = threshold;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{Address, Transaction};
    use crate::clock::ManualClock;
    use crate::consensus::{ConsensusFactory, ConsensusStrategy, PeerStatus, StrategyParams};

    /// Linkage-only rules; blocks by "mallory" are always invalid. A mining
    /// variant makes headers follow the retarget schedule.
    struct LinkageOnly {
        mines: bool,
    }

    impl ConsensusStrategy for LinkageOnly {
        fn name(&self) -> &str {
            "linkage"
        }
        fn validate_block(&self, block: &Block, previous: &Block) -> bool {
            block.validator != "mallory" && standard_linkage(block, previous)
        }
        fn mine_block(&self, _txs: Vec<Transaction>, _previous: &Block) -> Result<Block> {
            Err(ConsensusError::NoEligibleProducer("test strategy".into()))
        }
        fn calculate_reward(&self, _block: &Block) -> u64 {
            0
        }
        fn is_consensus_achieved(&self, _chain: &Blockchain, _peers: &[PeerStatus]) -> bool {
            true
        }
        fn select_validator(&self, _candidates: &[Address], _previous: &Block) -> Option<Address> {
            None
        }
        fn difficulty(&self) -> Option<u64> {
            self.mines.then_some(1)
        }
    }

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    /// Extend `base` with `count` blocks by `producer` at `difficulty`.
    fn extend(base: &[Block], count: usize, producer: &str, difficulty: u64, start_secs: i64) -> Vec<Block> {
        let mut blocks = base.to_vec();
        for i in 0..count {
            let prev = blocks.last().unwrap().clone();
            let ts = t(start_secs + 10 * i as i64);
            blocks.push(Block::next(&prev, ts, difficulty, producer, vec![]));
        }
        blocks
    }

    fn resolver(local: &[Block], strategy: &str) -> (ForkResolver, ChainHandle, Arc<ManualClock>) {
        resolver_with(local, strategy, "linkage")
    }

    fn resolver_with(
        local: &[Block],
        strategy: &str,
        tag: &str,
    ) -> (ForkResolver, ChainHandle, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::at_unix(1_700_010_000));
        let mut factory = ConsensusFactory::with_builtin();
        factory.register("linkage", |_| Ok(Arc::new(LinkageOnly { mines: false })));
        factory.register("linkage_work", |_| Ok(Arc::new(LinkageOnly { mines: true })));
        let coordinator = Arc::new(
            ConsensusCoordinator::new(factory, StrategyParams::new(clock.clone()), tag).unwrap(),
        );
        let chain = ChainHandle::new(Blockchain::from_blocks(local.to_vec()));
        let config = ForkConfig {
            resolution_strategy: strategy.to_string(),
            ..ForkConfig::default()
        };
        let resolver = ForkResolver::new(&config, chain.clone(), coordinator, clock.clone()).unwrap();
        (resolver, chain, clock)
    }

    fn prefix(k: usize) -> Vec<Block> {
        extend(&[Block::genesis(t(0), 1)], k - 1, "val0", 1, 10)
    }

    #[test]
    fn test_detects_common_ancestor_at_k_minus_one() {
        let shared = prefix(4);
        let local = extend(&shared, 2, "local", 1, 100);
        let peer = extend(&shared, 3, "peer", 1, 200);
        let (resolver, _, _) = resolver(&local, "longest_chain");

        assert!(resolver.detect_fork(&peer));
        let info = &resolver.forks()[0];
        assert_eq!(info.common_ancestor_index, 3);
        assert_eq!(info.local_fork_depth, 2);
        assert_eq!(info.peer_fork_depth, 3);
    }

    #[test]
    fn test_shallow_divergence_is_not_a_fork() {
        let shared = prefix(4);
        let local = extend(&shared, 1, "local", 1, 100);
        let peer = extend(&shared, 1, "peer", 1, 200);
        let (resolver, _, _) = resolver(&local, "longest_chain");
        assert!(!resolver.detect_fork(&peer));
        assert!(resolver.forks().is_empty());
    }

    #[test]
    fn test_requires_shared_genesis_and_two_blocks() {
        let local = prefix(4);
        let foreign = extend(&[Block::genesis(t(1), 1)], 5, "peer", 1, 100);
        let (resolver, _, _) = resolver(&local, "longest_chain");
        assert!(!resolver.detect_fork(&foreign));
        assert!(!resolver.detect_fork(&local[..1]));
        // Pure extension of the local chain is not a fork either
        assert!(!resolver.detect_fork(&extend(&local, 3, "peer", 1, 100)));
    }

    #[test]
    fn test_longest_chain_swap() {
        let shared = prefix(3);
        let local = extend(&shared, 2, "local", 1, 100);
        let peer = extend(&shared, 4, "peer", 1, 200);
        let (resolver, chain, _) = resolver(&local, "longest_chain");

        assert!(resolver.resolve_fork(&peer));
        let adopted = chain.snapshot();
        assert_eq!(adopted.len(), peer.len());
        assert!(adopted.contains_hash(&peer.last().unwrap().hash));
        assert!(!adopted.contains_hash(&local.last().unwrap().hash));
    }

    #[test]
    fn test_identical_chain_never_swaps() {
        let local = extend(&prefix(3), 3, "local", 1, 100);
        for strategy in ["longest_chain", "cumulative_difficulty", "latest_timestamp"] {
            let (resolver, chain, _) = resolver(&local, strategy);
            let before = chain.snapshot();
            assert!(!resolver.resolve_fork(&local));
            assert!(Arc::ptr_eq(&before, &chain.snapshot()));
        }
    }

    #[test]
    fn test_ties_do_not_swap() {
        let shared = prefix(3);
        let local = extend(&shared, 3, "local", 1, 100);
        let peer = extend(&shared, 3, "peer", 1, 100);
        for strategy in ["longest_chain", "cumulative_difficulty", "latest_timestamp"] {
            let (resolver, chain, _) = resolver(&local, strategy);
            assert!(resolver.detect_fork(&peer));
            assert!(!resolver.resolve_fork(&peer), "{} swapped on a tie", strategy);
            assert_eq!(chain.tip().unwrap().hash, local.last().unwrap().hash);
        }
    }

    /// Three-block retarget window against 60s blocks, changes up to 100%.
    fn fast_rules() -> Arc<RwLock<DifficultyAdjuster>> {
        Arc::new(RwLock::new(DifficultyAdjuster::from_config(&DifficultyConfig {
            target_block_time_secs: 60,
            adjustment_interval: 3,
            min_difficulty: 1,
            max_difficulty: 20,
            change_limit: 1.0,
        })))
    }

    #[test]
    fn test_cumulative_difficulty_beats_length() {
        // Indices 0..=2 at difficulty 4; the window closing at 2 doubles it
        let shared = extend(&[Block::genesis(t(0), 4)], 2, "val0", 4, 10);

        // Local window 3..=5 is slow, so index 6 falls to the floor
        let mut local = shared.clone();
        for start in [1_000, 2_000, 3_000] {
            local = extend(&local, 1, "local", 8, start);
        }
        local = extend(&local, 3, "local", 1, 4_000);
        // Peer window is fast, so index 6 doubles again
        let mut peer = extend(&shared, 3, "peer", 8, 30);
        peer = extend(&peer, 1, "peer", 16, 60);

        let (by_length, _, _) = resolver_with(&local, "longest_chain", "linkage_work");
        let by_length = by_length.with_difficulty_rules(fast_rules());
        assert!(by_length.is_chain_valid(&local));
        assert!(by_length.is_chain_valid(&peer));
        assert!(!by_length.resolve_fork(&peer));

        let (by_work, chain, _) = resolver_with(&local, "cumulative_difficulty", "linkage_work");
        let by_work = by_work.with_difficulty_rules(fast_rules());
        assert!(by_work.resolve_fork(&peer));
        assert_eq!(chain.snapshot().len(), peer.len());
    }

    #[test]
    fn test_unearned_difficulty_claims_are_rejected() {
        let shared = prefix(3);
        let local = extend(&shared, 4, "local", 1, 100);
        // Two blocks claiming far more work than the schedule allows
        let peer = extend(&shared, 2, "peer", 999_999, 100);

        for tag in ["linkage", "linkage_work"] {
            let (resolver, chain, _) = resolver_with(&local, "cumulative_difficulty", tag);
            assert!(!resolver.is_chain_valid(&peer));
            assert!(!resolver.resolve_fork(&peer));
            assert_eq!(chain.tip().unwrap().hash, local.last().unwrap().hash);
        }
    }

    #[test]
    fn test_latest_timestamp() {
        let shared = prefix(3);
        let local = extend(&shared, 3, "local", 1, 100);
        let peer = extend(&shared, 2, "peer", 1, 500);
        let (resolver, chain, _) = resolver(&local, "latest_timestamp");
        assert!(resolver.resolve_fork(&peer));
        assert_eq!(chain.tip().unwrap().validator, "peer");
    }

    #[test]
    fn test_invalid_candidate_leaves_chain_untouched() {
        let shared = prefix(3);
        let local = extend(&shared, 2, "local", 1, 100);
        let mut peer = extend(&shared, 2, "peer", 1, 200);
        peer = extend(&peer, 3, "mallory", 1, 300);
        let (resolver, chain, _) = resolver(&local, "longest_chain");
        let before = chain.snapshot();

        assert!(!resolver.resolve_fork(&peer));
        assert!(Arc::ptr_eq(&before, &chain.snapshot()));
        assert!(chain.snapshot().get_by_hash(&local.last().unwrap().hash).is_some());
    }

    #[test]
    fn test_broken_linkage_rejected() {
        let shared = prefix(3);
        let local = extend(&shared, 2, "local", 1, 100);
        let mut peer = extend(&shared, 4, "peer", 1, 200);
        peer[4].previous_hash = "forged".into();
        peer[4].reseal();
        let (resolver, chain, _) = resolver(&local, "longest_chain");
        assert!(!resolver.is_chain_valid(&peer));
        assert!(!resolver.resolve_fork(&peer));
        assert_eq!(chain.snapshot().len(), local.len());
    }

    #[test]
    fn test_stats_cleanup_and_setters() {
        let shared = prefix(3);
        let local = extend(&shared, 2, "local", 1, 100);
        let peer = extend(&shared, 2, "peer", 1, 200);
        let (resolver, _, clock) = resolver(&local, "longest_chain");

        resolver.detect_fork(&peer);
        clock.advance_secs(4000);
        resolver.detect_fork(&peer);

        let stats = resolver.fork_stats();
        assert_eq!(stats.total_forks, 2);
        assert!((stats.average_fork_depth - 4.0).abs() < 1e-9);
        assert_eq!(stats.last_fork_time, Some(clock.now()));

        assert_eq!(resolver.clean_up_old_forks(3600), 1);
        assert_eq!(resolver.forks().len(), 1);

        assert!(matches!(
            resolver.set_resolution_strategy("most_votes"),
            Err(ConsensusError::Configuration(_))
        ));
        assert!(resolver.set_fork_threshold(0).unwrap_err().is_policy_violation());
        resolver.set_fork_threshold(3).unwrap();
        assert!(!resolver.detect_fork(&peer));
    }

    #[test]
    fn test_swap_aborts_when_local_changed() {
        let shared = prefix(3);
        let local = extend(&shared, 2, "local", 1, 100);
        let peer = extend(&shared, 4, "peer", 1, 200);
        let (_, chain, _) = resolver(&local, "longest_chain");

        let stale = chain.snapshot();
        let next = Block::next(local.last().unwrap(), t(999), 1, "local", vec![]);
        chain.append(next).unwrap();
        assert!(!chain.swap(&stale, Blockchain::from_blocks(peer)));
    }
}
