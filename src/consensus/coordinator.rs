// src/consensus/coordinator.rs
// Strategy registry and hot-swap manager.
//
// `ConsensusFactory` maps a tag to a constructor closure. The coordinator
// builds strategies on demand, keeps at most one instance per tag, and
// forwards every consensus call to whichever one is current.

use super::{
    AgreementCollector, ConsensusKind, ConsensusStrategy, DelegateAuthority, DelegatedProofOfStake,
    Pbft, PeerStatus, ProofOfStake, ProofOfWork, ValidatorAuthority,
};
use crate::chain::{Address, Block, Blockchain, Transaction};
use crate::clock::Clock;
use crate::crypto::BlockSigner;
use crate::error::{ConsensusError, Result};
use log::info;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Everything a constructor may need. Strategies take what they use.
#[derive(Clone)]
pub struct StrategyParams {
    pub difficulty: u64,
    /// Local miner address for PoW
    pub miner: Address,
    /// f for PBFT
    pub fault_tolerance: usize,
    pub fee_share: f64,
    pub validator_authority: Option<Arc<dyn ValidatorAuthority>>,
    pub delegate_authority: Option<Arc<dyn DelegateAuthority>>,
    pub agreements: Option<Arc<dyn AgreementCollector>>,
    pub signer: Option<Arc<dyn BlockSigner>>,
    pub clock: Arc<dyn Clock>,
}

impl StrategyParams {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            difficulty: 3,
            miner: "miner".to_string(),
            fault_tolerance: 1,
            fee_share: 0.5,
            validator_authority: None,
            delegate_authority: None,
            agreements: None,
            signer: None,
            clock,
        }
    }

    fn require_validator_authority(&self, tag: &str) -> Result<Arc<dyn ValidatorAuthority>> {
        self.validator_authority
            .clone()
            .ok_or_else(|| ConsensusError::config(format!("{} consensus needs a validator authority", tag)))
    }
}

type Constructor = Box<dyn Fn(&StrategyParams) -> Result<Arc<dyn ConsensusStrategy>> + Send + Sync>;

pub struct ConsensusFactory {
    constructors: HashMap<String, Constructor>,
}

impl Default for ConsensusFactory {
    fn default() -> Self {
        Self::with_builtin()
    }
}

impl ConsensusFactory {
    /// Empty registry.
    pub fn empty() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// Registry pre-loaded with pow, pos, dpos and pbft.
    pub fn with_builtin() -> Self {
        let mut factory = Self::empty();

        factory.register(ConsensusKind::Pow.as_str(), |p| {
            Ok(Arc::new(ProofOfWork::new(p.difficulty, &p.miner, p.clock.clone())))
        });

        factory.register(ConsensusKind::Pos.as_str(), |p| {
            let mut pos = ProofOfStake::new(p.require_validator_authority("pos")?, p.clock.clone(), p.fee_share);
            if let Some(signer) = &p.signer {
                pos = pos.with_signer(signer.clone());
            }
            Ok(Arc::new(pos))
        });

        factory.register(ConsensusKind::Dpos.as_str(), |p| {
            let authority = p
                .delegate_authority
                .clone()
                .ok_or_else(|| ConsensusError::config("dpos consensus needs a delegate authority"))?;
            let mut dpos = DelegatedProofOfStake::new(authority, p.clock.clone());
            if let Some(signer) = &p.signer {
                dpos = dpos.with_signer(signer.clone());
            }
            Ok(Arc::new(dpos))
        });

        factory.register(ConsensusKind::Pbft.as_str(), |p| {
            let agreements = p
                .agreements
                .clone()
                .ok_or_else(|| ConsensusError::config("pbft consensus needs an agreement collector"))?;
            let mut pbft = Pbft::new(
                p.require_validator_authority("pbft")?,
                agreements,
                p.fault_tolerance,
                p.clock.clone(),
            );
            if let Some(signer) = &p.signer {
                pbft = pbft.with_signer(signer.clone());
            }
            Ok(Arc::new(pbft))
        });

        factory
    }

    /// Register (or replace) the constructor for `tag`.
    pub fn register<F>(&mut self, tag: &str, constructor: F)
    where
        F: Fn(&StrategyParams) -> Result<Arc<dyn ConsensusStrategy>> + Send + Sync + 'static,
    {
        self.constructors.insert(tag.to_string(), Box::new(constructor));
    }

    pub fn create(&self, tag: &str, params: &StrategyParams) -> Result<Arc<dyn ConsensusStrategy>> {
        let constructor = self
            .constructors
            .get(tag)
            .ok_or_else(|| ConsensusError::config(format!("unknown consensus type: {}", tag)))?;
        constructor(params)
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.constructors.contains_key(tag)
    }

    pub fn tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.constructors.keys().cloned().collect();
        tags.sort();
        tags
    }
}

/// Structured notification of coordinator state changes
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum CoordinatorEvent {
    Switched {
        from: Option<String>,
        to: String,
        /// Instance was reused from the cache
        cached: bool,
    },
    Retargeted {
        difficulty: u64,
    },
}

pub trait CoordinatorObserver: Send + Sync {
    fn on_event(&self, event: &CoordinatorEvent);
}

struct Active {
    tag: String,
    strategy: Arc<dyn ConsensusStrategy>,
}

pub struct ConsensusCoordinator {
    factory: ConsensusFactory,
    params: StrategyParams,
    cache: RwLock<HashMap<String, Arc<dyn ConsensusStrategy>>>,
    current: RwLock<Active>,
    /// Last difficulty pushed through `retarget`
    retargeted: RwLock<Option<u64>>,
    observer: Option<Arc<dyn CoordinatorObserver>>,
}

impl ConsensusCoordinator {
    pub fn new(factory: ConsensusFactory, params: StrategyParams, initial: &str) -> Result<Self> {
        Self::with_observer(factory, params, initial, None)
    }

    pub fn with_observer(
        factory: ConsensusFactory,
        params: StrategyParams,
        initial: &str,
        observer: Option<Arc<dyn CoordinatorObserver>>,
    ) -> Result<Self> {
        let strategy = factory.create(initial, &params)?;
        let mut cache = HashMap::new();
        cache.insert(initial.to_string(), strategy.clone());

        info!("Consensus initialised with {}", initial);
        let coordinator = Self {
            factory,
            params,
            cache: RwLock::new(cache),
            current: RwLock::new(Active {
                tag: initial.to_string(),
                strategy,
            }),
            retargeted: RwLock::new(None),
            observer,
        };
        coordinator.emit(CoordinatorEvent::Switched {
            from: None,
            to: initial.to_string(),
            cached: false,
        });
        Ok(coordinator)
    }

    fn emit(&self, event: CoordinatorEvent) {
        if let Some(observer) = &self.observer {
            observer.on_event(&event);
        }
    }

    /// Make `tag` the active strategy, building it on first use. Unknown tags
    /// leave the current strategy in place.
    pub fn switch(&self, tag: &str) -> Result<()> {
        let cached = self.cache.read().get(tag).cloned();
        let (strategy, was_cached) = match cached {
            Some(strategy) => (strategy, true),
            None => {
                let built = self.factory.create(tag, &self.params)?;
                if let Some(difficulty) = *self.retargeted.read() {
                    built.retarget(difficulty);
                }
                let mut cache = self.cache.write();
                let entry = cache.entry(tag.to_string()).or_insert(built);
                (entry.clone(), false)
            }
        };

        let previous = {
            let mut current = self.current.write();
            let previous = std::mem::replace(&mut current.tag, tag.to_string());
            current.strategy = strategy;
            previous
        };

        info!("Switched to {} consensus (from {})", tag, previous);
        self.emit(CoordinatorEvent::Switched {
            from: Some(previous),
            to: tag.to_string(),
            cached: was_cached,
        });
        Ok(())
    }

    pub fn current(&self) -> Arc<dyn ConsensusStrategy> {
        self.current.read().strategy.clone()
    }

    pub fn current_kind(&self) -> String {
        self.current.read().tag.clone()
    }

    pub fn cached_tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.cache.read().keys().cloned().collect();
        tags.sort();
        tags
    }

    pub fn validate_block(&self, block: &Block, previous: &Block) -> bool {
        self.current().validate_block(block, previous)
    }

    pub fn mine_block(&self, transactions: Vec<Transaction>, previous: &Block) -> Result<Block> {
        self.current().mine_block(transactions, previous)
    }

    pub fn calculate_reward(&self, block: &Block) -> u64 {
        self.current().calculate_reward(block)
    }

    pub fn is_consensus_achieved(&self, chain: &Blockchain, peers: &[PeerStatus]) -> bool {
        self.current().is_consensus_achieved(chain, peers)
    }

    pub fn select_validator(&self, candidates: &[Address], previous: &Block) -> Option<Address> {
        self.current().select_validator(candidates, previous)
    }

    /// Push a difficulty to every cached strategy. Strategies built later
    /// start from it too.
    pub fn retarget(&self, difficulty: u64) {
        *self.retargeted.write() = Some(difficulty);
        for strategy in self.cache.read().values() {
            strategy.retarget(difficulty);
        }
        self.emit(CoordinatorEvent::Retargeted { difficulty });
    }

    pub fn difficulty(&self) -> Option<u64> {
        self.current().difficulty()
    }
}
