// src/staking/mod.rs
// Staking, delegation, unstaking lockup and reward distribution.
//
// Validators live in an address-ordered arena so that every pass over them
// (reward splitting in particular) is deterministic. Unstaking is two-phase:
// `unstake` only queues a request, the balance stays staked until
// `process_unstaking` observes that the lockup has elapsed.

pub mod rewards;

pub use rewards::{PayoutKind, PPM};

use crate::chain::Address;
use crate::clock::Clock;
use crate::config::StakingConfig;
use crate::error::{ConsensusError, Result};
use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use parking_lot::RwLock;
use rewards::{from_ppm, mul_div, split_pool, to_ppm};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validator {
    pub address: Address,
    pub self_stake: u64,
    /// Delegator address -> stake, ordered by address
    pub delegators: BTreeMap<Address, u64>,
    pub commission_ppm: u64,
    /// Set once the validator has made its first self-stake
    pub bonded: bool,
}

impl Validator {
    fn new(address: &str, commission_ppm: u64) -> Self {
        Self {
            address: address.to_string(),
            self_stake: 0,
            delegators: BTreeMap::new(),
            commission_ppm,
            bonded: false,
        }
    }

    pub fn delegated_stake(&self) -> u64 {
        self.delegators.values().sum()
    }

    pub fn total_stake(&self) -> u64 {
        self.self_stake + self.delegated_stake()
    }

    pub fn commission(&self) -> f64 {
        from_ppm(self.commission_ppm)
    }

    fn balance_of(&self, staker: &str) -> u64 {
        if staker == self.address {
            self.self_stake
        } else {
            self.delegators.get(staker).copied().unwrap_or(0)
        }
    }

    /// Remove up to `amount` from the staker's balance, returning what was removed.
    fn withdraw(&mut self, staker: &str, amount: u64) -> u64 {
        if staker == self.address {
            let removed = amount.min(self.self_stake);
            self.self_stake -= removed;
            return removed;
        }
        let Some(balance) = self.delegators.get_mut(staker) else {
            return 0;
        };
        let removed = amount.min(*balance);
        *balance -= removed;
        if *balance == 0 {
            self.delegators.remove(staker);
        }
        removed
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnstakeRequest {
    pub id: Uuid,
    pub validator: Address,
    pub staker: Address,
    pub amount: u64,
    pub request_time: DateTime<Utc>,
    pub release_time: DateTime<Utc>,
    pub completed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StakeAction {
    Stake,
    Unstake,
    Release,
    Slash,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakeRecord {
    pub validator: Address,
    pub staker: Address,
    pub amount: u64,
    pub action: StakeAction,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardPayout {
    pub validator: Address,
    pub recipient: Address,
    pub amount: u64,
    pub kind: PayoutKind,
    pub block_height: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatorInfo {
    pub address: Address,
    pub self_stake: u64,
    pub delegated_stake: u64,
    pub total_stake: u64,
    pub delegator_count: usize,
    pub commission: f64,
    pub stake_percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegatorInfo {
    pub delegator: Address,
    pub stake: u64,
    pub stake_percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StakingStats {
    pub total_stake: u64,
    pub validator_count: usize,
    pub active_validator_count: usize,
    pub delegator_count: usize,
    pub reward_pool: u64,
    pub pending_unstakes: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RewardStats {
    pub total_rewards: u64,
    pub validator_rewards: u64,
    pub commission_rewards: u64,
    pub delegator_rewards: u64,
    pub payouts: usize,
}

struct LedgerState {
    validators: BTreeMap<Address, Validator>,
    total_stake: u64,
    reward_pool: u64,
    unstake_queue: Vec<UnstakeRequest>,
    history: Vec<StakeRecord>,
    reward_history: Vec<RewardPayout>,
    validator_share_ppm: u64,
    fee_share_ppm: u64,
}

impl LedgerState {
    /// Amount of a staker's balance not already promised to a pending unstake.
    fn available(&self, validator: &str, staker: &str) -> u64 {
        let Some(v) = self.validators.get(validator) else {
            return 0;
        };
        let pending: u64 = self
            .unstake_queue
            .iter()
            .filter(|r| !r.completed && r.validator == validator && r.staker == staker)
            .map(|r| r.amount)
            .sum();
        v.balance_of(staker).saturating_sub(pending)
    }
}

pub struct StakingLedger {
    state: RwLock<LedgerState>,
    clock: Arc<dyn Clock>,
    min_stake: u64,
    lockup: Duration,
    default_commission_ppm: u64,
    block_reward: u64,
}

impl StakingLedger {
    pub fn new(config: &StakingConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: RwLock::new(LedgerState {
                validators: BTreeMap::new(),
                total_stake: 0,
                reward_pool: 0,
                unstake_queue: Vec::new(),
                history: Vec::new(),
                reward_history: Vec::new(),
                validator_share_ppm: to_ppm(config.validator_share),
                fee_share_ppm: to_ppm(config.transaction_fee_share),
            }),
            clock,
            min_stake: config.min_stake,
            lockup: Duration::seconds(config.unstaking_lockup_secs),
            default_commission_ppm: to_ppm(config.validator_commission),
            block_reward: config.block_reward,
        }
    }

    pub fn min_stake(&self) -> u64 {
        self.min_stake
    }

    pub fn block_reward(&self) -> u64 {
        self.block_reward
    }

    /// Stake `amount` with `validator`. Self-stake when `staker == validator`,
    /// delegation otherwise. False when the amount is zero, a validator's
    /// first self-stake is below the minimum, or a balance would overflow.
    pub fn stake(&self, validator: &str, staker: &str, amount: u64) -> bool {
        if amount < 1 {
            return false;
        }
        let now = self.clock.now();
        let mut state = self.state.write();

        let is_self = validator == staker;
        let first_self_stake = is_self
            && state
                .validators
                .get(validator)
                .map_or(true, |v| !v.bonded);
        if first_self_stake && amount < self.min_stake {
            debug!(
                "Rejected first self-stake of {} by {} (minimum {})",
                amount, validator, self.min_stake
            );
            return false;
        }

        let held = state.validators.get(validator).map_or(0, |v| {
            if is_self {
                v.self_stake
            } else {
                v.delegators.get(staker).copied().unwrap_or(0)
            }
        });
        let (Some(balance), Some(total)) =
            (held.checked_add(amount), state.total_stake.checked_add(amount))
        else {
            warn!(
                "Rejected stake of {} by {} with {}: balance overflow",
                amount, staker, validator
            );
            return false;
        };

        let commission_ppm = self.default_commission_ppm;
        let entry = state
            .validators
            .entry(validator.to_string())
            .or_insert_with(|| Validator::new(validator, commission_ppm));
        if is_self {
            entry.self_stake = balance;
            entry.bonded = true;
        } else {
            entry.delegators.insert(staker.to_string(), balance);
        }

        state.total_stake = total;
        state.history.push(StakeRecord {
            validator: validator.to_string(),
            staker: staker.to_string(),
            amount,
            action: StakeAction::Stake,
            timestamp: now,
        });

        info!("{} staked {} with validator {}", staker, amount, validator);
        true
    }

    /// Queue an unstake. The balance keeps counting as stake until the
    /// request matures. False when the amount exceeds what is still available.
    pub fn unstake(&self, validator: &str, staker: &str, amount: u64) -> bool {
        if amount < 1 {
            return false;
        }
        let now = self.clock.now();
        let mut state = self.state.write();

        let available = state.available(validator, staker);
        if amount > available {
            debug!(
                "Rejected unstake of {} by {} from {} ({} available)",
                amount, staker, validator, available
            );
            return false;
        }

        state.unstake_queue.push(UnstakeRequest {
            id: Uuid::new_v4(),
            validator: validator.to_string(),
            staker: staker.to_string(),
            amount,
            request_time: now,
            release_time: now + self.lockup,
            completed: false,
        });
        state.history.push(StakeRecord {
            validator: validator.to_string(),
            staker: staker.to_string(),
            amount,
            action: StakeAction::Unstake,
            timestamp: now,
        });

        info!(
            "{} requested unstake of {} from {} (release at {})",
            staker,
            amount,
            validator,
            now + self.lockup
        );
        true
    }

    /// Release every matured request. Each request completes exactly once.
    pub fn process_unstaking(&self) -> Vec<UnstakeRequest> {
        let now = self.clock.now();
        let mut guard = self.state.write();
        let state = &mut *guard;

        let mut released = Vec::new();
        for request in state.unstake_queue.iter_mut() {
            if request.completed || now < request.release_time {
                continue;
            }

            // A slash in the meantime may have left less than was requested
            let removed = state
                .validators
                .get_mut(&request.validator)
                .map_or(0, |v| v.withdraw(&request.staker, request.amount));
            if removed < request.amount {
                warn!(
                    "Unstake {} released {} of {} requested (stake reduced since request)",
                    request.id, removed, request.amount
                );
            }

            state.total_stake -= removed;
            request.completed = true;
            state.history.push(StakeRecord {
                validator: request.validator.clone(),
                staker: request.staker.clone(),
                amount: removed,
                action: StakeAction::Release,
                timestamp: now,
            });
            released.push(request.clone());
        }

        if !released.is_empty() {
            info!("Released {} matured unstake request(s)", released.len());
        }
        released
    }

    /// Credit a block reward plus the configured share of its fees.
    /// Returns the amount added to the pool.
    pub fn add_rewards(&self, block_reward: u64, transaction_fees: u64) -> u64 {
        let mut state = self.state.write();
        let added = block_reward.saturating_add(mul_div(transaction_fees, state.fee_share_ppm, PPM));
        state.reward_pool = state.reward_pool.saturating_add(added);
        added
    }

    /// Take back up to `amount` of undistributed rewards, e.g. credits for
    /// blocks a reorg orphaned. Returns what was actually removed.
    pub fn reclaim_rewards(&self, amount: u64) -> u64 {
        let mut state = self.state.write();
        let removed = amount.min(state.reward_pool);
        state.reward_pool -= removed;
        removed
    }

    /// Pay the whole reward pool out to validators, commission and delegators
    /// in one pass. No-op while the pool or the total stake is zero.
    pub fn distribute_rewards(&self, block_height: u64) -> Vec<RewardPayout> {
        let now = self.clock.now();
        let mut guard = self.state.write();
        let state = &mut *guard;

        if state.reward_pool == 0 || state.total_stake == 0 {
            return Vec::new();
        }

        let pool = state.reward_pool;
        let payouts: Vec<RewardPayout> =
            split_pool(pool, state.validators.values(), state.validator_share_ppm)
                .into_iter()
                .map(|line| RewardPayout {
                    validator: line.validator,
                    recipient: line.recipient,
                    amount: line.amount,
                    kind: line.kind,
                    block_height,
                    timestamp: now,
                })
                .collect();

        state.reward_pool = 0;
        state.reward_history.extend(payouts.iter().cloned());

        info!(
            "Distributed reward pool of {} in {} payout(s) at height {}",
            pool,
            payouts.len(),
            block_height
        );
        payouts
    }

    /// Remove `fraction` of the validator's self-stake and of every
    /// delegation with it. Returns the amount removed.
    pub fn apply_slash(&self, validator: &str, fraction: f64) -> u64 {
        let now = self.clock.now();
        let fraction_ppm = to_ppm(fraction);
        let mut state = self.state.write();

        let Some(v) = state.validators.get_mut(validator) else {
            return 0;
        };

        let self_cut = mul_div(v.self_stake, fraction_ppm, PPM);
        v.self_stake -= self_cut;
        let mut removed = self_cut;
        for stake in v.delegators.values_mut() {
            let cut = mul_div(*stake, fraction_ppm, PPM);
            *stake -= cut;
            removed += cut;
        }
        v.delegators.retain(|_, stake| *stake > 0);

        state.total_stake -= removed;
        state.history.push(StakeRecord {
            validator: validator.to_string(),
            staker: validator.to_string(),
            amount: removed,
            action: StakeAction::Slash,
            timestamp: now,
        });

        warn!(
            "Slashed {} units of stake from validator {} ({:.1}%)",
            removed,
            validator,
            fraction * 100.0
        );
        removed
    }

    pub fn set_commission(&self, validator: &str, rate: f64) -> Result<()> {
        if !(0.0..=1.0).contains(&rate) {
            return Err(ConsensusError::policy("commission must be between 0 and 1"));
        }
        let mut state = self.state.write();
        let v = state
            .validators
            .get_mut(validator)
            .ok_or_else(|| ConsensusError::policy(format!("unknown validator: {}", validator)))?;
        v.commission_ppm = to_ppm(rate);
        Ok(())
    }

    pub fn set_reward_distribution(
        &self,
        validator_share: f64,
        delegator_share: f64,
        transaction_fee_share: f64,
    ) -> Result<()> {
        if (validator_share + delegator_share - 1.0).abs() > 1e-9 {
            return Err(ConsensusError::policy(
                "validator and delegator shares must sum to 1",
            ));
        }
        if !(0.0..=1.0).contains(&validator_share) || !(0.0..=1.0).contains(&delegator_share) {
            return Err(ConsensusError::policy("reward shares must be between 0 and 1"));
        }
        if !(0.0..=1.0).contains(&transaction_fee_share) {
            return Err(ConsensusError::policy(
                "transaction fee share must be between 0 and 1",
            ));
        }
        let mut state = self.state.write();
        state.validator_share_ppm = to_ppm(validator_share);
        state.fee_share_ppm = to_ppm(transaction_fee_share);
        Ok(())
    }

    pub fn total_stake(&self) -> u64 {
        self.state.read().total_stake
    }

    pub fn reward_pool(&self) -> u64 {
        self.state.read().reward_pool
    }

    /// Self-stake plus delegations. Zero for unknown validators.
    pub fn validator_stake(&self, validator: &str) -> u64 {
        self.state
            .read()
            .validators
            .get(validator)
            .map_or(0, |v| v.total_stake())
    }

    pub fn staker_stake(&self, validator: &str, staker: &str) -> u64 {
        self.state
            .read()
            .validators
            .get(validator)
            .map_or(0, |v| v.balance_of(staker))
    }

    pub fn available_to_unstake(&self, validator: &str, staker: &str) -> u64 {
        self.state.read().available(validator, staker)
    }

    pub fn validator(&self, validator: &str) -> Option<Validator> {
        self.state.read().validators.get(validator).cloned()
    }

    /// Validators sorted by total stake, largest first (ties by address).
    pub fn validators(&self) -> Vec<ValidatorInfo> {
        let state = self.state.read();
        let mut infos: Vec<ValidatorInfo> = state
            .validators
            .values()
            .map(|v| ValidatorInfo {
                address: v.address.clone(),
                self_stake: v.self_stake,
                delegated_stake: v.delegated_stake(),
                total_stake: v.total_stake(),
                delegator_count: v.delegators.len(),
                commission: v.commission(),
                stake_percentage: percentage(v.total_stake(), state.total_stake),
            })
            .collect();
        infos.sort_by(|a, b| b.total_stake.cmp(&a.total_stake).then(a.address.cmp(&b.address)));
        infos
    }

    pub fn delegators(&self, validator: &str) -> Vec<DelegatorInfo> {
        let state = self.state.read();
        let Some(v) = state.validators.get(validator) else {
            return Vec::new();
        };
        let total = v.total_stake();
        let mut infos: Vec<DelegatorInfo> = v
            .delegators
            .iter()
            .map(|(delegator, stake)| DelegatorInfo {
                delegator: delegator.clone(),
                stake: *stake,
                stake_percentage: percentage(*stake, total),
            })
            .collect();
        infos.sort_by(|a, b| b.stake.cmp(&a.stake).then(a.delegator.cmp(&b.delegator)));
        infos
    }

    pub fn pending_unstakes(&self) -> Vec<UnstakeRequest> {
        self.state
            .read()
            .unstake_queue
            .iter()
            .filter(|r| !r.completed)
            .cloned()
            .collect()
    }

    pub fn staking_stats(&self) -> StakingStats {
        let state = self.state.read();
        StakingStats {
            total_stake: state.total_stake,
            validator_count: state.validators.len(),
            active_validator_count: state
                .validators
                .values()
                .filter(|v| v.total_stake() >= self.min_stake)
                .count(),
            delegator_count: state.validators.values().map(|v| v.delegators.len()).sum(),
            reward_pool: state.reward_pool,
            pending_unstakes: state.unstake_queue.iter().filter(|r| !r.completed).count(),
        }
    }

    pub fn reward_stats(&self) -> RewardStats {
        let state = self.state.read();
        let sum_of = |kind: PayoutKind| {
            state
                .reward_history
                .iter()
                .filter(|p| p.kind == kind)
                .map(|p| p.amount)
                .sum::<u64>()
        };
        RewardStats {
            total_rewards: state.reward_history.iter().map(|p| p.amount).sum(),
            validator_rewards: sum_of(PayoutKind::ValidatorReward),
            commission_rewards: sum_of(PayoutKind::Commission),
            delegator_rewards: sum_of(PayoutKind::DelegatorReward),
            payouts: state.reward_history.len(),
        }
    }

    pub fn history(&self) -> Vec<StakeRecord> {
        self.state.read().history.clone()
    }

    /// History entries from position `offset` onward.
    pub fn history_since(&self, offset: usize) -> Vec<StakeRecord> {
        let state = self.state.read();
        state.history.get(offset..).map(<[_]>::to_vec).unwrap_or_default()
    }

    pub fn reward_history(&self) -> Vec<RewardPayout> {
        self.state.read().reward_history.clone()
    }
}

fn percentage(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}
