// src/slashing.rs
// Validator behavior ledger and penalty issuer.
//
// Tracks per-validator counters (offline, invalid blocks, valid blocks),
// reports which slashing conditions currently hold, and issues slash events.
// A slash starts a cooldown; during the cooldown the validator is neither
// evaluated nor slashable, and is not eligible to produce blocks.
//
// The cooldown check and the event append happen under one lock so two
// concurrent callers can never both slash the same validator.

use crate::chain::Address;
use crate::clock::Clock;
use crate::config::SlashingConfig;
use crate::error::{ConsensusError, Result};
use chrono::{DateTime, Duration, Utc};
use log::{debug, error, info};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

/// Slashing reasons
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlashReason {
    /// Signed two different blocks at the same height
    DoubleSigning,

    /// Missed too many consecutive slots
    ValidatorOffline,

    /// Produced a block that failed validation
    InvalidBlock,

    ProposalManipulation,
    VoteManipulation,
    ProtocolViolation,
}

impl SlashReason {
    pub const ALL: [SlashReason; 6] = [
        SlashReason::DoubleSigning,
        SlashReason::ValidatorOffline,
        SlashReason::InvalidBlock,
        SlashReason::ProposalManipulation,
        SlashReason::VoteManipulation,
        SlashReason::ProtocolViolation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SlashReason::DoubleSigning => "double_signing",
            SlashReason::ValidatorOffline => "validator_offline",
            SlashReason::InvalidBlock => "invalid_block",
            SlashReason::ProposalManipulation => "proposal_manipulation",
            SlashReason::VoteManipulation => "vote_manipulation",
            SlashReason::ProtocolViolation => "protocol_violation",
        }
    }

    /// Default fraction of stake removed for this reason.
    pub fn default_amount(&self) -> f64 {
        match self {
            SlashReason::DoubleSigning => 0.5,
            SlashReason::ValidatorOffline => 0.05,
            SlashReason::InvalidBlock => 0.25,
            SlashReason::ProposalManipulation => 0.3,
            SlashReason::VoteManipulation => 0.2,
            SlashReason::ProtocolViolation => 0.4,
        }
    }

    pub fn default_amounts() -> BTreeMap<SlashReason, f64> {
        Self::ALL.iter().map(|r| (*r, r.default_amount())).collect()
    }
}

impl fmt::Display for SlashReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SlashReason {
    type Err = ConsensusError;

    fn from_str(s: &str) -> Result<Self> {
        SlashReason::ALL
            .iter()
            .find(|r| r.as_str() == s)
            .copied()
            .ok_or_else(|| ConsensusError::config(format!("unknown slashing reason: {}", s)))
    }
}

/// Observed validator behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Behavior {
    Online,
    Offline,
    ValidBlock,
    InvalidBlock,
}

impl Behavior {
    pub fn as_str(&self) -> &'static str {
        match self {
            Behavior::Online => "online",
            Behavior::Offline => "offline",
            Behavior::ValidBlock => "valid_block",
            Behavior::InvalidBlock => "invalid_block",
        }
    }
}

impl fmt::Display for Behavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Behavior {
    type Err = ConsensusError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "online" => Ok(Behavior::Online),
            "offline" => Ok(Behavior::Offline),
            "valid_block" => Ok(Behavior::ValidBlock),
            "invalid_block" => Ok(Behavior::InvalidBlock),
            other => Err(ConsensusError::config(format!("unknown validator behavior: {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehaviorEntry {
    pub timestamp: DateTime<Utc>,
    pub block_height: Option<u64>,
    pub behavior: Behavior,
}

/// Per-validator behavior counters and log
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BehaviorRecord {
    /// Consecutive offline reports since the last valid block
    pub offline_count: u64,
    pub invalid_blocks: u64,
    pub valid_blocks: u64,
    pub last_slash_time: Option<DateTime<Utc>>,
    pub behavior_log: Vec<BehaviorEntry>,
}

/// Slashing event record. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlashEvent {
    pub id: Uuid,
    pub validator: Address,
    pub reason: SlashReason,
    /// Fraction of stake removed (0..=1)
    pub amount: f64,
    pub block_height: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatorSlashHistory {
    pub validator: Address,
    pub events: Vec<SlashEvent>,
    pub total_slash_amount: f64,
    pub last_slash_time: Option<DateTime<Utc>>,
    pub offline_count: u64,
    pub invalid_blocks: u64,
    pub valid_blocks: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SlashStats {
    pub total_events: usize,
    pub total_slash_amount: f64,
    pub validators_slashed: usize,
    pub events_per_reason: BTreeMap<SlashReason, usize>,
}

struct TrackerState {
    records: HashMap<Address, BehaviorRecord>,
    events: Vec<SlashEvent>,
    slash_amounts: BTreeMap<SlashReason, f64>,
    offline_threshold: u64,
    cooldown: Duration,
}

impl TrackerState {
    /// Time left in the validator's cooldown, if any.
    fn cooldown_remaining(&self, validator: &str, now: DateTime<Utc>) -> Option<Duration> {
        let last = self.records.get(validator)?.last_slash_time?;
        let remaining = last + self.cooldown - now;
        (remaining > Duration::zero()).then_some(remaining)
    }
}

pub struct SlashingTracker {
    state: Mutex<TrackerState>,
    clock: Arc<dyn Clock>,
}

impl SlashingTracker {
    pub fn new(config: &SlashingConfig, clock: Arc<dyn Clock>) -> Self {
        let mut slash_amounts = SlashReason::default_amounts();
        slash_amounts.extend(config.slash_amounts.iter().map(|(r, a)| (*r, *a)));

        Self {
            state: Mutex::new(TrackerState {
                records: HashMap::new(),
                events: Vec::new(),
                slash_amounts,
                offline_threshold: config.offline_threshold,
                cooldown: Duration::seconds(config.cooldown_secs),
            }),
            clock,
        }
    }

    pub fn record_validator_behavior(
        &self,
        validator: &str,
        behavior: Behavior,
        block_height: Option<u64>,
    ) {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let record = state.records.entry(validator.to_string()).or_default();

        record.behavior_log.push(BehaviorEntry {
            timestamp: now,
            block_height,
            behavior,
        });

        match behavior {
            Behavior::Offline => record.offline_count += 1,
            Behavior::InvalidBlock => record.invalid_blocks += 1,
            Behavior::ValidBlock => {
                record.valid_blocks += 1;
                record.offline_count = 0;
            }
            Behavior::Online => {}
        }

        debug!(
            "Validator {} behavior {} at height {:?}",
            validator, behavior, block_height
        );
    }

    /// Reasons the validator should currently be slashed for. Empty while
    /// the validator is cooling down from a previous slash.
    pub fn check_slashing_conditions(&self, validator: &str) -> Vec<SlashReason> {
        let now = self.clock.now();
        let state = self.state.lock();

        let Some(record) = state.records.get(validator) else {
            return Vec::new();
        };
        if state.cooldown_remaining(validator, now).is_some() {
            return Vec::new();
        }

        let mut reasons = Vec::new();
        if record.offline_count >= state.offline_threshold {
            reasons.push(SlashReason::ValidatorOffline);
        }
        if record.invalid_blocks > 0 {
            reasons.push(SlashReason::InvalidBlock);
        }
        reasons
    }

    /// Issue a slash. `amount` defaults to the per-reason table and is
    /// clamped to [0, 1]. Fails with `SlashCooldown` inside the cooldown
    /// window, in which case nothing is recorded.
    pub fn slash_validator(
        &self,
        validator: &str,
        reason: SlashReason,
        amount: Option<f64>,
        block_height: Option<u64>,
    ) -> Result<SlashEvent> {
        let now = self.clock.now();
        let mut state = self.state.lock();

        if let Some(remaining) = state.cooldown_remaining(validator, now) {
            return Err(ConsensusError::SlashCooldown {
                validator: validator.to_string(),
                remaining_secs: remaining.num_seconds(),
            });
        }

        let amount = amount
            .or_else(|| state.slash_amounts.get(&reason).copied())
            .unwrap_or_else(|| reason.default_amount());
        let amount = if amount.is_nan() { 0.0 } else { amount.clamp(0.0, 1.0) };

        let event = SlashEvent {
            id: Uuid::new_v4(),
            validator: validator.to_string(),
            reason,
            amount,
            block_height,
            timestamp: now,
        };

        state.events.push(event.clone());
        state
            .records
            .entry(validator.to_string())
            .or_default()
            .last_slash_time = Some(now);

        error!(
            "SLASHING VALIDATOR: {} for {} ({:.1}% of stake) at height {:?}",
            validator,
            reason,
            amount * 100.0,
            block_height
        );

        Ok(event)
    }

    /// False while the validator is inside the cooldown since its last slash.
    pub fn is_validator_eligible(&self, validator: &str) -> bool {
        let now = self.clock.now();
        self.state.lock().cooldown_remaining(validator, now).is_none()
    }

    /// Slash events, optionally filtered by validator and an inclusive time range.
    pub fn slashing_events(
        &self,
        validator: Option<&str>,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Vec<SlashEvent> {
        self.state
            .lock()
            .events
            .iter()
            .filter(|e| validator.map_or(true, |v| e.validator == v))
            .filter(|e| from.map_or(true, |f| e.timestamp >= f))
            .filter(|e| to.map_or(true, |t| e.timestamp <= t))
            .cloned()
            .collect()
    }

    pub fn validator_history(&self, validator: &str) -> ValidatorSlashHistory {
        let events = self.slashing_events(Some(validator), None, None);
        let state = self.state.lock();
        let record = state.records.get(validator).cloned().unwrap_or_default();

        ValidatorSlashHistory {
            validator: validator.to_string(),
            total_slash_amount: events.iter().map(|e| e.amount).sum(),
            events,
            last_slash_time: record.last_slash_time,
            offline_count: record.offline_count,
            invalid_blocks: record.invalid_blocks,
            valid_blocks: record.valid_blocks,
        }
    }

    pub fn behavior_record(&self, validator: &str) -> Option<BehaviorRecord> {
        self.state.lock().records.get(validator).cloned()
    }

    pub fn statistics(&self) -> SlashStats {
        let state = self.state.lock();
        if state.events.is_empty() {
            return SlashStats::default();
        }

        let validators: HashSet<&str> = state.events.iter().map(|e| e.validator.as_str()).collect();
        let events_per_reason = SlashReason::ALL
            .iter()
            .map(|r| (*r, state.events.iter().filter(|e| e.reason == *r).count()))
            .collect();

        SlashStats {
            total_events: state.events.len(),
            total_slash_amount: state.events.iter().map(|e| e.amount).sum(),
            validators_slashed: validators.len(),
            events_per_reason,
        }
    }

    pub fn slash_amount(&self, reason: SlashReason) -> f64 {
        self.state
            .lock()
            .slash_amounts
            .get(&reason)
            .copied()
            .unwrap_or_else(|| reason.default_amount())
    }

    pub fn set_slash_amount(&self, reason: SlashReason, amount: f64) -> Result<()> {
        if !(0.0..=1.0).contains(&amount) {
            return Err(ConsensusError::policy("slash amount must be between 0 and 1"));
        }
        self.state.lock().slash_amounts.insert(reason, amount);
        info!("Slash amount for {} set to {}", reason, amount);
        Ok(())
    }

    pub fn set_offline_threshold(&self, threshold: u64) -> Result<()> {
        if threshold < 1 {
            return Err(ConsensusError::policy("offline threshold must be at least 1"));
        }
        self.state.lock().offline_threshold = threshold;
        Ok(())
    }

    pub fn set_slash_cooldown(&self, secs: i64) -> Result<()> {
        if secs < 0 {
            return Err(ConsensusError::policy("slash cooldown must be non-negative"));
        }
        self.state.lock().cooldown = Duration::seconds(secs);
        Ok(())
    }

    /// Reset counters and log. The last slash time (and so the cooldown) is kept.
    pub fn clear_behavior_history(&self, validator: &str) {
        if let Some(record) = self.state.lock().records.get_mut(validator) {
            record.behavior_log.clear();
            record.offline_count = 0;
            record.invalid_blocks = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn tracker() -> (SlashingTracker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::at_unix(1_700_000_000));
        let tracker = SlashingTracker::new(&SlashingConfig::default(), clock.clone());
        (tracker, clock)
    }

    #[test]
    fn test_offline_counter_resets_on_valid_block() {
        let (tracker, _) = tracker();
        for h in 0..3 {
            tracker.record_validator_behavior("val1", Behavior::Offline, Some(h));
        }
        assert_eq!(
            tracker.check_slashing_conditions("val1"),
            vec![SlashReason::ValidatorOffline]
        );

        tracker.record_validator_behavior("val1", Behavior::ValidBlock, Some(3));
        assert!(tracker.check_slashing_conditions("val1").is_empty());

        let record = tracker.behavior_record("val1").unwrap();
        assert_eq!(record.offline_count, 0);
        assert_eq!(record.valid_blocks, 1);
        assert_eq!(record.behavior_log.len(), 4);
    }

    #[test]
    fn test_invalid_block_condition() {
        let (tracker, _) = tracker();
        tracker.record_validator_behavior("val1", Behavior::InvalidBlock, Some(7));
        assert_eq!(
            tracker.check_slashing_conditions("val1"),
            vec![SlashReason::InvalidBlock]
        );
        assert!(tracker.check_slashing_conditions("unknown").is_empty());
    }

    #[test]
    fn test_second_slash_inside_cooldown_is_rejected() {
        let (tracker, clock) = tracker();
        let event = tracker
            .slash_validator("val1", SlashReason::DoubleSigning, None, Some(10))
            .unwrap();
        assert_eq!(event.amount, 0.5);
        assert!(!tracker.is_validator_eligible("val1"));

        clock.advance_secs(3600);
        let err = tracker
            .slash_validator("val1", SlashReason::InvalidBlock, None, Some(11))
            .unwrap_err();
        match err {
            ConsensusError::SlashCooldown { validator, remaining_secs } => {
                assert_eq!(validator, "val1");
                assert_eq!(remaining_secs, 86_400 - 3600);
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(tracker.slashing_events(Some("val1"), None, None).len(), 1);

        clock.advance_secs(86_400);
        assert!(tracker.is_validator_eligible("val1"));
        assert!(tracker
            .slash_validator("val1", SlashReason::InvalidBlock, None, Some(12))
            .is_ok());
    }

    #[test]
    fn test_cooldown_gates_condition_checks() {
        let (tracker, clock) = tracker();
        tracker.record_validator_behavior("val1", Behavior::InvalidBlock, Some(1));
        tracker
            .slash_validator("val1", SlashReason::InvalidBlock, None, Some(1))
            .unwrap();
        assert!(tracker.check_slashing_conditions("val1").is_empty());

        clock.advance_secs(86_401);
        assert_eq!(
            tracker.check_slashing_conditions("val1"),
            vec![SlashReason::InvalidBlock]
        );
    }

    #[test]
    fn test_amount_is_clamped() {
        let (tracker, _) = tracker();
        let high = tracker
            .slash_validator("val1", SlashReason::ProtocolViolation, Some(3.0), None)
            .unwrap();
        assert_eq!(high.amount, 1.0);
        let low = tracker
            .slash_validator("val2", SlashReason::ProtocolViolation, Some(-1.0), None)
            .unwrap();
        assert_eq!(low.amount, 0.0);
    }

    #[test]
    fn test_unknown_reason_and_behavior_are_configuration_errors() {
        assert!(matches!(
            "bribery".parse::<SlashReason>(),
            Err(ConsensusError::Configuration(_))
        ));
        assert!(matches!(
            "sleeping".parse::<Behavior>(),
            Err(ConsensusError::Configuration(_))
        ));
        assert_eq!(
            "vote_manipulation".parse::<SlashReason>().unwrap(),
            SlashReason::VoteManipulation
        );
    }

    #[test]
    fn test_setters_and_statistics() {
        let (tracker, clock) = tracker();
        assert!(tracker.set_slash_amount(SlashReason::InvalidBlock, 1.5).is_err());
        assert!(tracker.set_offline_threshold(0).is_err());
        assert!(tracker.set_slash_cooldown(-1).is_err());

        tracker.set_slash_amount(SlashReason::InvalidBlock, 0.1).unwrap();
        tracker.set_slash_cooldown(0).unwrap();

        let start = clock.now();
        tracker.slash_validator("val1", SlashReason::InvalidBlock, None, None).unwrap();
        clock.advance_secs(5);
        tracker.slash_validator("val1", SlashReason::InvalidBlock, None, None).unwrap();
        tracker.slash_validator("val2", SlashReason::DoubleSigning, None, None).unwrap();

        let stats = tracker.statistics();
        assert_eq!(stats.total_events, 3);
        assert_eq!(stats.validators_slashed, 2);
        assert_eq!(stats.events_per_reason[&SlashReason::InvalidBlock], 2);
        assert_eq!(stats.events_per_reason[&SlashReason::VoteManipulation], 0);

        let history = tracker.validator_history("val1");
        assert_eq!(history.events.len(), 2);
        assert!((history.total_slash_amount - 0.2).abs() < 1e-9);

        assert_eq!(tracker.slashing_events(None, Some(start), Some(start)).len(), 1);
    }

    #[test]
    fn test_clear_behavior_history_keeps_cooldown() {
        let (tracker, _) = tracker();
        tracker.record_validator_behavior("val1", Behavior::Offline, None);
        tracker.slash_validator("val1", SlashReason::ValidatorOffline, None, None).unwrap();
        tracker.clear_behavior_history("val1");

        let record = tracker.behavior_record("val1").unwrap();
        assert!(record.behavior_log.is_empty());
        assert_eq!(record.offline_count, 0);
        assert!(!tracker.is_validator_eligible("val1"));
    }
}
