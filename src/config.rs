// src/config.rs
// Core configuration: consensus, fork handling, difficulty, slashing, staking.
//
// Loaded from a JSON file (missing sections fall back to defaults), then
// optionally overridden from the environment, then validated before the
// core is built.

use crate::consensus::ConsensusKind;
use crate::error::{ConsensusError, Result};
use crate::fork::ResolutionStrategy;
use crate::slashing::SlashReason;
use anyhow::Context;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::Path;
use std::str::FromStr;

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct CoreConfig {
    pub consensus: ConsensusConfig,
    pub fork: ForkConfig,
    pub difficulty: DifficultyConfig,
    pub slashing: SlashingConfig,
    pub staking: StakingConfig,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Initial strategy tag: pow, pos, dpos or pbft
    pub kind: String,
    pub pow_difficulty: u64,
    /// Maximum number of byzantine validators tolerated by PBFT (f)
    pub pbft_fault_tolerance: usize,
    pub dpos_delegate_count: usize,
    /// Address credited as producer of locally mined PoW blocks
    pub node_address: String,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            kind: "pow".to_string(),
            pow_difficulty: 3,
            pbft_fault_tolerance: 1,
            dpos_delegate_count: 21,
            node_address: "node".to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct ForkConfig {
    pub fork_threshold: u64,
    pub resolution_strategy: String,
    pub fork_max_age_secs: i64,
}

impl Default for ForkConfig {
    fn default() -> Self {
        Self {
            fork_threshold: 2,
            resolution_strategy: "longest_chain".to_string(),
            fork_max_age_secs: 3600,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct DifficultyConfig {
    pub target_block_time_secs: u64,
    pub adjustment_interval: u64,
    pub min_difficulty: u64,
    pub max_difficulty: u64,
    /// Maximum fractional change per adjustment (0.2 = 20%)
    pub change_limit: f64,
}

impl Default for DifficultyConfig {
    fn default() -> Self {
        Self {
            target_block_time_secs: 60,
            adjustment_interval: 10,
            min_difficulty: 1,
            max_difficulty: 20,
            change_limit: 0.2,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct SlashingConfig {
    /// Consecutive offline reports before a validator is slashable
    pub offline_threshold: u64,
    pub cooldown_secs: i64,
    /// Slash automatically when block processing surfaces a condition
    pub auto_slash: bool,
    pub slash_amounts: BTreeMap<SlashReason, f64>,
}

impl Default for SlashingConfig {
    fn default() -> Self {
        Self {
            offline_threshold: 3,
            cooldown_secs: 86_400,
            auto_slash: true,
            slash_amounts: SlashReason::default_amounts(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct StakingConfig {
    /// Minimum first self-stake for a validator
    pub min_stake: u64,
    pub unstaking_lockup_secs: i64,
    /// Default commission for newly created validators
    pub validator_commission: f64,
    pub validator_share: f64,
    pub delegator_share: f64,
    pub transaction_fee_share: f64,
    pub block_reward: u64,
}

impl Default for StakingConfig {
    fn default() -> Self {
        Self {
            min_stake: 100,
            unstaking_lockup_secs: 604_800,
            validator_commission: 0.1,
            validator_share: 0.7,
            delegator_share: 0.3,
            transaction_fee_share: 0.5,
            block_reward: 50,
        }
    }
}

/// Validation result for configuration checks
#[derive(Debug)]
pub struct ConfigValidation {
    pub valid: bool,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl ConfigValidation {
    fn new() -> Self {
        Self {
            valid: true,
            warnings: Vec::new(),
            errors: Vec::new(),
        }
    }

    fn add_warning(&mut self, msg: String) {
        self.warnings.push(msg);
    }

    fn add_error(&mut self, msg: String) {
        self.errors.push(msg);
        self.valid = false;
    }

    pub fn print_summary(&self) {
        if !self.warnings.is_empty() {
            warn!("Configuration warnings:");
            for w in &self.warnings {
                warn!(" - {}", w);
            }
        }

        if !self.errors.is_empty() {
            error!("Configuration errors:");
            for e in &self.errors {
                error!(" - {}", e);
            }
        }

        if self.valid && self.warnings.is_empty() {
            info!("Configuration validation passed");
        }
    }
}

fn in_unit_range(v: f64) -> bool {
    (0.0..=1.0).contains(&v)
}

impl CoreConfig {
    /// Read a JSON config file. Absent sections take their defaults.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: CoreConfig = serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        info!("Loaded core configuration from {}", path.display());
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    /// Apply `OURO_*` environment overrides. Unparseable numbers are ignored
    /// with a warning.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(kind) = env::var("OURO_CONSENSUS_KIND") {
            self.consensus.kind = kind.trim().to_lowercase();
        }
        if let Ok(strategy) = env::var("OURO_RESOLUTION_STRATEGY") {
            self.fork.resolution_strategy = strategy.trim().to_lowercase();
        }
        if let Ok(v) = env::var("OURO_FORK_THRESHOLD") {
            match v.trim().parse() {
                Ok(n) => self.fork.fork_threshold = n,
                Err(_) => warn!("Ignoring OURO_FORK_THRESHOLD='{}' (not an integer)", v),
            }
        }
        if let Ok(v) = env::var("OURO_SLASH_COOLDOWN_SECS") {
            match v.trim().parse() {
                Ok(n) => self.slashing.cooldown_secs = n,
                Err(_) => warn!("Ignoring OURO_SLASH_COOLDOWN_SECS='{}' (not an integer)", v),
            }
        }
    }

    /// Check every section and collect warnings and errors.
    pub fn validate(&self) -> ConfigValidation {
        let mut validation = ConfigValidation::new();

        if let Err(e) = ConsensusKind::from_str(&self.consensus.kind) {
            validation.add_error(e.to_string());
        }
        if self.consensus.pow_difficulty == 0 {
            validation.add_error("consensus.pow_difficulty must be at least 1".into());
        } else if self.consensus.pow_difficulty > 8 {
            validation.add_warning(format!(
                "consensus.pow_difficulty is {} - mining will be very slow",
                self.consensus.pow_difficulty
            ));
        }
        if self.consensus.dpos_delegate_count == 0 {
            validation.add_error("consensus.dpos_delegate_count must be at least 1".into());
        }

        if let Err(e) = ResolutionStrategy::from_str(&self.fork.resolution_strategy) {
            validation.add_error(e.to_string());
        }
        if self.fork.fork_threshold < 1 {
            validation.add_error("fork.fork_threshold must be at least 1".into());
        }
        if self.fork.fork_max_age_secs <= 0 {
            validation.add_warning("fork.fork_max_age_secs <= 0 - fork log is never retained".into());
        }

        let d = &self.difficulty;
        if d.target_block_time_secs == 0 {
            validation.add_error("difficulty.target_block_time_secs must be positive".into());
        }
        if d.adjustment_interval == 0 {
            validation.add_error("difficulty.adjustment_interval must be positive".into());
        }
        if d.min_difficulty < 1 || d.max_difficulty < d.min_difficulty {
            validation.add_error(format!(
                "invalid difficulty limits: min={} max={}",
                d.min_difficulty, d.max_difficulty
            ));
        }
        if !in_unit_range(d.change_limit) {
            validation.add_error("difficulty.change_limit must be between 0 and 1".into());
        }

        let s = &self.slashing;
        if s.offline_threshold < 1 {
            validation.add_error("slashing.offline_threshold must be at least 1".into());
        }
        if s.cooldown_secs < 0 {
            validation.add_error("slashing.cooldown_secs must be non-negative".into());
        }
        for (reason, amount) in &s.slash_amounts {
            if !in_unit_range(*amount) {
                validation.add_error(format!("slash amount for {} must be between 0 and 1", reason));
            }
        }

        let st = &self.staking;
        if (st.validator_share + st.delegator_share - 1.0).abs() > 1e-9 {
            validation.add_error("staking.validator_share + delegator_share must equal 1".into());
        }
        for (name, v) in [
            ("validator_share", st.validator_share),
            ("delegator_share", st.delegator_share),
            ("validator_commission", st.validator_commission),
            ("transaction_fee_share", st.transaction_fee_share),
        ] {
            if !in_unit_range(v) {
                validation.add_error(format!("staking.{} must be between 0 and 1", name));
            }
        }
        if st.unstaking_lockup_secs < 0 {
            validation.add_error("staking.unstaking_lockup_secs must be non-negative".into());
        }
        if st.min_stake == 0 {
            validation.add_warning("staking.min_stake is 0 - anyone can become a validator".into());
        }

        validation
    }

    /// Unknown enum values become `Configuration`, everything else
    /// `PolicyViolation`.
    pub fn ensure_valid(&self) -> Result<()> {
        ConsensusKind::from_str(&self.consensus.kind)?;
        ResolutionStrategy::from_str(&self.fork.resolution_strategy)?;

        let validation = self.validate();
        validation.print_summary();
        if validation.valid {
            Ok(())
        } else {
            Err(ConsensusError::policy(validation.errors.join("; ")))
        }
    }
}
