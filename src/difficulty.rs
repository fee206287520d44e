// src/difficulty.rs
// Block-time difficulty retargeting.
//
// Pure function of recent block timing: look at the last
// `adjustment_interval` blocks, compare the time they took with the target,
// scale the current difficulty by the inverse ratio, then clamp twice
// (per-period change limit, then absolute [min, max]).

use crate::chain::Block;
use crate::config::DifficultyConfig;
use crate::error::{ConsensusError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DifficultyAdjuster {
    target_block_time: u64,
    adjustment_interval: u64,
    min_difficulty: u64,
    max_difficulty: u64,
    change_limit: f64,
}

/// Outcome of one retarget over a window of blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdjustmentRecord {
    pub window_start: u64,
    pub window_end: u64,
    pub actual_secs: f64,
    pub expected_secs: f64,
    pub time_ratio: f64,
    pub previous_difficulty: u64,
    pub new_difficulty: u64,
    pub change_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DifficultyStats {
    pub average_difficulty: f64,
    pub min_difficulty: u64,
    pub max_difficulty: u64,
    pub average_block_time: f64,
    pub min_block_time: f64,
    pub max_block_time: f64,
    pub difficulty_changes: usize,
}

impl Default for DifficultyAdjuster {
    fn default() -> Self {
        Self::from_config(&DifficultyConfig::default())
    }
}

impl DifficultyAdjuster {
    pub fn from_config(config: &DifficultyConfig) -> Self {
        Self {
            target_block_time: config.target_block_time_secs,
            adjustment_interval: config.adjustment_interval,
            min_difficulty: config.min_difficulty,
            max_difficulty: config.max_difficulty,
            change_limit: config.change_limit,
        }
    }

    pub fn adjustment_interval(&self) -> u64 {
        self.adjustment_interval
    }

    pub fn limits(&self) -> (u64, u64) {
        (self.min_difficulty, self.max_difficulty)
    }

    pub fn change_limit(&self) -> f64 {
        self.change_limit
    }

    /// Window used for the next retarget, or None when too few blocks exist.
    fn window<'a>(&self, blocks: &'a [Block]) -> Option<&'a [Block]> {
        let interval = self.adjustment_interval as usize;
        if interval == 0 || blocks.len() < interval {
            return None;
        }
        Some(&blocks[blocks.len() - interval..])
    }

    fn expected_secs(&self) -> f64 {
        (self.target_block_time * self.adjustment_interval) as f64
    }

    fn span_secs(window: &[Block]) -> f64 {
        match (window.first(), window.last()) {
            (Some(first), Some(last)) => {
                (last.timestamp - first.timestamp).num_milliseconds() as f64 / 1000.0
            }
            _ => 0.0,
        }
    }

    fn bounded(&self, current: u64, actual_secs: f64) -> u64 {
        let current_f = current as f64;
        let max_increase = current_f * (1.0 + self.change_limit);
        let max_decrease = current_f * (1.0 - self.change_limit);

        // A zero or negative span means blocks came in no slower than
        // instantly; treat it as the maximum allowed increase.
        let proposed = if actual_secs <= 0.0 {
            max_increase
        } else {
            current_f / (actual_secs / self.expected_secs())
        };

        let limited = proposed.min(max_increase).max(max_decrease);
        let clamped = limited
            .min(self.max_difficulty as f64)
            .max(self.min_difficulty as f64);
        clamped.round() as u64
    }

    /// New difficulty from the last `adjustment_interval` blocks. Fewer
    /// blocks than that returns `current` unchanged.
    pub fn calculate_new_difficulty(&self, blocks: &[Block], current: u64) -> u64 {
        match self.window(blocks) {
            Some(window) => self.bounded(current, Self::span_secs(window)),
            None => current,
        }
    }

    /// True only when `(index + 1)` lands on an interval boundary.
    pub fn should_adjust_difficulty(&self, block_index: u64) -> bool {
        self.adjustment_interval != 0 && (block_index + 1) % self.adjustment_interval == 0
    }

    /// Detailed view of the retarget `calculate_new_difficulty` would perform.
    pub fn adjustment_info(&self, blocks: &[Block], current: u64) -> Option<AdjustmentRecord> {
        let window = self.window(blocks)?;
        let actual = Self::span_secs(window);
        let expected = self.expected_secs();
        let new_difficulty = self.bounded(current, actual);
        let change_percent = if current == 0 {
            0.0
        } else {
            (new_difficulty as f64 - current as f64) / current as f64 * 100.0
        };

        Some(AdjustmentRecord {
            window_start: window.first().map(|b| b.index).unwrap_or(0),
            window_end: window.last().map(|b| b.index).unwrap_or(0),
            actual_secs: actual,
            expected_secs: expected,
            time_ratio: actual / expected,
            previous_difficulty: current,
            new_difficulty,
            change_percent,
        })
    }

    /// Check that `block` carries the difficulty expected after `previous`.
    ///
    /// `recent` must end with `previous`. Off-boundary heights carry the
    /// difficulty forward exactly; on a boundary the block may deviate from
    /// the recomputed value by at most one.
    pub fn validate_difficulty(&self, block: &Block, previous: &Block, recent: &[Block]) -> bool {
        if self.should_adjust_difficulty(previous.index) {
            let expected = self.calculate_new_difficulty(recent, previous.difficulty);
            block.difficulty.abs_diff(expected) <= 1
        } else {
            block.difficulty == previous.difficulty
        }
    }

    /// Header rule for `block` on top of `previous`. Work-based strategies
    /// retarget on boundaries; every other strategy carries the difficulty
    /// forward unchanged.
    pub fn check_header(
        &self,
        block: &Block,
        previous: &Block,
        recent: &[Block],
        work_based: bool,
    ) -> bool {
        if work_based {
            self.validate_difficulty(block, previous, recent)
        } else {
            block.difficulty == previous.difficulty
        }
    }

    /// Difficulty the block following the last of `blocks` must carry.
    pub fn expected_next(&self, blocks: &[Block], work_based: bool) -> Option<u64> {
        let tip = blocks.last()?;
        if work_based && self.should_adjust_difficulty(tip.index) {
            Some(self.calculate_new_difficulty(blocks, tip.difficulty))
        } else {
            Some(tip.difficulty)
        }
    }

    pub fn statistics(&self, blocks: &[Block]) -> Option<DifficultyStats> {
        if blocks.len() < 2 {
            return None;
        }

        let difficulties: Vec<u64> = blocks.iter().map(|b| b.difficulty).collect();
        let block_times: Vec<f64> = blocks
            .windows(2)
            .map(|w| (w[1].timestamp - w[0].timestamp).num_milliseconds() as f64 / 1000.0)
            .collect();

        Some(DifficultyStats {
            average_difficulty: difficulties.iter().sum::<u64>() as f64 / difficulties.len() as f64,
            min_difficulty: *difficulties.iter().min()?,
            max_difficulty: *difficulties.iter().max()?,
            average_block_time: block_times.iter().sum::<f64>() / block_times.len() as f64,
            min_block_time: block_times.iter().cloned().fold(f64::INFINITY, f64::min),
            max_block_time: block_times.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
            difficulty_changes: blocks
                .windows(2)
                .filter(|w| w[1].difficulty != w[0].difficulty)
                .count(),
        })
    }

    pub fn set_target_block_time(&mut self, secs: u64) -> Result<()> {
        if secs == 0 {
            return Err(ConsensusError::policy("target block time must be positive"));
        }
        self.target_block_time = secs;
        Ok(())
    }

    pub fn set_adjustment_interval(&mut self, interval: u64) -> Result<()> {
        if interval == 0 {
            return Err(ConsensusError::policy("adjustment interval must be positive"));
        }
        self.adjustment_interval = interval;
        Ok(())
    }

    pub fn set_difficulty_limits(&mut self, min: u64, max: u64) -> Result<()> {
        if min < 1 || max < min {
            return Err(ConsensusError::policy(format!(
                "invalid difficulty limits: min={} max={}",
                min, max
            )));
        }
        self.min_difficulty = min;
        self.max_difficulty = max;
        Ok(())
    }

    pub fn set_change_limit(&mut self, limit: f64) -> Result<()> {
        if !(0.0..=1.0).contains(&limit) {
            return Err(ConsensusError::policy(
                "difficulty change limit must be between 0 and 1",
            ));
        }
        self.change_limit = limit;
        Ok(())
    }
}
