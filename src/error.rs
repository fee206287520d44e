// src/error.rs
// Error taxonomy for the chain-integrity core.
//
// Validation failures (bad linkage, bad hash, bad signature) and
// insufficient-resource outcomes (stake too low) are NOT errors here: they
// are expected under normal network contention and come back as `false`.
// Everything in this enum signals caller misuse or a policy breach.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ConsensusError>;

#[derive(Error, Debug)]
pub enum ConsensusError {
    /// Unknown consensus tag, resolution strategy, slash reason, or a
    /// strategy constructed without the authority it needs.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Invalid threshold, limit or share value.
    #[error("policy violation: {0}")]
    PolicyViolation(String),

    /// Slash attempted while the validator is still cooling down.
    #[error("slashing cooldown active for {validator}: {remaining_secs}s remaining")]
    SlashCooldown {
        validator: String,
        remaining_secs: i64,
    },

    #[error("no eligible block producer: {0}")]
    NoEligibleProducer(String),

    #[error("block rejected: {0}")]
    InvalidBlock(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConsensusError {
    pub fn config(msg: impl Into<String>) -> Self {
        ConsensusError::Configuration(msg.into())
    }

    pub fn policy(msg: impl Into<String>) -> Self {
        ConsensusError::PolicyViolation(msg.into())
    }

    /// True for the errors that signal a policy breach rather than a setup mistake.
    pub fn is_policy_violation(&self) -> bool {
        matches!(
            self,
            ConsensusError::PolicyViolation(_) | ConsensusError::SlashCooldown { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cooldown_is_policy_violation() {
        let err = ConsensusError::SlashCooldown {
            validator: "val1".into(),
            remaining_secs: 30,
        };
        assert!(err.is_policy_violation());
        assert!(err.to_string().contains("val1"));
        assert!(!ConsensusError::config("bad tag").is_policy_violation());
    }
}
