// src/staking/rewards.rs
// Integer reward splitting.
//
// All rates are parts-per-million; every division floors and every floor
// residue is handed to a named recipient, so a pass always pays out exactly
// the pool it was given.

use super::Validator;
use crate::chain::Address;
use serde::{Deserialize, Serialize};

pub const PPM: u64 = 1_000_000;

/// Convert a 0..=1 rate into parts-per-million.
pub fn to_ppm(rate: f64) -> u64 {
    (rate.clamp(0.0, 1.0) * PPM as f64).round() as u64
}

pub fn from_ppm(ppm: u64) -> f64 {
    ppm as f64 / PPM as f64
}

/// floor(amount * num / den) without intermediate overflow.
pub fn mul_div(amount: u64, num: u64, den: u64) -> u64 {
    if den == 0 {
        return 0;
    }
    ((amount as u128 * num as u128) / den as u128) as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutKind {
    ValidatorReward,
    Commission,
    DelegatorReward,
}

/// One payout line before it is stamped with height and time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayoutLine {
    pub validator: Address,
    pub recipient: Address,
    pub amount: u64,
    pub kind: PayoutKind,
}

/// Split `pool` across `validators` (address order, as iterated).
///
/// Returns only non-zero lines. The sum of the returned amounts equals
/// `pool` whenever at least one validator carries stake.
pub fn split_pool<'a, I>(pool: u64, validators: I, validator_share_ppm: u64) -> Vec<PayoutLine>
where
    I: IntoIterator<Item = &'a Validator>,
{
    let staked: Vec<&Validator> = validators
        .into_iter()
        .filter(|v| v.total_stake() > 0)
        .collect();
    let total: u64 = staked.iter().map(|v| v.total_stake()).sum();
    if pool == 0 || total == 0 {
        return Vec::new();
    }

    let mut shares: Vec<u64> = staked
        .iter()
        .map(|v| mul_div(pool, v.total_stake(), total))
        .collect();
    let residue = pool - shares.iter().sum::<u64>();
    if let Some(first) = shares.first_mut() {
        *first += residue;
    }

    let mut lines = Vec::new();
    for (validator, share) in staked.iter().zip(shares) {
        split_validator_share(validator, share, validator_share_ppm, &mut lines);
    }
    lines.retain(|l| l.amount > 0);
    lines
}

fn split_validator_share(
    validator: &Validator,
    share: u64,
    validator_share_ppm: u64,
    lines: &mut Vec<PayoutLine>,
) {
    let validator_rewards = mul_div(share, validator_share_ppm, PPM);
    let delegator_rewards = share - validator_rewards;
    let commission = mul_div(validator_rewards, validator.commission_ppm, PPM);
    let mut validator_net = validator_rewards - commission;

    let delegated = validator.delegated_stake();
    if delegated == 0 {
        validator_net += delegator_rewards;
    } else {
        let mut paid = 0;
        for (delegator, stake) in &validator.delegators {
            let amount = mul_div(delegator_rewards, *stake, delegated);
            paid += amount;
            lines.push(PayoutLine {
                validator: validator.address.clone(),
                recipient: delegator.clone(),
                amount,
                kind: PayoutKind::DelegatorReward,
            });
        }
        validator_net += delegator_rewards - paid;
    }

    lines.push(PayoutLine {
        validator: validator.address.clone(),
        recipient: validator.address.clone(),
        amount: validator_net,
        kind: PayoutKind::ValidatorReward,
    });
    lines.push(PayoutLine {
        validator: validator.address.clone(),
        recipient: validator.address.clone(),
        amount: commission,
        kind: PayoutKind::Commission,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn validator(address: &str, self_stake: u64, delegators: &[(&str, u64)]) -> Validator {
        Validator {
            address: address.to_string(),
            self_stake,
            delegators: delegators
                .iter()
                .map(|(a, s)| (a.to_string(), *s))
                .collect::<BTreeMap<_, _>>(),
            commission_ppm: to_ppm(0.1),
            bonded: true,
        }
    }

    #[test]
    fn test_single_validator_one_delegator() {
        let v = validator("val1", 700, &[("del1", 300)]);
        let lines = split_pool(100, [&v], to_ppm(0.7));

        let amount_of = |kind: PayoutKind| {
            lines
                .iter()
                .filter(|l| l.kind == kind)
                .map(|l| l.amount)
                .sum::<u64>()
        };
        assert_eq!(amount_of(PayoutKind::ValidatorReward), 63);
        assert_eq!(amount_of(PayoutKind::Commission), 7);
        assert_eq!(amount_of(PayoutKind::DelegatorReward), 30);
    }

    #[test]
    fn test_pool_is_always_conserved() {
        let validators = vec![
            validator("a", 333, &[("x", 17), ("y", 101)]),
            validator("b", 1, &[]),
            validator("c", 250, &[("z", 7)]),
            validator("d", 0, &[]),
        ];
        for pool in [1u64, 2, 7, 99, 100, 1_001, 123_457] {
            for share in [0.0, 0.3, 0.7, 1.0] {
                let lines = split_pool(pool, &validators, to_ppm(share));
                let total: u64 = lines.iter().map(|l| l.amount).sum();
                assert_eq!(total, pool, "pool={} share={}", pool, share);
                assert!(lines.iter().all(|l| l.validator != "d"));
            }
        }
    }

    #[test]
    fn test_no_stake_pays_nothing() {
        let v = validator("val1", 0, &[]);
        assert!(split_pool(100, [&v], to_ppm(0.7)).is_empty());
    }

    #[test]
    fn test_ppm_conversion() {
        assert_eq!(to_ppm(0.1), 100_000);
        assert_eq!(to_ppm(1.7), PPM);
        assert_eq!(mul_div(u64::MAX, 2, 4), u64::MAX / 2);
    }
}
