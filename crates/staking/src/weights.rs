// Copyright 2025 RISC Zero, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Voting power, stream share and early-withdrawal penalty formulas.
//!
//! All math is truncating integer math over [U256].

use alloy_primitives::U256;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ErrorKind;

/// Divisor applied to `lock_share_coef * voting_power` in the stream share formula.
pub const LOCK_SHARE_DENOMINATOR: u64 = 1000;

/// Divisor applied together with `tau` in the penalty formula.
pub const PENALTY_DENOMINATOR: u64 = 100_000;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WeightError {
    #[error("Invalid weight bounds: {0}")]
    InvalidWeightBounds(&'static str),

    #[error("Arithmetic overflow computing lock weights")]
    Overflow,
}

impl WeightError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WeightError::InvalidWeightBounds(_) => ErrorKind::Validation,
            WeightError::Overflow => ErrorKind::Internal,
        }
    }
}

/// Share and penalty bounds of one staking instance. Immutable after creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeightParameters {
    pub max_weight_shares: u64,
    pub min_weight_shares: u64,
    pub max_weight_penalty: u64,
    pub min_weight_penalty: u64,
    pub penalty_weight_multiplier: u64,
}

/// Time and lock-count properties of one staking instance. Immutable after creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakingProperties {
    pub tau: u64,
    pub lock_share_coef: u64,
    /// Lock duration, in seconds, that earns voting power equal to the locked amount.
    pub lock_period_coef: u64,
    pub max_locks: u32,
}

/// Check the bounds of a parameter set before an instance is created with it.
pub fn validate(weights: &WeightParameters, props: &StakingProperties) -> Result<(), WeightError> {
    if weights.max_weight_shares < weights.min_weight_shares {
        return Err(WeightError::InvalidWeightBounds("max_weight_shares < min_weight_shares"));
    }
    if weights.max_weight_shares == 0 {
        return Err(WeightError::InvalidWeightBounds("max_weight_shares is zero"));
    }
    if weights.max_weight_penalty < weights.min_weight_penalty {
        return Err(WeightError::InvalidWeightBounds("max_weight_penalty < min_weight_penalty"));
    }
    if props.tau == 0 {
        return Err(WeightError::InvalidWeightBounds("tau is zero"));
    }
    if props.lock_period_coef == 0 {
        return Err(WeightError::InvalidWeightBounds("lock_period_coef is zero"));
    }
    if props.max_locks == 0 {
        return Err(WeightError::InvalidWeightBounds("max_locks is zero"));
    }
    let worst =
        U256::from(weights.max_weight_penalty) * U256::from(weights.penalty_weight_multiplier);
    if worst > U256::from(props.tau) * U256::from(PENALTY_DENOMINATOR) {
        return Err(WeightError::InvalidWeightBounds("maximum penalty exceeds the principal"));
    }
    Ok(())
}

/// Weights derived for a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockWeights {
    pub voting_power: U256,
    pub weight_factor: U256,
    pub stream_shares: U256,
}

/// Derive voting power and stream shares for `amount` locked for `duration` seconds.
pub fn lock_weights(
    weights: &WeightParameters,
    props: &StakingProperties,
    amount: U256,
    duration: u64,
) -> Result<LockWeights, WeightError> {
    if amount.is_zero() {
        return Ok(LockWeights {
            voting_power: U256::ZERO,
            weight_factor: U256::from(weights.min_weight_shares),
            stream_shares: U256::ZERO,
        });
    }
    let voting_power = amount
        .checked_mul(U256::from(duration))
        .ok_or(WeightError::Overflow)?
        / U256::from(props.lock_period_coef);
    let voting_power = voting_power.min(amount);

    let min = U256::from(weights.min_weight_shares);
    let spread = U256::from(weights.max_weight_shares.saturating_sub(weights.min_weight_shares));
    let weight_factor =
        min + spread.checked_mul(voting_power).ok_or(WeightError::Overflow)? / amount;

    let bonus = U256::from(props.lock_share_coef)
        .checked_mul(voting_power)
        .ok_or(WeightError::Overflow)?
        / U256::from(LOCK_SHARE_DENOMINATOR);
    let stream_shares = amount
        .checked_add(bonus)
        .and_then(|base| base.checked_mul(weight_factor))
        .ok_or(WeightError::Overflow)?;

    Ok(LockWeights { voting_power, weight_factor, stream_shares })
}

/// Penalty weight for withdrawing with `remaining` of `lock_duration` seconds left.
pub fn penalty_weight(weights: &WeightParameters, remaining: u64, lock_duration: u64) -> U256 {
    if remaining == 0 || lock_duration == 0 {
        return U256::ZERO;
    }
    let remaining = remaining.min(lock_duration);
    let spread = U256::from(weights.max_weight_penalty.saturating_sub(weights.min_weight_penalty));
    U256::from(weights.min_weight_penalty)
        + spread * U256::from(remaining) / U256::from(lock_duration)
}

/// Penalty charged on `principal` when withdrawing at `now`, never more than the principal.
pub fn early_withdrawal_penalty(
    weights: &WeightParameters,
    props: &StakingProperties,
    principal: U256,
    lock_start: u64,
    unlock_time: u64,
    now: u64,
) -> Result<U256, WeightError> {
    if now >= unlock_time {
        return Ok(U256::ZERO);
    }
    let w = penalty_weight(weights, unlock_time - now, unlock_time.saturating_sub(lock_start));
    let penalty = principal
        .checked_mul(w)
        .and_then(|p| p.checked_mul(U256::from(weights.penalty_weight_multiplier)))
        .ok_or(WeightError::Overflow)?
        / (U256::from(props.tau) * U256::from(PENALTY_DENOMINATOR));
    Ok(penalty.min(principal))
}
