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

//! Reward-per-share accounting for reward streams.
//!
//! Each stream accumulates `reward_per_share`, the reward owed to one stream share since the
//! stream was created, scaled by [REWARD_PRECISION]. A lock's entitlement is its shares times
//! the growth of the accumulator since the lock last settled. Streams are advanced to the
//! current time before every change to the total share count, which checkpoints the total.

use alloy_primitives::{Address, U256};
use serde::{Deserialize, Serialize};

use super::StakingError;
use crate::{schedule::RewardSchedule, StreamId};

/// Scale of [StreamState::reward_per_share].
pub const REWARD_PRECISION: U256 = U256::from_limbs([1_000_000_000_000_000_000, 0, 0, 0]);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamState {
    pub stream_id: StreamId,
    pub reward_token: Address,
    pub reward_per_share: U256,
    pub last_update: u64,
    /// Tokens the vault holds for this stream: budget plus socialized penalties, minus claims.
    pub reserve: U256,
    /// Emission nobody was entitled to, either because no shares existed or due to rounding.
    pub undistributed: U256,
    pub claimed: U256,
    pub created_at: u64,
}

impl StreamState {
    pub(crate) fn new(
        stream_id: StreamId,
        reward_token: Address,
        schedule: &RewardSchedule,
        now: u64,
    ) -> Self {
        Self {
            stream_id,
            reward_token,
            reward_per_share: U256::ZERO,
            last_update: now,
            reserve: schedule.total_budget(),
            // Whatever the schedule emitted before the stream existed belongs to nobody.
            undistributed: schedule.emitted_by(now),
            claimed: U256::ZERO,
            created_at: now,
        }
    }

    /// Distribute the emission since the last update over `total_shares`.
    pub(crate) fn advance(
        &mut self,
        schedule: &RewardSchedule,
        total_shares: U256,
        now: u64,
    ) -> Result<U256, StakingError> {
        if now <= self.last_update {
            return Ok(U256::ZERO);
        }
        let emitted = schedule.emission(self.last_update, now)?;
        self.last_update = now;
        self.distribute(emitted, total_shares)?;
        Ok(emitted)
    }

    /// Credit `amount` to every share pro-rata. Rounding dust goes to `undistributed`.
    pub(crate) fn distribute(
        &mut self,
        amount: U256,
        total_shares: U256,
    ) -> Result<(), StakingError> {
        if amount.is_zero() {
            return Ok(());
        }
        if total_shares.is_zero() {
            self.undistributed =
                self.undistributed.checked_add(amount).ok_or(StakingError::Overflow)?;
            return Ok(());
        }
        let increment =
            amount.checked_mul(REWARD_PRECISION).ok_or(StakingError::Overflow)? / total_shares;
        // increment * total_shares <= amount * REWARD_PRECISION, so this cannot overflow.
        let distributed = increment * total_shares / REWARD_PRECISION;
        self.reward_per_share =
            self.reward_per_share.checked_add(increment).ok_or(StakingError::Overflow)?;
        self.undistributed = self
            .undistributed
            .checked_add(amount - distributed)
            .ok_or(StakingError::Overflow)?;
        Ok(())
    }
}

/// Reward position of one lock in one stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockStreamRewards {
    pub reward_per_share_paid: U256,
    pub pending: U256,
    pub last_claim_time: u64,
}

impl LockStreamRewards {
    pub(crate) fn new(reward_per_share: U256, now: u64) -> Self {
        Self { reward_per_share_paid: reward_per_share, pending: U256::ZERO, last_claim_time: now }
    }

    /// Move everything `shares` earned up to `reward_per_share` into `pending`.
    pub(crate) fn settle(
        &mut self,
        shares: U256,
        reward_per_share: U256,
    ) -> Result<(), StakingError> {
        let growth = reward_per_share.saturating_sub(self.reward_per_share_paid);
        let earned = shares.checked_mul(growth).ok_or(StakingError::Overflow)? / REWARD_PRECISION;
        self.pending = self.pending.checked_add(earned).ok_or(StakingError::Overflow)?;
        self.reward_per_share_paid = reward_per_share;
        Ok(())
    }
}
