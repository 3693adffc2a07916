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

//! Read-only views over staking instances.
//!
//! Every call reads one consistent snapshot of the instance, taken under its state lock.

use alloy_primitives::{Address, B256, U256};
use serde::{Deserialize, Serialize};

use crate::{
    schedule::RewardSchedule,
    staking::{rewards::StreamState, Lock, StakingCore, StakingError, Withdrawal},
    weights, LockId, StreamId,
};

/// A reward stream together with its schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub state: StreamState,
    pub schedule: RewardSchedule,
    /// Emission rate at the time of the query.
    pub rate: U256,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSummary {
    pub address: Address,
    pub template_id: B256,
    pub base_token: Address,
    pub voting_token: Address,
    pub total_stream_shares: U256,
    pub total_principal: U256,
    pub lock_count: usize,
    pub active_lock_count: usize,
    pub stream_count: usize,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct StakingGettersHelper;

impl StakingGettersHelper {
    pub fn get_lock(&self, instance: &StakingCore, lock_id: LockId) -> Result<Lock, StakingError> {
        instance.read(|state, _| state.lock(lock_id).cloned())
    }

    pub fn get_total_stream_shares(&self, instance: &StakingCore) -> Result<U256, StakingError> {
        instance.read(|state, _| Ok(state.total_stream_shares))
    }

    /// Every lock the account ever opened in the instance, withdrawn ones included.
    pub fn get_account_locks(
        &self,
        instance: &StakingCore,
        account: Address,
    ) -> Result<Vec<Lock>, StakingError> {
        instance.read(|state, _| {
            let ids = state.account_locks.get(&account).map(Vec::as_slice).unwrap_or_default();
            ids.iter().map(|id| state.lock(*id).cloned()).collect()
        })
    }

    /// What the lock could claim from the stream right now.
    pub fn get_pending_rewards(
        &self,
        instance: &StakingCore,
        lock_id: LockId,
        stream_id: StreamId,
    ) -> Result<U256, StakingError> {
        instance.read(|state, now| {
            let lock = state.lock(lock_id)?;
            let (stream, schedule) = state.stream(stream_id)?;
            let mut stream = stream.clone();
            stream.advance(schedule, state.total_stream_shares, now)?;
            let mut entry = state.rewards_of(lock_id, &stream);
            entry.settle(lock.stream_shares, stream.reward_per_share)?;
            Ok(entry.pending)
        })
    }

    pub fn get_stream(
        &self,
        instance: &StakingCore,
        stream_id: StreamId,
    ) -> Result<StreamInfo, StakingError> {
        instance.read(|state, now| {
            let (stream, schedule) = state.stream(stream_id)?;
            Ok(StreamInfo {
                state: stream.clone(),
                schedule: schedule.clone(),
                rate: schedule.rate_at(now),
            })
        })
    }

    /// Sum of the voting power of the account's active locks.
    pub fn get_account_voting_power(
        &self,
        instance: &StakingCore,
        account: Address,
    ) -> Result<U256, StakingError> {
        Ok(self
            .get_account_locks(instance, account)?
            .iter()
            .filter(|lock| lock.is_active())
            .fold(U256::ZERO, |total, lock| total.saturating_add(lock.voting_power)))
    }

    /// What withdrawing the lock now would return and cost.
    pub fn preview_withdraw(
        &self,
        instance: &StakingCore,
        lock_id: LockId,
    ) -> Result<Withdrawal, StakingError> {
        instance.read(|state, now| {
            let lock = state.lock(lock_id)?;
            if !lock.is_active() {
                return Err(StakingError::AlreadyWithdrawn(lock_id));
            }
            let penalty = weights::early_withdrawal_penalty(
                instance.weights(),
                instance.properties(),
                lock.principal_amount,
                lock.lock_start,
                lock.unlock_time,
                now,
            )?;
            Ok(Withdrawal { amount: lock.principal_amount - penalty, penalty })
        })
    }

    pub fn get_instance_summary(
        &self,
        instance: &StakingCore,
    ) -> Result<InstanceSummary, StakingError> {
        instance.read(|state, _| {
            Ok(InstanceSummary {
                address: instance.address(),
                template_id: instance.template_id(),
                base_token: instance.base_token(),
                voting_token: instance.voting_token(),
                total_stream_shares: state.total_stream_shares,
                total_principal: state.total_principal,
                lock_count: state.locks.len(),
                active_lock_count: state.locks.values().filter(|lock| lock.is_active()).count(),
                stream_count: state.streams.len(),
            })
        })
    }
}
