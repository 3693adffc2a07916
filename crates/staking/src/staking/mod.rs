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

//! Per-instance lock ledger and reward accrual.
//!
//! Every operation runs in three phases while holding the instance lock: validate and compute
//! the new lock, stream and aggregate values on copies, submit all token movements to the
//! vault as one batch, then commit the copies. A failure in either of the first two phases
//! leaves the instance, the vault and the ledger untouched.

mod lock;
pub mod rewards;

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::{Arc, Mutex, MutexGuard},
};

use alloy_primitives::{Address, B256, U256};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use lock::{Lock, LockStatus};
use rewards::{LockStreamRewards, StreamState};

use crate::{
    clock::Clock,
    events::{EventLog, Log, Receipt, StakingEvent},
    factory::TemplateKind,
    ledger::LedgerOp,
    schedule::{RewardSchedule, RewardStreamScheduler, ScheduleError},
    vault::{Vault, VaultError},
    weights::{self, StakingProperties, WeightError, WeightParameters},
    ErrorKind, LockId, StreamId,
};

/// The stream created with every instance. It pays out in the base token and receives
/// early-withdrawal penalties.
pub const MAIN_STREAM: StreamId = 0;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StakingError {
    #[error("Amount must be greater than zero")]
    ZeroAmount,

    #[error("Invalid unlock time {unlock_time} at {now}")]
    InvalidUnlockTime { unlock_time: u64, now: u64 },

    #[error("Account {account} already holds {max_locks} active locks")]
    LockLimitExceeded { account: Address, max_locks: u32 },

    #[error("Lock {0} not found")]
    LockNotFound(LockId),

    #[error("{caller} does not own lock {lock_id}")]
    NotLockOwner { lock_id: LockId, caller: Address },

    #[error("Lock {0} was already withdrawn")]
    AlreadyWithdrawn(LockId),

    #[error("Lock {0} has expired")]
    LockExpired(LockId),

    #[error("Unknown reward stream {0}")]
    UnknownStream(StreamId),

    #[error("Nothing to claim for lock {0}")]
    NothingToClaim(LockId),

    #[error("Instance does not accept native currency locks")]
    NativeLocksUnsupported,

    #[error("{0} is not authorized")]
    Unauthorized(Address),

    #[error("Clock moved backwards: now {now}, last seen {last_seen}")]
    ClockRegression { now: u64, last_seen: u64 },

    #[error(
        "Reward reserve of stream {stream_id} too small: needed {needed}, available {available}"
    )]
    InsufficientReserve { stream_id: StreamId, needed: U256, available: U256 },

    #[error("Arithmetic overflow")]
    Overflow,

    #[error("Staking state lock poisoned")]
    LockPoisoned,

    #[error("Schedule error: {0}")]
    Schedule(#[from] ScheduleError),

    #[error("Weight error: {0}")]
    Weight(#[from] WeightError),

    #[error("Vault error: {0}")]
    Vault(#[from] VaultError),
}

impl StakingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StakingError::ZeroAmount | StakingError::InvalidUnlockTime { .. } => {
                ErrorKind::Validation
            }
            StakingError::NotLockOwner { .. } | StakingError::Unauthorized(_) => {
                ErrorKind::Authorization
            }
            StakingError::LockLimitExceeded { .. }
            | StakingError::LockNotFound(_)
            | StakingError::AlreadyWithdrawn(_)
            | StakingError::LockExpired(_)
            | StakingError::UnknownStream(_)
            | StakingError::NothingToClaim(_)
            | StakingError::NativeLocksUnsupported
            | StakingError::ClockRegression { .. } => ErrorKind::State,
            StakingError::InsufficientReserve { .. } => ErrorKind::Resource,
            StakingError::Overflow | StakingError::LockPoisoned => ErrorKind::Internal,
            StakingError::Schedule(err) => err.kind(),
            StakingError::Weight(err) => err.kind(),
            StakingError::Vault(err) => err.kind(),
        }
    }
}

/// Result of withdrawing a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Withdrawal {
    /// Principal returned to the owner.
    pub amount: U256,
    /// Principal kept by the vault and socialized through the main stream.
    pub penalty: U256,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimedReward {
    pub stream_id: StreamId,
    pub reward_token: Address,
    pub amount: U256,
}

/// Immutable configuration of an instance, fixed by the factory.
#[derive(Debug, Clone)]
pub(crate) struct InstanceConfig {
    pub(crate) address: Address,
    pub(crate) template_id: B256,
    pub(crate) kind: TemplateKind,
    pub(crate) base_token: Address,
    pub(crate) voting_token: Address,
    pub(crate) rewards_admin: Address,
    pub(crate) weights: WeightParameters,
    pub(crate) properties: StakingProperties,
}

#[derive(Debug, Default)]
pub(crate) struct CoreState {
    pub(crate) locks: BTreeMap<LockId, Lock>,
    pub(crate) account_locks: HashMap<Address, Vec<LockId>>,
    pub(crate) active_locks: HashMap<Address, u32>,
    pub(crate) next_lock_id: LockId,
    /// Sum of the stream shares of all active locks.
    pub(crate) total_stream_shares: U256,
    /// Sum of the principal of all active locks.
    pub(crate) total_principal: U256,
    pub(crate) scheduler: RewardStreamScheduler,
    pub(crate) streams: Vec<StreamState>,
    pub(crate) lock_rewards: HashMap<(LockId, StreamId), LockStreamRewards>,
    pub(crate) events: EventLog,
    pub(crate) last_seen: u64,
}

impl CoreState {
    pub(crate) fn lock(&self, lock_id: LockId) -> Result<&Lock, StakingError> {
        self.locks.get(&lock_id).ok_or(StakingError::LockNotFound(lock_id))
    }

    fn owned_lock(&self, caller: Address, lock_id: LockId) -> Result<Lock, StakingError> {
        let lock = self.lock(lock_id)?;
        if lock.owner != caller {
            return Err(StakingError::NotLockOwner { lock_id, caller });
        }
        Ok(lock.clone())
    }

    pub(crate) fn stream(
        &self,
        stream_id: StreamId,
    ) -> Result<(&StreamState, &RewardSchedule), StakingError> {
        let schedule = self
            .scheduler
            .schedule(stream_id)
            .map_err(|_| StakingError::UnknownStream(stream_id))?;
        let stream = usize::try_from(stream_id)
            .ok()
            .and_then(|index| self.streams.get(index))
            .ok_or(StakingError::UnknownStream(stream_id))?;
        Ok((stream, schedule))
    }

    /// Reward position of a lock in a stream. Locks that predate a stream start at zero.
    pub(crate) fn rewards_of(&self, lock_id: LockId, stream: &StreamState) -> LockStreamRewards {
        self.lock_rewards
            .get(&(lock_id, stream.stream_id))
            .copied()
            .unwrap_or_else(|| LockStreamRewards::new(U256::ZERO, stream.created_at))
    }

    /// Copies of every stream advanced to `now` over the current share total.
    pub(crate) fn advanced_streams(&self, now: u64) -> Result<Vec<StreamState>, StakingError> {
        let mut streams = self.streams.clone();
        for stream in &mut streams {
            let schedule = self.scheduler.schedule(stream.stream_id)?;
            stream.advance(schedule, self.total_stream_shares, now)?;
        }
        Ok(streams)
    }

    /// Copies of the lock's reward positions in every stream, settled against `streams`.
    pub(crate) fn settled(
        &self,
        lock: &Lock,
        streams: &[StreamState],
    ) -> Result<Vec<(StreamId, LockStreamRewards)>, StakingError> {
        streams
            .iter()
            .map(|stream| {
                let mut entry = self.rewards_of(lock.id, stream);
                entry.settle(lock.stream_shares, stream.reward_per_share)?;
                Ok((stream.stream_id, entry))
            })
            .collect()
    }

    pub(crate) fn liabilities(
        &self,
        base_token: Address,
        token: Address,
    ) -> Result<U256, StakingError> {
        let mut total = if token == base_token { self.total_principal } else { U256::ZERO };
        for stream in self.streams.iter().filter(|s| s.reward_token == token) {
            total = total.checked_add(stream.reserve).ok_or(StakingError::Overflow)?;
        }
        Ok(total)
    }

    fn commit(&mut self, now: u64, logs: &[Log]) {
        self.last_seen = now;
        self.events.extend(logs.iter().cloned());
    }
}

/// One staking instance.
pub struct StakingCore {
    config: InstanceConfig,
    vault: Arc<Vault>,
    clock: Arc<dyn Clock>,
    state: Mutex<CoreState>,
}

impl fmt::Debug for StakingCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StakingCore")
            .field("address", &self.config.address)
            .field("template_id", &self.config.template_id)
            .field("base_token", &self.config.base_token)
            .finish()
    }
}

impl StakingCore {
    /// Build an instance whose vault funding has already been applied.
    pub(crate) fn new(
        config: InstanceConfig,
        vault: Arc<Vault>,
        clock: Arc<dyn Clock>,
        streams: Vec<(Address, RewardSchedule)>,
        now: u64,
    ) -> (Self, Vec<Log>) {
        let mut state = CoreState { next_lock_id: 1, last_seen: now, ..Default::default() };
        let mut logs = Vec::with_capacity(streams.len());
        for (reward_token, schedule) in streams {
            let stream_id = state.streams.len() as StreamId;
            logs.push(Log {
                address: config.address,
                timestamp: now,
                event: StakingEvent::StreamCreated {
                    stream_id,
                    reward_token,
                    budget: schedule.total_budget(),
                    start_time: schedule.start_time(),
                    end_time: schedule.end_time(),
                },
            });
            state.streams.push(StreamState::new(stream_id, reward_token, &schedule, now));
            state.scheduler.add_stream(schedule);
        }
        state.events.extend(logs.iter().cloned());
        let core = Self { config, vault, clock, state: Mutex::new(state) };
        (core, logs)
    }

    pub fn address(&self) -> Address {
        self.config.address
    }

    pub fn template_id(&self) -> B256 {
        self.config.template_id
    }

    pub fn kind(&self) -> TemplateKind {
        self.config.kind
    }

    pub fn base_token(&self) -> Address {
        self.config.base_token
    }

    pub fn voting_token(&self) -> Address {
        self.config.voting_token
    }

    pub fn rewards_admin(&self) -> Address {
        self.config.rewards_admin
    }

    pub fn weights(&self) -> &WeightParameters {
        &self.config.weights
    }

    pub fn properties(&self) -> &StakingProperties {
        &self.config.properties
    }

    pub fn vault(&self) -> &Arc<Vault> {
        &self.vault
    }

    /// Lock `amount` of the base token until `unlock_time`.
    pub fn create_lock(
        &self,
        caller: Address,
        amount: U256,
        unlock_time: u64,
    ) -> Result<Receipt<LockId>, StakingError> {
        self.open_lock(caller, amount, unlock_time, None)
    }

    /// Wrap `value` of native currency into the base token and lock it until `unlock_time`.
    pub fn create_lock_native(
        &self,
        caller: Address,
        unlock_time: u64,
        value: U256,
    ) -> Result<Receipt<LockId>, StakingError> {
        if self.config.kind != TemplateKind::WrappedNative {
            return Err(StakingError::NativeLocksUnsupported);
        }
        let wrap = LedgerOp::WrapNative {
            wrapped: self.config.base_token,
            account: caller,
            amount: value,
        };
        self.open_lock(caller, value, unlock_time, Some(wrap))
    }

    fn open_lock(
        &self,
        caller: Address,
        amount: U256,
        unlock_time: u64,
        funding: Option<LedgerOp>,
    ) -> Result<Receipt<LockId>, StakingError> {
        let mut state = self.lock_state()?;
        let now = self.observe(&state)?;

        if amount.is_zero() {
            return Err(StakingError::ZeroAmount);
        }
        if unlock_time <= now {
            return Err(StakingError::InvalidUnlockTime { unlock_time, now });
        }
        let active = state.active_locks.get(&caller).copied().unwrap_or_default();
        if active >= self.config.properties.max_locks {
            return Err(StakingError::LockLimitExceeded {
                account: caller,
                max_locks: self.config.properties.max_locks,
            });
        }

        let derived = weights::lock_weights(
            &self.config.weights,
            &self.config.properties,
            amount,
            unlock_time - now,
        )?;
        let streams = state.advanced_streams(now)?;
        let total_stream_shares = state
            .total_stream_shares
            .checked_add(derived.stream_shares)
            .ok_or(StakingError::Overflow)?;
        let total_principal =
            state.total_principal.checked_add(amount).ok_or(StakingError::Overflow)?;
        let lock_id = state.next_lock_id;
        let lock = Lock {
            id: lock_id,
            owner: caller,
            principal_amount: amount,
            lock_start: now,
            unlock_time,
            voting_power: derived.voting_power,
            stream_shares: derived.stream_shares,
            status: LockStatus::Active,
        };

        let mut ops: Vec<LedgerOp> = funding.into_iter().collect();
        ops.push(LedgerOp::Transfer {
            token: self.config.base_token,
            from: caller,
            to: self.vault.address(),
            amount,
        });
        if !derived.voting_power.is_zero() {
            ops.push(LedgerOp::Mint {
                token: self.config.voting_token,
                to: caller,
                amount: derived.voting_power,
            });
        }
        self.vault.execute(self.config.address, &ops)?;

        for stream in &streams {
            let entry = LockStreamRewards::new(stream.reward_per_share, now);
            state.lock_rewards.insert((lock_id, stream.stream_id), entry);
        }
        state.streams = streams;
        state.total_stream_shares = total_stream_shares;
        state.total_principal = total_principal;
        state.next_lock_id += 1;
        state.account_locks.entry(caller).or_default().push(lock_id);
        *state.active_locks.entry(caller).or_default() += 1;

        let logs = vec![self.log(
            now,
            StakingEvent::LockCreated {
                account: caller,
                lock_id,
                principal: amount,
                unlock_time,
                voting_power: lock.voting_power,
                stream_shares: lock.stream_shares,
            },
        )];
        state.locks.insert(lock_id, lock);
        state.commit(now, &logs);

        tracing::info!(
            "Created lock {} in {} for {}: amount {}, unlock {}, shares {}",
            lock_id,
            self.config.address,
            caller,
            amount,
            unlock_time,
            derived.stream_shares
        );
        Ok(Receipt::new(lock_id, logs))
    }

    /// Move the unlock time of a lock further out and recompute its weights.
    pub fn extend_lock(
        &self,
        caller: Address,
        lock_id: LockId,
        new_unlock_time: u64,
    ) -> Result<Receipt<Lock>, StakingError> {
        let mut state = self.lock_state()?;
        let now = self.observe(&state)?;

        let lock = state.owned_lock(caller, lock_id)?;
        if !lock.is_active() {
            return Err(StakingError::AlreadyWithdrawn(lock_id));
        }
        if new_unlock_time <= lock.unlock_time || new_unlock_time <= now {
            return Err(StakingError::InvalidUnlockTime { unlock_time: new_unlock_time, now });
        }

        let derived = weights::lock_weights(
            &self.config.weights,
            &self.config.properties,
            lock.principal_amount,
            new_unlock_time - now,
        )?;
        let updated = Lock {
            lock_start: now,
            unlock_time: new_unlock_time,
            voting_power: derived.voting_power,
            stream_shares: derived.stream_shares,
            ..lock.clone()
        };
        let ops = self.voting_adjustment(&lock, derived.voting_power);
        let logs = vec![self.log(
            now,
            StakingEvent::LockExtended {
                account: caller,
                lock_id,
                principal: updated.principal_amount,
                unlock_time: new_unlock_time,
                voting_power: updated.voting_power,
                stream_shares: updated.stream_shares,
            },
        )];
        self.reweight(&mut state, now, &lock, updated.clone(), U256::ZERO, ops, &logs)?;

        tracing::info!(
            "Extended lock {} in {} to {}",
            lock_id,
            self.config.address,
            new_unlock_time
        );
        Ok(Receipt::new(updated, logs))
    }

    /// Add `amount` to the principal of a lock, keeping its unlock time.
    pub fn increase_lock(
        &self,
        caller: Address,
        lock_id: LockId,
        amount: U256,
    ) -> Result<Receipt<Lock>, StakingError> {
        let mut state = self.lock_state()?;
        let now = self.observe(&state)?;

        if amount.is_zero() {
            return Err(StakingError::ZeroAmount);
        }
        let lock = state.owned_lock(caller, lock_id)?;
        if !lock.is_active() {
            return Err(StakingError::AlreadyWithdrawn(lock_id));
        }
        if lock.unlock_time <= now {
            return Err(StakingError::LockExpired(lock_id));
        }

        let principal = lock.principal_amount.checked_add(amount).ok_or(StakingError::Overflow)?;
        let derived = weights::lock_weights(
            &self.config.weights,
            &self.config.properties,
            principal,
            lock.unlock_time - now,
        )?;
        let updated = Lock {
            principal_amount: principal,
            lock_start: now,
            voting_power: derived.voting_power,
            stream_shares: derived.stream_shares,
            ..lock.clone()
        };
        let mut ops = vec![LedgerOp::Transfer {
            token: self.config.base_token,
            from: caller,
            to: self.vault.address(),
            amount,
        }];
        ops.extend(self.voting_adjustment(&lock, derived.voting_power));
        let logs = vec![self.log(
            now,
            StakingEvent::LockIncreased {
                account: caller,
                lock_id,
                added: amount,
                principal,
                unlock_time: updated.unlock_time,
                voting_power: updated.voting_power,
                stream_shares: updated.stream_shares,
            },
        )];
        self.reweight(&mut state, now, &lock, updated.clone(), amount, ops, &logs)?;

        tracing::info!("Increased lock {} in {} by {}", lock_id, self.config.address, amount);
        Ok(Receipt::new(updated, logs))
    }

    /// Replace an active lock's weights, settling its rewards under the old ones first.
    #[allow(clippy::too_many_arguments)]
    fn reweight(
        &self,
        state: &mut CoreState,
        now: u64,
        old: &Lock,
        updated: Lock,
        added_principal: U256,
        ops: Vec<LedgerOp>,
        logs: &[Log],
    ) -> Result<(), StakingError> {
        let streams = state.advanced_streams(now)?;
        let settled = state.settled(old, &streams)?;
        let total_stream_shares = state
            .total_stream_shares
            .checked_sub(old.stream_shares)
            .and_then(|total| total.checked_add(updated.stream_shares))
            .ok_or(StakingError::Overflow)?;
        let total_principal =
            state.total_principal.checked_add(added_principal).ok_or(StakingError::Overflow)?;
        tracing::debug!(
            "Reweighting lock {}: shares {} -> {}, total {}",
            old.id,
            old.stream_shares,
            updated.stream_shares,
            total_stream_shares
        );

        if !ops.is_empty() {
            self.vault.execute(self.config.address, &ops)?;
        }

        state.streams = streams;
        for (stream_id, entry) in settled {
            state.lock_rewards.insert((old.id, stream_id), entry);
        }
        state.total_stream_shares = total_stream_shares;
        state.total_principal = total_principal;
        state.locks.insert(old.id, updated);
        state.commit(now, logs);
        Ok(())
    }

    /// Close a lock. Before the unlock time a penalty is kept and shared with remaining stakers.
    pub fn withdraw(
        &self,
        caller: Address,
        lock_id: LockId,
    ) -> Result<Receipt<Withdrawal>, StakingError> {
        let mut state = self.lock_state()?;
        let now = self.observe(&state)?;

        let lock = state.owned_lock(caller, lock_id)?;
        if !lock.is_active() {
            return Err(StakingError::AlreadyWithdrawn(lock_id));
        }

        let mut streams = state.advanced_streams(now)?;
        let settled = state.settled(&lock, &streams)?;
        let penalty = weights::early_withdrawal_penalty(
            &self.config.weights,
            &self.config.properties,
            lock.principal_amount,
            lock.lock_start,
            lock.unlock_time,
            now,
        )?;
        let amount = lock.principal_amount - penalty;
        let total_stream_shares = state
            .total_stream_shares
            .checked_sub(lock.stream_shares)
            .ok_or(StakingError::Overflow)?;
        let total_principal = state
            .total_principal
            .checked_sub(lock.principal_amount)
            .ok_or(StakingError::Overflow)?;
        if !penalty.is_zero() {
            let main = streams
                .get_mut(MAIN_STREAM as usize)
                .ok_or(StakingError::UnknownStream(MAIN_STREAM))?;
            main.reserve = main.reserve.checked_add(penalty).ok_or(StakingError::Overflow)?;
            main.distribute(penalty, total_stream_shares)?;
        }

        let mut ops = Vec::new();
        if !amount.is_zero() {
            ops.push(LedgerOp::Transfer {
                token: self.config.base_token,
                from: self.vault.address(),
                to: caller,
                amount,
            });
            if self.config.kind == TemplateKind::WrappedNative {
                ops.push(LedgerOp::UnwrapNative {
                    wrapped: self.config.base_token,
                    account: caller,
                    amount,
                });
            }
        }
        ops.extend(self.voting_adjustment(&lock, U256::ZERO));
        if !ops.is_empty() {
            self.vault.execute(self.config.address, &ops)?;
        }

        state.streams = streams;
        for (stream_id, entry) in settled {
            state.lock_rewards.insert((lock_id, stream_id), entry);
        }
        state.total_stream_shares = total_stream_shares;
        state.total_principal = total_principal;
        if let Some(active) = state.active_locks.get_mut(&caller) {
            *active = active.saturating_sub(1);
        }
        if let Some(stored) = state.locks.get_mut(&lock_id) {
            stored.mark_withdrawn();
        }
        let logs = vec![self.log(
            now,
            StakingEvent::LockWithdrawn { account: caller, lock_id, amount, penalty },
        )];
        state.commit(now, &logs);

        if penalty.is_zero() {
            tracing::info!("Withdrew lock {} in {}: {}", lock_id, self.config.address, amount);
        } else {
            tracing::info!(
                "Withdrew lock {} in {} early: {} returned, {} penalty",
                lock_id,
                self.config.address,
                amount,
                penalty
            );
        }
        Ok(Receipt::new(Withdrawal { amount, penalty }, logs))
    }

    /// Pay out everything a lock has earned in one stream.
    pub fn claim_rewards(
        &self,
        caller: Address,
        lock_id: LockId,
        stream_id: StreamId,
    ) -> Result<Receipt<U256>, StakingError> {
        let mut state = self.lock_state()?;
        let now = self.observe(&state)?;

        let lock = state.owned_lock(caller, lock_id)?;
        let (stream, schedule) = state.stream(stream_id)?;
        let mut stream = stream.clone();
        stream.advance(schedule, state.total_stream_shares, now)?;
        let mut entry = state.rewards_of(lock_id, &stream);
        entry.settle(lock.stream_shares, stream.reward_per_share)?;

        let claim = Self::take_pending(&mut stream, &mut entry, lock_id, now)?;
        self.vault.execute(
            self.config.address,
            &[LedgerOp::Transfer {
                token: claim.reward_token,
                from: self.vault.address(),
                to: caller,
                amount: claim.amount,
            }],
        )?;

        state.lock_rewards.insert((lock_id, stream_id), entry);
        state.streams[stream_id as usize] = stream;
        let logs = vec![self.claim_log(now, caller, lock_id, &claim)];
        state.commit(now, &logs);

        tracing::info!(
            "Lock {} in {} claimed {} from stream {}",
            lock_id,
            self.config.address,
            claim.amount,
            stream_id
        );
        Ok(Receipt::new(claim.amount, logs))
    }

    /// Pay out everything a lock has earned in every stream.
    pub fn claim_all_rewards(
        &self,
        caller: Address,
        lock_id: LockId,
    ) -> Result<Receipt<Vec<ClaimedReward>>, StakingError> {
        let mut state = self.lock_state()?;
        let now = self.observe(&state)?;

        let lock = state.owned_lock(caller, lock_id)?;
        let mut streams = state.advanced_streams(now)?;
        let mut settled = state.settled(&lock, &streams)?;

        let mut claims = Vec::new();
        for (stream, (_, entry)) in streams.iter_mut().zip(settled.iter_mut()) {
            if entry.pending.is_zero() {
                continue;
            }
            claims.push(Self::take_pending(stream, entry, lock_id, now)?);
        }
        if claims.is_empty() {
            return Err(StakingError::NothingToClaim(lock_id));
        }

        let ops: Vec<LedgerOp> = claims
            .iter()
            .map(|claim| LedgerOp::Transfer {
                token: claim.reward_token,
                from: self.vault.address(),
                to: caller,
                amount: claim.amount,
            })
            .collect();
        self.vault.execute(self.config.address, &ops)?;

        state.streams = streams;
        for (stream_id, entry) in settled {
            state.lock_rewards.insert((lock_id, stream_id), entry);
        }
        let logs: Vec<Log> =
            claims.iter().map(|claim| self.claim_log(now, caller, lock_id, claim)).collect();
        state.commit(now, &logs);

        tracing::info!(
            "Lock {} in {} claimed from {} streams",
            lock_id,
            self.config.address,
            claims.len()
        );
        Ok(Receipt::new(claims, logs))
    }

    fn take_pending(
        stream: &mut StreamState,
        entry: &mut LockStreamRewards,
        lock_id: LockId,
        now: u64,
    ) -> Result<ClaimedReward, StakingError> {
        let amount = entry.pending;
        if amount.is_zero() {
            return Err(StakingError::NothingToClaim(lock_id));
        }
        stream.reserve =
            stream.reserve.checked_sub(amount).ok_or(StakingError::InsufficientReserve {
                stream_id: stream.stream_id,
                needed: amount,
                available: stream.reserve,
            })?;
        stream.claimed = stream.claimed.checked_add(amount).ok_or(StakingError::Overflow)?;
        entry.pending = U256::ZERO;
        entry.last_claim_time = now;
        Ok(ClaimedReward { stream_id: stream.stream_id, reward_token: stream.reward_token, amount })
    }

    /// Add an independent reward stream funded by the rewards admin.
    pub fn create_stream(
        &self,
        caller: Address,
        reward_token: Address,
        schedule: RewardSchedule,
    ) -> Result<Receipt<StreamId>, StakingError> {
        let mut state = self.lock_state()?;
        let now = self.observe(&state)?;

        if caller != self.config.rewards_admin {
            return Err(StakingError::Unauthorized(caller));
        }
        let stream_id = state.streams.len() as StreamId;
        let stream = StreamState::new(stream_id, reward_token, &schedule, now);
        let budget = schedule.total_budget();
        if !budget.is_zero() {
            self.vault.execute(
                self.config.address,
                &[LedgerOp::Transfer {
                    token: reward_token,
                    from: caller,
                    to: self.vault.address(),
                    amount: budget,
                }],
            )?;
        }

        let logs = vec![self.log(
            now,
            StakingEvent::StreamCreated {
                stream_id,
                reward_token,
                budget,
                start_time: schedule.start_time(),
                end_time: schedule.end_time(),
            },
        )];
        state.streams.push(stream);
        state.scheduler.add_stream(schedule);
        state.commit(now, &logs);

        tracing::info!(
            "Created stream {} in {} paying {} of {}",
            stream_id,
            self.config.address,
            budget,
            reward_token
        );
        Ok(Receipt::new(stream_id, logs))
    }

    /// How much of `token` this instance expects the vault to hold on its behalf.
    pub fn liabilities(&self, token: Address) -> Result<U256, StakingError> {
        self.lock_state()?.liabilities(self.config.base_token, token)
    }

    pub fn events(&self) -> Result<Vec<Log>, StakingError> {
        Ok(self.lock_state()?.events.events().to_vec())
    }

    pub fn events_since(&self, cursor: usize) -> Result<Vec<Log>, StakingError> {
        Ok(self.lock_state()?.events.events_since(cursor).to_vec())
    }

    /// Run `f` on a consistent snapshot of the state, evaluated at the current time.
    pub(crate) fn read<R>(
        &self,
        f: impl FnOnce(&CoreState, u64) -> Result<R, StakingError>,
    ) -> Result<R, StakingError> {
        let state = self.lock_state()?;
        let now = self.observe(&state)?;
        f(&state, now)
    }

    /// Voting token ops that move the owner's balance from the lock's recorded voting power
    /// to `target`. A burn needs the owner to still hold the full difference, otherwise the
    /// whole batch fails with an insufficient balance.
    fn voting_adjustment(&self, lock: &Lock, target: U256) -> Vec<LedgerOp> {
        let token = self.config.voting_token;
        if target > lock.voting_power {
            return vec![LedgerOp::Mint {
                token,
                to: lock.owner,
                amount: target - lock.voting_power,
            }];
        }
        let excess = lock.voting_power - target;
        if excess.is_zero() {
            return vec![];
        }
        vec![LedgerOp::Burn { token, from: lock.owner, amount: excess }]
    }

    fn observe(&self, state: &CoreState) -> Result<u64, StakingError> {
        let now = self.clock.now();
        if now < state.last_seen {
            tracing::warn!(
                "Rejecting operation on {}: clock at {} is behind {}",
                self.config.address,
                now,
                state.last_seen
            );
            return Err(StakingError::ClockRegression { now, last_seen: state.last_seen });
        }
        Ok(now)
    }

    fn log(&self, now: u64, event: StakingEvent) -> Log {
        Log { address: self.config.address, timestamp: now, event }
    }

    fn claim_log(&self, now: u64, account: Address, lock_id: LockId, claim: &ClaimedReward) -> Log {
        self.log(
            now,
            StakingEvent::RewardClaimed {
                account,
                lock_id,
                stream_id: claim.stream_id,
                reward_token: claim.reward_token,
                amount: claim.amount,
            },
        )
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, CoreState>, StakingError> {
        self.state.lock().map_err(|_| StakingError::LockPoisoned)
    }
}
