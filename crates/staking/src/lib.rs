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

//! Voting-escrow staking engine with multi-stream reward accrual.
//!
//! A [StakingFactory] stamps out [StakingCore] instances from registered templates. Each
//! instance keeps a ledger of time locks over a base token, derives voting power and stream
//! shares for every lock, and distributes any number of scheduled reward streams pro-rata to
//! those shares. All token custody goes through a shared [Vault], which applies every
//! operation's token movements as one all-or-nothing batch on the underlying [TokenLedger].

pub mod clock;
pub mod config;
pub mod events;
pub mod factory;
pub mod getters;
pub mod ledger;
pub mod schedule;
pub mod staking;
pub mod vault;
pub mod weights;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ScheduleConfig, ScheduleFormat, StakingConfig, StreamConfig};
pub use events::{replay_locks, EventLog, Log, Receipt, StakingEvent};
pub use factory::{
    template_id, CreateStakingParams, CreateStakingParamsBuilder, FactoryError, StakingFactory,
    StakingTemplate, StreamParams, TemplateKind, FTHM_STAKING, XDC_STAKING,
};
pub use getters::{InstanceSummary, StakingGettersHelper, StreamInfo};
pub use ledger::{InMemoryLedger, LedgerOp, TokenError, TokenLedger, NATIVE_TOKEN};
pub use schedule::{RewardSchedule, RewardStreamScheduler, ScheduleError};
pub use staking::{
    rewards::{StreamState, REWARD_PRECISION},
    ClaimedReward, Lock, LockStatus, StakingCore, StakingError, Withdrawal, MAIN_STREAM,
};
pub use vault::{Vault, VaultError};
pub use weights::{LockWeights, StakingProperties, WeightError, WeightParameters};

/// Lock identifier, unique within one staking instance. Assigned from 1.
pub type LockId = u64;

/// Reward stream identifier, assigned densely from 0 within one staking instance.
pub type StreamId = u64;

/// Coarse classification of every failure the engine reports.
///
/// Every failure is rejected before any state change, whatever its kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad parameters: malformed schedules, zero amounts, out of range weights.
    Validation,
    /// Caller is not allowed to perform the operation.
    Authorization,
    /// The operation conflicts with current state: unknown ids, double withdrawal, limits.
    State,
    /// Not enough tokens to cover the operation.
    Resource,
    /// Arithmetic overflow or a poisoned lock.
    Internal,
}
