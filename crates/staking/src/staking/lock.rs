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

use alloy_primitives::{Address, U256};
use serde::{Deserialize, Serialize};

use crate::LockId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockStatus {
    Active,
    /// Terminal. A withdrawn lock is never reactivated.
    Withdrawn,
}

/// A principal deposit committed until `unlock_time`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    pub id: LockId,
    pub owner: Address,
    pub principal_amount: U256,
    /// When the current weights were derived. Reset by extend and increase.
    pub lock_start: u64,
    pub unlock_time: u64,
    pub voting_power: U256,
    pub stream_shares: U256,
    pub status: LockStatus,
}

impl Lock {
    pub fn is_active(&self) -> bool {
        self.status == LockStatus::Active
    }

    /// Duration the current weights were derived from.
    pub fn lock_duration(&self) -> u64 {
        self.unlock_time.saturating_sub(self.lock_start)
    }

    pub(crate) fn mark_withdrawn(&mut self) {
        self.status = LockStatus::Withdrawn;
        self.voting_power = U256::ZERO;
        self.stream_shares = U256::ZERO;
    }
}
