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

//! Event trail emitted by the factory, the vault and staking instances.

use std::collections::{BTreeMap, HashMap};

use alloy_primitives::{Address, B256, U256};
use serde::{Deserialize, Serialize};

use crate::{
    staking::{Lock, LockStatus},
    LockId, StreamId,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StakingEvent {
    TemplateAdded {
        template_id: B256,
        implementation: Address,
    },
    StakingCreated {
        instance: Address,
        template_id: B256,
        vault: Address,
        base_token: Address,
        voting_token: Address,
    },
    TokenSupported {
        token: Address,
    },
    InstanceAuthorized {
        instance: Address,
    },
    InstanceRevoked {
        instance: Address,
    },
    StreamCreated {
        stream_id: StreamId,
        reward_token: Address,
        budget: U256,
        start_time: u64,
        end_time: u64,
    },
    LockCreated {
        account: Address,
        lock_id: LockId,
        principal: U256,
        unlock_time: u64,
        voting_power: U256,
        stream_shares: U256,
    },
    LockExtended {
        account: Address,
        lock_id: LockId,
        principal: U256,
        unlock_time: u64,
        voting_power: U256,
        stream_shares: U256,
    },
    LockIncreased {
        account: Address,
        lock_id: LockId,
        added: U256,
        principal: U256,
        unlock_time: u64,
        voting_power: U256,
        stream_shares: U256,
    },
    LockWithdrawn {
        account: Address,
        lock_id: LockId,
        amount: U256,
        penalty: U256,
    },
    RewardClaimed {
        account: Address,
        lock_id: LockId,
        stream_id: StreamId,
        reward_token: Address,
        amount: U256,
    },
}

/// An event together with the component that emitted it and when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Log {
    pub address: Address,
    pub timestamp: u64,
    #[serde(flatten)]
    pub event: StakingEvent,
}

/// Output of a mutating operation along with every log it emitted, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt<T> {
    pub output: T,
    pub logs: Vec<Log>,
}

impl<T> Receipt<T> {
    pub fn new(output: T, logs: Vec<Log>) -> Self {
        Self { output, logs }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Receipt<U> {
        Receipt { output: f(self.output), logs: self.logs }
    }
}

/// Append-only sequence of logs.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    entries: Vec<Log>,
}

impl EventLog {
    pub fn push(&mut self, log: Log) {
        self.entries.push(log);
    }

    pub fn extend(&mut self, logs: impl IntoIterator<Item = Log>) {
        self.entries.extend(logs);
    }

    pub fn events(&self) -> &[Log] {
        &self.entries
    }

    /// Logs appended at or after position `cursor`. Pass the previous `len()` to poll.
    pub fn events_since(&self, cursor: usize) -> &[Log] {
        self.entries.get(cursor..).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Rebuild the locks of every account of `instance` from its logs alone.
///
/// Logs emitted by other addresses are skipped. Locks are returned per account, ordered by id.
pub fn replay_locks(instance: Address, logs: &[Log]) -> HashMap<Address, Vec<Lock>> {
    let mut locks: BTreeMap<LockId, Lock> = BTreeMap::new();

    for log in logs.iter().filter(|log| log.address == instance) {
        match &log.event {
            StakingEvent::LockCreated {
                account,
                lock_id,
                principal,
                unlock_time,
                voting_power,
                stream_shares,
            } => {
                locks.insert(
                    *lock_id,
                    Lock {
                        id: *lock_id,
                        owner: *account,
                        principal_amount: *principal,
                        lock_start: log.timestamp,
                        unlock_time: *unlock_time,
                        voting_power: *voting_power,
                        stream_shares: *stream_shares,
                        status: LockStatus::Active,
                    },
                );
            }
            StakingEvent::LockExtended {
                lock_id,
                principal,
                unlock_time,
                voting_power,
                stream_shares,
                ..
            }
            | StakingEvent::LockIncreased {
                lock_id,
                principal,
                unlock_time,
                voting_power,
                stream_shares,
                ..
            } => {
                if let Some(lock) = locks.get_mut(lock_id) {
                    lock.principal_amount = *principal;
                    lock.lock_start = log.timestamp;
                    lock.unlock_time = *unlock_time;
                    lock.voting_power = *voting_power;
                    lock.stream_shares = *stream_shares;
                }
            }
            StakingEvent::LockWithdrawn { lock_id, .. } => {
                if let Some(lock) = locks.get_mut(lock_id) {
                    lock.mark_withdrawn();
                }
            }
            _ => {}
        }
    }

    let mut by_account: HashMap<Address, Vec<Lock>> = HashMap::new();
    for lock in locks.into_values() {
        by_account.entry(lock.owner).or_default().push(lock);
    }
    by_account
}
