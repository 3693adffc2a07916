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

//! Piecewise-linear reward emission schedules.
//!
//! A [RewardSchedule] is a list of `(timestamp, cumulative reward)` checkpoints. Between two
//! checkpoints rewards are emitted linearly, before the first checkpoint nothing is emitted and
//! after the last one the cumulative curve stays flat at the total budget. Interpolation uses
//! truncating integer division, so the cumulative curve is non-decreasing and the emission over
//! the full domain is exactly the budget.

use alloy_primitives::U256;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{ErrorKind, StreamId};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("Schedule has {times} times but {rewards} rewards")]
    LengthMismatch { times: usize, rewards: usize },

    #[error("Schedule needs at least two checkpoints, got {0}")]
    TooFewCheckpoints(usize),

    #[error("Schedule times must be strictly increasing (index {index})")]
    NonIncreasingTimes { index: usize },

    #[error("Cumulative rewards must be non-decreasing (index {index})")]
    DecreasingRewards { index: usize },

    #[error("Remaining rewards must be non-increasing (index {index})")]
    IncreasingRemaining { index: usize },

    #[error("Remaining rewards must end at zero, got {0}")]
    RemainingNotExhausted(U256),

    #[error("Invalid interval: from {from} is after to {to}")]
    InvalidInterval { from: u64, to: u64 },

    #[error("Unknown reward stream {0}")]
    UnknownStream(StreamId),
}

impl ScheduleError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ScheduleError::UnknownStream(_) => ErrorKind::State,
            _ => ErrorKind::Validation,
        }
    }
}

/// Checkpoints of one reward stream, in canonical cumulative form.
///
/// Always holds at least two checkpoints. Every constructor, serde included, goes through
/// [RewardSchedule::new], and the accessors below index the ends directly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawSchedule", into = "RawSchedule")]
pub struct RewardSchedule {
    times: Vec<u64>,
    cumulative: Vec<U256>,
}

#[derive(Serialize, Deserialize)]
struct RawSchedule {
    times: Vec<u64>,
    cumulative: Vec<U256>,
}

impl TryFrom<RawSchedule> for RewardSchedule {
    type Error = ScheduleError;

    fn try_from(raw: RawSchedule) -> Result<Self, Self::Error> {
        RewardSchedule::new(raw.times, raw.cumulative)
    }
}

impl From<RewardSchedule> for RawSchedule {
    fn from(schedule: RewardSchedule) -> Self {
        RawSchedule { times: schedule.times, cumulative: schedule.cumulative }
    }
}

impl RewardSchedule {
    /// Build a schedule from parallel checkpoint times and cumulative rewards.
    pub fn new(times: Vec<u64>, cumulative: Vec<U256>) -> Result<Self, ScheduleError> {
        if times.len() != cumulative.len() {
            return Err(ScheduleError::LengthMismatch {
                times: times.len(),
                rewards: cumulative.len(),
            });
        }
        if times.len() < 2 {
            return Err(ScheduleError::TooFewCheckpoints(times.len()));
        }
        if let Some(index) = times.windows(2).position(|w| w[0] >= w[1]) {
            return Err(ScheduleError::NonIncreasingTimes { index: index + 1 });
        }
        if let Some(index) = cumulative.windows(2).position(|w| w[0] > w[1]) {
            return Err(ScheduleError::DecreasingRewards { index: index + 1 });
        }
        Ok(Self { times, cumulative })
    }

    /// Build a schedule from the rewards still to be emitted at each checkpoint.
    ///
    /// `remaining` must be non-increasing and end at zero, e.g. `[2000, 1000, 500, 250, 0]`.
    pub fn from_remaining(times: Vec<u64>, remaining: Vec<U256>) -> Result<Self, ScheduleError> {
        if let Some(index) = remaining.windows(2).position(|w| w[0] < w[1]) {
            return Err(ScheduleError::IncreasingRemaining { index: index + 1 });
        }
        match remaining.last() {
            Some(last) if !last.is_zero() => {
                return Err(ScheduleError::RemainingNotExhausted(*last))
            }
            _ => {}
        }
        let start = remaining.first().copied().unwrap_or_default();
        // Non-increasing, so none of these can underflow.
        let cumulative = remaining.iter().map(|r| start - *r).collect();
        Self::new(times, cumulative)
    }

    pub fn times(&self) -> &[u64] {
        &self.times
    }

    pub fn cumulative(&self) -> &[U256] {
        &self.cumulative
    }

    pub fn start_time(&self) -> u64 {
        self.times[0]
    }

    pub fn end_time(&self) -> u64 {
        self.times[self.times.len() - 1]
    }

    /// Everything this schedule ever emits. The vault must hold this much for the stream.
    pub fn total_budget(&self) -> U256 {
        self.cumulative[self.cumulative.len() - 1] - self.cumulative[0]
    }

    /// Rewards emitted from the start of the schedule up to `at`.
    pub fn emitted_by(&self, at: u64) -> U256 {
        if at <= self.start_time() {
            return U256::ZERO;
        }
        if at >= self.end_time() {
            return self.total_budget();
        }
        // Index of the first checkpoint after `at`. Always in 1..len here.
        let upper = self.times.partition_point(|t| *t <= at);
        let (t0, t1) = (self.times[upper - 1], self.times[upper]);
        let (c0, c1) = (self.cumulative[upper - 1], self.cumulative[upper]);
        let segment = (c1 - c0) * U256::from(at - t0) / U256::from(t1 - t0);
        c0 - self.cumulative[0] + segment
    }

    /// Rewards emitted in `[from, to]`, clamped to the schedule domain.
    pub fn emission(&self, from: u64, to: u64) -> Result<U256, ScheduleError> {
        if from > to {
            return Err(ScheduleError::InvalidInterval { from, to });
        }
        Ok(self.emitted_by(to) - self.emitted_by(from))
    }

    /// Slope of the segment containing `at`, in reward units per second, rounded down.
    pub fn rate_at(&self, at: u64) -> U256 {
        if at < self.start_time() || at >= self.end_time() {
            return U256::ZERO;
        }
        let upper = self.times.partition_point(|t| *t <= at);
        let span = self.times[upper] - self.times[upper - 1];
        (self.cumulative[upper] - self.cumulative[upper - 1]) / U256::from(span)
    }
}

/// The schedules of every reward stream of one staking instance, indexed by stream id.
#[derive(Debug, Clone, Default)]
pub struct RewardStreamScheduler {
    schedules: Vec<RewardSchedule>,
}

impl RewardStreamScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a schedule and return its stream id.
    pub fn add_stream(&mut self, schedule: RewardSchedule) -> StreamId {
        self.schedules.push(schedule);
        (self.schedules.len() - 1) as StreamId
    }

    pub fn schedule(&self, stream_id: StreamId) -> Result<&RewardSchedule, ScheduleError> {
        usize::try_from(stream_id)
            .ok()
            .and_then(|index| self.schedules.get(index))
            .ok_or(ScheduleError::UnknownStream(stream_id))
    }

    pub fn len(&self) -> usize {
        self.schedules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schedules.is_empty()
    }

    /// Rewards the stream emits between `from_time` and `to_time`.
    pub fn scheduled_emission(
        &self,
        stream_id: StreamId,
        from_time: u64,
        to_time: u64,
    ) -> Result<U256, ScheduleError> {
        self.schedule(stream_id)?.emission(from_time, to_time)
    }

    pub fn instantaneous_rate(
        &self,
        stream_id: StreamId,
        at_time: u64,
    ) -> Result<U256, ScheduleError> {
        Ok(self.schedule(stream_id)?.rate_at(at_time))
    }

    pub fn total_budget(&self, stream_id: StreamId) -> Result<U256, ScheduleError> {
        Ok(self.schedule(stream_id)?.total_budget())
    }
}
