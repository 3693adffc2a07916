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

//! YAML description of a staking instance.
//!
//! Amounts are written as decimal strings in whole tokens (`"2000"`, `"0.5"`) and converted to
//! base units with 18 decimals.

use std::{path::Path, sync::Arc};

use alloy_primitives::{utils::parse_ether, Address, B256, U256};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::{
    factory::{template_id, CreateStakingParams, StreamParams, FTHM_STAKING},
    schedule::RewardSchedule,
    vault::Vault,
    weights::{StakingProperties, WeightParameters},
};

/// How the reward amounts of a schedule are written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleFormat {
    /// Total emitted by each checkpoint.
    #[default]
    Cumulative,
    /// Still to be emitted at each checkpoint, ending at zero.
    Remaining,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default)]
    pub format: ScheduleFormat,
    pub times: Vec<u64>,
    pub rewards: Vec<String>,
}

impl ScheduleConfig {
    pub fn to_schedule(&self) -> Result<RewardSchedule> {
        let amounts = self.rewards.iter().map(|r| parse_amount(r)).collect::<Result<Vec<_>>>()?;
        let schedule = match self.format {
            ScheduleFormat::Cumulative => RewardSchedule::new(self.times.clone(), amounts),
            ScheduleFormat::Remaining => {
                RewardSchedule::from_remaining(self.times.clone(), amounts)
            }
        };
        Ok(schedule?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub reward_token: Address,
    pub schedule: ScheduleConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakingConfig {
    /// Template name, hashed into the template id.
    #[serde(default = "default_template")]
    pub template: String,
    pub base_token: Address,
    pub voting_token: Address,
    pub rewards_admin: Address,
    pub weights: WeightParameters,
    pub properties: StakingProperties,
    /// Schedule of the main stream, paid in the base token.
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub streams: Vec<StreamConfig>,
}

fn default_template() -> String {
    FTHM_STAKING.to_string()
}

impl StakingConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read staking config {}", path.display()))?;
        Self::from_yaml(&contents)
            .with_context(|| format!("Failed to parse staking config {}", path.display()))
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        serde_yaml::from_str(contents).context("Invalid staking config")
    }

    pub fn template_id(&self) -> B256 {
        template_id(&self.template)
    }

    /// Factory parameters for this config, bound to `vault`.
    pub fn to_params(&self, vault: Arc<Vault>) -> Result<CreateStakingParams> {
        let main = self.schedule.to_schedule().context("Invalid main schedule")?;
        let extra_streams = self
            .streams
            .iter()
            .enumerate()
            .map(|(i, stream)| {
                Ok(StreamParams {
                    reward_token: stream.reward_token,
                    schedule: stream
                        .schedule
                        .to_schedule()
                        .with_context(|| format!("Invalid schedule for stream {}", i + 1))?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(CreateStakingParams::builder()
            .template_id(self.template_id())
            .vault(vault)
            .base_token(self.base_token)
            .voting_token(self.voting_token)
            .weights(self.weights)
            .rewards_admin(self.rewards_admin)
            .schedule_times(main.times().to_vec())
            .schedule_rewards(main.cumulative().to_vec())
            .properties(self.properties)
            .extra_streams(extra_streams)
            .build()?)
    }
}

/// Parse a decimal token amount with 18 decimals.
pub fn parse_amount(value: &str) -> Result<U256> {
    parse_ether(value.trim()).with_context(|| format!("Invalid token amount {value:?}"))
}
