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

//! Registry of staking templates and the instances created from them.

use std::{
    collections::BTreeMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard},
};

use alloy_primitives::{keccak256, Address, B256, U256};
use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    clock::Clock,
    events::{EventLog, Log, Receipt, StakingEvent},
    ledger::{LedgerOp, NATIVE_TOKEN},
    schedule::{RewardSchedule, ScheduleError},
    staking::{InstanceConfig, StakingCore},
    vault::{Vault, VaultError},
    weights::{self, StakingProperties, WeightError, WeightParameters},
    ErrorKind,
};

/// Template name for instances funded with an ERC20-style base token.
pub const FTHM_STAKING: &str = "FTHM_STAKING";

/// Template name for instances funded with native currency, wrapped into the base token.
pub const XDC_STAKING: &str = "XDC_STAKING";

/// Identifier of a named template.
pub fn template_id(name: &str) -> B256 {
    keccak256(name.as_bytes())
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FactoryError {
    #[error("Staking factory is not initialized")]
    NotInitialized,

    #[error("Staking factory is already initialized")]
    AlreadyInitialized,

    #[error("{0} is not the factory owner")]
    Unauthorized(Address),

    #[error("Template {0} already exists")]
    DuplicateTemplate(B256),

    #[error("Unknown template {0}")]
    UnknownTemplate(B256),

    #[error("Invalid schedule: {0}")]
    InvalidSchedule(#[from] ScheduleError),

    #[error("Invalid weights: {0}")]
    InvalidWeightBounds(#[from] WeightError),

    #[error("Voting token {0} is also a native, custodied or reward token")]
    InvalidVotingToken(Address),

    #[error("Vault error: {0}")]
    Vault(#[from] VaultError),

    #[error("Factory lock poisoned")]
    LockPoisoned,
}

impl FactoryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FactoryError::NotInitialized
            | FactoryError::AlreadyInitialized
            | FactoryError::DuplicateTemplate(_)
            | FactoryError::UnknownTemplate(_) => ErrorKind::State,
            FactoryError::Unauthorized(_) => ErrorKind::Authorization,
            FactoryError::InvalidSchedule(err) => err.kind(),
            FactoryError::InvalidWeightBounds(err) => err.kind(),
            FactoryError::InvalidVotingToken(_) => ErrorKind::Validation,
            FactoryError::Vault(err) => err.kind(),
            FactoryError::LockPoisoned => ErrorKind::Internal,
        }
    }
}

/// How an instance takes deposits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateKind {
    /// Deposits are made in the base token.
    Token,
    /// Deposits may also be made in native currency, which is wrapped into the base token.
    WrappedNative,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StakingTemplate {
    pub implementation: Address,
    pub kind: TemplateKind,
}

impl StakingTemplate {
    pub fn new(implementation: Address, kind: TemplateKind) -> Self {
        Self { implementation, kind }
    }
}

/// An additional reward stream to create together with an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamParams {
    pub reward_token: Address,
    pub schedule: RewardSchedule,
}

/// Everything needed to create a staking instance.
#[non_exhaustive]
#[derive(Clone, Debug, Builder)]
pub struct CreateStakingParams {
    pub template_id: B256,
    pub vault: Arc<Vault>,
    pub base_token: Address,
    pub voting_token: Address,
    pub weights: WeightParameters,
    pub rewards_admin: Address,
    /// Checkpoint times of the main stream.
    #[builder(setter(into))]
    pub schedule_times: Vec<u64>,
    /// Cumulative rewards of the main stream at each checkpoint.
    #[builder(setter(into))]
    pub schedule_rewards: Vec<U256>,
    pub properties: StakingProperties,
    #[builder(setter(into), default)]
    pub extra_streams: Vec<StreamParams>,
}

impl CreateStakingParams {
    /// Create a new [CreateStakingParamsBuilder].
    pub fn builder() -> CreateStakingParamsBuilder {
        Default::default()
    }
}

#[derive(Default)]
struct FactoryState {
    owner: Option<Address>,
    templates: BTreeMap<B256, StakingTemplate>,
    instances: BTreeMap<Address, Arc<StakingCore>>,
    /// Instance addresses in creation order.
    created: Vec<Address>,
    events: EventLog,
}

pub struct StakingFactory {
    address: Address,
    clock: Arc<dyn Clock>,
    state: Mutex<FactoryState>,
}

impl fmt::Debug for StakingFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StakingFactory").field("address", &self.address).finish()
    }
}

impl StakingFactory {
    pub fn new(address: Address, clock: Arc<dyn Clock>) -> Self {
        Self { address, clock, state: Mutex::new(FactoryState::default()) }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// One-time setup. The caller becomes the factory owner.
    pub fn init_staking_factory(&self, caller: Address) -> Result<(), FactoryError> {
        let mut state = self.lock_state()?;
        if state.owner.is_some() {
            return Err(FactoryError::AlreadyInitialized);
        }
        state.owner = Some(caller);
        tracing::info!("Staking factory {} initialized by {}", self.address, caller);
        Ok(())
    }

    pub fn owner(&self) -> Result<Option<Address>, FactoryError> {
        Ok(self.lock_state()?.owner)
    }

    pub fn add_staking_template(
        &self,
        caller: Address,
        template_id: B256,
        template: StakingTemplate,
    ) -> Result<Receipt<()>, FactoryError> {
        let mut state = self.lock_state()?;
        Self::ensure_owner(&state, caller)?;
        if state.templates.contains_key(&template_id) {
            return Err(FactoryError::DuplicateTemplate(template_id));
        }
        state.templates.insert(template_id, template);

        let log = Log {
            address: self.address,
            timestamp: self.clock.now(),
            event: StakingEvent::TemplateAdded {
                template_id,
                implementation: template.implementation,
            },
        };
        state.events.push(log.clone());
        tracing::info!(
            "Registered template {} -> {} ({:?})",
            template_id,
            template.implementation,
            template.kind
        );
        Ok(Receipt::new((), vec![log]))
    }

    /// Create, fund and authorize a new staking instance.
    ///
    /// The budgets of all streams are pulled from the rewards admin into the vault in the same
    /// atomic step that authorizes the instance. On any failure no instance exists.
    pub fn create_staking(
        &self,
        caller: Address,
        params: CreateStakingParams,
    ) -> Result<Receipt<Arc<StakingCore>>, FactoryError> {
        let mut state = self.lock_state()?;
        Self::ensure_owner(&state, caller)?;
        let template = *state
            .templates
            .get(&params.template_id)
            .ok_or(FactoryError::UnknownTemplate(params.template_id))?;

        let main = RewardSchedule::new(params.schedule_times, params.schedule_rewards)?;
        weights::validate(&params.weights, &params.properties)?;

        let mut streams = vec![(params.base_token, main)];
        streams.extend(params.extra_streams.into_iter().map(|s| (s.reward_token, s.schedule)));

        let vault = params.vault;
        // Voting power is minted freely, so it must never alias a token that carries value.
        let voting_token = params.voting_token;
        if voting_token == NATIVE_TOKEN
            || streams.iter().any(|(token, _)| *token == voting_token)
            || vault.supported_tokens()?.contains(&voting_token)
        {
            return Err(FactoryError::InvalidVotingToken(voting_token));
        }
        // Every token the instance will move must already be supported.
        vault.balance(params.base_token)?;
        let mut funding = Vec::new();
        for (reward_token, schedule) in &streams {
            vault.balance(*reward_token)?;
            let budget = schedule.total_budget();
            if !budget.is_zero() {
                funding.push(LedgerOp::Transfer {
                    token: *reward_token,
                    from: params.rewards_admin,
                    to: vault.address(),
                    amount: budget,
                });
            }
        }

        let instance = self.address.create(state.created.len() as u64);
        let now = self.clock.now();
        let mut logs = vault.authorize_with_funding(self.address, instance, &funding)?.logs;

        let config = InstanceConfig {
            address: instance,
            template_id: params.template_id,
            kind: template.kind,
            base_token: params.base_token,
            voting_token: params.voting_token,
            rewards_admin: params.rewards_admin,
            weights: params.weights,
            properties: params.properties,
        };
        let stream_count = streams.len();
        let (core, stream_logs) =
            StakingCore::new(config, vault.clone(), self.clock.clone(), streams, now);
        let core = Arc::new(core);
        logs.extend(stream_logs);

        let created = Log {
            address: self.address,
            timestamp: now,
            event: StakingEvent::StakingCreated {
                instance,
                template_id: params.template_id,
                vault: vault.address(),
                base_token: params.base_token,
                voting_token: params.voting_token,
            },
        };
        state.events.push(created.clone());
        logs.push(created);
        state.instances.insert(instance, core.clone());
        state.created.push(instance);

        tracing::info!(
            "Created staking instance {} from template {} with {} streams",
            instance,
            params.template_id,
            stream_count
        );
        Ok(Receipt::new(core, logs))
    }

    pub fn instance(&self, address: Address) -> Result<Option<Arc<StakingCore>>, FactoryError> {
        Ok(self.lock_state()?.instances.get(&address).cloned())
    }

    /// All instances, in creation order.
    pub fn instances(&self) -> Result<Vec<Arc<StakingCore>>, FactoryError> {
        let state = self.lock_state()?;
        Ok(state
            .created
            .iter()
            .filter_map(|address| state.instances.get(address).cloned())
            .collect())
    }

    pub fn template(&self, template_id: B256) -> Result<Option<StakingTemplate>, FactoryError> {
        Ok(self.lock_state()?.templates.get(&template_id).copied())
    }

    pub fn events(&self) -> Result<Vec<Log>, FactoryError> {
        Ok(self.lock_state()?.events.events().to_vec())
    }

    pub fn events_since(&self, cursor: usize) -> Result<Vec<Log>, FactoryError> {
        Ok(self.lock_state()?.events.events_since(cursor).to_vec())
    }

    fn ensure_owner(state: &FactoryState, caller: Address) -> Result<(), FactoryError> {
        match state.owner {
            None => Err(FactoryError::NotInitialized),
            Some(owner) if owner != caller => Err(FactoryError::Unauthorized(caller)),
            Some(_) => Ok(()),
        }
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, FactoryState>, FactoryError> {
        self.state.lock().map_err(|_| FactoryError::LockPoisoned)
    }
}
