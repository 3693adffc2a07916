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

//! Test utilities for vestake.
//!
//! [TestCtx] wires an in-memory ledger, a manual clock, a vault and an initialized factory with
//! both staking templates registered, and funds a set of stakers. The default parameters match
//! the FTHM staking deployment: a 365 day lock period and a 2000 token main stream.

use std::sync::Arc;

use alloy_primitives::{address, utils::parse_ether, Address, U256};
use vestake_staking::{
    template_id, Clock, CreateStakingParams, CreateStakingParamsBuilder, InMemoryLedger,
    ManualClock, RewardSchedule, StakingCore, StakingFactory, StakingProperties, StakingTemplate,
    TemplateKind, TokenLedger, Vault, WeightParameters, FTHM_STAKING, NATIVE_TOKEN, XDC_STAKING,
};

pub const ADMIN: Address = address!("0x0000000000000000000000000000000000000a11");
pub const FACTORY: Address = address!("0xfa00000000000000000000000000000000000001");
pub const VAULT: Address = address!("0x7000000000000000000000000000000000000007");
pub const STAKING_IMPLEMENTATION: Address = address!("0x1300000000000000000000000000000000000001");
pub const XDC_STAKING_IMPLEMENTATION: Address =
    address!("0x1300000000000000000000000000000000000002");

pub const MAIN_TOKEN: Address = address!("0x1000000000000000000000000000000000000001");
pub const STREAM_TOKEN: Address = address!("0x1000000000000000000000000000000000000002");
pub const VOTE_TOKEN: Address = address!("0x1000000000000000000000000000000000000003");
/// Wrapped native currency, the base token of native staking instances.
pub const WXDC: Address = address!("0x1000000000000000000000000000000000000004");

pub const STAKERS: [Address; 4] = [
    address!("0xa000000000000000000000000000000000000001"),
    address!("0xa000000000000000000000000000000000000002"),
    address!("0xa000000000000000000000000000000000000003"),
    address!("0xa000000000000000000000000000000000000004"),
];

pub const DAY: u64 = 24 * 60 * 60;
/// Lock period used to normalize voting power.
pub const LOCK_PERIOD: u64 = 365 * DAY;
/// Clock time when a [TestCtx] is created.
pub const START_TIME: u64 = 1_700_000_000;

/// Whole tokens with 18 decimals.
pub fn ether(amount: &str) -> U256 {
    parse_ether(amount).unwrap()
}

pub fn default_weights() -> WeightParameters {
    WeightParameters {
        max_weight_shares: 1024,
        min_weight_shares: 256,
        max_weight_penalty: 3000,
        min_weight_penalty: 100,
        penalty_weight_multiplier: 10,
    }
}

pub fn default_properties() -> StakingProperties {
    StakingProperties { tau: 2, lock_share_coef: 500, lock_period_coef: LOCK_PERIOD, max_locks: 10 }
}

/// Main stream checkpoints, 100 days apart.
pub fn default_schedule_times() -> Vec<u64> {
    (0..5).map(|i| START_TIME + i * 100 * DAY).collect()
}

/// Main stream emitting 1000, 500, 250 and 250 tokens over its four segments.
pub fn default_schedule() -> RewardSchedule {
    RewardSchedule::from_remaining(
        default_schedule_times(),
        ["2000", "1000", "500", "250", "0"].into_iter().map(ether).collect(),
    )
    .unwrap()
}

pub struct TestCtx {
    pub clock: Arc<ManualClock>,
    pub ledger: Arc<InMemoryLedger>,
    pub vault: Arc<Vault>,
    pub factory: Arc<StakingFactory>,
}

impl Default for TestCtx {
    fn default() -> Self {
        Self::new()
    }
}

impl TestCtx {
    pub fn new() -> Self {
        let clock = Arc::new(ManualClock::new(START_TIME));
        let ledger = Arc::new(InMemoryLedger::new());
        let vault = Arc::new(Vault::new(VAULT, ADMIN, ledger.clone(), clock.clone()));
        for token in [MAIN_TOKEN, STREAM_TOKEN, WXDC] {
            vault.add_supported_token(ADMIN, token).unwrap();
        }
        vault.add_manager(ADMIN, FACTORY).unwrap();

        let factory = Arc::new(StakingFactory::new(FACTORY, clock.clone()));
        factory.init_staking_factory(ADMIN).unwrap();
        factory
            .add_staking_template(
                ADMIN,
                template_id(FTHM_STAKING),
                StakingTemplate::new(STAKING_IMPLEMENTATION, TemplateKind::Token),
            )
            .unwrap();
        factory
            .add_staking_template(
                ADMIN,
                template_id(XDC_STAKING),
                StakingTemplate::new(XDC_STAKING_IMPLEMENTATION, TemplateKind::WrappedNative),
            )
            .unwrap();

        for token in [MAIN_TOKEN, STREAM_TOKEN, WXDC] {
            ledger.mint(token, ADMIN, ether("1000000")).unwrap();
        }
        for staker in STAKERS {
            ledger.mint(MAIN_TOKEN, staker, ether("10000")).unwrap();
            ledger.mint(NATIVE_TOKEN, staker, ether("10000")).unwrap();
        }

        Self { clock, ledger, vault, factory }
    }

    /// Parameters for a token-funded instance with the default main stream.
    pub fn params(&self) -> CreateStakingParamsBuilder {
        let schedule = default_schedule();
        let mut builder = CreateStakingParams::builder();
        builder
            .template_id(template_id(FTHM_STAKING))
            .vault(self.vault.clone())
            .base_token(MAIN_TOKEN)
            .voting_token(VOTE_TOKEN)
            .weights(default_weights())
            .rewards_admin(ADMIN)
            .schedule_times(schedule.times().to_vec())
            .schedule_rewards(schedule.cumulative().to_vec())
            .properties(default_properties());
        builder
    }

    pub fn create_instance(&self) -> Arc<StakingCore> {
        self.create_with(&self.params())
    }

    /// An instance taking native currency, with wrapped native as its base token.
    pub fn create_native_instance(&self) -> Arc<StakingCore> {
        let mut builder = self.params();
        builder.template_id(template_id(XDC_STAKING)).base_token(WXDC);
        self.create_with(&builder)
    }

    pub fn create_with(&self, builder: &CreateStakingParamsBuilder) -> Arc<StakingCore> {
        self.factory.create_staking(ADMIN, builder.build().unwrap()).unwrap().output
    }

    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    pub fn advance(&self, secs: u64) -> u64 {
        self.clock.advance(secs)
    }

    pub fn balance(&self, token: Address, account: Address) -> U256 {
        self.ledger.balance_of(token, account).unwrap()
    }

    /// Check that the vault's record matches the ledger and what the instances owe, per token.
    pub fn assert_conservation(&self) {
        let instances = self.factory.instances().unwrap();
        for token in self.vault.supported_tokens().unwrap() {
            let recorded = self.vault.balance(token).unwrap();
            assert_eq!(
                self.balance(token, VAULT),
                recorded,
                "ledger and vault disagree on {token}"
            );
            let owed = instances
                .iter()
                .fold(U256::ZERO, |total, instance| total + instance.liabilities(token).unwrap());
            assert_eq!(owed, recorded, "liabilities and vault balance disagree on {token}");
        }
    }
}
