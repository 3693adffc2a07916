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

//! Timed staking scenarios replayed against an in-memory deployment.

use std::{collections::BTreeSet, path::Path, sync::Arc};

use alloy_primitives::{address, utils::format_ether, Address};
use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};
use vestake_staking::{
    config::parse_amount, template_id, InMemoryLedger, InstanceSummary, Log, LockId, ManualClock,
    StakingConfig, StakingCore, StakingFactory, StakingGettersHelper, StakingTemplate, StreamId,
    TemplateKind, TokenLedger, Vault, FTHM_STAKING, NATIVE_TOKEN, XDC_STAKING,
};

pub const VAULT_ADDRESS: Address = address!("0x7000000000000000000000000000000000000007");
pub const FACTORY_ADDRESS: Address = address!("0xfa00000000000000000000000000000000000001");
const TOKEN_IMPLEMENTATION: Address = address!("0x1300000000000000000000000000000000000001");
const NATIVE_IMPLEMENTATION: Address = address!("0x1300000000000000000000000000000000000002");

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scenario {
    /// Clock time at which the deployment is set up.
    pub start_time: u64,
    /// Vault admin and factory owner.
    pub admin: Address,
    pub staking: StakingConfig,
    /// Balances minted before the instance is created.
    #[serde(default)]
    pub balances: Vec<Balance>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub account: Address,
    /// Token to mint. Defaults to the native currency.
    #[serde(default)]
    pub token: Address,
    pub amount: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    /// Clock time at which the action runs.
    pub at: u64,
    #[serde(flatten)]
    pub action: Action,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    CreateLock { caller: Address, amount: String, unlock_time: u64 },
    CreateLockNative { caller: Address, value: String, unlock_time: u64 },
    ExtendLock { caller: Address, lock_id: LockId, unlock_time: u64 },
    IncreaseLock { caller: Address, lock_id: LockId, amount: String },
    Withdraw { caller: Address, lock_id: LockId },
    ClaimRewards { caller: Address, lock_id: LockId, stream_id: StreamId },
    ClaimAllRewards { caller: Address, lock_id: LockId },
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::CreateLock { .. } => "create_lock",
            Action::CreateLockNative { .. } => "create_lock_native",
            Action::ExtendLock { .. } => "extend_lock",
            Action::IncreaseLock { .. } => "increase_lock",
            Action::Withdraw { .. } => "withdraw",
            Action::ClaimRewards { .. } => "claim_rewards",
            Action::ClaimAllRewards { .. } => "claim_all_rewards",
        }
    }
}

impl Scenario {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read scenario {}", path.display()))?;
        Self::from_yaml(&contents)
            .with_context(|| format!("Failed to parse scenario {}", path.display()))
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        serde_yaml::from_str(contents).context("Invalid scenario")
    }

    /// Steps must not move the clock backwards.
    pub fn validate(&self) -> Result<()> {
        let mut last = self.start_time;
        for (index, step) in self.steps.iter().enumerate() {
            ensure!(
                step.at >= last,
                "Step {index} at {} runs before the previous step at {last}",
                step.at
            );
            last = step.at;
        }
        Ok(())
    }

    /// Tokens the vault must support: the base token and every reward token.
    fn vault_tokens(&self) -> BTreeSet<Address> {
        std::iter::once(self.staking.base_token)
            .chain(self.staking.streams.iter().map(|stream| stream.reward_token))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Failure {
    pub step: usize,
    pub at: u64,
    pub action: &'static str,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccountBalance {
    pub account: Address,
    pub token: Address,
    /// Whole tokens, formatted with 18 decimals.
    pub amount: String,
}

/// Outcome of a scenario run.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    /// Every log emitted, in order, setup included.
    pub logs: Vec<Log>,
    pub failures: Vec<Failure>,
    pub summary: InstanceSummary,
    pub balances: Vec<AccountBalance>,
}

/// An in-memory deployment with one staking instance.
pub struct Simulation {
    clock: Arc<ManualClock>,
    ledger: Arc<InMemoryLedger>,
    instance: Arc<StakingCore>,
    logs: Vec<Log>,
}

impl Simulation {
    pub fn setup(scenario: &Scenario) -> Result<Self> {
        let admin = scenario.admin;
        let clock = Arc::new(ManualClock::new(scenario.start_time));
        let ledger = Arc::new(InMemoryLedger::new());
        let vault = Arc::new(Vault::new(VAULT_ADDRESS, admin, ledger.clone(), clock.clone()));
        let mut logs = Vec::new();

        for token in scenario.vault_tokens() {
            logs.extend(vault.add_supported_token(admin, token)?.logs);
        }
        vault.add_manager(admin, FACTORY_ADDRESS)?;

        let factory = StakingFactory::new(FACTORY_ADDRESS, clock.clone());
        factory.init_staking_factory(admin)?;
        for (name, implementation, kind) in [
            (FTHM_STAKING, TOKEN_IMPLEMENTATION, TemplateKind::Token),
            (XDC_STAKING, NATIVE_IMPLEMENTATION, TemplateKind::WrappedNative),
        ] {
            let template = StakingTemplate::new(implementation, kind);
            logs.extend(factory.add_staking_template(admin, template_id(name), template)?.logs);
        }

        for balance in &scenario.balances {
            let amount = parse_amount(&balance.amount)?;
            ledger.mint(balance.token, balance.account, amount).with_context(|| {
                format!("Failed to mint {} to {}", balance.amount, balance.account)
            })?;
        }

        let params = scenario.staking.to_params(vault.clone())?;
        let receipt =
            factory.create_staking(admin, params).context("Failed to create staking instance")?;
        logs.extend(receipt.logs);
        tracing::info!(
            "Simulating instance {} from {}",
            receipt.output.address(),
            scenario.start_time
        );

        Ok(Self { clock, ledger, instance: receipt.output, logs })
    }

    pub fn instance(&self) -> &Arc<StakingCore> {
        &self.instance
    }

    /// Run one action at the current clock time and return the logs it emitted.
    pub fn apply(&self, action: &Action) -> Result<Vec<Log>> {
        let instance = &self.instance;
        let logs = match action {
            Action::CreateLock { caller, amount, unlock_time } => {
                instance.create_lock(*caller, parse_amount(amount)?, *unlock_time)?.logs
            }
            Action::CreateLockNative { caller, value, unlock_time } => {
                instance.create_lock_native(*caller, *unlock_time, parse_amount(value)?)?.logs
            }
            Action::ExtendLock { caller, lock_id, unlock_time } => {
                instance.extend_lock(*caller, *lock_id, *unlock_time)?.logs
            }
            Action::IncreaseLock { caller, lock_id, amount } => {
                instance.increase_lock(*caller, *lock_id, parse_amount(amount)?)?.logs
            }
            Action::Withdraw { caller, lock_id } => instance.withdraw(*caller, *lock_id)?.logs,
            Action::ClaimRewards { caller, lock_id, stream_id } => {
                instance.claim_rewards(*caller, *lock_id, *stream_id)?.logs
            }
            Action::ClaimAllRewards { caller, lock_id } => {
                instance.claim_all_rewards(*caller, *lock_id)?.logs
            }
        };
        Ok(logs)
    }

    fn report(self, scenario: &Scenario, failures: Vec<Failure>) -> Result<Report> {
        let summary = StakingGettersHelper.get_instance_summary(&self.instance)?;

        let mut tokens = scenario.vault_tokens();
        tokens.insert(self.instance.voting_token());
        tokens.insert(NATIVE_TOKEN);
        let accounts: BTreeSet<Address> =
            scenario.balances.iter().map(|balance| balance.account).collect();
        let mut balances = Vec::new();
        for account in accounts {
            for token in &tokens {
                let amount = self.ledger.balance_of(*token, account)?;
                if !amount.is_zero() {
                    balances.push(AccountBalance {
                        account,
                        token: *token,
                        amount: format_ether(amount),
                    });
                }
            }
        }

        Ok(Report { logs: self.logs, failures, summary, balances })
    }
}

/// Replay `scenario` from scratch. Failing steps are recorded and skipped, unless `fail_fast`
/// is set, in which case the first failure aborts the run.
pub fn run(scenario: &Scenario, fail_fast: bool) -> Result<Report> {
    scenario.validate()?;
    let mut simulation = Simulation::setup(scenario)?;
    let mut failures = Vec::new();

    for (index, step) in scenario.steps.iter().enumerate() {
        simulation.clock.set(step.at);
        let name = step.action.name();
        match simulation.apply(&step.action) {
            Ok(logs) => {
                tracing::debug!("Step {} ({}) emitted {} logs", index, name, logs.len());
                simulation.logs.extend(logs);
            }
            Err(err) if fail_fast => {
                return Err(err.context(format!("Step {index} ({name}) at {} failed", step.at)));
            }
            Err(err) => {
                tracing::warn!("Step {} ({}) at {} failed: {:#}", index, name, step.at, err);
                failures.push(Failure {
                    step: index,
                    at: step.at,
                    action: name,
                    error: format!("{err:#}"),
                });
            }
        }
    }

    simulation.report(scenario, failures)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use alloy_primitives::U256;
    use vestake_staking::StakingEvent;

    pub(crate) const SCENARIO: &str = r#"
start_time: 1700000000
admin: "0x0000000000000000000000000000000000000a11"
staking:
  template: FTHM_STAKING
  base_token: "0x1000000000000000000000000000000000000001"
  voting_token: "0x1000000000000000000000000000000000000003"
  rewards_admin: "0x0000000000000000000000000000000000000a11"
  weights:
    max_weight_shares: 1024
    min_weight_shares: 256
    max_weight_penalty: 3000
    min_weight_penalty: 100
    penalty_weight_multiplier: 10
  properties:
    tau: 2
    lock_share_coef: 500
    lock_period_coef: 31536000
    max_locks: 10
  schedule:
    format: remaining
    times: [1700000000, 1708640000, 1717280000, 1725920000, 1734560000]
    rewards: ["2000", "1000", "500", "250", "0"]
balances:
  - account: "0x0000000000000000000000000000000000000a11"
    token: "0x1000000000000000000000000000000000000001"
    amount: "2000"
  - account: "0xa000000000000000000000000000000000000001"
    token: "0x1000000000000000000000000000000000000001"
    amount: "1000"
  - account: "0xa000000000000000000000000000000000000002"
    token: "0x1000000000000000000000000000000000000001"
    amount: "1000"
steps:
  - at: 1700000000
    action: create_lock
    caller: "0xa000000000000000000000000000000000000001"
    amount: "100"
    unlock_time: 1731536000
  - at: 1700000000
    action: create_lock
    caller: "0xa000000000000000000000000000000000000002"
    amount: "200"
    unlock_time: 1731536000
  - at: 1704320000
    action: claim_all_rewards
    caller: "0xa000000000000000000000000000000000000001"
    lock_id: 1
  - at: 1704320000
    action: withdraw
    caller: "0xa000000000000000000000000000000000000002"
    lock_id: 2
  - at: 1704320000
    action: withdraw
    caller: "0xa000000000000000000000000000000000000002"
    lock_id: 2
  - at: 1708640000
    action: claim_rewards
    caller: "0xa000000000000000000000000000000000000001"
    lock_id: 1
    stream_id: 0
"#;

    const BOB: Address = address!("0xa000000000000000000000000000000000000002");

    #[test]
    fn parses_steps() {
        let scenario = Scenario::from_yaml(SCENARIO).unwrap();
        assert_eq!(scenario.steps.len(), 6);
        assert_eq!(scenario.steps[3].action, Action::Withdraw { caller: BOB, lock_id: 2 });
        assert_eq!(scenario.steps[5].action.name(), "claim_rewards");
        assert_eq!(scenario.balances[0].amount, "2000");
    }

    #[test]
    fn replays_steps_and_records_failures() {
        let scenario = Scenario::from_yaml(SCENARIO).unwrap();
        let report = run(&scenario, false).unwrap();

        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].step, 4);
        assert_eq!(report.failures[0].action, "withdraw");
        assert!(report.failures[0].error.contains("already withdrawn"));

        // Setup: token support, two templates, authorization, main stream, instance creation.
        assert_eq!(report.logs.len(), 11);
        assert!(matches!(report.logs[5].event, StakingEvent::StakingCreated { .. }));
        let withdrawn = report
            .logs
            .iter()
            .find_map(|log| match log.event {
                StakingEvent::LockWithdrawn { penalty, .. } => Some(penalty),
                _ => None,
            })
            .unwrap();
        assert!(withdrawn > U256::ZERO);

        assert_eq!(report.summary.lock_count, 2);
        assert_eq!(report.summary.active_lock_count, 1);
        let base = scenario.staking.base_token;
        assert!(report.balances.iter().any(|b| b.account == BOB && b.token == base));
        assert!(!report.balances.iter().any(|b| b.token == NATIVE_TOKEN));
    }

    #[test]
    fn fail_fast_stops_at_first_failure() {
        let scenario = Scenario::from_yaml(SCENARIO).unwrap();
        let err = run(&scenario, true).unwrap_err();
        let message = format!("{err:#}");
        assert!(message.contains("Step 4 (withdraw)"));
        assert!(message.contains("already withdrawn"));
    }

    #[test]
    fn rejects_steps_out_of_order() {
        let mut scenario = Scenario::from_yaml(SCENARIO).unwrap();
        scenario.steps.swap(1, 2);
        let err = run(&scenario, false).unwrap_err();
        assert!(err.to_string().contains("runs before the previous step"));
    }
}
