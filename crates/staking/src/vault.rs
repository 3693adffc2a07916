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

//! Custody of whitelisted tokens on behalf of staking instances.
//!
//! The vault keeps its own record of how much of each supported token it holds. Only
//! authorized instances may move tokens in or out, and every batch of movements is checked
//! against the record before being applied to the ledger in one atomic step.

use std::{
    collections::{BTreeMap, HashSet},
    fmt,
    sync::{Arc, Mutex, MutexGuard},
};

use alloy_primitives::{Address, U256};
use thiserror::Error;

use crate::{
    clock::Clock,
    events::{EventLog, Log, Receipt, StakingEvent},
    ledger::{LedgerOp, TokenError, TokenLedger},
    ErrorKind,
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VaultError {
    #[error("Token {0} is not supported by the vault")]
    UnsupportedToken(Address),

    #[error("Token {0} is already supported")]
    AlreadySupported(Address),

    #[error("{0} is not authorized to use the vault")]
    Unauthorized(Address),

    #[error("Insufficient vault balance of {token}: needed {needed}, available {available}")]
    InsufficientVaultBalance { token: Address, needed: U256, available: U256 },

    #[error("Invalid vault operation: {0}")]
    InvalidOperation(&'static str),

    #[error("Ledger error: {0}")]
    Token(#[from] TokenError),

    #[error("Vault lock poisoned")]
    LockPoisoned,
}

impl VaultError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            VaultError::UnsupportedToken(_) | VaultError::InvalidOperation(_) => {
                ErrorKind::Validation
            }
            VaultError::AlreadySupported(_) => ErrorKind::State,
            VaultError::Unauthorized(_) => ErrorKind::Authorization,
            VaultError::InsufficientVaultBalance { .. } => ErrorKind::Resource,
            VaultError::Token(err) => err.kind(),
            VaultError::LockPoisoned => ErrorKind::Internal,
        }
    }
}

#[derive(Debug, Default)]
struct VaultState {
    /// Recorded balance of every supported token.
    balances: BTreeMap<Address, U256>,
    managers: HashSet<Address>,
    authorized: HashSet<Address>,
    events: EventLog,
}

pub struct Vault {
    address: Address,
    admin: Address,
    ledger: Arc<dyn TokenLedger>,
    clock: Arc<dyn Clock>,
    state: Mutex<VaultState>,
}

impl fmt::Debug for Vault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vault").field("address", &self.address).field("admin", &self.admin).finish()
    }
}

impl Vault {
    pub fn new(
        address: Address,
        admin: Address,
        ledger: Arc<dyn TokenLedger>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { address, admin, ledger, clock, state: Mutex::new(VaultState::default()) }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn admin(&self) -> Address {
        self.admin
    }

    pub fn ledger(&self) -> &Arc<dyn TokenLedger> {
        &self.ledger
    }

    /// Enable accounting for `token`. Adding a supported token again is a no-op.
    ///
    /// Returns whether the token was newly added.
    pub fn add_supported_token(
        &self,
        caller: Address,
        token: Address,
    ) -> Result<Receipt<bool>, VaultError> {
        let mut state = self.lock_state()?;
        self.ensure_admin(caller)?;
        if state.balances.contains_key(&token) {
            return Ok(Receipt::new(false, vec![]));
        }
        state.balances.insert(token, U256::ZERO);
        tracing::info!("Vault {} now supports token {}", self.address, token);
        let log = self.log(StakingEvent::TokenSupported { token });
        state.events.push(log.clone());
        Ok(Receipt::new(true, vec![log]))
    }

    /// Like [Vault::add_supported_token], but fails if the token is already supported.
    pub fn add_supported_token_strict(
        &self,
        caller: Address,
        token: Address,
    ) -> Result<Receipt<()>, VaultError> {
        let receipt = self.add_supported_token(caller, token)?;
        if !receipt.output {
            return Err(VaultError::AlreadySupported(token));
        }
        Ok(receipt.map(|_| ()))
    }

    /// Allow `manager` (typically a factory) to authorize instances.
    pub fn add_manager(&self, caller: Address, manager: Address) -> Result<(), VaultError> {
        let mut state = self.lock_state()?;
        self.ensure_admin(caller)?;
        if state.managers.insert(manager) {
            tracing::info!("Vault {} added manager {}", self.address, manager);
        }
        Ok(())
    }

    pub fn authorize(&self, caller: Address, instance: Address) -> Result<Receipt<()>, VaultError> {
        self.authorize_with_funding(caller, instance, &[])
    }

    /// Authorize `instance` and apply its initial deposits as one atomic step.
    ///
    /// `ops` are validated as if `instance` had submitted them. If they fail, the instance is
    /// not authorized.
    pub fn authorize_with_funding(
        &self,
        caller: Address,
        instance: Address,
        ops: &[LedgerOp],
    ) -> Result<Receipt<()>, VaultError> {
        let mut state = self.lock_state()?;
        Self::ensure_manager(&state, self.admin, caller)?;
        let balances = self.plan(&state, ops)?;
        if !ops.is_empty() {
            self.ledger.apply(ops)?;
        }
        state.balances.extend(balances);
        state.authorized.insert(instance);
        tracing::info!("Vault {} authorized instance {}", self.address, instance);
        let log = self.log(StakingEvent::InstanceAuthorized { instance });
        state.events.push(log.clone());
        Ok(Receipt::new((), vec![log]))
    }

    pub fn revoke(&self, caller: Address, instance: Address) -> Result<Receipt<()>, VaultError> {
        let mut state = self.lock_state()?;
        Self::ensure_manager(&state, self.admin, caller)?;
        if !state.authorized.remove(&instance) {
            return Ok(Receipt::new((), vec![]));
        }
        tracing::info!("Vault {} revoked instance {}", self.address, instance);
        let log = self.log(StakingEvent::InstanceRevoked { instance });
        state.events.push(log.clone());
        Ok(Receipt::new((), vec![log]))
    }

    /// Apply a batch of token movements submitted by an authorized instance.
    ///
    /// Transfers to the vault are deposits and transfers from the vault are withdrawals; both
    /// must use supported tokens and withdrawals are bounded by the recorded balance. Transfers
    /// between two other accounts are rejected. Mints and burns (such as voting power) are
    /// passed through to the ledger unless they target a supported token or the vault itself.
    /// Either the whole batch is applied or nothing changes.
    pub fn execute(&self, caller: Address, ops: &[LedgerOp]) -> Result<(), VaultError> {
        let mut state = self.lock_state()?;
        if !state.authorized.contains(&caller) {
            return Err(VaultError::Unauthorized(caller));
        }
        let balances = self.plan(&state, ops)?;
        self.ledger.apply(ops)?;
        tracing::debug!("Vault {} applied {} ops for {}", self.address, ops.len(), caller);
        state.balances.extend(balances);
        Ok(())
    }

    /// Pull `amount` of `token` from `from` into the vault.
    pub fn deposit(
        &self,
        caller: Address,
        token: Address,
        from: Address,
        amount: U256,
    ) -> Result<(), VaultError> {
        self.execute(caller, &[LedgerOp::Transfer { token, from, to: self.address, amount }])
    }

    /// Send `amount` of `token` from the vault to `to`.
    pub fn withdraw(
        &self,
        caller: Address,
        token: Address,
        to: Address,
        amount: U256,
    ) -> Result<(), VaultError> {
        self.execute(caller, &[LedgerOp::Transfer { token, from: self.address, to, amount }])
    }

    /// Recorded balance of a supported token.
    pub fn balance(&self, token: Address) -> Result<U256, VaultError> {
        self.lock_state()?.balances.get(&token).copied().ok_or(VaultError::UnsupportedToken(token))
    }

    pub fn supported_tokens(&self) -> Result<Vec<Address>, VaultError> {
        Ok(self.lock_state()?.balances.keys().copied().collect())
    }

    pub fn is_authorized(&self, instance: Address) -> Result<bool, VaultError> {
        Ok(self.lock_state()?.authorized.contains(&instance))
    }

    pub fn events(&self) -> Result<Vec<Log>, VaultError> {
        Ok(self.lock_state()?.events.events().to_vec())
    }

    pub fn events_since(&self, cursor: usize) -> Result<Vec<Log>, VaultError> {
        Ok(self.lock_state()?.events.events_since(cursor).to_vec())
    }

    /// Compute the recorded balances after `ops`, without changing anything.
    fn plan(
        &self,
        state: &VaultState,
        ops: &[LedgerOp],
    ) -> Result<BTreeMap<Address, U256>, VaultError> {
        let mut balances: BTreeMap<Address, U256> = BTreeMap::new();
        for op in ops {
            match *op {
                LedgerOp::Transfer { token, from, to, amount } => {
                    if from == self.address && to == self.address {
                        return Err(VaultError::InvalidOperation("transfer from vault to itself"));
                    }
                    if to != self.address && from != self.address {
                        return Err(VaultError::InvalidOperation(
                            "transfer does not involve the vault",
                        ));
                    }
                    let current = match balances.get(&token) {
                        Some(balance) => *balance,
                        None => *state
                            .balances
                            .get(&token)
                            .ok_or(VaultError::UnsupportedToken(token))?,
                    };
                    let updated = if to == self.address {
                        current.checked_add(amount).ok_or(TokenError::BalanceOverflow {
                            token,
                            account: self.address,
                        })?
                    } else {
                        current.checked_sub(amount).ok_or(
                            VaultError::InsufficientVaultBalance {
                                token,
                                needed: amount,
                                available: current,
                            },
                        )?
                    };
                    balances.insert(token, updated);
                }
                LedgerOp::Mint { token, .. } | LedgerOp::Burn { token, .. }
                    if state.balances.contains_key(&token) =>
                {
                    return Err(VaultError::InvalidOperation(
                        "custodied token supply cannot change",
                    ));
                }
                LedgerOp::Mint { to: account, .. }
                | LedgerOp::Burn { from: account, .. }
                | LedgerOp::WrapNative { account, .. }
                | LedgerOp::UnwrapNative { account, .. } => {
                    if account == self.address {
                        return Err(VaultError::InvalidOperation(
                            "vault balances only change through transfers",
                        ));
                    }
                }
            }
        }
        Ok(balances)
    }

    fn ensure_admin(&self, caller: Address) -> Result<(), VaultError> {
        if caller != self.admin {
            return Err(VaultError::Unauthorized(caller));
        }
        Ok(())
    }

    fn ensure_manager(
        state: &VaultState,
        admin: Address,
        caller: Address,
    ) -> Result<(), VaultError> {
        if caller != admin && !state.managers.contains(&caller) {
            return Err(VaultError::Unauthorized(caller));
        }
        Ok(())
    }

    fn log(&self, event: StakingEvent) -> Log {
        Log { address: self.address, timestamp: self.clock.now(), event }
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, VaultState>, VaultError> {
        self.state.lock().map_err(|_| VaultError::LockPoisoned)
    }
}
