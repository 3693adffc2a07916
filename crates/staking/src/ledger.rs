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

//! Token transfer primitive consumed by the vault.

use std::{
    collections::HashMap,
    fmt::Debug,
    sync::{Mutex, MutexGuard},
};

use alloy_primitives::{Address, U256};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ErrorKind;

/// Pseudo token representing the native currency of the chain.
pub const NATIVE_TOKEN: Address = Address::ZERO;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error(
        "Insufficient balance of {token} for {account}: needed {needed}, available {available}"
    )]
    InsufficientBalance { token: Address, account: Address, needed: U256, available: U256 },

    #[error("Balance overflow of {token} for {account}")]
    BalanceOverflow { token: Address, account: Address },

    #[error("Ledger lock poisoned")]
    LockPoisoned,
}

impl TokenError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TokenError::InsufficientBalance { .. } => ErrorKind::Resource,
            TokenError::BalanceOverflow { .. } | TokenError::LockPoisoned => ErrorKind::Internal,
        }
    }
}

/// A single balance change. Batches of these are applied atomically by [TokenLedger::apply].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum LedgerOp {
    Transfer { token: Address, from: Address, to: Address, amount: U256 },
    Mint { token: Address, to: Address, amount: U256 },
    Burn { token: Address, from: Address, amount: U256 },
    /// Convert `amount` of [NATIVE_TOKEN] held by `account` into the `wrapped` token.
    WrapNative { wrapped: Address, account: Address, amount: U256 },
    /// Convert `amount` of the `wrapped` token held by `account` back into [NATIVE_TOKEN].
    UnwrapNative { wrapped: Address, account: Address, amount: U256 },
}

/// Fungible token balances for any number of tokens.
pub trait TokenLedger: Debug + Send + Sync {
    fn balance_of(&self, token: Address, account: Address) -> Result<U256, TokenError>;

    /// Apply all ops in order. Either every op succeeds or no balance changes.
    fn apply(&self, ops: &[LedgerOp]) -> Result<(), TokenError>;
}

/// [TokenLedger] kept in process memory.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    balances: Mutex<HashMap<(Address, Address), U256>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Credit `amount` of `token` to `to` out of thin air.
    pub fn mint(&self, token: Address, to: Address, amount: U256) -> Result<(), TokenError> {
        self.apply(&[LedgerOp::Mint { token, to, amount }])
    }

    pub fn transfer(
        &self,
        token: Address,
        from: Address,
        to: Address,
        amount: U256,
    ) -> Result<(), TokenError> {
        self.apply(&[LedgerOp::Transfer { token, from, to, amount }])
    }

    fn balances(&self) -> Result<MutexGuard<'_, HashMap<(Address, Address), U256>>, TokenError> {
        self.balances.lock().map_err(|_| TokenError::LockPoisoned)
    }
}

impl TokenLedger for InMemoryLedger {
    fn balance_of(&self, token: Address, account: Address) -> Result<U256, TokenError> {
        Ok(self.balances()?.get(&(token, account)).copied().unwrap_or_default())
    }

    fn apply(&self, ops: &[LedgerOp]) -> Result<(), TokenError> {
        let mut balances = self.balances()?;
        // Stage every change so a failing op leaves the ledger untouched.
        let mut staged = Batch { base: &balances, changes: HashMap::new() };
        for op in ops {
            match *op {
                LedgerOp::Transfer { token, from, to, amount } => {
                    staged.debit(token, from, amount)?;
                    staged.credit(token, to, amount)?;
                }
                LedgerOp::Mint { token, to, amount } => staged.credit(token, to, amount)?,
                LedgerOp::Burn { token, from, amount } => staged.debit(token, from, amount)?,
                LedgerOp::WrapNative { wrapped, account, amount } => {
                    staged.debit(NATIVE_TOKEN, account, amount)?;
                    staged.credit(wrapped, account, amount)?;
                }
                LedgerOp::UnwrapNative { wrapped, account, amount } => {
                    staged.debit(wrapped, account, amount)?;
                    staged.credit(NATIVE_TOKEN, account, amount)?;
                }
            }
        }
        let changes = staged.changes;
        for (key, value) in changes {
            if value.is_zero() {
                balances.remove(&key);
            } else {
                balances.insert(key, value);
            }
        }
        Ok(())
    }
}

struct Batch<'a> {
    base: &'a HashMap<(Address, Address), U256>,
    changes: HashMap<(Address, Address), U256>,
}

impl Batch<'_> {
    fn get(&self, key: (Address, Address)) -> U256 {
        self.changes.get(&key).or_else(|| self.base.get(&key)).copied().unwrap_or_default()
    }

    fn debit(&mut self, token: Address, account: Address, amount: U256) -> Result<(), TokenError> {
        let available = self.get((token, account));
        let remaining = available.checked_sub(amount).ok_or(TokenError::InsufficientBalance {
            token,
            account,
            needed: amount,
            available,
        })?;
        self.changes.insert((token, account), remaining);
        Ok(())
    }

    fn credit(&mut self, token: Address, account: Address, amount: U256) -> Result<(), TokenError> {
        let updated = self
            .get((token, account))
            .checked_add(amount)
            .ok_or(TokenError::BalanceOverflow { token, account })?;
        self.changes.insert((token, account), updated);
        Ok(())
    }
}
