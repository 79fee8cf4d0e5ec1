use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::crypto::Address;
use super::transaction::MultiSignatureAsset;

/// Errors that can occur while mutating a single account
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AccountError {
    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: u64, available: i64 },

    #[error("Balance overflow on account {0}")]
    BalanceOverflow(Address),
}

/// Represents a wallet in the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    /// The account's address
    pub address: Address,

    /// Known once the account has signed something
    pub public_key: Option<String>,

    pub second_public_key: Option<String>,

    /// Negative only for genesis wallets
    pub balance: i64,

    /// Public key of the delegate this account votes for
    pub vote: Option<String>,

    /// Sum of balances of every account voting for this one
    pub vote_balance: i64,

    /// Delegate name, set only for registered delegates
    pub username: Option<String>,

    pub multisignature: Option<MultiSignatureAsset>,

    pub produced_blocks: u64,
    pub missed_blocks: u64,
    pub forged_fees: u64,
    pub forged_rewards: u64,

    /// Delegate has resigned and no longer takes part in rounds
    pub resigned: bool,
}

/// Converts an unsigned amount into the signed balance domain
pub fn to_balance(amount: u64) -> Option<i64> {
    i64::try_from(amount).ok()
}

impl Account {
    /// Creates an empty account
    ///
    /// # Arguments
    ///
    /// * `address` - The account's address
    pub fn new(address: Address) -> Self {
        Account {
            address,
            public_key: None,
            second_public_key: None,
            balance: 0,
            vote: None,
            vote_balance: 0,
            username: None,
            multisignature: None,
            produced_blocks: 0,
            missed_blocks: 0,
            forged_fees: 0,
            forged_rewards: 0,
            resigned: false,
        }
    }

    /// Whether a delegate username is registered on this account
    pub fn is_delegate(&self) -> bool {
        self.username.is_some()
    }

    /// A registered delegate that has not resigned
    pub fn is_active_delegate(&self) -> bool {
        self.is_delegate() && !self.resigned
    }

    /// Increases the account's balance
    pub fn credit(&mut self, amount: u64) -> Result<(), AccountError> {
        let amount = to_balance(amount).ok_or_else(|| AccountError::BalanceOverflow(self.address.clone()))?;
        self.balance = self
            .balance
            .checked_add(amount)
            .ok_or_else(|| AccountError::BalanceOverflow(self.address.clone()))?;
        Ok(())
    }

    /// Decreases the account's balance.
    ///
    /// Only `allow_negative` accounts may end up below zero.
    ///
    /// # Arguments
    ///
    /// * `amount` - The amount to subtract
    /// * `allow_negative` - Skip the funds check (genesis distributions,
    ///   forced transactions and reverts)
    pub fn debit(&mut self, amount: u64, allow_negative: bool) -> Result<(), AccountError> {
        let signed = to_balance(amount).ok_or(AccountError::InsufficientFunds {
            required: amount,
            available: self.balance,
        })?;

        let remaining = self
            .balance
            .checked_sub(signed)
            .ok_or_else(|| AccountError::BalanceOverflow(self.address.clone()))?;

        if remaining < 0 && !allow_negative {
            return Err(AccountError::InsufficientFunds {
                required: amount,
                available: self.balance,
            });
        }

        self.balance = remaining;
        Ok(())
    }

    /// Checks if the account could pay `amount`
    pub fn has_sufficient_funds(&self, amount: u64) -> bool {
        matches!(to_balance(amount), Some(amount) if self.balance >= amount)
    }
}
