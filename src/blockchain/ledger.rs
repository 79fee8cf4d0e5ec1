//! The wallet manager: applies and reverts transactions and blocks against
//! in-memory account state.

use dashmap::{DashMap, DashSet};
use log::{debug, warn};
use thiserror::Error;

use std::collections::HashSet;
use std::sync::Arc;

use super::account::{to_balance, Account, AccountError};
use super::block::Block;
use super::codec::decode_hex;
use super::crypto::{is_public_key, Address, CryptoError};
use super::transaction::{Asset, Transaction, TransactionError, Vote};
use crate::config::NetworkConfig;

/// Height of the genesis block
pub const GENESIS_HEIGHT: u64 = 1;

const MAX_USERNAME_LENGTH: usize = 20;
const MAX_KEYSGROUP: usize = 16;
const MAX_MULTISIGNATURE_LIFETIME: u8 = 72;

/// Errors raised when a transaction or block cannot be applied
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("Account error: {0}")]
    Account(#[from] AccountError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Transaction error: {0}")]
    Transaction(#[from] TransactionError),

    #[error("Insufficient funds on {address}: required {required}, available {available}")]
    InsufficientFunds {
        address: Address,
        required: u64,
        available: i64,
    },

    #[error("Delegate name {0} is already taken")]
    DuplicateDelegateName(String),

    #[error("Invalid delegate name {0:?}")]
    InvalidUsername(String),

    #[error("Account {0} is already a delegate")]
    AlreadyDelegate(Address),

    #[error("Account {0} is not a delegate")]
    NotADelegate(Address),

    #[error("Vote for unknown delegate {0}")]
    UnknownDelegateVote(String),

    #[error("Vote for resigned delegate {0}")]
    ResignedDelegateVote(String),

    #[error("Invalid vote: {0}")]
    InvalidVote(String),

    #[error("Transaction {0} is missing the second signature")]
    MissingSecondSignature(String),

    #[error("Transaction {0} has an invalid second signature")]
    SecondSignatureInvalid(String),

    #[error("Transaction {0} carries a second signature the wallet does not allow")]
    UnexpectedSecondSignature(String),

    #[error("Account {0} already has a second signature")]
    AlreadyHasSecondSignature(Address),

    #[error("Transaction {0} lacks the multi-signature quorum")]
    MultiSignatureQuorum(String),

    #[error("Account {0} is already a multi-signature wallet")]
    AlreadyMultiSignature(Address),

    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),

    #[error("Invalid asset: {0}")]
    InvalidAsset(String),

    #[error("Transaction for network {actual}, expected {expected}")]
    WrongNetwork { expected: u8, actual: u8 },

    #[error("Block generator {0} is not an active delegate")]
    UnknownGenerator(String),

    #[error("Vote balance overflow on delegate {0}")]
    VoteBalanceOverflow(String),
}

/// Accounts touched by one operation, committed together once every
/// mutation has succeeded
struct Staging<'a> {
    ledger: &'a Ledger,
    accounts: Vec<Account>,
}

impl<'a> Staging<'a> {
    fn new(ledger: &'a Ledger) -> Self {
        Staging {
            ledger,
            accounts: Vec::new(),
        }
    }

    fn get(&mut self, address: &Address) -> &mut Account {
        let index = match self.accounts.iter().position(|a| &a.address == address) {
            Some(index) => index,
            None => {
                self.accounts.push(self.ledger.find_by_address(address));
                self.accounts.len() - 1
            }
        };
        &mut self.accounts[index]
    }

    fn get_by_public_key(&mut self, public_key: &str) -> Result<&mut Account, LedgerError> {
        let address = Address::from_public_key(public_key, self.ledger.config.version)?;
        let account = self.get(&address);
        if account.public_key.is_none() {
            account.public_key = Some(public_key.to_string());
        }
        Ok(account)
    }

    /// Writes the staged accounts back. Vote balances are only ever moved
    /// by `reweigh`, so the staged copy never overwrites them.
    fn commit(self) -> Result<(), LedgerError> {
        let Staging { ledger, accounts } = self;
        for mut next in accounts {
            let current = ledger.find_by_address(&next.address);
            next.vote_balance = current.vote_balance;
            ledger.save(next.clone());
            ledger.reweigh(&current, &next)?;
        }
        Ok(())
    }
}

/// Owns every wallet. Cloning produces an independent copy, used as a
/// scratch ledger when validating pool batches.
#[derive(Debug, Clone)]
pub struct Ledger {
    config: Arc<NetworkConfig>,
    accounts: DashMap<Address, Account>,
    usernames: DashMap<String, Address>,
    dirty: DashSet<Address>,
}

impl Ledger {
    pub fn new(config: Arc<NetworkConfig>) -> Self {
        Ledger {
            config,
            accounts: DashMap::new(),
            usernames: DashMap::new(),
            dirty: DashSet::new(),
        }
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Replaces the whole state with `accounts`, rebuilding the name index
    pub fn load(&self, accounts: Vec<Account>) {
        self.accounts.clear();
        self.usernames.clear();
        self.dirty.clear();
        for account in accounts {
            if let Some(username) = &account.username {
                self.usernames
                    .insert(username.clone(), account.address.clone());
            }
            self.accounts.insert(account.address.clone(), account);
        }
    }

    /// Gets an account by address, or a fresh one if it was never touched
    pub fn find_by_address(&self, address: &Address) -> Account {
        if let Some(account) = self.accounts.get(address) {
            account.clone()
        } else {
            Account::new(address.clone())
        }
    }

    /// Gets an account by public key, filling in the key on fresh accounts
    pub fn find_by_public_key(&self, public_key: &str) -> Result<Account, LedgerError> {
        let address = Address::from_public_key(public_key, self.config.version)?;
        let mut account = self.find_by_address(&address);
        if account.public_key.is_none() {
            account.public_key = Some(public_key.to_string());
        }
        Ok(account)
    }

    pub fn find_by_username(&self, username: &str) -> Option<Account> {
        let address = self.usernames.get(username)?.clone();
        Some(self.find_by_address(&address))
    }

    fn save(&self, account: Account) {
        self.dirty.insert(account.address.clone());
        self.accounts.insert(account.address.clone(), account);
    }

    /// Every account that has been touched
    pub fn accounts(&self) -> Vec<Account> {
        self.accounts.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Every registered delegate, resigned ones included
    pub fn delegates(&self) -> Vec<Account> {
        self.accounts
            .iter()
            .filter(|entry| entry.value().is_delegate())
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Active delegates by vote balance descending, public key ascending
    pub fn top_delegates(&self, limit: usize) -> Vec<Account> {
        let mut delegates: Vec<Account> = self
            .accounts
            .iter()
            .filter(|entry| entry.value().is_active_delegate())
            .map(|entry| entry.value().clone())
            .collect();
        delegates.sort_by(|a, b| {
            b.vote_balance
                .cmp(&a.vote_balance)
                .then_with(|| a.public_key.cmp(&b.public_key))
        });
        delegates.truncate(limit);
        delegates
    }

    pub fn total_balance(&self) -> i128 {
        self.accounts
            .iter()
            .map(|entry| entry.value().balance as i128)
            .sum()
    }

    /// Drains the set of accounts changed since the last call
    pub fn take_dirty(&self) -> Vec<Account> {
        let addresses: Vec<Address> = self.dirty.iter().map(|a| a.key().clone()).collect();
        addresses
            .into_iter()
            .filter_map(|address| {
                self.dirty.remove(&address);
                self.accounts.get(&address).map(|a| a.clone())
            })
            .collect()
    }

    /// Moves `before`'s weight off its old delegate and `after`'s weight onto
    /// its new one
    fn reweigh(&self, before: &Account, after: &Account) -> Result<(), LedgerError> {
        if before.vote == after.vote && before.balance == after.balance {
            return Ok(());
        }
        if let Some(delegate) = &before.vote {
            self.adjust_vote_balance(delegate, before.balance.checked_neg())?;
        }
        if let Some(delegate) = &after.vote {
            self.adjust_vote_balance(delegate, Some(after.balance))?;
        }
        Ok(())
    }

    fn adjust_vote_balance(&self, delegate: &str, delta: Option<i64>) -> Result<(), LedgerError> {
        let mut account = self.find_by_public_key(delegate)?;
        account.vote_balance = delta
            .and_then(|delta| account.vote_balance.checked_add(delta))
            .ok_or_else(|| LedgerError::VoteBalanceOverflow(delegate.to_string()))?;
        self.save(account);
        Ok(())
    }

    /// Adds or removes one missed block on a delegate
    pub fn record_missed_block(&self, public_key: &str, missed: bool) -> Result<(), LedgerError> {
        let mut account = self.find_by_public_key(public_key)?;
        account.missed_blocks = if missed {
            account.missed_blocks + 1
        } else {
            account.missed_blocks.saturating_sub(1)
        };
        self.save(account);
        Ok(())
    }

    /// Forced transactions, and genesis wallets while the genesis block is
    /// applied, may take the sender below zero
    fn may_overdraw(&self, transaction: &Transaction, height: u64) -> bool {
        self.config.exceptions.is_forced_transaction(&transaction.id)
            || (height == GENESIS_HEIGHT
                && self.config.is_genesis_wallet(&transaction.sender_public_key))
    }

    /// Checks every rule `transaction` must satisfy against current state
    /// when included in the block at `height`. Nothing is mutated.
    pub fn can_apply(&self, transaction: &Transaction, height: u64) -> Result<(), LedgerError> {
        if self.config.exceptions.is_forced_transaction(&transaction.id) {
            debug!("Transaction {} is forced, skipping checks", transaction.id);
            return Ok(());
        }

        if transaction.network != self.config.version {
            return Err(LedgerError::WrongNetwork {
                expected: self.config.version,
                actual: transaction.network,
            });
        }

        let sender = self.find_by_public_key(&transaction.sender_public_key)?;
        self.check_signatures(&sender, transaction)?;

        let debit = transaction.total_debit()?;
        if !self.may_overdraw(transaction, height) && !sender.has_sufficient_funds(debit) {
            return Err(LedgerError::InsufficientFunds {
                address: sender.address.clone(),
                required: debit,
                available: sender.balance,
            });
        }

        match &transaction.asset {
            Asset::Transfer { .. } => self.check_recipient(transaction.recipient_id.as_ref()),
            Asset::TimelockTransfer { timelock_type, .. } => {
                if *timelock_type > 1 {
                    return Err(LedgerError::InvalidAsset(format!(
                        "unknown timelock type {}",
                        timelock_type
                    )));
                }
                self.check_recipient(transaction.recipient_id.as_ref())
            }
            Asset::MultiPayment { payments } => {
                if payments.is_empty() {
                    return Err(LedgerError::InvalidAsset("empty multi-payment".to_string()));
                }
                let mut sum: u64 = 0;
                for payment in payments {
                    self.check_recipient(Some(&payment.recipient_id))?;
                    sum = sum
                        .checked_add(payment.amount)
                        .ok_or(TransactionError::AmountOverflow)?;
                }
                if sum != transaction.amount {
                    return Err(LedgerError::InvalidAsset(format!(
                        "payments sum to {} but amount is {}",
                        sum, transaction.amount
                    )));
                }
                Ok(())
            }
            Asset::SecondSignature { public_key } => {
                if sender.second_public_key.is_some() {
                    return Err(LedgerError::AlreadyHasSecondSignature(sender.address));
                }
                if !is_public_key(public_key) {
                    return Err(CryptoError::InvalidPublicKey(public_key.clone()).into());
                }
                Ok(())
            }
            Asset::DelegateRegistration { username } => {
                if sender.is_delegate() {
                    return Err(LedgerError::AlreadyDelegate(sender.address));
                }
                if !is_valid_username(username) {
                    return Err(LedgerError::InvalidUsername(username.clone()));
                }
                if self.usernames.contains_key(username) {
                    return Err(LedgerError::DuplicateDelegateName(username.clone()));
                }
                Ok(())
            }
            Asset::Vote { votes } => self.check_vote(&sender, votes),
            Asset::MultiSignature(multi) => {
                if sender.multisignature.is_some() {
                    return Err(LedgerError::AlreadyMultiSignature(sender.address));
                }
                let distinct: HashSet<&String> = multi.keysgroup.iter().collect();
                if multi.keysgroup.is_empty()
                    || multi.keysgroup.len() > MAX_KEYSGROUP
                    || distinct.len() != multi.keysgroup.len()
                {
                    return Err(LedgerError::InvalidAsset(
                        "keysgroup must hold 1 to 16 distinct keys".to_string(),
                    ));
                }
                if multi.min == 0 || multi.min as usize > multi.keysgroup.len() {
                    return Err(LedgerError::InvalidAsset(format!(
                        "min {} outside 1..={}",
                        multi.min,
                        multi.keysgroup.len()
                    )));
                }
                if multi.lifetime == 0 || multi.lifetime > MAX_MULTISIGNATURE_LIFETIME {
                    return Err(LedgerError::InvalidAsset(format!(
                        "lifetime {} outside 1..={}",
                        multi.lifetime, MAX_MULTISIGNATURE_LIFETIME
                    )));
                }
                if !transaction.verify_multi_signatures(&multi.keysgroup, multi.min)? {
                    return Err(LedgerError::MultiSignatureQuorum(transaction.id.clone()));
                }
                Ok(())
            }
            Asset::Ipfs { dag } => {
                let bytes = decode_hex("dag", dag)
                    .map_err(|e| LedgerError::InvalidAsset(e.to_string()))?;
                if bytes.is_empty() || bytes.len() > u8::MAX as usize {
                    return Err(LedgerError::InvalidAsset(format!(
                        "dag of {} bytes",
                        bytes.len()
                    )));
                }
                Ok(())
            }
            Asset::DelegateResignation => {
                if !sender.is_active_delegate() {
                    return Err(LedgerError::NotADelegate(sender.address));
                }
                Ok(())
            }
        }
    }

    fn check_signatures(&self, sender: &Account, transaction: &Transaction) -> Result<(), LedgerError> {
        match &sender.second_public_key {
            Some(second_public_key) => {
                if transaction.second_signature.is_none() {
                    return Err(LedgerError::MissingSecondSignature(transaction.id.clone()));
                }
                if !transaction.verify_second_signature(second_public_key)? {
                    return Err(LedgerError::SecondSignatureInvalid(transaction.id.clone()));
                }
            }
            None => {
                if transaction.second_signature.is_some() {
                    return Err(LedgerError::UnexpectedSecondSignature(transaction.id.clone()));
                }
            }
        }

        if let Some(multi) = &sender.multisignature {
            if !transaction.verify_multi_signatures(&multi.keysgroup, multi.min)? {
                return Err(LedgerError::MultiSignatureQuorum(transaction.id.clone()));
            }
        }
        Ok(())
    }

    fn check_recipient(&self, recipient: Option<&Address>) -> Result<(), LedgerError> {
        match recipient {
            Some(recipient) if recipient.is_valid(self.config.version) => Ok(()),
            Some(recipient) => Err(LedgerError::InvalidRecipient(recipient.to_string())),
            None => Err(LedgerError::InvalidRecipient("missing".to_string())),
        }
    }

    fn check_vote(&self, sender: &Account, votes: &[Vote]) -> Result<(), LedgerError> {
        let vote = match votes {
            [vote] => vote,
            _ => {
                return Err(LedgerError::InvalidVote(format!(
                    "expected exactly one vote, got {}",
                    votes.len()
                )))
            }
        };

        match vote {
            Vote::Add(delegate) => {
                if let Some(current) = &sender.vote {
                    return Err(LedgerError::InvalidVote(format!(
                        "{} already votes for {}",
                        sender.address, current
                    )));
                }
                let target = self.find_by_public_key(delegate)?;
                if !target.is_delegate() {
                    return Err(LedgerError::UnknownDelegateVote(delegate.clone()));
                }
                if target.resigned {
                    return Err(LedgerError::ResignedDelegateVote(delegate.clone()));
                }
            }
            Vote::Remove(delegate) => {
                if sender.vote.as_deref() != Some(delegate.as_str()) {
                    return Err(LedgerError::InvalidVote(format!(
                        "{} does not vote for {}",
                        sender.address, delegate
                    )));
                }
            }
        }
        Ok(())
    }

    /// Validates and applies one transaction of the block at `height`.
    /// On error nothing is mutated.
    pub fn apply_transaction(&self, transaction: &Transaction, height: u64) -> Result<(), LedgerError> {
        self.can_apply(transaction, height)?;

        let overdraw = self.may_overdraw(transaction, height);
        let mut staging = Staging::new(self);
        let sender = staging.get_by_public_key(&transaction.sender_public_key)?;
        sender.debit(transaction.total_debit()?, overdraw)?;

        match &transaction.asset {
            Asset::SecondSignature { public_key } => {
                sender.second_public_key = Some(public_key.clone());
            }
            Asset::DelegateRegistration { username } => {
                sender.username = Some(username.clone());
            }
            Asset::Vote { votes } => {
                for vote in votes {
                    sender.vote = match vote {
                        Vote::Add(delegate) => Some(delegate.clone()),
                        Vote::Remove(_) => None,
                    };
                }
            }
            Asset::MultiSignature(multi) => {
                sender.multisignature = Some(multi.clone());
            }
            Asset::DelegateResignation => {
                sender.resigned = true;
            }
            Asset::Transfer { .. }
            | Asset::TimelockTransfer { .. }
            | Asset::MultiPayment { .. }
            | Asset::Ipfs { .. } => {}
        }

        for (recipient, amount) in transaction.credits() {
            staging.get(&recipient).credit(amount)?;
        }

        let sender_address = Address::from_public_key(&transaction.sender_public_key, self.config.version)?;
        staging.commit()?;

        if let Asset::DelegateRegistration { username } = &transaction.asset {
            self.usernames.insert(username.clone(), sender_address);
        }

        Ok(())
    }

    /// Exact inverse of `apply_transaction`
    pub fn revert_transaction(&self, transaction: &Transaction) -> Result<(), LedgerError> {
        let mut staging = Staging::new(self);

        for (recipient, amount) in transaction.credits() {
            staging.get(&recipient).debit(amount, true)?;
        }

        let sender = staging.get_by_public_key(&transaction.sender_public_key)?;
        sender.credit(transaction.total_debit()?)?;

        match &transaction.asset {
            Asset::SecondSignature { .. } => {
                sender.second_public_key = None;
            }
            Asset::DelegateRegistration { .. } => {
                sender.username = None;
            }
            Asset::Vote { votes } => {
                for vote in votes.iter().rev() {
                    sender.vote = match vote {
                        Vote::Add(_) => None,
                        Vote::Remove(delegate) => Some(delegate.clone()),
                    };
                }
            }
            Asset::MultiSignature(_) => {
                sender.multisignature = None;
            }
            Asset::DelegateResignation => {
                sender.resigned = false;
            }
            Asset::Transfer { .. }
            | Asset::TimelockTransfer { .. }
            | Asset::MultiPayment { .. }
            | Asset::Ipfs { .. } => {}
        }

        staging.commit()?;

        if let Asset::DelegateRegistration { username } = &transaction.asset {
            self.usernames.remove(username);
        }

        Ok(())
    }

    /// Applies every transaction of `block` in order, then pays the
    /// generator. A failing transaction reverts the ones already applied
    /// before the error is returned.
    pub fn apply_block(&self, block: &Block) -> Result<(), LedgerError> {
        if block.height != GENESIS_HEIGHT {
            let generator = self.find_by_public_key(&block.generator_public_key)?;
            if !generator.is_active_delegate() {
                return Err(LedgerError::UnknownGenerator(
                    block.generator_public_key.clone(),
                ));
            }
        }

        let mut applied: Vec<&Transaction> = Vec::with_capacity(block.transactions.len());
        for transaction in &block.transactions {
            if let Err(e) = self.apply_transaction(transaction, block.height) {
                warn!(
                    "Failed to apply transaction {} of block {}: {}",
                    transaction.id, block.id, e
                );
                for done in applied.iter().rev() {
                    self.revert_transaction(done)?;
                }
                return Err(e);
            }
            applied.push(transaction);
        }

        if let Err(e) = self.apply_forging(block) {
            for done in applied.iter().rev() {
                self.revert_transaction(done)?;
            }
            return Err(e);
        }

        Ok(())
    }

    /// Exact inverse of `apply_block`
    pub fn revert_block(&self, block: &Block) -> Result<(), LedgerError> {
        self.revert_forging(block)?;

        let mut reverted: Vec<&Transaction> = Vec::with_capacity(block.transactions.len());
        for transaction in block.transactions.iter().rev() {
            if let Err(e) = self.revert_transaction(transaction) {
                warn!(
                    "Failed to revert transaction {} of block {}: {}",
                    transaction.id, block.id, e
                );
                for done in reverted.iter().rev() {
                    self.apply_transaction(done, block.height)?;
                }
                self.apply_forging(block)?;
                return Err(e);
            }
            reverted.push(transaction);
        }

        Ok(())
    }

    fn apply_forging(&self, block: &Block) -> Result<(), LedgerError> {
        let earned = block
            .reward
            .checked_add(block.total_fee)
            .ok_or(TransactionError::AmountOverflow)?;
        to_balance(earned).ok_or(TransactionError::AmountOverflow)?;

        let mut staging = Staging::new(self);
        let generator = staging.get_by_public_key(&block.generator_public_key)?;
        generator.credit(earned)?;
        generator.produced_blocks += 1;
        generator.forged_fees += block.total_fee;
        generator.forged_rewards += block.reward;
        staging.commit()
    }

    fn revert_forging(&self, block: &Block) -> Result<(), LedgerError> {
        let earned = block
            .reward
            .checked_add(block.total_fee)
            .ok_or(TransactionError::AmountOverflow)?;

        let mut staging = Staging::new(self);
        let generator = staging.get_by_public_key(&block.generator_public_key)?;
        generator.debit(earned, true)?;
        generator.produced_blocks = generator.produced_blocks.saturating_sub(1);
        generator.forged_fees = generator.forged_fees.saturating_sub(block.total_fee);
        generator.forged_rewards = generator.forged_rewards.saturating_sub(block.reward);
        staging.commit()
    }
}

/// Lowercase letters, digits and `!@$&_.`, at most 20 characters
fn is_valid_username(username: &str) -> bool {
    !username.is_empty()
        && username.len() <= MAX_USERNAME_LENGTH
        && username
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "!@$&_.".contains(c))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::crypto::Keys;
    use crate::blockchain::genesis::{testnet, Testnet};
    use crate::blockchain::transaction::{MultiSignatureAsset, Payment};

    fn keys(passphrase: &str) -> Keys {
        Keys::from_passphrase(passphrase).unwrap()
    }

    /// A ledger with the testnet genesis applied
    fn ledger() -> (Testnet, Ledger) {
        let network = testnet();
        let ledger = Ledger::new(Arc::new(network.config.clone()));
        ledger.apply_block(&network.config.genesis_block).unwrap();
        (network, ledger)
    }

    /// Pays `amount` to `to` out of the last testnet delegate's funding
    fn fund(ledger: &Ledger, network: &Testnet, to: &Keys, amount: u64) {
        let funder = &network.delegates[network.delegates.len() - 1];
        let mut transfer = Transaction::transfer(
            network.config.version,
            1,
            funder.public_key(),
            to.address(network.config.version),
            amount,
            0,
        );
        transfer.sign(funder).unwrap();
        ledger.apply_transaction(&transfer, 2).unwrap();
    }

    fn signed(network: &Testnet, sender: &Keys, fee: u64, asset: Asset) -> Transaction {
        let mut transaction =
            Transaction::new(network.config.version, 10, sender.public_key(), fee, asset);
        transaction.sign(sender).unwrap();
        transaction
    }

    fn transfer(network: &Testnet, sender: &Keys, to: &Keys, amount: u64, fee: u64) -> Transaction {
        let mut transaction = Transaction::transfer(
            network.config.version,
            10,
            sender.public_key(),
            to.address(network.config.version),
            amount,
            fee,
        );
        transaction.sign(sender).unwrap();
        transaction
    }

    fn balance(ledger: &Ledger, keys: &Keys) -> i64 {
        ledger.find_by_public_key(keys.public_key()).unwrap().balance
    }

    #[test]
    fn test_genesis_sets_up_delegates() {
        let (network, ledger) = ledger();
        let delegates = ledger.top_delegates(100);
        assert_eq!(delegates.len(), network.delegates.len());
        for delegate in &delegates {
            assert!(delegate.vote_balance > 0);
        }
        assert!(ledger.find_by_username("genesis_1").is_some());
        assert!(balance(&ledger, &network.genesis_keys) < 0);
        assert_eq!(ledger.total_balance(), 0);
    }

    #[test]
    fn test_insufficient_funds_mutates_nothing() {
        let (network, ledger) = ledger();
        let poor = keys("poor");
        let rich = keys("recipient");
        fund(&ledger, &network, &poor, 50);

        let before_sender = ledger.find_by_public_key(poor.public_key()).unwrap();
        let before_recipient = ledger.find_by_public_key(rich.public_key()).unwrap();

        let result = ledger.apply_transaction(&transfer(&network, &poor, &rich, 100, 10), 2);
        assert!(matches!(
            result,
            Err(LedgerError::InsufficientFunds {
                required: 110,
                available: 50,
                ..
            })
        ));
        assert_eq!(ledger.find_by_public_key(poor.public_key()).unwrap(), before_sender);
        assert_eq!(ledger.find_by_public_key(rich.public_key()).unwrap(), before_recipient);
    }

    #[test]
    fn test_genesis_wallet_cannot_overdraw_after_genesis() {
        let (network, ledger) = ledger();
        let genesis = &network.genesis_keys;
        let before = balance(&ledger, genesis);
        assert!(before < 0);

        let overdraft = transfer(&network, genesis, &keys("bob"), 1_000_000_000_000, 10_000_000);
        assert!(matches!(
            ledger.can_apply(&overdraft, 2),
            Err(LedgerError::InsufficientFunds { .. })
        ));
        assert!(matches!(
            ledger.apply_transaction(&overdraft, 2),
            Err(LedgerError::InsufficientFunds { .. })
        ));
        assert_eq!(balance(&ledger, genesis), before);
        assert_eq!(balance(&ledger, &keys("bob")), 0);

        // Only the genesis block itself may take the wallet below zero
        assert!(ledger.can_apply(&overdraft, GENESIS_HEIGHT).is_ok());
    }

    #[test]
    fn test_transfer_apply_and_revert() {
        let (network, ledger) = ledger();
        let alice = keys("alice");
        let bob = keys("bob");
        fund(&ledger, &network, &alice, 1_000);

        let before_alice = ledger.find_by_public_key(alice.public_key()).unwrap();
        let before_bob = ledger.find_by_public_key(bob.public_key()).unwrap();

        let transaction = transfer(&network, &alice, &bob, 100, 10);
        ledger.apply_transaction(&transaction, 2).unwrap();
        assert_eq!(balance(&ledger, &alice), 890);
        assert_eq!(balance(&ledger, &bob), 100);

        ledger.revert_transaction(&transaction).unwrap();
        assert_eq!(ledger.find_by_public_key(alice.public_key()).unwrap(), before_alice);
        assert_eq!(ledger.find_by_public_key(bob.public_key()).unwrap(), before_bob);
    }

    #[test]
    fn test_vote_moves_weight() {
        let (network, ledger) = ledger();
        let voter = keys("voter");
        let delegate = &network.delegates[0];
        fund(&ledger, &network, &voter, 1_000);

        let before = ledger.find_by_public_key(delegate.public_key()).unwrap().vote_balance;
        let vote = signed(
            &network,
            &voter,
            10,
            Asset::Vote {
                votes: vec![Vote::Add(delegate.public_key().to_string())],
            },
        );
        ledger.apply_transaction(&vote, 2).unwrap();
        let after = ledger.find_by_public_key(delegate.public_key()).unwrap().vote_balance;
        assert_eq!(after - before, 990);

        // Later balance changes follow the vote
        let bob = keys("bob");
        ledger
            .apply_transaction(&transfer(&network, &voter, &bob, 100, 10), 2)
            .unwrap();
        let moved = ledger.find_by_public_key(delegate.public_key()).unwrap().vote_balance;
        assert_eq!(moved - before, 880);

        let unvote = signed(
            &network,
            &voter,
            10,
            Asset::Vote {
                votes: vec![Vote::Remove(delegate.public_key().to_string())],
            },
        );
        ledger.apply_transaction(&unvote, 2).unwrap();
        assert_eq!(
            ledger.find_by_public_key(delegate.public_key()).unwrap().vote_balance,
            before
        );

        ledger.revert_transaction(&unvote).unwrap();
        assert_eq!(
            ledger.find_by_public_key(delegate.public_key()).unwrap().vote_balance - before,
            880
        );
    }

    #[test]
    fn test_vote_rules() {
        let (network, ledger) = ledger();
        let voter = keys("voter");
        fund(&ledger, &network, &voter, 1_000);

        let not_delegate = keys("nobody");
        let vote = signed(
            &network,
            &voter,
            1,
            Asset::Vote {
                votes: vec![Vote::Add(not_delegate.public_key().to_string())],
            },
        );
        assert!(matches!(
            ledger.apply_transaction(&vote, 2),
            Err(LedgerError::UnknownDelegateVote(_))
        ));

        let unvote = signed(
            &network,
            &voter,
            1,
            Asset::Vote {
                votes: vec![Vote::Remove(network.delegates[0].public_key().to_string())],
            },
        );
        assert!(matches!(
            ledger.apply_transaction(&unvote, 2),
            Err(LedgerError::InvalidVote(_))
        ));
    }

    #[test]
    fn test_delegate_registration_and_duplicate_name() {
        let (network, ledger) = ledger();
        let alice = keys("alice");
        let mallory = keys("mallory");
        fund(&ledger, &network, &alice, 1_000);
        fund(&ledger, &network, &mallory, 1_000);

        let register = |sender: &Keys, name: &str| {
            signed(
                &network,
                sender,
                25,
                Asset::DelegateRegistration {
                    username: name.to_string(),
                },
            )
        };

        let first = register(&alice, "alice");
        ledger.apply_transaction(&first, 2).unwrap();
        assert_eq!(
            ledger.find_by_username("alice").unwrap().address,
            alice.address(network.config.version)
        );

        assert_eq!(
            ledger.apply_transaction(&register(&mallory, "alice"), 2),
            Err(LedgerError::DuplicateDelegateName("alice".to_string()))
        );
        assert!(matches!(
            ledger.apply_transaction(&register(&alice, "alice2"), 2),
            Err(LedgerError::AlreadyDelegate(_))
        ));
        assert!(matches!(
            ledger.apply_transaction(&register(&mallory, "Not Valid"), 2),
            Err(LedgerError::InvalidUsername(_))
        ));

        ledger.revert_transaction(&first).unwrap();
        assert!(ledger.find_by_username("alice").is_none());
        ledger
            .apply_transaction(&register(&mallory, "alice"), 2)
            .unwrap();
    }

    #[test]
    fn test_second_signature_required_after_registration() {
        let (network, ledger) = ledger();
        let alice = keys("alice");
        let second = keys("alice second");
        let bob = keys("bob");
        fund(&ledger, &network, &alice, 1_000);

        let register = signed(
            &network,
            &alice,
            5,
            Asset::SecondSignature {
                public_key: second.public_key().to_string(),
            },
        );
        ledger.apply_transaction(&register, 2).unwrap();

        let single = transfer(&network, &alice, &bob, 1, 1);
        assert!(matches!(
            ledger.apply_transaction(&single, 2),
            Err(LedgerError::MissingSecondSignature(_))
        ));

        let mut wrong = single.clone();
        wrong.second_sign(&keys("not it")).unwrap();
        assert!(matches!(
            ledger.apply_transaction(&wrong, 2),
            Err(LedgerError::SecondSignatureInvalid(_))
        ));

        let mut double = single;
        double.second_sign(&second).unwrap();
        ledger.apply_transaction(&double, 2).unwrap();
        assert_eq!(balance(&ledger, &bob), 1);
    }

    #[test]
    fn test_multisignature_registration_needs_quorum() {
        let (network, ledger) = ledger();
        let owner = keys("owner");
        fund(&ledger, &network, &owner, 1_000);
        let members: Vec<Keys> = ["m1", "m2", "m3"].iter().map(|p| keys(p)).collect();
        let asset = MultiSignatureAsset {
            min: 2,
            lifetime: 24,
            keysgroup: members.iter().map(|k| k.public_key().to_string()).collect(),
        };

        let mut lacking = Transaction::new(
            network.config.version,
            10,
            owner.public_key(),
            5,
            Asset::MultiSignature(asset.clone()),
        );
        lacking.sign(&owner).unwrap();
        lacking.multi_sign(&members[0]).unwrap();
        assert!(matches!(
            ledger.apply_transaction(&lacking, 2),
            Err(LedgerError::MultiSignatureQuorum(_))
        ));

        let mut complete = lacking.clone();
        complete.multi_sign(&members[2]).unwrap();
        ledger.apply_transaction(&complete, 2).unwrap();
        assert_eq!(
            ledger
                .find_by_public_key(owner.public_key())
                .unwrap()
                .multisignature,
            Some(asset)
        );

        // Subsequent spends need the quorum too
        let mut spend = transfer(&network, &owner, &keys("bob"), 1, 1);
        spend.multi_sign(&members[1]).unwrap();
        assert!(matches!(
            ledger.apply_transaction(&spend, 2),
            Err(LedgerError::MultiSignatureQuorum(_))
        ));
        spend.multi_sign(&members[2]).unwrap();
        ledger.apply_transaction(&spend, 2).unwrap();
    }

    #[test]
    fn test_multi_payment_and_resignation() {
        let (network, ledger) = ledger();
        let payer = keys("payer");
        fund(&ledger, &network, &payer, 1_000);

        let payments = vec![
            Payment {
                amount: 100,
                recipient_id: keys("a").address(network.config.version),
            },
            Payment {
                amount: 200,
                recipient_id: keys("b").address(network.config.version),
            },
        ];
        let pay = signed(&network, &payer, 10, Asset::MultiPayment { payments });
        ledger.apply_transaction(&pay, 2).unwrap();
        assert_eq!(balance(&ledger, &payer), 690);
        assert_eq!(balance(&ledger, &keys("b")), 200);

        let delegate = &network.delegates[0];
        let resign = signed(&network, delegate, 0, Asset::DelegateResignation);
        ledger.apply_transaction(&resign, 2).unwrap();
        assert!(ledger
            .top_delegates(100)
            .iter()
            .all(|d| d.public_key.as_deref() != Some(delegate.public_key())));
        assert!(matches!(
            ledger.apply_transaction(&resign, 2),
            Err(LedgerError::NotADelegate(_))
        ));

        ledger.revert_transaction(&resign).unwrap();
        assert_eq!(ledger.top_delegates(100).len(), network.delegates.len());
    }

    #[test]
    fn test_failed_block_is_rolled_back() {
        let (network, ledger) = ledger();
        let alice = keys("alice");
        let bob = keys("bob");
        fund(&ledger, &network, &alice, 100);
        let generator = &network.delegates[0];
        let watched = [&alice, &bob, generator];
        let snapshot: Vec<Account> = watched
            .iter()
            .map(|k| ledger.find_by_public_key(k.public_key()).unwrap())
            .collect();

        let good = transfer(&network, &alice, &bob, 60, 10);
        let mut bad = transfer(&network, &alice, &bob, 60, 10);
        bad.timestamp += 1;
        bad.sign(&alice).unwrap();

        let block = Block::create(
            generator,
            Some(&network.config.genesis_block),
            8,
            vec![good, bad],
            &network.config,
        )
        .unwrap();

        assert!(matches!(
            ledger.apply_block(&block),
            Err(LedgerError::InsufficientFunds { .. })
        ));

        let after: Vec<Account> = watched
            .iter()
            .map(|k| ledger.find_by_public_key(k.public_key()).unwrap())
            .collect();
        assert_eq!(after, snapshot);
    }

    #[test]
    fn test_block_rewards_and_revert() {
        let (network, ledger) = ledger();
        let alice = keys("alice");
        fund(&ledger, &network, &alice, 1_000);

        let generator = &network.delegates[1];
        let before = ledger.find_by_public_key(generator.public_key()).unwrap();

        let block = Block::create(
            generator,
            Some(&network.config.genesis_block),
            8,
            vec![transfer(&network, &alice, &keys("bob"), 100, 10)],
            &network.config,
        )
        .unwrap();
        ledger.apply_block(&block).unwrap();

        let after = ledger.find_by_public_key(generator.public_key()).unwrap();
        let reward = block.reward as i64;
        assert_eq!(after.balance, before.balance + reward + 10);
        assert_eq!(after.produced_blocks, before.produced_blocks + 1);
        assert_eq!(after.forged_fees, 10);
        // Self-vote propagates the reward into the vote balance
        assert_eq!(after.vote_balance, before.vote_balance + reward + 10);

        ledger.revert_block(&block).unwrap();
        assert_eq!(ledger.find_by_public_key(generator.public_key()).unwrap(), before);
    }

    #[test]
    fn test_unknown_generator_is_rejected() {
        let (network, ledger) = ledger();
        let block = Block::create(
            &keys("stranger"),
            Some(&network.config.genesis_block),
            8,
            vec![],
            &network.config,
        )
        .unwrap();
        assert!(matches!(
            ledger.apply_block(&block),
            Err(LedgerError::UnknownGenerator(_))
        ));
    }

    #[test]
    fn test_resigned_delegate_cannot_forge() {
        let (network, ledger) = ledger();
        let generator = &network.delegates[2];
        let resign = signed(&network, generator, 0, Asset::DelegateResignation);
        ledger.apply_transaction(&resign, 2).unwrap();

        let block = Block::create(
            generator,
            Some(&network.config.genesis_block),
            8,
            vec![],
            &network.config,
        )
        .unwrap();
        let before = ledger.find_by_public_key(generator.public_key()).unwrap();
        assert!(matches!(
            ledger.apply_block(&block),
            Err(LedgerError::UnknownGenerator(_))
        ));
        assert_eq!(ledger.find_by_public_key(generator.public_key()).unwrap(), before);
    }

    #[test]
    fn test_forced_transaction_skips_checks() {
        let network = testnet();
        let broke = keys("broke");
        let mut overdraft = Transaction::transfer(
            network.config.version,
            10,
            broke.public_key(),
            keys("bob").address(network.config.version),
            500,
            1,
        );
        overdraft.sign(&broke).unwrap();

        let mut config = network.config.clone();
        config
            .exceptions
            .transactions
            .insert(overdraft.id.clone());
        let ledger = Ledger::new(Arc::new(config));

        ledger.apply_transaction(&overdraft, 2).unwrap();
        assert_eq!(balance(&ledger, &broke), -501);
    }

    #[test]
    fn test_dirty_accounts_are_drained() {
        let (network, ledger) = ledger();
        ledger.take_dirty();
        let alice = keys("alice");
        fund(&ledger, &network, &alice, 10);

        let dirty = ledger.take_dirty();
        assert!(dirty
            .iter()
            .any(|a| a.address == alice.address(network.config.version)));
        assert!(ledger.take_dirty().is_empty());
    }

    #[test]
    fn test_username_rules() {
        assert!(is_valid_username("genesis_1"));
        assert!(is_valid_username("a.b!c@d$e&f"));
        assert!(!is_valid_username(""));
        assert!(!is_valid_username("UPPER"));
        assert!(!is_valid_username(&"a".repeat(21)));
    }
}
