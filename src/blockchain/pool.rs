//! Loose transactions waiting to be forged, and the guard every incoming
//! batch passes before it joins them.

use log::{debug, info, warn};
use thiserror::Error;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use super::block::Block;
use super::ledger::{Ledger, LedgerError, GENESIS_HEIGHT};
use super::storage::{Storage, StorageError};
use super::transaction::{Transaction, TransactionError};
use crate::config::NetworkConfig;

/// Why a transaction was kept out of the pool
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Transaction {id} is for network {actual}, expected {expected}")]
    WrongNetwork { id: String, expected: u8, actual: u8 },

    #[error("Transaction error: {0}")]
    Transaction(#[from] TransactionError),

    #[error("Transaction {id} pays fee {fee}, minimum is {minimum}")]
    FeeTooLow { id: String, fee: u64, minimum: u64 },

    #[error("Transaction {id} has a vendor field of {length} bytes, limit is {limit}")]
    VendorFieldTooLong { id: String, length: usize, limit: u8 },

    #[error("Transaction {0} appears twice in the batch")]
    DuplicateInBatch(String),

    #[error("Transaction {0} is already in the pool")]
    AlreadyInPool(String),

    #[error("Transaction {0} is already forged")]
    AlreadyForged(String),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Pool is full ({0} transactions)")]
    PoolFull(usize),

    #[error("Pool lock poisoned")]
    LockPoisoned,
}

/// Outcome of offering a batch to the pool
#[derive(Debug, Default)]
pub struct GuardResult {
    /// Ids that joined the pool
    pub accepted: Vec<String>,
    /// Ids kept out, with the reason
    pub invalid: Vec<(String, PoolError)>,
}

impl GuardResult {
    pub fn is_rejected(&self, id: &str) -> bool {
        self.invalid.iter().any(|(invalid, _)| invalid == id)
    }
}

/// The transaction pool.
///
/// Every batch is replayed on a scratch copy of the ledger on top of the
/// transactions already waiting, so later entries see the effects of
/// earlier ones.
#[derive(Debug)]
pub struct TransactionPool {
    config: Arc<NetworkConfig>,
    transactions: Mutex<Vec<Transaction>>,
    max_size: usize,
}

impl TransactionPool {
    pub fn new(config: Arc<NetworkConfig>, max_size: usize) -> Self {
        TransactionPool {
            config,
            transactions: Mutex::new(Vec::new()),
            max_size,
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<Transaction>>, PoolError> {
        self.transactions.lock().map_err(|_| PoolError::LockPoisoned)
    }

    pub fn len(&self) -> usize {
        self.lock().map(|pool| pool.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock()
            .map(|pool| pool.iter().any(|t| t.id == id))
            .unwrap_or(false)
    }

    /// Checks that need nothing but the transaction and the milestone
    fn check_static(&self, transaction: &Transaction, height: u64) -> Result<(), PoolError> {
        if transaction.network != self.config.version {
            return Err(PoolError::WrongNetwork {
                id: transaction.id.clone(),
                expected: self.config.version,
                actual: transaction.network,
            });
        }

        transaction.verify(&self.config.exceptions)?;

        let milestone = self.config.milestone(height);
        let minimum = milestone.fees.get(transaction.kind());
        if transaction.fee < minimum {
            return Err(PoolError::FeeTooLow {
                id: transaction.id.clone(),
                fee: transaction.fee,
                minimum,
            });
        }

        if let Some(vendor_field) = &transaction.vendor_field {
            if vendor_field.len() > milestone.vendor_field_length as usize {
                return Err(PoolError::VendorFieldTooLong {
                    id: transaction.id.clone(),
                    length: vendor_field.len(),
                    limit: milestone.vendor_field_length,
                });
            }
        }

        Ok(())
    }

    /// Validates `batch` for the block at `height` and adds what passes.
    ///
    /// # Arguments
    ///
    /// * `batch` - Loose transactions, in arrival order
    /// * `ledger` - Current wallet state; it is cloned, never mutated
    /// * `store` - Used to reject transactions that are already forged
    /// * `height` - Height of the next block, selecting the fee milestone
    pub fn add_transactions(
        &self,
        batch: Vec<Transaction>,
        ledger: &Ledger,
        store: &dyn Storage,
        height: u64,
    ) -> Result<GuardResult, PoolError> {
        let mut pool = self.lock()?;
        let mut result = GuardResult::default();

        // Pooled transactions never belong to the genesis block
        let height = height.max(GENESIS_HEIGHT + 1);
        let scratch = ledger.clone();
        pool.retain(|transaction| match scratch.apply_transaction(transaction, height) {
            Ok(()) => true,
            Err(e) => {
                warn!("Evicting pool transaction {}: {}", transaction.id, e);
                false
            }
        });

        let ids: Vec<String> = batch.iter().map(|t| t.id.clone()).collect();
        let forged: HashSet<String> = store.existing_transaction_ids(&ids)?.into_iter().collect();
        let pooled: HashSet<String> = pool.iter().map(|t| t.id.clone()).collect();
        let mut seen: HashSet<String> = HashSet::new();

        for transaction in batch {
            let id = transaction.id.clone();
            let verdict = if !seen.insert(id.clone()) {
                Err(PoolError::DuplicateInBatch(id.clone()))
            } else if pooled.contains(&id) {
                Err(PoolError::AlreadyInPool(id.clone()))
            } else if forged.contains(&id) {
                Err(PoolError::AlreadyForged(id.clone()))
            } else if pool.len() >= self.max_size {
                Err(PoolError::PoolFull(self.max_size))
            } else {
                self.check_static(&transaction, height)
                    .and_then(|()| scratch.apply_transaction(&transaction, height).map_err(PoolError::from))
            };

            match verdict {
                Ok(()) => {
                    debug!("Pooled transaction {}", id);
                    pool.push(transaction);
                    result.accepted.push(id);
                }
                Err(e) => {
                    debug!("Rejected transaction {}: {}", id, e);
                    result.invalid.push((id, e));
                }
            }
        }

        if !result.accepted.is_empty() {
            info!(
                "Pool accepted {} of {} transactions, now holding {}",
                result.accepted.len(),
                result.accepted.len() + result.invalid.len(),
                pool.len()
            );
        }
        Ok(result)
    }

    /// Up to `limit` transactions in arrival order, left in the pool
    pub fn transactions_for_forging(&self, limit: usize) -> Result<Vec<Transaction>, PoolError> {
        Ok(self.lock()?.iter().take(limit).cloned().collect())
    }

    /// Drops every pooled transaction that `block` confirmed
    pub fn remove_forged(&self, block: &Block) -> Result<usize, PoolError> {
        let forged: HashSet<&str> = block.transactions.iter().map(|t| t.id.as_str()).collect();
        let mut pool = self.lock()?;
        let before = pool.len();
        pool.retain(|t| !forged.contains(t.id.as_str()));
        Ok(before - pool.len())
    }

    /// Puts the transactions of a reverted block back in front of the queue
    pub fn readd_reverted(&self, block: &Block) -> Result<(), PoolError> {
        let mut pool = self.lock()?;
        let mut restored: Vec<Transaction> = block
            .transactions
            .iter()
            .filter(|t| !pool.iter().any(|p| p.id == t.id))
            .cloned()
            .map(|mut t| {
                t.block_id = None;
                t.sequence = None;
                t
            })
            .collect();
        restored.append(&mut pool);
        *pool = restored;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::crypto::Keys;
    use crate::blockchain::genesis::{testnet, Testnet};
    use crate::blockchain::storage::{BlockStore, MemoryStorage};
    use crate::blockchain::transaction::Asset;

    const FEE: u64 = 10_000_000;
    const REGISTRATION_FEE: u64 = 2_500_000_000;

    fn setup() -> (Testnet, Ledger, MemoryStorage, TransactionPool) {
        let network = testnet();
        let config = Arc::new(network.config.clone());
        let ledger = Ledger::new(config.clone());
        ledger.apply_block(&network.config.genesis_block).unwrap();
        let store = MemoryStorage::new();
        store.save_block(&network.config.genesis_block).unwrap();
        (network, ledger, store, TransactionPool::new(config, 1_000))
    }

    fn transfer(network: &Testnet, from: &Keys, to: &Keys, amount: u64, timestamp: u32) -> Transaction {
        let mut transaction = Transaction::transfer(
            network.config.version,
            timestamp,
            from.public_key(),
            to.address(network.config.version),
            amount,
            FEE,
        );
        transaction.sign(from).unwrap();
        transaction
    }

    fn registration(network: &Testnet, keys: &Keys, username: &str) -> Transaction {
        let mut transaction = Transaction::new(
            network.config.version,
            10,
            keys.public_key(),
            REGISTRATION_FEE,
            Asset::DelegateRegistration {
                username: username.to_string(),
            },
        );
        transaction.sign(keys).unwrap();
        transaction
    }

    #[test]
    fn test_duplicate_username_in_batch() {
        let (network, ledger, store, pool) = setup();
        let alice = Keys::from_passphrase("alice").unwrap();
        let mallory = Keys::from_passphrase("mallory").unwrap();
        for (i, keys) in [&alice, &mallory].iter().enumerate() {
            let funding = transfer(&network, &network.delegates[0], keys, 10 * REGISTRATION_FEE, i as u32);
            ledger.apply_transaction(&funding, 2).unwrap();
        }

        let first = registration(&network, &alice, "alice");
        let second = registration(&network, &mallory, "alice");
        let result = pool
            .add_transactions(vec![first.clone(), second.clone()], &ledger, &store, 2)
            .unwrap();

        assert_eq!(result.accepted, vec![first.id.clone()]);
        assert!(matches!(
            &result.invalid[0].1,
            PoolError::Ledger(LedgerError::DuplicateDelegateName(name)) if name == "alice"
        ));
        assert_eq!(pool.len(), 1);

        // The real ledger is untouched
        assert!(ledger.find_by_username("alice").is_none());

        // Offering the loser again does not grow the pool either
        let again = pool.add_transactions(vec![second], &ledger, &store, 2).unwrap();
        assert!(again.accepted.is_empty());
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_static_checks() {
        let (network, ledger, store, pool) = setup();
        let sender = &network.delegates[0];
        let bob = Keys::from_passphrase("bob").unwrap();

        let mut cheap = Transaction::transfer(
            network.config.version,
            1,
            sender.public_key(),
            bob.address(network.config.version),
            5,
            FEE - 1,
        );
        cheap.sign(sender).unwrap();

        let mut foreign = Transaction::transfer(
            0x1e,
            2,
            sender.public_key(),
            bob.address(network.config.version),
            5,
            FEE,
        );
        foreign.sign(sender).unwrap();

        let mut chatty = Transaction::transfer(
            network.config.version,
            3,
            sender.public_key(),
            bob.address(network.config.version),
            5,
            FEE,
        )
        .with_vendor_field(&"x".repeat(65));
        chatty.sign(sender).unwrap();

        let mut tampered = transfer(&network, sender, &bob, 5, 4);
        tampered.amount = 6;

        let result = pool
            .add_transactions(
                vec![cheap, foreign, chatty, tampered],
                &ledger,
                &store,
                2,
            )
            .unwrap();
        assert!(result.accepted.is_empty());
        assert!(matches!(result.invalid[0].1, PoolError::FeeTooLow { .. }));
        assert!(matches!(result.invalid[1].1, PoolError::WrongNetwork { .. }));
        assert!(matches!(result.invalid[2].1, PoolError::VendorFieldTooLong { .. }));
        assert!(matches!(result.invalid[3].1, PoolError::Transaction(_)));
        assert!(pool.is_empty());
    }

    #[test]
    fn test_duplicates_and_forged() {
        let (network, ledger, store, pool) = setup();
        let sender = &network.delegates[1];
        let bob = Keys::from_passphrase("bob").unwrap();

        let transaction = transfer(&network, sender, &bob, 5, 1);
        let result = pool
            .add_transactions(vec![transaction.clone(), transaction.clone()], &ledger, &store, 2)
            .unwrap();
        assert_eq!(result.accepted.len(), 1);
        assert!(matches!(result.invalid[0].1, PoolError::DuplicateInBatch(_)));

        let result = pool
            .add_transactions(vec![transaction.clone()], &ledger, &store, 2)
            .unwrap();
        assert!(matches!(result.invalid[0].1, PoolError::AlreadyInPool(_)));

        let genesis_transaction = network.config.genesis_block.transactions[0].clone();
        let result = pool
            .add_transactions(vec![genesis_transaction], &ledger, &store, 2)
            .unwrap();
        assert!(matches!(result.invalid[0].1, PoolError::AlreadyForged(_)));
    }

    #[test]
    fn test_later_transactions_see_earlier_ones() {
        let (network, ledger, store, pool) = setup();
        let carol = Keys::from_passphrase("carol").unwrap();
        let dave = Keys::from_passphrase("dave").unwrap();

        let fund = transfer(&network, &network.delegates[0], &carol, 3 * FEE, 1);
        let spend = transfer(&network, &carol, &dave, FEE, 2);
        let overspend = transfer(&network, &carol, &dave, FEE, 3);

        let result = pool
            .add_transactions(vec![spend.clone()], &ledger, &store, 2)
            .unwrap();
        assert!(result.is_rejected(&spend.id));

        let result = pool
            .add_transactions(vec![fund, spend.clone(), overspend.clone()], &ledger, &store, 2)
            .unwrap();
        assert_eq!(result.accepted.len(), 2);
        assert!(result.is_rejected(&overspend.id));
        assert!(matches!(
            result.invalid[0].1,
            PoolError::Ledger(LedgerError::InsufficientFunds { .. })
        ));
    }

    #[test]
    fn test_forging_and_revert_bookkeeping() {
        let (network, ledger, store, pool) = setup();
        let bob = Keys::from_passphrase("bob").unwrap();
        let batch: Vec<Transaction> = (0..3)
            .map(|i| transfer(&network, &network.delegates[2], &bob, 1, i))
            .collect();
        pool.add_transactions(batch, &ledger, &store, 2).unwrap();
        assert_eq!(pool.len(), 3);

        let selected = pool.transactions_for_forging(2).unwrap();
        assert_eq!(selected.len(), 2);

        let block = Block::create(
            &network.delegates[0],
            Some(&network.config.genesis_block),
            8,
            selected,
            &network.config,
        )
        .unwrap();
        assert_eq!(pool.remove_forged(&block).unwrap(), 2);
        assert_eq!(pool.len(), 1);

        pool.readd_reverted(&block).unwrap();
        assert_eq!(pool.len(), 3);
        let front = pool.transactions_for_forging(1).unwrap();
        assert_eq!(front[0].id, block.transactions[0].id);
        assert!(front[0].block_id.is_none());
    }

    #[test]
    fn test_pool_size_limit() {
        let (network, ledger, store, _) = setup();
        let pool = TransactionPool::new(Arc::new(network.config.clone()), 1);
        let bob = Keys::from_passphrase("bob").unwrap();
        let batch: Vec<Transaction> = (0..2)
            .map(|i| transfer(&network, &network.delegates[3], &bob, 1, i))
            .collect();

        let result = pool.add_transactions(batch, &ledger, &store, 2).unwrap();
        assert_eq!(result.accepted.len(), 1);
        assert!(matches!(result.invalid[0].1, PoolError::PoolFull(1)));
    }
}
