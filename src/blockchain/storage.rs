use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::RwLock;

use log::{debug, warn};
use serde::{de::DeserializeOwned, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Db, Transactional, Tree};
use thiserror::Error;

use super::account::Account;
use super::block::Block;
use super::crypto::Address;
use super::round::RoundDelegate;

const SYNCED_HEIGHT_KEY: &str = "synced_height";

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Item not found: {0}")]
    NotFound(String),

    #[error("Item already exists: {0}")]
    AlreadyExists(String),

    #[error("Storage transaction aborted: {0}")]
    TransactionAborted(String),

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

/// Aggregates used by the integrity check
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainStatistics {
    pub block_count: u64,
    pub block_total_amount: u128,
    pub block_total_fee: u128,
    pub total_reward: u128,
    pub transaction_count: u64,
    pub transaction_total_amount: u128,
    pub transaction_total_fee: u128,
}

impl ChainStatistics {
    fn accumulate(&mut self, block: &Block) {
        self.block_count += 1;
        self.block_total_amount += block.total_amount as u128;
        self.block_total_fee += block.total_fee as u128;
        self.total_reward += block.reward as u128;
        for transaction in &block.transactions {
            self.transaction_count += 1;
            self.transaction_total_amount += transaction.amount as u128;
            self.transaction_total_fee += transaction.fee as u128;
        }
    }
}

/// Persisted blocks and their transactions
pub trait BlockStore: Send + Sync {
    /// Inserts a block with all of its transactions, or nothing
    fn save_block(&self, block: &Block) -> Result<(), StorageError>;

    /// Removes a block and its transactions
    fn delete_block(&self, block: &Block) -> Result<(), StorageError>;

    /// The block with the highest height
    fn last_block(&self) -> Result<Option<Block>, StorageError>;

    fn block_by_id(&self, id: &str) -> Result<Option<Block>, StorageError>;

    fn block_at_height(&self, height: u64) -> Result<Option<Block>, StorageError>;

    /// Up to `limit` consecutive blocks starting at `height`
    fn blocks_from_height(&self, height: u64, limit: usize) -> Result<Vec<Block>, StorageError>;

    /// The subset of `ids` already persisted
    fn existing_transaction_ids(&self, ids: &[String]) -> Result<Vec<String>, StorageError>;

    fn statistics(&self) -> Result<ChainStatistics, StorageError>;
}

/// Persisted wallets and round snapshots
pub trait AccountStore: Send + Sync {
    /// Writes changed accounts and records the height they reflect
    fn save_accounts(&self, accounts: &[Account], synced_height: u64) -> Result<(), StorageError>;

    fn account(&self, address: &Address) -> Result<Option<Account>, StorageError>;

    fn all_accounts(&self) -> Result<Vec<Account>, StorageError>;

    /// Drops every account record, used before a full replay
    fn clear_accounts(&self) -> Result<(), StorageError>;

    /// Height of the last block whose effects were written with `save_accounts`
    fn synced_height(&self) -> Result<Option<u64>, StorageError>;

    fn save_round(&self, round: u64, delegates: &[RoundDelegate]) -> Result<(), StorageError>;

    /// Snapshot ordered by balance descending, public key ascending
    fn round(&self, round: u64) -> Result<Option<Vec<RoundDelegate>>, StorageError>;

    fn delete_round(&self, round: u64) -> Result<(), StorageError>;
}

/// Both collaborator stores behind one handle
pub trait Storage: BlockStore + AccountStore {}

impl<T: BlockStore + AccountStore> Storage for T {}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    bincode::serialize(value).map_err(|e| StorageError::SerializationError(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
    bincode::deserialize(bytes).map_err(|e| StorageError::DeserializationError(e.to_string()))
}

fn height_key(height: u64) -> [u8; 8] {
    height.to_be_bytes()
}

fn sort_round(delegates: &mut [RoundDelegate]) {
    delegates.sort_by(|a, b| {
        b.balance
            .cmp(&a.balance)
            .then_with(|| a.public_key.cmp(&b.public_key))
    });
}

fn aborted(e: TransactionError<String>) -> StorageError {
    match e {
        TransactionError::Abort(reason) => StorageError::TransactionAborted(reason),
        TransactionError::Storage(e) => StorageError::DatabaseError(e),
    }
}

/// sled backed storage for a running node
pub struct SledStorage {
    /// The database instance
    db: Db,

    /// height -> block
    blocks: Tree,

    /// block id -> height
    block_ids: Tree,

    /// transaction id -> block id
    transactions: Tree,

    /// address -> account
    accounts: Tree,

    /// round -> delegate snapshot
    rounds: Tree,

    metadata: Tree,
}

impl std::fmt::Debug for SledStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledStorage")
            .field("blocks", &self.blocks.len())
            .field("accounts", &self.accounts.len())
            .finish()
    }
}

impl SledStorage {
    /// Opens or creates the database under `path`
    ///
    /// # Arguments
    ///
    /// * `path` - The path to the database directory
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        SledStorage::from_db(sled::open(path)?)
    }

    /// A database that disappears when dropped
    pub fn temporary() -> Result<Self, StorageError> {
        SledStorage::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: Db) -> Result<Self, StorageError> {
        let blocks = db.open_tree("blocks")?;
        let block_ids = db.open_tree("block_ids")?;
        let transactions = db.open_tree("transactions")?;
        let accounts = db.open_tree("accounts")?;
        let rounds = db.open_tree("rounds")?;
        let metadata = db.open_tree("metadata")?;

        Ok(Self {
            db,
            blocks,
            block_ids,
            transactions,
            accounts,
            rounds,
            metadata,
        })
    }

    /// Flushes dirty pages to disk
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

impl BlockStore for SledStorage {
    fn save_block(&self, block: &Block) -> Result<(), StorageError> {
        let key = height_key(block.height);
        let value = encode(block)?;
        let transaction_ids: Vec<&str> = block.transactions.iter().map(|t| t.id.as_str()).collect();

        (&self.blocks, &self.block_ids, &self.transactions)
            .transaction(|(blocks, block_ids, transactions)| {
                if blocks.get(&key[..])?.is_some() {
                    return Err(ConflictableTransactionError::Abort(format!(
                        "block at height {}",
                        block.height
                    )));
                }
                if block_ids.get(block.id.as_bytes())?.is_some() {
                    return Err(ConflictableTransactionError::Abort(format!("block {}", block.id)));
                }
                for id in &transaction_ids {
                    if transactions.get(id.as_bytes())?.is_some() {
                        return Err(ConflictableTransactionError::Abort(format!(
                            "transaction {}",
                            id
                        )));
                    }
                    transactions.insert(id.as_bytes(), block.id.as_bytes())?;
                }
                blocks.insert(&key[..], value.as_slice())?;
                block_ids.insert(block.id.as_bytes(), &key[..])?;
                Ok(())
            })
            .map_err(|e| match aborted(e) {
                StorageError::TransactionAborted(what) => StorageError::AlreadyExists(what),
                other => other,
            })?;

        debug!("Stored block {} at height {}", block.id, block.height);
        Ok(())
    }

    fn delete_block(&self, block: &Block) -> Result<(), StorageError> {
        let key = height_key(block.height);
        let transaction_ids: Vec<&str> = block.transactions.iter().map(|t| t.id.as_str()).collect();

        (&self.blocks, &self.block_ids, &self.transactions)
            .transaction(|(blocks, block_ids, transactions)| {
                if blocks.remove(&key[..])?.is_none() {
                    return Err(ConflictableTransactionError::Abort(format!(
                        "no block at height {}",
                        block.height
                    )));
                }
                block_ids.remove(block.id.as_bytes())?;
                for id in &transaction_ids {
                    transactions.remove(id.as_bytes())?;
                }
                Ok(())
            })
            .map_err(|e| match aborted(e) {
                StorageError::TransactionAborted(what) => StorageError::NotFound(what),
                other => other,
            })?;

        Ok(())
    }

    fn last_block(&self) -> Result<Option<Block>, StorageError> {
        match self.blocks.last()? {
            Some((_, value)) => Ok(Some(decode(&value)?)),
            None => Ok(None),
        }
    }

    fn block_by_id(&self, id: &str) -> Result<Option<Block>, StorageError> {
        match self.block_ids.get(id.as_bytes())? {
            Some(key) => match self.blocks.get(key)? {
                Some(value) => Ok(Some(decode(&value)?)),
                None => {
                    warn!("Block id {} points at a missing height", id);
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    fn block_at_height(&self, height: u64) -> Result<Option<Block>, StorageError> {
        match self.blocks.get(height_key(height))? {
            Some(value) => Ok(Some(decode(&value)?)),
            None => Ok(None),
        }
    }

    fn blocks_from_height(&self, height: u64, limit: usize) -> Result<Vec<Block>, StorageError> {
        let mut blocks = Vec::new();
        for result in self.blocks.range(height_key(height)..).take(limit) {
            let (_, value) = result?;
            blocks.push(decode(&value)?);
        }
        Ok(blocks)
    }

    fn existing_transaction_ids(&self, ids: &[String]) -> Result<Vec<String>, StorageError> {
        let mut existing = Vec::new();
        for id in ids {
            if self.transactions.contains_key(id.as_bytes())? {
                existing.push(id.clone());
            }
        }
        Ok(existing)
    }

    fn statistics(&self) -> Result<ChainStatistics, StorageError> {
        let mut statistics = ChainStatistics::default();
        for result in self.blocks.iter() {
            let (_, value) = result?;
            let block: Block = decode(&value)?;
            statistics.accumulate(&block);
        }
        Ok(statistics)
    }
}

impl AccountStore for SledStorage {
    fn save_accounts(&self, accounts: &[Account], synced_height: u64) -> Result<(), StorageError> {
        let mut batch = Vec::with_capacity(accounts.len());
        for account in accounts {
            batch.push((account.address.0.clone(), encode(account)?));
        }
        let height = height_key(synced_height);

        (&self.accounts, &self.metadata)
            .transaction(|(tree, metadata)| {
                for (address, value) in &batch {
                    tree.insert(address.as_bytes(), value.as_slice())?;
                }
                metadata.insert(SYNCED_HEIGHT_KEY, &height[..])?;
                Ok(())
            })
            .map_err(aborted)?;

        Ok(())
    }

    fn account(&self, address: &Address) -> Result<Option<Account>, StorageError> {
        match self.accounts.get(address.0.as_bytes())? {
            Some(value) => Ok(Some(decode(&value)?)),
            None => Ok(None),
        }
    }

    fn all_accounts(&self) -> Result<Vec<Account>, StorageError> {
        let mut accounts = Vec::new();
        for result in self.accounts.iter() {
            let (_, value) = result?;
            accounts.push(decode(&value)?);
        }
        Ok(accounts)
    }

    fn clear_accounts(&self) -> Result<(), StorageError> {
        self.accounts.clear()?;
        self.metadata.remove(SYNCED_HEIGHT_KEY)?;
        Ok(())
    }

    fn synced_height(&self) -> Result<Option<u64>, StorageError> {
        match self.metadata.get(SYNCED_HEIGHT_KEY)? {
            Some(value) => {
                let bytes: [u8; 8] = value.as_ref().try_into().map_err(|_| {
                    StorageError::DeserializationError("synced height is not 8 bytes".to_string())
                })?;
                Ok(Some(u64::from_be_bytes(bytes)))
            }
            None => Ok(None),
        }
    }

    fn save_round(&self, round: u64, delegates: &[RoundDelegate]) -> Result<(), StorageError> {
        let mut delegates = delegates.to_vec();
        sort_round(&mut delegates);
        self.rounds.insert(height_key(round), encode(&delegates)?)?;
        Ok(())
    }

    fn round(&self, round: u64) -> Result<Option<Vec<RoundDelegate>>, StorageError> {
        match self.rounds.get(height_key(round))? {
            Some(value) => Ok(Some(decode(&value)?)),
            None => Ok(None),
        }
    }

    fn delete_round(&self, round: u64) -> Result<(), StorageError> {
        self.rounds.remove(height_key(round))?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    blocks: BTreeMap<u64, Block>,
    block_ids: HashMap<String, u64>,
    transactions: HashMap<String, String>,
    accounts: BTreeMap<Address, Account>,
    rounds: BTreeMap<u64, Vec<RoundDelegate>>,
    synced_height: Option<u64>,
}

/// In-memory storage with the same semantics as `SledStorage`
#[derive(Debug, Default)]
pub struct MemoryStorage {
    state: RwLock<MemoryState>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        MemoryStorage::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, MemoryState>, StorageError> {
        self.state.read().map_err(|_| StorageError::LockPoisoned)
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, MemoryState>, StorageError> {
        self.state.write().map_err(|_| StorageError::LockPoisoned)
    }
}

impl BlockStore for MemoryStorage {
    fn save_block(&self, block: &Block) -> Result<(), StorageError> {
        let mut state = self.write()?;
        if state.blocks.contains_key(&block.height) {
            return Err(StorageError::AlreadyExists(format!(
                "block at height {}",
                block.height
            )));
        }
        if state.block_ids.contains_key(&block.id) {
            return Err(StorageError::AlreadyExists(format!("block {}", block.id)));
        }
        if let Some(t) = block
            .transactions
            .iter()
            .find(|t| state.transactions.contains_key(&t.id))
        {
            return Err(StorageError::AlreadyExists(format!("transaction {}", t.id)));
        }

        for transaction in &block.transactions {
            state
                .transactions
                .insert(transaction.id.clone(), block.id.clone());
        }
        state.block_ids.insert(block.id.clone(), block.height);
        state.blocks.insert(block.height, block.clone());
        Ok(())
    }

    fn delete_block(&self, block: &Block) -> Result<(), StorageError> {
        let mut state = self.write()?;
        if state.blocks.remove(&block.height).is_none() {
            return Err(StorageError::NotFound(format!(
                "no block at height {}",
                block.height
            )));
        }
        state.block_ids.remove(&block.id);
        for transaction in &block.transactions {
            state.transactions.remove(&transaction.id);
        }
        Ok(())
    }

    fn last_block(&self) -> Result<Option<Block>, StorageError> {
        Ok(self.read()?.blocks.values().next_back().cloned())
    }

    fn block_by_id(&self, id: &str) -> Result<Option<Block>, StorageError> {
        let state = self.read()?;
        Ok(state
            .block_ids
            .get(id)
            .and_then(|height| state.blocks.get(height))
            .cloned())
    }

    fn block_at_height(&self, height: u64) -> Result<Option<Block>, StorageError> {
        Ok(self.read()?.blocks.get(&height).cloned())
    }

    fn blocks_from_height(&self, height: u64, limit: usize) -> Result<Vec<Block>, StorageError> {
        Ok(self
            .read()?
            .blocks
            .range(height..)
            .take(limit)
            .map(|(_, block)| block.clone())
            .collect())
    }

    fn existing_transaction_ids(&self, ids: &[String]) -> Result<Vec<String>, StorageError> {
        let state = self.read()?;
        Ok(ids
            .iter()
            .filter(|id| state.transactions.contains_key(*id))
            .cloned()
            .collect())
    }

    fn statistics(&self) -> Result<ChainStatistics, StorageError> {
        let mut statistics = ChainStatistics::default();
        for block in self.read()?.blocks.values() {
            statistics.accumulate(block);
        }
        Ok(statistics)
    }
}

impl AccountStore for MemoryStorage {
    fn save_accounts(&self, accounts: &[Account], synced_height: u64) -> Result<(), StorageError> {
        let mut state = self.write()?;
        for account in accounts {
            state
                .accounts
                .insert(account.address.clone(), account.clone());
        }
        state.synced_height = Some(synced_height);
        Ok(())
    }

    fn account(&self, address: &Address) -> Result<Option<Account>, StorageError> {
        Ok(self.read()?.accounts.get(address).cloned())
    }

    fn all_accounts(&self) -> Result<Vec<Account>, StorageError> {
        Ok(self.read()?.accounts.values().cloned().collect())
    }

    fn clear_accounts(&self) -> Result<(), StorageError> {
        let mut state = self.write()?;
        state.accounts.clear();
        state.synced_height = None;
        Ok(())
    }

    fn synced_height(&self) -> Result<Option<u64>, StorageError> {
        Ok(self.read()?.synced_height)
    }

    fn save_round(&self, round: u64, delegates: &[RoundDelegate]) -> Result<(), StorageError> {
        let mut delegates = delegates.to_vec();
        sort_round(&mut delegates);
        self.write()?.rounds.insert(round, delegates);
        Ok(())
    }

    fn round(&self, round: u64) -> Result<Option<Vec<RoundDelegate>>, StorageError> {
        Ok(self.read()?.rounds.get(&round).cloned())
    }

    fn delete_round(&self, round: u64) -> Result<(), StorageError> {
        self.write()?.rounds.remove(&round);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::crypto::{Address, Keys};
    use crate::blockchain::genesis::testnet;
    use crate::blockchain::transaction::Transaction;

    fn stores() -> Vec<Box<dyn Storage>> {
        vec![
            Box::new(SledStorage::temporary().unwrap()),
            Box::new(MemoryStorage::new()),
        ]
    }

    fn second_block() -> (crate::config::NetworkConfig, Block) {
        let network = testnet();
        let sender = &network.delegates[0];
        let mut transaction = Transaction::transfer(
            network.config.version,
            3,
            sender.public_key(),
            Keys::from_passphrase("bob").unwrap().address(network.config.version),
            10,
            1,
        );
        transaction.sign(sender).unwrap();
        let block = Block::create(
            &network.delegates[1],
            Some(&network.config.genesis_block),
            8,
            vec![transaction],
            &network.config,
        )
        .unwrap();
        (network.config, block)
    }

    #[test]
    fn test_save_and_get_blocks() {
        let (config, block) = second_block();
        for store in stores() {
            assert!(store.last_block().unwrap().is_none());
            store.save_block(&config.genesis_block).unwrap();
            store.save_block(&block).unwrap();

            assert_eq!(store.last_block().unwrap(), Some(block.clone()));
            assert_eq!(store.block_by_id(&block.id).unwrap(), Some(block.clone()));
            assert_eq!(store.block_at_height(1).unwrap(), Some(config.genesis_block.clone()));
            assert_eq!(store.blocks_from_height(1, 10).unwrap().len(), 2);
            assert_eq!(store.blocks_from_height(2, 10).unwrap(), vec![block.clone()]);

            let ids = vec![block.transactions[0].id.clone(), "f".repeat(64)];
            assert_eq!(
                store.existing_transaction_ids(&ids).unwrap(),
                vec![block.transactions[0].id.clone()]
            );
        }
    }

    #[test]
    fn test_save_block_is_all_or_nothing() {
        let (config, block) = second_block();
        for store in stores() {
            store.save_block(&config.genesis_block).unwrap();
            store.save_block(&block).unwrap();

            // Same transaction at a new height must not leave a partial block behind
            let mut copy = block.clone();
            copy.height = 3;
            copy.id = "0011223344556677".to_string();
            assert!(matches!(
                store.save_block(&copy),
                Err(StorageError::AlreadyExists(_))
            ));
            assert!(store.block_at_height(3).unwrap().is_none());
            assert!(store.block_by_id(&copy.id).unwrap().is_none());
        }
    }

    #[test]
    fn test_delete_block() {
        let (config, block) = second_block();
        for store in stores() {
            store.save_block(&config.genesis_block).unwrap();
            store.save_block(&block).unwrap();
            store.delete_block(&block).unwrap();

            assert_eq!(store.last_block().unwrap(), Some(config.genesis_block.clone()));
            assert!(store.block_by_id(&block.id).unwrap().is_none());
            assert!(store
                .existing_transaction_ids(&[block.transactions[0].id.clone()])
                .unwrap()
                .is_empty());
            assert!(matches!(
                store.delete_block(&block),
                Err(StorageError::NotFound(_))
            ));
        }
    }

    #[test]
    fn test_statistics() {
        let (config, block) = second_block();
        for store in stores() {
            store.save_block(&config.genesis_block).unwrap();
            store.save_block(&block).unwrap();
            let statistics = store.statistics().unwrap();

            assert_eq!(statistics.block_count, 2);
            assert_eq!(statistics.block_total_fee, statistics.transaction_total_fee);
            assert_eq!(statistics.block_total_amount, statistics.transaction_total_amount);
            assert_eq!(
                statistics.transaction_count as usize,
                config.genesis_block.transactions.len() + 1
            );
        }
    }

    #[test]
    fn test_accounts_and_rounds() {
        for store in stores() {
            let mut account = Account::new(Address("AJWRd23HNEhPLkK1ymMnwnDBX2a7QBZqff".to_string()));
            account.balance = 42;
            store.save_accounts(&[account.clone()], 7).unwrap();

            assert_eq!(store.account(&account.address).unwrap(), Some(account.clone()));
            assert_eq!(store.all_accounts().unwrap(), vec![account.clone()]);
            assert_eq!(store.synced_height().unwrap(), Some(7));

            store.clear_accounts().unwrap();
            assert!(store.all_accounts().unwrap().is_empty());
            assert_eq!(store.synced_height().unwrap(), None);
            store.save_accounts(&[account.clone()], 7).unwrap();

            let delegates = vec![
                RoundDelegate {
                    public_key: "02bb".to_string(),
                    balance: 5,
                    round: 1,
                },
                RoundDelegate {
                    public_key: "02aa".to_string(),
                    balance: 5,
                    round: 1,
                },
                RoundDelegate {
                    public_key: "02cc".to_string(),
                    balance: 9,
                    round: 1,
                },
            ];
            store.save_round(1, &delegates).unwrap();
            let stored: Vec<String> = store
                .round(1)
                .unwrap()
                .unwrap()
                .into_iter()
                .map(|d| d.public_key)
                .collect();
            assert_eq!(stored, vec!["02cc", "02aa", "02bb"]);

            store.delete_round(1).unwrap();
            assert!(store.round(1).unwrap().is_none());
        }
    }
}
