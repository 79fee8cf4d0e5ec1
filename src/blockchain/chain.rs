use log::{debug, error, info, warn};
use thiserror::Error;

use std::collections::HashSet;
use std::sync::Arc;

use super::block::{Block, BlockError};
use super::crypto::Keys;
use super::ledger::{Ledger, LedgerError};
use super::round::{RoundEngine, RoundError};
use super::storage::{Storage, StorageError};
use super::transaction::{Transaction, TransactionError};
use crate::config::NetworkConfig;

/// Integrity recovery gives up after this many rollbacks
pub const MAX_INTEGRITY_ATTEMPTS: u64 = 5;

/// Blocks read per step when replaying the stored chain
const REPLAY_BATCH: usize = 1000;

/// A node is behind when its last block lags this many blocktimes
pub const SYNC_LAG_BLOCKTIMES: u64 = 3;

/// Errors that can occur during blockchain operations
#[derive(Debug, Error)]
pub enum BlockchainError {
    #[error("Transaction error: {0}")]
    TransactionError(#[from] TransactionError),

    #[error("Block error: {0}")]
    BlockError(#[from] BlockError),

    #[error("Ledger error: {0}")]
    LedgerError(#[from] LedgerError),

    #[error("Round error: {0}")]
    RoundError(#[from] RoundError),

    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),

    #[error("Block {id} at height {height} forged by {actual}, expected {expected}")]
    GeneratorMismatch {
        id: String,
        height: u64,
        expected: String,
        actual: String,
    },

    #[error("Chain discontinuity: {0}")]
    ChainDiscontinuity(String),

    #[error("Duplicate transactions already forged: {0}")]
    DuplicateTransaction(String),

    #[error("Integrity check failed: {0}")]
    IntegrityCheckFailed(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Chain has not been started")]
    NotStarted,

    #[error("The genesis block cannot be reverted")]
    CannotRevertGenesis,

    #[error("No keys for delegate {0}")]
    NoForgerKeys(String),
}

/// Where the node stands relative to the network
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainState {
    AwaitingGenesis,
    Syncing,
    Synced,
}

/// Outcome of offering a block to the chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockVerdict {
    Accepted,
    Rejected(String),
    /// Not applied here, but still fine to relay
    DiscardedButBroadcastable(String),
}

impl BlockVerdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, BlockVerdict::Accepted)
    }
}

/// Everything `decide` needs to know about a candidate beyond the block itself
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CandidateFacts {
    /// Listed in the exception table
    pub forced: bool,
    /// A block with the same id is already stored
    pub already_forged: bool,
    /// Problems reported by `Block::verify`
    pub verify_errors: Vec<String>,
    /// Delegate expected for the candidate's slot, when the round is known
    pub expected_generator: Option<String>,
    pub candidate_slot: u64,
    pub last_slot: u64,
    /// Contained transaction ids that are already persisted
    pub forged_transactions: Vec<String>,
}

/// A verdict plus whether the candidate proves a double forge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub verdict: BlockVerdict,
    pub double_forge: bool,
}

impl Decision {
    fn plain(verdict: BlockVerdict) -> Self {
        Decision {
            verdict,
            double_forge: false,
        }
    }
}

/// Decides what to do with `candidate` given the current last block.
///
/// Pure: every lookup has already been folded into `facts`.
pub fn decide(candidate: &Block, last: &Block, facts: &CandidateFacts) -> Decision {
    if facts.forced {
        return if facts.already_forged {
            Decision::plain(BlockVerdict::Rejected(format!(
                "exception block {} already forged",
                candidate.id
            )))
        } else {
            Decision::plain(BlockVerdict::Accepted)
        };
    }

    if !facts.verify_errors.is_empty() {
        return Decision::plain(BlockVerdict::Rejected(facts.verify_errors.join(", ")));
    }

    let generator_valid = facts.expected_generator.as_deref()
        == Some(candidate.generator_public_key.as_str());

    let chained = candidate.previous_block.as_deref() == Some(last.id.as_str())
        && candidate.height == last.height + 1
        && facts.candidate_slot > facts.last_slot;

    if !chained {
        if candidate.height > last.height + 1 {
            return Decision::plain(BlockVerdict::DiscardedButBroadcastable(
                BlockchainError::ChainDiscontinuity(format!(
                    "block {} at height {} is ahead of height {}",
                    candidate.id, candidate.height, last.height
                ))
                .to_string(),
            ));
        }
        if candidate.height < last.height
            || (candidate.height == last.height && candidate.id == last.id)
        {
            return Decision::plain(BlockVerdict::DiscardedButBroadcastable(format!(
                "block {} at height {} is already known or stale",
                candidate.id, candidate.height
            )));
        }
        if candidate.timestamp < last.timestamp {
            return Decision::plain(BlockVerdict::Rejected(
                BlockchainError::ChainDiscontinuity(format!(
                    "block {} is older than its parent",
                    candidate.id
                ))
                .to_string(),
            ));
        }

        let double_forge = generator_valid && candidate.height == last.height;
        let reason = if double_forge {
            format!(
                "delegate {} forged a competing block {} at height {}",
                candidate.generator_public_key, candidate.id, candidate.height
            )
        } else {
            BlockchainError::ChainDiscontinuity(format!(
                "block {} does not chain onto {}",
                candidate.id, last.id
            ))
            .to_string()
        };
        return Decision {
            verdict: BlockVerdict::Rejected(reason),
            double_forge,
        };
    }

    if !generator_valid {
        return Decision::plain(BlockVerdict::Rejected(
            BlockchainError::GeneratorMismatch {
                id: candidate.id.clone(),
                height: candidate.height,
                expected: facts
                    .expected_generator
                    .clone()
                    .unwrap_or_else(|| "unknown".to_string()),
                actual: candidate.generator_public_key.clone(),
            }
            .to_string(),
        ));
    }

    if !facts.forged_transactions.is_empty() {
        return Decision::plain(BlockVerdict::DiscardedButBroadcastable(
            BlockchainError::DuplicateTransaction(facts.forged_transactions.join(", "))
                .to_string(),
        ));
    }

    Decision::plain(BlockVerdict::Accepted)
}

/// Represents the chain: the ledger, its rounds and the stored blocks,
/// advanced one block at a time by a single owner
pub struct Blockchain {
    config: Arc<NetworkConfig>,

    /// Block and account stores
    storage: Arc<dyn Storage>,

    /// Wallet state
    ledger: Ledger,

    rounds: RoundEngine,

    state: ChainState,

    last_block: Option<Block>,

    /// Delegates caught forging two blocks for one height
    double_forgers: HashSet<String>,
}

impl std::fmt::Debug for Blockchain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Blockchain")
            .field("state", &self.state)
            .field("height", &self.height())
            .finish()
    }
}

impl Blockchain {
    /// Creates a chain over `storage`. Nothing is loaded until `start`.
    pub fn new(config: Arc<NetworkConfig>, storage: Arc<dyn Storage>) -> Self {
        Blockchain {
            ledger: Ledger::new(config.clone()),
            rounds: RoundEngine::new(config.clone()),
            config,
            storage,
            state: ChainState::AwaitingGenesis,
            last_block: None,
            double_forgers: HashSet::new(),
        }
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn state(&self) -> ChainState {
        self.state
    }

    pub fn last_block(&self) -> Option<&Block> {
        self.last_block.as_ref()
    }

    /// Height of the last block, 0 before start
    pub fn height(&self) -> u64 {
        self.last_block.as_ref().map(|b| b.height).unwrap_or(0)
    }

    pub fn double_forgers(&self) -> &HashSet<String> {
        &self.double_forgers
    }

    /// Loads the stored chain, or commits the configured genesis block on
    /// an empty store. A genesis block that does not match the nethash
    /// is fatal.
    pub fn start(&mut self) -> Result<(), BlockchainError> {
        let genesis = self.config.genesis_block.clone();
        if genesis.payload_hash != self.config.nethash {
            return Err(BlockchainError::Configuration(format!(
                "genesis payload hash {} does not match nethash {}",
                genesis.payload_hash, self.config.nethash
            )));
        }

        match self.storage.last_block()? {
            None => {
                info!("Empty store, committing genesis block {}", genesis.id);
                self.commit(genesis)?;
            }
            Some(last) => {
                match self.storage.block_at_height(1)? {
                    Some(stored) if stored.id == genesis.id => {}
                    Some(stored) => {
                        return Err(BlockchainError::Configuration(format!(
                            "stored genesis {} differs from configured {}",
                            stored.id, genesis.id
                        )))
                    }
                    None => {
                        return Err(BlockchainError::Configuration(
                            "store has blocks but no genesis".to_string(),
                        ))
                    }
                }

                let height = last.height;
                self.last_block = Some(last);
                if self.storage.synced_height()? == Some(height) {
                    let accounts = self.storage.all_accounts()?;
                    info!("Loaded {} wallets at height {}", accounts.len(), height);
                    self.ledger.load(accounts);
                } else {
                    warn!("Wallets are not in sync with height {}, replaying", height);
                    self.replay()?;
                }
                self.rounds.invalidate();
                self.recover_integrity()?;
            }
        }

        self.state = ChainState::Syncing;
        info!("Chain started at height {}", self.height());
        Ok(())
    }

    /// Syncing while the last block lags more than a few blocktimes behind
    /// `now` (epoch seconds), synced otherwise
    pub fn update_state(&mut self, now: u32) -> ChainState {
        if self.state == ChainState::AwaitingGenesis {
            return self.state;
        }
        let next = if self.is_behind(now) {
            ChainState::Syncing
        } else {
            ChainState::Synced
        };
        if next != self.state {
            info!("Chain state {:?} -> {:?}", self.state, next);
            self.state = next;
        }
        self.state
    }

    pub fn is_behind(&self, now: u32) -> bool {
        let last = match &self.last_block {
            Some(last) => last,
            None => return true,
        };
        let blocktime = self.config.milestone(last.height).blocktime as u64;
        (now as u64).saturating_sub(last.timestamp as u64) > SYNC_LAG_BLOCKTIMES * blocktime
    }

    /// The delegate allowed to forge at `height` in the slot of `timestamp`
    pub fn expected_forger(&mut self, height: u64, timestamp: u32) -> Result<String, BlockchainError> {
        Ok(self
            .rounds
            .forger_at(height, timestamp, self.storage.as_ref())?)
    }

    /// The active forging order for the round containing `height`
    pub fn active_delegates(&mut self, height: u64) -> Result<Vec<String>, BlockchainError> {
        Ok(self
            .rounds
            .get_active_delegates(height, self.storage.as_ref())?)
    }

    /// First slot after the last block
    pub fn next_slot(&self) -> Result<u64, BlockchainError> {
        let last = self.last_block.as_ref().ok_or(BlockchainError::NotStarted)?;
        Ok(self
            .config
            .slots()
            .get_slot_number(last.height + 1, last.timestamp)
            + 1)
    }

    /// Builds and signs the block for `slot` with whichever of `forgers`
    /// owns that slot
    pub fn forge_at_slot(
        &mut self,
        forgers: &[Keys],
        slot: u64,
        transactions: Vec<Transaction>,
    ) -> Result<Block, BlockchainError> {
        let last = self
            .last_block
            .clone()
            .ok_or(BlockchainError::NotStarted)?;
        let height = last.height + 1;
        let timestamp = u32::try_from(self.config.slots().get_slot_time(height, slot))
            .map_err(|_| BlockchainError::Configuration(format!("slot {} out of range", slot)))?;

        let forger = self.expected_forger(height, timestamp)?;
        let keys = forgers
            .iter()
            .find(|k| k.public_key() == forger)
            .ok_or(BlockchainError::NoForgerKeys(forger))?;

        Ok(Block::create(
            keys,
            Some(&last),
            timestamp,
            transactions,
            &self.config,
        )?)
    }

    /// `forge_at_slot` for the first free slot
    pub fn forge_next(
        &mut self,
        forgers: &[Keys],
        transactions: Vec<Transaction>,
    ) -> Result<Block, BlockchainError> {
        let slot = self.next_slot()?;
        self.forge_at_slot(forgers, slot, transactions)
    }

    fn facts(&mut self, block: &Block, verify_errors: Vec<String>) -> Result<CandidateFacts, BlockchainError> {
        let last = self.last_block.as_ref().ok_or(BlockchainError::NotStarted)?;
        let slots = self.config.slots();
        let candidate_slot = slots.get_slot_number(block.height, block.timestamp);
        let last_slot = slots.get_slot_number(last.height, last.timestamp);

        let expected_generator = match self.rounds.forger_at(
            block.height,
            block.timestamp,
            self.storage.as_ref(),
        ) {
            Ok(forger) => Some(forger),
            Err(RoundError::MissingSnapshot(round)) => {
                debug!("No snapshot for round {} of block {}", round, block.id);
                None
            }
            Err(e) => return Err(e.into()),
        };

        let ids: Vec<String> = block.transactions.iter().map(|t| t.id.clone()).collect();

        Ok(CandidateFacts {
            forced: self.config.exceptions.is_forced_block(&block.id),
            already_forged: self.storage.block_by_id(&block.id)?.is_some(),
            verify_errors,
            expected_generator,
            candidate_slot,
            last_slot,
            forged_transactions: self.storage.existing_transaction_ids(&ids)?,
        })
    }

    /// Verifies and offers one block. Validation failures are verdicts;
    /// only storage or round failures are errors.
    pub fn process_block(&mut self, block: Block) -> Result<BlockVerdict, BlockchainError> {
        let errors = if self.config.exceptions.is_forced_block(&block.id) {
            Vec::new()
        } else {
            block.verify(&self.config)
        };
        self.process_verified_block(block, errors)
    }

    /// Like `process_block` for a block whose `Block::verify` result is
    /// already known
    pub fn process_verified_block(
        &mut self,
        block: Block,
        verify_errors: Vec<String>,
    ) -> Result<BlockVerdict, BlockchainError> {
        if self.state == ChainState::AwaitingGenesis {
            return Err(BlockchainError::NotStarted);
        }
        let last = self
            .last_block
            .clone()
            .ok_or(BlockchainError::NotStarted)?;

        let facts = self.facts(&block, verify_errors)?;
        let decision = decide(&block, &last, &facts);

        if decision.double_forge {
            warn!(
                "Double forge by {} at height {}",
                block.generator_public_key, block.height
            );
            self.double_forgers
                .insert(block.generator_public_key.clone());
        }

        match decision.verdict {
            BlockVerdict::Accepted => {
                let id = block.id.clone();
                let height = block.height;
                match self.commit(block) {
                    Ok(()) => {
                        info!("Accepted block {} at height {}", id, height);
                        Ok(BlockVerdict::Accepted)
                    }
                    Err(BlockchainError::LedgerError(e)) => {
                        warn!("Block {} failed to apply: {}", id, e);
                        Ok(BlockVerdict::Rejected(e.to_string()))
                    }
                    Err(e) => Err(e),
                }
            }
            BlockVerdict::Rejected(reason) => {
                warn!("Rejected block {} at height {}: {}", block.id, block.height, reason);
                Ok(BlockVerdict::Rejected(reason))
            }
            BlockVerdict::DiscardedButBroadcastable(reason) => {
                debug!("Discarded block {}: {}", block.id, reason);
                Ok(BlockVerdict::DiscardedButBroadcastable(reason))
            }
        }
    }

    /// Applies `block` to the ledger, persists it, closes its round if
    /// needed and saves the touched wallets
    fn commit(&mut self, block: Block) -> Result<(), BlockchainError> {
        self.ledger.apply_block(&block)?;

        if let Err(e) = self.storage.save_block(&block) {
            error!("Failed to store block {}: {}", block.id, e);
            self.ledger.revert_block(&block)?;
            return Err(e.into());
        }

        if let Err(e) = self
            .rounds
            .apply_round(block.height, &self.ledger, self.storage.as_ref())
        {
            error!("Failed to apply round at height {}: {}", block.height, e);
            self.ledger.revert_block(&block)?;
            self.storage.delete_block(&block)?;
            return Err(e.into());
        }

        self.storage
            .save_accounts(&self.ledger.take_dirty(), block.height)?;
        self.last_block = Some(block);
        Ok(())
    }

    /// Exact inverse of the last commit
    pub fn revert_last_block(&mut self) -> Result<Block, BlockchainError> {
        let last = self
            .last_block
            .clone()
            .ok_or(BlockchainError::NotStarted)?;
        if last.height <= 1 {
            return Err(BlockchainError::CannotRevertGenesis);
        }

        self.rounds
            .revert_round(last.height, &self.ledger, self.storage.as_ref())?;
        self.ledger.revert_block(&last)?;
        self.storage.delete_block(&last)?;

        let previous = self
            .storage
            .block_at_height(last.height - 1)?
            .ok_or_else(|| {
                BlockchainError::ChainDiscontinuity(format!(
                    "no stored block below height {}",
                    last.height
                ))
            })?;
        self.storage
            .save_accounts(&self.ledger.take_dirty(), previous.height)?;

        info!("Reverted block {} at height {}", last.id, last.height);
        self.last_block = Some(previous);
        Ok(last)
    }

    /// Reverts blocks until the chain is at `height`. The genesis block
    /// always stays.
    pub fn rollback_to(&mut self, height: u64) -> Result<Vec<Block>, BlockchainError> {
        let target = height.max(1);
        let mut reverted = Vec::new();
        while self.height() > target {
            reverted.push(self.revert_last_block()?);
        }
        if !reverted.is_empty() {
            info!("Rolled back {} blocks to height {}", reverted.len(), target);
        }
        Ok(reverted)
    }

    /// Compares ledger totals with stored block totals
    pub fn verify_integrity(&self) -> Result<(), BlockchainError> {
        let statistics = self.storage.statistics()?;
        let mut errors = Vec::new();

        if statistics.block_count != self.height() {
            errors.push(format!(
                "{} stored blocks at height {}",
                statistics.block_count,
                self.height()
            ));
        }
        if statistics.block_total_fee != statistics.transaction_total_fee {
            errors.push(format!(
                "block fees {} differ from transaction fees {}",
                statistics.block_total_fee, statistics.transaction_total_fee
            ));
        }
        if statistics.block_total_amount != statistics.transaction_total_amount {
            errors.push(format!(
                "block amounts {} differ from transaction amounts {}",
                statistics.block_total_amount, statistics.transaction_total_amount
            ));
        }

        let accounts = self.ledger.accounts();
        let total_balance = self.ledger.total_balance();
        if total_balance != statistics.total_reward as i128 {
            errors.push(format!(
                "wallet balances sum to {}, rewards to {}",
                total_balance, statistics.total_reward
            ));
        }
        let forged_fees: u128 = accounts.iter().map(|a| a.forged_fees as u128).sum();
        if forged_fees != statistics.block_total_fee {
            errors.push(format!(
                "forged fees {} differ from block fees {}",
                forged_fees, statistics.block_total_fee
            ));
        }
        let produced: u64 = accounts.iter().map(|a| a.produced_blocks).sum();
        if produced != statistics.block_count {
            errors.push(format!(
                "{} produced blocks for {} stored",
                produced, statistics.block_count
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(BlockchainError::IntegrityCheckFailed(errors.join("; ")))
        }
    }

    /// Verifies integrity, rolling back one more round and replaying on each
    /// failure. Fatal after `MAX_INTEGRITY_ATTEMPTS` rollbacks.
    pub fn recover_integrity(&mut self) -> Result<(), BlockchainError> {
        let mut attempt = 0;
        loop {
            match self.verify_integrity() {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= MAX_INTEGRITY_ATTEMPTS => {
                    error!("Giving up after {} rollbacks: {}", attempt, e);
                    return Err(e);
                }
                Err(e) => {
                    attempt += 1;
                    let info = self.rounds.info(self.height());
                    let round = info.round.saturating_sub(attempt);
                    let target = round * info.max_delegates as u64;
                    error!(
                        "{}; rolling back to height {} (attempt {}/{})",
                        e, target, attempt, MAX_INTEGRITY_ATTEMPTS
                    );
                    self.rollback_to(target)?;
                    self.replay()?;
                }
            }
        }
    }

    /// Rebuilds the ledger and round snapshots from the stored blocks
    pub fn replay(&mut self) -> Result<(), BlockchainError> {
        let height = self.height();
        self.ledger.load(Vec::new());
        self.rounds.invalidate();
        self.storage.clear_accounts()?;

        let mut next = 1;
        while next <= height {
            let blocks = self.storage.blocks_from_height(next, REPLAY_BATCH)?;
            if blocks.is_empty() {
                break;
            }
            for block in blocks.into_iter().take_while(|b| b.height <= height) {
                if block.height != next {
                    return Err(BlockchainError::ChainDiscontinuity(format!(
                        "expected height {} while replaying, found {}",
                        next, block.height
                    )));
                }
                self.ledger.apply_block(&block)?;
                self.rounds
                    .apply_round(block.height, &self.ledger, self.storage.as_ref())?;
                next += 1;
            }
        }

        self.storage
            .save_accounts(&self.ledger.take_dirty(), height)?;
        info!("Replayed {} blocks", next - 1);
        Ok(())
    }
}
