//! Round bookkeeping and the forging order of active delegates.

use log::{debug, info};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::collections::HashSet;
use std::sync::Arc;

use super::crypto::sha256;
use super::ledger::{Ledger, LedgerError};
use super::storage::{Storage, StorageError};
use crate::config::NetworkConfig;

/// Errors raised while computing or recording rounds
#[derive(Debug, Error)]
pub enum RoundError {
    #[error("Round {round} needs {required} delegates, only {available} registered")]
    NotEnoughDelegates {
        round: u64,
        required: usize,
        available: usize,
    },

    #[error("No delegate snapshot stored for round {0}")]
    MissingSnapshot(u64),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

/// One entry of a round snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundDelegate {
    pub public_key: String,
    /// Vote balance when the snapshot was taken
    pub balance: i64,
    pub round: u64,
}

/// Position of a height inside its round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundInfo {
    pub round: u64,
    /// First height of the round
    pub round_height: u64,
    pub next_round: u64,
    pub max_delegates: u32,
}

impl RoundInfo {
    pub fn from_height(config: &NetworkConfig, height: u64) -> Self {
        let max_delegates = config.milestone(height).active_delegates;
        let n = max_delegates as u64;
        let round = height.saturating_sub(1) / n + 1;
        RoundInfo {
            round,
            round_height: (round - 1) * n + 1,
            next_round: round + 1,
            max_delegates,
        }
    }

    /// Last height of the round
    pub fn last_height(&self) -> u64 {
        self.round_height + self.max_delegates as u64 - 1
    }

    pub fn is_last_height(&self, height: u64) -> bool {
        height == self.last_height()
    }
}

/// Reorders `delegates` with the round-seeded pass used for forging order.
///
/// Four swaps per seed, then the seed is re-hashed and one index skipped.
pub fn shuffle(round: u64, delegates: &mut [String]) {
    let len = delegates.len();
    if len == 0 {
        return;
    }

    let mut seed = sha256(round.to_string().as_bytes());
    let mut i = 0;
    while i < len {
        let mut x = 0;
        while x < 4 && i < len {
            let target = seed[x] as usize % len;
            delegates.swap(target, i);
            i += 1;
            x += 1;
        }
        seed = sha256(&seed);
        i += 1;
    }
}

/// Computes forging order from stored snapshots and records new ones at
/// round boundaries. The order of the current round is cached.
#[derive(Debug)]
pub struct RoundEngine {
    config: Arc<NetworkConfig>,
    cache: Option<(u64, Vec<String>)>,
}

impl RoundEngine {
    pub fn new(config: Arc<NetworkConfig>) -> Self {
        RoundEngine {
            config,
            cache: None,
        }
    }

    pub fn info(&self, height: u64) -> RoundInfo {
        RoundInfo::from_height(&self.config, height)
    }

    /// Drops the cached order
    pub fn invalidate(&mut self) {
        self.cache = None;
    }

    /// The shuffled forging order for the round containing `height`
    pub fn get_active_delegates(
        &mut self,
        height: u64,
        store: &dyn Storage,
    ) -> Result<Vec<String>, RoundError> {
        let info = self.info(height);
        if let Some((round, delegates)) = &self.cache {
            if *round == info.round {
                return Ok(delegates.clone());
            }
        }

        let snapshot = store
            .round(info.round)?
            .ok_or(RoundError::MissingSnapshot(info.round))?;
        if snapshot.len() < info.max_delegates as usize {
            return Err(RoundError::NotEnoughDelegates {
                round: info.round,
                required: info.max_delegates as usize,
                available: snapshot.len(),
            });
        }

        let mut delegates: Vec<String> = snapshot
            .into_iter()
            .take(info.max_delegates as usize)
            .map(|d| d.public_key)
            .collect();
        shuffle(info.round, &mut delegates);

        debug!("Computed forging order for round {}", info.round);
        self.cache = Some((info.round, delegates.clone()));
        Ok(delegates)
    }

    /// The delegate allowed to forge at `height` in the slot of `timestamp`
    pub fn forger_at(
        &mut self,
        height: u64,
        timestamp: u32,
        store: &dyn Storage,
    ) -> Result<String, RoundError> {
        let delegates = self.get_active_delegates(height, store)?;
        let slot = self.config.slots().get_slot_number(height, timestamp);
        let index = (slot % delegates.len() as u64) as usize;
        Ok(delegates[index].clone())
    }

    /// Snapshots the top delegates for `round` from the ledger
    fn snapshot(&self, round: u64, height: u64, ledger: &Ledger, store: &dyn Storage) -> Result<(), RoundError> {
        let required = self.config.milestone(height).active_delegates as usize;
        let top = ledger.top_delegates(required);
        if top.len() < required {
            return Err(RoundError::NotEnoughDelegates {
                round,
                required,
                available: top.len(),
            });
        }

        let delegates: Vec<RoundDelegate> = top
            .into_iter()
            .filter_map(|account| {
                account.public_key.map(|public_key| RoundDelegate {
                    public_key,
                    balance: account.vote_balance,
                    round,
                })
            })
            .collect();
        store.save_round(round, &delegates)?;
        Ok(())
    }

    /// Delegates of the round ending at `height` that forged nothing in it
    fn missed(&mut self, height: u64, store: &dyn Storage) -> Result<Vec<String>, RoundError> {
        let info = self.info(height);
        let delegates = self.get_active_delegates(height, store)?;
        let forged: HashSet<String> = store
            .blocks_from_height(info.round_height, info.max_delegates as usize)?
            .into_iter()
            .filter(|block| block.height <= height)
            .map(|block| block.generator_public_key)
            .collect();
        Ok(delegates
            .into_iter()
            .filter(|key| !forged.contains(key))
            .collect())
    }

    /// Called after the block at `height` is committed. The genesis block
    /// opens round 1; the last block of a round closes it, records missed
    /// blocks and snapshots the next round.
    pub fn apply_round(
        &mut self,
        height: u64,
        ledger: &Ledger,
        store: &dyn Storage,
    ) -> Result<(), RoundError> {
        if height == 1 {
            self.snapshot(1, height, ledger, store)?;
            self.invalidate();
            info!("Opened round 1");
        }

        let info = self.info(height);
        if !info.is_last_height(height) {
            return Ok(());
        }

        for public_key in self.missed(height, store)? {
            debug!("Delegate {} missed its slot in round {}", public_key, info.round);
            ledger.record_missed_block(&public_key, true)?;
        }

        self.snapshot(info.next_round, height + 1, ledger, store)?;
        self.invalidate();
        info!("Closed round {} at height {}", info.round, height);
        Ok(())
    }

    /// Exact inverse of `apply_round`. Must run while the block at `height`
    /// is still stored.
    pub fn revert_round(
        &mut self,
        height: u64,
        ledger: &Ledger,
        store: &dyn Storage,
    ) -> Result<(), RoundError> {
        let info = self.info(height);
        if info.is_last_height(height) {
            store.delete_round(info.next_round)?;
            self.invalidate();
            for public_key in self.missed(height, store)? {
                ledger.record_missed_block(&public_key, false)?;
            }
            info!("Reopened round {} at height {}", info.round, height);
        }
        self.invalidate();
        Ok(())
    }
}
