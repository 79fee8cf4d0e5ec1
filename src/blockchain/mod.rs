// Blockchain module
//
// This module contains the ledger and consensus engine:
// - Wire codec for transactions and blocks
// - Keys, addresses and signatures
// - Milestones, slots and delegate rounds
// - Wallet ledger, transaction pool and chain state machine
// - Block and account storage

pub mod account;
pub mod block;
pub mod chain;
pub mod codec;
pub mod crypto;
pub mod genesis;
pub mod ledger;
pub mod milestone;
pub mod pool;
pub mod round;
pub mod storage;
pub mod transaction;

// Re-export main components for easier access
pub use account::Account;
pub use block::Block;
pub use chain::{decide, BlockVerdict, Blockchain, BlockchainError, ChainState};
pub use crypto::{Address, Keys};
pub use ledger::Ledger;
pub use pool::TransactionPool;
pub use round::RoundEngine;
pub use storage::{MemoryStorage, SledStorage, Storage};
pub use transaction::Transaction;
