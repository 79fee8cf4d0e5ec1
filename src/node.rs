//! Runs the chain on a single task and syncs it from peers.
//!
//! The ledger task owns the `Blockchain` and the pool and serves commands
//! strictly in arrival order. Everything else talks to it through a
//! cloneable `LedgerHandle`.

use futures::future::join_all;
use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use std::sync::Arc;

use crate::blockchain::block::{Block, BlockError};
use crate::blockchain::chain::{BlockVerdict, Blockchain, BlockchainError, ChainState};
use crate::blockchain::pool::{GuardResult, PoolError, TransactionPool};
use crate::blockchain::transaction::Transaction;
use crate::config::NetworkConfig;
use crate::peer::{Peer, PeerError, PeerHeaders};

/// Queue depth of the ledger task
pub const COMMAND_BUFFER: usize = 256;

/// Errors surfaced by the ledger task and the sync loop
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Peer error: {0}")]
    Peer(#[from] PeerError),

    #[error("Peer {peer} is incompatible: {reason}")]
    Incompatible { peer: String, reason: String },

    #[error("Malformed block from peer: {0}")]
    Block(#[from] BlockError),

    #[error("Block {id} at height {height} was not accepted: {verdict:?}")]
    NotAccepted {
        id: String,
        height: u64,
        verdict: BlockVerdict,
    },

    #[error("Chain error: {0}")]
    Chain(#[from] BlockchainError),

    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Verification task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Ledger task has stopped")]
    LedgerStopped,
}

/// Snapshot of the chain as seen by the ledger task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub height: u64,
    pub last_block_id: String,
    pub last_timestamp: u32,
    pub state: ChainState,
    pub pool_size: usize,
}

impl NodeStatus {
    pub fn is_syncing(&self) -> bool {
        self.state == ChainState::Syncing
    }
}

/// Requests served by the ledger task
#[derive(Debug)]
pub enum Command {
    /// `verify_errors` is `None` when the block still needs verifying
    ProcessBlock {
        block: Block,
        verify_errors: Option<Vec<String>>,
        reply: oneshot::Sender<Result<BlockVerdict, BlockchainError>>,
    },
    AddTransactions {
        transactions: Vec<Transaction>,
        reply: oneshot::Sender<Result<GuardResult, PoolError>>,
    },
    Status {
        /// Epoch seconds used to refresh the sync state
        now: u32,
        reply: oneshot::Sender<NodeStatus>,
    },
    RollbackTo {
        height: u64,
        reply: oneshot::Sender<Result<u64, BlockchainError>>,
    },
}

/// Cloneable front of the ledger task
#[derive(Debug, Clone)]
pub struct LedgerHandle {
    sender: mpsc::Sender<Command>,
}

impl LedgerHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SyncError> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(build(reply))
            .await
            .map_err(|_| SyncError::LedgerStopped)?;
        response.await.map_err(|_| SyncError::LedgerStopped)
    }

    pub async fn process_block(&self, block: Block) -> Result<BlockVerdict, SyncError> {
        Ok(self
            .request(|reply| Command::ProcessBlock {
                block,
                verify_errors: None,
                reply,
            })
            .await??)
    }

    /// Offers a block whose verification already ran elsewhere
    pub async fn process_verified_block(
        &self,
        block: Block,
        verify_errors: Vec<String>,
    ) -> Result<BlockVerdict, SyncError> {
        Ok(self
            .request(|reply| Command::ProcessBlock {
                block,
                verify_errors: Some(verify_errors),
                reply,
            })
            .await??)
    }

    pub async fn add_transactions(&self, transactions: Vec<Transaction>) -> Result<GuardResult, SyncError> {
        Ok(self
            .request(|reply| Command::AddTransactions {
                transactions,
                reply,
            })
            .await??)
    }

    pub async fn status(&self, now: u32) -> Result<NodeStatus, SyncError> {
        self.request(|reply| Command::Status { now, reply }).await
    }

    /// Returns the number of blocks reverted
    pub async fn rollback_to(&self, height: u64) -> Result<u64, SyncError> {
        Ok(self
            .request(|reply| Command::RollbackTo { height, reply })
            .await??)
    }
}

fn status(chain: &Blockchain, pool: &TransactionPool) -> NodeStatus {
    let (last_block_id, last_timestamp) = chain
        .last_block()
        .map(|b| (b.id.clone(), b.timestamp))
        .unwrap_or_default();
    NodeStatus {
        height: chain.height(),
        last_block_id,
        last_timestamp,
        state: chain.state(),
        pool_size: pool.len(),
    }
}

/// Moves a started chain onto its own task. The task ends when every
/// handle is dropped.
pub fn spawn_ledger(mut chain: Blockchain, pool: TransactionPool) -> (LedgerHandle, JoinHandle<Blockchain>) {
    let (sender, mut receiver) = mpsc::channel(COMMAND_BUFFER);

    let task = tokio::spawn(async move {
        while let Some(command) = receiver.recv().await {
            match command {
                Command::ProcessBlock {
                    block,
                    verify_errors,
                    reply,
                } => {
                    let result = match verify_errors {
                        Some(errors) => chain.process_verified_block(block.clone(), errors),
                        None => chain.process_block(block.clone()),
                    };
                    if let Ok(BlockVerdict::Accepted) = &result {
                        if let Err(e) = pool.remove_forged(&block) {
                            warn!("Failed to prune pool after block {}: {}", block.id, e);
                        }
                    }
                    if let Err(e) = &result {
                        error!("Failed to process block {}: {}", block.id, e);
                    }
                    let _ = reply.send(result);
                }
                Command::AddTransactions {
                    transactions,
                    reply,
                } => {
                    let result = pool.add_transactions(
                        transactions,
                        chain.ledger(),
                        chain.storage().as_ref(),
                        chain.height() + 1,
                    );
                    let _ = reply.send(result);
                }
                Command::Status { now, reply } => {
                    chain.update_state(now);
                    let _ = reply.send(status(&chain, &pool));
                }
                Command::RollbackTo { height, reply } => {
                    let result = chain.rollback_to(height).and_then(|reverted| {
                        for block in reverted.iter() {
                            if let Err(e) = pool.readd_reverted(block) {
                                warn!("Failed to return transactions of {}: {}", block.id, e);
                            }
                        }
                        Ok(reverted.len() as u64)
                    });
                    let _ = reply.send(result);
                }
            }
        }
        info!("Ledger task stopped at height {}", chain.height());
        chain
    });

    (LedgerHandle { sender }, task)
}

/// Decodes and verifies `raw` blocks on blocking threads.
///
/// Returns the decoded prefix up to the first malformed block, and that
/// block's error if there was one.
pub async fn preverify(
    config: Arc<NetworkConfig>,
    raw: Vec<Vec<u8>>,
) -> (Vec<(Block, Vec<String>)>, Option<SyncError>) {
    let tasks = raw.into_iter().map(|bytes| {
        let config = config.clone();
        tokio::task::spawn_blocking(move || -> Result<(Block, Vec<String>), BlockError> {
            let block = Block::deserialize(&bytes, &config)?;
            let errors = if config.exceptions.is_forced_block(&block.id) {
                Vec::new()
            } else {
                block.verify(&config)
            };
            Ok((block, errors))
        })
    });

    let mut verified = Vec::new();
    for result in join_all(tasks).await {
        match result {
            Ok(Ok(entry)) => verified.push(entry),
            Ok(Err(e)) => return (verified, Some(e.into())),
            Err(e) => return (verified, Some(e.into())),
        }
    }
    (verified, None)
}

/// Pulls blocks from peers while the chain lags behind the network
pub struct Syncer {
    config: Arc<NetworkConfig>,
    handle: LedgerHandle,
    peers: Vec<Arc<dyn Peer>>,
    clock: Box<dyn Fn() -> u32 + Send + Sync>,
}

impl Syncer {
    /// Uses the wall clock translated to epoch seconds
    pub fn new(config: Arc<NetworkConfig>, handle: LedgerHandle, peers: Vec<Arc<dyn Peer>>) -> Self {
        let clock_config = config.clone();
        Syncer {
            config,
            handle,
            peers,
            clock: Box::new(move || clock_config.slots().get_time()),
        }
    }

    /// Replaces the clock, in epoch seconds
    pub fn with_clock(mut self, clock: impl Fn() -> u32 + Send + Sync + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    /// Downloads one batch from `peer` and feeds it to the ledger task.
    /// Stops at the first block that is not accepted; blocks before it stay
    /// committed.
    pub async fn sync_batch(&self, peer: &dyn Peer) -> Result<usize, SyncError> {
        let headers = peer.headers().await?;
        PeerHeaders::local(&self.config)
            .is_compatible(&headers)
            .map_err(|reason| SyncError::Incompatible {
                peer: peer.name(),
                reason,
            })?;

        let status = self.handle.status((self.clock)()).await?;
        let raw = peer.download_blocks(status.height).await?;
        if raw.is_empty() {
            return Ok(0);
        }
        debug!("Downloaded {} blocks from {}", raw.len(), peer.name());

        let (verified, malformed) = preverify(self.config.clone(), raw).await;
        let mut applied = 0;
        for (block, errors) in verified {
            let id = block.id.clone();
            let height = block.height;
            let verdict = self.handle.process_verified_block(block, errors).await?;
            if !verdict.is_accepted() {
                return Err(SyncError::NotAccepted { id, height, verdict });
            }
            applied += 1;
        }

        match malformed {
            Some(e) => Err(e),
            None => Ok(applied),
        }
    }

    /// Syncs until the chain is no longer behind or no peer has anything
    /// usable. Returns the number of blocks applied.
    pub async fn run(&self) -> Result<u64, SyncError> {
        let mut applied = 0u64;
        let mut idle_peers = 0;
        let mut index = 0;

        if self.peers.is_empty() {
            return Ok(0);
        }

        loop {
            let status = self.handle.status((self.clock)()).await?;
            if !status.is_syncing() {
                info!("Synced at height {}", status.height);
                return Ok(applied);
            }
            if idle_peers >= self.peers.len() {
                warn!("No peer could extend height {}", status.height);
                return Ok(applied);
            }

            let peer = &self.peers[index % self.peers.len()];
            index += 1;
            match self.sync_batch(peer.as_ref()).await {
                Ok(0) => idle_peers += 1,
                Ok(count) => {
                    applied += count as u64;
                    idle_peers = 0;
                }
                Err(SyncError::LedgerStopped) => return Err(SyncError::LedgerStopped),
                Err(e) => {
                    warn!("Sync from {} failed: {}", peer.name(), e);
                    idle_peers += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::crypto::Keys;
    use crate::blockchain::genesis::{testnet, Testnet};
    use crate::blockchain::storage::MemoryStorage;
    use crate::peer::StaticPeer;

    fn fresh_chain(network: &Testnet) -> Blockchain {
        let mut chain = Blockchain::new(
            Arc::new(network.config.clone()),
            Arc::new(MemoryStorage::new()),
        );
        chain.start().unwrap();
        chain
    }

    /// Forges `count` blocks on a separate chain and returns them
    fn forge_blocks(network: &Testnet, count: u32) -> Vec<Block> {
        let mut source = fresh_chain(network);
        let bob = Keys::from_passphrase("bob").unwrap();
        let mut blocks = Vec::new();
        for i in 0..count {
            let mut transaction = Transaction::transfer(
                network.config.version,
                i,
                network.delegates[0].public_key(),
                bob.address(network.config.version),
                1,
                10_000_000,
            );
            transaction.sign(&network.delegates[0]).unwrap();
            let block = source.forge_next(&network.delegates, vec![transaction]).unwrap();
            assert!(source.process_block(block.clone()).unwrap().is_accepted());
            blocks.push(block);
        }
        blocks
    }

    fn syncer(network: &Testnet, handle: LedgerHandle, peers: Vec<Arc<dyn Peer>>) -> Syncer {
        Syncer::new(Arc::new(network.config.clone()), handle, peers).with_clock(|| 1_000_000)
    }

    #[tokio::test]
    async fn test_sync_from_peer() {
        let network = testnet();
        let blocks = forge_blocks(&network, 9);
        let peer = StaticPeer::new("good", &network.config, &blocks, 4).unwrap();

        let pool = TransactionPool::new(Arc::new(network.config.clone()), 100);
        let (handle, task) = spawn_ledger(fresh_chain(&network), pool);
        let applied = syncer(&network, handle.clone(), vec![Arc::new(peer)])
            .run()
            .await
            .unwrap();

        assert_eq!(applied, 9);
        let status = handle.status(1_000_000).await.unwrap();
        assert_eq!(status.height, 10);
        assert_eq!(status.last_block_id, blocks[8].id);

        drop(handle);
        let chain = task.await.unwrap();
        assert!(chain.verify_integrity().is_ok());
    }

    #[tokio::test]
    async fn test_bad_batch_is_abandoned_for_another_peer() {
        let network = testnet();
        let blocks = forge_blocks(&network, 6);

        let mut tampered = blocks.clone();
        tampered[3].transactions[0].amount = 2;
        let bad = StaticPeer::new("bad", &network.config, &tampered, 10).unwrap();
        let good = StaticPeer::new("good", &network.config, &blocks, 10).unwrap();

        let pool = TransactionPool::new(Arc::new(network.config.clone()), 100);
        let (handle, _task) = spawn_ledger(fresh_chain(&network), pool);
        let syncer = syncer(&network, handle.clone(), vec![Arc::new(bad), Arc::new(good)]);

        let error = syncer.sync_batch(syncer.peers[0].as_ref()).await.unwrap_err();
        assert!(matches!(error, SyncError::NotAccepted { height: 5, .. }));
        assert_eq!(handle.status(1_000_000).await.unwrap().height, 4);

        syncer.run().await.unwrap();
        assert_eq!(handle.status(1_000_000).await.unwrap().height, 7);
    }

    #[tokio::test]
    async fn test_incompatible_peer_is_refused() {
        let network = testnet();
        let blocks = forge_blocks(&network, 2);
        let mut headers = PeerHeaders::local(&network.config);
        headers.nethash = "11".repeat(32);
        let peer = StaticPeer::new("foreign", &network.config, &blocks, 10)
            .unwrap()
            .with_headers(headers);

        let pool = TransactionPool::new(Arc::new(network.config.clone()), 100);
        let (handle, _task) = spawn_ledger(fresh_chain(&network), pool);
        let syncer = syncer(&network, handle.clone(), vec![Arc::new(peer)]);

        assert!(matches!(
            syncer.sync_batch(syncer.peers[0].as_ref()).await,
            Err(SyncError::Incompatible { .. })
        ));
        assert_eq!(syncer.run().await.unwrap(), 0);
        assert_eq!(handle.status(1_000_000).await.unwrap().height, 1);
    }

    #[tokio::test]
    async fn test_malformed_bytes_keep_the_decoded_prefix() {
        let network = testnet();
        let blocks = forge_blocks(&network, 3);
        let mut raw: Vec<(u64, String, Vec<u8>)> = blocks
            .iter()
            .map(|b| (b.height, b.id.clone(), b.serialize_full(&network.config).unwrap()))
            .collect();
        raw[1].2.truncate(20);
        let peer = StaticPeer::from_raw("broken", PeerHeaders::local(&network.config), raw, 10);

        let pool = TransactionPool::new(Arc::new(network.config.clone()), 100);
        let (handle, _task) = spawn_ledger(fresh_chain(&network), pool);
        let syncer = syncer(&network, handle.clone(), vec![Arc::new(peer)]);

        assert!(matches!(
            syncer.sync_batch(syncer.peers[0].as_ref()).await,
            Err(SyncError::Block(_))
        ));
        assert_eq!(handle.status(1_000_000).await.unwrap().height, 2);
    }

    #[tokio::test]
    async fn test_pool_and_rollback_through_handle() {
        let network = testnet();
        let pool = TransactionPool::new(Arc::new(network.config.clone()), 100);
        let (handle, _task) = spawn_ledger(fresh_chain(&network), pool);

        let mut transaction = Transaction::transfer(
            network.config.version,
            1,
            network.delegates[1].public_key(),
            Keys::from_passphrase("carol").unwrap().address(network.config.version),
            5,
            10_000_000,
        );
        transaction.sign(&network.delegates[1]).unwrap();
        let result = handle.add_transactions(vec![transaction.clone()]).await.unwrap();
        assert_eq!(result.accepted, vec![transaction.id.clone()]);
        assert_eq!(handle.status(0).await.unwrap().pool_size, 1);

        let blocks = forge_blocks(&network, 2);
        for block in blocks {
            assert!(handle.process_block(block).await.unwrap().is_accepted());
        }
        assert_eq!(handle.rollback_to(1).await.unwrap(), 2);
        let status = handle.status(0).await.unwrap();
        assert_eq!(status.height, 1);
        assert_eq!(status.pool_size, 3);
    }
}
