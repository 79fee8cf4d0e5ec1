//! The seam to remote nodes. Transport lives elsewhere; the engine only
//! needs to download blocks, look for a common chain and compare headers.

use async_trait::async_trait;
use log::debug;
use thiserror::Error;

use crate::blockchain::block::{Block, BlockError};
use crate::config::NetworkConfig;

/// Errors a peer request can end with
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("Peer {0} is unreachable")]
    Unreachable(String),

    #[error("Peer {0} timed out")]
    Timeout(String),

    #[error("Peer {peer} sent an invalid response: {reason}")]
    InvalidResponse { peer: String, reason: String },
}

/// Headers every request carries, used to refuse peers of another network
/// or protocol generation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerHeaders {
    pub version: String,
    pub nethash: String,
    pub milestone_hash: String,
}

impl PeerHeaders {
    /// Headers of this node
    pub fn local(config: &NetworkConfig) -> Self {
        PeerHeaders {
            version: config.protocol_version.clone(),
            nethash: config.nethash.clone(),
            milestone_hash: config.milestone_hash(),
        }
    }

    fn major(&self) -> &str {
        self.version.split('.').next().unwrap_or("")
    }

    /// Same network, same milestones and the same protocol major version
    pub fn is_compatible(&self, other: &PeerHeaders) -> Result<(), String> {
        if self.nethash != other.nethash {
            return Err(format!("nethash {} differs from {}", other.nethash, self.nethash));
        }
        if self.milestone_hash != other.milestone_hash {
            return Err(format!(
                "milestone hash {} differs from {}",
                other.milestone_hash, self.milestone_hash
            ));
        }
        if self.major() != other.major() {
            return Err(format!(
                "protocol version {} is incompatible with {}",
                other.version, self.version
            ));
        }
        Ok(())
    }
}

/// A remote node
#[async_trait]
pub trait Peer: Send + Sync {
    /// Name used in logs
    fn name(&self) -> String;

    async fn headers(&self) -> Result<PeerHeaders, PeerError>;

    /// Serialized full blocks following `from_height`, in height order
    async fn download_blocks(&self, from_height: u64) -> Result<Vec<Vec<u8>>, PeerError>;

    /// Whether the peer knows any of `ids`
    async fn has_common_blocks(&self, ids: &[String]) -> Result<bool, PeerError>;
}

/// A peer answering from a fixed list of blocks.
///
/// Backs block import in the binary and the sync tests.
#[derive(Debug, Clone)]
pub struct StaticPeer {
    name: String,
    headers: PeerHeaders,
    blocks: Vec<(u64, String, Vec<u8>)>,
    batch_size: usize,
}

impl StaticPeer {
    /// # Arguments
    ///
    /// * `name` - Name used in logs
    /// * `config` - Network the blocks belong to, used for headers and ids
    /// * `blocks` - Blocks to serve, in height order
    /// * `batch_size` - Blocks returned per download
    pub fn new(
        name: &str,
        config: &NetworkConfig,
        blocks: &[Block],
        batch_size: usize,
    ) -> Result<Self, BlockError> {
        let blocks = blocks
            .iter()
            .map(|block| Ok((block.height, block.id.clone(), block.serialize_full(config)?)))
            .collect::<Result<Vec<_>, BlockError>>()?;
        Ok(StaticPeer {
            name: name.to_string(),
            headers: PeerHeaders::local(config),
            blocks,
            batch_size,
        })
    }

    /// Serves raw bytes without decoding them first
    pub fn from_raw(name: &str, headers: PeerHeaders, blocks: Vec<(u64, String, Vec<u8>)>, batch_size: usize) -> Self {
        StaticPeer {
            name: name.to_string(),
            headers,
            blocks,
            batch_size,
        }
    }

    pub fn with_headers(mut self, headers: PeerHeaders) -> Self {
        self.headers = headers;
        self
    }
}

#[async_trait]
impl Peer for StaticPeer {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn headers(&self) -> Result<PeerHeaders, PeerError> {
        Ok(self.headers.clone())
    }

    async fn download_blocks(&self, from_height: u64) -> Result<Vec<Vec<u8>>, PeerError> {
        let blocks: Vec<Vec<u8>> = self
            .blocks
            .iter()
            .filter(|(height, _, _)| *height > from_height)
            .take(self.batch_size)
            .map(|(_, _, bytes)| bytes.clone())
            .collect();
        debug!("{} serves {} blocks after height {}", self.name, blocks.len(), from_height);
        Ok(blocks)
    }

    async fn has_common_blocks(&self, ids: &[String]) -> Result<bool, PeerError> {
        Ok(self
            .blocks
            .iter()
            .any(|(_, id, _)| ids.iter().any(|wanted| wanted == id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::genesis::testnet;

    #[test]
    fn test_headers_compatibility() {
        let network = testnet();
        let local = PeerHeaders::local(&network.config);
        assert!(local.is_compatible(&local).is_ok());

        let mut patch = local.clone();
        patch.version = "2.9.1".to_string();
        assert!(local.is_compatible(&patch).is_ok());

        let mut major = local.clone();
        major.version = "3.0.0".to_string();
        assert!(local.is_compatible(&major).is_err());

        let mut other_network = local.clone();
        other_network.nethash = "00".repeat(32);
        assert!(local.is_compatible(&other_network).is_err());

        let mut other_milestones = local.clone();
        other_milestones.milestone_hash = "0123456789abcdef".to_string();
        assert!(local.is_compatible(&other_milestones).is_err());
    }

    #[tokio::test]
    async fn test_static_peer_serves_batches() {
        let network = testnet();
        let genesis = network.config.genesis_block.clone();
        let peer = StaticPeer::new("static", &network.config, &[genesis.clone()], 10).unwrap();

        assert_eq!(peer.download_blocks(0).await.unwrap().len(), 1);
        assert!(peer.download_blocks(1).await.unwrap().is_empty());
        assert!(peer.has_common_blocks(&[genesis.id.clone()]).await.unwrap());
        assert!(!peer.has_common_blocks(&["nope".to_string()]).await.unwrap());
        assert_eq!(peer.headers().await.unwrap(), PeerHeaders::local(&network.config));
    }
}
