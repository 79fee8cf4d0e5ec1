use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::blockchain::block::Block;
use crate::blockchain::crypto::sha256;
use crate::blockchain::milestone::{Milestone, Milestones, Slots};

/// Errors that can occur while loading the network configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Operator-maintained overrides for historically anomalous data
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Exceptions {
    /// Block ids accepted without verification
    #[serde(default)]
    pub blocks: HashSet<String>,

    /// Transaction ids applied without ledger checks
    #[serde(default)]
    pub transactions: HashSet<String>,

    /// Computed transaction id -> id recorded on chain
    #[serde(default)]
    pub transaction_id_fixes: HashMap<String, String>,
}

impl Exceptions {
    pub fn is_forced_block(&self, id: &str) -> bool {
        self.blocks.contains(id)
    }

    pub fn is_forced_transaction(&self, id: &str) -> bool {
        self.transactions.contains(id)
    }

    pub fn resolve_transaction_id(&self, computed: &str) -> String {
        self.transaction_id_fixes
            .get(computed)
            .cloned()
            .unwrap_or_else(|| computed.to_string())
    }
}

fn default_protocol_version() -> String {
    "2.0.0".to_string()
}

/// Everything a node needs to know about the network it joins.
///
/// Built once at startup and shared behind an `Arc`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfig {
    pub name: String,

    /// Address version byte, also written as the transaction network byte
    pub version: u8,

    /// Identifies the network; equals the genesis payload hash
    pub nethash: String,

    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,

    pub milestones: Milestones,

    pub genesis_block: Block,

    #[serde(default)]
    pub exceptions: Exceptions,
}

impl NetworkConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        NetworkConfig::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: NetworkConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Structural checks. Whether the genesis matches the nethash is decided
    /// when the chain starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.genesis_block.height != 1 {
            return Err(ConfigError::Invalid(format!(
                "genesis block must have height 1, found {}",
                self.genesis_block.height
            )));
        }
        if self.genesis_block.previous_block.is_some() {
            return Err(ConfigError::Invalid(
                "genesis block must not reference a previous block".to_string(),
            ));
        }
        if self.nethash.len() != 64 || hex::decode(&self.nethash).is_err() {
            return Err(ConfigError::Invalid(format!(
                "nethash must be 64 hex characters, got {:?}",
                self.nethash
            )));
        }
        Ok(())
    }

    pub fn milestone(&self, height: u64) -> &Milestone {
        self.milestones.get(height)
    }

    pub fn slots(&self) -> Slots<'_> {
        Slots::new(&self.milestones)
    }

    /// First 16 hex characters of SHA-256 over the JSON milestone list
    pub fn milestone_hash(&self) -> String {
        let json = serde_json::to_vec(self.milestones.entries()).unwrap_or_default();
        hex::encode(sha256(&json))[..16].to_string()
    }

    /// Public keys that distributed funds in the genesis block. Their
    /// wallets may go negative while that block is applied.
    pub fn is_genesis_wallet(&self, public_key: &str) -> bool {
        self.genesis_block
            .transactions
            .iter()
            .any(|t| t.sender_public_key == public_key && !t.credits().is_empty())
    }
}
