//! Builds a network configuration around a freshly signed genesis block.

use chrono::{TimeZone, Utc};
use log::info;
use thiserror::Error;

use super::block::{Block, BlockError};
use super::crypto::{Address, CryptoError, Keys};
use super::milestone::{BlockLimits, Milestone, MilestoneError, Milestones, StaticFees};
use super::transaction::{Asset, Transaction, TransactionError, Vote};
use crate::config::{Exceptions, NetworkConfig};

/// Errors that can occur while building a genesis block
#[derive(Debug, Error)]
pub enum GenesisError {
    #[error("Block error: {0}")]
    Block(#[from] BlockError),

    #[error("Transaction error: {0}")]
    Transaction(#[from] TransactionError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Milestone error: {0}")]
    Milestone(#[from] MilestoneError),

    #[error("Genesis needs at least {required} delegates, got {available}")]
    NotEnoughDelegates { required: usize, available: usize },
}

/// A delegate seeded by the genesis block
struct GenesisDelegate {
    keys: Keys,
    username: String,
    funding: u64,
}

/// Collects premine and delegates, then signs the genesis block
pub struct GenesisBuilder {
    name: String,
    version: u8,
    milestones: Milestones,
    genesis_keys: Keys,
    timestamp: u32,
    premine: Vec<(Address, u64)>,
    delegates: Vec<GenesisDelegate>,
    exceptions: Exceptions,
}

impl GenesisBuilder {
    /// # Arguments
    ///
    /// * `name` - Network name
    /// * `version` - Address version byte
    /// * `milestones` - Protocol parameters, the first one carrying the epoch
    /// * `genesis_keys` - Keys that distribute the initial supply and sign the block
    pub fn new(name: &str, version: u8, milestones: Milestones, genesis_keys: Keys) -> Self {
        GenesisBuilder {
            name: name.to_string(),
            version,
            milestones,
            genesis_keys,
            timestamp: 0,
            premine: Vec::new(),
            delegates: Vec::new(),
            exceptions: Exceptions::default(),
        }
    }

    pub fn timestamp(mut self, timestamp: u32) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn premine(mut self, recipient: Address, amount: u64) -> Self {
        self.premine.push((recipient, amount));
        self
    }

    /// Funds `keys`, registers `username` for it and makes it vote for itself
    pub fn delegate(mut self, keys: Keys, username: &str, funding: u64) -> Self {
        self.delegates.push(GenesisDelegate {
            keys,
            username: username.to_string(),
            funding,
        });
        self
    }

    pub fn exceptions(mut self, exceptions: Exceptions) -> Self {
        self.exceptions = exceptions;
        self
    }

    pub fn build(self) -> Result<NetworkConfig, GenesisError> {
        let required = self.milestones.get(1).active_delegates as usize;
        if self.delegates.len() < required {
            return Err(GenesisError::NotEnoughDelegates {
                required,
                available: self.delegates.len(),
            });
        }

        let mut config = NetworkConfig {
            name: self.name.clone(),
            version: self.version,
            nethash: String::new(),
            protocol_version: "2.0.0".to_string(),
            milestones: self.milestones.clone(),
            genesis_block: placeholder(&self.genesis_keys),
            exceptions: self.exceptions.clone(),
        };

        let mut transactions = Vec::new();
        let sign = |mut transaction: Transaction, keys: &Keys| -> Result<Transaction, GenesisError> {
            transaction.sign(keys)?;
            Ok(transaction)
        };

        for (recipient, amount) in &self.premine {
            transactions.push(sign(
                Transaction::transfer(
                    self.version,
                    self.timestamp,
                    self.genesis_keys.public_key(),
                    recipient.clone(),
                    *amount,
                    0,
                ),
                &self.genesis_keys,
            )?);
        }

        for delegate in &self.delegates {
            transactions.push(sign(
                Transaction::transfer(
                    self.version,
                    self.timestamp,
                    self.genesis_keys.public_key(),
                    Address::from_public_key(delegate.keys.public_key(), self.version)?,
                    delegate.funding,
                    0,
                ),
                &self.genesis_keys,
            )?);
        }

        for delegate in &self.delegates {
            transactions.push(sign(
                Transaction::new(
                    self.version,
                    self.timestamp,
                    delegate.keys.public_key(),
                    0,
                    Asset::DelegateRegistration {
                        username: delegate.username.clone(),
                    },
                ),
                &delegate.keys,
            )?);
        }

        for delegate in &self.delegates {
            transactions.push(sign(
                Transaction::new(
                    self.version,
                    self.timestamp,
                    delegate.keys.public_key(),
                    0,
                    Asset::Vote {
                        votes: vec![Vote::Add(delegate.keys.public_key().to_string())],
                    },
                ),
                &delegate.keys,
            )?);
        }

        let block = Block::create(&self.genesis_keys, None, self.timestamp, transactions, &config)?;
        info!(
            "Built genesis block {} for {} with {} transactions",
            block.id,
            self.name,
            block.transactions.len()
        );

        config.nethash = block.payload_hash.clone();
        config.genesis_block = block;
        Ok(config)
    }
}

/// Stands in for the genesis block while the real one is being signed
fn placeholder(keys: &Keys) -> Block {
    Block {
        id: String::new(),
        version: 0,
        timestamp: 0,
        height: 1,
        previous_block: None,
        number_of_transactions: 0,
        total_amount: 0,
        total_fee: 0,
        reward: 0,
        payload_length: 0,
        payload_hash: String::new(),
        generator_public_key: keys.public_key().to_string(),
        block_signature: None,
        transactions: Vec::new(),
    }
}

/// A small local network with deterministic keys
#[derive(Debug, Clone)]
pub struct Testnet {
    pub config: NetworkConfig,
    pub genesis_keys: Keys,
    pub delegates: Vec<Keys>,
}

impl Testnet {
    /// Keys of the delegate owning `public_key`
    pub fn keys_for(&self, public_key: &str) -> Option<&Keys> {
        self.delegates.iter().find(|k| k.public_key() == public_key)
    }
}

pub const TESTNET_VERSION: u8 = 0x17;
pub const TESTNET_DELEGATES: usize = 4;
pub const TESTNET_BLOCKTIME: u32 = 8;
pub const TESTNET_REWARD: u64 = 200_000_000;
pub const TESTNET_DELEGATE_FUNDING: u64 = 10_000_000_000_000;

fn testnet_milestones() -> Result<Milestones, MilestoneError> {
    let block = BlockLimits {
        version: 0,
        max_transactions: 150,
        max_payload: 2_097_152,
        id_full_sha256: false,
    };
    let first = Milestone {
        height: 1,
        reward: 0,
        blocktime: TESTNET_BLOCKTIME,
        active_delegates: TESTNET_DELEGATES as u32,
        block: block.clone(),
        fees: StaticFees::default(),
        vendor_field_length: 64,
        epoch: Utc.with_ymd_and_hms(2017, 3, 21, 13, 0, 0).single(),
    };
    let rewarded = Milestone {
        height: 2,
        reward: TESTNET_REWARD,
        epoch: None,
        ..first.clone()
    };
    Milestones::new(vec![first, rewarded])
}

/// Builds the local test network.
///
/// Delegates are `delegate 1` .. `delegate 4` by passphrase, registered
/// as `genesis_1` .. `genesis_4`, each funded and voting for itself.
pub fn build_testnet() -> Result<Testnet, GenesisError> {
    let genesis_keys = Keys::from_passphrase("genesis wallet")?;
    let delegates = (1..=TESTNET_DELEGATES)
        .map(|i| Keys::from_passphrase(&format!("delegate {}", i)))
        .collect::<Result<Vec<_>, _>>()?;

    let mut builder = GenesisBuilder::new(
        "testnet",
        TESTNET_VERSION,
        testnet_milestones()?,
        genesis_keys.clone(),
    );
    for (i, keys) in delegates.iter().enumerate() {
        builder = builder.delegate(
            keys.clone(),
            &format!("genesis_{}", i + 1),
            TESTNET_DELEGATE_FUNDING,
        );
    }

    Ok(Testnet {
        config: builder.build()?,
        genesis_keys,
        delegates,
    })
}

/// `build_testnet` for tests, where failure is a bug
pub fn testnet() -> Testnet {
    match build_testnet() {
        Ok(testnet) => testnet,
        Err(e) => panic!("testnet genesis must build: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_testnet_is_consistent() {
        let network = testnet();
        let genesis = &network.config.genesis_block;

        assert_eq!(genesis.height, 1);
        assert_eq!(genesis.reward, 0);
        assert_eq!(genesis.id.len(), 16);
        assert_eq!(network.config.nethash, genesis.payload_hash);
        assert_eq!(genesis.transactions.len(), TESTNET_DELEGATES * 3);
        assert!(genesis.verify(&network.config).is_empty());
        assert!(network.config.validate().is_ok());
    }

    #[test]
    fn test_testnet_is_deterministic_up_to_signatures() {
        let a = testnet();
        let b = testnet();
        assert_eq!(a.config.nethash, b.config.nethash);
        assert_eq!(a.config.genesis_block.id, b.config.genesis_block.id);
        assert_eq!(a.delegates[0].public_key(), b.delegates[0].public_key());
    }

    #[test]
    fn test_builder_needs_enough_delegates() {
        let milestones = testnet_milestones().unwrap();
        let result = GenesisBuilder::new(
            "tiny",
            TESTNET_VERSION,
            milestones,
            Keys::from_passphrase("g").unwrap(),
        )
        .build();
        assert!(matches!(
            result,
            Err(GenesisError::NotEnoughDelegates { required: 4, available: 0 })
        ));
    }

    #[test]
    fn test_premine_is_included() {
        let network = testnet();
        let rich = Keys::from_passphrase("rich").unwrap().address(TESTNET_VERSION);
        let mut builder = GenesisBuilder::new(
            "premined",
            TESTNET_VERSION,
            network.config.milestones.clone(),
            network.genesis_keys.clone(),
        )
        .premine(rich.clone(), 5_000);
        for (i, keys) in network.delegates.iter().enumerate() {
            builder = builder.delegate(keys.clone(), &format!("d{}", i), 1);
        }
        let config = builder.build().unwrap();

        let credits: Vec<_> = config
            .genesis_block
            .transactions
            .iter()
            .flat_map(|t| t.credits())
            .collect();
        assert!(credits.contains(&(rich, 5_000)));
    }
}
