use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::collections::HashSet;

use super::codec::{decode_hex, write_hex, write_u32, write_u64, CodecError, Reader};
use super::crypto::{sha256, verify_signature, CryptoError, Keys, PUBLIC_KEY_LENGTH};
use super::transaction::{Transaction, TransactionError};
use crate::config::NetworkConfig;

/// First byte of a DER signature
const DER_SEQUENCE: u8 = 0x30;

/// Errors that can occur during block operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BlockError {
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Transaction error: {0}")]
    Transaction(#[from] TransactionError),

    #[error("Height {0} does not fit the wire format")]
    HeightOverflow(u64),

    #[error("Block at height {0} has no previous block reference")]
    MissingPreviousBlock(u64),

    #[error("Block amounts overflow")]
    AmountOverflow,

    #[error("Block {id} has {count} transactions, more than the wire format allows")]
    TooManyTransactions { id: String, count: usize },
}

/// Represents a block in the chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    /// Content-derived identifier
    #[serde(default)]
    pub id: String,

    pub version: u32,

    /// Seconds since the ledger epoch
    pub timestamp: u32,

    /// 1-based position in the chain
    pub height: u64,

    /// Parent id, absent only for the genesis block
    #[serde(default)]
    pub previous_block: Option<String>,

    pub number_of_transactions: u32,
    pub total_amount: u64,
    pub total_fee: u64,
    pub reward: u64,
    pub payload_length: u32,
    pub payload_hash: String,
    pub generator_public_key: String,

    #[serde(default)]
    pub block_signature: Option<String>,

    #[serde(default)]
    pub transactions: Vec<Transaction>,
}

/// SHA-256 over the concatenated transaction ids, and the concatenation length
pub fn payload(transactions: &[Transaction]) -> Result<(String, u32), CodecError> {
    let mut bytes = Vec::with_capacity(transactions.len() * 32);
    for transaction in transactions {
        bytes.extend_from_slice(&decode_hex("transaction id", &transaction.id)?);
    }
    Ok((hex::encode(sha256(&bytes)), bytes.len() as u32))
}

/// Derives an id from a digest: the full 32 bytes, or the legacy first
/// 8 bytes in reversed order
pub fn id_from_digest(digest: &[u8; 32], full_sha256: bool) -> String {
    if full_sha256 {
        hex::encode(digest)
    } else {
        let mut legacy = [0u8; 8];
        legacy.copy_from_slice(&digest[..8]);
        legacy.reverse();
        hex::encode(legacy)
    }
}

/// Width of the previous-block field, decided by the scheme the parent id
/// was produced with
fn previous_block_width(config: &NetworkConfig, height: u64) -> usize {
    if config
        .milestone(height.saturating_sub(1).max(1))
        .block
        .id_full_sha256
    {
        32
    } else {
        8
    }
}

impl Block {
    /// Builds and signs a block on top of `previous`.
    ///
    /// Transaction order is kept; `block_id` and `sequence` are filled in.
    pub fn create(
        keys: &Keys,
        previous: Option<&Block>,
        timestamp: u32,
        transactions: Vec<Transaction>,
        config: &NetworkConfig,
    ) -> Result<Block, BlockError> {
        let height = previous.map(|p| p.height + 1).unwrap_or(1);
        let milestone = config.milestone(height);

        let mut total_amount: u64 = 0;
        let mut total_fee: u64 = 0;
        for transaction in &transactions {
            total_amount = total_amount
                .checked_add(transaction.amount)
                .ok_or(BlockError::AmountOverflow)?;
            total_fee = total_fee
                .checked_add(transaction.fee)
                .ok_or(BlockError::AmountOverflow)?;
        }
        let (payload_hash, payload_length) = payload(&transactions)?;

        let mut block = Block {
            id: String::new(),
            version: milestone.block.version,
            timestamp,
            height,
            previous_block: previous.map(|p| p.id.clone()),
            number_of_transactions: transactions.len() as u32,
            total_amount,
            total_fee,
            reward: milestone.reward,
            payload_length,
            payload_hash,
            generator_public_key: keys.public_key().to_string(),
            block_signature: None,
            transactions,
        };
        block.sign(keys, config)?;
        Ok(block)
    }

    /// Signs the header and recomputes the id
    pub fn sign(&mut self, keys: &Keys, config: &NetworkConfig) -> Result<(), BlockError> {
        let header = self.header_bytes(config, false)?;
        self.block_signature = Some(keys.sign(&header));
        self.id = self.compute_id(config)?;
        let id = self.id.clone();
        for (sequence, transaction) in self.transactions.iter_mut().enumerate() {
            transaction.block_id = Some(id.clone());
            transaction.sequence = Some(sequence as u32);
        }
        Ok(())
    }

    /// Id derived from the signature-free header
    pub fn compute_id(&self, config: &NetworkConfig) -> Result<String, BlockError> {
        let digest = sha256(&self.header_bytes(config, false)?);
        let full = config.milestone(self.height).block.id_full_sha256;
        Ok(id_from_digest(&digest, full))
    }

    /// Header bytes including the block signature
    pub fn serialize(&self, config: &NetworkConfig) -> Result<Vec<u8>, BlockError> {
        self.header_bytes(config, true)
    }

    /// Header, signature, then `(u32 length, bytes)` for every transaction
    pub fn serialize_full(&self, config: &NetworkConfig) -> Result<Vec<u8>, BlockError> {
        let mut out = self.header_bytes(config, true)?;
        for transaction in &self.transactions {
            let bytes = transaction.serialize()?;
            write_u32(&mut out, bytes.len() as u32);
            out.extend_from_slice(&bytes);
        }
        Ok(out)
    }

    fn header_bytes(
        &self,
        config: &NetworkConfig,
        include_signature: bool,
    ) -> Result<Vec<u8>, BlockError> {
        let height = u32::try_from(self.height).map_err(|_| BlockError::HeightOverflow(self.height))?;
        let mut out = Vec::with_capacity(256);

        write_u32(&mut out, self.version);
        write_u32(&mut out, self.timestamp);
        write_u32(&mut out, height);

        let width = previous_block_width(config, self.height);
        match &self.previous_block {
            Some(previous) => write_hex(&mut out, "previous_block", previous, Some(width))?,
            None if self.height == 1 => out.extend(std::iter::repeat(0u8).take(width)),
            None => return Err(BlockError::MissingPreviousBlock(self.height)),
        }

        write_u32(&mut out, self.number_of_transactions);
        write_u64(&mut out, self.total_amount);
        write_u64(&mut out, self.total_fee);
        write_u64(&mut out, self.reward);
        write_u32(&mut out, self.payload_length);
        write_hex(&mut out, "payload_hash", &self.payload_hash, Some(32))?;
        write_hex(
            &mut out,
            "generator_public_key",
            &self.generator_public_key,
            Some(PUBLIC_KEY_LENGTH),
        )?;

        if include_signature {
            if let Some(signature) = &self.block_signature {
                write_hex(&mut out, "block_signature", signature, None)?;
            }
        }

        Ok(out)
    }

    /// Parses a full block.
    ///
    /// The genesis block keeps the id recorded in the configuration; every
    /// other id is recomputed from the header.
    pub fn deserialize(bytes: &[u8], config: &NetworkConfig) -> Result<Block, BlockError> {
        let mut reader = Reader::new(bytes);

        let version = reader.read_u32()?;
        let timestamp = reader.read_u32()?;
        let height = reader.read_u32()? as u64;

        let width = previous_block_width(config, height);
        let previous = reader.take(width)?;
        let previous_block = if height == 1 {
            None
        } else {
            Some(hex::encode(previous))
        };

        let number_of_transactions = reader.read_u32()?;
        let total_amount = reader.read_u64()?;
        let total_fee = reader.read_u64()?;
        let reward = reader.read_u64()?;
        let payload_length = reader.read_u32()?;
        let payload_hash = reader.read_hex(32)?;
        let generator_public_key = reader.read_hex(PUBLIC_KEY_LENGTH)?;

        let block_signature = if reader.peek() == Some(DER_SEQUENCE) {
            Some(reader.read_signature()?)
        } else {
            None
        };

        // Each transaction needs at least its 4-byte length prefix
        if number_of_transactions as usize > reader.remaining() / 4 {
            return Err(CodecError::MalformedPayload(format!(
                "block declares {} transactions but only {} bytes remain",
                number_of_transactions,
                reader.remaining()
            ))
            .into());
        }

        let mut transactions = Vec::with_capacity(number_of_transactions as usize);
        for _ in 0..number_of_transactions {
            let length = reader.read_u32()? as usize;
            let transaction_bytes = reader.take(length)?;
            transactions.push(Transaction::deserialize(
                transaction_bytes,
                &config.exceptions,
            )?);
        }

        if !reader.is_empty() {
            return Err(CodecError::MalformedPayload(format!(
                "{} trailing bytes after block",
                reader.remaining()
            ))
            .into());
        }

        let mut block = Block {
            id: String::new(),
            version,
            timestamp,
            height,
            previous_block,
            number_of_transactions,
            total_amount,
            total_fee,
            reward,
            payload_length,
            payload_hash,
            generator_public_key,
            block_signature,
            transactions,
        };

        block.id = if height == 1 {
            config.genesis_block.id.clone()
        } else {
            block.compute_id(config)?
        };
        let id = block.id.clone();
        for (sequence, transaction) in block.transactions.iter_mut().enumerate() {
            transaction.block_id = Some(id.clone());
            transaction.sequence = Some(sequence as u32);
        }

        Ok(block)
    }

    /// Checks the generator signature over the signature-free header
    pub fn verify_signature(&self, config: &NetworkConfig) -> Result<bool, BlockError> {
        let signature = match &self.block_signature {
            Some(signature) => signature,
            None => return Ok(false),
        };
        let header = self.header_bytes(config, false)?;
        Ok(verify_signature(&header, signature, &self.generator_public_key)?)
    }

    /// Full internal consistency check. Returns every problem found.
    pub fn verify(&self, config: &NetworkConfig) -> Vec<String> {
        let mut errors = Vec::new();
        let milestone = config.milestone(self.height);

        if self.version != milestone.block.version {
            errors.push(format!(
                "Invalid block version {}, expected {}",
                self.version, milestone.block.version
            ));
        }

        match self.verify_signature(config) {
            Ok(true) => {}
            Ok(false) => errors.push("Failed to verify block signature".to_string()),
            Err(e) => errors.push(format!("Failed to verify block signature: {}", e)),
        }

        if self.height == 1 {
            if self.previous_block.is_some() {
                errors.push("Genesis block must not have a previous block".to_string());
            }
        } else {
            if self.previous_block.is_none() {
                errors.push("Invalid previous block".to_string());
            }
            if self.reward != milestone.reward {
                errors.push(format!(
                    "Invalid block reward: {} expected: {}",
                    self.reward, milestone.reward
                ));
            }
            match self.compute_id(config) {
                Ok(id) if id == self.id => {}
                Ok(id) => errors.push(format!("Invalid block id {}, expected {}", self.id, id)),
                Err(e) => errors.push(format!("Failed to compute block id: {}", e)),
            }
        }

        if self.transactions.len() != self.number_of_transactions as usize {
            errors.push("Invalid number of transactions".to_string());
        }
        if self.transactions.len() > milestone.block.max_transactions as usize {
            errors.push("Transactions length is too high".to_string());
        }
        if self.payload_length > milestone.block.max_payload {
            errors.push("Payload length is too high".to_string());
        }

        let mut total_amount: u64 = 0;
        let mut total_fee: u64 = 0;
        let mut ids = HashSet::new();
        for transaction in &self.transactions {
            if !config.exceptions.is_forced_transaction(&transaction.id) {
                if let Err(e) = transaction.verify(&config.exceptions) {
                    errors.push(format!("Failed to verify transaction {}: {}", transaction.id, e));
                }
            }
            if !ids.insert(transaction.id.as_str()) {
                errors.push(format!("Encountered duplicate transaction: {}", transaction.id));
            }
            total_amount = total_amount.saturating_add(transaction.amount);
            total_fee = total_fee.saturating_add(transaction.fee);
        }

        if total_amount != self.total_amount {
            errors.push("Invalid total amount".to_string());
        }
        if total_fee != self.total_fee {
            errors.push("Invalid total fee".to_string());
        }

        match payload(&self.transactions) {
            Ok((hash, length)) => {
                if hash != self.payload_hash {
                    errors.push("Invalid payload hash".to_string());
                }
                if length != self.payload_length {
                    errors.push("Invalid payload length".to_string());
                }
            }
            Err(e) => errors.push(format!("Failed to compute payload hash: {}", e)),
        }

        errors
    }
}
