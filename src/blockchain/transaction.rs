use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::collections::HashSet;
use std::fmt;

use super::codec::{
    decode_hex, write_hex, write_short_bytes, write_u16, write_u32, write_u64, write_u8,
    CodecError, Reader, SENTINEL,
};
use super::crypto::{
    sha256, verify_signature, Address, CryptoError, Keys, ADDRESS_LENGTH, PUBLIC_KEY_LENGTH,
};
use crate::config::Exceptions;

/// Errors that can occur during transaction operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Transaction not signed")]
    NotSigned,

    #[error("Transaction {id} has an invalid signature")]
    SignatureInvalid { id: String },

    #[error("Transaction id mismatch: expected {expected}, got {actual}")]
    IdMismatch { expected: String, actual: String },

    #[error("Transaction amount overflow")]
    AmountOverflow,
}

/// The nine transaction kinds, tagged by their wire byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TransactionType {
    Transfer = 0,
    SecondSignature = 1,
    DelegateRegistration = 2,
    Vote = 3,
    MultiSignature = 4,
    Ipfs = 5,
    TimelockTransfer = 6,
    MultiPayment = 7,
    DelegateResignation = 8,
}

impl TransactionType {
    pub fn from_u8(value: u8) -> Result<Self, CodecError> {
        Ok(match value {
            0 => TransactionType::Transfer,
            1 => TransactionType::SecondSignature,
            2 => TransactionType::DelegateRegistration,
            3 => TransactionType::Vote,
            4 => TransactionType::MultiSignature,
            5 => TransactionType::Ipfs,
            6 => TransactionType::TimelockTransfer,
            7 => TransactionType::MultiPayment,
            8 => TransactionType::DelegateResignation,
            other => return Err(CodecError::UnknownTransactionType(other)),
        })
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A single vote or unvote for a delegate public key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Vote {
    Add(String),
    Remove(String),
}

impl Vote {
    pub fn public_key(&self) -> &str {
        match self {
            Vote::Add(key) | Vote::Remove(key) => key,
        }
    }
}

/// One leg of a multi-payment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payment {
    pub amount: u64,
    pub recipient_id: Address,
}

/// Multi-signature registration parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultiSignatureAsset {
    pub min: u8,
    pub lifetime: u8,
    pub keysgroup: Vec<String>,
}

/// Type-specific payload. The variant decides the transaction type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Asset {
    Transfer {
        #[serde(default)]
        expiration: u32,
    },
    #[serde(rename_all = "camelCase")]
    SecondSignature { public_key: String },
    DelegateRegistration { username: String },
    Vote { votes: Vec<Vote> },
    MultiSignature(MultiSignatureAsset),
    Ipfs { dag: String },
    #[serde(rename_all = "camelCase")]
    TimelockTransfer { timelock_type: u8, timelock: u32 },
    MultiPayment { payments: Vec<Payment> },
    DelegateResignation,
}

impl Asset {
    pub fn kind(&self) -> TransactionType {
        match self {
            Asset::Transfer { .. } => TransactionType::Transfer,
            Asset::SecondSignature { .. } => TransactionType::SecondSignature,
            Asset::DelegateRegistration { .. } => TransactionType::DelegateRegistration,
            Asset::Vote { .. } => TransactionType::Vote,
            Asset::MultiSignature(_) => TransactionType::MultiSignature,
            Asset::Ipfs { .. } => TransactionType::Ipfs,
            Asset::TimelockTransfer { .. } => TransactionType::TimelockTransfer,
            Asset::MultiPayment { .. } => TransactionType::MultiPayment,
            Asset::DelegateResignation => TransactionType::DelegateResignation,
        }
    }
}

/// Which signature fields to include when serializing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signatures {
    /// The payload every first signature and multi-signature signs
    None,
    /// The payload the second signature signs
    First,
    All,
}

/// Represents a transaction in the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    /// Content-derived identifier
    #[serde(default)]
    pub id: String,

    #[serde(default = "default_version")]
    pub version: u8,

    /// Network version byte
    pub network: u8,

    /// Seconds since the ledger epoch
    pub timestamp: u32,

    pub sender_public_key: String,

    #[serde(default)]
    pub recipient_id: Option<Address>,

    #[serde(default)]
    pub amount: u64,

    pub fee: u64,

    #[serde(default)]
    pub vendor_field: Option<String>,

    pub asset: Asset,

    #[serde(default)]
    pub signature: Option<String>,

    #[serde(default)]
    pub second_signature: Option<String>,

    /// Multi-signatures
    #[serde(default)]
    pub signatures: Vec<String>,

    /// Id of the confirming block, if confirmed
    #[serde(default)]
    pub block_id: Option<String>,

    /// Position inside the confirming block
    #[serde(default)]
    pub sequence: Option<u32>,
}

fn default_version() -> u8 {
    1
}

impl Transaction {
    /// Creates an unsigned transaction carrying `asset`.
    ///
    /// Multi-payments get their `amount` set to the sum of payments.
    pub fn new(network: u8, timestamp: u32, sender_public_key: &str, fee: u64, asset: Asset) -> Self {
        let amount = match &asset {
            Asset::MultiPayment { payments } => payments
                .iter()
                .fold(0u64, |sum, p| sum.saturating_add(p.amount)),
            _ => 0,
        };

        Transaction {
            id: String::new(),
            version: default_version(),
            network,
            timestamp,
            sender_public_key: sender_public_key.to_string(),
            recipient_id: None,
            amount,
            fee,
            vendor_field: None,
            asset,
            signature: None,
            second_signature: None,
            signatures: Vec::new(),
            block_id: None,
            sequence: None,
        }
    }

    /// Creates an unsigned transfer
    pub fn transfer(
        network: u8,
        timestamp: u32,
        sender_public_key: &str,
        recipient_id: Address,
        amount: u64,
        fee: u64,
    ) -> Self {
        let mut transaction = Transaction::new(
            network,
            timestamp,
            sender_public_key,
            fee,
            Asset::Transfer { expiration: 0 },
        );
        transaction.recipient_id = Some(recipient_id);
        transaction.amount = amount;
        transaction
    }

    pub fn with_vendor_field(mut self, vendor_field: &str) -> Self {
        self.vendor_field = if vendor_field.is_empty() {
            None
        } else {
            Some(vendor_field.to_string())
        };
        self
    }

    pub fn kind(&self) -> TransactionType {
        self.asset.kind()
    }

    /// Signs with the sender's keys and derives the id
    pub fn sign(&mut self, keys: &Keys) -> Result<(), TransactionError> {
        let message = self.signing_bytes()?;
        self.signature = Some(keys.sign(&message));
        self.id = self.compute_id()?;
        Ok(())
    }

    /// Adds the second-factor signature over the first-signed payload
    pub fn second_sign(&mut self, keys: &Keys) -> Result<(), TransactionError> {
        if self.signature.is_none() {
            return Err(TransactionError::NotSigned);
        }
        let message = self.to_bytes_with(Signatures::First)?;
        self.second_signature = Some(keys.sign(&message));
        Ok(())
    }

    /// Adds one multi-signature from a keysgroup member
    pub fn multi_sign(&mut self, keys: &Keys) -> Result<(), TransactionError> {
        let message = self.signing_bytes()?;
        self.signatures.push(keys.sign(&message));
        Ok(())
    }

    /// Bytes covered by the first signature and by multi-signatures
    pub fn signing_bytes(&self) -> Result<Vec<u8>, TransactionError> {
        self.to_bytes_with(Signatures::None)
    }

    /// Hex SHA-256 of the signature-free payload, before any exception remapping
    pub fn compute_id(&self) -> Result<String, TransactionError> {
        Ok(hex::encode(sha256(&self.signing_bytes()?)))
    }

    /// Full wire encoding including all signatures
    pub fn serialize(&self) -> Result<Vec<u8>, TransactionError> {
        self.to_bytes_with(Signatures::All)
    }

    /// Parses wire bytes and derives the id, applying the exception remapping
    pub fn deserialize(bytes: &[u8], exceptions: &Exceptions) -> Result<Self, TransactionError> {
        let mut transaction = Transaction::read(bytes)?;
        transaction.id = exceptions.resolve_transaction_id(&transaction.compute_id()?);
        Ok(transaction)
    }

    /// Checks that the id matches the content and the sender signature is valid
    pub fn verify(&self, exceptions: &Exceptions) -> Result<(), TransactionError> {
        let expected = exceptions.resolve_transaction_id(&self.compute_id()?);
        if expected != self.id {
            return Err(TransactionError::IdMismatch {
                expected,
                actual: self.id.clone(),
            });
        }

        let signature = self.signature.as_ref().ok_or(TransactionError::NotSigned)?;
        if !verify_signature(&self.signing_bytes()?, signature, &self.sender_public_key)? {
            return Err(TransactionError::SignatureInvalid {
                id: self.id.clone(),
            });
        }

        Ok(())
    }

    /// Verifies the second signature against a registered second public key
    pub fn verify_second_signature(&self, public_key: &str) -> Result<bool, TransactionError> {
        let signature = match &self.second_signature {
            Some(signature) => signature,
            None => return Ok(false),
        };
        let message = self.to_bytes_with(Signatures::First)?;
        Ok(verify_signature(&message, signature, public_key)?)
    }

    /// Counts distinct keysgroup members with a valid multi-signature and
    /// compares against `min`
    pub fn verify_multi_signatures(
        &self,
        keysgroup: &[String],
        min: u8,
    ) -> Result<bool, TransactionError> {
        let message = self.signing_bytes()?;
        let mut signers: HashSet<&str> = HashSet::new();

        for signature in &self.signatures {
            for key in keysgroup {
                if signers.contains(key.as_str()) {
                    continue;
                }
                if verify_signature(&message, signature, key)? {
                    signers.insert(key.as_str());
                    break;
                }
            }
        }

        Ok(signers.len() >= min as usize)
    }

    /// Amount plus fee leaving the sender
    pub fn total_debit(&self) -> Result<u64, TransactionError> {
        self.amount
            .checked_add(self.fee)
            .ok_or(TransactionError::AmountOverflow)
    }

    /// Every (recipient, amount) credit this transaction makes
    pub fn credits(&self) -> Vec<(Address, u64)> {
        match &self.asset {
            Asset::Transfer { .. } | Asset::TimelockTransfer { .. } => self
                .recipient_id
                .iter()
                .map(|recipient| (recipient.clone(), self.amount))
                .collect(),
            Asset::MultiPayment { payments } => payments
                .iter()
                .map(|p| (p.recipient_id.clone(), p.amount))
                .collect(),
            _ => Vec::new(),
        }
    }

    fn to_bytes_with(&self, signatures: Signatures) -> Result<Vec<u8>, TransactionError> {
        let mut out = Vec::with_capacity(256);
        write_u8(&mut out, SENTINEL);
        write_u8(&mut out, self.version);
        write_u8(&mut out, self.network);
        write_u8(&mut out, self.kind().as_u8());
        write_u32(&mut out, self.timestamp);
        write_hex(
            &mut out,
            "sender_public_key",
            &self.sender_public_key,
            Some(PUBLIC_KEY_LENGTH),
        )?;
        write_u64(&mut out, self.fee);

        let vendor_field = self.vendor_field.as_deref().unwrap_or("");
        write_short_bytes(&mut out, "vendor_field", vendor_field.as_bytes())?;

        self.write_asset(&mut out)?;

        if signatures != Signatures::None {
            if let Some(signature) = &self.signature {
                write_hex(&mut out, "signature", signature, None)?;
            }
        }

        if signatures == Signatures::All {
            if let Some(second_signature) = &self.second_signature {
                write_hex(&mut out, "second_signature", second_signature, None)?;
            }
            if !self.signatures.is_empty() {
                write_u8(&mut out, SENTINEL);
                for signature in &self.signatures {
                    write_hex(&mut out, "signatures", signature, None)?;
                }
            }
        }

        Ok(out)
    }

    fn write_asset(&self, out: &mut Vec<u8>) -> Result<(), TransactionError> {
        match &self.asset {
            Asset::Transfer { expiration } => {
                write_u64(out, self.amount);
                write_u32(out, *expiration);
                write_recipient(out, self.recipient_id.as_ref())?;
            }
            Asset::SecondSignature { public_key } => {
                write_hex(out, "public_key", public_key, Some(PUBLIC_KEY_LENGTH))?;
            }
            Asset::DelegateRegistration { username } => {
                write_short_bytes(out, "username", username.as_bytes())?;
            }
            Asset::Vote { votes } => {
                write_count_u8(out, "votes", votes.len())?;
                for vote in votes {
                    write_u8(out, matches!(vote, Vote::Add(_)) as u8);
                    write_hex(out, "vote", vote.public_key(), Some(PUBLIC_KEY_LENGTH))?;
                }
            }
            Asset::MultiSignature(multi) => {
                write_u8(out, multi.min);
                write_count_u8(out, "keysgroup", multi.keysgroup.len())?;
                write_u8(out, multi.lifetime);
                for key in &multi.keysgroup {
                    write_hex(out, "keysgroup", key, Some(PUBLIC_KEY_LENGTH))?;
                }
            }
            Asset::Ipfs { dag } => {
                let bytes = decode_hex("dag", dag)?;
                write_short_bytes(out, "dag", &bytes)?;
            }
            Asset::TimelockTransfer {
                timelock_type,
                timelock,
            } => {
                write_u64(out, self.amount);
                write_u8(out, *timelock_type);
                write_u32(out, *timelock);
                write_recipient(out, self.recipient_id.as_ref())?;
            }
            Asset::MultiPayment { payments } => {
                if payments.len() > u16::MAX as usize {
                    return Err(CodecError::FieldTooLong {
                        field: "payments",
                        len: payments.len(),
                        max: u16::MAX as usize,
                    }
                    .into());
                }
                write_u16(out, payments.len() as u16);
                for payment in payments {
                    write_u64(out, payment.amount);
                    write_recipient(out, Some(&payment.recipient_id))?;
                }
            }
            Asset::DelegateResignation => {}
        }
        Ok(())
    }

    fn read(bytes: &[u8]) -> Result<Self, TransactionError> {
        let mut reader = Reader::new(bytes);

        let marker = reader.read_u8()?;
        if marker != SENTINEL {
            return Err(CodecError::MalformedPayload(format!(
                "transaction must start with 0xff, found {:#04x}",
                marker
            ))
            .into());
        }

        let version = reader.read_u8()?;
        let network = reader.read_u8()?;
        let kind = TransactionType::from_u8(reader.read_u8()?)?;
        let timestamp = reader.read_u32()?;
        let sender_public_key = reader.read_hex(PUBLIC_KEY_LENGTH)?;
        let fee = reader.read_u64()?;
        let vendor_field = read_utf8(reader.read_short_bytes()?, "vendor_field")?;
        let vendor_field = if vendor_field.is_empty() {
            None
        } else {
            Some(vendor_field)
        };

        let mut amount = 0;
        let mut recipient_id = None;

        let asset = match kind {
            TransactionType::Transfer => {
                amount = reader.read_u64()?;
                let expiration = reader.read_u32()?;
                recipient_id = Some(read_recipient(&mut reader)?);
                Asset::Transfer { expiration }
            }
            TransactionType::SecondSignature => Asset::SecondSignature {
                public_key: reader.read_hex(PUBLIC_KEY_LENGTH)?,
            },
            TransactionType::DelegateRegistration => Asset::DelegateRegistration {
                username: read_utf8(reader.read_short_bytes()?, "username")?,
            },
            TransactionType::Vote => {
                let count = reader.read_u8()?;
                let mut votes = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let sign = reader.read_u8()?;
                    let key = reader.read_hex(PUBLIC_KEY_LENGTH)?;
                    votes.push(match sign {
                        1 => Vote::Add(key),
                        0 => Vote::Remove(key),
                        other => {
                            return Err(CodecError::MalformedPayload(format!(
                                "invalid vote marker {}",
                                other
                            ))
                            .into())
                        }
                    });
                }
                Asset::Vote { votes }
            }
            TransactionType::MultiSignature => {
                let min = reader.read_u8()?;
                let count = reader.read_u8()?;
                let lifetime = reader.read_u8()?;
                let mut keysgroup = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    keysgroup.push(reader.read_hex(PUBLIC_KEY_LENGTH)?);
                }
                Asset::MultiSignature(MultiSignatureAsset {
                    min,
                    lifetime,
                    keysgroup,
                })
            }
            TransactionType::Ipfs => Asset::Ipfs {
                dag: hex::encode(reader.read_short_bytes()?),
            },
            TransactionType::TimelockTransfer => {
                amount = reader.read_u64()?;
                let timelock_type = reader.read_u8()?;
                let timelock = reader.read_u32()?;
                recipient_id = Some(read_recipient(&mut reader)?);
                Asset::TimelockTransfer {
                    timelock_type,
                    timelock,
                }
            }
            TransactionType::MultiPayment => {
                let count = reader.read_u16()?;
                let mut payments = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let payment_amount = reader.read_u64()?;
                    amount = amount
                        .checked_add(payment_amount)
                        .ok_or(TransactionError::AmountOverflow)?;
                    payments.push(Payment {
                        amount: payment_amount,
                        recipient_id: read_recipient(&mut reader)?,
                    });
                }
                Asset::MultiPayment { payments }
            }
            TransactionType::DelegateResignation => Asset::DelegateResignation,
        };

        let mut signature = None;
        let mut second_signature = None;
        let mut signatures = Vec::new();

        if !reader.is_empty() && reader.peek() != Some(SENTINEL) {
            signature = Some(reader.read_signature()?);
        }
        if !reader.is_empty() && reader.peek() != Some(SENTINEL) {
            second_signature = Some(reader.read_signature()?);
        }
        if reader.peek() == Some(SENTINEL) {
            reader.read_u8()?;
            while !reader.is_empty() {
                signatures.push(reader.read_signature()?);
            }
        }
        if !reader.is_empty() {
            return Err(CodecError::MalformedPayload(format!(
                "{} trailing bytes after transaction",
                reader.remaining()
            ))
            .into());
        }

        Ok(Transaction {
            id: String::new(),
            version,
            network,
            timestamp,
            sender_public_key,
            recipient_id,
            amount,
            fee,
            vendor_field,
            asset,
            signature,
            second_signature,
            signatures,
            block_id: None,
            sequence: None,
        })
    }
}

fn write_count_u8(out: &mut Vec<u8>, field: &'static str, count: usize) -> Result<(), CodecError> {
    if count > u8::MAX as usize {
        return Err(CodecError::FieldTooLong {
            field,
            len: count,
            max: u8::MAX as usize,
        });
    }
    write_u8(out, count as u8);
    Ok(())
}

fn write_recipient(out: &mut Vec<u8>, recipient: Option<&Address>) -> Result<(), CodecError> {
    let recipient = recipient
        .ok_or_else(|| CodecError::MalformedPayload("missing recipient".to_string()))?;
    let bytes = recipient
        .to_bytes()
        .map_err(|e| CodecError::InvalidAddress(e.to_string()))?;
    out.extend_from_slice(&bytes);
    Ok(())
}

fn read_recipient(reader: &mut Reader<'_>) -> Result<Address, CodecError> {
    Ok(Address::from_bytes(reader.take(ADDRESS_LENGTH)?))
}

fn read_utf8(bytes: &[u8], field: &str) -> Result<String, CodecError> {
    String::from_utf8(bytes.to_vec())
        .map_err(|_| CodecError::MalformedPayload(format!("{} is not valid UTF-8", field)))
}
