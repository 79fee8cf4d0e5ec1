use k256::ecdsa::{
    signature::{Signer, Verifier},
    Signature, SigningKey, VerifyingKey,
};
use rand::rngs::OsRng;
use ripemd::Ripemd160;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use std::fmt;
use std::str::FromStr;

/// Length of a compressed secp256k1 public key
pub const PUBLIC_KEY_LENGTH: usize = 33;

/// Length of a decoded address: version byte + RIPEMD-160 digest
pub const ADDRESS_LENGTH: usize = 21;

/// Errors that can occur during cryptographic operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("Invalid private key: {0}")]
    InvalidPrivateKey(String),

    #[error("Invalid signature encoding: {0}")]
    InvalidSignature(String),

    #[error("Signature verification failed")]
    SignatureInvalid,

    #[error("Decoding error: {0}")]
    DecodingError(String),
}

/// A base58check encoded account address
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address(pub String);

impl Address {
    /// Derives the address of a hex encoded compressed public key.
    ///
    /// The key must be exactly 66 hex characters. The address is the
    /// base58check encoding of `version || ripemd160(key bytes)`.
    pub fn from_public_key(public_key: &str, version: u8) -> Result<Self, CryptoError> {
        let bytes = public_key_bytes(public_key)?;
        Ok(Address::from_key_bytes(&bytes, version))
    }

    fn from_key_bytes(key: &[u8], version: u8) -> Self {
        let digest = Ripemd160::digest(key);

        let mut payload = Vec::with_capacity(ADDRESS_LENGTH);
        payload.push(version);
        payload.extend_from_slice(&digest);

        Address::from_bytes(&payload)
    }

    /// Encodes 21 raw address bytes
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Address(bs58::encode(bytes).with_check().into_string())
    }

    /// Decodes the address to its 21 raw bytes, checking the checksum
    pub fn to_bytes(&self) -> Result<Vec<u8>, CryptoError> {
        let bytes = bs58::decode(&self.0)
            .with_check(None)
            .into_vec()
            .map_err(|e| CryptoError::DecodingError(e.to_string()))?;

        if bytes.len() != ADDRESS_LENGTH {
            return Err(CryptoError::DecodingError(format!(
                "address {} decodes to {} bytes",
                self.0,
                bytes.len()
            )));
        }

        Ok(bytes)
    }

    /// Returns the network version byte the address was made for
    pub fn version(&self) -> Result<u8, CryptoError> {
        Ok(self.to_bytes()?[0])
    }

    /// Checks the checksum and the network version byte
    pub fn is_valid(&self, version: u8) -> bool {
        matches!(self.version(), Ok(v) if v == version)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Address {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let address = Address(s.to_string());
        address.to_bytes()?;
        Ok(address)
    }
}

/// Checks the textual shape of a public key: 66 hex characters
pub fn is_public_key(public_key: &str) -> bool {
    public_key.len() == PUBLIC_KEY_LENGTH * 2 && public_key.bytes().all(|b| b.is_ascii_hexdigit())
}

fn public_key_bytes(public_key: &str) -> Result<Vec<u8>, CryptoError> {
    if !is_public_key(public_key) {
        return Err(CryptoError::InvalidPublicKey(format!(
            "expected 66 hex characters, got {:?}",
            public_key
        )));
    }
    hex::decode(public_key).map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))
}

/// SHA-256 digest
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// A secp256k1 key pair used to sign transactions and blocks
#[derive(Clone)]
pub struct Keys {
    signing_key: SigningKey,
    public_key: String,
}

impl fmt::Debug for Keys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keys")
            .field("public_key", &self.public_key)
            .finish()
    }
}

impl Keys {
    /// Creates keys from a random secret
    pub fn generate() -> Self {
        Keys::from_signing_key(SigningKey::random(&mut OsRng))
    }

    /// Creates keys whose secret is the SHA-256 of a passphrase
    pub fn from_passphrase(passphrase: &str) -> Result<Self, CryptoError> {
        Keys::from_secret_key(&sha256(passphrase.as_bytes()))
    }

    /// Creates keys from a 32-byte secret
    pub fn from_secret_key(secret_key_bytes: &[u8]) -> Result<Self, CryptoError> {
        let signing_key = SigningKey::from_slice(secret_key_bytes)
            .map_err(|e| CryptoError::InvalidPrivateKey(e.to_string()))?;
        Ok(Keys::from_signing_key(signing_key))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let point = signing_key.verifying_key().to_encoded_point(true);
        let public_key = hex::encode(point.as_bytes());
        Keys {
            signing_key,
            public_key,
        }
    }

    /// Hex encoded compressed public key
    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    /// Address of these keys on network `version`
    pub fn address(&self, version: u8) -> Address {
        let point = self.signing_key.verifying_key().to_encoded_point(true);
        Address::from_key_bytes(point.as_bytes(), version)
    }

    /// Signs SHA-256(message) and returns the DER signature as hex
    pub fn sign(&self, message: &[u8]) -> String {
        let signature: Signature = self.signing_key.sign(message);
        hex::encode(signature.to_der().as_bytes())
    }

    /// Exports the 32-byte secret
    pub fn export_secret_key(&self) -> Vec<u8> {
        self.signing_key.to_bytes().to_vec()
    }
}

/// Verifies a hex DER signature over SHA-256(message).
///
/// A well-formed signature that does not match yields `Ok(false)`; only a
/// malformed key or signature encoding is an error.
pub fn verify_signature(
    message: &[u8],
    signature: &str,
    public_key: &str,
) -> Result<bool, CryptoError> {
    let key_bytes = public_key_bytes(public_key)?;
    let verifying_key = VerifyingKey::from_sec1_bytes(&key_bytes)
        .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;

    let signature_bytes =
        hex::decode(signature).map_err(|e| CryptoError::InvalidSignature(e.to_string()))?;
    let signature = Signature::from_der(&signature_bytes)
        .map_err(|e| CryptoError::InvalidSignature(e.to_string()))?;
    // Historic signatures are not low-S normalized
    let signature = signature.normalize_s().unwrap_or(signature);

    Ok(verifying_key.verify(message, &signature).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    const VERSION: u8 = 0x17;

    #[test]
    fn test_keys_from_passphrase_are_deterministic() {
        let a = Keys::from_passphrase("this is a top secret passphrase").unwrap();
        let b = Keys::from_passphrase("this is a top secret passphrase").unwrap();
        assert_eq!(a.public_key(), b.public_key());
        assert_eq!(a.public_key().len(), 66);
        assert!(a.public_key().starts_with("02") || a.public_key().starts_with("03"));
    }

    #[test]
    fn test_signing_and_verification() {
        let keys = Keys::generate();
        let message = b"Hello, world!";

        let signature = keys.sign(message);
        assert!(verify_signature(message, &signature, keys.public_key()).unwrap());

        let result = verify_signature(b"Wrong message", &signature, keys.public_key()).unwrap();
        assert!(!result);

        let other = Keys::generate();
        assert!(!verify_signature(message, &signature, other.public_key()).unwrap());
    }

    #[test]
    fn test_malformed_inputs_are_errors() {
        let keys = Keys::generate();
        let signature = keys.sign(b"msg");

        assert!(verify_signature(b"msg", "zz", keys.public_key()).is_err());
        assert!(verify_signature(b"msg", "3006020101020101", "abcd").is_err());
        assert!(verify_signature(b"msg", &signature[..10], keys.public_key()).is_err());
    }

    #[test]
    fn test_address_derivation() {
        let keys = Keys::from_passphrase("secret").unwrap();
        let address = Address::from_public_key(keys.public_key(), VERSION).unwrap();

        assert_eq!(address, keys.address(VERSION));
        assert_eq!(address.version().unwrap(), VERSION);
        assert!(address.is_valid(VERSION));
        assert!(!address.is_valid(0x1e));
        assert_eq!(address.to_bytes().unwrap().len(), ADDRESS_LENGTH);
        assert_eq!(Address::from_bytes(&address.to_bytes().unwrap()), address);
    }

    #[test]
    fn test_known_address_vector() {
        let keys = Keys::from_passphrase("this is a top secret passphrase").unwrap();
        assert_eq!(
            keys.public_key(),
            "034151a3ec46b5670a682b0a63394f863587d1bc97483b1b6c70eb58e7f0aed192"
        );
        assert_eq!(
            keys.address(0x17).0,
            "AGeYmgbg2LgGxRW2vNNJvQ88PknEJsYizC"
        );
        assert_eq!(
            Address::from_public_key(keys.public_key(), 0x17).unwrap(),
            keys.address(0x17)
        );
    }

    #[test]
    fn test_address_rejects_bad_public_key() {
        assert!(Address::from_public_key("02abc", VERSION).is_err());
        let not_hex = "z".repeat(66);
        assert!(Address::from_public_key(&not_hex, VERSION).is_err());
    }

    #[test]
    fn test_address_checksum() {
        let keys = Keys::from_passphrase("secret").unwrap();
        let mut text = keys.address(VERSION).0;
        let last = text.pop().unwrap();
        text.push(if last == '1' { '2' } else { '1' });
        assert!(text.parse::<Address>().is_err());
    }
}
