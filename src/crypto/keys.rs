//! ECDSA key management
//!
//! Key pair generation, WIF import/export, signing and verification
//! using the secp256k1 elliptic curve.

use rand::rngs::OsRng;
use secp256k1::ecdsa::Signature;
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use thiserror::Error;

use super::hash::{base58check_decode, base58check_encode, hash160};

/// Errors that can occur during key operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("Invalid private key")]
    InvalidPrivateKey,
    #[error("Invalid public key")]
    InvalidPublicKey,
    #[error("Invalid signature")]
    InvalidSignature,
    #[error("Invalid WIF encoding")]
    InvalidWif,
    #[error("WIF version {found:#04x} does not match network version {expected:#04x}")]
    WrongNetwork { expected: u8, found: u8 },
    #[error("Secp256k1 error: {0}")]
    Secp256k1Error(#[from] secp256k1::Error),
}

/// A 20-byte HASH160 of a compressed public key
pub type PubkeyHash = [u8; 20];

/// A key pair consisting of a private key and its corresponding public key
#[derive(Clone)]
pub struct KeyPair {
    pub secret_key: SecretKey,
    pub public_key: PublicKey,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key_hex())
            .finish_non_exhaustive()
    }
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let (secret_key, public_key) = secp.generate_keypair(&mut OsRng);
        Self {
            secret_key,
            public_key,
        }
    }

    /// Create a key pair from an existing secret key
    pub fn from_secret_key(secret_key: SecretKey) -> Self {
        let secp = Secp256k1::new();
        let public_key = PublicKey::from_secret_key(&secp, &secret_key);
        Self {
            secret_key,
            public_key,
        }
    }

    /// Create a key pair from a hex-encoded private key
    pub fn from_private_key_hex(hex_key: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(hex_key).map_err(|_| KeyError::InvalidPrivateKey)?;
        let secret_key =
            SecretKey::from_slice(&bytes).map_err(|_| KeyError::InvalidPrivateKey)?;
        Ok(Self::from_secret_key(secret_key))
    }

    /// Import a Wallet Import Format key for the given private-key version byte
    pub fn from_wif(wif: &str, version: u8) -> Result<Self, KeyError> {
        let bytes = base58check_decode(wif).ok_or(KeyError::InvalidWif)?;
        // Only compressed keys; addresses are derived from the compressed point
        if bytes.len() != 34 || bytes[33] != 0x01 {
            return Err(KeyError::InvalidWif);
        }
        let key = &bytes[1..33];
        if bytes[0] != version {
            return Err(KeyError::WrongNetwork {
                expected: version,
                found: bytes[0],
            });
        }
        let secret_key = SecretKey::from_slice(key).map_err(|_| KeyError::InvalidPrivateKey)?;
        Ok(Self::from_secret_key(secret_key))
    }

    /// Export as compressed WIF
    pub fn to_wif(&self, version: u8) -> String {
        let mut bytes = Vec::with_capacity(34);
        bytes.push(version);
        bytes.extend_from_slice(&self.secret_key.secret_bytes());
        bytes.push(0x01);
        base58check_encode(&bytes)
    }

    /// Get the private key as a hex string
    pub fn private_key_hex(&self) -> String {
        hex::encode(self.secret_key.secret_bytes())
    }

    /// Get the public key as a hex string (compressed format)
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key.serialize())
    }

    /// Compressed SEC1 encoding of the public key
    pub fn public_key_bytes(&self) -> [u8; 33] {
        self.public_key.serialize()
    }

    /// HASH160 of the compressed public key
    pub fn pubkey_hash(&self) -> PubkeyHash {
        hash160(&self.public_key.serialize())
    }

    /// Sign a 32-byte digest, returning a DER-encoded signature
    pub fn sign(&self, digest: &[u8; 32]) -> Vec<u8> {
        sign_digest(&self.secret_key, digest)
    }
}

/// Sign a 32-byte digest with a secret key.
///
/// Uses low-R grinding, so the DER encoding has a stable length and a
/// transaction's size does not shift between re-signings.
pub fn sign_digest(secret_key: &SecretKey, digest: &[u8; 32]) -> Vec<u8> {
    let secp = Secp256k1::signing_only();
    let message = Message::from_digest(*digest);
    secp.sign_ecdsa_low_r(&message, secret_key)
        .serialize_der()
        .to_vec()
}

/// Verify a DER signature over a 32-byte digest
pub fn verify_signature(
    public_key: &[u8],
    digest: &[u8; 32],
    signature: &[u8],
) -> Result<bool, KeyError> {
    let secp = Secp256k1::verification_only();
    let public_key = PublicKey::from_slice(public_key).map_err(|_| KeyError::InvalidPublicKey)?;
    let message = Message::from_digest(*digest);
    let sig = Signature::from_der(signature).map_err(|_| KeyError::InvalidSignature)?;
    Ok(secp.verify_ecdsa(&message, &sig, &public_key).is_ok())
}
