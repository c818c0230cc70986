//! Cryptographic utilities
//!
//! This module provides:
//! - SHA-2 / SHA-3 / RIPEMD-160 hashing
//! - Base58Check encoding
//! - ECDSA key management (secp256k1)

pub mod hash;
pub mod keys;

pub use hash::{
    base58check_decode, base58check_encode, double_sha256, hash160, ripemd160, sha256, sha3_256,
    sha3_512, sha512,
};
pub use keys::{sign_digest, verify_signature, KeyError, KeyPair, PubkeyHash};
