//! Hashing utilities
//!
//! SHA-2 and SHA-3 digests used for content fingerprints, plus the
//! double SHA-256 and HASH160 constructions used for transaction ids,
//! signature hashes and public-key hashes.

use ripemd::Ripemd160;
use sha2::{Digest, Sha256, Sha512};
use sha3::{Sha3_256, Sha3_512};

/// Computes SHA-256 hash of the input data
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Computes double SHA-256 hash (SHA-256 of SHA-256)
pub fn double_sha256(data: &[u8]) -> [u8; 32] {
    sha256(&sha256(data))
}

/// Computes SHA-512 hash of the input data
pub fn sha512(data: &[u8]) -> [u8; 64] {
    let mut out = [0u8; 64];
    out.copy_from_slice(&Sha512::digest(data));
    out
}

pub fn sha3_256(data: &[u8]) -> [u8; 32] {
    Sha3_256::digest(data).into()
}

pub fn sha3_512(data: &[u8]) -> [u8; 64] {
    let mut out = [0u8; 64];
    out.copy_from_slice(&Sha3_512::digest(data));
    out
}

/// Computes RIPEMD-160 hash of the input data
pub fn ripemd160(data: &[u8]) -> [u8; 20] {
    Ripemd160::digest(data).into()
}

/// RIPEMD-160 of SHA-256, the hash behind P2PKH addresses
pub fn hash160(data: &[u8]) -> [u8; 20] {
    ripemd160(&sha256(data))
}

/// Encodes `payload` as Base58Check (four-byte double SHA-256 checksum)
pub fn base58check_encode(payload: &[u8]) -> String {
    let checksum = double_sha256(payload);
    let mut bytes = payload.to_vec();
    bytes.extend_from_slice(&checksum[..4]);
    bs58::encode(bytes).into_string()
}

/// Decodes a Base58Check string, verifying and stripping the checksum
pub fn base58check_decode(encoded: &str) -> Option<Vec<u8>> {
    let mut bytes = bs58::decode(encoded).into_vec().ok()?;
    if bytes.len() < 4 {
        return None;
    }
    let checksum = bytes.split_off(bytes.len() - 4);
    if double_sha256(&bytes)[..4] != checksum[..] {
        return None;
    }
    Some(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256() {
        assert_eq!(
            hex::encode(sha256(b"hello world")),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_sha3_256_empty() {
        assert_eq!(
            hex::encode(sha3_256(b"")),
            "a7ffc6f8bf1ed76651c14756a061d662f580ff4de43b49fa82d80a4b80f8434a"
        );
    }

    #[test]
    fn test_hash160_of_tag() {
        // HASH160 is always 20 bytes and deterministic
        assert_eq!(hash160(b"tag"), hash160(b"tag"));
        assert_ne!(hash160(b"tag"), hash160(b"other"));
    }

    #[test]
    fn test_base58check_roundtrip() {
        let payload = [0x37u8, 1, 2, 3, 4, 5];
        let encoded = base58check_encode(&payload);
        assert_eq!(base58check_decode(&encoded).unwrap(), payload);
    }

    #[test]
    fn test_base58check_bad_checksum() {
        let mut encoded = base58check_encode(&[0u8; 21]).into_bytes();
        let last = encoded.len() - 1;
        encoded[last] = if encoded[last] == b'2' { b'3' } else { b'2' };
        let encoded = String::from_utf8(encoded).unwrap();
        assert!(base58check_decode(&encoded).is_none());
    }
}
