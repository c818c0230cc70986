//! Protocol payload codec
//!
//! The payload is a protobuf message carried in a transaction's data
//! output. Content updates may need more room than one data output
//! allows, so [`encode_content_update`] splits hash fields across several
//! payloads; only the first carries the CONTENT_UPDATE flag, the rest are
//! amendments to the same document version.

use bitflags::bitflags;
use prost::Message;
use thiserror::Error;

use super::model::{ContentHashes, HashAlgorithm, HashFamily};

// =============================================================================
// Constants
// =============================================================================

/// Hard size budget of one content-update payload
pub const MAX_PAYLOAD_SIZE: usize = 256;

/// Payloads of this size or larger are not relayed as a single data output
pub const MAX_DATA_OUTPUT_SIZE: usize = 80;

/// Field tag byte plus one-byte length prefix
pub const HASH_FIELD_OVERHEAD: usize = 2;

/// Encoded size of the flags field (tag byte plus one-byte varint)
const FLAGS_FIELD_SIZE: usize = 2;

const HTTP_PREFIX: &str = "http://";
const HTTPS_PREFIX: &str = "https://";
const IPFS_PREFIX: &str = "ipfs://";
const MAGNET_SHA1_PREFIX: &str = "magnet:?xt=urn:sha1:";
const MAGNET_BTIH_PREFIX: &str = "magnet:?xt=urn:btih:";

bitflags! {
    /// Payload flag bitmask
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PayloadFlags: u32 {
        const CONTENT_UPDATE = 1 << 0;
        const OWNERSHIP_TRANSFER = 1 << 1;
    }
}

// =============================================================================
// Errors
// =============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PayloadError {
    #[error("Malformed payload: {0}")]
    Malformed(String),
    #[error("Unknown payload flags: {0:#x}")]
    UnknownFlags(u32),
}

// =============================================================================
// Payload
// =============================================================================

/// Wire message carried in a data output
#[derive(Clone, PartialEq, Message)]
pub struct Payload {
    #[prost(uint32, optional, tag = "1")]
    pub flags: Option<u32>,
    /// SHA-2 digests; 32 or 64 bytes selects the variant
    #[prost(bytes = "vec", repeated, tag = "2")]
    pub sha2: Vec<Vec<u8>>,
    /// SHA-3 digests; 32 or 64 bytes selects the variant
    #[prost(bytes = "vec", repeated, tag = "3")]
    pub sha3: Vec<Vec<u8>>,
    #[prost(string, repeated, tag = "4")]
    pub uri: Vec<String>,
    /// `http://` locators with the scheme stripped
    #[prost(string, repeated, tag = "5")]
    pub http: Vec<String>,
    /// `https://` locators with the scheme stripped
    #[prost(string, repeated, tag = "6")]
    pub https: Vec<String>,
    /// Raw IPFS multihashes
    #[prost(bytes = "vec", repeated, tag = "7")]
    pub ipfs: Vec<Vec<u8>>,
    #[prost(bytes = "vec", repeated, tag = "8")]
    pub magnet_sha1: Vec<Vec<u8>>,
    #[prost(bytes = "vec", repeated, tag = "9")]
    pub magnet_btih: Vec<Vec<u8>>,
}

impl Payload {
    /// Flag bits, ignoring any bits outside the known set
    pub fn payload_flags(&self) -> PayloadFlags {
        PayloadFlags::from_bits_truncate(self.flags.unwrap_or(0))
    }

    pub fn is_content_update(&self) -> bool {
        self.payload_flags().contains(PayloadFlags::CONTENT_UPDATE)
    }

    pub fn is_ownership_transfer(&self) -> bool {
        self.payload_flags().contains(PayloadFlags::OWNERSHIP_TRANSFER)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    /// Declared digests, tagged with their family, in wire order
    pub fn digests(&self) -> impl Iterator<Item = (HashFamily, &[u8])> {
        let sha2 = self.sha2.iter().map(|d| (HashFamily::Sha2, d.as_slice()));
        let sha3 = self.sha3.iter().map(|d| (HashFamily::Sha3, d.as_slice()));
        sha2.chain(sha3)
    }

    /// Every locator field expanded back into a full URI. `http` and
    /// `https` fields get their own scheme back, content addresses get
    /// `ipfs://` with the base58 multihash, and magnet hashes get a
    /// `magnet:?xt=urn:` link with the hex digest.
    pub fn uris(&self) -> Vec<String> {
        let mut uris = self.uri.clone();
        uris.extend(self.http.iter().map(|h| format!("{HTTP_PREFIX}{h}")));
        uris.extend(self.https.iter().map(|h| format!("{HTTPS_PREFIX}{h}")));
        uris.extend(
            self.ipfs
                .iter()
                .map(|h| format!("{IPFS_PREFIX}{}", bs58::encode(h).into_string())),
        );
        uris.extend(
            self.magnet_sha1
                .iter()
                .map(|h| format!("{MAGNET_SHA1_PREFIX}{}", hex::encode(h))),
        );
        uris.extend(
            self.magnet_btih
                .iter()
                .map(|h| format!("{MAGNET_BTIH_PREFIX}{}", hex::encode(h))),
        );
        uris
    }

    fn push_digest(&mut self, algorithm: HashAlgorithm, digest: &[u8]) {
        match algorithm.family() {
            HashFamily::Sha2 => self.sha2.push(digest.to_vec()),
            HashFamily::Sha3 => self.sha3.push(digest.to_vec()),
        }
    }
}

/// Decode a payload, rejecting schema violations and unknown flag bits
pub fn decode(bytes: &[u8]) -> Result<Payload, PayloadError> {
    let payload = Payload::decode(bytes).map_err(|e| PayloadError::Malformed(e.to_string()))?;
    let raw = payload.flags.unwrap_or(0);
    if PayloadFlags::from_bits(raw).is_none() {
        return Err(PayloadError::UnknownFlags(raw));
    }
    Ok(payload)
}

// =============================================================================
// Encoders
// =============================================================================

/// Encode a content update within the standard payload budget
pub fn encode_content_update(hashes: &ContentHashes) -> Vec<Payload> {
    encode_content_update_with_budget(hashes, MAX_PAYLOAD_SIZE)
}

/// Encode a content update, sealing a payload whenever the next hash field
/// would push it past `budget` bytes. Always yields at least one payload.
pub fn encode_content_update_with_budget(hashes: &ContentHashes, budget: usize) -> Vec<Payload> {
    let mut payloads = Vec::new();
    let mut current = Payload {
        flags: Some(PayloadFlags::CONTENT_UPDATE.bits()),
        ..Default::default()
    };
    let mut bytes = FLAGS_FIELD_SIZE;

    for algorithm in HashAlgorithm::PRIORITY {
        let Some(digest) = hashes.get(algorithm) else {
            continue;
        };
        let field = HASH_FIELD_OVERHEAD + digest.len();
        if bytes + field > budget {
            payloads.push(std::mem::take(&mut current));
            bytes = 0;
        }
        current.push_digest(algorithm, digest);
        bytes += field;
    }

    payloads.push(current);
    payloads
}

/// Encode a single locator. `http` and `https` URIs are stored without
/// their scheme; anything else is stored verbatim.
pub fn encode_uri_add(uri: &str) -> Payload {
    let mut payload = Payload::default();
    if let Some(rest) = uri.strip_prefix(HTTP_PREFIX) {
        payload.http.push(rest.to_string());
    } else if let Some(rest) = uri.strip_prefix(HTTPS_PREFIX) {
        payload.https.push(rest.to_string());
    } else {
        payload.uri.push(uri.to_string());
    }
    payload
}

/// Encode an ownership handoff with no content changes
pub fn encode_ownership_transfer() -> Payload {
    Payload {
        flags: Some(PayloadFlags::OWNERSHIP_TRANSFER.bits()),
        ..Default::default()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn full_set() -> ContentHashes {
        let mut hashes = ContentHashes::new();
        for (i, alg) in HashAlgorithm::PRIORITY.into_iter().enumerate() {
            hashes.insert(alg, vec![i as u8 + 1; alg.digest_len()]).unwrap();
        }
        hashes
    }

    fn collect(payloads: &[Payload]) -> ContentHashes {
        let mut hashes = ContentHashes::new();
        for payload in payloads {
            for (family, digest) in payload.digests() {
                let alg = HashAlgorithm::from_family_len(family, digest.len()).unwrap();
                assert!(hashes.insert(alg, digest.to_vec()).unwrap().is_none());
            }
        }
        hashes
    }

    #[test]
    fn test_content_update_roundtrip() {
        let hashes = full_set();
        let payloads = encode_content_update(&hashes);
        assert_eq!(payloads.len(), 1);

        let bytes = payloads[0].to_bytes();
        assert!(bytes.len() <= MAX_PAYLOAD_SIZE);
        let decoded = decode(&bytes).unwrap();
        assert!(decoded.is_content_update());
        assert!(!decoded.is_ownership_transfer());
        assert_eq!(collect(&[decoded]), hashes);
    }

    #[test]
    fn test_priority_order_on_wire() {
        let payloads = encode_content_update(&full_set());
        let p = &payloads[0];
        // 512-bit before 256-bit within each family field
        assert_eq!(p.sha2[0].len(), 64);
        assert_eq!(p.sha2[1].len(), 32);
        assert_eq!(p.sha3[0].len(), 64);
        assert_eq!(p.sha3[1].len(), 32);
    }

    #[test]
    fn test_budget_split() {
        let hashes = full_set();
        // flags(2) + sha2-512(66) fits in 100; sha3-512 does not
        let payloads = encode_content_update_with_budget(&hashes, 100);
        assert_eq!(payloads.len(), 3);
        assert!(payloads[0].is_content_update());
        assert!(payloads[1..].iter().all(|p| p.flags.is_none()));
        for payload in &payloads {
            assert!(payload.to_bytes().len() <= 100);
        }
        assert_eq!(collect(&payloads), hashes);
    }

    #[test]
    fn test_empty_set_yields_flagged_payload() {
        let payloads = encode_content_update(&ContentHashes::new());
        assert_eq!(payloads.len(), 1);
        assert!(payloads[0].is_content_update());
        assert_eq!(payloads[0].to_bytes(), vec![0x08, 0x01]);
    }

    #[test]
    fn test_uri_add_scheme_selection() {
        let p = encode_uri_add("https://example.com/doc");
        assert_eq!(p.https, vec!["example.com/doc".to_string()]);
        assert!(p.http.is_empty() && p.uri.is_empty());
        assert_eq!(p.uris(), vec!["https://example.com/doc".to_string()]);

        let p = encode_uri_add("http://example.com");
        assert_eq!(p.http, vec!["example.com".to_string()]);

        let p = encode_uri_add("ftp://example.com/doc");
        assert_eq!(p.uri, vec!["ftp://example.com/doc".to_string()]);
        assert!(p.flags.is_none());
    }

    #[test]
    fn test_uri_reverse_mapping() {
        let p = Payload {
            ipfs: vec![vec![0x12, 0x20, 0x01]],
            magnet_sha1: vec![vec![0xde, 0xad]],
            magnet_btih: vec![vec![0xbe, 0xef]],
            ..Default::default()
        };
        assert_eq!(
            p.uris(),
            vec![
                format!("ipfs://{}", bs58::encode([0x12, 0x20, 0x01]).into_string()),
                "magnet:?xt=urn:sha1:dead".to_string(),
                "magnet:?xt=urn:btih:beef".to_string(),
            ]
        );
    }

    #[test]
    fn test_decode_rejects_unknown_flags() {
        let p = Payload {
            flags: Some(0b101),
            ..Default::default()
        };
        assert_eq!(decode(&p.to_bytes()), Err(PayloadError::UnknownFlags(0b101)));
    }

    #[test]
    fn test_payload_flags_accessor() {
        let p = decode(&encode_content_update(&full_set())[0].to_bytes()).unwrap();
        assert_eq!(p.payload_flags(), PayloadFlags::CONTENT_UPDATE);
        assert_eq!(p.flags(), PayloadFlags::CONTENT_UPDATE.bits());

        let p = encode_ownership_transfer();
        assert_eq!(p.payload_flags(), PayloadFlags::OWNERSHIP_TRANSFER);
        assert!(Payload::default().payload_flags().is_empty());
    }

    #[test]
    fn test_http_and_https_keep_their_scheme() {
        let mut p = encode_uri_add("http://a.example");
        p.https.push("b.example".to_string());
        assert_eq!(
            p.uris(),
            vec!["http://a.example".to_string(), "https://b.example".to_string()]
        );
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            decode(&[0x12, 0x40, 0x00]),
            Err(PayloadError::Malformed(_))
        ));
    }

    #[test]
    fn test_ownership_transfer_payload() {
        let p = decode(&encode_ownership_transfer().to_bytes()).unwrap();
        assert!(p.is_ownership_transfer());
        assert!(!p.is_content_update());
    }
}
