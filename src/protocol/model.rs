//! Document history model
//!
//! A document's history is a list of [`Transition`]s, each carrying the
//! [`State`] (owner and content fingerprints) produced by a group of
//! protocol transactions.

use chrono::{DateTime, Utc};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::chain::Txid;
use crate::crypto::{sha256, sha3_256, sha3_512, sha512};

// =============================================================================
// Hash algorithms
// =============================================================================

/// Supported content fingerprint algorithms.
///
/// Variant order is the wire priority order: 512-bit digests first, SHA-2
/// before SHA-3 within a size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HashAlgorithm {
    #[serde(rename = "sha2-512")]
    Sha2_512,
    #[serde(rename = "sha3-512")]
    Sha3_512,
    #[serde(rename = "sha2-256")]
    Sha2_256,
    #[serde(rename = "sha3-256")]
    Sha3_256,
}

/// The two algorithm families; each family shares one wire field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashFamily {
    Sha2,
    Sha3,
}

impl HashAlgorithm {
    /// All algorithms in wire priority order
    pub const PRIORITY: [HashAlgorithm; 4] = [
        HashAlgorithm::Sha2_512,
        HashAlgorithm::Sha3_512,
        HashAlgorithm::Sha2_256,
        HashAlgorithm::Sha3_256,
    ];

    pub fn digest_len(self) -> usize {
        match self {
            HashAlgorithm::Sha2_512 | HashAlgorithm::Sha3_512 => 64,
            HashAlgorithm::Sha2_256 | HashAlgorithm::Sha3_256 => 32,
        }
    }

    pub fn family(self) -> HashFamily {
        match self {
            HashAlgorithm::Sha2_512 | HashAlgorithm::Sha2_256 => HashFamily::Sha2,
            HashAlgorithm::Sha3_512 | HashAlgorithm::Sha3_256 => HashFamily::Sha3,
        }
    }

    /// Resolve the algorithm of a family from a digest length
    pub fn from_family_len(family: HashFamily, len: usize) -> Option<Self> {
        match (family, len) {
            (HashFamily::Sha2, 32) => Some(HashAlgorithm::Sha2_256),
            (HashFamily::Sha2, 64) => Some(HashAlgorithm::Sha2_512),
            (HashFamily::Sha3, 32) => Some(HashAlgorithm::Sha3_256),
            (HashFamily::Sha3, 64) => Some(HashAlgorithm::Sha3_512),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            HashAlgorithm::Sha2_512 => "sha2-512",
            HashAlgorithm::Sha3_512 => "sha3-512",
            HashAlgorithm::Sha2_256 => "sha2-256",
            HashAlgorithm::Sha3_256 => "sha3-256",
        }
    }

    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            HashAlgorithm::Sha2_512 => sha512(data).to_vec(),
            HashAlgorithm::Sha3_512 => sha3_512(data).to_vec(),
            HashAlgorithm::Sha2_256 => sha256(data).to_vec(),
            HashAlgorithm::Sha3_256 => sha3_256(data).to_vec(),
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for HashAlgorithm {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        HashAlgorithm::PRIORITY
            .into_iter()
            .find(|alg| alg.name() == s)
            .ok_or_else(|| HashError::UnknownAlgorithm(s.to_string()))
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HashError {
    #[error("Unknown hash algorithm: {0}")]
    UnknownAlgorithm(String),
    #[error("Invalid digest length for {algorithm}: expected {expected}, got {actual}")]
    InvalidLength {
        algorithm: HashAlgorithm,
        expected: usize,
        actual: usize,
    },
}

// =============================================================================
// Content hashes
// =============================================================================

/// Digests of one document version, at most one per algorithm
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentHashes {
    digests: BTreeMap<HashAlgorithm, Vec<u8>>,
}

impl ContentHashes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fingerprint `data` with every supported algorithm
    pub fn digest_all(data: &[u8]) -> Self {
        let digests = HashAlgorithm::PRIORITY
            .into_iter()
            .map(|alg| (alg, alg.digest(data)))
            .collect();
        Self { digests }
    }

    /// Insert a digest, validating its length. Returns the previous digest
    /// for the algorithm, if any.
    pub fn insert(
        &mut self,
        algorithm: HashAlgorithm,
        digest: Vec<u8>,
    ) -> Result<Option<Vec<u8>>, HashError> {
        if digest.len() != algorithm.digest_len() {
            return Err(HashError::InvalidLength {
                algorithm,
                expected: algorithm.digest_len(),
                actual: digest.len(),
            });
        }
        Ok(self.digests.insert(algorithm, digest))
    }

    pub fn get(&self, algorithm: HashAlgorithm) -> Option<&[u8]> {
        self.digests.get(&algorithm).map(Vec::as_slice)
    }

    pub fn contains(&self, algorithm: HashAlgorithm) -> bool {
        self.digests.contains_key(&algorithm)
    }

    /// Digests in wire priority order
    pub fn iter(&self) -> impl Iterator<Item = (HashAlgorithm, &[u8])> {
        self.digests.iter().map(|(alg, d)| (*alg, d.as_slice()))
    }

    /// Copy in every digest of `other`, overwriting existing ones
    pub fn extend(&mut self, other: ContentHashes) {
        self.digests.extend(other.digests);
    }

    pub fn len(&self) -> usize {
        self.digests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.digests.is_empty()
    }

    pub fn clear(&mut self) {
        self.digests.clear();
    }
}

impl Serialize for ContentHashes {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.digests.len()))?;
        for (alg, digest) in &self.digests {
            map.serialize_entry(alg.name(), &hex::encode(digest))?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for ContentHashes {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::Error;

        let raw = BTreeMap::<String, String>::deserialize(deserializer)?;
        let mut hashes = ContentHashes::new();
        for (name, digest) in raw {
            let alg: HashAlgorithm = name.parse().map_err(D::Error::custom)?;
            let bytes = hex::decode(&digest).map_err(D::Error::custom)?;
            hashes.insert(alg, bytes).map_err(D::Error::custom)?;
        }
        Ok(hashes)
    }
}

// =============================================================================
// State and transitions
// =============================================================================

/// The document's content as of one point in its history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    pub time: DateTime<Utc>,
    pub owner: String,
    pub hash: ContentHashes,
}

/// One finalized step in a document's history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub state: State,
    pub txids: Vec<Txid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_owner: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub uris: Vec<String>,
}

impl Transition {
    /// Owner that controls the document after this transition
    pub fn effective_owner(&self) -> &str {
        self.next_owner.as_deref().unwrap_or(&self.state.owner)
    }
}
