//! Network parameters and per-network transaction rules
//!
//! Chains differ in three ways that matter here: the transaction wire
//! layout, the fee curve, and how a transaction must be prepared before
//! it is signed. Each [`Network`] carries a [`ChainRules`] implementation
//! selected when the network is constructed.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use super::transaction::{ChainError, Transaction};
use crate::crypto::{base58check_decode, base58check_encode, hash160, PubkeyHash};

// =============================================================================
// Chain rules
// =============================================================================

/// Per-network transaction capabilities
pub trait ChainRules: Send + Sync + fmt::Debug {
    /// Wire encoding used for broadcasting, hashing and size measurement
    fn serialize(&self, tx: &Transaction) -> Vec<u8>;

    fn deserialize(&self, raw: &[u8]) -> Result<Transaction, ChainError>;

    /// Minimum relay fee for a transaction of `size` bytes
    fn compute_fee(&self, size: usize) -> u64;

    /// Bring the transaction into the state its signature must commit to
    fn prepare_for_signing(&self, tx: &mut Transaction);
}

/// Plain Bitcoin-style rules: no header timestamp, fee charged per
/// started kilobyte
#[derive(Debug, Clone)]
pub struct StandardRules {
    pub fee_per_kb: u64,
}

impl ChainRules for StandardRules {
    fn serialize(&self, tx: &Transaction) -> Vec<u8> {
        if tx.timestamp.is_some() {
            let mut tx = tx.clone();
            tx.timestamp = None;
            return tx.encode();
        }
        tx.encode()
    }

    fn deserialize(&self, raw: &[u8]) -> Result<Transaction, ChainError> {
        Transaction::decode(raw, false)
    }

    fn compute_fee(&self, size: usize) -> u64 {
        (size as u64).div_ceil(1000) * self.fee_per_kb
    }

    fn prepare_for_signing(&self, tx: &mut Transaction) {
        tx.timestamp = None;
    }
}

/// Peercoin-style rules: a header timestamp is part of every transaction,
/// and the fee curve changed at a protocol switch time
#[derive(Debug, Clone)]
pub struct TimestampedRules {
    pub fee_per_kb: u64,
    /// Unix time from which the per-byte fee curve applies
    pub fee_switch_time: i64,
}

/// Floor of the per-byte fee curve
pub const TIMESTAMPED_MIN_FEE: u64 = 1000;

impl TimestampedRules {
    /// Fee at a given point in time
    pub fn fee_at(&self, size: usize, now: i64) -> u64 {
        let size = size as u64;
        if now >= self.fee_switch_time {
            (size * self.fee_per_kb / 1000).max(TIMESTAMPED_MIN_FEE)
        } else {
            (1 + size / 1000) * self.fee_per_kb
        }
    }
}

fn unix_now() -> u32 {
    u32::try_from(chrono::Utc::now().timestamp()).unwrap_or(u32::MAX)
}

impl ChainRules for TimestampedRules {
    fn serialize(&self, tx: &Transaction) -> Vec<u8> {
        if tx.timestamp.is_none() {
            let mut tx = tx.clone();
            tx.timestamp = Some(unix_now());
            return tx.encode();
        }
        tx.encode()
    }

    fn deserialize(&self, raw: &[u8]) -> Result<Transaction, ChainError> {
        Transaction::decode(raw, true)
    }

    fn compute_fee(&self, size: usize) -> u64 {
        self.fee_at(size, chrono::Utc::now().timestamp())
    }

    fn prepare_for_signing(&self, tx: &mut Transaction) {
        if tx.timestamp.is_none() {
            tx.timestamp = Some(unix_now());
        }
    }
}

// =============================================================================
// Network
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Coin {
    Bitcoin,
    Peercoin,
}

impl fmt::Display for Coin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Coin::Bitcoin => f.write_str("bitcoin"),
            Coin::Peercoin => f.write_str("peercoin"),
        }
    }
}

/// Names accepted by [`Network::by_name`]
pub const NETWORK_NAMES: [&str; 4] = [
    "bitcoin",
    "bitcoin-testnet",
    "peercoin",
    "peercoin-testnet",
];

const PEERCOIN_FEE_SWITCH: i64 = 1_552_392_000;
const PEERCOIN_TESTNET_FEE_SWITCH: i64 = 1_541_505_600;

/// Parameters of one blockchain network
#[derive(Debug, Clone)]
pub struct Network {
    pub name: String,
    pub coin: Coin,
    /// Base58 version byte of P2PKH addresses
    pub pubkey_hash_version: u8,
    /// Base58 version byte of WIF private keys
    pub private_key_version: u8,
    pub fee_per_kb: u64,
    /// Smallest output value worth creating
    pub min_output: u64,
    /// Proof-of-authorship payment made to a document's tag address
    pub tag_fee: u64,
    pub testnet: bool,
    rules: Arc<dyn ChainRules>,
}

impl Network {
    fn build(
        name: &str,
        coin: Coin,
        versions: (u8, u8),
        amounts: (u64, u64, u64),
        testnet: bool,
    ) -> Self {
        let (fee_per_kb, min_output, tag_fee) = amounts;
        let mut network = Self {
            name: name.to_string(),
            coin,
            pubkey_hash_version: versions.0,
            private_key_version: versions.1,
            fee_per_kb,
            min_output,
            tag_fee,
            testnet,
            rules: Arc::new(StandardRules { fee_per_kb }),
        };
        network.rules = network.make_rules();
        network
    }

    fn make_rules(&self) -> Arc<dyn ChainRules> {
        match self.coin {
            Coin::Bitcoin => Arc::new(StandardRules {
                fee_per_kb: self.fee_per_kb,
            }),
            Coin::Peercoin => Arc::new(TimestampedRules {
                fee_per_kb: self.fee_per_kb,
                fee_switch_time: if self.testnet {
                    PEERCOIN_TESTNET_FEE_SWITCH
                } else {
                    PEERCOIN_FEE_SWITCH
                },
            }),
        }
    }

    pub fn bitcoin() -> Self {
        Self::build("bitcoin", Coin::Bitcoin, (0x00, 0x80), (100_000, 1_000_000, 1_000_000), false)
    }

    pub fn bitcoin_testnet() -> Self {
        Self::build(
            "bitcoin-testnet",
            Coin::Bitcoin,
            (0x6f, 0xef),
            (100_000, 1_000_000, 1_000_000),
            true,
        )
    }

    pub fn peercoin() -> Self {
        Self::build("peercoin", Coin::Peercoin, (0x37, 0xb7), (10_000, 10_000, 10_000), false)
    }

    pub fn peercoin_testnet() -> Self {
        Self::build(
            "peercoin-testnet",
            Coin::Peercoin,
            (0x6f, 0xef),
            (10_000, 10_000, 10_000),
            true,
        )
    }

    /// Look up a preset by name
    pub fn by_name(name: &str) -> Option<Self> {
        match name {
            "bitcoin" => Some(Self::bitcoin()),
            "bitcoin-testnet" => Some(Self::bitcoin_testnet()),
            "peercoin" | "ppcoin" => Some(Self::peercoin()),
            "peercoin-testnet" | "ppcoin-test" => Some(Self::peercoin_testnet()),
            _ => None,
        }
    }

    /// Replace the fee rate, rebuilding the fee curve
    pub fn with_fee_per_kb(mut self, fee_per_kb: u64) -> Self {
        self.fee_per_kb = fee_per_kb;
        self.rules = self.make_rules();
        self
    }

    /// Inject custom transaction rules
    pub fn with_rules(mut self, rules: Arc<dyn ChainRules>) -> Self {
        self.rules = rules;
        self
    }

    pub fn rules(&self) -> &dyn ChainRules {
        self.rules.as_ref()
    }

    pub fn compute_fee(&self, size: usize) -> u64 {
        self.rules.compute_fee(size)
    }

    /// Base58Check P2PKH address for a public-key hash
    pub fn pkh_address(&self, pubkey_hash: &PubkeyHash) -> String {
        let mut payload = Vec::with_capacity(21);
        payload.push(self.pubkey_hash_version);
        payload.extend_from_slice(pubkey_hash);
        base58check_encode(&payload)
    }

    /// Public-key hash of a P2PKH address on this network
    pub fn address_to_pkh(&self, address: &str) -> Result<PubkeyHash, ChainError> {
        let payload = base58check_decode(address)
            .filter(|p| p.len() == 21 && p[0] == self.pubkey_hash_version)
            .ok_or_else(|| ChainError::InvalidAddress(address.to_string()))?;
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&payload[1..]);
        Ok(hash)
    }

    /// HASH160 of a document tag
    pub fn tag_hash(tag: &str) -> PubkeyHash {
        hash160(tag.as_bytes())
    }

    /// Address that identifies a document tag on this network
    pub fn tag_address(&self, tag: &str) -> String {
        self.pkh_address(&Self::tag_hash(tag))
    }
}
