//! Transaction handling
//!
//! Bitcoin-style transactions with an optional header timestamp (used by
//! timestamped chains such as Peercoin), consensus encoding, transaction
//! ids and legacy SIGHASH_ALL signing.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use super::script::Script;
use super::ChainRules;
use crate::crypto::{double_sha256, verify_signature, KeyError, KeyPair};

// =============================================================================
// Constants
// =============================================================================

/// Current transaction version
pub const TX_VERSION: u32 = 1;

/// Sequence number that disables locktime
pub const SEQUENCE_FINAL: u32 = 0xFFFFFFFF;

/// Signature hash type: sign all inputs and all outputs
pub const SIGHASH_ALL: u32 = 0x01;

// =============================================================================
// Error Types
// =============================================================================

/// Transaction-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("Unexpected end of transaction data")]
    UnexpectedEof,
    #[error("{0} trailing bytes after transaction")]
    TrailingBytes(usize),
    #[error("Invalid hash encoding: {0}")]
    InvalidHash(String),
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
    #[error("Input index {0} out of range")]
    InputIndexOutOfRange(usize),
    #[error("Crypto error: {0}")]
    CryptoError(#[from] KeyError),
}

// =============================================================================
// Hashes
// =============================================================================

/// A double SHA-256 hash, displayed byte-reversed as is customary for
/// transaction ids and block hashes
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Hash256(pub [u8; 32]);

/// Transaction id
pub type Txid = Hash256;

/// Block hash
pub type BlockHash = Hash256;

impl Hash256 {
    pub fn hash(data: &[u8]) -> Self {
        Self(double_sha256(data))
    }

    pub fn to_hex(&self) -> String {
        let mut bytes = self.0;
        bytes.reverse();
        hex::encode(bytes)
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for Hash256 {
    type Err = ChainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes).map_err(|_| ChainError::InvalidHash(s.to_string()))?;
        bytes.reverse();
        Ok(Self(bytes))
    }
}

impl Serialize for Hash256 {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hash256 {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Wire encoding
// =============================================================================

fn write_varint(buf: &mut Vec<u8>, n: u64) {
    match n {
        0..=0xfc => buf.push(n as u8),
        0xfd..=0xffff => {
            buf.push(0xfd);
            buf.extend_from_slice(&(n as u16).to_le_bytes());
        }
        0x10000..=0xffff_ffff => {
            buf.push(0xfe);
            buf.extend_from_slice(&(n as u32).to_le_bytes());
        }
        _ => {
            buf.push(0xff);
            buf.extend_from_slice(&n.to_le_bytes());
        }
    }
}

fn write_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    write_varint(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

/// Cursor over raw transaction bytes
struct Reader<'a> {
    data: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], ChainError> {
        if self.data.len() < n {
            return Err(ChainError::UnexpectedEof);
        }
        let (head, tail) = self.data.split_at(n);
        self.data = tail;
        Ok(head)
    }

    fn read_u8(&mut self) -> Result<u8, ChainError> {
        Ok(self.take(1)?[0])
    }

    fn read_u32(&mut self) -> Result<u32, ChainError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_u64(&mut self) -> Result<u64, ChainError> {
        let mut b = [0u8; 8];
        b.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(b))
    }

    fn read_varint(&mut self) -> Result<u64, ChainError> {
        match self.read_u8()? {
            0xfd => {
                let b = self.take(2)?;
                Ok(u16::from_le_bytes([b[0], b[1]]) as u64)
            }
            0xfe => Ok(self.read_u32()? as u64),
            0xff => self.read_u64(),
            n => Ok(n as u64),
        }
    }

    fn read_hash(&mut self) -> Result<Hash256, ChainError> {
        let mut b = [0u8; 32];
        b.copy_from_slice(self.take(32)?);
        Ok(Hash256(b))
    }

    fn read_bytes(&mut self) -> Result<Vec<u8>, ChainError> {
        let len = self.read_varint()?;
        let len = usize::try_from(len).map_err(|_| ChainError::UnexpectedEof)?;
        Ok(self.take(len)?.to_vec())
    }

    /// Upper bound for a declared element count, so a corrupt count cannot
    /// trigger a huge allocation
    fn read_count(&mut self, min_element_size: usize) -> Result<usize, ChainError> {
        let count = self.read_varint()?;
        if count > (self.data.len() / min_element_size) as u64 {
            return Err(ChainError::UnexpectedEof);
        }
        Ok(count as usize)
    }
}

// =============================================================================
// Inputs and outputs
// =============================================================================

/// Reference to a previous transaction output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutPoint {
    pub txid: Txid,
    pub vout: u32,
}

/// Transaction input
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxIn {
    pub previous_output: OutPoint,
    pub script_sig: Script,
    pub sequence: u32,
}

impl TxIn {
    pub fn new(previous_output: OutPoint) -> Self {
        Self {
            previous_output,
            script_sig: Script::new(),
            sequence: SEQUENCE_FINAL,
        }
    }
}

/// Transaction output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOut {
    pub value: u64,
    pub script_pubkey: Script,
}

// =============================================================================
// Transaction
// =============================================================================

/// A chain transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub version: u32,
    /// Header timestamp, present only on timestamped chains
    pub timestamp: Option<u32>,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub lock_time: u32,
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

impl Transaction {
    pub fn new() -> Self {
        Self {
            version: TX_VERSION,
            timestamp: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
            lock_time: 0,
        }
    }

    /// Consensus encoding. The timestamp is written after the version
    /// when present.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(256);
        buf.extend_from_slice(&self.version.to_le_bytes());
        if let Some(timestamp) = self.timestamp {
            buf.extend_from_slice(&timestamp.to_le_bytes());
        }
        write_varint(&mut buf, self.inputs.len() as u64);
        for input in &self.inputs {
            buf.extend_from_slice(&input.previous_output.txid.0);
            buf.extend_from_slice(&input.previous_output.vout.to_le_bytes());
            write_bytes(&mut buf, input.script_sig.as_bytes());
            buf.extend_from_slice(&input.sequence.to_le_bytes());
        }
        write_varint(&mut buf, self.outputs.len() as u64);
        for output in &self.outputs {
            buf.extend_from_slice(&output.value.to_le_bytes());
            write_bytes(&mut buf, output.script_pubkey.as_bytes());
        }
        buf.extend_from_slice(&self.lock_time.to_le_bytes());
        buf
    }

    /// Decode a transaction; `timestamped` selects the header layout
    pub fn decode(raw: &[u8], timestamped: bool) -> Result<Self, ChainError> {
        let mut r = Reader { data: raw };
        let version = r.read_u32()?;
        let timestamp = if timestamped {
            Some(r.read_u32()?)
        } else {
            None
        };

        // outpoint + empty script + sequence
        let input_count = r.read_count(41)?;
        let mut inputs = Vec::with_capacity(input_count);
        for _ in 0..input_count {
            let txid = r.read_hash()?;
            let vout = r.read_u32()?;
            let script_sig = Script::from_bytes(r.read_bytes()?);
            let sequence = r.read_u32()?;
            inputs.push(TxIn {
                previous_output: OutPoint { txid, vout },
                script_sig,
                sequence,
            });
        }

        // value + empty script
        let output_count = r.read_count(9)?;
        let mut outputs = Vec::with_capacity(output_count);
        for _ in 0..output_count {
            let value = r.read_u64()?;
            let script_pubkey = Script::from_bytes(r.read_bytes()?);
            outputs.push(TxOut {
                value,
                script_pubkey,
            });
        }

        let lock_time = r.read_u32()?;
        if !r.data.is_empty() {
            return Err(ChainError::TrailingBytes(r.data.len()));
        }

        Ok(Self {
            version,
            timestamp,
            inputs,
            outputs,
            lock_time,
        })
    }

    /// Transaction id: double SHA-256 of the consensus encoding
    pub fn txid(&self) -> Txid {
        Hash256::hash(&self.encode())
    }

    /// Serialized size in bytes
    pub fn size(&self) -> usize {
        self.encode().len()
    }

    pub fn total_output(&self) -> u64 {
        self.outputs.iter().map(|o| o.value).sum()
    }

    /// Legacy SIGHASH_ALL digest for input `index` spending `prev_script`
    pub fn signature_hash(&self, index: usize, prev_script: &Script) -> Result<[u8; 32], ChainError> {
        if index >= self.inputs.len() {
            return Err(ChainError::InputIndexOutOfRange(index));
        }
        let mut copy = self.clone();
        for (i, input) in copy.inputs.iter_mut().enumerate() {
            input.script_sig = if i == index {
                prev_script.clone()
            } else {
                Script::new()
            };
        }
        let mut preimage = copy.encode();
        preimage.extend_from_slice(&SIGHASH_ALL.to_le_bytes());
        Ok(double_sha256(&preimage))
    }

    /// Sign input `index` with `key`, installing a P2PKH unlocking script
    pub fn sign_input(
        &mut self,
        index: usize,
        key: &KeyPair,
        prev_script: &Script,
        rules: &dyn ChainRules,
    ) -> Result<(), ChainError> {
        rules.prepare_for_signing(self);
        let digest = self.signature_hash(index, prev_script)?;
        let mut signature = key.sign(&digest);
        signature.push(SIGHASH_ALL as u8);
        self.inputs[index].script_sig = Script::p2pkh_in(&signature, &key.public_key_bytes());
        Ok(())
    }

    /// Check the P2PKH unlocking script of input `index` against the output
    /// it spends
    pub fn verify_input(&self, index: usize, prev_script: &Script) -> Result<bool, ChainError> {
        let input = self
            .inputs
            .get(index)
            .ok_or(ChainError::InputIndexOutOfRange(index))?;
        let Some(expected) = prev_script.as_p2pkh_out() else {
            return Ok(false);
        };
        let Some((signature, public_key)) = input.script_sig.as_p2pkh_in() else {
            return Ok(false);
        };
        if crate::crypto::hash160(public_key) != expected {
            return Ok(false);
        }
        let Some((&hash_type, der)) = signature.split_last() else {
            return Ok(false);
        };
        if hash_type as u32 != SIGHASH_ALL {
            return Ok(false);
        }
        let digest = self.signature_hash(index, prev_script)?;
        Ok(verify_signature(public_key, &digest, der)?)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::Network;

    fn sample(timestamp: Option<u32>) -> Transaction {
        let mut tx = Transaction::new();
        tx.timestamp = timestamp;
        tx.inputs.push(TxIn::new(OutPoint {
            txid: Hash256([3u8; 32]),
            vout: 1,
        }));
        tx.outputs.push(TxOut {
            value: 10_000,
            script_pubkey: Script::p2pkh(&[9u8; 20]),
        });
        tx.outputs.push(TxOut {
            value: 0,
            script_pubkey: Script::data_out(b"payload"),
        });
        tx
    }

    #[test]
    fn test_encode_decode() {
        let tx = sample(None);
        let raw = tx.encode();
        assert_eq!(Transaction::decode(&raw, false).unwrap(), tx);

        let stamped = sample(Some(1_700_000_000));
        let raw = stamped.encode();
        assert_eq!(raw.len(), tx.size() + 4);
        assert_eq!(Transaction::decode(&raw, true).unwrap(), stamped);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let raw = sample(None).encode();
        assert_eq!(
            Transaction::decode(&raw[..raw.len() - 1], false),
            Err(ChainError::UnexpectedEof)
        );
        let mut extra = raw.clone();
        extra.push(0);
        assert_eq!(
            Transaction::decode(&extra, false),
            Err(ChainError::TrailingBytes(1))
        );
    }

    #[test]
    fn test_hash_display_roundtrip() {
        let hash = Hash256::hash(b"block");
        let parsed: Hash256 = hash.to_string().parse().unwrap();
        assert_eq!(parsed, hash);
        assert!("zz".parse::<Hash256>().is_err());
    }

    #[test]
    fn test_sign_and_verify_input() {
        let network = Network::bitcoin();
        let key = KeyPair::generate();
        let prev_script = Script::p2pkh(&key.pubkey_hash());

        let mut tx = sample(None);
        tx.sign_input(0, &key, &prev_script, network.rules())
            .unwrap();
        assert!(tx.verify_input(0, &prev_script).unwrap());

        // Changing an output invalidates the signature
        tx.outputs[0].value += 1;
        assert!(!tx.verify_input(0, &prev_script).unwrap());
    }

    #[test]
    fn test_verify_rejects_wrong_key() {
        let network = Network::bitcoin();
        let key = KeyPair::generate();
        let other = KeyPair::generate();

        let mut tx = sample(None);
        tx.sign_input(0, &key, &Script::p2pkh(&key.pubkey_hash()), network.rules())
            .unwrap();
        assert!(!tx
            .verify_input(0, &Script::p2pkh(&other.pubkey_hash()))
            .unwrap());
    }
}
