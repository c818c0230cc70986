//! Script handling for output locking and input unlocking
//!
//! Only the three standard shapes the anchoring protocol relies on are
//! built and recognised: pay-to-public-key-hash outputs, their matching
//! single-key unlocking scripts, and OP_RETURN data carriers.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::crypto::PubkeyHash;

// =============================================================================
// Opcodes
// =============================================================================

pub const OP_PUSHDATA1: u8 = 0x4c;
pub const OP_PUSHDATA2: u8 = 0x4d;
pub const OP_PUSHDATA4: u8 = 0x4e;
pub const OP_RETURN: u8 = 0x6a;
pub const OP_DUP: u8 = 0x76;
pub const OP_EQUALVERIFY: u8 = 0x88;
pub const OP_HASH160: u8 = 0xa9;
pub const OP_CHECKSIG: u8 = 0xac;

/// Size of a P2PKH locking script
pub const P2PKH_SCRIPT_SIZE: usize = 25;

// =============================================================================
// Instructions
// =============================================================================

/// One parsed script element
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction<'a> {
    Push(&'a [u8]),
    Op(u8),
}

/// Iterator over the instructions of a script. Yields `None` as an item
/// when a push runs past the end of the script.
pub struct Instructions<'a> {
    data: &'a [u8],
}

impl<'a> Iterator for Instructions<'a> {
    type Item = Option<Instruction<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        let (&opcode, rest) = self.data.split_first()?;
        let (len, rest) = match opcode {
            0x01..=0x4b => (opcode as usize, rest),
            OP_PUSHDATA1 => match rest.split_first() {
                Some((&n, rest)) => (n as usize, rest),
                None => return self.truncated(),
            },
            OP_PUSHDATA2 if rest.len() >= 2 => {
                (u16::from_le_bytes([rest[0], rest[1]]) as usize, &rest[2..])
            }
            OP_PUSHDATA4 if rest.len() >= 4 => (
                u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize,
                &rest[4..],
            ),
            OP_PUSHDATA2 | OP_PUSHDATA4 => return self.truncated(),
            op => {
                self.data = rest;
                return Some(Some(Instruction::Op(op)));
            }
        };
        if rest.len() < len {
            return self.truncated();
        }
        let (push, rest) = rest.split_at(len);
        self.data = rest;
        Some(Some(Instruction::Push(push)))
    }
}

impl<'a> Instructions<'a> {
    fn truncated(&mut self) -> Option<Option<Instruction<'a>>> {
        self.data = &[];
        Some(None)
    }
}

// =============================================================================
// Script
// =============================================================================

/// A raw script
#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Script(#[serde(with = "hex")] Vec<u8>);

impl fmt::Debug for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Script({})", hex::encode(&self.0))
    }
}

impl Script {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Pay to Public Key Hash:
    /// `OP_DUP OP_HASH160 <20> OP_EQUALVERIFY OP_CHECKSIG`
    pub fn p2pkh(pubkey_hash: &PubkeyHash) -> Self {
        let mut script = Vec::with_capacity(P2PKH_SCRIPT_SIZE);
        script.extend_from_slice(&[OP_DUP, OP_HASH160, 20]);
        script.extend_from_slice(pubkey_hash);
        script.extend_from_slice(&[OP_EQUALVERIFY, OP_CHECKSIG]);
        Self(script)
    }

    /// Unlocking script for a P2PKH output: `<sig> <pubkey>`
    pub fn p2pkh_in(signature: &[u8], public_key: &[u8]) -> Self {
        let mut script = Self::new();
        script.push_slice(signature);
        script.push_slice(public_key);
        script
    }

    /// Provably unspendable data carrier: `OP_RETURN <data>`
    pub fn data_out(data: &[u8]) -> Self {
        let mut script = Self(vec![OP_RETURN]);
        script.push_slice(data);
        script
    }

    /// Append a minimal push of `data`
    pub fn push_slice(&mut self, data: &[u8]) {
        match data.len() {
            n if n < OP_PUSHDATA1 as usize => self.0.push(n as u8),
            n if n <= 0xff => {
                self.0.push(OP_PUSHDATA1);
                self.0.push(n as u8);
            }
            n if n <= 0xffff => {
                self.0.push(OP_PUSHDATA2);
                self.0.extend_from_slice(&(n as u16).to_le_bytes());
            }
            n => {
                self.0.push(OP_PUSHDATA4);
                self.0.extend_from_slice(&(n as u32).to_le_bytes());
            }
        }
        self.0.extend_from_slice(data);
    }

    pub fn instructions(&self) -> Instructions<'_> {
        Instructions { data: &self.0 }
    }

    /// Returns the public-key hash if this is a standard P2PKH output
    pub fn as_p2pkh_out(&self) -> Option<PubkeyHash> {
        let s = &self.0;
        if s.len() == P2PKH_SCRIPT_SIZE
            && s[0] == OP_DUP
            && s[1] == OP_HASH160
            && s[2] == 20
            && s[23] == OP_EQUALVERIFY
            && s[24] == OP_CHECKSIG
        {
            let mut hash = [0u8; 20];
            hash.copy_from_slice(&s[3..23]);
            Some(hash)
        } else {
            None
        }
    }

    /// Returns `(signature, public_key)` if this is a standard single-key
    /// unlocking script: exactly two pushes, the second a SEC1 public key.
    pub fn as_p2pkh_in(&self) -> Option<(&[u8], &[u8])> {
        let mut iter = self.instructions();
        let sig = match iter.next()? {
            Some(Instruction::Push(sig)) if !sig.is_empty() => sig,
            _ => return None,
        };
        let pubkey = match iter.next()? {
            Some(Instruction::Push(pk)) => pk,
            _ => return None,
        };
        if iter.next().is_some() {
            return None;
        }
        let well_formed = match pubkey.len() {
            33 => pubkey[0] == 0x02 || pubkey[0] == 0x03,
            65 => pubkey[0] == 0x04,
            _ => false,
        };
        well_formed.then_some((sig, pubkey))
    }

    /// Returns the carried bytes if this is an OP_RETURN data output.
    /// A bare OP_RETURN carries no data.
    pub fn as_data_out(&self) -> Option<&[u8]> {
        let (&first, _) = self.0.split_first()?;
        if first != OP_RETURN {
            return None;
        }
        let mut iter = self.instructions().skip(1);
        match iter.next() {
            None => Some(&[][..]),
            Some(Some(Instruction::Push(data))) if iter.next().is_none() => Some(data),
            _ => None,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
