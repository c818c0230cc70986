//! Spendable-output pool for one key

use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use thiserror::Error;

use crate::chain::{OutPoint, Script, Txid};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocError {
    #[error("Insufficient funds: have {available}, need {requested}")]
    InsufficientFunds { available: u64, requested: u64 },
}

/// An unspent transaction output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    pub txid: Txid,
    pub vout: u32,
    pub address: String,
    pub script_pubkey: Script,
    pub value: u64,
}

impl Utxo {
    pub fn outpoint(&self) -> OutPoint {
        OutPoint {
            txid: self.txid,
            vout: self.vout,
        }
    }
}

/// Ordered pool of spendable outputs.
///
/// Allocation is last-in-first-out: the most recently pushed outputs
/// (usually this process's own change) are spent first.
#[derive(Debug, Default)]
pub struct UtxoAllocator {
    pool: VecDeque<Utxo>,
    seen: HashSet<Txid>,
}

impl UtxoAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an output unless its transaction was already recorded
    pub fn push(&mut self, utxo: Utxo) -> bool {
        if !self.seen.insert(utxo.txid) {
            return false;
        }
        self.pool.push_back(utxo);
        true
    }

    /// Take outputs summing to at least `amount`, newest first. The returned
    /// outputs keep their pool order. Nothing is taken on failure.
    pub fn allocate(&mut self, amount: u64) -> Result<Vec<Utxo>, AllocError> {
        if amount == 0 {
            return Ok(Vec::new());
        }

        let mut sum = 0u64;
        let mut start = self.pool.len();
        while sum < amount {
            if start == 0 {
                return Err(AllocError::InsufficientFunds {
                    available: sum,
                    requested: amount,
                });
            }
            start -= 1;
            sum = sum.saturating_add(self.pool[start].value);
        }

        Ok(self.pool.drain(start..).collect())
    }

    /// Return allocated outputs to the front of the pool, in order
    pub fn unallocate(&mut self, utxos: Vec<Utxo>) {
        for utxo in utxos.into_iter().rev() {
            self.seen.insert(utxo.txid);
            self.pool.push_front(utxo);
        }
    }

    pub fn balance(&self) -> u64 {
        self.pool.iter().map(|u| u.value).sum()
    }

    pub fn len(&self) -> usize {
        self.pool.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Utxo> {
        self.pool.iter()
    }
}
