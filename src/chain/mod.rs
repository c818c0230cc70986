//! Chain primitives
//!
//! This module contains the blockchain building blocks the protocol sits on:
//! - Scripts (P2PKH, single-key unlocking, OP_RETURN data carriers)
//! - Transactions (consensus encoding, txids, SIGHASH_ALL signing)
//! - Networks (address versions, amounts, per-network transaction rules)

pub mod network;
pub mod script;
pub mod transaction;

pub use network::{
    ChainRules, Coin, Network, StandardRules, TimestampedRules, NETWORK_NAMES,
    TIMESTAMPED_MIN_FEE,
};
pub use script::{Instruction, Script, OP_RETURN, P2PKH_SCRIPT_SIZE};
pub use transaction::{
    BlockHash, ChainError, Hash256, OutPoint, Transaction, TxIn, TxOut, Txid, SEQUENCE_FINAL,
    SIGHASH_ALL, TX_VERSION,
};
