//! Blockchain data sources
//!
//! A [`DataSource`] answers the lookups a document replay needs (tagged
//! transactions, transaction bodies, block metadata) and broadcasts signed
//! transactions for one network.

pub mod memory;
pub mod registry;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::chain::{BlockHash, Network, Txid};
use crate::wallet::Utxo;

pub use memory::MemorySource;
pub use registry::{SourceFactory, SourceRegistry};

/// Data source failures, passed through to callers verbatim
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Transaction rejected: {0}")]
    Rejected(String),
    #[error("Network failure: {0}")]
    Transport(String),
    #[error("No data source for network {0}")]
    NoSource(String),
}

/// A transaction body and the block containing it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxData {
    #[serde(with = "hex")]
    pub raw: Vec<u8>,
    /// `None` while unconfirmed
    pub block_hash: Option<BlockHash>,
}

/// Block metadata with the block's transaction ids in block order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockData {
    pub height: u64,
    pub time: DateTime<Utc>,
    pub txids: Vec<Txid>,
}

#[async_trait]
pub trait DataSource: Send + Sync {
    fn network(&self) -> &Network;

    /// Ids of every transaction paying `address`
    fn tagged_transactions<'a>(&'a self, address: &'a str)
        -> BoxStream<'a, Result<Txid, SourceError>>;

    async fn get_transaction(&self, txid: &Txid) -> Result<TxData, SourceError>;

    async fn get_block(&self, hash: &BlockHash) -> Result<BlockData, SourceError>;

    async fn send_raw_transaction(&self, raw: &[u8]) -> Result<Txid, SourceError>;

    async fn unspent_outputs(&self, address: &str) -> Result<Vec<Utxo>, SourceError>;
}
