//! Anchored document
//!
//! A [`Document`] keeps the transition history of one tag in sync with a
//! data source and is the entry point for publishing updates:
//! - `sync` replays every tagged transaction in block order
//! - `update_content`, `add_uri` and `transfer_ownership` check the signer
//!   against the current owner and return a prepared [`UpdateBuilder`]

use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use futures::TryStreamExt;
use prost::Message;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

use crate::chain::{BlockHash, Network, Txid};
use crate::crypto::PubkeyHash;
use crate::flight::SingleFlight;
use crate::protocol::{
    encode_content_update, encode_ownership_transfer, encode_uri_add, ContentHashes, Parser,
    Transition, MAX_DATA_OUTPUT_SIZE,
};
use crate::source::{BlockData, DataSource, SourceError, SourceRegistry, TxData};
use crate::update::{BuildError, UpdateBuilder};
use crate::wallet::Spender;

// =============================================================================
// Errors
// =============================================================================

/// Failure of one sync pass
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("Data source error: {0}")]
    Source(#[from] SourceError),
    #[error("Unknown transaction {0}")]
    UnknownTransaction(Txid),
    #[error("Unknown block {0}")]
    UnknownBlock(BlockHash),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DocumentError {
    #[error("Signer {actual} is not the document owner {expected}")]
    OwnershipMismatch { expected: String, actual: String },
    #[error("Initial content update required")]
    InitialContentRequired,
    #[error("Content update declares no digests")]
    EmptyContent,
    #[error("Payload of {size} bytes exceeds the data output limit of {limit}")]
    PayloadTooLarge { size: usize, limit: usize },
    #[error("Signer is on network {actual}, document on {expected}")]
    NetworkMismatch { expected: String, actual: String },
    #[error(transparent)]
    Build(#[from] BuildError),
}

// =============================================================================
// Document
// =============================================================================

#[derive(Debug, Default)]
struct Cache {
    txs: HashMap<Txid, TxData>,
    /// Full block metadata; relevance filtering happens at replay
    blocks: HashMap<BlockHash, BlockData>,
}

struct Inner {
    tag: String,
    tag_hash: PubkeyHash,
    address: String,
    network: Network,
    source: Arc<dyn DataSource>,
    cache: Mutex<Cache>,
    transitions: RwLock<Vec<Transition>>,
}

/// One tagged document on one network
#[derive(Clone)]
pub struct Document {
    inner: Arc<Inner>,
    sync: Arc<SingleFlight<Result<(), SyncError>>>,
}

impl std::fmt::Debug for Document {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Document")
            .field("tag", &self.inner.tag)
            .field("address", &self.inner.address)
            .field("network", &self.inner.network.name)
            .finish()
    }
}

impl Document {
    pub fn new(tag: &str, network: Network, source: Arc<dyn DataSource>) -> Self {
        let tag_hash = Network::tag_hash(tag);
        let address = network.pkh_address(&tag_hash);
        Self {
            inner: Arc::new(Inner {
                tag: tag.to_string(),
                tag_hash,
                address,
                network,
                source,
                cache: Mutex::new(Cache::default()),
                transitions: RwLock::new(Vec::new()),
            }),
            sync: Arc::new(SingleFlight::new()),
        }
    }

    /// Open a document with the first source the registry resolves
    pub fn open(tag: &str, network: Network, registry: &SourceRegistry) -> Result<Self, SourceError> {
        let source = registry.resolve(&network)?;
        Ok(Self::new(tag, network, source))
    }

    pub fn tag(&self) -> &str {
        &self.inner.tag
    }

    pub fn tag_hash(&self) -> &PubkeyHash {
        &self.inner.tag_hash
    }

    pub fn tag_address(&self) -> &str {
        &self.inner.address
    }

    pub fn network(&self) -> &Network {
        &self.inner.network
    }

    /// History as of the last completed sync
    pub async fn transitions(&self) -> Vec<Transition> {
        self.inner.transitions.read().await.clone()
    }

    /// Owner after the latest transition, `None` before any content update
    pub async fn current_owner(&self) -> Option<String> {
        self.inner
            .transitions
            .read()
            .await
            .last()
            .map(|t| t.effective_owner().to_string())
    }

    /// Replay the tag's transactions and replace the history. Concurrent
    /// calls share one replay.
    pub async fn sync(&self) -> Result<(), SyncError> {
        let inner = self.inner.clone();
        self.sync.run(move || inner.replay()).await
    }

    // -------------------------------------------------------------------------
    // Mutations
    // -------------------------------------------------------------------------

    /// Declare a new document version. Permitted without a prior owner.
    pub async fn update_content<'a>(
        &self,
        signer: &'a Spender,
        hashes: &ContentHashes,
    ) -> Result<UpdateBuilder<'a>, DocumentError> {
        if hashes.is_empty() {
            return Err(DocumentError::EmptyContent);
        }
        self.check_signer(signer, false).await?;

        let mut builder = UpdateBuilder::new(signer, &self.inner.tag_hash);
        for payload in encode_content_update(hashes) {
            let queued = builder.push(&payload).await.map(|_| ());
            if let Err(e) = queued {
                builder.abort().await;
                return Err(e.into());
            }
        }
        Ok(builder)
    }

    /// Attach a locator to the current version
    pub async fn add_uri<'a>(
        &self,
        signer: &'a Spender,
        uri: &str,
    ) -> Result<UpdateBuilder<'a>, DocumentError> {
        let payload = encode_uri_add(uri);
        let size = payload.encoded_len();
        if size >= MAX_DATA_OUTPUT_SIZE {
            return Err(DocumentError::PayloadTooLarge {
                size,
                limit: MAX_DATA_OUTPUT_SIZE,
            });
        }
        self.check_signer(signer, true).await?;

        let mut builder = UpdateBuilder::new(signer, &self.inner.tag_hash);
        builder.push(&payload).await?;
        Ok(builder)
    }

    /// Hand the document to `next_owner`, who co-signs the transfer
    pub async fn transfer_ownership<'a>(
        &self,
        signer: &'a Spender,
        next_owner: &'a Spender,
    ) -> Result<UpdateBuilder<'a>, DocumentError> {
        self.check_signer(signer, true).await?;
        self.check_network(next_owner)?;

        let mut builder = UpdateBuilder::new(signer, &self.inner.tag_hash);
        builder
            .push_transfer(&encode_ownership_transfer(), next_owner)
            .await?;
        Ok(builder)
    }

    fn check_network(&self, spender: &Spender) -> Result<(), DocumentError> {
        if spender.network().name != self.inner.network.name {
            return Err(DocumentError::NetworkMismatch {
                expected: self.inner.network.name.clone(),
                actual: spender.network().name.clone(),
            });
        }
        Ok(())
    }

    async fn check_signer(&self, signer: &Spender, needs_owner: bool) -> Result<(), DocumentError> {
        self.check_network(signer)?;
        match self.current_owner().await {
            Some(owner) if owner != signer.address() => Err(DocumentError::OwnershipMismatch {
                expected: owner,
                actual: signer.address().to_string(),
            }),
            Some(_) => Ok(()),
            None if needs_owner => Err(DocumentError::InitialContentRequired),
            None => Ok(()),
        }
    }
}

// =============================================================================
// Replay
// =============================================================================

/// A block's relevant transactions, ready to feed
struct Ordered {
    height: u64,
    time: DateTime<Utc>,
    txids: Vec<Txid>,
}

impl Inner {
    async fn replay(self: Arc<Self>) -> Result<(), SyncError> {
        let txids = self.load_transactions().await?;
        let blocks = self.load_blocks(&txids).await?;

        let rules = self.network.rules();
        let mut parser = Parser::new(self.tag_hash, self.network.clone());
        let mut rejected = 0usize;
        {
            let cache = self.cache.lock().await;
            for block in &blocks {
                for txid in &block.txids {
                    let data = cache
                        .txs
                        .get(txid)
                        .ok_or(SyncError::UnknownTransaction(*txid))?;
                    let tx = match rules.deserialize(&data.raw) {
                        Ok(tx) => tx,
                        Err(e) => {
                            log::warn!("Undecodable transaction {}: {}", txid, e);
                            rejected += 1;
                            continue;
                        }
                    };
                    if let Err(reason) = parser.feed(*txid, &tx, block.time) {
                        log::debug!("Transaction rejected: {}: {}", txid, reason);
                        rejected += 1;
                    }
                }
            }
        }

        let history = parser.finish();
        log::info!(
            "Synced {} ({}): {} transitions from {} transactions in {} blocks, {} rejected",
            self.tag,
            self.address,
            history.len(),
            txids.len(),
            blocks.len(),
            rejected
        );
        *self.transitions.write().await = history;
        Ok(())
    }

    /// Every tagged transaction id, fetching bodies not yet cached
    async fn load_transactions(&self) -> Result<Vec<Txid>, SyncError> {
        let listed: Vec<Txid> = self
            .source
            .tagged_transactions(&self.address)
            .try_collect()
            .await?;
        let mut seen = HashSet::new();
        let txids: Vec<Txid> = listed.into_iter().filter(|id| seen.insert(*id)).collect();

        let missing: Vec<Txid> = {
            let cache = self.cache.lock().await;
            // Unconfirmed bodies are fetched again to pick up their block
            txids
                .iter()
                .filter(|id| cache.txs.get(id).map_or(true, |tx| tx.block_hash.is_none()))
                .copied()
                .collect()
        };
        let fetched = try_join_all(missing.iter().map(|txid| async move {
            let data = self.source.get_transaction(txid).await?;
            Ok::<_, SourceError>((*txid, data))
        }))
        .await?;

        self.cache.lock().await.txs.extend(fetched);
        Ok(txids)
    }

    /// Containing blocks of `txids` in height order, each reduced to the
    /// given transactions in block order
    async fn load_blocks(&self, txids: &[Txid]) -> Result<Vec<Ordered>, SyncError> {
        let mut hashes: Vec<BlockHash> = Vec::new();
        let missing: Vec<BlockHash> = {
            let cache = self.cache.lock().await;
            for txid in txids {
                let data = cache
                    .txs
                    .get(txid)
                    .ok_or(SyncError::UnknownTransaction(*txid))?;
                match data.block_hash {
                    Some(hash) if !hashes.contains(&hash) => hashes.push(hash),
                    Some(_) => {}
                    None => log::debug!("Skipping unconfirmed transaction {}", txid),
                }
            }
            hashes
                .iter()
                .filter(|hash| !cache.blocks.contains_key(hash))
                .copied()
                .collect()
        };

        let fetched = try_join_all(missing.iter().map(|hash| async move {
            let block = self.source.get_block(hash).await?;
            Ok::<_, SourceError>((*hash, block))
        }))
        .await?;

        let mut cache = self.cache.lock().await;
        cache.blocks.extend(fetched);

        let relevant: HashSet<&Txid> = txids.iter().collect();
        let mut blocks = Vec::with_capacity(hashes.len());
        for hash in &hashes {
            let block = cache
                .blocks
                .get(hash)
                .ok_or(SyncError::UnknownBlock(*hash))?;
            blocks.push(Ordered {
                height: block.height,
                time: block.time,
                txids: block
                    .txids
                    .iter()
                    .filter(|id| relevant.contains(id))
                    .copied()
                    .collect(),
            });
        }
        blocks.sort_by_key(|b| b.height);
        Ok(blocks)
    }
}
