//! Doc-Anchor: document provenance anchored on UTXO blockchains
//!
//! This crate records a document's content fingerprints and locator URIs in
//! small tagged transactions, and rebuilds the document's ownership and
//! content history by replaying them:
//! - Payload codec for the data output (protobuf)
//! - Replay parser turning tagged transactions into transitions
//! - UTXO allocator and fee-fitting transaction chain builder
//! - Document orchestration with coalesced sync
//! - Per-network transaction rules (Bitcoin, Peercoin)
//!
//! # Example
//!
//! ```rust,no_run
//! use doc_anchor::{ContentHashes, Document, KeyPair, MemorySource, Network, Spender};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let network = Network::peercoin_testnet();
//! let source = Arc::new(MemorySource::new(network.clone()));
//!
//! let owner = Spender::new(KeyPair::generate(), network.clone(), source.clone());
//! owner.refresh().await?;
//!
//! let doc = Document::new("my-document", network, source);
//! doc.sync().await?;
//!
//! let hashes = ContentHashes::digest_all(b"document body");
//! let txid = doc.update_content(&owner, &hashes).await?.commit().await?;
//! println!("Anchored in {}", txid);
//! # Ok(())
//! # }
//! ```

pub mod chain;
pub mod cli;
pub mod config;
pub mod crypto;
pub mod document;
pub mod flight;
pub mod protocol;
pub mod source;
pub mod update;
pub mod wallet;

// Re-export commonly used types
pub use chain::{ChainRules, Network, Script, Transaction, Txid};
pub use config::{AnchorConfig, ConfigError};
pub use crypto::KeyPair;
pub use document::{Document, DocumentError, SyncError};
pub use protocol::{
    ContentHashes, HashAlgorithm, Parser, Payload, PayloadError, State, Transition,
};
pub use source::{DataSource, MemorySource, SourceError, SourceRegistry};
pub use update::{BuildError, UpdateBuilder};
pub use wallet::{Spender, Utxo, UtxoAllocator};
