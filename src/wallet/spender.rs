//! Funding wallet
//!
//! A [`Spender`] pairs a signing key with the pool of outputs it can spend
//! on one network. The pool is refreshed from the data source and shared
//! with update builders through a mutex.

use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::allocator::{Utxo, UtxoAllocator};
use crate::chain::{Network, Script};
use crate::crypto::{KeyError, KeyPair, PubkeyHash};
use crate::flight::SingleFlight;
use crate::source::{DataSource, SourceError, SourceRegistry};

pub struct Spender {
    key: KeyPair,
    network: Network,
    address: String,
    source: Arc<dyn DataSource>,
    pool: Mutex<UtxoAllocator>,
    refresh: SingleFlight<Result<Vec<Utxo>, SourceError>>,
}

impl fmt::Debug for Spender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Spender")
            .field("address", &self.address)
            .field("network", &self.network.name)
            .finish()
    }
}

impl Spender {
    pub fn new(key: KeyPair, network: Network, source: Arc<dyn DataSource>) -> Self {
        let address = network.pkh_address(&key.pubkey_hash());
        Self {
            key,
            network,
            address,
            source,
            pool: Mutex::new(UtxoAllocator::new()),
            refresh: SingleFlight::new(),
        }
    }

    /// Use the first source the registry resolves for `network`
    pub fn open(
        key: KeyPair,
        network: Network,
        registry: &SourceRegistry,
    ) -> Result<Self, SourceError> {
        let source = registry.resolve(&network)?;
        Ok(Self::new(key, network, source))
    }

    /// Import a WIF private key for `network`
    pub fn from_wif(
        wif: &str,
        network: Network,
        source: Arc<dyn DataSource>,
    ) -> Result<Self, KeyError> {
        let key = KeyPair::from_wif(wif, network.private_key_version)?;
        Ok(Self::new(key, network, source))
    }

    pub fn key(&self) -> &KeyPair {
        &self.key
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn pubkey_hash(&self) -> PubkeyHash {
        self.key.pubkey_hash()
    }

    /// Locking script of this spender's outputs
    pub fn script_pubkey(&self) -> Script {
        Script::p2pkh(&self.pubkey_hash())
    }

    pub fn source(&self) -> &Arc<dyn DataSource> {
        &self.source
    }

    pub fn pool(&self) -> &Mutex<UtxoAllocator> {
        &self.pool
    }

    /// Pull the address's unspent outputs into the pool. Concurrent calls
    /// share one lookup. Returns the number of newly added outputs.
    pub async fn refresh(&self) -> Result<usize, SourceError> {
        let source = self.source.clone();
        let address = self.address.clone();
        let utxos = self
            .refresh
            .run(move || async move { source.unspent_outputs(&address).await })
            .await?;

        let mut pool = self.pool.lock().await;
        let added = utxos.into_iter().filter(|u| pool.push(u.clone())).count();
        log::debug!("Refreshed {}: {} new outputs", self.address, added);
        Ok(added)
    }

    /// Add an output to the pool
    pub async fn push(&self, utxo: Utxo) -> bool {
        self.pool.lock().await.push(utxo)
    }

    /// Total value currently available in the pool
    pub async fn balance(&self) -> u64 {
        self.pool.lock().await.balance()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemorySource;

    #[tokio::test]
    async fn test_refresh_is_idempotent() {
        let network = Network::peercoin_testnet();
        let memory = Arc::new(MemorySource::new(network.clone()));
        let spender = Spender::new(KeyPair::generate(), network, memory.clone());

        memory.fund(spender.address(), 30_000).unwrap();
        memory.fund(spender.address(), 20_000).unwrap();

        let (a, b) = tokio::join!(spender.refresh(), spender.refresh());
        assert_eq!(a.unwrap() + b.unwrap(), 2);
        assert_eq!(spender.refresh().await.unwrap(), 0);
        assert_eq!(spender.balance().await, 50_000);
    }

    #[tokio::test]
    async fn test_from_wif() {
        let network = Network::bitcoin_testnet();
        let key = KeyPair::generate();
        let wif = key.to_wif(network.private_key_version);
        let source = Arc::new(MemorySource::new(network.clone()));

        let spender = Spender::from_wif(&wif, network.clone(), source.clone()).unwrap();
        assert_eq!(spender.pubkey_hash(), key.pubkey_hash());
        assert!(spender.address().starts_with(['m', 'n']));

        let mainnet_wif = key.to_wif(Network::bitcoin().private_key_version);
        assert!(Spender::from_wif(&mainnet_wif, network, source).is_err());
    }

    #[tokio::test]
    async fn test_refresh_surfaces_source_errors() {
        let network = Network::bitcoin();
        let memory = Arc::new(MemorySource::new(network.clone()));
        let spender = Spender::new(KeyPair::generate(), network, memory.clone());
        memory.set_offline(true);
        assert!(matches!(
            spender.refresh().await,
            Err(SourceError::Transport(_))
        ));
    }
}
