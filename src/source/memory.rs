//! In-memory data source
//!
//! Simulates a single chain: funding outputs, a mempool, mined blocks and
//! an address index over P2PKH outputs. Broadcasts are checked for missing
//! or spent inputs, bad signatures and overspending. Mempool outputs are
//! spendable right away so update chains can be broadcast back to back.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{BlockData, DataSource, SourceError, TxData};
use crate::chain::{BlockHash, Hash256, Network, OutPoint, Script, Transaction, TxIn, TxOut, Txid};
use crate::wallet::Utxo;

/// Time of block 0; each later block is ten minutes after the previous
pub const GENESIS_TIME: i64 = 1_600_000_000;
pub const BLOCK_INTERVAL: i64 = 600;

#[derive(Debug, Default)]
struct ChainState {
    txs: HashMap<Txid, TxData>,
    blocks: HashMap<BlockHash, BlockData>,
    chain: Vec<BlockHash>,
    mempool: Vec<Txid>,
    unspent: HashMap<OutPoint, TxOut>,
    /// address -> txids paying it, in arrival order
    index: HashMap<String, Vec<Txid>>,
    funded: u64,
    offline: bool,
}

#[derive(Debug)]
pub struct MemorySource {
    network: Network,
    state: Mutex<ChainState>,
}

impl MemorySource {
    pub fn new(network: Network) -> Self {
        Self {
            network,
            state: Mutex::new(ChainState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, ChainState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn online(&self) -> Result<MutexGuard<'_, ChainState>, SourceError> {
        let state = self.state();
        if state.offline {
            return Err(SourceError::Transport("source is offline".to_string()));
        }
        Ok(state)
    }

    /// Make every call fail with a transport error until switched back
    pub fn set_offline(&self, offline: bool) {
        self.state().offline = offline;
    }

    /// Create a coinbase-style output of `value` paying `address`. The
    /// funding transaction lands in the mempool.
    pub fn fund(&self, address: &str, value: u64) -> Result<Utxo, SourceError> {
        let pubkey_hash = self
            .network
            .address_to_pkh(address)
            .map_err(|e| SourceError::Rejected(e.to_string()))?;

        let mut state = self.state();
        state.funded += 1;

        let mut tx = Transaction::new();
        let mut input = TxIn::new(OutPoint {
            txid: Hash256::default(),
            vout: u32::MAX,
        });
        input.script_sig.push_slice(&state.funded.to_le_bytes());
        tx.inputs.push(input);
        tx.outputs.push(TxOut {
            value,
            script_pubkey: Script::p2pkh(&pubkey_hash),
        });
        self.network.rules().prepare_for_signing(&mut tx);

        let raw = self.network.rules().serialize(&tx);
        let txid = tx.txid();
        self.accept(&mut state, txid, raw, &tx);

        Ok(Utxo {
            txid,
            vout: 0,
            address: address.to_string(),
            script_pubkey: tx.outputs[0].script_pubkey.clone(),
            value,
        })
    }

    /// Confirm every mempool transaction in a new block
    pub fn mine_block(&self) -> BlockHash {
        let mut state = self.state();
        let height = state.chain.len() as u64;
        let txids = std::mem::take(&mut state.mempool);

        let mut header = height.to_le_bytes().to_vec();
        for txid in &txids {
            header.extend_from_slice(&txid.0);
        }
        let hash = Hash256::hash(&header);

        for txid in &txids {
            if let Some(data) = state.txs.get_mut(txid) {
                data.block_hash = Some(hash);
            }
        }
        let time = Utc
            .timestamp_opt(GENESIS_TIME + BLOCK_INTERVAL * height as i64, 0)
            .single()
            .unwrap_or_default();
        state.blocks.insert(hash, BlockData { height, time, txids });
        state.chain.push(hash);
        log::debug!("Mined block {} at height {}", hash, height);
        hash
    }

    pub fn height(&self) -> usize {
        self.state().chain.len()
    }

    pub fn mempool_len(&self) -> usize {
        self.state().mempool.len()
    }

    /// Decoded transaction, confirmed or not
    pub fn transaction(&self, txid: &Txid) -> Option<Transaction> {
        let state = self.state();
        let data = state.txs.get(txid)?;
        self.network.rules().deserialize(&data.raw).ok()
    }

    fn accept(&self, state: &mut ChainState, txid: Txid, raw: Vec<u8>, tx: &Transaction) {
        for input in &tx.inputs {
            state.unspent.remove(&input.previous_output);
        }
        for (vout, output) in tx.outputs.iter().enumerate() {
            if output.script_pubkey.as_data_out().is_some() {
                continue;
            }
            state.unspent.insert(
                OutPoint {
                    txid,
                    vout: vout as u32,
                },
                output.clone(),
            );
            if let Some(pubkey_hash) = output.script_pubkey.as_p2pkh_out() {
                let ids = state
                    .index
                    .entry(self.network.pkh_address(&pubkey_hash))
                    .or_default();
                if !ids.contains(&txid) {
                    ids.push(txid);
                }
            }
        }
        state.txs.insert(
            txid,
            TxData {
                raw,
                block_hash: None,
            },
        );
        state.mempool.push(txid);
    }

    fn check(state: &ChainState, tx: &Transaction) -> Result<(), SourceError> {
        if tx.inputs.is_empty() || tx.outputs.is_empty() {
            return Err(SourceError::Rejected("empty inputs or outputs".to_string()));
        }
        let mut total_in = 0u64;
        for (i, input) in tx.inputs.iter().enumerate() {
            let spent = state.unspent.get(&input.previous_output).ok_or_else(|| {
                SourceError::Rejected(format!(
                    "input {} spends missing or spent output {}:{}",
                    i, input.previous_output.txid, input.previous_output.vout
                ))
            })?;
            let valid = tx
                .verify_input(i, &spent.script_pubkey)
                .map_err(|e| SourceError::Rejected(e.to_string()))?;
            if !valid {
                return Err(SourceError::Rejected(format!("bad signature on input {}", i)));
            }
            total_in += spent.value;
        }
        if total_in < tx.total_output() {
            return Err(SourceError::Rejected(format!(
                "outputs {} exceed inputs {}",
                tx.total_output(),
                total_in
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl DataSource for MemorySource {
    fn network(&self) -> &Network {
        &self.network
    }

    fn tagged_transactions<'a>(
        &'a self,
        address: &'a str,
    ) -> BoxStream<'a, Result<Txid, SourceError>> {
        match self.online() {
            Ok(state) => {
                let ids = state.index.get(address).cloned().unwrap_or_default();
                stream::iter(ids.into_iter().map(Ok)).boxed()
            }
            Err(e) => stream::once(async move { Err(e) }).boxed(),
        }
    }

    async fn get_transaction(&self, txid: &Txid) -> Result<TxData, SourceError> {
        self.online()?
            .txs
            .get(txid)
            .cloned()
            .ok_or_else(|| SourceError::NotFound(format!("transaction {}", txid)))
    }

    async fn get_block(&self, hash: &BlockHash) -> Result<BlockData, SourceError> {
        self.online()?
            .blocks
            .get(hash)
            .cloned()
            .ok_or_else(|| SourceError::NotFound(format!("block {}", hash)))
    }

    async fn send_raw_transaction(&self, raw: &[u8]) -> Result<Txid, SourceError> {
        let tx = self
            .network
            .rules()
            .deserialize(raw)
            .map_err(|e| SourceError::Rejected(e.to_string()))?;
        let txid = tx.txid();

        let mut state = self.online()?;
        if state.txs.contains_key(&txid) {
            return Err(SourceError::Rejected(format!("duplicate transaction {}", txid)));
        }
        Self::check(&state, &tx)?;
        self.accept(&mut state, txid, raw.to_vec(), &tx);
        log::debug!("Accepted transaction {} into mempool", txid);
        Ok(txid)
    }

    async fn unspent_outputs(&self, address: &str) -> Result<Vec<Utxo>, SourceError> {
        let pubkey_hash = self
            .network
            .address_to_pkh(address)
            .map_err(|e| SourceError::NotFound(e.to_string()))?;
        let state = self.online()?;

        let mut utxos: Vec<Utxo> = state
            .unspent
            .iter()
            .filter(|(_, output)| output.script_pubkey.as_p2pkh_out() == Some(pubkey_hash))
            .map(|(outpoint, output)| Utxo {
                txid: outpoint.txid,
                vout: outpoint.vout,
                address: address.to_string(),
                script_pubkey: output.script_pubkey.clone(),
                value: output.value,
            })
            .collect();
        utxos.sort_by(|a, b| (a.txid.0, a.vout).cmp(&(b.txid.0, b.vout)));
        Ok(utxos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use futures::TryStreamExt;

    fn spend(network: &Network, key: &KeyPair, utxo: &Utxo, to: &str, value: u64) -> Transaction {
        let mut tx = Transaction::new();
        tx.inputs.push(TxIn::new(utxo.outpoint()));
        tx.outputs.push(TxOut {
            value,
            script_pubkey: Script::p2pkh(&network.address_to_pkh(to).unwrap()),
        });
        tx.sign_input(0, key, &utxo.script_pubkey, network.rules())
            .unwrap();
        tx
    }

    #[tokio::test]
    async fn test_fund_and_mine() {
        let network = Network::peercoin();
        let source = MemorySource::new(network.clone());
        let key = KeyPair::generate();
        let address = network.pkh_address(&key.pubkey_hash());

        let utxo = source.fund(&address, 50_000).unwrap();
        let data = source.get_transaction(&utxo.txid).await.unwrap();
        assert!(data.block_hash.is_none());

        let hash = source.mine_block();
        let block = source.get_block(&hash).await.unwrap();
        assert_eq!(block.height, 0);
        assert_eq!(block.txids, vec![utxo.txid]);
        assert_eq!(
            source.get_transaction(&utxo.txid).await.unwrap().block_hash,
            Some(hash)
        );

        let tagged: Vec<Txid> = source
            .tagged_transactions(&address)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(tagged, vec![utxo.txid]);
        assert_eq!(source.unspent_outputs(&address).await.unwrap(), vec![utxo]);
    }

    #[tokio::test]
    async fn test_broadcast_checks() {
        let network = Network::bitcoin();
        let source = MemorySource::new(network.clone());
        let key = KeyPair::generate();
        let other = KeyPair::generate();
        let address = network.pkh_address(&key.pubkey_hash());
        let to = network.pkh_address(&other.pubkey_hash());
        let utxo = source.fund(&address, 1_000).unwrap();

        // overspend
        let tx = spend(&network, &key, &utxo, &to, 1_001);
        assert!(matches!(
            source.send_raw_transaction(&network.rules().serialize(&tx)).await,
            Err(SourceError::Rejected(_))
        ));

        // wrong key
        let tx = spend(&network, &other, &utxo, &to, 500);
        assert!(source
            .send_raw_transaction(&network.rules().serialize(&tx))
            .await
            .is_err());

        let tx = spend(&network, &key, &utxo, &to, 500);
        let raw = network.rules().serialize(&tx);
        assert_eq!(source.send_raw_transaction(&raw).await, Ok(tx.txid()));
        assert!(source.unspent_outputs(&address).await.unwrap().is_empty());
        assert_eq!(source.unspent_outputs(&to).await.unwrap()[0].value, 500);

        // double spend
        let again = spend(&network, &key, &utxo, &to, 400);
        assert!(source
            .send_raw_transaction(&network.rules().serialize(&again))
            .await
            .is_err());
        assert_eq!(source.mempool_len(), 2);
    }

    #[tokio::test]
    async fn test_offline_source_fails() {
        let network = Network::bitcoin();
        let source = MemorySource::new(network.clone());
        source.set_offline(true);
        let result: Result<Vec<Txid>, _> = source.tagged_transactions("x").try_collect().await;
        assert!(matches!(result, Err(SourceError::Transport(_))));
        assert!(matches!(
            source.get_block(&Hash256::default()).await,
            Err(SourceError::Transport(_))
        ));
    }

    #[test]
    fn test_block_times_advance() {
        let source = MemorySource::new(Network::bitcoin());
        source.mine_block();
        source.mine_block();
        assert_eq!(source.height(), 2);
    }
}
