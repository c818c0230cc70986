//! Transaction chain builder
//!
//! Every payload becomes one transaction laid out as
//!
//! | input 0        | input 1 (transfer only) | further inputs  |
//! |----------------|-------------------------|-----------------|
//! | owner funding  | next owner co-signature | owner funding   |
//!
//! | output 0         | output 1      | output 2      | output 3 (transfer only) |
//! |------------------|---------------|---------------|--------------------------|
//! | tag fee to tag   | payload data  | change        | refund to next owner     |
//!
//! Each transaction after the first spends the previous one's change, so
//! the chain must be broadcast in order.

use std::fmt;
use thiserror::Error;

use crate::chain::{ChainError, Script, Transaction, TxIn, TxOut, Txid};
use crate::crypto::PubkeyHash;
use crate::protocol::Payload;
use crate::source::SourceError;
use crate::wallet::{AllocError, Spender, Utxo};

/// Output index of the change output
pub const CHANGE_VOUT: u32 = 2;

/// Output index of the co-signer refund
pub const REFUND_VOUT: u32 = 3;

/// Upper bound on fee-fitting rounds for one transaction
const MAX_FEE_ROUNDS: usize = 16;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error(transparent)]
    Alloc(#[from] AllocError),
    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),
    #[error("Data source error: {0}")]
    Source(#[from] SourceError),
    #[error("Fee did not converge after {0} rounds")]
    FeeNotConverged(usize),
    #[error("No transactions to broadcast")]
    EmptyUpdate,
    #[error("Co-signer must be a different key on the same network")]
    InvalidCosigner,
}

/// The co-signing side of an ownership transfer
struct Cosign<'a> {
    spender: &'a Spender,
    utxo: Utxo,
}

/// One fully signed transaction waiting for broadcast
struct Queued {
    tx: Transaction,
    /// Outputs taken from the funding pool for this transaction
    allocated: Vec<Utxo>,
    change: Utxo,
    /// Carries the co-signed ownership transfer
    transfer: bool,
}

/// Builds and broadcasts the transaction chain of one document update.
///
/// Nothing is broadcast until [`commit`](Self::commit). Dropping a builder
/// without committing or aborting leaves its allocated outputs out of the
/// pool until the next refresh.
pub struct UpdateBuilder<'a> {
    spender: &'a Spender,
    tag_script: Script,
    queue: Vec<Queued>,
    cosign: Option<Cosign<'a>>,
}

impl fmt::Debug for UpdateBuilder<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateBuilder")
            .field("spender", &self.spender.address())
            .field("queued", &self.queue.len())
            .field("cosigned", &self.cosign.is_some())
            .finish()
    }
}

impl<'a> UpdateBuilder<'a> {
    pub fn new(spender: &'a Spender, tag_hash: &PubkeyHash) -> Self {
        Self {
            spender,
            tag_script: Script::p2pkh(tag_hash),
            queue: Vec::new(),
            cosign: None,
        }
    }

    /// Queue a transaction carrying `payload`
    pub async fn push(&mut self, payload: &Payload) -> Result<&Transaction, BuildError> {
        self.build(payload, false).await?;
        Ok(self.last())
    }

    /// Queue an ownership transfer co-signed by `next_owner`, who supplies
    /// one output that is refunded in full
    pub async fn push_transfer(
        &mut self,
        payload: &Payload,
        next_owner: &'a Spender,
    ) -> Result<&Transaction, BuildError> {
        if self.cosign.is_some()
            || next_owner.pubkey_hash() == self.spender.pubkey_hash()
            || next_owner.network().name != self.spender.network().name
        {
            return Err(BuildError::InvalidCosigner);
        }
        let utxo = {
            let mut pool = next_owner.pool().lock().await;
            let mut taken = pool.allocate(1)?;
            let utxo = taken.pop();
            pool.unallocate(taken);
            utxo.ok_or(AllocError::InsufficientFunds {
                available: 0,
                requested: 1,
            })?
        };
        self.cosign = Some(Cosign {
            spender: next_owner,
            utxo,
        });

        if let Err(e) = self.build(payload, true).await {
            self.release_cosign().await;
            return Err(e);
        }
        Ok(self.last())
    }

    fn last(&self) -> &Transaction {
        &self.queue[self.queue.len() - 1].tx
    }

    async fn build(&mut self, payload: &Payload, transfer: bool) -> Result<(), BuildError> {
        let network = self.spender.network();
        let rules = network.rules();
        let fixed = network.tag_fee + network.min_output;

        let mut funding: Vec<Utxo> = Vec::new();
        let mut allocated: Vec<Utxo> = Vec::new();
        if let Some(previous) = self.queue.last() {
            funding.push(previous.change.clone());
        }

        let mut change = 0u64;
        for _ in 0..MAX_FEE_ROUNDS {
            let balance: u64 = funding.iter().map(|u| u.value).sum();
            if funding.is_empty() || balance < fixed {
                let extra = self.allocate(fixed - balance, &mut allocated).await?;
                funding.extend(extra);
                continue;
            }

            let tx = match self.assemble(&funding, payload, change, transfer) {
                Ok(tx) => tx,
                Err(e) => return Err(self.release(allocated, e).await),
            };
            let fee = network.compute_fee(rules.serialize(&tx).len());
            let need = fixed + fee;
            if balance < need {
                let extra = self.allocate(need - balance, &mut allocated).await?;
                funding.extend(extra);
                continue;
            }

            let fitted = balance - network.tag_fee - fee;
            if fitted != change {
                change = fitted;
                continue;
            }

            let txid = tx.txid();
            log::debug!(
                "Queued {} with {} inputs, fee {}, change {}",
                txid,
                tx.inputs.len(),
                fee,
                change
            );
            self.queue.push(Queued {
                change: Utxo {
                    txid,
                    vout: CHANGE_VOUT,
                    address: self.spender.address().to_string(),
                    script_pubkey: self.spender.script_pubkey(),
                    value: change,
                },
                tx,
                allocated,
                transfer,
            });
            return Ok(());
        }

        Err(self
            .release(allocated, BuildError::FeeNotConverged(MAX_FEE_ROUNDS))
            .await)
    }

    /// Hand the outputs taken for a failed transaction back to the pool
    async fn release(&self, allocated: Vec<Utxo>, err: BuildError) -> BuildError {
        self.spender.pool().lock().await.unallocate(allocated);
        err
    }

    /// Take `amount` from the funding pool, recording it for rollback
    async fn allocate(
        &self,
        amount: u64,
        allocated: &mut Vec<Utxo>,
    ) -> Result<Vec<Utxo>, BuildError> {
        let mut pool = self.spender.pool().lock().await;
        match pool.allocate(amount) {
            Ok(utxos) => {
                allocated.extend(utxos.iter().cloned());
                Ok(utxos)
            }
            Err(e) => {
                pool.unallocate(std::mem::take(allocated));
                Err(e.into())
            }
        }
    }

    /// Lay out and sign one transaction
    fn assemble(
        &self,
        funding: &[Utxo],
        payload: &Payload,
        change: u64,
        transfer: bool,
    ) -> Result<Transaction, BuildError> {
        let network = self.spender.network();
        let rules = network.rules();
        let cosign = self.cosign.as_ref().filter(|_| transfer);

        let mut signers: Vec<(&Spender, &Utxo)> =
            funding.iter().map(|u| (self.spender, u)).collect();
        if let Some(cosign) = cosign {
            signers.insert(1, (cosign.spender, &cosign.utxo));
        }

        let mut tx = Transaction::new();
        tx.inputs = signers
            .iter()
            .map(|(_, utxo)| TxIn::new(utxo.outpoint()))
            .collect();
        tx.outputs.push(TxOut {
            value: network.tag_fee,
            script_pubkey: self.tag_script.clone(),
        });
        tx.outputs.push(TxOut {
            value: 0,
            script_pubkey: Script::data_out(&payload.to_bytes()),
        });
        tx.outputs.push(TxOut {
            value: change,
            script_pubkey: self.spender.script_pubkey(),
        });
        if let Some(cosign) = cosign {
            tx.outputs.push(TxOut {
                value: cosign.utxo.value,
                script_pubkey: cosign.spender.script_pubkey(),
            });
        }

        rules.prepare_for_signing(&mut tx);
        for (index, (signer, utxo)) in signers.iter().enumerate() {
            tx.sign_input(index, signer.key(), &utxo.script_pubkey, rules)?;
        }
        Ok(tx)
    }

    /// Queued transactions in broadcast order
    pub fn transactions(&self) -> impl Iterator<Item = &Transaction> {
        self.queue.iter().map(|q| &q.tx)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Serialized bytes of the last queued transaction
    pub fn raw_transaction(&self) -> Option<Vec<u8>> {
        let network = self.spender.network();
        self.queue.last().map(|q| network.rules().serialize(&q.tx))
    }

    /// Broadcast the chain in order and return the last transaction id.
    ///
    /// If a broadcast fails, every output allocated for the transactions
    /// not yet broadcast goes back to the pool, along with the change of
    /// the last transaction that was.
    pub async fn commit(mut self) -> Result<Txid, BuildError> {
        let queue = std::mem::take(&mut self.queue);
        if queue.is_empty() {
            self.release_cosign().await;
            return Err(BuildError::EmptyUpdate);
        }

        let network = self.spender.network();
        let source = self.spender.source();
        let mut last = None;
        for (index, queued) in queue.iter().enumerate() {
            let raw = network.rules().serialize(&queued.tx);
            match source.send_raw_transaction(&raw).await {
                Ok(txid) => {
                    log::info!("Broadcast {} ({} of {})", txid, index + 1, queue.len());
                    last = Some(txid);
                }
                Err(e) => {
                    log::warn!("Broadcast of {} failed: {}", queued.tx.txid(), e);
                    self.rollback(&queue, index).await;
                    return Err(e.into());
                }
            }
        }

        if let Some(tail) = queue.last() {
            self.spender.push(tail.change.clone()).await;
        }
        if let Some(transfer) = queue.iter().find(|q| q.transfer) {
            self.refund(transfer).await;
        }
        last.ok_or(BuildError::EmptyUpdate)
    }

    /// Return every allocated output without broadcasting
    pub async fn abort(mut self) {
        let queue = std::mem::take(&mut self.queue);
        self.rollback(&queue, 0).await;
    }

    async fn rollback(&mut self, queue: &[Queued], failed: usize) {
        let restored: Vec<Utxo> = queue[failed..]
            .iter()
            .flat_map(|q| q.allocated.iter().cloned())
            .collect();
        let mut pool = self.spender.pool().lock().await;
        pool.unallocate(restored);
        if failed > 0 {
            pool.push(queue[failed - 1].change.clone());
        }
        drop(pool);

        match queue[..failed].iter().find(|q| q.transfer) {
            Some(transfer) => self.refund(transfer).await,
            None => self.release_cosign().await,
        }
    }

    /// Hand the co-signer the refund output of a broadcast transfer
    async fn refund(&mut self, transfer: &Queued) {
        if let Some(cosign) = self.cosign.take() {
            cosign
                .spender
                .push(Utxo {
                    txid: transfer.tx.txid(),
                    vout: REFUND_VOUT,
                    address: cosign.spender.address().to_string(),
                    script_pubkey: cosign.spender.script_pubkey(),
                    value: cosign.utxo.value,
                })
                .await;
        }
    }

    async fn release_cosign(&mut self) {
        if let Some(cosign) = self.cosign.take() {
            cosign
                .spender
                .pool()
                .lock()
                .await
                .unallocate(vec![cosign.utxo]);
        }
    }
}
