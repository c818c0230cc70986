//! Transaction replay state machine
//!
//! The parser consumes the transactions touching a document's tag address,
//! in causal order, and folds them into a list of [`Transition`]s. Each
//! transaction is validated on its own; an invalid one is rejected and
//! leaves the history untouched.
//!
//! A content update opens a new transition. Transactions without the
//! CONTENT_UPDATE flag amend the open transition (extra digests, URIs).
//! An ownership transfer closes the open transition immediately and hands
//! control to the co-signer of the transfer.

use chrono::{DateTime, Utc};
use thiserror::Error;

use super::model::{ContentHashes, HashAlgorithm, State, Transition};
use super::payload::{self, PayloadError, PayloadFlags};
use crate::chain::{Network, Transaction, Txid};
use crate::crypto::{hash160, PubkeyHash};

// =============================================================================
// Rejections
// =============================================================================

/// Protocol rule broken by a transaction
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    #[error("first input is not a single-key spend")]
    NotSingleKeySpend,
    #[error("signed by {actual}, expected owner {expected}")]
    WrongSigner { expected: String, actual: String },
    #[error("first output does not pay the tag address")]
    NotTagged,
    #[error("second output is not a data output")]
    MissingDataOutput,
    #[error("unknown flag bits {0:#x}")]
    UnknownFlags(u32),
    #[error("initial content update required")]
    InitialContentRequired,
    #[error("ownership transfer without a co-signing second input")]
    MissingCosigner,
    #[error("digest of {0} bytes matches no algorithm")]
    InvalidDigestLength(usize),
    #[error("conflicting {0} digest")]
    HashMismatch(HashAlgorithm),
    #[error("content update declares no digests")]
    EmptyContentUpdate,
}

/// Why a transaction was skipped during replay
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    #[error("malformed payload: {0}")]
    MalformedPayload(#[from] PayloadError),
    #[error("protocol violation: {0}")]
    ProtocolViolation(#[from] Violation),
}

// =============================================================================
// Per-transaction delta
// =============================================================================

/// What one validated transaction contributes
#[derive(Debug, Default)]
struct Delta {
    spender: PubkeyHash,
    next_owner: Option<PubkeyHash>,
    content_update: bool,
    hashes: ContentHashes,
    uris: Vec<String>,
}

// =============================================================================
// Parser
// =============================================================================

/// Replays tagged transactions into a transition history
#[derive(Debug)]
pub struct Parser {
    tag_hash: PubkeyHash,
    network: Network,

    owner: Option<PubkeyHash>,
    owner_address: Option<String>,
    /// Start time of the open transition, `None` when none is open
    time: Option<DateTime<Utc>>,
    /// Complete hash set of the current version
    hashes: ContentHashes,
    uris: Vec<String>,
    txids: Vec<Txid>,

    transitions: Vec<Transition>,
}

impl Parser {
    pub fn new(tag_hash: PubkeyHash, network: Network) -> Self {
        Self {
            tag_hash,
            network,
            owner: None,
            owner_address: None,
            time: None,
            hashes: ContentHashes::new(),
            uris: Vec::new(),
            txids: Vec::new(),
            transitions: Vec::new(),
        }
    }

    /// Current owner's public-key hash, once established
    pub fn owner(&self) -> Option<&PubkeyHash> {
        self.owner.as_ref()
    }

    /// Validate and apply one transaction. On rejection the parser state
    /// is unchanged.
    pub fn feed(&mut self, txid: Txid, tx: &Transaction, time: DateTime<Utc>) -> Result<(), Rejection> {
        let delta = self.validate(tx)?;
        self.commit(txid, time, delta);
        Ok(())
    }

    /// Close any open transition and return the collected history,
    /// resetting the parser
    pub fn finish(&mut self) -> Vec<Transition> {
        self.flush();
        self.owner = None;
        self.owner_address = None;
        self.time = None;
        self.hashes.clear();
        self.uris.clear();
        self.txids.clear();
        std::mem::take(&mut self.transitions)
    }

    fn validate(&self, tx: &Transaction) -> Result<Delta, Rejection> {
        let mut delta = Delta::default();

        let (_, pubkey) = tx
            .inputs
            .first()
            .and_then(|input| input.script_sig.as_p2pkh_in())
            .ok_or(Violation::NotSingleKeySpend)?;
        delta.spender = hash160(pubkey);
        if let Some(owner) = &self.owner {
            if *owner != delta.spender {
                return Err(Violation::WrongSigner {
                    expected: self.network.pkh_address(owner),
                    actual: self.network.pkh_address(&delta.spender),
                }
                .into());
            }
        }

        let tagged = tx
            .outputs
            .first()
            .and_then(|output| output.script_pubkey.as_p2pkh_out());
        if tagged != Some(self.tag_hash) {
            return Err(Violation::NotTagged.into());
        }

        let data = tx
            .outputs
            .get(1)
            .and_then(|output| output.script_pubkey.as_data_out())
            .ok_or(Violation::MissingDataOutput)?;
        let payload = match payload::decode(data) {
            Err(PayloadError::UnknownFlags(bits)) => {
                return Err(Violation::UnknownFlags(bits).into())
            }
            other => other?,
        };

        let flags = payload.payload_flags();
        delta.content_update = flags.contains(PayloadFlags::CONTENT_UPDATE);
        if self.owner.is_none() && !delta.content_update {
            return Err(Violation::InitialContentRequired.into());
        }

        if flags.contains(PayloadFlags::OWNERSHIP_TRANSFER) {
            let (_, pubkey) = tx
                .inputs
                .get(1)
                .and_then(|input| input.script_sig.as_p2pkh_in())
                .ok_or(Violation::MissingCosigner)?;
            delta.next_owner = Some(hash160(pubkey));
        }

        for (family, digest) in payload.digests() {
            let algorithm = HashAlgorithm::from_family_len(family, digest.len())
                .ok_or(Violation::InvalidDigestLength(digest.len()))?;
            self.stage_digest(&mut delta, algorithm, digest)?;
        }

        if delta.content_update && delta.hashes.is_empty() {
            return Err(Violation::EmptyContentUpdate.into());
        }

        delta.uris = payload.uris();
        Ok(delta)
    }

    /// A digest for an algorithm already in the current version must match
    /// it exactly. Content updates restate it into the new version; for
    /// amendments it is already known and nothing is staged.
    fn stage_digest(
        &self,
        delta: &mut Delta,
        algorithm: HashAlgorithm,
        digest: &[u8],
    ) -> Result<(), Violation> {
        if let Some(existing) = self.hashes.get(algorithm) {
            if existing != digest {
                return Err(Violation::HashMismatch(algorithm));
            }
            if !delta.content_update {
                return Ok(());
            }
        }
        match delta.hashes.get(algorithm) {
            Some(staged) if staged != digest => Err(Violation::HashMismatch(algorithm)),
            Some(_) => Ok(()),
            None => {
                delta
                    .hashes
                    .insert(algorithm, digest.to_vec())
                    .map_err(|_| Violation::InvalidDigestLength(digest.len()))?;
                Ok(())
            }
        }
    }

    fn commit(&mut self, txid: Txid, time: DateTime<Utc>, delta: Delta) {
        if delta.content_update {
            self.flush();
            self.time = Some(time);
            self.hashes.clear();
        }
        self.txids.push(txid);
        if self.owner.is_none() {
            self.owner = Some(delta.spender);
        }
        self.hashes.extend(delta.hashes);
        self.uris.extend(delta.uris);

        if let Some(next_owner) = delta.next_owner {
            self.push(time, Some(next_owner));
        }
    }

    /// Finalize the open transition, if any
    fn flush(&mut self) {
        if let Some(time) = self.time {
            self.push(time, None);
        }
    }

    fn push(&mut self, fallback_time: DateTime<Utc>, next_owner: Option<PubkeyHash>) {
        let Some(owner) = self.owner else {
            return;
        };
        let owner_address = self
            .owner_address
            .get_or_insert_with(|| self.network.pkh_address(&owner))
            .clone();

        let mut transition = Transition {
            state: State {
                time: self.time.take().unwrap_or(fallback_time),
                owner: owner_address,
                hash: self.hashes.clone(),
            },
            txids: std::mem::take(&mut self.txids),
            next_owner: None,
            uris: std::mem::take(&mut self.uris),
        };

        if let Some(next) = next_owner {
            let next_address = self.network.pkh_address(&next);
            transition.next_owner = Some(next_address.clone());
            self.owner = Some(next);
            self.owner_address = Some(next_address);
        }

        self.transitions.push(transition);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::chain::{Hash256, OutPoint, Script, TxIn, TxOut};
    use crate::crypto::KeyPair;
    use crate::protocol::payload::{encode_content_update, encode_uri_add, Payload};
    use chrono::TimeZone;

    pub(crate) const TAG: &str = "test-document";

    /// A protocol transaction signed by `owner`, optionally co-signed
    pub(crate) fn protocol_tx(
        network: &Network,
        owner: &KeyPair,
        cosigner: Option<&KeyPair>,
        payload: &Payload,
    ) -> Transaction {
        let mut tx = Transaction::new();
        let signers: Vec<&KeyPair> = std::iter::once(owner).chain(cosigner).collect();
        for (i, _) in signers.iter().enumerate() {
            tx.inputs.push(TxIn::new(OutPoint {
                txid: Hash256([i as u8 + 1; 32]),
                vout: 0,
            }));
        }
        tx.outputs.push(TxOut {
            value: network.tag_fee,
            script_pubkey: Script::p2pkh(&Network::tag_hash(TAG)),
        });
        tx.outputs.push(TxOut {
            value: 0,
            script_pubkey: Script::data_out(&payload.to_bytes()),
        });
        for (i, key) in signers.into_iter().enumerate() {
            let prev = Script::p2pkh(&key.pubkey_hash());
            tx.sign_input(i, key, &prev, network.rules()).unwrap();
        }
        tx
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_600_000_000 + secs, 0).unwrap()
    }

    fn digest(alg: HashAlgorithm, byte: u8) -> ContentHashes {
        let mut hashes = ContentHashes::new();
        hashes.insert(alg, vec![byte; alg.digest_len()]).unwrap();
        hashes
    }

    fn content(alg: HashAlgorithm, byte: u8) -> Payload {
        encode_content_update(&digest(alg, byte)).remove(0)
    }

    fn parser(network: &Network) -> Parser {
        Parser::new(Network::tag_hash(TAG), network.clone())
    }

    fn feed(parser: &mut Parser, tx: &Transaction, secs: i64) -> Result<(), Rejection> {
        parser.feed(tx.txid(), tx, at(secs))
    }

    #[test]
    fn test_empty_stream_yields_no_history() {
        let network = Network::bitcoin();
        assert!(parser(&network).finish().is_empty());
    }

    #[test]
    fn test_initial_content_update() {
        let network = Network::bitcoin();
        let owner = KeyPair::generate();
        let mut p = parser(&network);

        let tx = protocol_tx(&network, &owner, None, &content(HashAlgorithm::Sha2_256, 1));
        feed(&mut p, &tx, 0).unwrap();

        let history = p.finish();
        assert_eq!(history.len(), 1);
        let t = &history[0];
        assert_eq!(t.state.owner, network.pkh_address(&owner.pubkey_hash()));
        assert_eq!(t.state.time, at(0));
        assert_eq!(t.txids, vec![tx.txid()]);
        assert_eq!(t.state.hash, digest(HashAlgorithm::Sha2_256, 1));
        assert!(t.next_owner.is_none());
    }

    #[test]
    fn test_uri_before_content_is_rejected() {
        let network = Network::bitcoin();
        let owner = KeyPair::generate();
        let mut p = parser(&network);

        let tx = protocol_tx(&network, &owner, None, &encode_uri_add("https://example.com"));
        assert_eq!(
            feed(&mut p, &tx, 0),
            Err(Rejection::ProtocolViolation(Violation::InitialContentRequired))
        );
        assert!(p.finish().is_empty());
    }

    #[test]
    fn test_amendments_join_open_transition() {
        let network = Network::bitcoin();
        let owner = KeyPair::generate();
        let mut p = parser(&network);

        let first = protocol_tx(&network, &owner, None, &content(HashAlgorithm::Sha2_256, 1));
        let uri = protocol_tx(&network, &owner, None, &encode_uri_add("https://example.com/doc"));
        let extra = Payload {
            sha3: vec![vec![2; 32]],
            ..Default::default()
        };
        let extra = protocol_tx(&network, &owner, None, &extra);
        feed(&mut p, &first, 0).unwrap();
        feed(&mut p, &uri, 10).unwrap();
        feed(&mut p, &extra, 20).unwrap();

        let history = p.finish();
        assert_eq!(history.len(), 1);
        let t = &history[0];
        assert_eq!(t.txids, vec![first.txid(), uri.txid(), extra.txid()]);
        assert_eq!(t.uris, vec!["https://example.com/doc".to_string()]);
        assert_eq!(t.state.hash.len(), 2);
        assert_eq!(t.state.time, at(0));
    }

    #[test]
    fn test_wrong_signer_is_rejected() {
        let network = Network::bitcoin();
        let owner = KeyPair::generate();
        let intruder = KeyPair::generate();
        let mut p = parser(&network);

        feed(
            &mut p,
            &protocol_tx(&network, &owner, None, &content(HashAlgorithm::Sha2_256, 1)),
            0,
        )
        .unwrap();
        let bad = protocol_tx(&network, &intruder, None, &encode_uri_add("ftp://x"));
        assert!(matches!(
            feed(&mut p, &bad, 10),
            Err(Rejection::ProtocolViolation(Violation::WrongSigner { .. }))
        ));
        assert!(p.finish()[0].uris.is_empty());
    }

    #[test]
    fn test_redeclared_digest() {
        let network = Network::bitcoin();
        let owner = KeyPair::generate();
        let mut p = parser(&network);

        feed(
            &mut p,
            &protocol_tx(&network, &owner, None, &content(HashAlgorithm::Sha2_256, 1)),
            0,
        )
        .unwrap();

        // Identical re-declaration opens a new version carrying the digest
        let same = protocol_tx(&network, &owner, None, &content(HashAlgorithm::Sha2_256, 1));
        feed(&mut p, &same, 10).unwrap();

        // A conflicting digest is rejected
        let conflicting = protocol_tx(&network, &owner, None, &content(HashAlgorithm::Sha2_256, 9));
        assert_eq!(
            feed(&mut p, &conflicting, 20),
            Err(Rejection::ProtocolViolation(Violation::HashMismatch(
                HashAlgorithm::Sha2_256
            )))
        );

        let history = p.finish();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].txids, vec![same.txid()]);
        assert_eq!(history[1].state.hash, digest(HashAlgorithm::Sha2_256, 1));
    }

    #[test]
    fn test_conflicting_amendment_is_rejected() {
        let network = Network::bitcoin();
        let owner = KeyPair::generate();
        let mut p = parser(&network);

        feed(
            &mut p,
            &protocol_tx(&network, &owner, None, &content(HashAlgorithm::Sha2_256, 1)),
            0,
        )
        .unwrap();
        let amend = Payload {
            sha2: vec![vec![7; 32]],
            ..Default::default()
        };
        let amend = protocol_tx(&network, &owner, None, &amend);
        assert!(feed(&mut p, &amend, 5).is_err());
        assert_eq!(p.finish()[0].state.hash, digest(HashAlgorithm::Sha2_256, 1));
    }

    #[test]
    fn test_duplicate_within_transaction() {
        let network = Network::bitcoin();
        let owner = KeyPair::generate();
        let mut p = parser(&network);

        let mut dup = content(HashAlgorithm::Sha2_256, 1);
        dup.sha2.push(vec![1; 32]);
        feed(&mut p, &protocol_tx(&network, &owner, None, &dup), 0).unwrap();

        let mut conflicting = content(HashAlgorithm::Sha3_256, 1);
        conflicting.sha3.push(vec![2; 32]);
        assert!(feed(&mut p, &protocol_tx(&network, &owner, None, &conflicting), 5).is_err());
    }

    #[test]
    fn test_invalid_digest_length() {
        let network = Network::bitcoin();
        let owner = KeyPair::generate();
        let mut p = parser(&network);

        let payload = Payload {
            flags: Some(PayloadFlags::CONTENT_UPDATE.bits()),
            sha2: vec![vec![1; 20]],
            ..Default::default()
        };
        assert_eq!(
            feed(&mut p, &protocol_tx(&network, &owner, None, &payload), 0),
            Err(Rejection::ProtocolViolation(Violation::InvalidDigestLength(20)))
        );
    }

    #[test]
    fn test_empty_content_update_is_rejected() {
        let network = Network::bitcoin();
        let owner = KeyPair::generate();
        let mut p = parser(&network);

        let payloads = encode_content_update(&ContentHashes::new());
        assert_eq!(
            feed(&mut p, &protocol_tx(&network, &owner, None, &payloads[0]), 0),
            Err(Rejection::ProtocolViolation(Violation::EmptyContentUpdate))
        );
    }

    #[test]
    fn test_unknown_flags_rejected() {
        let network = Network::bitcoin();
        let owner = KeyPair::generate();
        let mut p = parser(&network);

        let mut payload = content(HashAlgorithm::Sha2_256, 1);
        payload.flags = Some(0x81);
        assert_eq!(
            feed(&mut p, &protocol_tx(&network, &owner, None, &payload), 0),
            Err(Rejection::ProtocolViolation(Violation::UnknownFlags(0x81)))
        );
    }

    #[test]
    fn test_untagged_and_dataless_transactions() {
        let network = Network::bitcoin();
        let owner = KeyPair::generate();
        let mut p = parser(&network);

        let mut untagged = protocol_tx(&network, &owner, None, &content(HashAlgorithm::Sha2_256, 1));
        untagged.outputs[0].script_pubkey = Script::p2pkh(&[0u8; 20]);
        assert_eq!(
            feed(&mut p, &untagged, 0),
            Err(Rejection::ProtocolViolation(Violation::NotTagged))
        );

        let mut dataless = protocol_tx(&network, &owner, None, &content(HashAlgorithm::Sha2_256, 1));
        dataless.outputs.truncate(1);
        assert_eq!(
            feed(&mut p, &dataless, 0),
            Err(Rejection::ProtocolViolation(Violation::MissingDataOutput))
        );

        let mut garbage = protocol_tx(&network, &owner, None, &content(HashAlgorithm::Sha2_256, 1));
        garbage.outputs[1].script_pubkey = Script::data_out(&[0xff, 0xff]);
        assert!(matches!(
            feed(&mut p, &garbage, 0),
            Err(Rejection::MalformedPayload(_))
        ));

        let mut unsigned = protocol_tx(&network, &owner, None, &content(HashAlgorithm::Sha2_256, 1));
        unsigned.inputs[0].script_sig = Script::new();
        assert_eq!(
            feed(&mut p, &unsigned, 0),
            Err(Rejection::ProtocolViolation(Violation::NotSingleKeySpend))
        );
        assert!(p.finish().is_empty());
    }

    #[test]
    fn test_ownership_transfer_closes_transition() {
        let network = Network::bitcoin();
        let owner = KeyPair::generate();
        let next = KeyPair::generate();
        let mut p = parser(&network);

        let first = protocol_tx(&network, &owner, None, &content(HashAlgorithm::Sha2_256, 1));
        feed(&mut p, &first, 0).unwrap();
        let transfer = protocol_tx(
            &network,
            &owner,
            Some(&next),
            &payload::encode_ownership_transfer(),
        );
        feed(&mut p, &transfer, 10).unwrap();
        assert_eq!(p.owner(), Some(&next.pubkey_hash()));

        // The old owner can no longer amend
        let stale = protocol_tx(&network, &owner, None, &encode_uri_add("ftp://old"));
        assert!(matches!(
            feed(&mut p, &stale, 20),
            Err(Rejection::ProtocolViolation(Violation::WrongSigner { .. }))
        ));

        // The new owner publishes a new version
        let second = protocol_tx(&network, &next, None, &content(HashAlgorithm::Sha3_256, 2));
        feed(&mut p, &second, 30).unwrap();

        let history = p.finish();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].txids, vec![first.txid(), transfer.txid()]);
        assert_eq!(
            history[0].next_owner.as_deref(),
            Some(network.pkh_address(&next.pubkey_hash()).as_str())
        );
        assert_eq!(history[0].effective_owner(), history[1].state.owner);
        assert_eq!(history[1].state.time, at(30));
    }

    #[test]
    fn test_transfer_requires_cosigner() {
        let network = Network::bitcoin();
        let owner = KeyPair::generate();
        let mut p = parser(&network);

        feed(
            &mut p,
            &protocol_tx(&network, &owner, None, &content(HashAlgorithm::Sha2_256, 1)),
            0,
        )
        .unwrap();
        let transfer = protocol_tx(&network, &owner, None, &payload::encode_ownership_transfer());
        assert_eq!(
            feed(&mut p, &transfer, 10),
            Err(Rejection::ProtocolViolation(Violation::MissingCosigner))
        );
    }

    #[test]
    fn test_fed_order_decides_history_order() {
        let network = Network::bitcoin();
        let owner = KeyPair::generate();

        let a = protocol_tx(&network, &owner, None, &content(HashAlgorithm::Sha2_256, 1));
        let b = protocol_tx(&network, &owner, None, &content(HashAlgorithm::Sha3_256, 2));

        let mut p = parser(&network);
        feed(&mut p, &a, 0).unwrap();
        feed(&mut p, &b, 0).unwrap();
        let ab: Vec<_> = p.finish().into_iter().map(|t| t.txids).collect();

        let mut p = parser(&network);
        feed(&mut p, &b, 0).unwrap();
        feed(&mut p, &a, 0).unwrap();
        let ba: Vec<_> = p.finish().into_iter().map(|t| t.txids).collect();

        assert_eq!(ab, vec![vec![a.txid()], vec![b.txid()]]);
        assert_eq!(ba, vec![vec![b.txid()], vec![a.txid()]]);
    }

    #[test]
    fn test_finish_resets_state() {
        let network = Network::bitcoin();
        let owner = KeyPair::generate();
        let other = KeyPair::generate();
        let mut p = parser(&network);

        feed(
            &mut p,
            &protocol_tx(&network, &owner, None, &content(HashAlgorithm::Sha2_256, 1)),
            0,
        )
        .unwrap();
        assert_eq!(p.finish().len(), 1);

        // A fresh replay accepts a different initial owner
        feed(
            &mut p,
            &protocol_tx(&network, &other, None, &content(HashAlgorithm::Sha2_256, 5)),
            0,
        )
        .unwrap();
        assert_eq!(
            p.finish()[0].state.owner,
            network.pkh_address(&other.pubkey_hash())
        );
    }
}
