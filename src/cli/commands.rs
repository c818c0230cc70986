//! CLI command handlers
//!
//! Each handler returns the text to print so it can be tested directly.

use serde_json::json;
use std::path::Path;

use crate::chain::Network;
use crate::crypto::KeyPair;
use crate::protocol::{
    decode, encode_content_update_with_budget, encode_uri_add, ContentHashes, HashAlgorithm,
    MAX_DATA_OUTPUT_SIZE,
};

/// Result type for CLI operations
pub type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Tag address and tag hash
pub fn cmd_tag(network: &Network, tag: &str) -> CliResult<String> {
    Ok(format!(
        "address: {}\nhash160: {}",
        network.tag_address(tag),
        hex::encode(Network::tag_hash(tag))
    ))
}

/// Every supported digest of a file, as JSON
pub fn cmd_digest(path: &Path) -> CliResult<String> {
    let data = std::fs::read(path)?;
    let hashes = ContentHashes::digest_all(&data);
    Ok(serde_json::to_string_pretty(&hashes)?)
}

/// Content-update payloads for a file, one hex line each
pub fn cmd_encode(path: &Path, budget: usize) -> CliResult<String> {
    let data = std::fs::read(path)?;
    let hashes = ContentHashes::digest_all(&data);
    let lines: Vec<String> = encode_content_update_with_budget(&hashes, budget)
        .iter()
        .map(|p| hex::encode(p.to_bytes()))
        .collect();
    Ok(lines.join("\n"))
}

/// URI payload as hex
pub fn cmd_encode_uri(uri: &str) -> CliResult<String> {
    let bytes = encode_uri_add(uri).to_bytes();
    if bytes.len() >= MAX_DATA_OUTPUT_SIZE {
        log::warn!(
            "Payload is {} bytes, data outputs carry less than {}",
            bytes.len(),
            MAX_DATA_OUTPUT_SIZE
        );
    }
    Ok(hex::encode(bytes))
}

/// Decoded payload as JSON
pub fn cmd_decode(payload_hex: &str) -> CliResult<String> {
    let bytes = hex::decode(payload_hex.trim())?;
    let payload = decode(&bytes)?;

    let mut flags = Vec::new();
    if payload.is_content_update() {
        flags.push("content-update");
    }
    if payload.is_ownership_transfer() {
        flags.push("ownership-transfer");
    }

    let mut hashes = serde_json::Map::new();
    for (family, digest) in payload.digests() {
        let name = HashAlgorithm::from_family_len(family, digest.len())
            .map(|alg| alg.name().to_string())
            .unwrap_or_else(|| format!("{:?}-{}", family, digest.len()).to_lowercase());
        hashes.insert(name, json!(hex::encode(digest)));
    }

    let out = json!({
        "flags": flags,
        "hash": hashes,
        "uris": payload.uris(),
        "size": bytes.len(),
    });
    Ok(serde_json::to_string_pretty(&out)?)
}

/// Fresh key as WIF and address
pub fn cmd_keygen(network: &Network) -> CliResult<String> {
    let key = KeyPair::generate();
    Ok(format!(
        "wif: {}\naddress: {}",
        key.to_wif(network.private_key_version),
        network.pkh_address(&key.pubkey_hash())
    ))
}
