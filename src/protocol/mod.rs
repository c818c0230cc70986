//! Anchoring protocol
//!
//! This module contains the document-level protocol:
//! - History model (hash sets, states, transitions)
//! - Payload codec for the data output
//! - Replay parser that turns tagged transactions into history

pub mod model;
pub mod parser;
pub mod payload;

pub use model::{ContentHashes, HashAlgorithm, HashError, HashFamily, State, Transition};
pub use parser::{Parser, Rejection, Violation};
pub use payload::{
    decode, encode_content_update, encode_content_update_with_budget, encode_ownership_transfer,
    encode_uri_add, Payload, PayloadError, PayloadFlags, HASH_FIELD_OVERHEAD,
    MAX_DATA_OUTPUT_SIZE, MAX_PAYLOAD_SIZE,
};
