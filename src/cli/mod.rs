//! Offline command-line tooling

pub mod commands;

pub use commands::{
    cmd_decode, cmd_digest, cmd_encode, cmd_encode_uri, cmd_keygen, cmd_tag, CliResult,
};
