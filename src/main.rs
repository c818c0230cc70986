//! Doc-Anchor CLI Application
//!
//! Offline tooling for tag addresses, content digests and payloads.

use clap::{Parser, Subcommand};
use doc_anchor::chain::NETWORK_NAMES;
use doc_anchor::cli;
use doc_anchor::protocol::MAX_PAYLOAD_SIZE;
use doc_anchor::AnchorConfig;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "doc-anchor")]
#[command(author = "Darshan")]
#[command(version = "0.1.0")]
#[command(about = "Anchor document fingerprints on UTXO blockchains", long_about = None)]
struct Cli {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Network preset, overriding the configuration file
    #[arg(short, long)]
    network: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the address of a document tag
    Tag {
        /// Document tag
        tag: String,
    },

    /// Print every supported digest of a file
    Digest {
        /// File to fingerprint
        file: PathBuf,
    },

    /// Print the content-update payloads for a file as hex
    Encode {
        /// File to fingerprint
        file: PathBuf,

        /// Payload size budget in bytes
        #[arg(short, long, default_value_t = MAX_PAYLOAD_SIZE)]
        budget: usize,
    },

    /// Print the payload adding a URI as hex
    EncodeUri {
        /// Locator to add
        uri: String,
    },

    /// Decode a hex payload
    Decode {
        /// Payload bytes as hex
        payload: String,
    },

    /// Generate a key and print its WIF and address
    Keygen,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => AnchorConfig::load(path)?,
        None => AnchorConfig::default(),
    };
    if let Some(name) = cli.network {
        config.network = name;
    }
    let network = config.network().map_err(|e| {
        format!("{} (known networks: {})", e, NETWORK_NAMES.join(", "))
    })?;
    log::debug!("Using network {}", network.name);

    let output = match cli.command {
        Commands::Tag { tag } => cli::cmd_tag(&network, &tag)?,
        Commands::Digest { file } => cli::cmd_digest(&file)?,
        Commands::Encode { file, budget } => cli::cmd_encode(&file, budget)?,
        Commands::EncodeUri { uri } => cli::cmd_encode_uri(&uri)?,
        Commands::Decode { payload } => cli::cmd_decode(&payload)?,
        Commands::Keygen => cli::cmd_keygen(&network)?,
    };
    println!("{}", output);

    Ok(())
}
