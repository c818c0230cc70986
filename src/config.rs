//! Tool configuration
//!
//! A JSON file selecting the network preset and optionally overriding its
//! amounts:
//!
//! ```json
//! { "network": "peercoin-testnet", "fee_per_kb": 20000 }
//! ```

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufReader, BufWriter};
use std::path::Path;
use thiserror::Error;

use crate::chain::Network;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Unknown network: {0}")]
    UnknownNetwork(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnchorConfig {
    /// Network preset name
    pub network: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fee_per_kb: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_output: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag_fee: Option<u64>,
}

impl Default for AnchorConfig {
    fn default() -> Self {
        Self {
            network: "peercoin".to_string(),
            fee_per_kb: None,
            min_output: None,
            tag_fee: None,
        }
    }
}

impl AnchorConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }

    /// The selected preset with overrides applied
    pub fn network(&self) -> Result<Network, ConfigError> {
        let mut network = Network::by_name(&self.network)
            .ok_or_else(|| ConfigError::UnknownNetwork(self.network.clone()))?;
        if let Some(fee_per_kb) = self.fee_per_kb {
            network = network.with_fee_per_kb(fee_per_kb);
        }
        if let Some(min_output) = self.min_output {
            network.min_output = min_output;
        }
        if let Some(tag_fee) = self.tag_fee {
            network.tag_fee = tag_fee;
        }
        Ok(network)
    }
}
