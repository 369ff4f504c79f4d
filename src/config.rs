//! Configuration file support for a Cachet deployment.
//!
//! Loads optional `cachet.toml` from the data directory. Embedders override
//! individual fields after loading. If no config file exists, defaults are
//! used.

use serde::Deserialize;
use std::path::Path;

use crate::constants;

/// Top-level configuration.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct CachetConfig {
    pub ledger: LedgerConfig,
    pub redpacket: RedPacketConfig,
    pub codec: CodecConfig,
    pub oracle: OracleConfig,
}

/// Ledger section: withdrawal settlement bounds.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub min_withdraw: u64,
    pub max_withdraw: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        LedgerConfig {
            min_withdraw: constants::MIN_WITHDRAW,
            max_withdraw: constants::MAX_WITHDRAW,
        }
    }
}

/// Red-packet section.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RedPacketConfig {
    pub lifetime_secs: u64,
}

impl Default for RedPacketConfig {
    fn default() -> Self {
        RedPacketConfig {
            lifetime_secs: constants::RED_PACKET_LIFETIME_SECS,
        }
    }
}

/// Chunk-encryption cache section.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    pub cache_ttl_secs: u64,
    pub cache_capacity: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        CodecConfig {
            cache_ttl_secs: constants::ENCRYPT_CACHE_TTL_SECS,
            cache_capacity: constants::ENCRYPT_CACHE_CAPACITY,
        }
    }
}

/// Oracle section: how many distinct signers a settlement callback must
/// carry. Signer public keys are operator-provisioned at startup, not
/// config-file material.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct OracleConfig {
    pub signer_threshold: usize,
}

impl Default for OracleConfig {
    fn default() -> Self {
        OracleConfig {
            signer_threshold: constants::ORACLE_SIGNER_THRESHOLD,
        }
    }
}

impl CachetConfig {
    /// Load configuration from `cachet.toml` in the given directory.
    /// Returns `Default` if the file doesn't exist.
    pub fn load(data_dir: &Path) -> Self {
        let config_path = data_dir.join("cachet.toml");
        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {}", config_path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to parse {}: {}, using defaults",
                        config_path.display(),
                        e
                    );
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }
}
