//! Configuration for the token ledger

use crate::types::SourceType;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// Service name
    pub service_name: String,

    /// Service version
    pub service_version: String,

    /// RocksDB configuration
    pub rocksdb: RocksDbConfig,

    /// Accounting policy (costs, priorities, caps)
    pub policy: PolicyConfig,

    /// Background sweep configuration
    pub sweep: SweepConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/tokens"),
            service_name: "token-ledger".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            rocksdb: RocksDbConfig::default(),
            policy: PolicyConfig::default(),
            sweep: SweepConfig::default(),
        }
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RocksDbConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// Enable statistics
    pub enable_statistics: bool,
}

impl Default for RocksDbConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 64,
            max_write_buffer_number: 4,
            max_background_jobs: 4,
            enable_statistics: false,
        }
    }
}

/// Accounting policy: action pricing, pool consumption order, rollover cap
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Pool consumption order; sources not listed drain last
    pub source_priority: Vec<SourceType>,

    /// Cost per action tag; actions not listed are rejected
    pub action_costs: HashMap<String, i64>,

    /// Maximum tokens carried into a new period by a rollover
    pub rollover_cap: i64,

    /// Optimistic commit attempts before surfacing ConcurrencyExhausted
    pub max_commit_retries: u32,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        let mut action_costs = HashMap::new();
        action_costs.insert("chat_message".to_string(), 1);
        action_costs.insert("voice_message".to_string(), 3);
        action_costs.insert("image_generate".to_string(), 5);
        action_costs.insert("personality_evolve".to_string(), 10);
        action_costs.insert("character_create".to_string(), 25);

        Self {
            // Expiring grants drain before purchased tokens
            source_priority: vec![
                SourceType::Free,
                SourceType::Subscription,
                SourceType::Rollover,
                SourceType::Purchase,
                SourceType::Admin,
            ],
            action_costs,
            rollover_cap: 500,
            max_commit_retries: 8,
        }
    }
}

impl PolicyConfig {
    /// Cost of an action, or `None` for unknown actions
    pub fn cost_of(&self, action: &str) -> Option<i64> {
        self.action_costs.get(action).copied()
    }

    /// Position of a source type in the consumption order (unlisted = last)
    pub fn priority_of(&self, source: SourceType) -> usize {
        self.source_priority
            .iter()
            .position(|&s| s == source)
            .unwrap_or(self.source_priority.len())
    }
}

/// Background sweep configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepConfig {
    /// Interval between expiration sweeps (seconds)
    pub expire_interval_secs: u64,

    /// Enable the background sweep loop
    pub enabled: bool,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            expire_interval_secs: 300,
            enabled: true,
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(data_dir) = std::env::var("TOKEN_LEDGER_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(interval) = std::env::var("TOKEN_LEDGER_SWEEP_INTERVAL_SECS") {
            config.sweep.expire_interval_secs = interval
                .parse()
                .map_err(|e| crate::Error::Config(format!("Bad sweep interval: {}", e)))?;
        }

        if let Ok(cap) = std::env::var("TOKEN_LEDGER_ROLLOVER_CAP") {
            config.policy.rollover_cap = cap
                .parse()
                .map_err(|e| crate::Error::Config(format!("Bad rollover cap: {}", e)))?;
        }

        Ok(config)
    }
}
