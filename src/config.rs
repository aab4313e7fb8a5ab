//! Configuration for vellum-sync

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default storage directory
pub fn default_storage_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("vellum-sync")
}

/// Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Storage directory for the item databases
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// HTTP API port for the sync endpoint
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Default page limit when a sync request does not supply one
    #[serde(default = "default_sync_limit")]
    pub default_sync_limit: u32,

    /// Hard ceiling on the per-request page limit
    #[serde(default = "default_max_sync_limit")]
    pub max_sync_limit: u32,

    /// Byte budget for the content of a single sync response page
    #[serde(default = "default_content_transfer_budget")]
    pub content_transfer_budget: u64,

    /// Minimum seconds between revision snapshots of the same item
    #[serde(default = "default_revision_frequency")]
    pub revision_frequency_secs: u64,

    /// Tolerance window in microseconds when comparing client and server
    /// update timestamps (0 = exact match required)
    #[serde(default)]
    pub sync_conflict_tolerance_micros: i64,

    /// Page size used by the dual-store transition runner
    #[serde(default = "default_transition_page_size")]
    pub transition_page_size: u32,

    /// Delay in milliseconds between the transition copy and verify phases
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,

    /// Delay in milliseconds before overwriting a diverged item in the
    /// transition target store
    #[serde(default = "default_overwrite_settle_delay_ms")]
    pub overwrite_settle_delay_ms: u64,
}

fn default_http_port() -> u16 {
    8094
}

fn default_sync_limit() -> u32 {
    150
}

fn default_max_sync_limit() -> u32 {
    1000
}

fn default_content_transfer_budget() -> u64 {
    10 * 1024 * 1024
}

fn default_revision_frequency() -> u64 {
    300
}

fn default_transition_page_size() -> u32 {
    100
}

fn default_settle_delay_ms() -> u64 {
    1000
}

fn default_overwrite_settle_delay_ms() -> u64 {
    100
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            http_port: default_http_port(),
            default_sync_limit: default_sync_limit(),
            max_sync_limit: default_max_sync_limit(),
            content_transfer_budget: default_content_transfer_budget(),
            revision_frequency_secs: default_revision_frequency(),
            sync_conflict_tolerance_micros: 0,
            transition_page_size: default_transition_page_size(),
            settle_delay_ms: default_settle_delay_ms(),
            overwrite_settle_delay_ms: default_overwrite_settle_delay_ms(),
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), std::io::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    /// Get primary item database path
    pub fn primary_db_path(&self) -> PathBuf {
        self.storage_dir.join("items.db")
    }

    /// Get secondary item database path (transition target)
    pub fn secondary_db_path(&self) -> PathBuf {
        self.storage_dir.join("items-next.db")
    }

    /// Get config file path
    pub fn config_path(&self) -> PathBuf {
        self.storage_dir.join("config.toml")
    }

    /// Revision frequency converted to microseconds
    pub fn revision_frequency_micros(&self) -> i64 {
        self.revision_frequency_secs as i64 * 1_000_000
    }
}
