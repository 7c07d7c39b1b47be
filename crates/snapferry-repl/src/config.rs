//! Replication configuration, loadable from TOML or JSON.

use crate::bridge::{BridgeConfig, DEFAULT_CHUNK_SIZE, DEFAULT_EXIT_TIMEOUT};
use crate::engine::SyncOptions;
use crate::executor::ExecutorConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Settings shared by every run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Snapshot class to replicate (the part of the name before `_`).
    pub class: String,
    /// ssh private key for remote targets.
    pub identity_file: Option<PathBuf>,
    /// Storage command, e.g. `zfs` or `sudo zfs`.
    pub zfs_command: String,
    /// Remote shell binary.
    pub ssh_command: String,
    /// Extra ssh options.
    pub ssh_options: Vec<String>,
    /// Bytes per read/write round trip while streaming.
    pub chunk_size: usize,
    /// Seconds to wait for send/receive to exit after the stream ends.
    pub exit_timeout_secs: u64,
    /// Retention horizon for pruning, in days.
    pub horizon_days: u32,
    /// Pass `-F` to `zfs receive`.
    pub receive_force: bool,
    /// Continue with an incremental transfer right after a bootstrap.
    pub continue_after_bootstrap: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        let executor = ExecutorConfig::default();
        Self {
            class: String::from("zfs-auto-snap"),
            identity_file: None,
            zfs_command: executor.zfs_command,
            ssh_command: executor.ssh_command,
            ssh_options: executor.ssh_options,
            chunk_size: DEFAULT_CHUNK_SIZE,
            exit_timeout_secs: DEFAULT_EXIT_TIMEOUT.as_secs(),
            horizon_days: 30,
            receive_force: false,
            continue_after_bootstrap: true,
        }
    }
}

impl SyncConfig {
    /// Load a config file; the format is chosen by extension (`.toml` or `.json`).
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: SyncConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that cannot produce a working run.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.class.is_empty() || self.class.contains(['_', '@']) {
            anyhow::bail!("class {:?} must be non-empty and contain no '_' or '@'", self.class);
        }
        if self.chunk_size == 0 {
            anyhow::bail!("chunk_size must be greater than zero");
        }
        if self.exit_timeout_secs == 0 {
            anyhow::bail!("exit_timeout_secs must be greater than zero");
        }
        if self.zfs_command.trim().is_empty() {
            anyhow::bail!("zfs_command must not be empty");
        }
        Ok(())
    }

    /// Command construction settings for executors.
    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            zfs_command: self.zfs_command.clone(),
            ssh_command: self.ssh_command.clone(),
            ssh_options: self.ssh_options.clone(),
            receive_force: self.receive_force,
        }
    }

    /// Stream bridge settings.
    pub fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            chunk_size: self.chunk_size,
            exit_timeout: Duration::from_secs(self.exit_timeout_secs),
        }
    }

    /// Run options with this config's defaults.
    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            horizon_days: self.horizon_days,
            continue_after_bootstrap: self.continue_after_bootstrap,
            ..SyncOptions::default()
        }
    }
}
