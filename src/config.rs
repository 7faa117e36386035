//! Session and server configuration.
//!
//! Every field has a default, so an empty TOML file (or none at all) is a
//! valid configuration. The CLI loads a file first and applies its flags on
//! top.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, SyncError};
use crate::sparse::BLOCK_SIZE;
use crate::streaming::protocol::MAX_FRAME_SIZE;

/// Default idle timeout for a session
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Blocks per transfer batch (32 x 4KB = 128KB)
pub const DEFAULT_BATCH_BLOCKS: u32 = 32;

/// Capacity of every bounded queue in the pipeline
pub const DEFAULT_QUEUE_CAPACITY: usize = 128;

fn default_max_in_flight() -> usize {
    num_cpus::get().clamp(2, 8)
}

/// Client-side parameters of one sync session.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    /// Idle bound: no progress for this long aborts the session
    pub timeout_secs: u64,
    pub batch_blocks: u32,
    pub queue_capacity: usize,
    /// Batches read and hashed concurrently
    pub max_in_flight: usize,
    /// Ask the server for destination chunk digests and skip identical batches
    pub checksums: bool,
    /// Compare whole-file layout digests after the transfer
    pub verify: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            batch_blocks: DEFAULT_BATCH_BLOCKS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_in_flight: default_max_in_flight(),
            checksums: true,
            verify: false,
        }
    }
}

impl SessionConfig {
    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Batch size in bytes
    pub fn batch_size(&self) -> u64 {
        u64::from(self.batch_blocks) * BLOCK_SIZE
    }

    pub fn validate(&self) -> Result<()> {
        if self.timeout_secs == 0 {
            return Err(SyncError::Config("timeout_secs must be positive".into()));
        }
        if self.batch_blocks == 0 {
            return Err(SyncError::Config("batch_blocks must be positive".into()));
        }
        // Data frame = offset(8) + payload
        if self.batch_size() + 8 > u64::from(MAX_FRAME_SIZE) {
            return Err(SyncError::Config(format!(
                "batch of {} blocks exceeds the maximum frame size",
                self.batch_blocks
            )));
        }
        if self.queue_capacity == 0 || self.max_in_flight == 0 {
            return Err(SyncError::Config(
                "queue_capacity and max_in_flight must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Receiving-side parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub timeout_secs: u64,
    /// When set, destination paths are resolved under this directory
    pub root: Option<PathBuf>,
    pub queue_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            root: None,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl ServerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.timeout_secs == 0 {
            return Err(SyncError::Config("timeout_secs must be positive".into()));
        }
        if self.queue_capacity == 0 {
            return Err(SyncError::Config("queue_capacity must be positive".into()));
        }
        Ok(())
    }
}

/// Contents of a `ssync.toml` file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub session: SessionConfig,
    pub server: ServerConfig,
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Config = toml::from_str(s).map_err(|e| SyncError::Config(e.to_string()))?;
        config.session.validate()?;
        config.server.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| SyncError::io(format!("Failed to read {}", path.display()), e))?;
        Self::from_toml_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config.session.timeout_secs, DEFAULT_TIMEOUT_SECS);
        assert_eq!(config.session.batch_size(), 32 * 4096);
        assert_eq!(config.session.queue_capacity, 128);
        assert!(config.session.checksums);
        assert!(!config.session.verify);
        assert!(config.server.root.is_none());
    }

    #[test]
    fn test_partial_config() {
        let config = Config::from_toml_str(
            r#"
            [session]
            timeout_secs = 30
            verify = true

            [server]
            root = "/srv/images"
            "#,
        )
        .unwrap();
        assert_eq!(config.session.timeout(), Duration::from_secs(30));
        assert!(config.session.verify);
        assert_eq!(config.server.root, Some(PathBuf::from("/srv/images")));
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(Config::from_toml_str("[session]\nbatch_blocks = 0").is_err());
        assert!(Config::from_toml_str("[session]\nbatch_blocks = 100000").is_err());
        assert!(Config::from_toml_str("[server]\ntimeout_secs = 0").is_err());
        assert!(Config::from_toml_str("[session]\nunknown = 1").is_err());
    }
}
