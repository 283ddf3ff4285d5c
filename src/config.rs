//! Satellite Configuration
//!
//! Node-local settings of the stack engine: tool locations, command
//! timeouts, sizing defaults and the storage pools available on this node.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain::StoragePool;
use crate::error::{Error, Result};
use crate::tree::spec::NvmeTransport;

// =============================================================================
// Sizing Defaults
// =============================================================================

/// Defaults applied when a stack description leaves a parameter unset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SizingConfig {
    /// DRBD peer slots reserved in the metadata
    pub peer_slots: u16,
    /// DRBD activity log stripes
    pub al_stripes: u32,
    /// DRBD activity log stripe size
    pub al_stripe_size_kib: u64,
    /// LUKS2 header
    pub luks_header_kib: u64,
    /// Cache device size as a percentage of the data device
    pub cache_percent: u32,
    /// dm-cache metadata device size
    pub dm_cache_meta_kib: u64,
    /// dm-cache block size
    pub dm_cache_block_kib: u64,
    pub dm_cache_feature: String,
    pub dm_cache_policy: String,
    /// dm-writecache block size
    pub writecache_block_size_bytes: u32,
    /// bcache backing device superblock
    pub bcache_superblock_kib: u64,
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            peer_slots: 7,
            al_stripes: 1,
            al_stripe_size_kib: 32,
            luks_header_kib: 16 * 1024,
            cache_percent: 5,
            dm_cache_meta_kib: 12 * 1024,
            dm_cache_block_kib: 64,
            dm_cache_feature: "writeback".to_string(),
            dm_cache_policy: "smq".to_string(),
            writecache_block_size_bytes: 4096,
            bcache_superblock_kib: 8,
        }
    }
}

// =============================================================================
// Satellite Configuration
// =============================================================================

/// Configuration of the stack engine on one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SatelliteConfig {
    /// Name of this node
    pub node_name: String,
    /// Directory DRBD resource files are written to
    pub drbd_resource_dir: PathBuf,
    /// Address DRBD listens on for replication traffic
    pub drbd_address: String,
    /// Root of the nvmet configfs tree
    pub nvmet_root: PathBuf,
    /// Root of sysfs, used for bcache control files
    pub sysfs_root: PathBuf,
    /// Timeout of a single external command
    pub command_timeout_secs: u64,
    pub sizing: SizingConfig,
    pub nvme_transport: NvmeTransport,
    pub nvme_port: u16,
    /// Storage pools available on this node
    pub storage_pools: Vec<StoragePool>,
    pub health_addr: String,
    pub metrics_addr: String,
}

impl Default for SatelliteConfig {
    fn default() -> Self {
        Self {
            node_name: "localhost".to_string(),
            drbd_resource_dir: PathBuf::from("/var/lib/layerstack/drbd.d"),
            drbd_address: "0.0.0.0".to_string(),
            nvmet_root: PathBuf::from("/sys/kernel/config/nvmet"),
            sysfs_root: PathBuf::from("/sys"),
            command_timeout_secs: 60,
            sizing: SizingConfig::default(),
            nvme_transport: NvmeTransport::Tcp,
            nvme_port: 4420,
            storage_pools: Vec::new(),
            health_addr: "0.0.0.0:8081".to_string(),
            metrics_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

impl SatelliteConfig {
    /// Load the configuration from a YAML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SatelliteConfig = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    /// Reject settings no stack could be built with
    pub fn validate(&self) -> Result<()> {
        let sizing = &self.sizing;
        if sizing.peer_slots == 0 || sizing.peer_slots > 31 {
            return Err(Error::Configuration(format!(
                "default peer slots {} outside of [1, 31]",
                sizing.peer_slots
            )));
        }
        if sizing.cache_percent == 0 || sizing.cache_percent > 100 {
            return Err(Error::Configuration(format!(
                "default cache percentage {} outside of (0, 100]",
                sizing.cache_percent
            )));
        }
        if self.command_timeout_secs == 0 {
            return Err(Error::Configuration("command timeout must not be zero".into()));
        }
        Ok(())
    }
}
