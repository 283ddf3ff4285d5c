//! Layer Stack Descriptions
//!
//! The declarative description of one resource's stack as supplied by the
//! domain model: ordered layer kinds, per-kind parameters and volumes.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::Result;
use crate::kinds::DeviceLayerKind;
use crate::tree::volume::VolumeNumber;

// =============================================================================
// Stack Description
// =============================================================================

/// Declarative description of one resource (or snapshot) stack
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerStackSpec {
    /// Resource name
    pub resource: String,
    /// Snapshot name when this stack describes a snapshot
    #[serde(default)]
    pub snapshot: Option<String>,
    /// Layer kinds, outermost first
    pub layers: Vec<DeviceLayerKind>,
    /// Volumes of the resource
    pub volumes: Vec<VolumeSpec>,
    #[serde(default)]
    pub drbd: DrbdSpec,
    #[serde(default)]
    pub luks: LuksSpec,
    #[serde(default)]
    pub nvme: NvmeSpec,
    #[serde(default)]
    pub writecache: WritecacheSpec,
    #[serde(default)]
    pub cache: CacheSpec,
    #[serde(default)]
    pub bcache: BCacheSpec,
    /// The resource is flagged for deletion on this node
    #[serde(default)]
    pub delete: bool,
    /// Keep I/O suspended at the root layer after processing
    #[serde(default)]
    pub suspend_io: bool,
}

impl LayerStackSpec {
    /// Load a list of stack descriptions from a YAML file
    pub fn load_all(path: impl AsRef<Path>) -> Result<Vec<LayerStackSpec>> {
        let content = std::fs::read_to_string(path)?;
        let specs: Vec<LayerStackSpec> = serde_yaml::from_str(&content)?;
        Ok(specs)
    }
}

/// One volume of a resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeSpec {
    pub number: VolumeNumber,
    /// Size the consumer asked for
    pub size_kib: u64,
    /// Pool of the data device
    pub storage_pool: String,
    /// Pool of the DRBD external metadata device
    #[serde(default)]
    pub meta_pool: Option<String>,
    /// DRBD minor number
    #[serde(default)]
    pub minor: Option<u32>,
}

// =============================================================================
// Per-Kind Parameters
// =============================================================================

/// Replication parameters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DrbdSpec {
    #[serde(default)]
    pub peer_slots: Option<u16>,
    #[serde(default)]
    pub al_stripes: Option<u32>,
    #[serde(default)]
    pub al_stripe_size_kib: Option<u64>,
    /// No local data copy on this node
    #[serde(default)]
    pub diskless: bool,
    /// Temporarily skip the local disk
    #[serde(default)]
    pub skip_disk: bool,
    #[serde(default)]
    pub node_id: u16,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub peers: Vec<DrbdPeer>,
}

/// A replication partner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrbdPeer {
    pub name: String,
    pub node_id: u16,
    /// `ip:port`
    pub address: String,
}

/// Encryption parameters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LuksSpec {
    /// Reference resolved through the key provider
    #[serde(default)]
    pub key_ref: Option<String>,
}

/// NVMe-oF role on this node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NvmeRole {
    #[default]
    Target,
    Initiator,
}

/// NVMe-oF transport
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NvmeTransport {
    #[default]
    Tcp,
    Rdma,
}

impl std::fmt::Display for NvmeTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NvmeTransport::Tcp => write!(f, "tcp"),
            NvmeTransport::Rdma => write!(f, "rdma"),
        }
    }
}

/// NVMe-oF parameters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NvmeSpec {
    #[serde(default)]
    pub role: NvmeRole,
    #[serde(default)]
    pub transport: Option<NvmeTransport>,
    /// Target address
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
}

/// Size of a cache device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheSize {
    /// Percentage of the data device's actual size
    Percent(u32),
    /// Absolute size
    Kib(u64),
}

/// dm-writecache parameters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WritecacheSpec {
    /// Pool of the cache device; no cache child without it
    #[serde(default)]
    pub cache_pool: Option<String>,
    #[serde(default)]
    pub cache_size: Option<CacheSize>,
    #[serde(default)]
    pub block_size_bytes: Option<u32>,
    /// Cache device is persistent memory
    #[serde(default)]
    pub pmem: bool,
}

/// dm-cache parameters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSpec {
    #[serde(default)]
    pub cache_pool: Option<String>,
    /// Pool of the metadata device, defaults to the cache pool
    #[serde(default)]
    pub meta_pool: Option<String>,
    #[serde(default)]
    pub cache_size: Option<CacheSize>,
    #[serde(default)]
    pub meta_size_kib: Option<u64>,
    #[serde(default)]
    pub block_size_kib: Option<u64>,
    #[serde(default)]
    pub feature: Option<String>,
    #[serde(default)]
    pub policy: Option<String>,
}

/// bcache parameters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BCacheSpec {
    #[serde(default)]
    pub cache_pool: Option<String>,
    #[serde(default)]
    pub cache_size: Option<CacheSize>,
}
