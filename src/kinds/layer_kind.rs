//! Device Layer Kinds
//!
//! The technology roles a node in a resource's stack can play.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

// =============================================================================
// Child Suffixes
// =============================================================================

/// Suffix of the data child of any fanning-out layer
pub const SUFFIX_DATA: &str = "";

/// DRBD external metadata child
pub const SUFFIX_DRBD_META: &str = ".meta";

/// dm-writecache cache device child
pub const SUFFIX_WRITECACHE_CACHE: &str = ".wcache";

/// dm-cache cache device child
pub const SUFFIX_CACHE_CACHE: &str = ".dcache";

/// dm-cache metadata device child
pub const SUFFIX_CACHE_META: &str = ".dmeta";

/// bcache cache device child
pub const SUFFIX_BCACHE_CACHE: &str = ".bcache";

// =============================================================================
// Layer Kind
// =============================================================================

/// Device layer kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceLayerKind {
    /// Replication (DRBD)
    Drbd,
    /// Encryption (LUKS / dm-crypt)
    Luks,
    /// NVMe-oF target or initiator
    Nvme,
    /// dm-writecache
    Writecache,
    /// dm-cache (read cache)
    Cache,
    /// bcache block cache
    #[serde(rename = "bcache")]
    BCache,
    /// Raw storage, delegating to a provider
    Storage,
}

/// Capability flags of a layer kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerCapabilities {
    pub resize: bool,
    pub snapshots: bool,
    pub suspend_io: bool,
    /// Suffixes of optional side children besides the data child
    pub side_children: &'static [&'static str],
    /// External tools the layer needs on the node
    pub external_tools: &'static [&'static str],
}

impl DeviceLayerKind {
    /// All layer kinds, outermost first
    pub const ALL: [DeviceLayerKind; 7] = [
        DeviceLayerKind::Drbd,
        DeviceLayerKind::Luks,
        DeviceLayerKind::Nvme,
        DeviceLayerKind::Writecache,
        DeviceLayerKind::Cache,
        DeviceLayerKind::BCache,
        DeviceLayerKind::Storage,
    ];

    /// Capability record for this kind
    pub fn capabilities(&self) -> LayerCapabilities {
        match self {
            DeviceLayerKind::Drbd => LayerCapabilities {
                resize: true,
                snapshots: true,
                suspend_io: true,
                side_children: &[SUFFIX_DRBD_META],
                external_tools: &["drbdadm", "drbdsetup", "drbdmeta"],
            },
            DeviceLayerKind::Luks => LayerCapabilities {
                resize: true,
                snapshots: true,
                suspend_io: false,
                side_children: &[],
                external_tools: &["cryptsetup", "dmsetup"],
            },
            DeviceLayerKind::Nvme => LayerCapabilities {
                resize: false,
                snapshots: false,
                suspend_io: false,
                side_children: &[],
                external_tools: &["nvme"],
            },
            DeviceLayerKind::Writecache => LayerCapabilities {
                resize: false,
                snapshots: true,
                suspend_io: true,
                side_children: &[SUFFIX_WRITECACHE_CACHE],
                external_tools: &["dmsetup"],
            },
            DeviceLayerKind::Cache => LayerCapabilities {
                resize: false,
                snapshots: true,
                suspend_io: true,
                side_children: &[SUFFIX_CACHE_CACHE, SUFFIX_CACHE_META],
                external_tools: &["dmsetup"],
            },
            DeviceLayerKind::BCache => LayerCapabilities {
                resize: false,
                snapshots: true,
                suspend_io: false,
                side_children: &[SUFFIX_BCACHE_CACHE],
                external_tools: &["make-bcache", "bcache-super-show"],
            },
            DeviceLayerKind::Storage => LayerCapabilities {
                resize: true,
                snapshots: true,
                suspend_io: false,
                side_children: &[],
                external_tools: &[],
            },
        }
    }

    /// Whether this kind may have children other than the data child
    pub fn can_fan_out(&self) -> bool {
        !self.capabilities().side_children.is_empty()
    }

    /// Whether this kind is a leaf (delegates to a provider)
    pub fn is_provider_layer(&self) -> bool {
        matches!(self, DeviceLayerKind::Storage)
    }

    /// Short upper-case tag used in log and response messages
    pub fn tag(&self) -> &'static str {
        match self {
            DeviceLayerKind::Drbd => "DRBD",
            DeviceLayerKind::Luks => "LUKS",
            DeviceLayerKind::Nvme => "NVME",
            DeviceLayerKind::Writecache => "WRITECACHE",
            DeviceLayerKind::Cache => "CACHE",
            DeviceLayerKind::BCache => "BCACHE",
            DeviceLayerKind::Storage => "STORAGE",
        }
    }
}

impl fmt::Display for DeviceLayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceLayerKind::Drbd => write!(f, "drbd"),
            DeviceLayerKind::Luks => write!(f, "luks"),
            DeviceLayerKind::Nvme => write!(f, "nvme"),
            DeviceLayerKind::Writecache => write!(f, "writecache"),
            DeviceLayerKind::Cache => write!(f, "cache"),
            DeviceLayerKind::BCache => write!(f, "bcache"),
            DeviceLayerKind::Storage => write!(f, "storage"),
        }
    }
}

impl FromStr for DeviceLayerKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DeviceLayerKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.to_string().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::InvalidLayerStack(format!("unknown layer kind '{}'", s)))
    }
}
