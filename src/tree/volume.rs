//! Per-Volume Layer Data
//!
//! Sizes, device identity and backing reference of one volume inside one
//! layer node.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};
use crate::kinds::DeviceProviderKind;

/// Volume number within a resource
pub type VolumeNumber = u32;

/// Usable size reported by layers that are not locally backed
pub const UNBOUNDED_KIB: u64 = u64::MAX;

// =============================================================================
// Size
// =============================================================================

/// A size in KiB that may not have been computed yet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Size {
    /// Not yet computed. Never equivalent to zero.
    #[default]
    Uninitialized,
    Kib(u64),
}

impl Size {
    pub fn is_initialized(&self) -> bool {
        matches!(self, Size::Kib(_))
    }

    pub fn is_unbounded(&self) -> bool {
        matches!(self, Size::Kib(UNBOUNDED_KIB))
    }

    /// The value, if computed
    pub fn kib(&self) -> Option<u64> {
        match self {
            Size::Kib(kib) => Some(*kib),
            Size::Uninitialized => None,
        }
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Size::Uninitialized => write!(f, "uninitialized"),
            Size::Kib(UNBOUNDED_KIB) => write!(f, "unbounded"),
            Size::Kib(kib) => write!(f, "{} KiB", kib),
        }
    }
}

/// Classification of the last observed usable size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SizeState {
    #[default]
    AsExpected,
    TooSmall,
    TooLarge,
}

// =============================================================================
// Backing Reference
// =============================================================================

/// Storage pool a volume draws its capacity from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackingRef {
    pub pool: String,
    pub provider: DeviceProviderKind,
    /// Provider-side backing name (volume group, thin pool, zpool)
    pub backing_name: String,
    pub granularity_kib: u64,
}

// =============================================================================
// Volume Layer Data
// =============================================================================

/// Data of one volume inside one layer node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeLayerData {
    volume_number: VolumeNumber,
    usable_size: Size,
    allocated_size: Size,
    device_path: Option<String>,
    exists: bool,
    failed: bool,
    size_state: SizeState,
    backing: Option<BackingRef>,
}

impl VolumeLayerData {
    pub fn new(volume_number: VolumeNumber, backing: Option<BackingRef>) -> Self {
        Self {
            volume_number,
            usable_size: Size::Uninitialized,
            allocated_size: Size::Uninitialized,
            device_path: None,
            exists: false,
            failed: false,
            size_state: SizeState::AsExpected,
            backing,
        }
    }

    pub fn volume_number(&self) -> VolumeNumber {
        self.volume_number
    }

    pub fn usable_size(&self) -> Size {
        self.usable_size
    }

    pub fn allocated_size(&self) -> Size {
        self.allocated_size
    }

    pub fn device_path(&self) -> Option<&str> {
        self.device_path.as_deref()
    }

    pub fn exists(&self) -> bool {
        self.exists
    }

    pub fn failed(&self) -> bool {
        self.failed
    }

    pub fn size_state(&self) -> SizeState {
        self.size_state
    }

    pub fn backing(&self) -> Option<&BackingRef> {
        self.backing.as_ref()
    }

    pub fn storage_pool(&self) -> Option<&str> {
        self.backing.as_ref().map(|b| b.pool.as_str())
    }

    /// Usable size, failing if it was never computed
    pub fn require_usable(&self, owner: &str) -> Result<u64> {
        self.usable_size.kib().ok_or_else(|| Error::UninitializedSize {
            node: owner.to_string(),
            volume: self.volume_number,
            field: "usable",
        })
    }

    /// Allocated size, failing if it was never computed
    pub fn require_allocated(&self, owner: &str) -> Result<u64> {
        self.allocated_size.kib().ok_or_else(|| Error::UninitializedSize {
            node: owner.to_string(),
            volume: self.volume_number,
            field: "allocated",
        })
    }

    pub(crate) fn set_usable_size(&mut self, kib: u64) {
        self.usable_size = Size::Kib(kib);
    }

    pub(crate) fn set_allocated_size(&mut self, kib: u64) {
        self.allocated_size = Size::Kib(kib);
    }

    /// Record a usable size read back from a realized device.
    ///
    /// The size state is reclassified against the previously recorded value.
    pub(crate) fn observe_usable_size(&mut self, kib: u64) {
        self.size_state = match self.usable_size {
            Size::Kib(previous) if kib < previous => SizeState::TooSmall,
            Size::Kib(previous) if kib > previous => SizeState::TooLarge,
            _ => SizeState::AsExpected,
        };
        self.usable_size = Size::Kib(kib);
    }

    pub(crate) fn set_device(&mut self, path: Option<String>, exists: bool) {
        self.device_path = path;
        self.exists = exists;
    }

    pub(crate) fn set_failed(&mut self, failed: bool) {
        self.failed = failed;
    }

    pub(crate) fn reset_size_state(&mut self) {
        self.size_state = SizeState::AsExpected;
    }
}
