//! Layer Nodes
//!
//! One node per `{layer kind, name suffix}` in a resource's stack. Common
//! fields live on the node; technology-specific parameters live in the
//! [`LayerPayload`] variant.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::kinds::DeviceLayerKind;
use crate::tree::spec::{CacheSize, DrbdPeer, NvmeRole, NvmeTransport};
use crate::tree::volume::{VolumeLayerData, VolumeNumber};

// =============================================================================
// Identity
// =============================================================================

/// Numeric layer node identity, stable across persistence
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LayerNodeId(pub u32);

impl fmt::Display for LayerNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The resource or snapshot a tree belongs to
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    pub resource: String,
    pub snapshot: Option<String>,
}

impl ResourceRef {
    pub fn resource(name: impl Into<String>) -> Self {
        Self {
            resource: name.into(),
            snapshot: None,
        }
    }

    pub fn snapshot(name: impl Into<String>, snapshot: impl Into<String>) -> Self {
        Self {
            resource: name.into(),
            snapshot: Some(snapshot.into()),
        }
    }

    pub fn is_snapshot(&self) -> bool {
        self.snapshot.is_some()
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.snapshot {
            Some(snap) => write!(f, "{}@{}", self.resource, snap),
            None => write!(f, "{}", self.resource),
        }
    }
}

// =============================================================================
// Kind-Specific Payloads
// =============================================================================

/// Resolved replication parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrbdParams {
    pub peer_slots: u16,
    pub al_stripes: u32,
    pub al_stripe_size_kib: u64,
    pub diskless: bool,
    pub skip_disk: bool,
    pub node_id: u16,
    pub port: Option<u16>,
    pub peers: Vec<DrbdPeer>,
    pub minors: BTreeMap<VolumeNumber, u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LuksParams {
    pub key_ref: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NvmeParams {
    pub role: NvmeRole,
    pub transport: NvmeTransport,
    pub address: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WritecacheParams {
    pub cache_size: CacheSize,
    pub block_size_bytes: u32,
    pub pmem: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheParams {
    pub cache_size: CacheSize,
    pub meta_size_kib: u64,
    pub block_size_kib: u64,
    pub feature: String,
    pub policy: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BCacheParams {
    pub cache_size: CacheSize,
}

/// Kind-specific data of a layer node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum LayerPayload {
    Drbd(DrbdParams),
    Luks(LuksParams),
    Nvme(NvmeParams),
    Writecache(WritecacheParams),
    Cache(CacheParams),
    #[serde(rename = "bcache")]
    BCache(BCacheParams),
    Storage,
}

impl LayerPayload {
    pub fn kind(&self) -> DeviceLayerKind {
        match self {
            LayerPayload::Drbd(_) => DeviceLayerKind::Drbd,
            LayerPayload::Luks(_) => DeviceLayerKind::Luks,
            LayerPayload::Nvme(_) => DeviceLayerKind::Nvme,
            LayerPayload::Writecache(_) => DeviceLayerKind::Writecache,
            LayerPayload::Cache(_) => DeviceLayerKind::Cache,
            LayerPayload::BCache(_) => DeviceLayerKind::BCache,
            LayerPayload::Storage => DeviceLayerKind::Storage,
        }
    }
}

// =============================================================================
// Layer Node
// =============================================================================

/// One layer of a resource's stack
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerNode {
    pub(crate) id: LayerNodeId,
    pub(crate) resource: ResourceRef,
    /// Suffix relative to the parent; the data child uses the empty suffix
    pub(crate) rel_suffix: String,
    /// Concatenated suffixes from the root
    pub(crate) full_suffix: String,
    pub(crate) parent: Option<LayerNodeId>,
    pub(crate) children: IndexMap<String, LayerNodeId>,
    pub(crate) volumes: BTreeMap<VolumeNumber, VolumeLayerData>,
    pub(crate) payload: LayerPayload,
    pub(crate) suspended: bool,
}

impl LayerNode {
    pub fn id(&self) -> LayerNodeId {
        self.id
    }

    pub fn kind(&self) -> DeviceLayerKind {
        self.payload.kind()
    }

    pub fn resource(&self) -> &ResourceRef {
        &self.resource
    }

    pub fn rel_suffix(&self) -> &str {
        &self.rel_suffix
    }

    pub fn suffix(&self) -> &str {
        &self.full_suffix
    }

    /// Resource name with the node's suffix, e.g. `r0.meta`
    pub fn suffixed_name(&self) -> String {
        format!("{}{}", self.resource.resource, self.full_suffix)
    }

    pub fn parent(&self) -> Option<LayerNodeId> {
        self.parent
    }

    pub fn children(&self) -> impl Iterator<Item = (&str, LayerNodeId)> + '_ {
        self.children.iter().map(|(s, id)| (s.as_str(), *id))
    }

    pub fn payload(&self) -> &LayerPayload {
        &self.payload
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    pub(crate) fn set_suspended(&mut self, suspended: bool) {
        self.suspended = suspended;
    }

    pub fn volume(&self, number: VolumeNumber) -> Option<&VolumeLayerData> {
        self.volumes.get(&number)
    }

    pub(crate) fn volume_mut(&mut self, number: VolumeNumber) -> Option<&mut VolumeLayerData> {
        self.volumes.get_mut(&number)
    }

    pub fn volumes(&self) -> impl Iterator<Item = &VolumeLayerData> {
        self.volumes.values()
    }

    pub(crate) fn volumes_mut(&mut self) -> impl Iterator<Item = &mut VolumeLayerData> {
        self.volumes.values_mut()
    }

    pub fn volume_numbers(&self) -> Vec<VolumeNumber> {
        self.volumes.keys().copied().collect()
    }

    pub fn drbd(&self) -> Option<&DrbdParams> {
        match &self.payload {
            LayerPayload::Drbd(params) => Some(params),
            _ => None,
        }
    }
}

impl fmt::Display for LayerNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.resource.snapshot {
            Some(snap) => write!(f, "{}@{} [{}]", self.suffixed_name(), snap, self.kind().tag()),
            None => write!(f, "{} [{}]", self.suffixed_name(), self.kind().tag()),
        }
    }
}
