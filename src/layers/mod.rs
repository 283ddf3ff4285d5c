//! Device Layers
//!
//! One implementation per layer kind realizes that kind's nodes on this
//! node. The driver hands every layer the flattened set of its nodes across
//! a batch in `prepare`, then calls `process` once per node in the order the
//! layer asks for.

pub mod bcache;
pub mod cache;
pub mod dmsetup;
pub mod drbd;
pub mod factory;
pub mod luks;
pub mod nvme;
pub mod storage;
pub mod writecache;

pub use factory::LayerRegistry;

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::SatelliteConfig;
use crate::domain::{KeyProviderRef, StoragePoolRegistry};
use crate::error::{Error, Result};
use crate::exec::CommandRunnerRef;
use crate::kinds::DeviceLayerKind;
use crate::observer::ObserverBridge;
use crate::tree::layer_tree::LayerTree;
use crate::tree::node::{LayerNode, LayerNodeId};
use crate::tree::volume::VolumeNumber;

// =============================================================================
// Processing Protocol
// =============================================================================

/// Outcome of processing one layer node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerProcessResult {
    /// The layer realized (or removed) its devices
    Success,
    /// Valid no-op: the layer had nothing to provide for this node
    NoDevicesProvided,
}

/// Whether a node is processed before or after its children
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOrder {
    /// Children first: the backing devices must exist before attaching
    ChildrenFirst,
    /// The node first: tear down from the top
    SelfFirst,
}

/// Implementation of one layer kind
#[async_trait]
pub trait DeviceLayer: Send + Sync {
    fn kind(&self) -> DeviceLayerKind;

    /// Query the existing devices of all given nodes at once.
    ///
    /// Only the layer's transient cache is populated; nodes are not mutated.
    async fn prepare(&self, nodes: &[&LayerNode]) -> Result<()>;

    /// Create, adjust or remove the devices of one node
    async fn process(&self, tree: &mut LayerTree, node: LayerNodeId) -> Result<LayerProcessResult>;

    /// Drop the state cached by `prepare`
    fn clear_cache(&self);

    fn process_order(&self, deleting: bool) -> ProcessOrder {
        if deleting {
            ProcessOrder::SelfFirst
        } else {
            ProcessOrder::ChildrenFirst
        }
    }

    fn supports_suspend_io(&self) -> bool {
        self.kind().capabilities().suspend_io
    }

    async fn suspend_io(&self, tree: &LayerTree, node: LayerNodeId) -> Result<()> {
        Err(suspend_unsupported(self.kind(), tree, node))
    }

    async fn resume_io(&self, tree: &LayerTree, node: LayerNodeId) -> Result<()> {
        Err(suspend_unsupported(self.kind(), tree, node))
    }
}

pub type DeviceLayerRef = Arc<dyn DeviceLayer>;

fn suspend_unsupported(kind: DeviceLayerKind, tree: &LayerTree, node: LayerNodeId) -> Error {
    Error::InvalidLayerParameter {
        layer: kind.tag().to_string(),
        reason: format!(
            "suspending I/O is not supported (resource {}, node {})",
            tree.resource(),
            node
        ),
    }
}

// =============================================================================
// Shared Services
// =============================================================================

/// Collaborators every layer implementation may use
#[derive(Clone)]
pub struct LayerServices {
    pub config: Arc<SatelliteConfig>,
    pub runner: CommandRunnerRef,
    pub pools: Arc<StoragePoolRegistry>,
    pub keys: KeyProviderRef,
    pub observer: Arc<ObserverBridge>,
    /// Log writes to sysfs and configfs instead of performing them
    pub dry_run: bool,
}

impl std::fmt::Debug for LayerServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayerServices")
            .field("node_name", &self.config.node_name)
            .field("dry_run", &self.dry_run)
            .finish()
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Name of the device of one volume, e.g. `r0.meta_00000`
pub(crate) fn volume_identifier(node: &LayerNode, vlm: VolumeNumber) -> String {
    format!("{}_{:05}", node.suffixed_name(), vlm)
}

/// Device path a child provided for a volume
pub(crate) fn child_device(
    tree: &LayerTree,
    parent: LayerNodeId,
    rel_suffix: &str,
    vlm: VolumeNumber,
) -> Result<String> {
    let parent_node = tree.node(parent)?;
    let child = tree.child_by_suffix(parent, rel_suffix).ok_or_else(|| {
        Error::InvalidLayerParameter {
            layer: parent_node.kind().tag().to_string(),
            reason: format!(
                "{} has no child with suffix '{}'",
                parent_node, rel_suffix
            ),
        }
    })?;
    tree.device_path(child, vlm).ok_or_else(|| Error::Storage {
        layer: parent_node.kind().tag().to_string(),
        reason: format!(
            "{} volume {} has no backing device below it",
            parent_node, vlm
        ),
    })
}

/// Write a kernel control file (sysfs, configfs)
pub(crate) async fn write_control(dry_run: bool, path: &Path, value: &str) -> Result<()> {
    if dry_run {
        info!(path = %path.display(), value, "[dry-run] control file write");
        return Ok(());
    }
    debug!(path = %path.display(), value, "Writing control file");
    tokio::fs::write(path, value).await.map_err(|e| Error::Storage {
        layer: "kernel".to_string(),
        reason: format!("cannot write '{}' to {}: {}", value, path.display(), e),
    })
}

/// Snapshots are realized by the storage layer alone
pub(crate) fn is_snapshot(tree: &LayerTree) -> bool {
    tree.resource().is_snapshot()
}
