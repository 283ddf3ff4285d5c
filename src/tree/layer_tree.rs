//! Layer Tree
//!
//! Arena of layer nodes for one resource or snapshot. The parent owns its
//! children; child-to-parent links are plain ids.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::kinds::DeviceLayerKind;
use crate::tree::node::{LayerNode, LayerNodeId, LayerPayload, ResourceRef};
use crate::tree::volume::{Size, VolumeLayerData, VolumeNumber};

/// The layer tree of one resource or snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerTree {
    resource: ResourceRef,
    nodes: BTreeMap<LayerNodeId, LayerNode>,
    root: LayerNodeId,
    next_id: u32,
    deleting: bool,
    suspend_requested: bool,
}

impl LayerTree {
    /// Create a tree consisting of a root node only
    pub fn new(
        resource: ResourceRef,
        root_payload: LayerPayload,
        volumes: Vec<VolumeLayerData>,
    ) -> Self {
        let root = LayerNodeId(0);
        let node = LayerNode {
            id: root,
            resource: resource.clone(),
            rel_suffix: String::new(),
            full_suffix: String::new(),
            parent: None,
            children: Default::default(),
            volumes: volumes.into_iter().map(|v| (v.volume_number(), v)).collect(),
            payload: root_payload,
            suspended: false,
        };
        let mut nodes = BTreeMap::new();
        nodes.insert(root, node);
        Self {
            resource,
            nodes,
            root,
            next_id: 1,
            deleting: false,
            suspend_requested: false,
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn resource(&self) -> &ResourceRef {
        &self.resource
    }

    pub fn root(&self) -> LayerNodeId {
        self.root
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_deleting(&self) -> bool {
        self.deleting
    }

    pub fn set_deleting(&mut self, deleting: bool) {
        self.deleting = deleting;
    }

    pub fn suspend_requested(&self) -> bool {
        self.suspend_requested
    }

    pub fn set_suspend_requested(&mut self, requested: bool) {
        self.suspend_requested = requested;
    }

    pub(crate) fn next_id(&self) -> u32 {
        self.next_id
    }

    pub fn get(&self, id: LayerNodeId) -> Option<&LayerNode> {
        self.nodes.get(&id)
    }

    pub fn node(&self, id: LayerNodeId) -> Result<&LayerNode> {
        self.nodes
            .get(&id)
            .ok_or(Error::LayerNodeNotFound { node_id: id.0 })
    }

    pub(crate) fn node_mut(&mut self, id: LayerNodeId) -> Result<&mut LayerNode> {
        self.nodes
            .get_mut(&id)
            .ok_or(Error::LayerNodeNotFound { node_id: id.0 })
    }

    pub fn volume(&self, id: LayerNodeId, number: VolumeNumber) -> Result<&VolumeLayerData> {
        self.node(id)?
            .volume(number)
            .ok_or(Error::VolumeNotFound {
                node_id: id.0,
                volume: number,
            })
    }

    pub(crate) fn volume_mut(
        &mut self,
        id: LayerNodeId,
        number: VolumeNumber,
    ) -> Result<&mut VolumeLayerData> {
        self.node_mut(id)?
            .volume_mut(number)
            .ok_or(Error::VolumeNotFound {
                node_id: id.0,
                volume: number,
            })
    }

    /// Volume numbers of the root node
    pub fn volume_numbers(&self) -> Vec<VolumeNumber> {
        self.get(self.root)
            .map(|n| n.volume_numbers())
            .unwrap_or_default()
    }

    // =========================================================================
    // Structure
    // =========================================================================

    /// The data child (empty relative suffix)
    pub fn data_child(&self, id: LayerNodeId) -> Option<LayerNodeId> {
        self.child_by_suffix(id, crate::kinds::SUFFIX_DATA)
    }

    pub fn child_by_suffix(&self, id: LayerNodeId, rel_suffix: &str) -> Option<LayerNodeId> {
        self.nodes
            .get(&id)
            .and_then(|n| n.children.get(rel_suffix).copied())
    }

    pub fn children(&self, id: LayerNodeId) -> Vec<LayerNodeId> {
        self.nodes
            .get(&id)
            .map(|n| n.children.values().copied().collect())
            .unwrap_or_default()
    }

    /// Depth-first pre-order enumeration starting at `from`
    pub fn dfs(&self, from: LayerNodeId) -> Vec<LayerNodeId> {
        let mut order = Vec::new();
        let mut stack = vec![from];
        while let Some(id) = stack.pop() {
            if let Some(node) = self.nodes.get(&id) {
                order.push(id);
                // reversed so that the data child is visited first
                stack.extend(node.children.values().rev().copied());
            }
        }
        order
    }

    /// All nodes of a kind, depth-first from the root
    pub fn iter_kind(&self, kind: DeviceLayerKind) -> Vec<LayerNodeId> {
        self.dfs(self.root)
            .into_iter()
            .filter(|id| self.nodes[id].kind() == kind)
            .collect()
    }

    /// Whether a node of `kind` exists at or below `from`
    pub fn uses_kind_below(&self, from: LayerNodeId, kind: DeviceLayerKind) -> bool {
        self.dfs(from)
            .into_iter()
            .any(|id| self.nodes[&id].kind() == kind)
    }

    /// All volumes at or below `from`, depth-first
    pub fn volumes_under(&self, from: LayerNodeId) -> Vec<(LayerNodeId, VolumeNumber)> {
        self.dfs(from)
            .into_iter()
            .flat_map(|id| {
                self.nodes[&id]
                    .volumes
                    .keys()
                    .map(move |vlm| (id, *vlm))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Reverse lookup: volumes drawing from a storage pool
    pub fn volumes_using_pool(&self, pool: &str) -> Vec<(LayerNodeId, VolumeNumber)> {
        self.volumes_under(self.root)
            .into_iter()
            .filter(|(id, vlm)| {
                self.nodes[id]
                    .volume(*vlm)
                    .and_then(|v| v.storage_pool())
                    .map_or(false, |p| p == pool)
            })
            .collect()
    }

    // =========================================================================
    // Sizes
    // =========================================================================

    pub fn usable_size(&self, id: LayerNodeId, number: VolumeNumber) -> Result<Size> {
        Ok(self.volume(id, number)?.usable_size())
    }

    pub fn allocated_size(&self, id: LayerNodeId, number: VolumeNumber) -> Result<Size> {
        Ok(self.volume(id, number)?.allocated_size())
    }

    /// Usable size, failing on the uninitialized sentinel
    pub fn usable_kib(&self, id: LayerNodeId, number: VolumeNumber) -> Result<u64> {
        let node = self.node(id)?;
        self.volume(id, number)?.require_usable(&node.to_string())
    }

    /// Allocated size, failing on the uninitialized sentinel
    pub fn allocated_kib(&self, id: LayerNodeId, number: VolumeNumber) -> Result<u64> {
        let node = self.node(id)?;
        self.volume(id, number)?.require_allocated(&node.to_string())
    }

    pub(crate) fn set_usable(&mut self, id: LayerNodeId, number: VolumeNumber, kib: u64) -> Result<()> {
        self.volume_mut(id, number)?.set_usable_size(kib);
        Ok(())
    }

    pub(crate) fn set_allocated(
        &mut self,
        id: LayerNodeId,
        number: VolumeNumber,
        kib: u64,
    ) -> Result<()> {
        self.volume_mut(id, number)?.set_allocated_size(kib);
        Ok(())
    }

    /// Device path of a child volume, if it provided one
    pub fn device_path(&self, id: LayerNodeId, number: VolumeNumber) -> Option<String> {
        self.volume(id, number)
            .ok()
            .and_then(|v| v.device_path().map(str::to_string))
    }

    // =========================================================================
    // Raw Mutation (validated, used by the builder and by transactions)
    // =========================================================================

    pub(crate) fn insert_child(
        &mut self,
        parent: LayerNodeId,
        rel_suffix: &str,
        payload: LayerPayload,
        volumes: Vec<VolumeLayerData>,
    ) -> Result<LayerNodeId> {
        let id = LayerNodeId(self.next_id);
        self.insert_child_with_id(id, parent, rel_suffix, payload, volumes)?;
        Ok(id)
    }

    pub(crate) fn insert_child_with_id(
        &mut self,
        id: LayerNodeId,
        parent: LayerNodeId,
        rel_suffix: &str,
        payload: LayerPayload,
        volumes: Vec<VolumeLayerData>,
    ) -> Result<()> {
        if self.nodes.contains_key(&id) {
            return Err(Error::Implementation(format!(
                "layer node id {} is already in use",
                id
            )));
        }
        let parent_node = self.node(parent)?;
        if parent_node.kind().is_provider_layer() {
            return Err(Error::InvalidLayerStack(format!(
                "{} is a storage layer and cannot have children",
                parent_node
            )));
        }
        if parent_node.children.contains_key(rel_suffix) {
            return Err(Error::DuplicateSuffix {
                parent_id: parent.0,
                suffix: rel_suffix.to_string(),
            });
        }
        let full_suffix = format!("{}{}", parent_node.full_suffix, rel_suffix);
        let node = LayerNode {
            id,
            resource: self.resource.clone(),
            rel_suffix: rel_suffix.to_string(),
            full_suffix,
            parent: Some(parent),
            children: Default::default(),
            volumes: volumes.into_iter().map(|v| (v.volume_number(), v)).collect(),
            payload,
            suspended: false,
        };
        self.node_mut(parent)?
            .children
            .insert(rel_suffix.to_string(), id);
        self.nodes.insert(id, node);
        self.next_id = self.next_id.max(id.0 + 1);
        Ok(())
    }

    /// Detach and drop a subtree, returning the removed nodes
    pub(crate) fn remove_subtree(&mut self, id: LayerNodeId) -> Result<Vec<LayerNode>> {
        let parent = self.node(id)?.parent;
        let ids = self.dfs(id);
        if let Some(parent) = parent {
            let rel_suffix = self.node(id)?.rel_suffix.clone();
            self.node_mut(parent)?.children.shift_remove(&rel_suffix);
        }
        Ok(ids
            .into_iter()
            .filter_map(|node_id| self.nodes.remove(&node_id))
            .collect())
    }

    /// Move a subtree below a new parent, keeping its relative suffix
    pub(crate) fn reparent(&mut self, id: LayerNodeId, new_parent: LayerNodeId) -> Result<()> {
        if id == self.root {
            return Err(Error::InvalidLayerStack("the root node cannot be reparented".into()));
        }
        if self.dfs(id).contains(&new_parent) {
            return Err(Error::InvalidLayerStack(format!(
                "cannot move node {} below its own descendant {}",
                id, new_parent
            )));
        }
        let target = self.node(new_parent)?;
        if target.kind().is_provider_layer() {
            return Err(Error::InvalidLayerStack(format!(
                "{} is a storage layer and cannot have children",
                target
            )));
        }
        let rel_suffix = self.node(id)?.rel_suffix.clone();
        if target.children.contains_key(&rel_suffix) {
            return Err(Error::DuplicateSuffix {
                parent_id: new_parent.0,
                suffix: rel_suffix,
            });
        }

        if let Some(old_parent) = self.node(id)?.parent {
            self.node_mut(old_parent)?.children.shift_remove(&rel_suffix);
        }
        self.node_mut(new_parent)?.children.insert(rel_suffix, id);
        self.node_mut(id)?.parent = Some(new_parent);

        for node_id in self.dfs(id) {
            let parent_suffix = match self.nodes[&node_id].parent {
                Some(p) => self.nodes[&p].full_suffix.clone(),
                None => String::new(),
            };
            let node = self.node_mut(node_id)?;
            node.full_suffix = format!("{}{}", parent_suffix, node.rel_suffix);
        }
        Ok(())
    }
}
