//! Two-Phase Tree Mutation
//!
//! Structural changes are staged in a [`TreeTransaction`] and only become
//! visible on the live tree after the store has accepted them.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::LayerDataStore;
use crate::error::{Error, Result};
use crate::tree::layer_tree::LayerTree;
use crate::tree::node::{LayerNodeId, LayerPayload};
use crate::tree::volume::VolumeLayerData;

/// A staged structural operation
#[derive(Debug, Clone)]
enum TreeOp {
    AddChild {
        id: LayerNodeId,
        parent: LayerNodeId,
        rel_suffix: String,
        payload: LayerPayload,
        volumes: Vec<VolumeLayerData>,
    },
    Remove {
        id: LayerNodeId,
    },
    Reparent {
        id: LayerNodeId,
        new_parent: LayerNodeId,
    },
}

/// Structural changes handed to the store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeChangeSet {
    pub added: Vec<LayerNodeId>,
    pub removed: Vec<LayerNodeId>,
    pub reparented: Vec<(LayerNodeId, LayerNodeId)>,
}

impl TreeChangeSet {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.reparented.is_empty()
    }
}

/// Staged mutations against one tree
#[derive(Debug, Clone)]
pub struct TreeTransaction {
    next_id: u32,
    ops: Vec<TreeOp>,
}

impl TreeTransaction {
    /// Stage a new child; the returned id is valid once committed
    pub fn add_child(
        &mut self,
        parent: LayerNodeId,
        rel_suffix: impl Into<String>,
        payload: LayerPayload,
        volumes: Vec<VolumeLayerData>,
    ) -> LayerNodeId {
        let id = LayerNodeId(self.next_id);
        self.next_id += 1;
        self.ops.push(TreeOp::AddChild {
            id,
            parent,
            rel_suffix: rel_suffix.into(),
            payload,
            volumes,
        });
        id
    }

    /// Stage removal of a node and its subtree
    pub fn remove(&mut self, id: LayerNodeId) {
        self.ops.push(TreeOp::Remove { id });
    }

    /// Stage moving a node below another parent
    pub fn reparent(&mut self, id: LayerNodeId, new_parent: LayerNodeId) {
        self.ops.push(TreeOp::Reparent { id, new_parent });
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

impl LayerTree {
    /// Start a transaction against the current state of the tree
    pub fn begin(&self) -> TreeTransaction {
        TreeTransaction {
            next_id: self.next_id(),
            ops: Vec::new(),
        }
    }

    /// Validate, persist and apply a transaction.
    ///
    /// The deletion hook runs for every volume of every removed node, then the
    /// change set is persisted. The live tree is replaced only after both
    /// succeed; on any error it is left exactly as it was.
    pub async fn commit_with(
        &mut self,
        tx: TreeTransaction,
        store: &dyn LayerDataStore,
    ) -> Result<TreeChangeSet> {
        let mut staged = self.clone();
        let mut changes = TreeChangeSet::default();
        let mut removed_nodes = Vec::new();

        for op in tx.ops {
            match op {
                TreeOp::AddChild {
                    id,
                    parent,
                    rel_suffix,
                    payload,
                    volumes,
                } => {
                    staged.insert_child_with_id(id, parent, &rel_suffix, payload, volumes)?;
                    changes.added.push(id);
                }
                TreeOp::Remove { id } => {
                    let removed = staged.remove_subtree(id)?;
                    for node in &removed {
                        // nodes added earlier in the same transaction never reached the store
                        if let Some(pos) = changes.added.iter().position(|a| *a == node.id()) {
                            changes.added.remove(pos);
                        } else {
                            changes.removed.push(node.id());
                            removed_nodes.push(node.clone());
                        }
                    }
                }
                TreeOp::Reparent { id, new_parent } => {
                    staged.reparent(id, new_parent)?;
                    changes.reparented.push((id, new_parent));
                }
            }
        }

        if changes.is_empty() {
            return Ok(changes);
        }

        for node in &removed_nodes {
            for volume in node.volumes() {
                store.delete_volume_hook(node, volume).await?;
            }
        }
        store
            .persist_tree_changes(self.resource(), &changes)
            .await
            .map_err(|e| match e {
                Error::Persistence(_) | Error::AccessDenied { .. } => e,
                other => Error::Persistence(other.to_string()),
            })?;

        debug!(
            resource = %self.resource(),
            added = changes.added.len(),
            removed = changes.removed.len(),
            reparented = changes.reparented.len(),
            "Committed layer tree changes"
        );
        *self = staged;
        Ok(changes)
    }
}
