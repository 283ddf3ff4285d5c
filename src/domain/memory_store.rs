//! In-Memory Layer Data Store
//!
//! Keeps the last persisted state of every volume in a concurrent map. Used
//! by the binary and by tests; failure switches allow exercising the
//! persistence and authorization paths.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::domain::ports::LayerDataStore;
use crate::error::{Error, Result};
use crate::kinds::{DeviceLayerKind, DeviceProviderKind};
use crate::tree::node::{LayerNode, ResourceRef};
use crate::tree::transaction::TreeChangeSet;
use crate::tree::volume::{Size, SizeState, VolumeLayerData, VolumeNumber};

/// Key of a persisted volume: `(resource, snapshot, suffix, volume)`
pub type VolumeKey = (String, Option<String>, String, VolumeNumber);

/// Persisted state of one volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeRecord {
    pub kind: DeviceLayerKind,
    pub usable_size: Size,
    pub allocated_size: Size,
    pub device_path: Option<String>,
    pub size_state: SizeState,
    pub provider: Option<DeviceProviderKind>,
}

/// Layer data store held in memory
#[derive(Debug, Default)]
pub struct MemoryLayerStore {
    volumes: DashMap<VolumeKey, VolumeRecord>,
    tree_changes: Mutex<Vec<(ResourceRef, TreeChangeSet)>>,
    deleted_volumes: AtomicUsize,
    fail_persistence: AtomicBool,
    deny_access: AtomicBool,
}

impl MemoryLayerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail with a persistence error
    pub fn fail_persistence(&self, fail: bool) {
        self.fail_persistence.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent write fail an access check
    pub fn deny_access(&self, deny: bool) {
        self.deny_access.store(deny, Ordering::SeqCst);
    }

    pub fn volume(&self, key: &VolumeKey) -> Option<VolumeRecord> {
        self.volumes.get(key).map(|r| r.value().clone())
    }

    pub fn volume_count(&self) -> usize {
        self.volumes.len()
    }

    pub fn deleted_volume_count(&self) -> usize {
        self.deleted_volumes.load(Ordering::SeqCst)
    }

    pub fn tree_change_count(&self) -> usize {
        self.tree_changes.lock().len()
    }

    fn key(node: &LayerNode, volume: &VolumeLayerData) -> VolumeKey {
        (
            node.resource().resource.clone(),
            node.resource().snapshot.clone(),
            node.suffix().to_string(),
            volume.volume_number(),
        )
    }

    fn check_writable(&self, object: &str) -> Result<()> {
        if self.deny_access.load(Ordering::SeqCst) {
            return Err(Error::AccessDenied {
                object: object.to_string(),
                reason: "write access denied".to_string(),
            });
        }
        if self.fail_persistence.load(Ordering::SeqCst) {
            return Err(Error::Persistence(format!("failed to write {}", object)));
        }
        Ok(())
    }
}

#[async_trait]
impl LayerDataStore for MemoryLayerStore {
    async fn persist_volume(&self, node: &LayerNode, volume: &VolumeLayerData) -> Result<()> {
        self.check_writable(&node.to_string())?;
        let record = VolumeRecord {
            kind: node.kind(),
            usable_size: volume.usable_size(),
            allocated_size: volume.allocated_size(),
            device_path: volume.device_path().map(str::to_string),
            size_state: volume.size_state(),
            provider: volume.backing().map(|b| b.provider),
        };
        self.volumes.insert(Self::key(node, volume), record);
        Ok(())
    }

    async fn delete_volume_hook(&self, node: &LayerNode, volume: &VolumeLayerData) -> Result<()> {
        self.check_writable(&node.to_string())?;
        self.volumes.remove(&Self::key(node, volume));
        self.deleted_volumes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn persist_tree_changes(
        &self,
        resource: &ResourceRef,
        changes: &TreeChangeSet,
    ) -> Result<()> {
        self.check_writable(&resource.to_string())?;
        self.tree_changes
            .lock()
            .push((resource.clone(), changes.clone()));
        Ok(())
    }
}
