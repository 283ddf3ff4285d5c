//! Observer Bridge
//!
//! Keeps the latest replication state per resource and makes it visible to
//! the processing driver. Events are rebroadcast to any subscriber.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::kinds::DeviceLayerKind;
use crate::observer::events::{
    ConnectionState, DiskState, ReplicationEvent, ReplicationEventKind, ReplicationRole,
};
use crate::tree::layer_tree::LayerTree;
use crate::tree::volume::VolumeNumber;

/// Last known replication state of one resource
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResourceReplicationState {
    pub role: ReplicationRole,
    pub suspended: bool,
    pub disks: BTreeMap<VolumeNumber, DiskState>,
    pub connections: BTreeMap<String, ConnectionState>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Source of replication state for the processing driver
pub trait ReplicationObserver: Send + Sync {
    /// Feed one event into the observer
    fn publish(&self, event: ReplicationEvent);

    /// Latest state of a resource, if any event mentioned it
    fn resource_state(&self, resource: &str) -> Option<ResourceReplicationState>;

    /// Receive every event published from now on
    fn subscribe(&self) -> broadcast::Receiver<ReplicationEvent>;
}

pub type ReplicationObserverRef = Arc<dyn ReplicationObserver>;

/// In-process observer fed by the replication layer and event parsers
pub struct ObserverBridge {
    states: RwLock<HashMap<String, ResourceReplicationState>>,
    events: broadcast::Sender<ReplicationEvent>,
}

impl ObserverBridge {
    pub fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            states: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Parse and publish one `drbdsetup events2` line
    pub fn ingest_line(&self, line: &str) -> bool {
        match ReplicationEvent::parse_events2(line) {
            Some(event) => {
                self.publish(event);
                true
            }
            None => {
                trace!(line, "Ignoring events2 line");
                false
            }
        }
    }

    /// Copy suspension and failed-disk state onto the DRBD nodes of a tree
    pub fn apply_to_tree(&self, tree: &mut LayerTree) {
        if tree.resource().is_snapshot() {
            return;
        }
        let Some(state) = self.resource_state(&tree.resource().resource) else {
            return;
        };
        for id in tree.iter_kind(DeviceLayerKind::Drbd) {
            let Ok(node) = tree.node_mut(id) else {
                continue;
            };
            node.set_suspended(state.suspended);
            for vlm in node.volumes_mut() {
                let failed = state.disks.get(&vlm.volume_number()) == Some(&DiskState::Failed);
                vlm.set_failed(failed);
            }
        }
    }
}

impl Default for ObserverBridge {
    fn default() -> Self {
        Self::new(256)
    }
}

impl std::fmt::Debug for ObserverBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverBridge")
            .field("resources", &self.states.read().len())
            .finish()
    }
}

impl ReplicationObserver for ObserverBridge {
    fn publish(&self, event: ReplicationEvent) {
        debug!(event = %event, "Replication state changed");
        {
            let mut states = self.states.write();
            match &event.kind {
                ReplicationEventKind::ResourceDestroyed => {
                    states.remove(&event.resource);
                }
                kind => {
                    let state = states.entry(event.resource.clone()).or_default();
                    match kind {
                        ReplicationEventKind::ResourceChanged { role, suspended } => {
                            state.role = *role;
                            state.suspended = *suspended;
                        }
                        ReplicationEventKind::DiskStateChanged { volume, disk_state } => {
                            state.disks.insert(*volume, *disk_state);
                        }
                        ReplicationEventKind::ConnectionChanged { peer, state: conn } => {
                            state.connections.insert(peer.clone(), *conn);
                        }
                        ReplicationEventKind::ResourceDestroyed => {}
                    }
                    state.updated_at = Some(event.timestamp);
                }
            }
        }
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn resource_state(&self, resource: &str) -> Option<ResourceReplicationState> {
        self.states.read().get(resource).cloned()
    }

    fn subscribe(&self) -> broadcast::Receiver<ReplicationEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::node::{DrbdParams, LayerPayload, ResourceRef};
    use crate::tree::volume::VolumeLayerData;

    fn drbd_tree() -> LayerTree {
        LayerTree::new(
            ResourceRef::resource("r0"),
            LayerPayload::Drbd(DrbdParams {
                peer_slots: 7,
                al_stripes: 1,
                al_stripe_size_kib: 32,
                diskless: false,
                skip_disk: false,
                node_id: 0,
                port: Some(7000),
                peers: Vec::new(),
                minors: [(0, 1000), (1, 1001)].into_iter().collect(),
            }),
            vec![VolumeLayerData::new(0, None), VolumeLayerData::new(1, None)],
        )
    }

    #[tokio::test]
    async fn test_events_are_rebroadcast() {
        let bridge = ObserverBridge::new(8);
        let mut rx = bridge.subscribe();
        assert!(bridge.ingest_line("change resource name:r0 role:Secondary suspended:no"));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.resource, "r0");
        assert!(!bridge.ingest_line("garbage"));
    }

    #[test]
    fn test_state_accumulates_and_destroy_forgets() {
        let bridge = ObserverBridge::default();
        bridge.ingest_line("exists resource name:r0 role:Primary suspended:no");
        bridge.ingest_line("exists device name:r0 volume:0 minor:1000 disk:UpToDate");
        bridge.ingest_line("exists connection name:r0 conn-name:node-b connection:Connected");

        let state = bridge.resource_state("r0").unwrap();
        assert_eq!(state.role, ReplicationRole::Primary);
        assert_eq!(state.disks.get(&0), Some(&DiskState::UpToDate));
        assert_eq!(state.connections.get("node-b"), Some(&ConnectionState::Connected));
        assert!(state.updated_at.is_some());

        bridge.ingest_line("destroy resource name:r0");
        assert!(bridge.resource_state("r0").is_none());
    }

    #[test]
    fn test_apply_to_tree_sets_flags() {
        let bridge = ObserverBridge::default();
        bridge.ingest_line("change resource name:r0 role:Secondary suspended:user");
        bridge.ingest_line("change device name:r0 volume:1 minor:1001 disk:Failed");

        let mut tree = drbd_tree();
        bridge.apply_to_tree(&mut tree);

        let root = tree.node(tree.root()).unwrap();
        assert!(root.is_suspended());
        assert!(!root.volume(0).unwrap().failed());
        assert!(root.volume(1).unwrap().failed());

        bridge.ingest_line("change resource name:r0 role:Secondary suspended:no");
        bridge.ingest_line("change device name:r0 volume:1 minor:1001 disk:UpToDate");
        bridge.apply_to_tree(&mut tree);
        let root = tree.node(tree.root()).unwrap();
        assert!(!root.is_suspended());
        assert!(!root.volume(1).unwrap().failed());
    }

    #[test]
    fn test_unknown_resource_leaves_tree_untouched() {
        let bridge = ObserverBridge::default();
        let mut tree = drbd_tree();
        let before = tree.clone();
        bridge.apply_to_tree(&mut tree);
        assert_eq!(tree, before);
    }
}
