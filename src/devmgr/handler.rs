//! Device Handler
//!
//! Applies a batch of layer trees on this node: sizes are negotiated, every
//! layer prepares once for the whole batch, then each tree is walked and its
//! layers processed in the order they ask for. Failures are isolated per
//! tree; only persistence and implementation faults end the dispatch.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::devmgr::response::{ApiResponse, WARN_NOT_SUPPORTED};
use crate::domain::LayerDataStoreRef;
use crate::error::{Error, Result};
use crate::kinds::DeviceLayerKind;
use crate::layers::{DeviceLayerRef, LayerProcessResult, LayerRegistry, ProcessOrder};
use crate::metrics::StackMetrics;
use crate::observer::ObserverBridge;
use crate::sizing::SizeNegotiator;
use crate::tree::layer_tree::LayerTree;
use crate::tree::node::{LayerNode, LayerNodeId};

// =============================================================================
// Outcome Types
// =============================================================================

/// Result of one dispatch
#[derive(Debug)]
pub struct DispatchOutcome {
    pub response: ApiResponse,
    /// Trees still present in the model, in submission order. Deletion trees
    /// that were applied are gone.
    pub trees: Vec<LayerTree>,
}

/// Processing of one tree stopped at a node
#[derive(Debug)]
struct StackAbort {
    layer: Option<DeviceLayerKind>,
    node: String,
    /// Layers between the failed node and the root, nearest first
    skipped: Vec<DeviceLayerKind>,
    error: Error,
}

impl StackAbort {
    fn at(tree: &LayerTree, node: LayerNodeId, error: Error) -> Self {
        let mut skipped = Vec::new();
        let mut parent = tree.get(node).and_then(|n| n.parent());
        while let Some(id) = parent {
            let Some(above) = tree.get(id) else {
                break;
            };
            skipped.push(above.kind());
            parent = above.parent();
        }
        Self {
            layer: tree.get(node).map(|n| n.kind()),
            node: tree
                .get(node)
                .map_or_else(|| node.to_string(), |n| n.to_string()),
            skipped,
            error,
        }
    }
}

struct Slot {
    tree: LayerTree,
    aborted: bool,
    removed: bool,
}

// =============================================================================
// Device Handler
// =============================================================================

pub struct DeviceHandler {
    registry: Arc<LayerRegistry>,
    negotiator: SizeNegotiator,
    store: LayerDataStoreRef,
    observer: Arc<ObserverBridge>,
    metrics: Arc<StackMetrics>,
}

impl DeviceHandler {
    pub fn new(
        registry: Arc<LayerRegistry>,
        store: LayerDataStoreRef,
        metrics: Arc<StackMetrics>,
    ) -> Self {
        let services = registry.services();
        let negotiator = SizeNegotiator::new(services.config.sizing.clone());
        let observer = services.observer.clone();
        Self {
            registry,
            negotiator,
            store,
            observer,
            metrics,
        }
    }

    pub fn registry(&self) -> &Arc<LayerRegistry> {
        &self.registry
    }

    /// Reset the transient state of every layer implementation
    pub fn clear_caches(&self) {
        self.registry.clear_caches();
        debug!("Cleared layer caches");
    }

    /// Apply a batch of trees.
    ///
    /// Configuration rejections and external tool failures abort only the
    /// affected tree and show up as error entries. Persistence failures and
    /// implementation faults are returned as `Err`.
    pub async fn dispatch(&self, batch: Vec<LayerTree>) -> Result<DispatchOutcome> {
        let mut response = ApiResponse::new();
        let mut slots: Vec<Slot> = batch
            .into_iter()
            .map(|tree| Slot {
                tree,
                aborted: false,
                removed: false,
            })
            .collect();

        self.negotiate(&mut slots, &mut response)?;

        for slot in slots.iter_mut().filter(|s| !s.aborted) {
            self.observer.apply_to_tree(&mut slot.tree);
        }

        self.prepare(&mut slots, &mut response).await?;

        let mut processed = 0usize;
        for idx in Self::processing_order(&slots) {
            let slot = &mut slots[idx];
            if slot.aborted {
                continue;
            }
            processed += 1;
            self.apply_tree(slot, &mut response).await?;
        }

        if processed > 0 {
            if let Err(e) = self.registry.storage().refresh_capacity().await {
                warn!(error = %e, "Failed to refresh storage pool capacity");
            }
        }

        info!(
            trees = slots.len(),
            processed,
            failed = slots.iter().filter(|s| s.aborted).count(),
            "Dispatch finished"
        );
        Ok(DispatchOutcome {
            response,
            trees: slots
                .into_iter()
                .filter(|s| !s.removed)
                .map(|s| s.tree)
                .collect(),
        })
    }

    // =========================================================================
    // Phases
    // =========================================================================

    fn negotiate(&self, slots: &mut [Slot], response: &mut ApiResponse) -> Result<()> {
        for slot in slots.iter_mut().filter(|s| !s.tree.is_deleting()) {
            let Err(e) = self.negotiator.negotiate(&mut slot.tree) else {
                continue;
            };
            if !e.is_resource_recoverable() {
                return Err(e.escalate_access_denied());
            }
            let resource = slot.tree.resource().clone();
            warn!(resource = %resource, error = %e, "Size negotiation rejected");
            self.metrics.record_config_rejection();
            response.add(ApiResponse::failed(
                &resource,
                false,
                None,
                format!("Sizes of '{}' could not be negotiated", resource),
                &e,
            ));
            slot.aborted = true;
        }
        Ok(())
    }

    /// One bulk prepare per layer kind over every tree that uses it
    async fn prepare(&self, slots: &mut [Slot], response: &mut ApiResponse) -> Result<()> {
        for layer in self.registry.all() {
            let kind = layer.kind();
            let members: Vec<usize> = slots
                .iter()
                .enumerate()
                .filter(|(_, s)| !s.aborted && !s.tree.iter_kind(kind).is_empty())
                .map(|(idx, _)| idx)
                .collect();
            if members.is_empty() {
                continue;
            }

            let outcome = {
                let view: &[Slot] = slots;
                let nodes: Vec<&LayerNode> = members
                    .iter()
                    .flat_map(|&idx| {
                        let tree = &view[idx].tree;
                        tree.iter_kind(kind)
                            .into_iter()
                            .filter_map(move |id| tree.get(id))
                    })
                    .collect();
                debug!(layer = %kind, nodes = nodes.len(), "Preparing layer");
                layer.prepare(&nodes).await
            };

            let Err(e) = outcome else {
                continue;
            };
            if !e.is_resource_recoverable() {
                error!(layer = %kind, error = %e, "Layer preparation failed fatally");
                return Err(e.escalate_access_denied());
            }
            warn!(layer = %kind, trees = members.len(), error = %e, "Layer preparation failed");
            for idx in members {
                let slot = &mut slots[idx];
                let resource = slot.tree.resource().clone();
                self.metrics.record_abort(Some(kind));
                response.add(ApiResponse::failed(
                    &resource,
                    slot.tree.is_deleting(),
                    Some(kind),
                    format!("Layer {} failed to prepare '{}'", kind.tag(), resource),
                    &e,
                ));
                slot.aborted = true;
            }
        }
        Ok(())
    }

    /// Deleting snapshots first, then resources, then the other snapshots.
    ///
    /// A resource whose snapshots still exist may not be removable.
    fn processing_order(slots: &[Slot]) -> Vec<usize> {
        let rank = |slot: &Slot| match (slot.tree.resource().is_snapshot(), slot.tree.is_deleting()) {
            (true, true) => 0,
            (false, _) => 1,
            (true, false) => 2,
        };
        let mut order: Vec<usize> = (0..slots.len()).collect();
        order.sort_by_key(|&idx| rank(&slots[idx]));
        order
    }

    async fn apply_tree(&self, slot: &mut Slot, response: &mut ApiResponse) -> Result<()> {
        let resource = slot.tree.resource().clone();
        let deleting = slot.tree.is_deleting();
        let manages_suspend = !resource.is_snapshot();

        let mut result = Ok(());
        if manages_suspend {
            match self.manage_suspend(&mut slot.tree).await {
                Ok(true) => {}
                Ok(false) => {
                    if slot.tree.suspend_requested() && !deleting {
                        response.add(ApiResponse::warning(
                            &resource,
                            None,
                            WARN_NOT_SUPPORTED,
                            format!("No layer of '{}' can suspend I/O", resource),
                        ));
                    }
                }
                Err(abort) => result = Err(abort),
            }
        }

        if result.is_ok() {
            let root = slot.tree.root();
            result = self.walk(&mut slot.tree, root).await.map(|_| ());
        }

        if result.is_ok() && manages_suspend && !deleting {
            // devices created by this pass
            result = self.manage_suspend(&mut slot.tree).await.map(|_| ());
        }

        if let Err(abort) = result {
            if !abort.error.is_resource_recoverable() {
                error!(
                    resource = %resource,
                    node = %abort.node,
                    error = %abort.error,
                    "Stack processing failed fatally"
                );
                return Err(abort.error.escalate_access_denied());
            }
            warn!(
                resource = %resource,
                node = %abort.node,
                layer = ?abort.layer,
                error = %abort.error,
                "Stack processing aborted"
            );
            self.metrics.record_abort(abort.layer);
            let layer_name = abort.layer.map_or("unknown", |k| k.tag());
            let mut entry = ApiResponse::failed(
                &resource,
                deleting,
                abort.layer,
                format!("Layer {} failed to process '{}'", layer_name, abort.node),
                &abort.error,
            );
            if !abort.skipped.is_empty() {
                let above: Vec<&str> = abort.skipped.iter().map(|k| k.tag()).collect();
                entry = entry.with_details(format!("Skipping layers above: {}", above.join(", ")));
            }
            response.add(entry);
            slot.aborted = true;
            if !deleting {
                // devices created before the abort are still recorded
                self.persist_volumes(&slot.tree).await?;
            }
            return Ok(());
        }

        if deleting {
            let mut tx = slot.tree.begin();
            tx.remove(slot.tree.root());
            slot.tree
                .commit_with(tx, self.store.as_ref())
                .await
                .map_err(Error::escalate_access_denied)?;
            slot.removed = true;
        } else {
            self.persist_volumes(&slot.tree).await?;
        }

        self.metrics.record_applied();
        info!(resource = %resource, deleted = deleting, "Layer stack applied");
        response.add(ApiResponse::applied(&resource, deleting));
        Ok(())
    }

    // =========================================================================
    // Tree Walk
    // =========================================================================

    fn walk<'a>(
        &'a self,
        tree: &'a mut LayerTree,
        node: LayerNodeId,
    ) -> BoxFuture<'a, std::result::Result<LayerProcessResult, StackAbort>> {
        async move {
            let kind = tree
                .node(node)
                .map_err(|e| StackAbort::at(tree, node, e))?
                .kind();
            let layer = self.registry.layer(kind).clone();
            let children = tree.children(node);

            let result = match layer.process_order(tree.is_deleting()) {
                ProcessOrder::ChildrenFirst => {
                    for child in children {
                        self.walk(tree, child).await?;
                    }
                    Self::process_node(&layer, tree, node).await?
                }
                ProcessOrder::SelfFirst => {
                    let result = Self::process_node(&layer, tree, node).await?;
                    for child in children {
                        self.walk(tree, child).await?;
                    }
                    result
                }
            };
            Ok(result)
        }
        .boxed()
    }

    async fn process_node(
        layer: &DeviceLayerRef,
        tree: &mut LayerTree,
        node: LayerNodeId,
    ) -> std::result::Result<LayerProcessResult, StackAbort> {
        let outcome = layer.process(tree, node).await;
        let result = outcome.map_err(|e| StackAbort::at(tree, node, e))?;
        debug!(resource = %tree.resource(), node = %node, ?result, "Processed layer node");

        let failed = tree
            .get(node)
            .map_or(false, |n| n.volumes().any(|v| v.failed()));
        if failed && !tree.is_deleting() {
            let error = Error::Storage {
                layer: layer.kind().tag().to_string(),
                reason: "a volume of this layer reports a failed disk".to_string(),
            };
            return Err(StackAbort::at(tree, node, error));
        }
        Ok(result)
    }

    // =========================================================================
    // Suspend Management
    // =========================================================================

    /// Bring the topmost suspend-capable layer in line with the request.
    ///
    /// Returns `false` when no layer of the tree can suspend I/O.
    async fn manage_suspend(&self, tree: &mut LayerTree) -> std::result::Result<bool, StackAbort> {
        let target = tree.dfs(tree.root()).into_iter().find_map(|id| {
            let kind = tree.get(id)?.kind();
            let layer = self.registry.layer(kind);
            layer.supports_suspend_io().then(|| (id, layer.clone()))
        });
        let Some((node, layer)) = target else {
            return Ok(false);
        };

        let (exists, suspended) = match tree.get(node) {
            Some(n) => (
                n.volumes().next().is_some() && n.volumes().all(|v| v.exists()),
                n.is_suspended(),
            ),
            None => (false, false),
        };
        let wanted = tree.suspend_requested() && !tree.is_deleting() && exists;

        if wanted && !suspended {
            layer
                .suspend_io(tree, node)
                .await
                .map_err(|e| StackAbort::at(tree, node, e))?;
            info!(resource = %tree.resource(), layer = %layer.kind(), "Suspended I/O");
        } else if !wanted && suspended {
            layer
                .resume_io(tree, node)
                .await
                .map_err(|e| StackAbort::at(tree, node, e))?;
            info!(resource = %tree.resource(), layer = %layer.kind(), "Resumed I/O");
        } else {
            return Ok(true);
        }

        if let Ok(n) = tree.node_mut(node) {
            n.set_suspended(wanted);
        }
        Ok(true)
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    async fn persist_volumes(&self, tree: &LayerTree) -> Result<()> {
        for id in tree.dfs(tree.root()) {
            let node = tree.node(id)?;
            for volume in node.volumes() {
                self.store
                    .persist_volume(node, volume)
                    .await
                    .map_err(Error::escalate_access_denied)?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for DeviceHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHandler")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SatelliteConfig;
    use crate::devmgr::response::{DELETED, FAIL_EXT_TOOL, FAIL_INVLD_CONF, MODIFIED};
    use crate::domain::MemoryLayerStore;
    use crate::exec::scripted::ScriptedRunner;
    use crate::layers::testing::services;
    use crate::tree::builder::LayerTreeBuilder;
    use crate::tree::spec::{CacheSpec, LayerStackSpec, VolumeSpec};
    use assert_matches::assert_matches;

    struct Fixture {
        runner: Arc<ScriptedRunner>,
        store: Arc<MemoryLayerStore>,
        metrics: Arc<StackMetrics>,
        handler: DeviceHandler,
        builder: LayerTreeBuilder,
    }

    fn fixture() -> Fixture {
        fixture_with(SatelliteConfig::default())
    }

    fn fixture_with(config: SatelliteConfig) -> Fixture {
        let runner = Arc::new(ScriptedRunner::new());
        let services = services(runner.clone(), config);
        let builder = LayerTreeBuilder::new(services.pools.clone(), &services.config);
        let store = Arc::new(MemoryLayerStore::new());
        let metrics = Arc::new(StackMetrics::new().unwrap());
        let handler = DeviceHandler::new(
            Arc::new(LayerRegistry::new(services)),
            store.clone(),
            metrics.clone(),
        );
        Fixture {
            runner,
            store,
            metrics,
            handler,
            builder,
        }
    }

    fn stack(resource: &str, layers: Vec<DeviceLayerKind>) -> LayerStackSpec {
        LayerStackSpec {
            resource: resource.into(),
            snapshot: None,
            layers,
            volumes: vec![VolumeSpec {
                number: 0,
                size_kib: 1 << 20,
                storage_pool: "lvm".into(),
                meta_pool: None,
                minor: Some(1000),
            }],
            drbd: Default::default(),
            luks: Default::default(),
            nvme: Default::default(),
            writecache: Default::default(),
            cache: Default::default(),
            bcache: Default::default(),
            delete: false,
            suspend_io: false,
        }
    }

    fn cached(resource: &str) -> LayerStackSpec {
        let mut spec = stack(resource, vec![DeviceLayerKind::Cache, DeviceLayerKind::Storage]);
        spec.cache = CacheSpec {
            cache_pool: Some("fast".into()),
            ..Default::default()
        };
        spec
    }

    #[tokio::test]
    async fn test_storage_stack_is_applied_and_persisted() {
        let f = fixture();
        let tree = f.builder.build(&stack("r0", vec![DeviceLayerKind::Storage])).unwrap();
        let outcome = f.handler.dispatch(vec![tree]).await.unwrap();

        let entries = outcome.response.entries();
        assert_eq!(entries.len(), 1);
        assert!(!entries[0].is_error());
        assert_eq!(entries[0].detail(), MODIFIED);
        assert_eq!(f.runner.count("lvcreate"), 1);
        assert_eq!(f.store.volume_count(), 1);
        assert_eq!(f.metrics.stacks_applied(), 1);

        let tree = &outcome.trees[0];
        assert_eq!(
            tree.device_path(tree.root(), 0).as_deref(),
            Some("/dev/vg0/r0_00000")
        );
    }

    #[tokio::test]
    async fn test_no_devices_provided_is_not_a_failure() {
        let f = fixture();
        let mut spec = stack("r0", vec![DeviceLayerKind::Luks, DeviceLayerKind::Storage]);
        spec.snapshot = Some("snap1".into());
        spec.volumes[0].storage_pool = "thin".into();
        spec.luks.key_ref = Some("master".into());
        let tree = f.builder.build(&spec).unwrap();

        let outcome = f.handler.dispatch(vec![tree]).await.unwrap();
        assert!(!outcome.response.has_errors());
        assert!(outcome.response.entries()[0].is_snapshot());
        assert_eq!(f.runner.count("cryptsetup"), 0);
        assert_eq!(f.runner.count("lvcreate --snapshot"), 1);
    }

    #[tokio::test]
    async fn test_abort_is_isolated_to_its_resource() {
        let f = fixture();
        f.runner.fail("dmsetup create", 1, "device busy");
        let failing = f.builder.build(&cached("r0")).unwrap();
        let healthy = f
            .builder
            .build(&stack("r1", vec![DeviceLayerKind::Storage]))
            .unwrap();

        let outcome = f.handler.dispatch(vec![failing, healthy]).await.unwrap();
        let response = &outcome.response;
        assert!(response.has_errors());

        let r0: Vec<_> = response.for_resource("r0").collect();
        assert_eq!(r0.len(), 1);
        assert!(r0[0].is_error());
        assert_eq!(r0[0].detail(), FAIL_EXT_TOOL);
        assert_eq!(r0[0].objects.layer, Some(DeviceLayerKind::Cache));
        assert!(r0[0].cause.as_deref().unwrap().contains("device busy"));

        let r1: Vec<_> = response.for_resource("r1").collect();
        assert_eq!(r1.len(), 1);
        assert!(!r1[0].is_error());

        assert_eq!(f.metrics.aborts(DeviceLayerKind::Cache), 1);
        assert_eq!(f.metrics.stacks_applied(), 1);
        assert_eq!(outcome.trees.len(), 2);
    }

    #[tokio::test]
    async fn test_skip_disk_replica_applies_alongside_healthy_resource() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture_with(SatelliteConfig {
            drbd_resource_dir: dir.path().to_path_buf(),
            ..Default::default()
        });
        let mut spec = stack("r0", vec![DeviceLayerKind::Drbd, DeviceLayerKind::Storage]);
        spec.drbd.skip_disk = true;
        let skipped = f.builder.build(&spec).unwrap();
        let healthy = f
            .builder
            .build(&stack("r1", vec![DeviceLayerKind::Storage]))
            .unwrap();

        let outcome = f.handler.dispatch(vec![skipped, healthy]).await.unwrap();
        let response = &outcome.response;
        assert!(!response.has_errors());
        assert_eq!(response.entries().len(), 2);
        assert_eq!(response.for_resource("r0").count(), 1);
        assert_eq!(response.for_resource("r1").count(), 1);

        assert_eq!(f.runner.count("lvcreate"), 1);
        assert_eq!(f.runner.count("drbdmeta"), 0);
        assert_eq!(f.runner.count("drbdadm adjust r0"), 1);
        assert_eq!(f.metrics.stacks_applied(), 2);

        let res = std::fs::read_to_string(dir.path().join("r0.res")).unwrap();
        assert!(res.contains("disk none;"));
        let tree = &outcome.trees[0];
        assert_eq!(
            tree.device_path(tree.root(), 0).as_deref(),
            Some("/dev/drbd1000")
        );
    }

    #[tokio::test]
    async fn test_invalid_activity_log_rejected_before_any_command() {
        let f = fixture();
        let mut spec = stack("r0", vec![DeviceLayerKind::Drbd, DeviceLayerKind::Storage]);
        spec.drbd.al_stripes = Some(0);
        let tree = f.builder.build(&spec).unwrap();

        let outcome = f.handler.dispatch(vec![tree]).await.unwrap();
        let entries = outcome.response.entries();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].is_error());
        assert_eq!(entries[0].detail(), FAIL_INVLD_CONF);
        assert!(f.runner.commands().is_empty());
        assert_eq!(f.metrics.config_rejections(), 1);
        assert_eq!(f.store.volume_count(), 0);
    }

    #[tokio::test]
    async fn test_persistence_failure_propagates() {
        let f = fixture();
        f.store.fail_persistence(true);
        let tree = f.builder.build(&stack("r0", vec![DeviceLayerKind::Storage])).unwrap();
        let err = f.handler.dispatch(vec![tree]).await.unwrap_err();
        assert_matches!(err, Error::Persistence(_));
    }

    #[tokio::test]
    async fn test_access_denied_escalates_to_implementation_error() {
        let f = fixture();
        f.store.deny_access(true);
        let tree = f.builder.build(&stack("r0", vec![DeviceLayerKind::Storage])).unwrap();
        let err = f.handler.dispatch(vec![tree]).await.unwrap_err();
        assert_matches!(err, Error::Implementation(_));
    }

    #[tokio::test]
    async fn test_deleted_tree_is_removed_from_the_model() {
        let f = fixture();
        f.runner.on("lvs -o lv_name", "  r0_00000;/dev/vg0/r0_00000;1048576.00;vg0\n");
        let mut spec = stack("r0", vec![DeviceLayerKind::Storage]);
        spec.delete = true;
        let tree = f.builder.build(&spec).unwrap();

        let outcome = f.handler.dispatch(vec![tree]).await.unwrap();
        assert!(outcome.trees.is_empty());
        assert_eq!(outcome.response.entries()[0].detail(), DELETED);
        assert_eq!(f.runner.count("lvremove -f vg0/r0_00000"), 1);
        assert_eq!(f.store.deleted_volume_count(), 1);
        assert_eq!(f.store.tree_change_count(), 1);
    }

    #[tokio::test]
    async fn test_deleting_snapshots_are_processed_first() {
        let f = fixture();
        let resource = f.builder.build(&stack("r0", vec![DeviceLayerKind::Storage])).unwrap();
        let mut spec = stack("r0", vec![DeviceLayerKind::Storage]);
        spec.snapshot = Some("old".into());
        spec.volumes[0].storage_pool = "thin".into();
        spec.delete = true;
        let snapshot = f.builder.build(&spec).unwrap();

        let outcome = f.handler.dispatch(vec![resource, snapshot]).await.unwrap();
        let entries = outcome.response.entries();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].is_snapshot());
        assert_eq!(entries[0].detail(), DELETED);
        assert!(!entries[1].is_snapshot());
    }

    #[tokio::test]
    async fn test_suspend_requested_on_created_device() {
        let f = fixture();
        let mut spec = cached("r0");
        spec.suspend_io = true;
        let tree = f.builder.build(&spec).unwrap();

        let outcome = f.handler.dispatch(vec![tree]).await.unwrap();
        assert!(!outcome.response.has_errors());
        assert_eq!(f.runner.count("dmsetup suspend /dev/mapper/r0_00000"), 1);
        let tree = &outcome.trees[0];
        assert!(tree.node(tree.root()).unwrap().is_suspended());

        // a second pass without the request resumes
        let mut tree = outcome.trees.into_iter().next().unwrap();
        tree.set_suspend_requested(false);
        let outcome = f.handler.dispatch(vec![tree]).await.unwrap();
        assert!(!outcome.response.has_errors());
        assert_eq!(f.runner.count("dmsetup resume /dev/mapper/r0_00000"), 1);
    }

    #[tokio::test]
    async fn test_suspend_without_capable_layer_warns() {
        let f = fixture();
        let mut spec = stack("r0", vec![DeviceLayerKind::Storage]);
        spec.suspend_io = true;
        let tree = f.builder.build(&spec).unwrap();

        let outcome = f.handler.dispatch(vec![tree]).await.unwrap();
        let entries = outcome.response.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(
            entries[0].severity(),
            crate::devmgr::response::Severity::Warning
        );
        assert!(!outcome.response.has_errors());
    }
}
