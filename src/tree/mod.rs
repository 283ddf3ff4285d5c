//! Layer Tree Model
//!
//! A resource's storage stack as an arena tree of layer nodes, each holding
//! per-volume size and device data plus a kind-specific payload.

pub mod builder;
pub mod layer_tree;
pub mod node;
pub mod spec;
pub mod transaction;
pub mod volume;

pub use builder::LayerTreeBuilder;
pub use layer_tree::LayerTree;
pub use node::{
    BCacheParams, CacheParams, DrbdParams, LayerNode, LayerNodeId, LayerPayload, LuksParams,
    NvmeParams, ResourceRef, WritecacheParams,
};
pub use spec::{
    BCacheSpec, CacheSize, CacheSpec, DrbdPeer, DrbdSpec, LayerStackSpec, LuksSpec, NvmeRole,
    NvmeSpec, NvmeTransport, VolumeSpec, WritecacheSpec,
};
pub use transaction::{TreeChangeSet, TreeTransaction};
pub use volume::{BackingRef, Size, SizeState, VolumeLayerData, VolumeNumber, UNBOUNDED_KIB};
