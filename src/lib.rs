//! Layer Stack Operator
//!
//! Node-side engine that sizes and applies layered block-device stacks:
//! DRBD replication, LUKS encryption, NVMe-oF export, dm-writecache,
//! dm-cache and bcache on top of LVM, LVM-thin and ZFS storage.
//!
//! # Architecture
//!
//! ```text
//! stack descriptions ──► LayerTreeBuilder ──► LayerTree (per resource/snapshot)
//!                                                 │
//!                          StackWorker ──► DeviceHandler
//!                                                 │
//!            ┌──────────────┬─────────────────────┼───────────────────┐
//!            ▼              ▼                     ▼                   ▼
//!     SizeNegotiator  ObserverBridge      LayerRegistry        LayerDataStore
//!     (descend/ascend) (DRBD state)   (one DeviceLayer/kind)   (persistence)
//!                                                 │
//!                                          CommandRunner
//! ```
//!
//! # Modules
//!
//! - [`kinds`]: Layer kinds, provider kinds and their capabilities
//! - [`tree`]: Layer tree model, stack descriptions and transactions
//! - [`sizing`]: Size negotiation and DRBD metadata arithmetic
//! - [`layers`]: Device layer implementations and the layer registry
//! - [`devmgr`]: Processing driver, worker and consolidated responses
//! - [`observer`]: Replication state bridge
//! - [`exec`]: External command execution
//! - [`domain`]: Ports, storage pools and the in-memory store
//! - [`config`]: Satellite configuration
//! - [`metrics`]: Prometheus metrics
//! - [`error`]: Error types and handling

pub mod config;
pub mod devmgr;
pub mod domain;
pub mod error;
pub mod exec;
pub mod kinds;
pub mod layers;
pub mod metrics;
pub mod observer;
pub mod sizing;
pub mod tree;

// Re-export commonly used types
pub use config::{SatelliteConfig, SizingConfig};

pub use devmgr::{ApiCallRc, ApiResponse, DeviceHandler, DispatchOutcome, Severity, StackWorker};

pub use domain::{
    KeyProvider, KeyProviderRef, LayerDataStore, LayerDataStoreRef, MemoryLayerStore,
    StaticKeyProvider, StoragePool, StoragePoolRegistry,
};

pub use error::{Error, ErrorClass, Result};

pub use exec::{CommandRunner, CommandRunnerRef, DryRunRunner, ExtCommand, SystemCommandRunner};

pub use kinds::{DeviceLayerKind, DeviceProviderKind};

pub use layers::{DeviceLayer, LayerProcessResult, LayerRegistry, LayerServices};

pub use metrics::StackMetrics;

pub use observer::{ObserverBridge, ReplicationEvent, ReplicationObserver};

pub use sizing::{MdLayout, MdSizeMode, SizeNegotiator};

pub use tree::{LayerStackSpec, LayerTree, LayerTreeBuilder};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
