//! Domain layer - Ports towards the resource domain model
//!
//! Defines the persistence and key-material ports the engine writes through,
//! plus the storage pool registry and an in-memory store adapter.

pub mod memory_store;
pub mod pools;
pub mod ports;

pub use memory_store::{MemoryLayerStore, VolumeKey, VolumeRecord};
pub use pools::{StoragePool, StoragePoolRegistry, DEFAULT_DISKLESS_POOL};
pub use ports::*;
