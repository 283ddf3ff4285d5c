//! External Observer Bridge
//!
//! Translates asynchronous replication-state notifications into flags the
//! processing driver sees on its layer trees.

pub mod bridge;
pub mod events;

pub use bridge::{ObserverBridge, ReplicationObserver, ReplicationObserverRef, ResourceReplicationState};
pub use events::{ConnectionState, DiskState, ReplicationEvent, ReplicationEventKind, ReplicationRole};
