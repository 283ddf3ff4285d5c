//! Layer-Kind Registry
//!
//! Static catalog of device-layer kinds and storage provider kinds with
//! their capability flags. Pure data, no behavior.

pub mod layer_kind;
pub mod provider_kind;

pub use layer_kind::*;
pub use provider_kind::*;
