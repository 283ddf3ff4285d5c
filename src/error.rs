//! Error types for the layer stack engine
//!
//! Provides structured error types for size negotiation, the layer tree
//! model, external tool invocations, persistence and authorization.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the engine
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Implementation error: {0}")]
    Implementation(String),

    // =========================================================================
    // Size Negotiation Errors
    // =========================================================================
    #[error("Peer count {peers} is outside of the supported range [1, 31]")]
    PeerCount { peers: u16 },

    #[error("Activity log stripe count must be at least 1, got {stripes}")]
    AlStripes { stripes: u32 },

    #[error("Activity log size {size_kib} KiB is below the minimum")]
    MinAlSize { size_kib: u64 },

    #[error("Activity log size {size_kib} KiB is above the maximum")]
    MaxAlSize { size_kib: u64 },

    #[error("Size {size_kib} KiB is below the minimum device size")]
    MinSize { size_kib: u64 },

    #[error("Size {size_kib} KiB is above the maximum device size")]
    MaxSize { size_kib: u64 },

    #[error("Invalid {layer} parameter: {reason}")]
    InvalidLayerParameter { layer: String, reason: String },

    #[error("{field} size of {node} volume {volume} read before it was computed")]
    UninitializedSize {
        node: String,
        volume: u32,
        field: &'static str,
    },

    // =========================================================================
    // Layer Tree Errors
    // =========================================================================
    #[error("Invalid layer stack: {0}")]
    InvalidLayerStack(String),

    #[error("Layer node not found: {node_id}")]
    LayerNodeNotFound { node_id: u32 },

    #[error("Volume {volume} not found in layer node {node_id}")]
    VolumeNotFound { node_id: u32, volume: u32 },

    #[error("Duplicate child suffix '{suffix}' below layer node {parent_id}")]
    DuplicateSuffix { parent_id: u32, suffix: String },

    // =========================================================================
    // External Tool Errors
    // =========================================================================
    #[error("Command '{command}' failed with exit code {exit_code}: {stderr}")]
    ExtCmdFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("Command '{command}' timed out after {timeout:?}")]
    ExtCmdTimeout { command: String, timeout: Duration },

    #[error("Command '{command}' could not be executed: {reason}")]
    ExtCmdIo { command: String, reason: String },

    #[error("Storage error in {layer} layer: {reason}")]
    Storage { layer: String, reason: String },

    #[error("Storage provider {provider} is not available on this node")]
    UnsupportedProvider { provider: String },

    #[error("Storage pool not found: {pool}")]
    StoragePoolNotFound { pool: String },

    #[error("Insufficient capacity in pool {pool}: requested {requested_kib} KiB, free {free_kib} KiB")]
    InsufficientCapacity {
        pool: String,
        requested_kib: u64,
        free_kib: u64,
    },

    // =========================================================================
    // Authorization Errors
    // =========================================================================
    #[error("Access denied to {object}: {reason}")]
    AccessDenied { object: String, reason: String },

    // =========================================================================
    // Persistence Errors
    // =========================================================================
    #[error("Persistence error: {0}")]
    Persistence(String),

    // =========================================================================
    // Worker Errors
    // =========================================================================
    #[error("Stack worker is not running")]
    WorkerStopped,

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure class used to decide how far an error propagates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Mathematically invalid size or parameter combination
    ConfigurationRejection,
    /// Subprocess non-zero exit, I/O error or timeout
    ExternalTool,
    /// Access check failed while reading configuration
    Authorization,
    /// Recording a result failed; the caller owns retry
    Persistence,
    /// Programming error, never recoverable
    Implementation,
    /// Everything else
    Internal,
}

impl Error {
    /// Determine the failure class of this error
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::PeerCount { .. }
            | Error::AlStripes { .. }
            | Error::MinAlSize { .. }
            | Error::MaxAlSize { .. }
            | Error::MinSize { .. }
            | Error::MaxSize { .. }
            | Error::InvalidLayerParameter { .. }
            | Error::InvalidLayerStack(_)
            | Error::DuplicateSuffix { .. }
            | Error::StoragePoolNotFound { .. }
            | Error::InsufficientCapacity { .. } => ErrorClass::ConfigurationRejection,

            Error::ExtCmdFailed { .. }
            | Error::ExtCmdTimeout { .. }
            | Error::ExtCmdIo { .. }
            | Error::Storage { .. }
            | Error::UnsupportedProvider { .. }
            | Error::Io(_) => ErrorClass::ExternalTool,

            Error::AccessDenied { .. } => ErrorClass::Authorization,

            Error::Persistence(_) => ErrorClass::Persistence,

            Error::Implementation(_)
            | Error::UninitializedSize { .. }
            | Error::LayerNodeNotFound { .. }
            | Error::VolumeNotFound { .. } => ErrorClass::Implementation,

            _ => ErrorClass::Internal,
        }
    }

    /// Whether this error only aborts the affected resource
    pub fn is_resource_recoverable(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::ConfigurationRejection | ErrorClass::ExternalTool
        )
    }

    /// Convert an authorization failure into an implementation error.
    ///
    /// The engine only reads configuration through access-checked accessors,
    /// so a denial during processing means the capability model is broken.
    pub fn escalate_access_denied(self) -> Self {
        match self {
            Error::AccessDenied { object, reason } => Error::Implementation(format!(
                "access denied to {} during stack processing: {}",
                object, reason
            )),
            other => other,
        }
    }
}

/// Result type alias for the engine
pub type Result<T> = std::result::Result<T, Error>;
