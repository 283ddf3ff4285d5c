//! Consolidated Responses
//!
//! Every dispatch produces an ordered list of return-code entries, one or
//! more per resource, naming the affected objects. The encoding on the wire
//! belongs to the transport; entries only need to serialize.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::Error;
use crate::kinds::DeviceLayerKind;
use crate::tree::node::ResourceRef;
use crate::tree::volume::VolumeNumber;

// =============================================================================
// Return Codes
// =============================================================================

pub const MASK_ERROR: u64 = 0xC000_0000_0000_0000;
pub const MASK_WARN: u64 = 0x8000_0000_0000_0000;
pub const MASK_INFO: u64 = 0x4000_0000_0000_0000;
pub const MASK_SEVERITY: u64 = 0xC000_0000_0000_0000;

pub const MASK_CRT: u64 = 0x0400_0000;
pub const MASK_MOD: u64 = 0x0800_0000;
pub const MASK_DEL: u64 = 0x0C00_0000;
pub const MASK_OP: u64 = 0x0C00_0000;

pub const MASK_RSC: u64 = 0x0034_0000;
pub const MASK_SNAPSHOT: u64 = 0x001C_0000;
pub const MASK_OBJ: u64 = 0x003C_0000;

pub const CREATED: u64 = 1;
pub const DELETED: u64 = 2;
pub const MODIFIED: u64 = 3;

pub const WARN_NOT_SUPPORTED: u64 = 20;

pub const FAIL_INVLD_CONF: u64 = 100;
pub const FAIL_EXT_TOOL: u64 = 101;
pub const FAIL_LAYER: u64 = 102;
pub const FAIL_UNKNOWN_ERROR: u64 = 999;

const MASK_DETAIL: u64 = 0xFFFF;

/// Severity of an entry, taken from the high bits of its code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Success,
    Info,
    Warning,
    Error,
}

/// Object mask of a resource or snapshot
pub fn object_mask(resource: &ResourceRef) -> u64 {
    if resource.is_snapshot() {
        MASK_SNAPSHOT
    } else {
        MASK_RSC
    }
}

/// Failure detail code for an error that aborted one resource
pub fn failure_code(error: &Error) -> u64 {
    use crate::error::ErrorClass;
    match error.class() {
        ErrorClass::ConfigurationRejection => FAIL_INVLD_CONF,
        ErrorClass::ExternalTool => FAIL_EXT_TOOL,
        _ => FAIL_UNKNOWN_ERROR,
    }
}

// =============================================================================
// Entries
// =============================================================================

/// Objects an entry refers to
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRefs {
    pub resource: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layer: Option<DeviceLayerKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<VolumeNumber>,
}

impl From<&ResourceRef> for ObjectRefs {
    fn from(resource: &ResourceRef) -> Self {
        Self {
            resource: resource.resource.clone(),
            snapshot: resource.snapshot.clone(),
            layer: None,
            volume: None,
        }
    }
}

/// One return-code entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiCallRc {
    pub ret_code: u64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    pub objects: ObjectRefs,
    pub timestamp: DateTime<Utc>,
}

impl ApiCallRc {
    pub fn new(ret_code: u64, message: impl Into<String>, objects: ObjectRefs) -> Self {
        Self {
            ret_code,
            message: message.into(),
            cause: None,
            details: None,
            objects,
            timestamp: Utc::now(),
        }
    }

    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_layer(mut self, layer: Option<DeviceLayerKind>) -> Self {
        self.objects.layer = layer;
        self
    }

    pub fn severity(&self) -> Severity {
        match self.ret_code & MASK_SEVERITY {
            MASK_ERROR => Severity::Error,
            MASK_WARN => Severity::Warning,
            MASK_INFO => Severity::Info,
            _ => Severity::Success,
        }
    }

    pub fn is_error(&self) -> bool {
        self.severity() == Severity::Error
    }

    /// Detail part of the code, without severity, operation and object bits
    pub fn detail(&self) -> u64 {
        self.ret_code & MASK_DETAIL
    }

    pub fn is_snapshot(&self) -> bool {
        self.ret_code & MASK_OBJ == MASK_SNAPSHOT
    }
}

impl fmt::Display for ApiCallRc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}] {}", self.ret_code, self.message)?;
        if let Some(cause) = &self.cause {
            write!(f, ": {}", cause)?;
        }
        Ok(())
    }
}

// =============================================================================
// Response
// =============================================================================

/// Ordered entries of one dispatch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiResponse {
    entries: Vec<ApiCallRc>,
}

impl ApiResponse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, entry: ApiCallRc) {
        self.entries.push(entry);
    }

    pub fn merge(&mut self, other: ApiResponse) {
        self.entries.extend(other.entries);
    }

    pub fn entries(&self) -> &[ApiCallRc] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn has_errors(&self) -> bool {
        self.entries.iter().any(ApiCallRc::is_error)
    }

    /// Entries referring to one resource, snapshots included
    pub fn for_resource<'a>(&'a self, resource: &'a str) -> impl Iterator<Item = &'a ApiCallRc> {
        self.entries
            .iter()
            .filter(move |e| e.objects.resource == resource)
    }

    // =========================================================================
    // Entry constructors
    // =========================================================================

    pub(crate) fn applied(resource: &ResourceRef, deleted: bool) -> ApiCallRc {
        let (op, detail, verb) = if deleted {
            (MASK_DEL, DELETED, "deleted")
        } else {
            (MASK_MOD, MODIFIED, "applied")
        };
        let what = if resource.is_snapshot() { "Snapshot" } else { "Resource" };
        ApiCallRc::new(
            object_mask(resource) | op | detail,
            format!("{} '{}' {}", what, resource, verb),
            resource.into(),
        )
    }

    pub(crate) fn failed(
        resource: &ResourceRef,
        deleting: bool,
        layer: Option<DeviceLayerKind>,
        message: impl Into<String>,
        error: &Error,
    ) -> ApiCallRc {
        let op = if deleting { MASK_DEL } else { MASK_MOD };
        ApiCallRc::new(
            MASK_ERROR | object_mask(resource) | op | failure_code(error),
            message,
            resource.into(),
        )
        .with_layer(layer)
        .with_cause(error.to_string())
    }

    pub(crate) fn warning(
        resource: &ResourceRef,
        layer: Option<DeviceLayerKind>,
        detail: u64,
        message: impl Into<String>,
    ) -> ApiCallRc {
        ApiCallRc::new(
            MASK_WARN | object_mask(resource) | MASK_MOD | detail,
            message,
            resource.into(),
        )
        .with_layer(layer)
    }
}
