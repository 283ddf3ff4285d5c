//! Device Manager
//!
//! Drives the layer implementations over batches of layer trees and
//! reports a consolidated response per batch.

pub mod handler;
pub mod response;
pub mod worker;

pub use handler::{DeviceHandler, DispatchOutcome};
pub use response::{ApiCallRc, ApiResponse, ObjectRefs, Severity};
pub use worker::{StackWorker, DEFAULT_QUEUE_DEPTH};
