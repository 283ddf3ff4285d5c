//! Dry-Run Command Runner
//!
//! Logs every command instead of executing it and reports success with
//! empty output, so query commands see no existing devices.

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::info;

use crate::error::Result;
use crate::exec::command::{CommandRunner, ExtCmdOutput, ExtCommand};

#[derive(Debug, Default)]
pub struct DryRunRunner {
    issued: Mutex<Vec<String>>,
}

impl DryRunRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands issued so far, in order
    pub fn issued(&self) -> Vec<String> {
        self.issued.lock().clone()
    }
}

#[async_trait]
impl CommandRunner for DryRunRunner {
    async fn run(&self, cmd: &ExtCommand) -> Result<ExtCmdOutput> {
        info!(command = %cmd, "dry-run: not executing");
        self.issued.lock().push(cmd.to_string());
        Ok(ExtCmdOutput::default())
    }
}
