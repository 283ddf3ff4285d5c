//! System Command Runner
//!
//! Runs external tools as child processes with a bounded run time.

use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::exec::command::{CommandRunner, ExtCmdOutput, ExtCommand};
use crate::metrics::StackMetrics;

/// Runner spawning real processes
#[derive(Debug, Clone)]
pub struct SystemCommandRunner {
    default_timeout: Duration,
    metrics: Option<Arc<StackMetrics>>,
}

impl SystemCommandRunner {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            default_timeout,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<StackMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn record(&self, cmd: &ExtCommand, success: bool, started: Instant) {
        if let Some(metrics) = &self.metrics {
            metrics.record_command(&cmd.program, success, started.elapsed());
        }
    }
}

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(&self, cmd: &ExtCommand) -> Result<ExtCmdOutput> {
        let timeout = cmd.timeout.unwrap_or(self.default_timeout);
        debug!(command = %cmd, ?timeout, "Executing external command");
        let started = Instant::now();

        let io_err = |e: std::io::Error| Error::ExtCmdIo {
            command: cmd.to_string(),
            reason: e.to_string(),
        };

        let mut child = Command::new(&cmd.program)
            .args(&cmd.args)
            .stdin(if cmd.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(io_err)?;

        // stdin is fed inside the timeout; a tool that never reads blocks the write
        let stdin = child.stdin.take();
        let exchange = async move {
            if let (Some(input), Some(mut pipe)) = (&cmd.stdin, stdin) {
                pipe.write_all(input).await?;
                // closing stdin lets the tool see EOF
                drop(pipe);
            }
            child.wait_with_output().await
        };

        let output = match tokio::time::timeout(timeout, exchange).await {
            Err(_) => {
                self.record(cmd, false, started);
                warn!(command = %cmd, ?timeout, "External command timed out");
                return Err(Error::ExtCmdTimeout {
                    command: cmd.to_string(),
                    timeout,
                });
            }
            Ok(result) => result.map_err(io_err)?,
        };

        let result = ExtCmdOutput {
            // killed by a signal
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        self.record(cmd, result.success(), started);
        debug!(
            command = %cmd,
            exit_code = result.exit_code,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "External command finished"
        );
        Ok(result)
    }
}
