//! External Commands
//!
//! Description of one external tool invocation and its output, plus the
//! runner port every layer invokes tools through.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};

/// One external tool invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtCommand {
    pub program: String,
    pub args: Vec<String>,
    /// Bytes written to the tool's stdin, never logged
    pub stdin: Option<Vec<u8>>,
    /// Overrides the runner's default timeout
    pub timeout: Option<Duration>,
}

impl ExtCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
            timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl fmt::Display for ExtCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            if arg.contains(' ') {
                write!(f, " \"{}\"", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

/// Result of a finished invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtCmdOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExtCmdOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stdout_lines(&self) -> impl Iterator<Item = &str> {
        self.stdout.lines().map(str::trim).filter(|l| !l.is_empty())
    }
}

// =============================================================================
// Command Runner Port
// =============================================================================

/// Executes external tools
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a command to completion.
    ///
    /// A non-zero exit code is returned as output; only spawn failures and
    /// timeouts are errors.
    async fn run(&self, cmd: &ExtCommand) -> Result<ExtCmdOutput>;

    /// Run a command and treat a non-zero exit code as an error
    async fn run_checked(&self, cmd: &ExtCommand) -> Result<ExtCmdOutput> {
        let output = self.run(cmd).await?;
        if !output.success() {
            return Err(Error::ExtCmdFailed {
                command: cmd.to_string(),
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output)
    }
}

pub type CommandRunnerRef = Arc<dyn CommandRunner>;
