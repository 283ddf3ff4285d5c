//! Scripted command runner for processing tests.
//!
//! Answers commands by the first rule whose prefix matches the rendered
//! command line; unmatched commands succeed with empty output.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::exec::command::{CommandRunner, ExtCmdOutput, ExtCommand};

#[derive(Debug, Clone)]
enum Reply {
    Output(ExtCmdOutput),
    Timeout,
}

#[derive(Debug, Default)]
pub struct ScriptedRunner {
    rules: Mutex<Vec<(String, Reply)>>,
    issued: Mutex<Vec<ExtCommand>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reply with `stdout` and exit code 0
    pub fn on(&self, prefix: &str, stdout: &str) -> &Self {
        self.push(
            prefix,
            Reply::Output(ExtCmdOutput {
                exit_code: 0,
                stdout: stdout.to_string(),
                stderr: String::new(),
            }),
        )
    }

    /// Reply with a non-zero exit code
    pub fn fail(&self, prefix: &str, exit_code: i32, stderr: &str) -> &Self {
        self.push(
            prefix,
            Reply::Output(ExtCmdOutput {
                exit_code,
                stdout: String::new(),
                stderr: stderr.to_string(),
            }),
        )
    }

    /// Let matching commands time out
    pub fn timeout(&self, prefix: &str) -> &Self {
        self.push(prefix, Reply::Timeout)
    }

    fn push(&self, prefix: &str, reply: Reply) -> &Self {
        self.rules.lock().push((prefix.to_string(), reply));
        self
    }

    /// Rendered command lines issued so far
    pub fn commands(&self) -> Vec<String> {
        self.issued.lock().iter().map(|c| c.to_string()).collect()
    }

    /// Commands including their stdin
    pub fn issued(&self) -> Vec<ExtCommand> {
        self.issued.lock().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.commands()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, cmd: &ExtCommand) -> Result<ExtCmdOutput> {
        self.issued.lock().push(cmd.clone());
        let line = cmd.to_string();
        let reply = self
            .rules
            .lock()
            .iter()
            .find(|(prefix, _)| line.starts_with(prefix.as_str()))
            .map(|(_, reply)| reply.clone());
        match reply {
            Some(Reply::Output(output)) => Ok(output),
            Some(Reply::Timeout) => Err(Error::ExtCmdTimeout {
                command: line,
                timeout: cmd.timeout.unwrap_or(Duration::from_secs(60)),
            }),
            None => Ok(ExtCmdOutput::default()),
        }
    }
}
