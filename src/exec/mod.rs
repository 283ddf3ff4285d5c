//! External Command Execution
//!
//! The only way layers reach external tools (`dmsetup`, `cryptsetup`,
//! `drbdadm`, `lvm`, `zfs`, `nvme`, `make-bcache`).

pub mod command;
pub mod dry_run;
pub mod system;

#[cfg(test)]
pub mod scripted;

pub use command::{CommandRunner, CommandRunnerRef, ExtCmdOutput, ExtCommand};
pub use dry_run::DryRunRunner;
pub use system::SystemCommandRunner;
