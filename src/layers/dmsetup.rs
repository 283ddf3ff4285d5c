//! Device-Mapper Helpers
//!
//! Thin wrappers around `dmsetup` shared by the cache-family and LUKS
//! layers.

use std::collections::BTreeSet;
use tracing::debug;

use crate::error::Result;
use crate::exec::{CommandRunner, ExtCommand};

/// Path of a device-mapper device
pub fn device_path(name: &str) -> String {
    format!("/dev/mapper/{}", name)
}

/// 512-byte sectors of a KiB size
pub fn sectors(kib: u64) -> u64 {
    kib.saturating_mul(2)
}

/// Names of the existing devices of a target type
pub async fn list(runner: &dyn CommandRunner, target: &str) -> Result<BTreeSet<String>> {
    let output = runner
        .run_checked(&ExtCommand::new("dmsetup").args(["ls", "--target", target]))
        .await?;
    Ok(parse_ls(&output.stdout))
}

/// Parse `dmsetup ls` output, e.g. `r0_00000\t(253:3)`
pub(crate) fn parse_ls(stdout: &str) -> BTreeSet<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("No devices found"))
        .filter_map(|line| line.split_whitespace().next())
        .map(str::to_string)
        .collect()
}

pub async fn create(runner: &dyn CommandRunner, name: &str, table: &str) -> Result<()> {
    debug!(name, table, "Creating device-mapper device");
    runner
        .run_checked(
            &ExtCommand::new("dmsetup")
                .args(["create", name, "--table"])
                .arg(table),
        )
        .await?;
    Ok(())
}

pub async fn remove(runner: &dyn CommandRunner, name: &str) -> Result<()> {
    debug!(name, "Removing device-mapper device");
    runner
        .run_checked(&ExtCommand::new("dmsetup").args(["remove", "--retry", name]))
        .await?;
    Ok(())
}

pub async fn message(runner: &dyn CommandRunner, name: &str, message: &str) -> Result<()> {
    runner
        .run_checked(&ExtCommand::new("dmsetup").args(["message", name, "0", message]))
        .await?;
    Ok(())
}

pub async fn suspend(runner: &dyn CommandRunner, device: &str) -> Result<()> {
    runner
        .run_checked(&ExtCommand::new("dmsetup").args(["suspend", device]))
        .await?;
    Ok(())
}

pub async fn resume(runner: &dyn CommandRunner, device: &str) -> Result<()> {
    runner
        .run_checked(&ExtCommand::new("dmsetup").args(["resume", device]))
        .await?;
    Ok(())
}
