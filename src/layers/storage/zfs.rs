//! ZFS Provider
//!
//! zvols below a dataset, optionally sparse.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

use crate::error::{Error, Result};
use crate::exec::{CommandRunnerRef, ExtCommand};
use crate::kinds::{DeviceLayerKind, DeviceProviderKind};
use crate::layers::storage::{ProviderVolume, ProviderVolumeInfo, StorageProvider};

pub struct ZfsProvider {
    runner: CommandRunnerRef,
    sparse: bool,
    /// `dataset/zvol[@snap]` -> state, filled by prepare
    volumes: Mutex<HashMap<String, ProviderVolumeInfo>>,
}

impl ZfsProvider {
    pub fn new(runner: CommandRunnerRef, sparse: bool) -> Self {
        Self {
            runner,
            sparse,
            volumes: Mutex::new(HashMap::new()),
        }
    }

    fn zvol(volume: &ProviderVolume) -> String {
        format!("{}/{}", volume.backing.backing_name, volume.name)
    }

    fn identifier(volume: &ProviderVolume) -> String {
        match &volume.snapshot {
            Some(snap) => format!("{}@{}", Self::zvol(volume), snap),
            None => Self::zvol(volume),
        }
    }

    fn bytes_to_kib(bytes: u64) -> u64 {
        bytes.div_ceil(1024)
    }

    /// Parse `zfs list -H -p -o name,volsize,type` output
    fn parse_list(stdout: &str) -> HashMap<String, ProviderVolumeInfo> {
        stdout
            .lines()
            .filter_map(|line| {
                let mut fields = line.split('\t').map(str::trim);
                let name = fields.next().filter(|n| !n.is_empty())?;
                let size_kib = fields
                    .next()
                    .and_then(|v| v.parse::<u64>().ok())
                    .map_or(0, Self::bytes_to_kib);
                Some((
                    name.to_string(),
                    ProviderVolumeInfo {
                        path: format!("/dev/zvol/{}", name),
                        size_kib,
                    },
                ))
            })
            .collect()
    }

    fn storage_err(reason: String) -> Error {
        Error::Storage {
            layer: DeviceLayerKind::Storage.tag().to_string(),
            reason,
        }
    }
}

#[async_trait]
impl StorageProvider for ZfsProvider {
    fn kind(&self) -> DeviceProviderKind {
        if self.sparse {
            DeviceProviderKind::ZfsThin
        } else {
            DeviceProviderKind::Zfs
        }
    }

    async fn prepare(&self, volumes: &[ProviderVolume]) -> Result<()> {
        let datasets: BTreeSet<&str> = volumes
            .iter()
            .map(|v| v.backing.backing_name.as_str())
            .collect();
        if datasets.is_empty() {
            return Ok(());
        }
        let output = self
            .runner
            .run_checked(
                &ExtCommand::new("zfs")
                    .args([
                        "list",
                        "-r",
                        "-H",
                        "-p",
                        "-o",
                        "name,volsize,type",
                        "-t",
                        "volume,snapshot",
                    ])
                    .args(datasets),
            )
            .await?;
        let found = Self::parse_list(&output.stdout);
        debug!(provider = %self.kind(), volumes = found.len(), "Listed zfs volumes");
        *self.volumes.lock() = found;
        Ok(())
    }

    fn lookup(&self, volume: &ProviderVolume) -> Option<ProviderVolumeInfo> {
        self.volumes.lock().get(&Self::identifier(volume)).cloned()
    }

    async fn create(&self, volume: &ProviderVolume, size_kib: u64) -> Result<String> {
        let id = Self::zvol(volume);
        let mut cmd = ExtCommand::new("zfs").arg("create");
        if self.sparse {
            cmd = cmd.arg("-s");
        }
        cmd = cmd.arg("-V").arg(format!("{}KB", size_kib)).arg(id.as_str());
        self.runner.run_checked(&cmd).await?;

        let path = format!("/dev/zvol/{}", id);
        self.volumes.lock().insert(
            id,
            ProviderVolumeInfo {
                path: path.clone(),
                size_kib,
            },
        );
        Ok(path)
    }

    async fn resize(&self, volume: &ProviderVolume, size_kib: u64) -> Result<()> {
        let id = Self::zvol(volume);
        self.runner
            .run_checked(&ExtCommand::new("zfs").args([
                "set".to_string(),
                format!("volsize={}KB", size_kib),
                id.clone(),
            ]))
            .await?;
        if let Some(info) = self.volumes.lock().get_mut(&id) {
            info.size_kib = size_kib;
        }
        Ok(())
    }

    async fn delete(&self, volume: &ProviderVolume) -> Result<()> {
        let id = Self::identifier(volume);
        self.runner
            .run_checked(&ExtCommand::new("zfs").args(["destroy", id.as_str()]))
            .await?;
        self.volumes.lock().remove(&id);
        Ok(())
    }

    async fn create_snapshot(&self, volume: &ProviderVolume) -> Result<()> {
        if volume.snapshot.is_none() {
            return Err(Error::Implementation(format!(
                "snapshot requested for {} without a snapshot name",
                Self::zvol(volume)
            )));
        }
        let id = Self::identifier(volume);
        self.runner
            .run_checked(&ExtCommand::new("zfs").args(["snapshot", id.as_str()]))
            .await?;

        let mut volumes = self.volumes.lock();
        let size_kib = volumes.get(&Self::zvol(volume)).map_or(0, |v| v.size_kib);
        volumes.insert(
            id.clone(),
            ProviderVolumeInfo {
                path: format!("/dev/zvol/{}", id),
                size_kib,
            },
        );
        Ok(())
    }

    async fn query_capacity(&self, backing_name: &str) -> Result<(u64, u64)> {
        let output = self
            .runner
            .run_checked(&ExtCommand::new("zfs").args([
                "get",
                "-Hp",
                "-o",
                "value",
                "available,used",
                backing_name,
            ]))
            .await?;
        let values: Vec<u64> = output
            .stdout_lines()
            .filter_map(|l| l.parse().ok())
            .collect();
        match values.as_slice() {
            [available, used] => Ok((
                Self::bytes_to_kib(available + used),
                Self::bytes_to_kib(*available),
            )),
            _ => Err(Self::storage_err(format!(
                "unexpected capacity output for {}: '{}'",
                backing_name,
                output.stdout.trim()
            ))),
        }
    }

    fn clear_cache(&self) {
        self.volumes.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::scripted::ScriptedRunner;
    use crate::tree::volume::BackingRef;
    use std::sync::Arc;

    fn volume(snapshot: Option<&str>) -> ProviderVolume {
        ProviderVolume {
            name: "r0_00000".into(),
            backing: BackingRef {
                pool: "zfs".into(),
                provider: DeviceProviderKind::ZfsThin,
                backing_name: "tank/ls".into(),
                granularity_kib: 8,
            },
            snapshot: snapshot.map(str::to_string),
        }
    }

    #[test]
    fn test_parse_list() {
        let found = ZfsProvider::parse_list(
            "tank/ls/r0_00000\t1073741824\tvolume\ntank/ls/r0_00000@s1\t1073741824\tsnapshot\n",
        );
        assert_eq!(found["tank/ls/r0_00000"].size_kib, 1048576);
        assert_eq!(found["tank/ls/r0_00000@s1"].path, "/dev/zvol/tank/ls/r0_00000@s1");
    }

    #[tokio::test]
    async fn test_sparse_create_and_resize() {
        let runner = Arc::new(ScriptedRunner::new());
        let provider = ZfsProvider::new(runner.clone(), true);
        let vol = volume(None);

        let path = provider.create(&vol, 4096).await.unwrap();
        assert_eq!(path, "/dev/zvol/tank/ls/r0_00000");
        provider.resize(&vol, 8192).await.unwrap();
        assert_eq!(
            runner.commands(),
            vec![
                "zfs create -s -V 4096KB tank/ls/r0_00000",
                "zfs set volsize=8192KB tank/ls/r0_00000",
            ]
        );
        assert_eq!(provider.lookup(&vol).unwrap().size_kib, 8192);
    }

    #[tokio::test]
    async fn test_snapshot_lifecycle() {
        let runner = Arc::new(ScriptedRunner::new());
        let provider = ZfsProvider::new(runner.clone(), false);
        let snap = volume(Some("s1"));

        provider.create_snapshot(&snap).await.unwrap();
        assert!(provider.lookup(&snap).is_some());
        provider.delete(&snap).await.unwrap();
        assert!(provider.lookup(&snap).is_none());
        assert_eq!(
            runner.commands(),
            vec![
                "zfs snapshot tank/ls/r0_00000@s1",
                "zfs destroy tank/ls/r0_00000@s1",
            ]
        );
    }

    #[tokio::test]
    async fn test_capacity_output_must_have_two_values() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("zfs get", "1024\n");
        let provider = ZfsProvider::new(runner.clone(), false);
        assert!(matches!(
            provider.query_capacity("tank").await,
            Err(Error::Storage { .. })
        ));
    }
}
