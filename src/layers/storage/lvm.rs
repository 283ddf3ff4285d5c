//! LVM Provider
//!
//! Thick logical volumes inside a volume group, or thin volumes inside a
//! thin pool (`vg/thinpool` backing names).

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

use crate::error::{Error, Result};
use crate::exec::{CommandRunnerRef, ExtCommand};
use crate::kinds::{DeviceLayerKind, DeviceProviderKind};
use crate::layers::storage::{parse_kib, ProviderVolume, ProviderVolumeInfo, StorageProvider};

const DELIMITER: &str = ";";

pub struct LvmProvider {
    runner: CommandRunnerRef,
    thin: bool,
    /// `vg/lv` -> state, filled by prepare
    volumes: Mutex<HashMap<String, ProviderVolumeInfo>>,
}

impl LvmProvider {
    pub fn thick(runner: CommandRunnerRef) -> Self {
        Self {
            runner,
            thin: false,
            volumes: Mutex::new(HashMap::new()),
        }
    }

    pub fn thin(runner: CommandRunnerRef) -> Self {
        Self {
            runner,
            thin: true,
            volumes: Mutex::new(HashMap::new()),
        }
    }

    /// Volume group and, for thin pools, the thin pool name
    fn split_backing(&self, backing_name: &str) -> Result<(String, Option<String>)> {
        if !self.thin {
            return Ok((backing_name.to_string(), None));
        }
        match backing_name.split_once('/') {
            Some((vg, pool)) if !vg.is_empty() && !pool.is_empty() => {
                Ok((vg.to_string(), Some(pool.to_string())))
            }
            _ => Err(Error::Storage {
                layer: DeviceLayerKind::Storage.tag().to_string(),
                reason: format!(
                    "thin pool backing name '{}' must have the form vg/thinpool",
                    backing_name
                ),
            }),
        }
    }

    fn lv_name(volume: &ProviderVolume) -> String {
        match &volume.snapshot {
            Some(snap) => format!("{}_{}", volume.name, snap),
            None => volume.name.clone(),
        }
    }

    fn identifier(&self, volume: &ProviderVolume) -> Result<String> {
        let (vg, _) = self.split_backing(&volume.backing.backing_name)?;
        Ok(format!("{}/{}", vg, Self::lv_name(volume)))
    }

    /// Parse `lvs -o lv_name,lv_path,lv_size,vg_name` output
    fn parse_lvs(stdout: &str) -> HashMap<String, ProviderVolumeInfo> {
        stdout
            .lines()
            .filter_map(|line| {
                let fields: Vec<&str> = line.trim().split(DELIMITER).map(str::trim).collect();
                if fields.len() < 4 || fields[0].is_empty() {
                    return None;
                }
                let size_kib = parse_kib(fields[2])?;
                Some((
                    format!("{}/{}", fields[3], fields[0]),
                    ProviderVolumeInfo {
                        path: fields[1].to_string(),
                        size_kib,
                    },
                ))
            })
            .collect()
    }
}

#[async_trait]
impl StorageProvider for LvmProvider {
    fn kind(&self) -> DeviceProviderKind {
        if self.thin {
            DeviceProviderKind::LvmThin
        } else {
            DeviceProviderKind::Lvm
        }
    }

    async fn prepare(&self, volumes: &[ProviderVolume]) -> Result<()> {
        let mut vgs = BTreeSet::new();
        for volume in volumes {
            vgs.insert(self.split_backing(&volume.backing.backing_name)?.0);
        }
        if vgs.is_empty() {
            return Ok(());
        }
        let output = self
            .runner
            .run_checked(
                &ExtCommand::new("lvs")
                    .args([
                        "-o",
                        "lv_name,lv_path,lv_size,vg_name",
                        "--separator",
                        DELIMITER,
                        "--noheadings",
                        "--units",
                        "k",
                        "--nosuffix",
                    ])
                    .args(vgs),
            )
            .await?;
        let found = Self::parse_lvs(&output.stdout);
        debug!(provider = %self.kind(), volumes = found.len(), "Listed lvm volumes");
        *self.volumes.lock() = found;
        Ok(())
    }

    fn lookup(&self, volume: &ProviderVolume) -> Option<ProviderVolumeInfo> {
        let id = self.identifier(volume).ok()?;
        self.volumes.lock().get(&id).cloned()
    }

    async fn create(&self, volume: &ProviderVolume, size_kib: u64) -> Result<String> {
        let (vg, pool) = self.split_backing(&volume.backing.backing_name)?;
        let lv = Self::lv_name(volume);
        let size = format!("{}k", size_kib);
        let cmd = match pool {
            Some(pool) => ExtCommand::new("lvcreate").args([
                "--virtualsize",
                size.as_str(),
                "--thinpool",
                pool.as_str(),
                "--name",
                lv.as_str(),
                vg.as_str(),
            ]),
            None => ExtCommand::new("lvcreate").args([
                "--size",
                size.as_str(),
                "-n",
                lv.as_str(),
                "-y",
                vg.as_str(),
            ]),
        };
        self.runner.run_checked(&cmd).await?;

        let path = format!("/dev/{}/{}", vg, lv);
        self.volumes.lock().insert(
            format!("{}/{}", vg, lv),
            ProviderVolumeInfo {
                path: path.clone(),
                size_kib,
            },
        );
        Ok(path)
    }

    async fn resize(&self, volume: &ProviderVolume, size_kib: u64) -> Result<()> {
        let id = self.identifier(volume)?;
        self.runner
            .run_checked(&ExtCommand::new("lvresize").args([
                "--size".to_string(),
                format!("{}k", size_kib),
                id.clone(),
                "-f".to_string(),
            ]))
            .await?;
        if let Some(info) = self.volumes.lock().get_mut(&id) {
            info.size_kib = size_kib;
        }
        Ok(())
    }

    async fn delete(&self, volume: &ProviderVolume) -> Result<()> {
        let id = self.identifier(volume)?;
        self.runner
            .run_checked(&ExtCommand::new("lvremove").args(["-f", id.as_str()]))
            .await?;
        self.volumes.lock().remove(&id);
        Ok(())
    }

    async fn create_snapshot(&self, volume: &ProviderVolume) -> Result<()> {
        if !self.thin {
            return Err(Error::Storage {
                layer: DeviceLayerKind::Storage.tag().to_string(),
                reason: "thick lvm volumes do not support snapshots".into(),
            });
        }
        let (vg, _) = self.split_backing(&volume.backing.backing_name)?;
        let source = format!("{}/{}", vg, volume.name);
        let snap = Self::lv_name(volume);
        self.runner
            .run_checked(&ExtCommand::new("lvcreate").args([
                "--snapshot",
                "--setactivationskip",
                "y",
                "--ignoreactivationskip",
                "--activate",
                "y",
                "--name",
                snap.as_str(),
                source.as_str(),
            ]))
            .await?;

        let mut volumes = self.volumes.lock();
        let size_kib = volumes.get(&source).map_or(0, |v| v.size_kib);
        volumes.insert(
            format!("{}/{}", vg, snap),
            ProviderVolumeInfo {
                path: format!("/dev/{}/{}", vg, snap),
                size_kib,
            },
        );
        Ok(())
    }

    async fn query_capacity(&self, backing_name: &str) -> Result<(u64, u64)> {
        let (vg, pool) = self.split_backing(backing_name)?;
        let parse_err = |stdout: &str| Error::Storage {
            layer: DeviceLayerKind::Storage.tag().to_string(),
            reason: format!("unexpected capacity output for {}: '{}'", backing_name, stdout.trim()),
        };

        match pool {
            Some(pool) => {
                let output = self
                    .runner
                    .run_checked(
                        &ExtCommand::new("lvs")
                            .args([
                                "-o",
                                "lv_size,data_percent",
                                "--separator",
                                DELIMITER,
                                "--noheadings",
                                "--units",
                                "k",
                                "--nosuffix",
                            ])
                            .arg(format!("{}/{}", vg, pool)),
                    )
                    .await?;
                let line = output.stdout.trim();
                let (size, percent) = line.split_once(DELIMITER).ok_or_else(|| parse_err(line))?;
                let total = parse_kib(size).ok_or_else(|| parse_err(line))?;
                let used_percent: f64 = percent.trim().parse().map_err(|_| parse_err(line))?;
                let used = (total as f64 * used_percent / 100.0).ceil() as u64;
                Ok((total, total.saturating_sub(used)))
            }
            None => {
                let output = self
                    .runner
                    .run_checked(
                        &ExtCommand::new("vgs")
                            .args([
                                "-o",
                                "vg_size,vg_free",
                                "--separator",
                                DELIMITER,
                                "--noheadings",
                                "--units",
                                "k",
                                "--nosuffix",
                            ])
                            .arg(vg),
                    )
                    .await?;
                let line = output.stdout.trim();
                let (size, free) = line.split_once(DELIMITER).ok_or_else(|| parse_err(line))?;
                Ok((
                    parse_kib(size).ok_or_else(|| parse_err(line))?,
                    parse_kib(free).ok_or_else(|| parse_err(line))?,
                ))
            }
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

    fn volume(provider: DeviceProviderKind, backing: &str) -> ProviderVolume {
        ProviderVolume {
            name: "r0_00000".into(),
            backing: BackingRef {
                pool: "pool".into(),
                provider,
                backing_name: backing.into(),
                granularity_kib: 4096,
            },
            snapshot: None,
        }
    }

    #[test]
    fn test_parse_lvs() {
        let found = LvmProvider::parse_lvs(
            "  r0_00000;/dev/vg0/r0_00000;8192.00;vg0\n  thinpool;;1048576.00;vg0\n\n",
        );
        assert_eq!(found.len(), 2);
        assert_eq!(
            found.get("vg0/r0_00000"),
            Some(&ProviderVolumeInfo {
                path: "/dev/vg0/r0_00000".into(),
                size_kib: 8192
            })
        );
    }

    #[tokio::test]
    async fn test_thin_create() {
        let runner = Arc::new(ScriptedRunner::new());
        let provider = LvmProvider::thin(runner.clone());
        let vol = volume(DeviceProviderKind::LvmThin, "vg0/thinpool");

        let path = provider.create(&vol, 1024).await.unwrap();
        assert_eq!(path, "/dev/vg0/r0_00000");
        assert_eq!(
            runner.commands(),
            vec!["lvcreate --virtualsize 1024k --thinpool thinpool --name r0_00000 vg0"]
        );
        assert_eq!(provider.lookup(&vol).unwrap().size_kib, 1024);

        provider.clear_cache();
        assert!(provider.lookup(&vol).is_none());
    }

    #[tokio::test]
    async fn test_thin_backing_name_requires_pool() {
        let runner = Arc::new(ScriptedRunner::new());
        let provider = LvmProvider::thin(runner.clone());
        let vol = volume(DeviceProviderKind::LvmThin, "vg0");
        assert!(matches!(
            provider.create(&vol, 1024).await,
            Err(Error::Storage { .. })
        ));
        assert!(runner.commands().is_empty());
    }

    #[tokio::test]
    async fn test_prepare_queries_each_volume_group_once() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("lvs", "  r0_00000;/dev/vg0/r0_00000;8192.00;vg0\n");
        let provider = LvmProvider::thick(runner.clone());
        let vol = volume(DeviceProviderKind::Lvm, "vg0");
        let mut other = vol.clone();
        other.name = "r1_00000".into();

        provider.prepare(&[vol.clone(), other.clone()]).await.unwrap();
        assert_eq!(runner.count("lvs"), 1);
        assert!(runner.commands()[0].ends_with("--nosuffix vg0"));
        assert!(provider.lookup(&vol).is_some());
        assert!(provider.lookup(&other).is_none());
    }

    #[tokio::test]
    async fn test_delete_failure_is_reported() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.fail("lvremove", 5, "  Logical volume vg0/r0_00000 contains a filesystem in use.");
        let provider = LvmProvider::thick(runner.clone());
        let err = provider
            .delete(&volume(DeviceProviderKind::Lvm, "vg0"))
            .await
            .unwrap_err();
        match err {
            Error::ExtCmdFailed { stderr, .. } => assert!(stderr.starts_with("Logical volume")),
            other => panic!("unexpected error {:?}", other),
        }
    }
}
