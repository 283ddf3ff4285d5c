//! Storage Provider Kinds
//!
//! Concrete raw-storage backends the storage layer delegates to.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Storage provider kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceProviderKind {
    /// Thick LVM logical volumes
    Lvm,
    /// LVM thin volumes inside a thin pool
    LvmThin,
    /// ZFS zvols
    Zfs,
    /// Sparse ZFS zvols
    ZfsThin,
    /// No local backing device
    Diskless,
    /// Volume exported by a vendor REST target
    RestTarget,
    /// Volume attached from a vendor REST target
    RestInitiator,
}

/// Capability flags of a provider kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderCapabilities {
    pub resize: bool,
    pub snapshots: bool,
    pub thin: bool,
    pub has_backing_device: bool,
    /// Allocation granularity used when the pool does not override it
    pub default_granularity_kib: u64,
    pub external_tools: &'static [&'static str],
    pub requires_rest_client: bool,
}

impl DeviceProviderKind {
    pub const ALL: [DeviceProviderKind; 7] = [
        DeviceProviderKind::Lvm,
        DeviceProviderKind::LvmThin,
        DeviceProviderKind::Zfs,
        DeviceProviderKind::ZfsThin,
        DeviceProviderKind::Diskless,
        DeviceProviderKind::RestTarget,
        DeviceProviderKind::RestInitiator,
    ];

    /// Capability record for this provider kind
    pub fn capabilities(&self) -> ProviderCapabilities {
        match self {
            DeviceProviderKind::Lvm => ProviderCapabilities {
                resize: true,
                snapshots: false,
                thin: false,
                has_backing_device: true,
                default_granularity_kib: 4096,
                external_tools: &["lvm"],
                requires_rest_client: false,
            },
            DeviceProviderKind::LvmThin => ProviderCapabilities {
                resize: true,
                snapshots: true,
                thin: true,
                has_backing_device: true,
                default_granularity_kib: 64,
                external_tools: &["lvm"],
                requires_rest_client: false,
            },
            DeviceProviderKind::Zfs => ProviderCapabilities {
                resize: true,
                snapshots: true,
                thin: false,
                has_backing_device: true,
                default_granularity_kib: 8,
                external_tools: &["zfs", "zpool"],
                requires_rest_client: false,
            },
            DeviceProviderKind::ZfsThin => ProviderCapabilities {
                resize: true,
                snapshots: true,
                thin: true,
                has_backing_device: true,
                default_granularity_kib: 8,
                external_tools: &["zfs", "zpool"],
                requires_rest_client: false,
            },
            DeviceProviderKind::Diskless => ProviderCapabilities {
                resize: true,
                snapshots: false,
                thin: false,
                has_backing_device: false,
                default_granularity_kib: 1,
                external_tools: &[],
                requires_rest_client: false,
            },
            DeviceProviderKind::RestTarget | DeviceProviderKind::RestInitiator => {
                ProviderCapabilities {
                    resize: true,
                    snapshots: false,
                    thin: false,
                    has_backing_device: true,
                    default_granularity_kib: 1,
                    external_tools: &[],
                    requires_rest_client: true,
                }
            }
        }
    }

    pub fn is_diskless(&self) -> bool {
        matches!(self, DeviceProviderKind::Diskless)
    }
}

impl fmt::Display for DeviceProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceProviderKind::Lvm => write!(f, "lvm"),
            DeviceProviderKind::LvmThin => write!(f, "lvm_thin"),
            DeviceProviderKind::Zfs => write!(f, "zfs"),
            DeviceProviderKind::ZfsThin => write!(f, "zfs_thin"),
            DeviceProviderKind::Diskless => write!(f, "diskless"),
            DeviceProviderKind::RestTarget => write!(f, "rest_target"),
            DeviceProviderKind::RestInitiator => write!(f, "rest_initiator"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thin_providers() {
        let thin: Vec<_> = DeviceProviderKind::ALL
            .iter()
            .filter(|p| p.capabilities().thin)
            .collect();
        assert_eq!(thin, vec![&DeviceProviderKind::LvmThin, &DeviceProviderKind::ZfsThin]);
    }

    #[test]
    fn test_diskless_has_no_backing_device() {
        let caps = DeviceProviderKind::Diskless.capabilities();
        assert!(!caps.has_backing_device);
        assert!(DeviceProviderKind::Diskless.is_diskless());
        assert!(DeviceProviderKind::RestTarget.capabilities().requires_rest_client);
    }

    #[test]
    fn test_display_matches_serde() {
        for kind in DeviceProviderKind::ALL {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind));
        }
    }

    #[test]
    fn test_pool_descriptions_use_snake_case_names() {
        let kinds: Vec<DeviceProviderKind> =
            serde_yaml::from_str("[lvm, lvm_thin, zfs_thin, rest_target]").unwrap();
        assert_eq!(
            kinds,
            vec![
                DeviceProviderKind::Lvm,
                DeviceProviderKind::LvmThin,
                DeviceProviderKind::ZfsThin,
                DeviceProviderKind::RestTarget,
            ]
        );
        assert!(serde_yaml::from_str::<DeviceProviderKind>("lvmthin").is_err());
    }
}
