//! Storage Pool Registry
//!
//! Storage pool records of this node with free-capacity bookkeeping. The
//! worker is the only writer during processing; other readers go through
//! the registry's accessors.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::kinds::DeviceProviderKind;
use crate::tree::volume::BackingRef;

/// Name of the pool every diskless volume draws from
pub const DEFAULT_DISKLESS_POOL: &str = "DfltDisklessStorPool";

/// One storage pool on this node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoragePool {
    pub name: String,
    pub provider: DeviceProviderKind,
    /// Volume group, `vg/thinpool` or zpool dataset
    #[serde(default)]
    pub backing_name: String,
    /// Overrides the provider's default allocation granularity
    #[serde(default)]
    pub granularity_kib: Option<u64>,
    #[serde(default)]
    pub total_kib: u64,
    #[serde(default)]
    pub free_kib: u64,
}

impl StoragePool {
    pub fn diskless(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            provider: DeviceProviderKind::Diskless,
            backing_name: String::new(),
            granularity_kib: None,
            total_kib: 0,
            free_kib: 0,
        }
    }

    /// Effective allocation granularity
    pub fn granularity_kib(&self) -> u64 {
        self.granularity_kib
            .unwrap_or_else(|| self.provider.capabilities().default_granularity_kib)
            .max(1)
    }

    pub fn backing_ref(&self) -> BackingRef {
        BackingRef {
            pool: self.name.clone(),
            provider: self.provider,
            backing_name: self.backing_name.clone(),
            granularity_kib: self.granularity_kib(),
        }
    }
}

/// Registry of the storage pools on this node
#[derive(Debug)]
pub struct StoragePoolRegistry {
    pools: DashMap<String, StoragePool>,
}

impl Default for StoragePoolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StoragePoolRegistry {
    /// Create a registry holding only the default diskless pool
    pub fn new() -> Self {
        let pools = DashMap::new();
        pools.insert(
            DEFAULT_DISKLESS_POOL.to_string(),
            StoragePool::diskless(DEFAULT_DISKLESS_POOL),
        );
        Self { pools }
    }

    pub fn with_pools(pools: impl IntoIterator<Item = StoragePool>) -> Self {
        let registry = Self::new();
        for pool in pools {
            registry.register(pool);
        }
        registry
    }

    pub fn register(&self, pool: StoragePool) {
        debug!(pool = %pool.name, provider = %pool.provider, "Registered storage pool");
        self.pools.insert(pool.name.clone(), pool);
    }

    pub fn get(&self, name: &str) -> Result<StoragePool> {
        self.pools
            .get(name)
            .map(|p| p.value().clone())
            .ok_or_else(|| Error::StoragePoolNotFound {
                pool: name.to_string(),
            })
    }

    pub fn backing_ref(&self, name: &str) -> Result<BackingRef> {
        Ok(self.get(name)?.backing_ref())
    }

    pub fn list(&self) -> Vec<StoragePool> {
        let mut pools: Vec<_> = self.pools.iter().map(|p| p.value().clone()).collect();
        pools.sort_by(|a, b| a.name.cmp(&b.name));
        pools
    }

    /// Take capacity out of a pool.
    ///
    /// Thin and diskless pools are not checked against their free capacity.
    pub fn reserve(&self, name: &str, kib: u64) -> Result<()> {
        let mut pool = self
            .pools
            .get_mut(name)
            .ok_or_else(|| Error::StoragePoolNotFound {
                pool: name.to_string(),
            })?;
        let caps = pool.provider.capabilities();
        if !caps.has_backing_device {
            return Ok(());
        }
        if !caps.thin && pool.free_kib < kib {
            return Err(Error::InsufficientCapacity {
                pool: name.to_string(),
                requested_kib: kib,
                free_kib: pool.free_kib,
            });
        }
        pool.free_kib = pool.free_kib.saturating_sub(kib);
        Ok(())
    }

    /// Return capacity to a pool
    pub fn release(&self, name: &str, kib: u64) -> Result<()> {
        let mut pool = self
            .pools
            .get_mut(name)
            .ok_or_else(|| Error::StoragePoolNotFound {
                pool: name.to_string(),
            })?;
        if pool.provider.capabilities().has_backing_device {
            pool.free_kib = pool.free_kib.saturating_add(kib).min(pool.total_kib);
        }
        Ok(())
    }

    /// Replace the capacity counters with values queried from the provider
    pub fn update_capacity(&self, name: &str, total_kib: u64, free_kib: u64) -> Result<()> {
        let mut pool = self
            .pools
            .get_mut(name)
            .ok_or_else(|| Error::StoragePoolNotFound {
                pool: name.to_string(),
            })?;
        pool.total_kib = total_kib;
        pool.free_kib = free_kib.min(total_kib);
        Ok(())
    }
}
