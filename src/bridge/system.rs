//! Synchronous memory and storage probes.
//!
//! Every call reads the host OS afresh; nothing is cached between calls.

use std::path::{Path, PathBuf};

use log::debug;
use sysinfo::{Disks, System};

use super::error::{BridgeError, BridgeResult};
use super::models::{DeviceMemory, ResourceSnapshot};

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Side-effect-free queries for device memory and storage statistics.
pub trait ResourceProbe: Send + Sync {
    fn device_memory(&self) -> BridgeResult<DeviceMemory>;

    fn used_memory(&self) -> BridgeResult<u64>;

    fn free_storage(&self) -> BridgeResult<u64>;

    fn total_storage(&self) -> BridgeResult<u64>;

    fn snapshot(&self) -> BridgeResult<ResourceSnapshot> {
        let memory = self.device_memory()?;
        Ok(ResourceSnapshot {
            total_memory_mb: memory.total_mb,
            used_memory_mb: memory.total_mb.saturating_sub(memory.avail_mb),
            free_storage_mb: self.free_storage()?,
            total_storage_mb: self.total_storage()?,
        })
    }
}

/// Probe backed by `sysinfo`, measuring the volume that holds `storage_path`.
#[derive(Debug, Clone)]
pub struct SystemProbe {
    storage_path: PathBuf,
}

impl SystemProbe {
    pub fn new(storage_path: impl Into<PathBuf>) -> Self {
        Self {
            storage_path: storage_path.into(),
        }
    }

    pub fn storage_path(&self) -> &Path {
        &self.storage_path
    }

    /// (total, available) physical memory in bytes.
    fn read_memory(&self) -> BridgeResult<(u64, u64)> {
        let mut sys = System::new();
        sys.refresh_memory();

        let total = sys.total_memory();
        if total == 0 {
            return Err(BridgeError::ResourceUnavailable(
                "memory statistics unavailable".to_string(),
            ));
        }
        Ok((total, sys.available_memory()))
    }

    /// (available, total) bytes of the volume containing `storage_path`.
    fn read_volume(&self) -> BridgeResult<(u64, u64)> {
        let path = self.storage_path.canonicalize().map_err(|e| {
            BridgeError::ResourceUnavailable(format!(
                "storage path {} not readable: {e}",
                self.storage_path.display()
            ))
        })?;

        let disks = Disks::new_with_refreshed_list();
        // Longest mount point that prefixes the path is the volume holding it
        let disk = disks
            .list()
            .iter()
            .filter(|d| path.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len())
            .ok_or_else(|| {
                BridgeError::ResourceUnavailable(format!(
                    "no mounted volume holds {}",
                    path.display()
                ))
            })?;

        debug!(
            "Storage probe: {} on {}",
            path.display(),
            disk.mount_point().display()
        );

        if disk.total_space() == 0 {
            return Err(BridgeError::ResourceUnavailable(format!(
                "volume {} reports zero capacity",
                disk.mount_point().display()
            )));
        }
        Ok((disk.available_space(), disk.total_space()))
    }
}

impl ResourceProbe for SystemProbe {
    fn device_memory(&self) -> BridgeResult<DeviceMemory> {
        let (total, avail) = self.read_memory()?;
        Ok(DeviceMemory {
            total_mb: to_mb(total),
            avail_mb: to_mb(avail),
        })
    }

    fn used_memory(&self) -> BridgeResult<u64> {
        let (total, avail) = self.read_memory()?;
        Ok(to_mb(total.saturating_sub(avail)))
    }

    fn free_storage(&self) -> BridgeResult<u64> {
        self.read_volume().map(|(avail, _)| to_mb(avail))
    }

    fn total_storage(&self) -> BridgeResult<u64> {
        self.read_volume().map(|(_, total)| to_mb(total))
    }
}

fn to_mb(bytes: u64) -> u64 {
    bytes / BYTES_PER_MB
}
