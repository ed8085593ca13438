//! Free disk space probe for the pre-run headroom check.

use std::path::Path;

use sysinfo::Disks;

/// Reports free space on the filesystem holding a path.
pub trait DiskProbe: Send + Sync {
    /// Bytes available to unprivileged users, or `None` if unknown.
    fn available_bytes(&self, path: &Path) -> Option<u64>;
}

/// Probe backed by the mounted disk list.
#[derive(Debug, Default)]
pub struct SysinfoDiskProbe;

impl SysinfoDiskProbe {
    pub fn new() -> Self {
        Self
    }
}

impl DiskProbe for SysinfoDiskProbe {
    fn available_bytes(&self, path: &Path) -> Option<u64> {
        let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        let disks = Disks::new_with_refreshed_list();
        disks
            .list()
            .iter()
            .filter(|d| path.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len())
            .map(|d| d.available_space())
    }
}

/// Probe reporting a fixed amount; for tests and dry runs.
#[derive(Debug, Clone, Copy)]
pub struct FixedDiskProbe(pub u64);

impl DiskProbe for FixedDiskProbe {
    fn available_bytes(&self, _path: &Path) -> Option<u64> {
        Some(self.0)
    }
}
