//! Host resource gauges reported with every heartbeat.
//!
//! CPU and memory come from `sysinfo`. CPU usage is measured between two
//! consecutive refreshes, so the first collection reports no CPU figure.
//! Disk figures come from `statvfs` on the base path; a path that cannot be
//! measured reports `None` instead of failing the heartbeat.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use srtcast_db::models::server::ServerHeartbeat;
use sysinfo::System;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Filesystem capacity of the base path.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiskStats {
    pub total_bytes: u64,
    pub used_bytes: u64,
}

struct HostProbe {
    system: System,
    cpu_primed: bool,
}

pub struct SystemCollector {
    base_path: PathBuf,
    host: Mutex<HostProbe>,
}

impl SystemCollector {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            host: Mutex::new(HostProbe {
                system: System::new(),
                cpu_primed: false,
            }),
        }
    }

    /// Collect a snapshot. Blocking: call from `spawn_blocking`.
    pub fn collect(&self) -> ServerHeartbeat {
        let (cpu_usage, memory_usage) = {
            let mut host = self.host.lock().unwrap_or_else(PoisonError::into_inner);
            host.system.refresh_cpu_usage();
            host.system.refresh_memory();

            let cpu = host
                .cpu_primed
                .then(|| f64::from(host.system.global_cpu_usage()));
            host.cpu_primed = true;
            let memory = percent(host.system.used_memory(), host.system.total_memory());
            (cpu, memory)
        };

        let disk = disk_stats(&self.base_path);

        ServerHeartbeat {
            cpu_usage: cpu_usage.map(round1),
            memory_usage: memory_usage.map(round1),
            disk_usage: disk
                .and_then(|d| percent(d.used_bytes, d.total_bytes))
                .map(round1),
            disk_total_gb: disk.map(|d| round2(d.total_bytes as f64 / BYTES_PER_GB)),
            disk_used_gb: disk.map(|d| round2(d.used_bytes as f64 / BYTES_PER_GB)),
        }
    }
}

/// `used` as a percentage of `total`; `None` when nothing is reported.
pub fn percent(used: u64, total: u64) -> Option<f64> {
    (total > 0).then(|| used.min(total) as f64 / total as f64 * 100.0)
}

/// Capacity of the filesystem holding `path`.
pub fn disk_stats(path: &Path) -> Option<DiskStats> {
    use std::ffi::CString;
    use std::mem::MaybeUninit;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes()).ok()?;
    let mut stat = MaybeUninit::<libc::statvfs>::uninit();

    // SAFETY: `c_path` is a valid NUL-terminated string and `stat` points to
    // writable memory of the right size.
    let ret = unsafe { libc::statvfs(c_path.as_ptr(), stat.as_mut_ptr()) };
    if ret != 0 {
        return None;
    }
    // SAFETY: statvfs returned 0, so the struct is initialised.
    let stat = unsafe { stat.assume_init() };

    let block_size = stat.f_frsize as u64;
    let total = stat.f_blocks as u64 * block_size;
    let free = stat.f_bavail as u64 * block_size;
    Some(DiskStats {
        total_bytes: total,
        used_bytes: total.saturating_sub(free),
    })
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}
