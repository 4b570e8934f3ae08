//! Best-effort resource usage probes.
//!
//! Per-task CPU and memory accounting comes from `getrusage(RUSAGE_CHILDREN)`
//! deltas taken around each task execution; peak job memory comes from the
//! container cgroup accounting hierarchy. Absence of any of these is never an
//! error.

use std::fs;
use std::path::Path;

use sysinfo::CpuRefreshKind;
use sysinfo::System;

use crate::report::CpuInfo;

/// Candidate cgroup files holding the peak memory usage, in bytes.
///
/// The v2 path is tried first, then the v1 accounting file.
const PEAK_MEMORY_FILES: &[&str] = &[
    "/sys/fs/cgroup/memory.peak",
    "/sys/fs/cgroup/memory/memory.max_usage_in_bytes",
];

/// A snapshot of the accumulated resource usage of reaped child processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChildUsage {
    /// The accumulated user plus system CPU time, in seconds.
    pub cpu_secs: f64,
    /// The maximum resident set size of any reaped child, in KB.
    pub max_rss_kb: u64,
}

impl ChildUsage {
    /// Takes a snapshot of `getrusage(RUSAGE_CHILDREN)`.
    pub fn snapshot() -> Self {
        let mut ru = std::mem::MaybeUninit::<libc::rusage>::zeroed();
        // SAFETY: getrusage writes a complete rusage into the provided buffer
        let rc = unsafe { libc::getrusage(libc::RUSAGE_CHILDREN, ru.as_mut_ptr()) };
        if rc != 0 {
            return Self::default();
        }
        // SAFETY: a zero return code means the buffer was initialized
        let ru = unsafe { ru.assume_init() };

        let seconds = |tv: libc::timeval| tv.tv_sec as f64 + tv.tv_usec as f64 / 1_000_000.0;
        Self {
            cpu_secs: seconds(ru.ru_utime) + seconds(ru.ru_stime),
            // ru_maxrss is reported in KB on Linux
            max_rss_kb: ru.ru_maxrss.max(0) as u64,
        }
    }

    /// Computes the CPU time consumed since an earlier snapshot.
    pub fn cpu_since(&self, earlier: &Self) -> f64 {
        (self.cpu_secs - earlier.cpu_secs).max(0.0)
    }
}

/// Samples the peak memory usage of the job from the cgroup hierarchy, in KB.
///
/// Returns `None` when no accounting file is readable.
pub fn peak_memory_kb() -> Option<u64> {
    PEAK_MEMORY_FILES
        .iter()
        .find_map(|path| peak_memory_from(Path::new(path)))
}

/// Reads a peak-memory-in-bytes accounting file and converts to KB.
fn peak_memory_from(path: &Path) -> Option<u64> {
    let contents = fs::read_to_string(path).ok()?;
    let bytes: u64 = contents.trim().parse().ok()?;
    Some(bytes / 1024)
}

/// Gets the host CPU model and clock speed.
pub fn cpu_info() -> CpuInfo {
    let mut system = System::new();
    system.refresh_cpu_list(CpuRefreshKind::everything());

    match system.cpus().first() {
        Some(cpu) => CpuInfo {
            model: Some(cpu.brand().trim().to_string()),
            clock_mhz: Some(cpu.frequency()),
        },
        None => CpuInfo::default(),
    }
}
