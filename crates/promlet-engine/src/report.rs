//! The structured result document and the process exit-code contract.
//!
//! The result document is the executor's sole structured output: exactly one
//! is written per invocation, at a path incorporating the task-group id and
//! node index so that the nodes of a multi-node job never clobber each other.
//! An empty placeholder is written as soon as the paths are known and is
//! overwritten with the real document at the end, so a result file exists even
//! when a phase fails immediately.

use std::fs;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;
use tracing::info;

/// The status of a storage mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MountStatus {
    /// The storage was mounted successfully.
    Success,
    /// The storage failed to mount.
    Failed,
}

/// The outcome of mounting one declared storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MountResult {
    /// The declared mountpoint.
    pub mountpoint: String,
    /// The status of the mount.
    pub status: MountStatus,
}

/// The status of staging in one artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StageInStatus {
    /// The artifact was staged successfully.
    Success,
    /// The artifact could not be downloaded.
    FailedDownload,
    /// The artifact downloaded but could not be decompressed or extracted.
    FailedUncompress,
}

/// The outcome of staging in one artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageInResult {
    /// The artifact name.
    pub name: String,
    /// The status of the stage-in.
    pub status: StageInStatus,
    /// The elapsed wall time, in seconds.
    pub time: f64,
}

/// The image pull status recorded for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ImagePullStatus {
    /// The image was freshly downloaded or pulled.
    Completed,
    /// The image was reused from a cache (in-job or node-local).
    Cached,
    /// The image could not be resolved.
    Failed,
}

/// Metrics recorded for one executed task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMetrics {
    /// The exit code of the final attempt.
    pub exit_code: i32,
    /// The wall time consumed by the final attempt, in seconds.
    pub wall_time_usage: f64,
    /// The user plus system CPU time consumed, in seconds.
    pub cpu_time_usage: f64,
    /// The maximum resident set size observed, in KB.
    #[serde(rename = "maxResidentSetSizeKB")]
    pub max_resident_set_size_kb: u64,
    /// The number of retries performed (total attempts minus one).
    pub retries: u32,
    /// The image pull status.
    pub image_pull_status: ImagePullStatus,
    /// The time spent resolving the image, in seconds.
    pub image_pull_time: f64,
    /// The resolved SHA-256 checksum of the image, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_sha256: Option<String>,
    /// Whether the task exceeded its wall-time budget.
    pub timed_out: bool,
}

/// A trailing synthetic entry marking that the job's overall wall-time limit
/// was exceeded.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalltimeExceeded {
    /// Always `true`; present only when the limit was exceeded.
    pub job_walltime_limit_exceeded: bool,
}

/// A trailing synthetic entry reporting the peak memory usage of the job,
/// sampled from the container cgroup accounting hierarchy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeakMemory {
    /// The peak memory usage, in KB.
    #[serde(rename = "peakMemoryUsageKB")]
    pub peak_memory_usage_kb: u64,
}

/// One entry in the `tasks` array of the result document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TaskEntry {
    /// Metrics for an executed task.
    Metrics(TaskMetrics),
    /// The job wall-time limit was exceeded.
    Walltime(WalltimeExceeded),
    /// The peak memory usage of the job.
    PeakMemory(PeakMemory),
}

/// The status of staging out one declared output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StageOutStatus {
    /// The output was uploaded successfully.
    Success,
    /// No file matching the declared name exists.
    FailedNoSuchFile,
    /// The output directory could not be archived.
    FailedTarCreation,
    /// The output could not be uploaded.
    FailedUpload,
}

/// The outcome of staging out one declared output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageOutItem {
    /// The declared output name.
    pub name: String,
    /// The status of the stage-out.
    pub status: StageOutStatus,
    /// The elapsed wall time, in seconds.
    pub time: f64,
}

/// The stage-out section of the result document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageOutResult {
    /// Outcomes for declared output files.
    pub files: Vec<StageOutItem>,
    /// Outcomes for declared output directories.
    pub directories: Vec<StageOutItem>,
}

/// An echo of the provisioned resources, for accounting.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Provisioned {
    /// The provisioned CPU cores.
    pub cpus: u32,
    /// The provisioned memory, in GB.
    pub memory: u64,
    /// The provisioned disk, in GB.
    pub disk: u64,
    /// The execution site name assigned by the scheduler.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub site: Option<String>,
}

/// Information about the host CPU.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuInfo {
    /// The CPU model name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// The CPU clock speed, in MHz.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clock_mhz: Option<u64>,
}

/// The complete result document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    /// Storage mount outcomes.
    pub mounts: Vec<MountResult>,
    /// Stage-in outcomes, in declared order up to the first failure.
    pub stagein: Vec<StageInResult>,
    /// Task metrics plus trailing synthetic entries.
    pub tasks: Vec<TaskEntry>,
    /// Stage-out outcomes.
    pub stageout: StageOutResult,
    /// An echo of the provisioned resources.
    pub provisioned: Provisioned,
    /// Host CPU information.
    pub cpu: CpuInfo,
}

impl JobResult {
    /// Writes the result document as JSON to the given path.
    ///
    /// An existing file at the path is overwritten; this is how the initial
    /// placeholder is replaced by the final document.
    pub fn write(&self, path: &Path) -> Result<()> {
        let file = File::create(path).with_context(|| {
            format!(
                "failed to create result file `{path}`",
                path = path.display()
            )
        })?;

        serde_json::to_writer(BufWriter::new(file), self).with_context(|| {
            format!(
                "failed to serialize result file `{path}`",
                path = path.display()
            )
        })?;

        info!("wrote result document `{path}`", path = path.display());
        Ok(())
    }

    /// Writes an empty placeholder document, ensuring a valid result file
    /// exists even if the process later terminates abnormally.
    pub fn write_placeholder(path: &Path) -> Result<()> {
        Self::default().write(path)
    }

    /// Writes a best-effort placeholder if no result file exists yet.
    ///
    /// Used by the outermost guard; failure here is ignored as the process is
    /// already exiting abnormally.
    pub fn ensure_exists(path: &Path) {
        if fs::metadata(path).is_err() {
            let _ = Self::write_placeholder(path);
        }
    }
}

/// The per-phase outcomes that determine the process exit code.
#[derive(Debug, Clone, Copy)]
pub struct PhaseOutcomes {
    /// Whether every declared mount succeeded.
    pub mounted: bool,
    /// Whether stage-in succeeded.
    pub staged_in: bool,
    /// Whether every required task succeeded, after applying the
    /// `reportJobSuccessOnTaskFailure` override.
    pub tasks_succeeded: bool,
    /// Whether stage-out succeeded.
    pub staged_out: bool,
}

impl PhaseOutcomes {
    /// Computes the process exit code: 0 requires every phase to have
    /// succeeded; anything else is 1.
    pub fn exit_code(&self) -> i32 {
        if self.mounted && self.staged_in && self.tasks_succeeded && self.staged_out {
            0
        } else {
            1
        }
    }
}
