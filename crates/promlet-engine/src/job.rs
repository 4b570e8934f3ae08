//! The externally supplied job description.
//!
//! The description is produced by the PROMINENCE submission service and
//! validated there against a JSON schema; by the time it reaches the executor
//! it is assumed to be syntactically valid. It is read exactly once at startup
//! and never mutated for the remainder of the run.

use std::fs;
use std::path::Path;

use anyhow::Context;
use anyhow::Result;
use indexmap::IndexMap;
use serde::Deserialize;
use serde::Serialize;

/// The resources provisioned for the job.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Resources {
    /// The number of CPU cores per node.
    pub cpus: u32,
    /// The amount of memory per node, in GB.
    pub memory: u64,
    /// The amount of scratch disk, in GB.
    #[serde(default)]
    pub disk: u64,
    /// The number of nodes.
    #[serde(default = "default_nodes")]
    pub nodes: u32,
    /// The wall-clock time limit for the job, in minutes.
    #[serde(default = "default_walltime")]
    pub walltime: u64,
}

/// The default number of nodes for a job.
fn default_nodes() -> u32 {
    1
}

/// The default wall-clock limit, in minutes.
fn default_walltime() -> u64 {
    720
}

/// The container runtime used to execute a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerRuntime {
    /// Singularity (or Apptainer).
    Singularity,
    /// udocker, a rootless user-space runtime.
    Udocker,
}

/// The MPI flavor of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MpiFlavor {
    /// Open MPI.
    OpenMpi,
    /// MPICH.
    Mpich,
    /// Intel MPI.
    IntelMpi,
}

/// The kind of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    /// An ordinary task in the blocking sequence.
    #[default]
    Basic,
    /// A background task started before the blocking sequence and never
    /// joined; it does not participate in pass/fail sequencing.
    Sidecar,
}

/// A credential for pulling an image from a container registry.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PullCredential {
    /// The registry username.
    pub username: String,
    /// The registry token or password.
    pub token: String,
}

/// A single task within a job.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TaskSpec {
    /// The image reference.
    ///
    /// May be an HTTP(S) URL, an absolute path to a cached or storage-mounted
    /// image, or a bare registry reference.
    pub image: String,
    /// The container runtime to execute the task with.
    pub runtime: ContainerRuntime,
    /// The command to run; when absent the image's default entrypoint is used.
    #[serde(default)]
    pub cmd: Option<String>,
    /// The working directory inside the container.
    #[serde(default)]
    pub workdir: Option<String>,
    /// Environment variables to set inside the container.
    #[serde(default)]
    pub env: IndexMap<String, String>,
    /// The kind of the task.
    #[serde(rename = "type", default)]
    pub task_type: TaskType,
    /// The MPI flavor, if the task is an MPI task.
    #[serde(default)]
    pub mpi: Option<MpiFlavor>,
    /// Overrides the number of MPI processes launched per node.
    ///
    /// Defaults to the number of provisioned CPU cores.
    #[serde(default)]
    pub procs_per_node: Option<u32>,
    /// The credential used for pulling the image from a registry.
    #[serde(default)]
    pub image_pull_credential: Option<PullCredential>,
    /// The declared SHA-256 checksum of the image, used for cache lookup.
    #[serde(default)]
    pub image_sha256: Option<String>,
    /// A path to redirect the task's standard output to, relative to the job
    /// home directory.
    #[serde(default)]
    pub stdout: Option<String>,
}

impl TaskSpec {
    /// Returns `true` if this task is a sidecar.
    pub fn is_sidecar(&self) -> bool {
        self.task_type == TaskType::Sidecar
    }
}

/// An input artifact to stage in before any task runs.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ArtifactSpec {
    /// The source URL, or a path relative to the job's network storage.
    pub url: String,
    /// An optional `<source directory>:<container path>` bind specification.
    #[serde(default)]
    pub mountpoint: Option<String>,
    /// Whether to set executable permission bits after staging.
    #[serde(default)]
    pub executable: bool,
}

impl ArtifactSpec {
    /// Splits the `mountpoint` field into its source and container halves.
    ///
    /// Returns `None` if no mountpoint was declared or it is malformed.
    pub fn mount_pair(&self) -> Option<(&str, &str)> {
        self.mountpoint.as_deref()?.split_once(':')
    }
}

/// A declared output file or directory to stage out after the tasks finish.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct OutputSpec {
    /// The declared name; may contain glob metacharacters after parameter
    /// substitution at submission time.
    pub name: String,
    /// The presigned destination URL.
    ///
    /// When absent (or expired), a fresh URL is requested through the "get
    /// upload URL" callback.
    #[serde(default)]
    pub url: Option<String>,
}

/// The kind of network storage declared by a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// A OneData space mounted with `oneclient`.
    OneData,
    /// A WebDAV share mounted with `mount.davfs`.
    WebDav,
}

/// Credentials and endpoint for a OneData mount.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OneDataConfig {
    /// The OneData provider hostname.
    pub provider: String,
    /// The OneData access token.
    pub token: String,
}

/// Credentials and endpoint for a WebDAV mount.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebDavConfig {
    /// The WebDAV endpoint URL.
    pub url: String,
    /// The WebDAV username.
    pub username: String,
    /// The WebDAV password.
    pub password: String,
}

/// A network filesystem to mount for the duration of the job.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StorageSpec {
    /// The kind of storage.
    #[serde(rename = "type")]
    pub kind: StorageKind,
    /// The path under which the storage is exposed inside containers.
    pub mountpoint: String,
    /// Whether this storage is the default location for relative artifact
    /// paths and constructed output destinations.
    #[serde(default)]
    pub default: bool,
    /// OneData connection details.
    #[serde(default)]
    pub onedata: Option<OneDataConfig>,
    /// WebDAV connection details.
    #[serde(default)]
    pub webdav: Option<WebDavConfig>,
}

impl StorageSpec {
    /// Gets the base URL used to resolve relative artifact paths, if this
    /// storage declares one.
    pub fn base_url(&self) -> Option<&str> {
        match self.kind {
            StorageKind::WebDav => self.webdav.as_ref().map(|w| w.url.as_str()),
            StorageKind::OneData => None,
        }
    }
}

/// Job-level execution policies.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Policies {
    /// The number of additional attempts allowed per task.
    ///
    /// A task is attempted at most `maximum_task_retries + 1` times; retries
    /// stop immediately on timeout or cancellation.
    #[serde(default)]
    pub maximum_task_retries: u32,
    /// Continue the task sequence past a failing task without failing the
    /// job.
    #[serde(default)]
    pub ignore_task_failures: bool,
    /// Run serial (non-MPI) tasks on every node of a multi-node job rather
    /// than only on the main node.
    #[serde(default)]
    pub run_serial_tasks_on_all_nodes: bool,
    /// Report the job as successful even when a task failed.
    ///
    /// True per-task exit codes are still recorded in the result document.
    #[serde(default)]
    pub report_job_success_on_task_failure: bool,
}

/// The top-level job description.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct JobDescription {
    /// The provisioned resources.
    pub resources: Resources,
    /// The ordered list of tasks.
    pub tasks: Vec<TaskSpec>,
    /// Input artifacts to stage in.
    #[serde(default)]
    pub artifacts: Vec<ArtifactSpec>,
    /// Output files to stage out.
    #[serde(default)]
    pub output_files: Vec<OutputSpec>,
    /// Output directories to stage out.
    #[serde(default)]
    pub output_dirs: Vec<OutputSpec>,
    /// A network filesystem to mount for the duration of the job.
    #[serde(default)]
    pub storage: Option<StorageSpec>,
    /// Execution policies.
    #[serde(default)]
    pub policies: Policies,
}

impl JobDescription {
    /// Reads a job description from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).with_context(|| {
            format!(
                "failed to read job description `{path}`",
                path = path.display()
            )
        })?;
        serde_json::from_str(&contents).with_context(|| {
            format!(
                "failed to parse job description `{path}`",
                path = path.display()
            )
        })
    }

    /// Gets the wall-clock limit of the job as a [`std::time::Duration`].
    pub fn walltime(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.resources.walltime * 60)
    }
}
