//! Container backends.
//!
//! A backend knows how to turn the abstract operations of the executor
//! (pull an image, load a downloaded archive, run a task) into concrete
//! command lines for one container runtime. Backends build invocations but
//! never run them; execution always goes through [`crate::process::run`] so
//! that timeout and cancellation handling stay in one place.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::job::ContainerRuntime;
use crate::job::PullCredential;

pub mod singularity;
pub mod udocker;

pub use singularity::SingularityBackend;
pub use udocker::UdockerBackend;

/// A fully constructed external command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// The program to execute.
    pub program: String,
    /// The arguments to pass.
    pub args: Vec<String>,
    /// Extra environment variables required by the invocation.
    pub env: IndexMap<String, String>,
}

impl Invocation {
    /// Constructs an invocation with no extra environment.
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            env: IndexMap::new(),
        }
    }
}

/// A host-to-container bind mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bind {
    /// The host source path.
    pub source: PathBuf,
    /// The path exposed inside the container.
    pub target: String,
}

/// The context needed to build the run command for one task on one node.
#[derive(Debug)]
pub struct RunRequest<'a> {
    /// The runnable image reference.
    ///
    /// A filesystem path for backends whose images are files, otherwise a
    /// backend-local image name.
    pub image: &'a str,
    /// The command argv to run inside the container.
    ///
    /// Empty means the image's default entrypoint.
    pub args: &'a [String],
    /// The complete container environment.
    pub env: &'a IndexMap<String, String>,
    /// The working directory inside the container.
    pub workdir: Option<&'a str>,
    /// The bind mounts to apply.
    pub binds: &'a [Bind],
    /// The host directory to present as the container home.
    pub home: &'a Path,
}

/// Implemented by container runtimes the executor can drive.
pub trait ContainerBackend: Send + Sync {
    /// The name of the runtime, as it appears in logs.
    fn name(&self) -> &'static str;

    /// Whether runnable images are plain files on disk.
    ///
    /// Only file-backed images can be checksummed and entered into the
    /// node-local image cache.
    fn image_is_file(&self) -> bool;

    /// Builds the command that pulls a registry reference.
    ///
    /// `dest` is where a file-backed image must land; backends with an
    /// internal image store may ignore it.
    fn pull_invocation(&self, reference: &str, dest: &Path) -> Invocation;

    /// Builds the command that turns a downloaded Docker-archive tarball
    /// into a runnable image named `dest`.
    fn load_invocation(&self, archive: &Path, dest: &str) -> Invocation;

    /// Gets the environment variables that carry registry pull credentials.
    fn credential_env(&self, credential: &PullCredential) -> IndexMap<String, String>;

    /// Builds the command that runs a task.
    fn run_invocation(&self, request: &RunRequest<'_>) -> Invocation;
}

/// The set of backends available to a job run, keyed by declared runtime.
#[derive(Clone)]
pub struct BackendSet {
    /// The backend used for `singularity` tasks.
    singularity: Arc<dyn ContainerBackend>,
    /// The backend used for `udocker` tasks.
    udocker: Arc<dyn ContainerBackend>,
}

impl BackendSet {
    /// Constructs the set backed by the real runtimes.
    pub fn native() -> Self {
        Self {
            singularity: Arc::new(SingularityBackend),
            udocker: Arc::new(UdockerBackend),
        }
    }

    /// Constructs a set where both runtimes resolve to the given backend.
    ///
    /// Used by tests to substitute a backend that runs plain processes.
    pub fn uniform(backend: Arc<dyn ContainerBackend>) -> Self {
        Self {
            singularity: backend.clone(),
            udocker: backend,
        }
    }

    /// Gets the backend for a declared runtime.
    pub fn get(&self, runtime: ContainerRuntime) -> &dyn ContainerBackend {
        match runtime {
            ContainerRuntime::Singularity => self.singularity.as_ref(),
            ContainerRuntime::Udocker => self.udocker.as_ref(),
        }
    }
}

impl std::fmt::Debug for BackendSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendSet")
            .field("singularity", &self.singularity.name())
            .field("udocker", &self.udocker.name())
            .finish()
    }
}
