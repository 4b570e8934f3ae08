//! Execution engine for PROMINENCE jobs.
//!
//! The engine runs on a worker node after the batch scheduler has placed a
//! job there. It mounts any declared network storage, stages in input
//! artifacts, resolves and caches container images, executes the job's
//! tasks (including MPI tasks spanning multiple nodes and detached sidecar
//! tasks) with retry and timeout semantics, stages outputs back to object
//! storage, and writes a structured JSON result document alongside a
//! process exit code the scheduler interprets.

pub mod backend;
pub mod config;
pub mod image;
pub mod job;
pub mod mount;
pub mod mpi;
pub mod process;
pub mod relay;
pub mod report;
pub mod retry;
pub mod runner;
pub mod stagein;
pub mod stageout;
pub mod transfer;
pub mod usage;

pub use tokio_util::sync::CancellationToken;

pub use backend::BackendSet;
pub use config::JobContext;
pub use config::JobPaths;
pub use job::JobDescription;
pub use relay::HttpCommandChannel;
pub use report::JobResult;
pub use runner::JobRunner;
pub use transfer::HttpTransfer;
