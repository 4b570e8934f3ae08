//! The per-job state machine.
//!
//! One runner drives one job attempt on one node through its phases:
//! mounting, stage-in, task execution, stage-out. Mounting and stage-in
//! fail fast; stage-out is best-effort. Every phase outcome lands in the
//! result document rather than propagating, so the process exits cleanly
//! with a complete record even when a phase fails.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use indexmap::IndexMap;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::backend::BackendSet;
use crate::backend::Bind;
use crate::backend::ContainerBackend;
use crate::backend::RunRequest;
use crate::config::JobContext;
use crate::config::JobPaths;
use crate::image::ImageResolver;
use crate::image::ResolvedImage;
use crate::job::JobDescription;
use crate::job::TaskSpec;
use crate::mount;
use crate::mount::mount_dir;
use crate::mpi;
use crate::process;
use crate::process::OutputMode;
use crate::relay::CommandChannel;
use crate::relay::RelayKey;
use crate::relay::poll_until;
use crate::report::ImagePullStatus;
use crate::report::JobResult;
use crate::report::MountStatus;
use crate::report::PeakMemory;
use crate::report::PhaseOutcomes;
use crate::report::Provisioned;
use crate::report::TaskEntry;
use crate::report::TaskMetrics;
use crate::report::WalltimeExceeded;
use crate::stagein;
use crate::stageout;
use crate::stageout::StageOutContext;
use crate::transfer::Transfer;
use crate::usage;
use crate::usage::ChildUsage;

/// The number of relay polls a follower performs before giving up on an
/// MPI launch; delays grow linearly, so this covers roughly 40 minutes.
const FOLLOWER_POLL_RETRIES: usize = 100;

/// The PATH handed to container launchers.
const LAUNCHER_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Runs one job attempt on one node.
pub struct JobRunner {
    /// The job description.
    job: JobDescription,
    /// The scheduler-provided context.
    context: JobContext,
    /// The working directory layout.
    paths: JobPaths,
    /// The available container backends.
    backends: BackendSet,
    /// The transferer for downloads and uploads.
    transfer: Arc<dyn Transfer>,
    /// The command relay for MPI coordination.
    channel: Arc<dyn CommandChannel>,
    /// The cooperative cancellation token, set by the signal handler.
    cancel: CancellationToken,
}

/// The outcome of one task execution attempt.
#[derive(Debug, Clone, Copy)]
struct Attempt {
    /// The exit code of the final process.
    exit_code: i32,
    /// Whether the wall-time budget expired.
    timed_out: bool,
    /// Whether cancellation interrupted the run.
    cancelled: bool,
}

impl JobRunner {
    /// Constructs a runner.
    pub fn new(
        job: JobDescription,
        context: JobContext,
        paths: JobPaths,
        backends: BackendSet,
        transfer: Arc<dyn Transfer>,
        channel: Arc<dyn CommandChannel>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            job,
            context,
            paths,
            backends,
            transfer,
            channel,
            cancel,
        }
    }

    /// Runs the job attempt to completion and returns the process exit code.
    ///
    /// Exactly one result document is written, placeholder first, even when
    /// a phase fails immediately.
    pub async fn run(self) -> Result<i32> {
        if self.paths.lock.exists() {
            bail!(
                "lock file `{path}` exists; refusing re-entrant execution",
                path = self.paths.lock.display()
            );
        }
        self.paths.create_dirs()?;
        std::fs::write(&self.paths.lock, b"").with_context(|| {
            format!(
                "failed to create lock file `{path}`",
                path = self.paths.lock.display()
            )
        })?;

        JobResult::write_placeholder(&self.paths.result)?;

        let mut result = JobResult {
            provisioned: Provisioned {
                cpus: self.context.cpus,
                memory: self.context.memory,
                disk: self.context.disk,
                site: self.context.site.clone(),
            },
            cpu: usage::cpu_info(),
            ..Default::default()
        };

        let deadline = Instant::now() + self.job.walltime();
        let outcomes = self.run_phases(&mut result, deadline).await;

        if let Some(kb) = usage::peak_memory_kb() {
            result.tasks.push(TaskEntry::PeakMemory(PeakMemory {
                peak_memory_usage_kb: kb,
            }));
        }
        if Instant::now() >= deadline {
            result.tasks.push(TaskEntry::Walltime(WalltimeExceeded {
                job_walltime_limit_exceeded: true,
            }));
        }

        result.write(&self.paths.result)?;
        if let Err(e) = std::fs::remove_file(&self.paths.lock) {
            warn!("failed to remove lock file: {e}");
        }

        Ok(outcomes.exit_code())
    }

    /// Drives the phase sequence, recording outcomes into the result.
    async fn run_phases(&self, result: &mut JobResult, deadline: Instant) -> PhaseOutcomes {
        let mut outcomes = PhaseOutcomes {
            mounted: true,
            staged_in: false,
            tasks_succeeded: false,
            staged_out: false,
        };

        if let Some(storage) = &self.job.storage {
            let mount_result = mount::mount(storage, &self.paths, &self.cancel).await;
            outcomes.mounted = mount_result.status == MountStatus::Success;
            result.mounts.push(mount_result);
            if !outcomes.mounted {
                return outcomes;
            }
        }

        let (stagein_results, staged_in) = stagein::stage_in(
            &self.job.artifacts,
            self.job.storage.as_ref(),
            self.transfer.as_ref(),
            None,
            &self.paths,
            &self.cancel,
        )
        .await;
        result.stagein = stagein_results;
        outcomes.staged_in = staged_in;

        if outcomes.staged_in {
            outcomes.tasks_succeeded = self.run_tasks(result, deadline).await;

            if self.context.is_main_node() {
                let context = StageOutContext {
                    api_url: self.context.api_url.as_deref(),
                    token: self.context.token.as_deref(),
                    job_id: self.context.job_id,
                };
                let (stageout_result, staged_out) = stageout::stage_out(
                    &self.job.output_files,
                    &self.job.output_dirs,
                    self.job.storage.as_ref(),
                    &context,
                    self.transfer.as_ref(),
                    &self.paths,
                    &self.cancel,
                )
                .await;
                result.stageout = stageout_result;
                outcomes.staged_out = staged_out;
            } else {
                // Non-main nodes must not pollute the aggregate exit code
                outcomes.staged_out = true;
            }
        }

        if let Some(storage) = &self.job.storage {
            mount::unmount(storage, &self.paths, &self.cancel).await;
        }

        outcomes
    }

    /// Runs the task sequence, returning whether it counts as successful.
    async fn run_tasks(&self, result: &mut JobResult, deadline: Instant) -> bool {
        let mut resolver = ImageResolver::new(
            self.context.job_id,
            &self.paths,
            self.context.image_cache.clone(),
            self.job.storage.as_ref(),
        );

        // Sidecars start before the blocking sequence and are never joined
        for (index, task) in self.job.tasks.iter().enumerate() {
            if !task.is_sidecar() {
                continue;
            }
            match resolver
                .resolve(
                    index,
                    task,
                    self.backends.get(task.runtime),
                    self.transfer.as_ref(),
                    &self.cancel,
                )
                .await
            {
                Ok(resolved) => self.spawn_sidecar(index, task.clone(), resolved, deadline),
                Err(e) => error!("failed to resolve sidecar {index} image: {e:#}"),
            }
        }

        let mut failed = false;
        for (index, task) in self.job.tasks.iter().enumerate() {
            if task.is_sidecar() {
                continue;
            }
            if self.cancel.is_cancelled() {
                warn!("task sequence aborted: cancellation requested");
                failed = true;
                break;
            }
            if self.skip_on_this_node(task) {
                info!("task {index} runs on the main node only; skipping here");
                continue;
            }

            let started = Instant::now();
            let resolved = match resolver
                .resolve(
                    index,
                    task,
                    self.backends.get(task.runtime),
                    self.transfer.as_ref(),
                    &self.cancel,
                )
                .await
            {
                Ok(resolved) => resolved,
                Err(e) => {
                    error!("failed to resolve task {index} image: {e:#}");
                    result.tasks.push(TaskEntry::Metrics(TaskMetrics {
                        exit_code: -1,
                        wall_time_usage: started.elapsed().as_secs_f64(),
                        cpu_time_usage: 0.0,
                        max_resident_set_size_kb: 0,
                        retries: 0,
                        image_pull_status: ImagePullStatus::Failed,
                        image_pull_time: started.elapsed().as_secs_f64(),
                        image_sha256: None,
                        timed_out: false,
                    }));
                    failed = true;
                    break;
                }
            };

            let usage_before = ChildUsage::snapshot();
            let run_started = Instant::now();
            let mut retries = 0;
            let mut attempt = self.run_task(index, task, &resolved, deadline).await;

            while !attempt.timed_out
                && !attempt.cancelled
                && attempt.exit_code != 0
                && retries < self.job.policies.maximum_task_retries
            {
                retries += 1;
                info!(
                    "task {index} exited with code {code}; retry {retries} of {max}",
                    code = attempt.exit_code,
                    max = self.job.policies.maximum_task_retries
                );
                attempt = self.run_task(index, task, &resolved, deadline).await;
            }

            let usage_after = ChildUsage::snapshot();
            result.tasks.push(TaskEntry::Metrics(TaskMetrics {
                exit_code: attempt.exit_code,
                wall_time_usage: run_started.elapsed().as_secs_f64(),
                cpu_time_usage: usage_after.cpu_since(&usage_before),
                max_resident_set_size_kb: usage_after.max_rss_kb,
                retries,
                image_pull_status: resolved.status,
                image_pull_time: resolved.time,
                image_sha256: resolved.sha256.clone(),
                timed_out: attempt.timed_out,
            }));

            if attempt.timed_out || attempt.cancelled {
                // Timeouts are always fatal to the remaining sequence
                failed = true;
                break;
            }
            if attempt.exit_code != 0 {
                // An ignored failure neither stops the sequence nor counts
                // against the job outcome; the true exit code stays recorded
                if self.job.policies.ignore_task_failures {
                    warn!(
                        "task {index} failed with code {code}; continuing",
                        code = attempt.exit_code
                    );
                    continue;
                }
                failed = true;
                break;
            }
        }

        !failed || self.job.policies.report_job_success_on_task_failure
    }

    /// Whether a task must not execute on this node.
    ///
    /// Serial tasks of a multi-node job run on the main node only unless the
    /// job opts in to running them everywhere; MPI tasks involve every node.
    fn skip_on_this_node(&self, task: &TaskSpec) -> bool {
        self.job.resources.nodes > 1
            && task.mpi.is_none()
            && !self.context.is_main_node()
            && !self.job.policies.run_serial_tasks_on_all_nodes
    }

    /// Starts a sidecar task detached; it never blocks the sequence.
    fn spawn_sidecar(
        &self,
        index: usize,
        task: TaskSpec,
        resolved: ResolvedImage,
        deadline: Instant,
    ) {
        let backend = self.backends.get(task.runtime).name();
        info!("starting sidecar {index} with {backend}");

        let runner = SidecarRun {
            job: self.job.clone(),
            context: self.context.clone(),
            paths: self.paths.clone(),
            backends: self.backends.clone(),
            cancel: self.cancel.clone(),
        };
        tokio::spawn(async move {
            let attempt = execute_attempt(
                index,
                &task,
                &resolved,
                &runner.job,
                &runner.context,
                &runner.paths,
                runner.backends.get(task.runtime),
                None,
                deadline,
                &runner.cancel,
            )
            .await;
            match attempt {
                Ok(outcome) => info!(
                    "sidecar {index} exited with code {code}",
                    code = outcome.exit_code
                ),
                Err(e) => error!("sidecar {index} failed to start: {e:#}"),
            }
        });
    }

    /// Runs one attempt of one blocking task on this node.
    async fn run_task(
        &self,
        index: usize,
        task: &TaskSpec,
        resolved: &ResolvedImage,
        deadline: Instant,
    ) -> Attempt {
        let outcome = match task.mpi {
            Some(_) if !self.context.is_main_node() => {
                self.run_mpi_follower(index, task, resolved, deadline).await
            }
            _ => {
                execute_attempt(
                    index,
                    task,
                    resolved,
                    &self.job,
                    &self.context,
                    &self.paths,
                    self.backends.get(task.runtime),
                    self.channel_token(),
                    deadline,
                    &self.cancel,
                )
                .await
            }
        };

        match outcome {
            Ok(attempt) => attempt,
            Err(e) => {
                error!("task {index} failed to run: {e:#}");
                Attempt {
                    exit_code: -1,
                    timed_out: false,
                    cancelled: self.cancel.is_cancelled(),
                }
            }
        }
    }

    /// Gets the API credentials used for MPI launch assembly, if present.
    fn channel_token(&self) -> Option<(&str, &str)> {
        match (self.context.api_url.as_deref(), self.context.token.as_deref()) {
            (Some(api), Some(token)) => Some((api, token)),
            _ => None,
        }
    }

    /// Polls the relay for the launcher's command and runs it here.
    async fn run_mpi_follower(
        &self,
        index: usize,
        task: &TaskSpec,
        resolved: &ResolvedImage,
        deadline: Instant,
    ) -> Result<Attempt> {
        let host = self
            .context
            .hosts
            .get(self.context.node as usize)
            .cloned()
            .context("no host entry for this node")?;
        let key = RelayKey {
            job_id: self.context.job_id,
            host,
            task: index,
        };

        info!("polling the command relay as `{key}`");
        let command = poll_until(
            self.channel.as_ref(),
            &key,
            FOLLOWER_POLL_RETRIES,
            &self.cancel,
        )
        .await?
        .context("no launch command appeared on the relay")?;

        let args = shlex::split(&command)
            .with_context(|| format!("failed to parse relayed command `{command}`"))?;
        run_in_container(
            task,
            resolved,
            &args,
            &self.job,
            &self.context,
            &self.paths,
            self.backends.get(task.runtime),
            deadline,
            &self.cancel,
        )
        .await
    }
}

/// A clone of the runner state a sidecar needs after detaching.
struct SidecarRun {
    /// The job description.
    job: JobDescription,
    /// The scheduler-provided context.
    context: JobContext,
    /// The working directory layout.
    paths: JobPaths,
    /// The available container backends.
    backends: BackendSet,
    /// The cancellation token.
    cancel: CancellationToken,
}

/// Builds the computed environment every task container receives.
fn prominence_env(
    job: &JobDescription,
    context: &JobContext,
    paths: &JobPaths,
) -> IndexMap<String, String> {
    let mut env = IndexMap::new();
    env.insert(
        "PROMINENCE_CPUS".to_string(),
        context.cpus.to_string(),
    );
    env.insert("PROMINENCE_MEMORY".to_string(), context.memory.to_string());
    env.insert(
        "PROMINENCE_NODES".to_string(),
        job.resources.nodes.to_string(),
    );
    env.insert(
        "PROMINENCE_NODE_NUM".to_string(),
        context.node.to_string(),
    );
    env.insert(
        "PROMINENCE_JOB_ID".to_string(),
        context.job_id.to_string(),
    );
    if let Some(workflow_id) = context.workflow_id {
        env.insert(
            "PROMINENCE_WORKFLOW_ID".to_string(),
            workflow_id.to_string(),
        );
    }
    // The backends bind the job home into the container at its host path,
    // so this must name that path rather than an assumed home directory
    env.insert(
        "PROMINENCE_PWD".to_string(),
        paths.home.display().to_string(),
    );
    env
}

/// Builds the bind mounts for a task container.
fn binds(job: &JobDescription, paths: &JobPaths) -> Vec<Bind> {
    let mut binds = vec![Bind {
        source: paths.tmp.clone(),
        target: "/tmp".to_string(),
    }];

    for artifact in &job.artifacts {
        if let Some((source, target)) = artifact.mount_pair() {
            binds.push(Bind {
                source: paths.home.join(source),
                target: target.to_string(),
            });
        }
    }

    if let Some(storage) = &job.storage {
        binds.push(Bind {
            source: mount_dir(storage, paths),
            target: storage.mountpoint.clone(),
        });
    }

    binds
}

/// Runs one attempt of a task, assembling MPI launch state when needed.
#[allow(clippy::too_many_arguments)]
async fn execute_attempt(
    index: usize,
    task: &TaskSpec,
    resolved: &ResolvedImage,
    job: &JobDescription,
    context: &JobContext,
    paths: &JobPaths,
    backend: &dyn ContainerBackend,
    api: Option<(&str, &str)>,
    deadline: Instant,
    cancel: &CancellationToken,
) -> Result<Attempt> {
    let command = task
        .cmd
        .as_deref()
        .map(|cmd| context.substitute(cmd))
        .unwrap_or_default();
    let mut args = match command.is_empty() {
        true => Vec::new(),
        false => shlex::split(&command)
            .with_context(|| format!("failed to parse task command `{command}`"))?,
    };

    if let Some(flavor) = task.mpi {
        // A single-node launch never invokes the remote shell agent, so the
        // wrapper path only has to exist when follower nodes are involved
        let wrapper = match api {
            Some((api_url, token)) if job.resources.nodes > 1 => {
                mpi::write_wrapper_script(&paths.home, index, api_url, token, context.job_id)?
            }
            None if job.resources.nodes > 1 => bail!(
                "MPI task {index} spans {nodes} nodes but no API credentials are available \
                 for launch coordination",
                nodes = job.resources.nodes
            ),
            _ => paths.home.join(".mpi-remote-unused"),
        };

        let procs_per_node = task.procs_per_node.unwrap_or(context.cpus.max(1));
        let hosts_file = mpi::write_hosts_file(
            &paths.home,
            index,
            flavor,
            &context.hosts,
            procs_per_node,
        )?;

        let total = procs_per_node * job.resources.nodes.max(1);
        args = mpi::mpirun_args(flavor, total, &hosts_file, &wrapper, &args);
    }

    run_in_container(
        task, resolved, &args, job, context, paths, backend, deadline, cancel,
    )
    .await
}

/// Runs an argv inside a task's container on this node.
#[allow(clippy::too_many_arguments)]
async fn run_in_container(
    task: &TaskSpec,
    resolved: &ResolvedImage,
    args: &[String],
    job: &JobDescription,
    context: &JobContext,
    paths: &JobPaths,
    backend: &dyn ContainerBackend,
    deadline: Instant,
    cancel: &CancellationToken,
) -> Result<Attempt> {
    let remaining = deadline.saturating_duration_since(Instant::now());
    if remaining.is_zero() {
        return Ok(Attempt {
            exit_code: -1,
            timed_out: true,
            cancelled: false,
        });
    }

    let mut env = prominence_env(job, context, paths);
    for (key, value) in &task.env {
        env.insert(key.clone(), context.substitute(value));
    }

    let binds = binds(job, paths);
    let invocation = backend.run_invocation(&RunRequest {
        image: &resolved.reference,
        args,
        env: &env,
        workdir: task.workdir.as_deref(),
        binds: &binds,
        home: &paths.home,
    });

    let mut launcher_env = invocation.env;
    launcher_env.insert("PATH".to_string(), LAUNCHER_PATH.to_string());
    launcher_env.insert("HOME".to_string(), paths.home.display().to_string());

    let output = match &task.stdout {
        Some(path) => OutputMode::Tee(paths.home.join(path)),
        None => OutputMode::Inherit,
    };

    let outcome = process::run(
        &invocation.program,
        &invocation.args,
        &launcher_env,
        Some(&paths.home),
        remaining,
        output,
        cancel,
    )
    .await?;

    Ok(Attempt {
        exit_code: outcome.exit_code,
        timed_out: outcome.timed_out,
        cancelled: outcome.cancelled,
    })
}
