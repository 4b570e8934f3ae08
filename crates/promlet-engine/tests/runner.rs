//! End-to-end tests of the job state machine.
//!
//! Containers are replaced by a backend that runs the task command as a
//! plain process, and network transfers go through `file://` URLs, so every
//! scenario is hermetic.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;

use anyhow::Result;
use futures::FutureExt;
use futures::future::BoxFuture;
use indexmap::IndexMap;
use pretty_assertions::assert_eq;
use promlet_engine::BackendSet;
use promlet_engine::CancellationToken;
use promlet_engine::HttpTransfer;
use promlet_engine::JobContext;
use promlet_engine::JobDescription;
use promlet_engine::JobPaths;
use promlet_engine::JobResult;
use promlet_engine::JobRunner;
use promlet_engine::backend::ContainerBackend;
use promlet_engine::backend::Invocation;
use promlet_engine::backend::RunRequest;
use promlet_engine::job::PullCredential;
use promlet_engine::relay::CommandChannel;
use promlet_engine::relay::RelayKey;
use promlet_engine::report::ImagePullStatus;
use promlet_engine::report::StageInStatus;
use promlet_engine::report::StageOutStatus;
use promlet_engine::report::TaskEntry;
use promlet_engine::report::TaskMetrics;

/// A backend that executes task commands directly as host processes.
#[derive(Default)]
struct ProcessBackend {
    /// Every run argv handed to the backend.
    runs: Mutex<Vec<Vec<String>>>,
    /// Whether `mpirun` invocations should be swallowed.
    swallow_mpirun: bool,
}

impl ContainerBackend for ProcessBackend {
    fn name(&self) -> &'static str {
        "process"
    }

    fn image_is_file(&self) -> bool {
        false
    }

    fn pull_invocation(&self, _: &str, _: &Path) -> Invocation {
        Invocation::new("true", Vec::new())
    }

    fn load_invocation(&self, _: &Path, _: &str) -> Invocation {
        Invocation::new("true", Vec::new())
    }

    fn credential_env(&self, _: &PullCredential) -> IndexMap<String, String> {
        IndexMap::new()
    }

    fn run_invocation(&self, request: &RunRequest<'_>) -> Invocation {
        self.runs.lock().unwrap().push(request.args.to_vec());
        if request.args.is_empty() || (self.swallow_mpirun && request.args[0] == "mpirun") {
            return Invocation::new("true", Vec::new());
        }
        Invocation {
            program: request.args[0].clone(),
            args: request.args[1..].to_vec(),
            env: request.env.clone(),
        }
    }
}

/// An in-memory command relay.
#[derive(Default)]
struct MemoryChannel {
    /// Published commands by key.
    commands: Mutex<HashMap<String, String>>,
}

impl MemoryChannel {
    /// Publishes a command for a key ahead of time.
    fn preload(&self, key: &str, command: &str) {
        self.commands
            .lock()
            .unwrap()
            .insert(key.to_string(), command.to_string());
    }
}

impl CommandChannel for MemoryChannel {
    fn publish<'a, 'b, 'c>(&'a self, key: &'b RelayKey, command: &'b str) -> BoxFuture<'c, Result<()>>
    where
        'a: 'c,
        'b: 'c,
        Self: 'c,
    {
        async move {
            self.preload(&key.to_string(), command);
            Ok(())
        }
        .boxed()
    }

    fn poll<'a, 'b, 'c>(&'a self, key: &'b RelayKey) -> BoxFuture<'c, Result<Option<String>>>
    where
        'a: 'c,
        'b: 'c,
        Self: 'c,
    {
        async move { Ok(self.commands.lock().unwrap().get(&key.to_string()).cloned()) }.boxed()
    }
}

/// A scenario under construction.
struct Scenario {
    /// The scratch directory standing in for the scheduler's sandbox.
    dir: tempfile::TempDir,
    /// The job description.
    job: JobDescription,
    /// The scheduler-provided context.
    context: JobContext,
    /// The backend shared with the runner for argv assertions.
    backend: Arc<ProcessBackend>,
    /// The relay channel shared with the runner.
    channel: Arc<MemoryChannel>,
    /// The cancellation token handed to the runner.
    cancel: CancellationToken,
}

impl Scenario {
    /// Builds a scenario from a job description JSON value.
    fn new(job: serde_json::Value) -> Self {
        Self::with_backend(job, ProcessBackend::default())
    }

    /// Builds a scenario with a customized backend.
    fn with_backend(job: serde_json::Value, backend: ProcessBackend) -> Self {
        let dir = tempfile::tempdir().expect("should create a temp dir");
        let job: JobDescription = serde_json::from_value(job).expect("job should parse");
        let context = JobContext {
            id: 5,
            job_id: 11,
            cpus: 2,
            memory: 4,
            disk: 10,
            ..Default::default()
        };
        Self {
            dir,
            job,
            context,
            backend: Arc::new(backend),
            channel: Arc::new(MemoryChannel::default()),
            cancel: CancellationToken::new(),
        }
    }

    /// The working directory layout of the scenario.
    fn paths(&self) -> JobPaths {
        JobPaths::new(self.dir.path(), self.context.id, self.context.node)
    }

    /// Runs the job and returns the exit code with the parsed result.
    ///
    /// Borrows the scenario so the scratch directory outlives the run and
    /// tests can assert on files left behind in it.
    async fn run(&self) -> (i32, JobResult) {
        let paths = self.paths();
        let result_path = paths.result.clone();
        let runner = JobRunner::new(
            self.job.clone(),
            self.context.clone(),
            paths,
            BackendSet::uniform(self.backend.clone()),
            Arc::new(HttpTransfer::new()),
            self.channel.clone(),
            self.cancel.clone(),
        );

        let code = runner.run().await.expect("runner should not error");
        let contents = std::fs::read_to_string(&result_path).expect("result should exist");
        let result = serde_json::from_str(&contents).expect("result should parse");
        (code, result)
    }
}

/// Extracts the task metric entries from a result.
fn metrics(result: &JobResult) -> Vec<&TaskMetrics> {
    result
        .tasks
        .iter()
        .filter_map(|entry| match entry {
            TaskEntry::Metrics(metrics) => Some(metrics),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn a_successful_job_stages_out_and_exits_zero() {
    let upload_dir = tempfile::tempdir().unwrap();
    let upload_url = url::Url::from_file_path(upload_dir.path().join("out.dat")).unwrap();

    let scenario = Scenario::new(serde_json::json!({
        "resources": { "cpus": 1, "memory": 1 },
        "tasks": [ {
            "image": "alpine:latest",
            "runtime": "singularity",
            "cmd": "sh -c 'echo payload > out.dat'",
        } ],
        "outputFiles": [ { "name": "out.dat", "url": upload_url.as_str() } ],
    }));

    let (code, result) = scenario.run().await;

    assert_eq!(code, 0);
    let metrics = metrics(&result);
    assert_eq!(metrics.len(), 1);
    assert_eq!(metrics[0].exit_code, 0);
    assert!(!metrics[0].timed_out);
    assert_eq!(result.stageout.files[0].status, StageOutStatus::Success);
    assert_eq!(
        std::fs::read_to_string(upload_dir.path().join("out.dat")).unwrap(),
        "payload\n"
    );
    assert_eq!(result.provisioned.cpus, 2);
}

#[tokio::test]
async fn a_failing_download_skips_tasks_and_stage_out() {
    let scenario = Scenario::new(serde_json::json!({
        "resources": { "cpus": 1, "memory": 1 },
        "tasks": [ {
            "image": "alpine:latest",
            "runtime": "singularity",
            "cmd": "sh -c 'echo ran > marker'",
        } ],
        "artifacts": [ { "url": "file:///nonexistent/input.dat" } ],
    }));
    let home = scenario.paths().home.clone();

    let (code, result) = scenario.run().await;

    assert_eq!(code, 1);
    assert_eq!(result.stagein[0].status, StageInStatus::FailedDownload);
    assert!(metrics(&result).is_empty());
    assert!(!home.join("marker").exists());
}

#[tokio::test]
async fn failed_tasks_are_retried_up_to_the_bound() {
    let scenario = Scenario::new(serde_json::json!({
        "resources": { "cpus": 1, "memory": 1 },
        "tasks": [ {
            "image": "alpine:latest",
            "runtime": "singularity",
            "cmd": "sh -c 'echo x >> attempts; exit 7'",
        } ],
        "policies": { "maximumTaskRetries": 2 },
    }));
    let home = scenario.paths().home.clone();

    let (code, result) = scenario.run().await;

    assert_eq!(code, 1);
    let metrics = metrics(&result);
    assert_eq!(metrics[0].exit_code, 7);
    assert_eq!(metrics[0].retries, 2);
    assert_eq!(
        std::fs::read_to_string(home.join("attempts")).unwrap().lines().count(),
        3
    );
}

#[tokio::test]
async fn an_exhausted_walltime_halts_the_sequence() {
    let scenario = Scenario::new(serde_json::json!({
        "resources": { "cpus": 1, "memory": 1, "walltime": 0 },
        "tasks": [
            {
                "image": "alpine:latest",
                "runtime": "singularity",
                "cmd": "sh -c 'echo x >> first'",
            },
            {
                "image": "alpine:latest",
                "runtime": "singularity",
                "cmd": "sh -c 'echo x >> second'",
            },
        ],
        "policies": { "maximumTaskRetries": 5 },
    }));
    let home = scenario.paths().home.clone();

    let (code, result) = scenario.run().await;

    assert_eq!(code, 1);
    let metrics = metrics(&result);
    // The first task times out without retries; the second never starts
    assert_eq!(metrics.len(), 1);
    assert!(metrics[0].timed_out);
    assert_eq!(metrics[0].retries, 0);
    assert!(!home.join("first").exists());
    assert!(!home.join("second").exists());
    assert!(result.tasks.iter().any(|entry| matches!(
        entry,
        TaskEntry::Walltime(w) if w.job_walltime_limit_exceeded
    )));
}

#[tokio::test]
async fn ignored_failures_continue_without_failing_the_job() {
    let scenario = Scenario::new(serde_json::json!({
        "resources": { "cpus": 1, "memory": 1 },
        "tasks": [
            {
                "image": "alpine:latest",
                "runtime": "singularity",
                "cmd": "sh -c 'exit 3'",
            },
            {
                "image": "alpine:latest",
                "runtime": "singularity",
                "cmd": "sh -c 'echo x > second'",
            },
        ],
        "policies": { "ignoreTaskFailures": true },
    }));
    let home = scenario.paths().home.clone();

    let (code, result) = scenario.run().await;

    // Ignored failures keep their true exit codes but the job still succeeds
    assert_eq!(code, 0);
    let metrics = metrics(&result);
    assert_eq!(metrics.len(), 2);
    assert_eq!(metrics[0].exit_code, 3);
    assert_eq!(metrics[1].exit_code, 0);
    assert!(home.join("second").exists());
}

#[tokio::test]
async fn reported_success_overrides_a_task_failure() {
    let scenario = Scenario::new(serde_json::json!({
        "resources": { "cpus": 1, "memory": 1 },
        "tasks": [ {
            "image": "alpine:latest",
            "runtime": "singularity",
            "cmd": "sh -c 'exit 3'",
        } ],
        "policies": { "reportJobSuccessOnTaskFailure": true },
    }));

    let (code, result) = scenario.run().await;

    // The job reports success while the true exit code stays recorded
    assert_eq!(code, 0);
    assert_eq!(metrics(&result)[0].exit_code, 3);
}

#[tokio::test]
async fn missing_outputs_do_not_abort_remaining_outputs() {
    let upload_dir = tempfile::tempdir().unwrap();
    let present_url = url::Url::from_file_path(upload_dir.path().join("present.dat")).unwrap();
    let absent_url = url::Url::from_file_path(upload_dir.path().join("absent.dat")).unwrap();

    let scenario = Scenario::new(serde_json::json!({
        "resources": { "cpus": 1, "memory": 1 },
        "tasks": [ {
            "image": "alpine:latest",
            "runtime": "singularity",
            "cmd": "sh -c 'echo x > present.dat'",
        } ],
        "outputFiles": [
            { "name": "absent.dat", "url": absent_url.as_str() },
            { "name": "present.dat", "url": present_url.as_str() },
        ],
    }));

    let (code, result) = scenario.run().await;

    assert_eq!(code, 1);
    assert_eq!(
        result.stageout.files[0].status,
        StageOutStatus::FailedNoSuchFile
    );
    assert_eq!(result.stageout.files[1].status, StageOutStatus::Success);
    assert!(upload_dir.path().join("present.dat").exists());
}

#[tokio::test]
async fn serial_tasks_are_skipped_on_non_main_nodes() {
    let mut scenario = Scenario::new(serde_json::json!({
        "resources": { "cpus": 1, "memory": 1, "nodes": 2 },
        "tasks": [ {
            "image": "alpine:latest",
            "runtime": "singularity",
            "cmd": "sh -c 'echo x > marker'",
        } ],
    }));
    scenario.context.node = 1;
    scenario.context.hosts = vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()];
    let home = scenario.paths().home.clone();

    let (code, result) = scenario.run().await;

    // Skipped tasks are absent from the metrics, not failures
    assert_eq!(code, 0);
    assert!(metrics(&result).is_empty());
    assert!(!home.join("marker").exists());
}

#[tokio::test]
async fn identical_images_resolve_as_cached_for_later_tasks() {
    let scenario = Scenario::new(serde_json::json!({
        "resources": { "cpus": 1, "memory": 1 },
        "tasks": [
            {
                "image": "alpine:latest",
                "runtime": "singularity",
                "cmd": "sh -c 'true'",
            },
            {
                "image": "alpine:latest",
                "runtime": "singularity",
                "cmd": "sh -c 'true'",
            },
        ],
    }));

    let (code, result) = scenario.run().await;

    assert_eq!(code, 0);
    let metrics = metrics(&result);
    assert_eq!(metrics[0].image_pull_status, ImagePullStatus::Completed);
    assert_eq!(metrics[1].image_pull_status, ImagePullStatus::Cached);
}

#[tokio::test]
async fn sidecars_start_without_blocking_the_sequence() {
    let scenario = Scenario::new(serde_json::json!({
        "resources": { "cpus": 1, "memory": 1 },
        "tasks": [
            {
                "image": "alpine:latest",
                "runtime": "singularity",
                "type": "sidecar",
                "cmd": "sh -c 'echo s > sidecar.txt'",
            },
            {
                "image": "alpine:latest",
                "runtime": "singularity",
                "cmd": "sh -c 'sleep 0.5'",
            },
        ],
    }));
    let home = scenario.paths().home.clone();

    let (code, result) = scenario.run().await;

    assert_eq!(code, 0);
    // Only the blocking task contributes metrics
    assert_eq!(metrics(&result).len(), 1);
    assert!(home.join("sidecar.txt").exists());
}

#[tokio::test]
async fn an_existing_lock_file_is_fatal() {
    let scenario = Scenario::new(serde_json::json!({
        "resources": { "cpus": 1, "memory": 1 },
        "tasks": [ { "image": "alpine:latest", "runtime": "singularity" } ],
    }));
    let paths = scenario.paths();
    std::fs::write(&paths.lock, b"").unwrap();

    let runner = JobRunner::new(
        scenario.job,
        scenario.context,
        paths,
        BackendSet::uniform(scenario.backend.clone()),
        Arc::new(HttpTransfer::new()),
        scenario.channel.clone(),
        scenario.cancel.clone(),
    );
    assert!(runner.run().await.is_err());
}

#[tokio::test]
async fn the_main_node_assembles_the_mpi_launch() {
    let mut scenario = Scenario::with_backend(
        serde_json::json!({
            "resources": { "cpus": 2, "memory": 1, "nodes": 2 },
            "tasks": [ {
                "image": "alpine:latest",
                "runtime": "singularity",
                "cmd": "./solver",
                "mpi": "openmpi",
            } ],
        }),
        ProcessBackend {
            swallow_mpirun: true,
            ..Default::default()
        },
    );
    scenario.context.node = 0;
    scenario.context.hosts = vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()];
    scenario.context.api_url = Some("https://api.example.com".to_string());
    scenario.context.token = Some("tok".to_string());
    let home = scenario.paths().home.clone();
    let backend = scenario.backend.clone();

    let (code, result) = scenario.run().await;

    assert_eq!(code, 0);
    assert_eq!(metrics(&result).len(), 1);

    let runs = backend.runs.lock().unwrap();
    let argv = &runs[0];
    assert_eq!(argv[0], "mpirun");
    assert!(argv.contains(&"-hostfile".to_string()));
    assert_eq!(argv.last().unwrap(), "./solver");

    let hosts = std::fs::read_to_string(home.join(".hosts-0")).unwrap();
    assert_eq!(hosts, "10.0.0.1 slots=2\n10.0.0.2 slots=2\n");
    assert!(home.join(".mpi-remote-0").exists());
}

#[tokio::test]
async fn a_multi_node_mpi_launch_requires_relay_credentials() {
    let mut scenario = Scenario::new(serde_json::json!({
        "resources": { "cpus": 2, "memory": 1, "nodes": 2 },
        "tasks": [ {
            "image": "alpine:latest",
            "runtime": "singularity",
            "cmd": "./solver",
            "mpi": "openmpi",
        } ],
    }));
    scenario.context.node = 0;
    scenario.context.hosts = vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()];
    let home = scenario.paths().home.clone();
    let backend = scenario.backend.clone();

    let (code, result) = scenario.run().await;

    // Without credentials the launch is rejected before anything starts
    assert_eq!(code, 1);
    assert_eq!(metrics(&result)[0].exit_code, -1);
    assert!(backend.runs.lock().unwrap().is_empty());
    assert!(!home.join(".hosts-0").exists());
    assert!(!home.join(".mpi-remote-0").exists());
}

#[tokio::test]
async fn follower_nodes_poll_the_relay_instead_of_launching() {
    let mut scenario = Scenario::new(serde_json::json!({
        "resources": { "cpus": 2, "memory": 1, "nodes": 2 },
        "tasks": [ {
            "image": "alpine:latest",
            "runtime": "singularity",
            "cmd": "./solver",
            "mpi": "openmpi",
        } ],
    }));
    scenario.context.node = 1;
    scenario.context.hosts = vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()];
    scenario
        .channel
        .preload("11/10.0.0.2/0", "sh -c 'echo follower > follower.txt'");
    let home = scenario.paths().home.clone();

    let (code, result) = scenario.run().await;

    assert_eq!(code, 0);
    assert_eq!(metrics(&result)[0].exit_code, 0);
    // The follower runs the relayed command and never builds launch state
    assert!(home.join("follower.txt").exists());
    assert!(!home.join(".hosts-0").exists());
}
