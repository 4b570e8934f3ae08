//! Running external commands with wall-clock timeouts and cancellation.
//!
//! Every call site passes an explicit, fully-constructed environment; nothing
//! is inherited from the executor's own environment. A timed-out run must be
//! treated as a failure by the caller regardless of the recorded exit code.

use std::path::Path;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use indexmap::IndexMap;
use tokio::fs::OpenOptions;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::process::Child;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

/// How long to wait after SIGTERM before resorting to SIGKILL.
const TERMINATION_GRACE: Duration = Duration::from_secs(5);

/// Where the child's standard output goes.
#[derive(Debug, Clone)]
pub enum OutputMode {
    /// The child inherits the executor's stdout.
    Inherit,
    /// Bytes are tee'd to both the executor's stdout and an append-mode file
    /// as they arrive.
    ///
    /// Used for a task's declared custom stdout redirect.
    Tee(PathBuf),
}

/// The outcome of running a command.
#[derive(Debug, Clone, Copy)]
pub struct RunOutcome {
    /// The exit code; terminations by signal are mapped to `128 + signal`.
    pub exit_code: i32,
    /// Whether the wall-clock timeout elapsed before the command finished.
    pub timed_out: bool,
    /// Whether the run was aborted by external cancellation.
    pub cancelled: bool,
}

impl RunOutcome {
    /// Returns `true` if the command completed normally with exit code zero.
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out && !self.cancelled
    }
}

/// Runs a command with the given environment and wall-clock timeout.
///
/// On timeout or cancellation the child is sent SIGTERM, given a grace period,
/// and then killed.
pub async fn run(
    program: &str,
    args: &[String],
    env: &IndexMap<String, String>,
    current_dir: Option<&Path>,
    timeout: Duration,
    output: OutputMode,
    cancel: &CancellationToken,
) -> Result<RunOutcome> {
    let mut command = Command::new(program);
    command
        .args(args)
        .env_clear()
        .envs(env)
        .stdin(Stdio::null())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);

    if let Some(dir) = current_dir {
        command.current_dir(dir);
    }

    match &output {
        OutputMode::Inherit => {
            command.stdout(Stdio::inherit());
        }
        OutputMode::Tee(_) => {
            command.stdout(Stdio::piped());
        }
    }

    let mut child = command
        .spawn()
        .with_context(|| format!("failed to spawn `{program}`"))?;
    let id = child.id().context("spawned process should have an id")?;
    info!("spawned process {id} for `{program}`");

    let tee = match &output {
        OutputMode::Inherit => None,
        OutputMode::Tee(path) => Some(spawn_tee(&mut child, path).await?),
    };

    let outcome = tokio::select! {
        _ = cancel.cancelled() => {
            warn!("terminating process {id}: cancellation requested");
            let exit_code = terminate(&mut child).await?;
            RunOutcome { exit_code, timed_out: false, cancelled: true }
        }
        _ = tokio::time::sleep(timeout) => {
            warn!(
                "terminating process {id}: wall-clock timeout of {timeout:?} elapsed"
            );
            let exit_code = terminate(&mut child).await?;
            RunOutcome { exit_code, timed_out: true, cancelled: false }
        }
        status = child.wait() => {
            let status = status
                .with_context(|| format!("failed to wait for termination of process {id}"))?;
            let exit_code = exit_code_of(status);
            debug!("process {id} terminated with exit code {exit_code}");
            RunOutcome { exit_code, timed_out: false, cancelled: false }
        }
    };

    if let Some(tee) = tee {
        tee.await.context("failed to join stdout tee task")??;
    }

    Ok(outcome)
}

/// Spawns the task that tees the child's stdout to the executor's stdout and
/// an append-mode file.
async fn spawn_tee(child: &mut Child, path: &Path) -> Result<JoinHandle<Result<()>>> {
    let mut stdout = child
        .stdout
        .take()
        .context("child process stdout should be piped")?;

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| {
            format!(
                "failed to open stdout redirect file `{path}`",
                path = path.display()
            )
        })?;

    Ok(tokio::spawn(async move {
        let mut own = tokio::io::stdout();
        let mut buf = [0u8; 8192];
        loop {
            let n = stdout
                .read(&mut buf)
                .await
                .context("failed to read child stdout")?;
            if n == 0 {
                break;
            }
            own.write_all(&buf[..n])
                .await
                .context("failed to write to stdout")?;
            file.write_all(&buf[..n])
                .await
                .context("failed to write to stdout redirect file")?;
        }
        file.flush().await.context("failed to flush redirect file")?;
        Ok(())
    }))
}

/// Sends SIGTERM to the child, waits for a grace period, and kills it if it
/// has not exited. Returns the exit code of the terminated process.
async fn terminate(child: &mut Child) -> Result<i32> {
    if let Some(id) = child.id() {
        // SIGTERM first so the child can clean up
        unsafe {
            libc::kill(id as i32, libc::SIGTERM);
        }

        if let Ok(status) = tokio::time::timeout(TERMINATION_GRACE, child.wait()).await {
            return Ok(exit_code_of(status.context("failed to wait for child")?));
        }
    }

    child.start_kill().context("failed to kill child process")?;
    let status = child
        .wait()
        .await
        .context("failed to wait for killed child process")?;
    Ok(exit_code_of(status))
}

/// Maps an exit status to an exit code, translating signal terminations to
/// `128 + signal`.
fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }

    status.code().unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A long timeout for commands expected to finish on their own.
    const LONG: Duration = Duration::from_secs(60);

    /// Runs `sh -c <script>` with the given timeout and output mode.
    async fn sh(
        script: &str,
        env: &IndexMap<String, String>,
        timeout: Duration,
        output: OutputMode,
    ) -> RunOutcome {
        run(
            "sh",
            &["-c".to_string(), script.to_string()],
            env,
            None,
            timeout,
            output,
            &CancellationToken::new(),
        )
        .await
        .expect("command should spawn")
    }

    #[tokio::test]
    async fn exit_codes_are_reported() {
        let env = IndexMap::new();
        let outcome = sh("exit 3", &env, LONG, OutputMode::Inherit).await;
        assert_eq!(outcome.exit_code, 3);
        assert!(!outcome.timed_out);
        assert!(!outcome.success());

        let outcome = sh("true", &env, LONG, OutputMode::Inherit).await;
        assert!(outcome.success());
    }

    #[tokio::test]
    async fn timeout_terminates_the_child() {
        let env = IndexMap::new();
        let outcome = sh(
            "sleep 30",
            &env,
            Duration::from_millis(200),
            OutputMode::Inherit,
        )
        .await;
        assert!(outcome.timed_out);
        assert!(!outcome.success());
    }

    #[tokio::test]
    async fn cancellation_terminates_the_child() {
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            canceller.cancel();
        });

        let outcome = run(
            "sh",
            &["-c".to_string(), "sleep 30".to_string()],
            &IndexMap::new(),
            None,
            LONG,
            OutputMode::Inherit,
            &cancel,
        )
        .await
        .expect("command should spawn");
        assert!(outcome.cancelled);
        assert!(!outcome.success());
    }

    #[tokio::test]
    async fn tee_appends_to_the_redirect_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("task.out");

        let env = IndexMap::new();
        let outcome = sh("echo first", &env, LONG, OutputMode::Tee(path.clone())).await;
        assert!(outcome.success());
        let outcome = sh("echo second", &env, LONG, OutputMode::Tee(path.clone())).await;
        assert!(outcome.success());

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "first\nsecond\n");
    }

    #[tokio::test]
    async fn environment_is_not_inherited() {
        // SAFETY: setting a var in a test process before spawning the child
        unsafe { std::env::set_var("PROMLET_TEST_LEAK", "leaked") };

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("env.out");
        let mut env = IndexMap::new();
        env.insert("EXPLICIT".to_string(), "yes".to_string());

        let outcome = sh(
            "echo ${PROMLET_TEST_LEAK:-unset} $EXPLICIT",
            &env,
            LONG,
            OutputMode::Tee(path.clone()),
        )
        .await;
        assert!(outcome.success());

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.trim(), "unset yes");
    }
}
