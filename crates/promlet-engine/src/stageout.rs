//! Staging out declared output files and directories.
//!
//! Unlike stage-in, this phase is best-effort: a missing or failing output
//! is recorded and the remaining declared outputs are still attempted. The
//! phase as a whole fails if any output failed, which fails the job's exit
//! code without discarding the other uploads.

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use std::time::Instant;

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use globset::Glob;
use indexmap::IndexMap;
use tokio::fs;
use tokio_retry2::Retry;
use tokio_retry2::RetryError;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::warn;
use walkdir::WalkDir;

use crate::config::JobPaths;
use crate::job::OutputSpec;
use crate::job::StorageSpec;
use crate::mount::mount_dir;
use crate::process;
use crate::process::OutputMode;
use crate::report::StageOutItem;
use crate::report::StageOutResult;
use crate::report::StageOutStatus;
use crate::retry::upload_strategy;
use crate::transfer::NewUrlRequest;
use crate::transfer::Transfer;

/// The wall-clock budget for archiving one output directory.
const TAR_TIMEOUT: Duration = Duration::from_secs(3600);

/// The PATH used when invoking `tar`.
const TOOL_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// The identity and credentials needed to refresh upload URLs.
#[derive(Debug, Clone, Copy, Default)]
pub struct StageOutContext<'a> {
    /// The REST API base URL.
    pub api_url: Option<&'a str>,
    /// The job token.
    pub token: Option<&'a str>,
    /// The job id.
    pub job_id: u64,
}

/// Stages out all declared outputs.
///
/// Returns the recorded outcomes and whether every output succeeded.
pub async fn stage_out(
    files: &[OutputSpec],
    directories: &[OutputSpec],
    storage: Option<&StorageSpec>,
    context: &StageOutContext<'_>,
    transfer: &dyn Transfer,
    paths: &JobPaths,
    cancel: &CancellationToken,
) -> (StageOutResult, bool) {
    let mut result = StageOutResult::default();
    let mut ok = true;

    for spec in files {
        let item = stage_one(spec, false, storage, context, transfer, paths, cancel).await;
        ok &= item.status == StageOutStatus::Success;
        result.files.push(item);
    }

    for spec in directories {
        let item = stage_one(spec, true, storage, context, transfer, paths, cancel).await;
        ok &= item.status == StageOutStatus::Success;
        result.directories.push(item);
    }

    (result, ok)
}

/// Stages out one declared output, recording its status and timing.
async fn stage_one(
    spec: &OutputSpec,
    directory: bool,
    storage: Option<&StorageSpec>,
    context: &StageOutContext<'_>,
    transfer: &dyn Transfer,
    paths: &JobPaths,
    cancel: &CancellationToken,
) -> StageOutItem {
    let started = Instant::now();
    let status = match attempt(spec, directory, storage, context, transfer, paths, cancel).await {
        Ok(()) => StageOutStatus::Success,
        Err(failure) => {
            warn!(
                "failed to stage out `{name}`: {status:?}",
                name = spec.name,
                status = failure
            );
            failure
        }
    };

    StageOutItem {
        name: spec.name.clone(),
        status,
        time: started.elapsed().as_secs_f64(),
    }
}

/// Attempts to stage out one output, mapping each failure to its status.
async fn attempt(
    spec: &OutputSpec,
    directory: bool,
    storage: Option<&StorageSpec>,
    context: &StageOutContext<'_>,
    transfer: &dyn Transfer,
    paths: &JobPaths,
    cancel: &CancellationToken,
) -> Result<(), StageOutStatus> {
    let Some(local) = find_output(&paths.home, &spec.name, directory) else {
        return Err(StageOutStatus::FailedNoSuchFile);
    };

    let (source, upload_name) = if directory {
        let archive = match archive_directory(&local, paths, cancel).await {
            Ok(archive) => archive,
            Err(e) => {
                warn!("failed to archive `{local}`: {e:#}", local = local.display());
                return Err(StageOutStatus::FailedTarCreation);
            }
        };
        let name = format!(
            "{name}.tgz",
            name = local.file_name().and_then(|n| n.to_str()).unwrap_or("output")
        );
        (archive, name)
    } else {
        let name = local
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&spec.name)
            .to_string();
        (local, name)
    };

    match destination(spec, &upload_name, directory, storage, context, transfer, paths).await {
        Ok(Destination::Url(url)) => {
            upload(transfer, &source, &url, cancel)
                .await
                .map_err(|e| {
                    warn!("failed to upload `{name}`: {e:#}", name = spec.name);
                    StageOutStatus::FailedUpload
                })
        }
        Ok(Destination::MountedPath(dest)) => {
            copy_to_storage(&source, &dest).await.map_err(|e| {
                warn!(
                    "failed to copy `{name}` to storage: {e:#}",
                    name = spec.name
                );
                StageOutStatus::FailedUpload
            })
        }
        Err(e) => {
            warn!(
                "no usable destination for `{name}`: {e:#}",
                name = spec.name
            );
            Err(StageOutStatus::FailedUpload)
        }
    }
}

/// Where an output should be delivered.
enum Destination {
    /// Upload over HTTP to a presigned URL.
    Url(String),
    /// Copy onto the mounted network storage.
    MountedPath(PathBuf),
}

/// Determines the destination for one output.
///
/// A declared presigned URL is reused only if a test write shows it is
/// still valid; otherwise a fresh URL is requested through the API, falling
/// back to the job's mounted default storage.
async fn destination(
    spec: &OutputSpec,
    upload_name: &str,
    directory: bool,
    storage: Option<&StorageSpec>,
    context: &StageOutContext<'_>,
    transfer: &dyn Transfer,
    paths: &JobPaths,
) -> Result<Destination> {
    if let Some(url) = &spec.url {
        match transfer.probe_upload(url).await {
            Ok(true) => return Ok(Destination::Url(url.clone())),
            Ok(false) => info!(
                "presigned URL for `{name}` has expired; requesting a fresh one",
                name = spec.name
            ),
            Err(e) => warn!(
                "failed to probe presigned URL for `{name}`: {e:#}",
                name = spec.name
            ),
        }
    }

    if let (Some(api_url), Some(token)) = (context.api_url, context.token) {
        let url = transfer
            .new_output_url(NewUrlRequest {
                api_url,
                token,
                job_id: context.job_id,
                name: &spec.name,
                directory,
            })
            .await
            .context("failed to obtain a fresh upload URL")?;
        return Ok(Destination::Url(url));
    }

    if let Some(storage) = storage.filter(|s| s.default) {
        let dir = mount_dir(storage, paths).join(context.job_id.to_string());
        return Ok(Destination::MountedPath(dir.join(upload_name)));
    }

    bail!("no presigned URL, API credentials, or default storage available")
}

/// Finds the local path matching a declared output name.
///
/// Names may contain glob metacharacters from submission-time parameter
/// substitution, so the job home is walked and matched rather than joined.
fn find_output(home: &Path, name: &str, directory: bool) -> Option<PathBuf> {
    let direct = home.join(name);
    let direct_matches = match std::fs::metadata(&direct) {
        Ok(meta) => meta.is_dir() == directory,
        Err(_) => false,
    };
    if direct_matches {
        return Some(direct);
    }

    let matcher = Glob::new(name).ok()?.compile_matcher();
    WalkDir::new(home)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .find(|entry| {
            entry.file_type().is_dir() == directory
                && entry
                    .path()
                    .strip_prefix(home)
                    .map(|rel| matcher.is_match(rel))
                    .unwrap_or(false)
        })
        .map(|entry| entry.into_path())
}

/// Archives a directory as `<name>.tgz` under the job tmp directory.
async fn archive_directory(
    dir: &Path,
    paths: &JobPaths,
    cancel: &CancellationToken,
) -> Result<PathBuf> {
    let name = dir
        .file_name()
        .and_then(|n| n.to_str())
        .context("output directory has no name")?;
    let archive = paths.tmp.join(format!("{name}.tgz"));
    let parent = dir.parent().context("output directory has no parent")?;

    let args = vec![
        "czf".to_string(),
        archive.display().to_string(),
        "-C".to_string(),
        parent.display().to_string(),
        name.to_string(),
    ];
    let mut env = IndexMap::new();
    env.insert("PATH".to_string(), TOOL_PATH.to_string());

    let outcome = process::run(
        "tar",
        &args,
        &env,
        None,
        TAR_TIMEOUT,
        OutputMode::Inherit,
        cancel,
    )
    .await?;
    if !outcome.success() {
        bail!("`tar` exited with code {code}", code = outcome.exit_code);
    }
    Ok(archive)
}

/// Uploads a file with retries, racing against cancellation.
async fn upload(
    transfer: &dyn Transfer,
    source: &Path,
    url: &str,
    cancel: &CancellationToken,
) -> Result<()> {
    let attempt = Retry::spawn(upload_strategy(), || async {
        transfer
            .upload(source, url, None)
            .await
            .map_err(RetryError::transient)
    });
    tokio::select! {
        _ = cancel.cancelled() => bail!("stage-out cancelled"),
        result = attempt => result,
    }
}

/// Copies an output onto the mounted network storage, creating parents.
async fn copy_to_storage(source: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).await.with_context(|| {
            format!(
                "failed to create directory `{parent}`",
                parent = parent.display()
            )
        })?;
    }
    fs::copy(source, dest).await.with_context(|| {
        format!(
            "failed to copy `{source}` to `{dest}`",
            source = source.display(),
            dest = dest.display()
        )
    })?;
    Ok(())
}
