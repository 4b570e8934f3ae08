//! Staging in declared input artifacts.
//!
//! Artifacts are processed in declared order and stage-in is fail-fast: a
//! failed download stops processing immediately and the job never reaches
//! task execution. Decompression is delegated to the usual external tools;
//! an unknown extension is a plain file, not an error.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::Duration;
use std::time::Instant;

use anyhow::Context;
use anyhow::Result;
use indexmap::IndexMap;
use tokio::fs;
use tokio_retry2::Retry;
use tokio_retry2::RetryError;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::warn;

use crate::config::JobPaths;
use crate::job::ArtifactSpec;
use crate::job::StorageSpec;
use crate::process;
use crate::process::OutputMode;
use crate::report::StageInResult;
use crate::report::StageInStatus;
use crate::retry::download_strategy;
use crate::transfer::Transfer;

/// The wall-clock budget for extracting one archive.
const EXTRACT_TIMEOUT: Duration = Duration::from_secs(3600);

/// A PATH covering the usual locations of the archive tools.
const TOOL_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// The archive types recognized by extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    /// A gzip-compressed tarball (`.tgz` or `.tar.gz`).
    TarGz,
    /// A bzip2-compressed tarball (`.tar.bz2`).
    TarBz2,
    /// An uncompressed tarball (`.tar`).
    Tar,
    /// A bare gzip-compressed file (`.gz`).
    Gz,
    /// A bare bzip2-compressed file (`.bz2`).
    Bz2,
    /// A zip archive (`.zip`).
    Zip,
}

impl ArchiveKind {
    /// Whether extraction leaves the original archive behind, requiring an
    /// explicit delete.
    fn leaves_archive(&self) -> bool {
        matches!(self, Self::TarGz | Self::TarBz2 | Self::Tar | Self::Zip)
    }
}

/// Classifies a file name by its archive extension.
pub fn archive_kind(name: &str) -> Option<ArchiveKind> {
    if name.ends_with(".tgz") || name.ends_with(".tar.gz") {
        Some(ArchiveKind::TarGz)
    } else if name.ends_with(".tar.bz2") {
        Some(ArchiveKind::TarBz2)
    } else if name.ends_with(".tar") {
        Some(ArchiveKind::Tar)
    } else if name.ends_with(".gz") {
        Some(ArchiveKind::Gz)
    } else if name.ends_with(".bz2") {
        Some(ArchiveKind::Bz2)
    } else if name.ends_with(".zip") {
        Some(ArchiveKind::Zip)
    } else {
        None
    }
}

/// Builds the external tool invocation that extracts an archive in place.
fn extract_invocation(kind: ArchiveKind, archive: &Path, dir: &Path) -> (String, Vec<String>) {
    let archive = archive.display().to_string();
    let dir = dir.display().to_string();
    match kind {
        ArchiveKind::TarGz => (
            "tar".to_string(),
            vec!["xzf".to_string(), archive, "-C".to_string(), dir],
        ),
        ArchiveKind::TarBz2 => (
            "tar".to_string(),
            vec!["xjf".to_string(), archive, "-C".to_string(), dir],
        ),
        ArchiveKind::Tar => (
            "tar".to_string(),
            vec!["xf".to_string(), archive, "-C".to_string(), dir],
        ),
        ArchiveKind::Gz => ("gunzip".to_string(), vec![archive]),
        ArchiveKind::Bz2 => ("bunzip2".to_string(), vec![archive]),
        ArchiveKind::Zip => (
            "unzip".to_string(),
            vec!["-o".to_string(), archive, "-d".to_string(), dir],
        ),
    }
}

/// Resolves the effective download URL of an artifact.
///
/// Relative paths are prefixed with the default network storage's base URL
/// when the job declares one; absolute URLs pass through unchanged.
pub fn effective_url(artifact: &ArtifactSpec, storage: Option<&StorageSpec>) -> String {
    let is_absolute = artifact.url.contains("://");
    if is_absolute {
        return artifact.url.clone();
    }

    match storage.filter(|s| s.default).and_then(|s| s.base_url()) {
        Some(base) => format!(
            "{base}/{path}",
            base = base.trim_end_matches('/'),
            path = artifact.url.trim_start_matches('/')
        ),
        None => artifact.url.clone(),
    }
}

/// Gets the file name of an artifact from its URL.
fn artifact_name(url: &str) -> String {
    url.rsplit('/')
        .next()
        .unwrap_or(url)
        .split('?')
        .next()
        .unwrap_or(url)
        .to_string()
}

/// Stages in all declared artifacts.
///
/// Returns the per-artifact outcomes and whether the phase as a whole
/// succeeded; on failure no artifact after the failing one is attempted.
pub async fn stage_in(
    artifacts: &[ArtifactSpec],
    storage: Option<&StorageSpec>,
    transfer: &dyn Transfer,
    token: Option<&str>,
    paths: &JobPaths,
    cancel: &CancellationToken,
) -> (Vec<StageInResult>, bool) {
    let mut results = Vec::with_capacity(artifacts.len());

    for artifact in artifacts {
        if cancel.is_cancelled() {
            warn!("stage-in aborted: cancellation requested");
            return (results, false);
        }

        let url = effective_url(artifact, storage);
        let name = artifact_name(&url);
        let started = Instant::now();

        match stage_one(artifact, &url, &name, transfer, token, paths, cancel).await {
            Ok(()) => {
                results.push(StageInResult {
                    name,
                    status: StageInStatus::Success,
                    time: started.elapsed().as_secs_f64(),
                });
            }
            Err(StageFailure::Download(e)) => {
                warn!("failed to download artifact `{name}`: {e:#}");
                results.push(StageInResult {
                    name,
                    status: StageInStatus::FailedDownload,
                    time: started.elapsed().as_secs_f64(),
                });
                return (results, false);
            }
            Err(StageFailure::Uncompress(e)) => {
                warn!("failed to extract artifact `{name}`: {e:#}");
                results.push(StageInResult {
                    name,
                    status: StageInStatus::FailedUncompress,
                    time: started.elapsed().as_secs_f64(),
                });
                return (results, false);
            }
        }
    }

    (results, true)
}

/// Distinguishes which phase of staging one artifact failed.
enum StageFailure {
    /// The download failed after retries.
    Download(anyhow::Error),
    /// The downloaded archive failed to extract.
    Uncompress(anyhow::Error),
}

/// Stages one artifact: download with retry, extract, set permissions.
async fn stage_one(
    artifact: &ArtifactSpec,
    url: &str,
    name: &str,
    transfer: &dyn Transfer,
    token: Option<&str>,
    paths: &JobPaths,
    cancel: &CancellationToken,
) -> Result<(), StageFailure> {
    // Artifacts bound into containers land under their mount source
    // directory; everything else lands directly in the job home.
    let dest_dir = match artifact.mount_pair() {
        Some((source, _)) => paths.home.join(source),
        None => paths.home.clone(),
    };
    fs::create_dir_all(&dest_dir)
        .await
        .with_context(|| {
            format!(
                "failed to create directory `{dir}`",
                dir = dest_dir.display()
            )
        })
        .map_err(StageFailure::Download)?;

    let dest = dest_dir.join(name);
    info!("staging in `{url}` to `{dest}`", dest = dest.display());

    let download = Retry::spawn(download_strategy(), || async {
        transfer
            .download(url, &dest, token)
            .await
            .map_err(RetryError::transient)
    });
    let downloaded = tokio::select! {
        _ = cancel.cancelled() => Err(anyhow::anyhow!("stage-in cancelled")),
        result = download => result,
    };
    downloaded.map_err(StageFailure::Download)?;

    let mut staged = dest.clone();
    if let Some(kind) = archive_kind(name) {
        extract(kind, &dest, &dest_dir, cancel)
            .await
            .map_err(StageFailure::Uncompress)?;

        // gunzip/bunzip2 replace the file, dropping the final extension
        staged = match kind {
            ArchiveKind::Gz | ArchiveKind::Bz2 => {
                dest_dir.join(name.rsplit_once('.').map(|(stem, _)| stem).unwrap_or(name))
            }
            _ => dest.clone(),
        };
    }

    if artifact.executable && fs::metadata(&staged).await.is_ok() {
        fs::set_permissions(&staged, std::fs::Permissions::from_mode(0o755))
            .await
            .with_context(|| {
                format!(
                    "failed to set executable permissions on `{path}`",
                    path = staged.display()
                )
            })
            .map_err(StageFailure::Download)?;
    }

    Ok(())
}

/// Extracts an archive with the corresponding external tool and deletes the
/// archive afterwards where the tool leaves it behind.
async fn extract(
    kind: ArchiveKind,
    archive: &Path,
    dir: &Path,
    cancel: &CancellationToken,
) -> Result<()> {
    let (program, args) = extract_invocation(kind, archive, dir);
    let mut env = IndexMap::new();
    env.insert("PATH".to_string(), TOOL_PATH.to_string());

    let outcome = process::run(
        &program,
        &args,
        &env,
        None,
        EXTRACT_TIMEOUT,
        OutputMode::Inherit,
        cancel,
    )
    .await?;

    if !outcome.success() {
        anyhow::bail!(
            "`{program}` exited with code {code}",
            code = outcome.exit_code
        );
    }

    if kind.leaves_archive() {
        fs::remove_file(archive).await.with_context(|| {
            format!(
                "failed to delete extracted archive `{path}`",
                path = archive.display()
            )
        })?;
    }

    Ok(())
}
