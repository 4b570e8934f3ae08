//! Mounting and unmounting job-declared network storage.
//!
//! Storage is mounted before stage-in and unmounted after stage-out; a mount
//! failure is fail-fast for the whole job. The external FUSE clients
//! (`oneclient`, `mount.davfs`) are invoked as subprocesses with explicit
//! environments; credentials travel through the environment or a secrets
//! file, never the command line.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use indexmap::IndexMap;
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::warn;

use crate::config::JobPaths;
use crate::job::StorageKind;
use crate::job::StorageSpec;
use crate::job::WebDavConfig;
use crate::process;
use crate::process::OutputMode;
use crate::report::MountResult;
use crate::report::MountStatus;

/// The wall-clock budget for a mount attempt.
const MOUNT_TIMEOUT: Duration = Duration::from_secs(120);

/// The wall-clock budget for an unmount attempt.
const UNMOUNT_TIMEOUT: Duration = Duration::from_secs(60);

/// A PATH covering the usual locations of the FUSE clients.
const MOUNT_PATH: &str = "/usr/local/bin:/usr/bin:/bin:/usr/sbin:/sbin";

/// Gets the host directory the storage is mounted under.
///
/// The declared mountpoint is re-rooted under the job's `mounts` directory;
/// containers then bind this directory at the declared mountpoint.
pub fn mount_dir(storage: &StorageSpec, paths: &JobPaths) -> PathBuf {
    paths
        .mounts
        .join(storage.mountpoint.trim_start_matches('/'))
}

/// The secrets line `mount.davfs` reads for a WebDAV share.
fn davfs_secrets_line(webdav: &WebDavConfig) -> String {
    format!(
        "{url} {username} {password}\n",
        url = webdav.url,
        username = webdav.username,
        password = webdav.password
    )
}

/// Builds the program, arguments, and environment for a mount invocation.
fn mount_invocation(
    storage: &StorageSpec,
    dir: &Path,
    home: &Path,
) -> Result<(String, Vec<String>, IndexMap<String, String>)> {
    let mut env = IndexMap::new();
    env.insert("PATH".to_string(), MOUNT_PATH.to_string());
    env.insert("HOME".to_string(), home.display().to_string());

    match storage.kind {
        StorageKind::OneData => {
            let onedata = storage
                .onedata
                .as_ref()
                .context("onedata storage is missing its connection details")?;
            env.insert(
                "ONECLIENT_PROVIDER_HOST".to_string(),
                onedata.provider.clone(),
            );
            env.insert("ONECLIENT_ACCESS_TOKEN".to_string(), onedata.token.clone());
            Ok((
                "oneclient".to_string(),
                vec![dir.display().to_string()],
                env,
            ))
        }
        StorageKind::WebDav => {
            let webdav = storage
                .webdav
                .as_ref()
                .context("webdav storage is missing its connection details")?;
            Ok((
                "mount.davfs".to_string(),
                vec![webdav.url.clone(), dir.display().to_string()],
                env,
            ))
        }
    }
}

/// Mounts the declared storage, returning its outcome for the result
/// document.
pub async fn mount(
    storage: &StorageSpec,
    paths: &JobPaths,
    cancel: &CancellationToken,
) -> MountResult {
    let status = match try_mount(storage, paths, cancel).await {
        Ok(true) => {
            info!(
                "mounted {kind:?} storage at `{mountpoint}`",
                kind = storage.kind,
                mountpoint = storage.mountpoint
            );
            MountStatus::Success
        }
        Ok(false) => MountStatus::Failed,
        Err(e) => {
            warn!("failed to mount storage: {e:#}");
            MountStatus::Failed
        }
    };

    MountResult {
        mountpoint: storage.mountpoint.clone(),
        status,
    }
}

/// Performs the mount; returns whether the client exited successfully.
async fn try_mount(
    storage: &StorageSpec,
    paths: &JobPaths,
    cancel: &CancellationToken,
) -> Result<bool> {
    let dir = mount_dir(storage, paths);
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("failed to create mount directory `{dir}`", dir = dir.display()))?;

    // mount.davfs reads credentials from $HOME/.davfs2/secrets
    if storage.kind == StorageKind::WebDav {
        if let Some(webdav) = &storage.webdav {
            let secrets_dir = paths.base.join(".davfs2");
            fs::create_dir_all(&secrets_dir).await.with_context(|| {
                format!(
                    "failed to create directory `{dir}`",
                    dir = secrets_dir.display()
                )
            })?;
            let secrets = secrets_dir.join("secrets");
            fs::write(&secrets, davfs_secrets_line(webdav))
                .await
                .with_context(|| {
                    format!(
                        "failed to write secrets file `{path}`",
                        path = secrets.display()
                    )
                })?;
            fs::set_permissions(&secrets, std::fs::Permissions::from_mode(0o600))
                .await
                .context("failed to restrict secrets file permissions")?;
        }
    }

    let (program, args, env) = mount_invocation(storage, &dir, &paths.base)?;
    let outcome = process::run(
        &program,
        &args,
        &env,
        None,
        MOUNT_TIMEOUT,
        OutputMode::Inherit,
        cancel,
    )
    .await?;
    Ok(outcome.success())
}

/// Unmounts the declared storage, best-effort.
pub async fn unmount(storage: &StorageSpec, paths: &JobPaths, cancel: &CancellationToken) {
    let dir = mount_dir(storage, paths);
    let mut env = IndexMap::new();
    env.insert("PATH".to_string(), MOUNT_PATH.to_string());

    match process::run(
        "fusermount",
        &["-u".to_string(), dir.display().to_string()],
        &env,
        None,
        UNMOUNT_TIMEOUT,
        OutputMode::Inherit,
        cancel,
    )
    .await
    {
        Ok(outcome) if outcome.success() => {
            info!("unmounted storage at `{dir}`", dir = dir.display());
        }
        Ok(_) => warn!("failed to unmount storage at `{dir}`", dir = dir.display()),
        Err(e) => warn!("failed to unmount storage: {e:#}"),
    }
}
