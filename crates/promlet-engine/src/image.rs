//! Resolving task images to runnable local references.
//!
//! Resolution minimizes redundant transfer with two layers: an in-job memo
//! (identical reference and runtime within one job never download twice) and
//! a node-local cache shared across jobs, addressed by SHA-256 checksum.
//!
//! A cache entry is two files under its checksum-named directory: the image
//! data and a zero-byte `.done` marker created only after the copy has
//! finished. Data without the marker is an in-progress entry and is never
//! trusted; a complete entry is still re-hashed before reuse so a corrupt
//! file cannot be served. Concurrent writers racing on the same checksum are
//! harmless, the copies are byte-identical.

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use std::time::Instant;

use anyhow::Context;
use anyhow::Result;
use anyhow::anyhow;
use anyhow::bail;
use indexmap::IndexMap;
use sha2::Digest;
use sha2::Sha256;
use tokio::fs;
use tokio_retry2::Retry;
use tokio_retry2::RetryError;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::warn;

use crate::backend::ContainerBackend;
use crate::config::JobPaths;
use crate::job::ContainerRuntime;
use crate::job::StorageSpec;
use crate::job::TaskSpec;
use crate::mount::mount_dir;
use crate::process;
use crate::process::OutputMode;
use crate::report::ImagePullStatus;
use crate::retry::download_strategy;
use crate::transfer::Transfer;

/// The wall-clock budget for one registry pull or archive conversion.
const PULL_TIMEOUT: Duration = Duration::from_secs(3600);

/// The name of the data file within a cache entry directory.
const CACHE_DATA_NAME: &str = "image";

/// The name of the completion marker within a cache entry directory.
const CACHE_DONE_NAME: &str = ".done";

/// The PATH used when invoking container runtimes.
const RUNTIME_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// A task image resolved to something a backend can run.
#[derive(Debug, Clone)]
pub struct ResolvedImage {
    /// The runnable reference to hand to the backend.
    pub reference: String,
    /// The SHA-256 checksum of the image file, when it is file-backed.
    pub sha256: Option<String>,
    /// How the image was obtained.
    pub status: ImagePullStatus,
    /// The time spent resolving, in seconds.
    pub time: f64,
}

/// A memoized resolution from earlier in the same job.
#[derive(Debug, Clone)]
struct MemoEntry {
    /// The runnable reference.
    reference: String,
    /// The checksum, when file-backed.
    sha256: Option<String>,
}

/// Resolves task image references, one instance per job run.
pub struct ImageResolver {
    /// The job id, used to name backend-internal images uniquely.
    job_id: u64,
    /// The per-job directory holding downloaded and converted images.
    images_dir: PathBuf,
    /// The node-local shared cache root, when the worker provides one.
    cache_root: Option<PathBuf>,
    /// Where the job's network storage is mounted, when declared.
    storage_mount: Option<(String, PathBuf)>,
    /// Resolutions already performed in this job.
    memo: IndexMap<(String, ContainerRuntime), MemoEntry>,
}

impl ImageResolver {
    /// Constructs a resolver for one job run.
    pub fn new(
        job_id: u64,
        paths: &JobPaths,
        cache_root: Option<PathBuf>,
        storage: Option<&StorageSpec>,
    ) -> Self {
        Self {
            job_id,
            images_dir: paths.images.clone(),
            cache_root,
            storage_mount: storage.map(|s| (s.mountpoint.clone(), mount_dir(s, paths))),
            memo: IndexMap::new(),
        }
    }

    /// Resolves the image of one task.
    ///
    /// An error here is fatal for the task but not for the process; the
    /// caller records it as a failed pull.
    pub async fn resolve(
        &mut self,
        task_index: usize,
        task: &TaskSpec,
        backend: &dyn ContainerBackend,
        transfer: &dyn Transfer,
        cancel: &CancellationToken,
    ) -> Result<ResolvedImage> {
        let started = Instant::now();
        let memo_key = (task.image.clone(), task.runtime);

        if let Some(entry) = self.memo.get(&memo_key) {
            info!(
                "image `{image}` already resolved earlier in this job",
                image = task.image
            );
            return Ok(ResolvedImage {
                reference: entry.reference.clone(),
                sha256: entry.sha256.clone(),
                status: ImagePullStatus::Cached,
                time: started.elapsed().as_secs_f64(),
            });
        }

        if backend.image_is_file() {
            if let Some(sha256) = &task.image_sha256 {
                if let Some(path) = self.cache_lookup(sha256).await {
                    info!("image `{image}` served from the node cache", image = task.image);
                    let resolved = ResolvedImage {
                        reference: path.display().to_string(),
                        sha256: Some(sha256.clone()),
                        status: ImagePullStatus::Cached,
                        time: started.elapsed().as_secs_f64(),
                    };
                    self.remember(memo_key, &resolved);
                    return Ok(resolved);
                }
            }
        }

        let resolved = self
            .resolve_by_kind(task_index, task, backend, transfer, cancel)
            .await?;
        let resolved = ResolvedImage {
            time: started.elapsed().as_secs_f64(),
            ..resolved
        };
        self.remember(memo_key, &resolved);
        Ok(resolved)
    }

    /// Records a resolution in the in-job memo.
    fn remember(&mut self, key: (String, ContainerRuntime), resolved: &ResolvedImage) {
        self.memo.insert(
            key,
            MemoEntry {
                reference: resolved.reference.clone(),
                sha256: resolved.sha256.clone(),
            },
        );
    }

    /// Looks up a complete, verified cache entry for a checksum.
    async fn cache_lookup(&self, sha256: &str) -> Option<PathBuf> {
        let root = self.cache_root.as_ref()?;
        let entry = root.join(sha256);
        let data = entry.join(CACHE_DATA_NAME);
        let done = entry.join(CACHE_DONE_NAME);

        if fs::metadata(&done).await.is_err() || fs::metadata(&data).await.is_err() {
            return None;
        }

        // An entry is re-hashed on every use; a corrupt file must not be
        // served just because its marker exists
        match sha256_file(&data).await {
            Ok(actual) if actual == sha256 => Some(data),
            Ok(actual) => {
                warn!(
                    "cache entry `{entry}` has checksum {actual}, expected {sha256}; ignoring",
                    entry = entry.display()
                );
                None
            }
            Err(e) => {
                warn!(
                    "failed to hash cache entry `{entry}`: {e:#}",
                    entry = entry.display()
                );
                None
            }
        }
    }

    /// Copies a freshly obtained image into the node cache, marker last.
    async fn cache_insert(&self, sha256: &str, source: &Path) {
        let Some(root) = &self.cache_root else {
            return;
        };
        if fs::metadata(root).await.is_err() {
            return;
        }

        let entry = root.join(sha256);
        let result: Result<()> = async {
            fs::create_dir_all(&entry).await?;
            fs::copy(source, entry.join(CACHE_DATA_NAME)).await?;
            fs::write(entry.join(CACHE_DONE_NAME), b"").await?;
            Ok(())
        }
        .await;

        // Cache population is opportunistic; the job proceeds either way
        if let Err(e) = result {
            warn!(
                "failed to cache image under `{entry}`: {e:#}",
                entry = entry.display()
            );
        } else {
            info!("cached image as `{entry}`", entry = entry.display());
        }
    }

    /// Resolves an image by the kind of its reference.
    async fn resolve_by_kind(
        &self,
        task_index: usize,
        task: &TaskSpec,
        backend: &dyn ContainerBackend,
        transfer: &dyn Transfer,
        cancel: &CancellationToken,
    ) -> Result<ResolvedImage> {
        let image = task.image.as_str();

        if image.starts_with("http://") || image.starts_with("https://") || image.starts_with("file://")
        {
            return self
                .resolve_url(task_index, task, backend, transfer, cancel)
                .await;
        }

        if let Some(root) = &self.cache_root {
            if let Ok(relative) = Path::new(image).strip_prefix(root) {
                let link = self.images_dir.join(format!("image-{task_index}"));
                let _ = fs::remove_file(&link).await;
                fs::symlink(root.join(relative), &link)
                    .await
                    .with_context(|| {
                        format!("failed to symlink cached image `{image}`")
                    })?;
                let sha256 = sha256_file(&link).await?;
                return Ok(ResolvedImage {
                    reference: link.display().to_string(),
                    sha256: Some(sha256),
                    status: ImagePullStatus::Cached,
                    time: 0.0,
                });
            }
        }

        if let Some((mountpoint, mounted)) = &self.storage_mount {
            if let Ok(relative) = Path::new(image).strip_prefix(mountpoint) {
                let path = mounted.join(relative);
                if fs::metadata(&path).await.is_err() {
                    bail!(
                        "image `{image}` not found on mounted storage at `{path}`",
                        path = path.display()
                    );
                }
                let sha256 = sha256_file(&path).await?;
                return Ok(ResolvedImage {
                    reference: path.display().to_string(),
                    sha256: Some(sha256),
                    status: ImagePullStatus::Completed,
                    time: 0.0,
                });
            }
        }

        self.resolve_registry(task_index, task, backend, cancel)
            .await
    }

    /// Downloads an image from a URL, converting Docker archives as needed.
    async fn resolve_url(
        &self,
        task_index: usize,
        task: &TaskSpec,
        backend: &dyn ContainerBackend,
        transfer: &dyn Transfer,
        cancel: &CancellationToken,
    ) -> Result<ResolvedImage> {
        let url = task.image.as_str();
        let name = url
            .rsplit('/')
            .next()
            .and_then(|n| n.split('?').next())
            .unwrap_or("image");
        let downloaded = self.images_dir.join(format!("download-{task_index}-{name}"));

        info!("downloading image `{url}`");
        let download = Retry::spawn(download_strategy(), || async {
            transfer
                .download(url, &downloaded, None)
                .await
                .map_err(RetryError::transient)
        });
        tokio::select! {
            _ = cancel.cancelled() => bail!("image download cancelled"),
            result = download => result,
        }?;

        if name.ends_with(".tar") {
            // A Docker archive must enter the backend's native format first
            let reference = if backend.image_is_file() {
                let converted = self.images_dir.join(format!("image-{task_index}.sif"));
                self.run_runtime(
                    backend.load_invocation(&downloaded, &converted.display().to_string()),
                    cancel,
                )
                .await?;
                converted.display().to_string()
            } else {
                let loaded = format!("job-{job}-task-{task_index}", job = self.job_id);
                self.run_runtime(backend.load_invocation(&downloaded, &loaded), cancel)
                    .await?;
                loaded
            };
            fs::remove_file(&downloaded).await.ok();

            let sha256 = if backend.image_is_file() {
                let sha = sha256_file(Path::new(&reference)).await?;
                self.cache_insert(&sha, Path::new(&reference)).await;
                Some(sha)
            } else {
                None
            };
            return Ok(ResolvedImage {
                reference,
                sha256,
                status: ImagePullStatus::Completed,
                time: 0.0,
            });
        }

        let sha256 = if backend.image_is_file() {
            let sha = sha256_file(&downloaded).await?;
            self.cache_insert(&sha, &downloaded).await;
            Some(sha)
        } else {
            None
        };
        Ok(ResolvedImage {
            reference: downloaded.display().to_string(),
            sha256,
            status: ImagePullStatus::Completed,
            time: 0.0,
        })
    }

    /// Pulls an image from a container registry, with retries.
    async fn resolve_registry(
        &self,
        task_index: usize,
        task: &TaskSpec,
        backend: &dyn ContainerBackend,
        cancel: &CancellationToken,
    ) -> Result<ResolvedImage> {
        let dest = self.images_dir.join(format!("image-{task_index}.sif"));
        let mut invocation = backend.pull_invocation(&task.image, &dest);
        if let Some(credential) = &task.image_pull_credential {
            invocation.env.extend(backend.credential_env(credential));
        }

        info!(
            "pulling image `{image}` with {runtime}",
            image = task.image,
            runtime = backend.name()
        );
        let pull = Retry::spawn(download_strategy(), || async {
            // Retrying a partial pull over a stale destination fails, so
            // clear it first
            let _ = fs::remove_file(&dest).await;
            self.run_runtime(invocation.clone(), cancel)
                .await
                .map_err(RetryError::transient)
        });
        tokio::select! {
            _ = cancel.cancelled() => bail!("image pull cancelled"),
            result = pull => result,
        }?;

        if backend.image_is_file() {
            let sha256 = sha256_file(&dest).await?;
            self.cache_insert(&sha256, &dest).await;
            Ok(ResolvedImage {
                reference: dest.display().to_string(),
                sha256: Some(sha256),
                status: ImagePullStatus::Completed,
                time: 0.0,
            })
        } else {
            Ok(ResolvedImage {
                reference: task.image.clone(),
                sha256: None,
                status: ImagePullStatus::Completed,
                time: 0.0,
            })
        }
    }

    /// Runs one container-runtime invocation to completion.
    async fn run_runtime(
        &self,
        invocation: crate::backend::Invocation,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut env = invocation.env;
        env.insert("PATH".to_string(), RUNTIME_PATH.to_string());
        env.insert(
            "HOME".to_string(),
            self.images_dir.display().to_string(),
        );

        let outcome = process::run(
            &invocation.program,
            &invocation.args,
            &env,
            None,
            PULL_TIMEOUT,
            OutputMode::Inherit,
            cancel,
        )
        .await?;

        if !outcome.success() {
            bail!(
                "`{program}` exited with code {code}",
                program = invocation.program,
                code = outcome.exit_code
            );
        }
        Ok(())
    }
}

/// Computes the SHA-256 checksum of a file, lowercase hex encoded.
///
/// Hashing happens on the blocking pool; images can be gigabytes.
pub async fn sha256_file(path: &Path) -> Result<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut file = std::fs::File::open(&path)
            .with_context(|| format!("failed to open `{path}`", path = path.display()))?;
        let mut hasher = Sha256::new();
        std::io::copy(&mut file, &mut hasher)
            .with_context(|| format!("failed to hash `{path}`", path = path.display()))?;
        Ok(hex::encode(hasher.finalize()))
    })
    .await
    .map_err(|e| anyhow!("hashing task panicked: {e}"))?
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Mutex;

    use futures::FutureExt;
    use futures::future::BoxFuture;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::backend::SingularityBackend;
    use crate::transfer::HttpTransfer;
    use crate::transfer::NewUrlRequest;

    /// A transferer that records downloads and serves fixed bytes.
    #[derive(Default)]
    struct CountingTransfer {
        /// The number of downloads performed.
        downloads: Mutex<usize>,
    }

    impl Transfer for CountingTransfer {
        fn download<'a, 'b, 'c>(
            &'a self,
            _: &'b str,
            dest: &'b Path,
            _: Option<&'b str>,
        ) -> BoxFuture<'c, Result<()>>
        where
            'a: 'c,
            'b: 'c,
            Self: 'c,
        {
            async move {
                *self.downloads.lock().unwrap() += 1;
                std::fs::write(dest, b"image bytes")?;
                Ok(())
            }
            .boxed()
        }

        fn upload<'a, 'b, 'c>(
            &'a self,
            _: &'b Path,
            _: &'b str,
            _: Option<&'b str>,
        ) -> BoxFuture<'c, Result<()>>
        where
            'a: 'c,
            'b: 'c,
            Self: 'c,
        {
            async move { Ok(()) }.boxed()
        }

        fn probe_upload<'a, 'b, 'c>(&'a self, _: &'b str) -> BoxFuture<'c, Result<bool>>
        where
            'a: 'c,
            'b: 'c,
            Self: 'c,
        {
            async move { Ok(true) }.boxed()
        }

        fn new_output_url<'a, 'b, 'c>(
            &'a self,
            _: NewUrlRequest<'b>,
        ) -> BoxFuture<'c, Result<String>>
        where
            'a: 'c,
            'b: 'c,
            Self: 'c,
        {
            async move { anyhow::bail!("not implemented") }.boxed()
        }
    }

    /// Creates the job directory layout in a temp dir.
    fn temp_paths() -> (tempfile::TempDir, JobPaths) {
        let dir = tempfile::tempdir().unwrap();
        let paths = JobPaths::new(dir.path(), 0, 0);
        paths.create_dirs().unwrap();
        (dir, paths)
    }

    /// A task with the given image reference.
    fn task(image: &str) -> TaskSpec {
        serde_json::from_value(serde_json::json!({
            "image": image,
            "runtime": "singularity",
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn sha256_matches_a_known_vector() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, b"abc").await.unwrap();
        assert_eq!(
            sha256_file(&path).await.unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn identical_references_download_once() {
        let (_dir, paths) = temp_paths();
        let mut resolver = ImageResolver::new(1, &paths, None, None);
        let transfer = CountingTransfer::default();
        let spec = task("https://example.com/tool.sif");
        let cancel = CancellationToken::new();

        let first = resolver
            .resolve(0, &spec, &SingularityBackend, &transfer, &cancel)
            .await
            .unwrap();
        let second = resolver
            .resolve(1, &spec, &SingularityBackend, &transfer, &cancel)
            .await
            .unwrap();

        assert_eq!(first.status, ImagePullStatus::Completed);
        assert_eq!(second.status, ImagePullStatus::Cached);
        assert_eq!(second.reference, first.reference);
        assert_eq!(second.sha256, first.sha256);
        assert_eq!(*transfer.downloads.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn verified_cache_entries_are_served_without_download() {
        let (_dir, paths) = temp_paths();
        let cache = tempfile::tempdir().unwrap();

        let sha256 = {
            let entry = cache.path().join(
                "774629575ee194bb4f46e61d209a1207b7e8e7e397ddba47dcfd1287cab4fbf9",
            );
            std::fs::create_dir_all(&entry).unwrap();
            std::fs::write(entry.join("image"), b"cached image").unwrap();
            std::fs::write(entry.join(".done"), b"").unwrap();
            "774629575ee194bb4f46e61d209a1207b7e8e7e397ddba47dcfd1287cab4fbf9"
        };

        let mut spec = task("https://example.com/tool.sif");
        spec.image_sha256 = Some(sha256.to_string());

        let mut resolver =
            ImageResolver::new(1, &paths, Some(cache.path().to_path_buf()), None);
        let transfer = CountingTransfer::default();
        let resolved = resolver
            .resolve(0, &spec, &SingularityBackend, &transfer, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(resolved.status, ImagePullStatus::Cached);
        assert_eq!(resolved.sha256.as_deref(), Some(sha256));
        assert_eq!(*transfer.downloads.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn incomplete_cache_entries_are_ignored() {
        let (_dir, paths) = temp_paths();
        let cache = tempfile::tempdir().unwrap();

        // Data present, no marker: another writer may still be copying
        let sha256 = "774629575ee194bb4f46e61d209a1207b7e8e7e397ddba47dcfd1287cab4fbf9";
        let entry = cache.path().join(sha256);
        std::fs::create_dir_all(&entry).unwrap();
        std::fs::write(entry.join("image"), b"cached image").unwrap();

        let mut spec = task("https://example.com/tool.sif");
        spec.image_sha256 = Some(sha256.to_string());

        let mut resolver =
            ImageResolver::new(1, &paths, Some(cache.path().to_path_buf()), None);
        let transfer = CountingTransfer::default();
        let resolved = resolver
            .resolve(0, &spec, &SingularityBackend, &transfer, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(resolved.status, ImagePullStatus::Completed);
        assert_eq!(*transfer.downloads.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn corrupt_cache_entries_are_ignored() {
        let (_dir, paths) = temp_paths();
        let cache = tempfile::tempdir().unwrap();

        let declared = "774629575ee194bb4f46e61d209a1207b7e8e7e397ddba47dcfd1287cab4fbf9";
        let entry = cache.path().join(declared);
        std::fs::create_dir_all(&entry).unwrap();
        std::fs::write(entry.join("image"), b"tampered bytes").unwrap();
        std::fs::write(entry.join(".done"), b"").unwrap();

        let mut spec = task("https://example.com/tool.sif");
        spec.image_sha256 = Some(declared.to_string());

        let mut resolver =
            ImageResolver::new(1, &paths, Some(cache.path().to_path_buf()), None);
        let transfer = CountingTransfer::default();
        let resolved = resolver
            .resolve(0, &spec, &SingularityBackend, &transfer, &CancellationToken::new())
            .await
            .unwrap();

        // The tampered entry is rejected and a fresh download occurs
        assert_eq!(resolved.status, ImagePullStatus::Completed);
        assert_eq!(*transfer.downloads.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn fresh_downloads_populate_the_cache_marker_last() {
        let (_dir, paths) = temp_paths();
        let cache = tempfile::tempdir().unwrap();

        let source_dir = tempfile::tempdir().unwrap();
        let source = source_dir.path().join("tool.sif");
        std::fs::write(&source, b"sif bytes").unwrap();
        let url = url::Url::from_file_path(&source).unwrap();

        let mut resolver =
            ImageResolver::new(1, &paths, Some(cache.path().to_path_buf()), None);
        let resolved = resolver
            .resolve(
                0,
                &task(url.as_str()),
                &SingularityBackend,
                &HttpTransfer::new(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let sha256 = resolved.sha256.expect("file-backed image should be hashed");
        let entry = cache.path().join(&sha256);
        assert!(entry.join("image").exists());
        assert!(entry.join(".done").exists());
        assert_eq!(
            std::fs::read(entry.join("image")).unwrap(),
            b"sif bytes".to_vec()
        );
    }

    #[tokio::test]
    async fn storage_mounted_paths_resolve_through_the_mount() {
        let (_dir, paths) = temp_paths();
        let storage: StorageSpec = serde_json::from_value(serde_json::json!({
            "type": "webdav",
            "mountpoint": "/data",
            "webdav": { "url": "https://dav.example.com", "username": "u", "password": "p" }
        }))
        .unwrap();

        let mounted = mount_dir(&storage, &paths).join("images");
        std::fs::create_dir_all(&mounted).unwrap();
        std::fs::write(mounted.join("tool.sif"), b"storage image").unwrap();

        let mut resolver = ImageResolver::new(1, &paths, None, Some(&storage));
        let transfer = CountingTransfer::default();
        let resolved = resolver
            .resolve(
                0,
                &task("/data/images/tool.sif"),
                &SingularityBackend,
                &transfer,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(resolved.reference.ends_with("images/tool.sif"));
        assert_eq!(resolved.status, ImagePullStatus::Completed);
        assert_eq!(*transfer.downloads.lock().unwrap(), 0);
    }
}
