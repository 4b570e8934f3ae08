//! Implementation of remote transfers over HTTP.
//!
//! Object storage is treated as an opaque HTTP PUT/GET target; the only
//! intelligence here is header selection (bearer-style auth for network
//! storage sources, the Azure blob-type header when the destination host
//! indicates that backend) and the authenticated "request a new output upload
//! URL" callback. Retry composition lives at the call sites.

use std::path::Path;

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use futures::FutureExt;
use futures::StreamExt;
use futures::future::BoxFuture;
use reqwest::Client;
use reqwest::header::CONTENT_LENGTH;
use serde::Deserialize;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::io::BufWriter;
use tokio_util::io::ReaderStream;
use tracing::debug;
use tracing::info;
use url::Url;

/// The suffix of Azure blob storage hostnames.
const AZURE_BLOB_HOST_SUFFIX: &str = ".blob.core.windows.net";

/// The header Azure requires on blob PUTs.
const AZURE_BLOB_TYPE_HEADER: &str = "x-ms-blob-type";

/// A request for a fresh presigned output upload URL.
#[derive(Debug, Clone, Copy)]
pub struct NewUrlRequest<'a> {
    /// The REST API base URL.
    pub api_url: &'a str,
    /// The job token used to authenticate the callback.
    pub token: &'a str,
    /// The job id.
    pub job_id: u64,
    /// The declared output name.
    pub name: &'a str,
    /// Whether the output is a directory archive.
    pub directory: bool,
}

/// A trait implemented by types responsible for moving artifacts between the
/// worker and object storage.
///
/// Each method represents a single attempt; callers compose retries.
pub trait Transfer: Send + Sync {
    /// Downloads a URL to a local destination path.
    fn download<'a, 'b, 'c>(
        &'a self,
        url: &'b str,
        dest: &'b Path,
        token: Option<&'b str>,
    ) -> BoxFuture<'c, Result<()>>
    where
        'a: 'c,
        'b: 'c,
        Self: 'c;

    /// Uploads a local file to a (presigned) URL.
    fn upload<'a, 'b, 'c>(
        &'a self,
        source: &'b Path,
        url: &'b str,
        token: Option<&'b str>,
    ) -> BoxFuture<'c, Result<()>>
    where
        'a: 'c,
        'b: 'c,
        Self: 'c;

    /// Performs a lightweight test write to check whether a presigned URL
    /// still has sufficient validity remaining.
    fn probe_upload<'a, 'b, 'c>(&'a self, url: &'b str) -> BoxFuture<'c, Result<bool>>
    where
        'a: 'c,
        'b: 'c,
        Self: 'c;

    /// Requests a fresh presigned upload URL through the owning API.
    fn new_output_url<'a, 'b, 'c>(&'a self, request: NewUrlRequest<'b>) -> BoxFuture<'c, Result<String>>
    where
        'a: 'c,
        'b: 'c,
        Self: 'c;
}

/// The response body of the "new output URL" callback.
#[derive(Debug, Deserialize)]
struct NewUrlResponse {
    /// The fresh presigned URL.
    url: String,
}

/// Moves artifacts over HTTP(S), with `file://` support for storage-mounted
/// paths.
#[derive(Debug, Clone, Default)]
pub struct HttpTransfer {
    /// The underlying HTTP client.
    client: Client,
}

impl HttpTransfer {
    /// Constructs a new HTTP transferer.
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    /// Converts a `file://` URL to a local path, if it is one.
    fn as_file_path(url: &str) -> Option<std::path::PathBuf> {
        let url: Url = url.parse().ok()?;
        if url.scheme() == "file" {
            url.to_file_path().ok()
        } else {
            None
        }
    }

    /// Returns `true` if the URL's host indicates Azure blob storage.
    fn is_azure(url: &str) -> bool {
        url.parse::<Url>()
            .ok()
            .and_then(|u| u.host_str().map(|h| h.ends_with(AZURE_BLOB_HOST_SUFFIX)))
            .unwrap_or(false)
    }

    /// Performs a single GET of a URL to a destination file.
    async fn get(&self, url: &str, dest: &Path, token: Option<&str>) -> Result<()> {
        if let Some(path) = Self::as_file_path(url) {
            fs::copy(&path, dest).await.with_context(|| {
                format!(
                    "failed to copy `{path}` to `{dest}`",
                    path = path.display(),
                    dest = dest.display()
                )
            })?;
            return Ok(());
        }

        let mut request = self.client.get(url);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("failed to download `{url}`"))?;

        let status = response.status();
        if !status.is_success() {
            bail!("failed to download `{url}`: server responded with status {status}");
        }

        let file = fs::File::create(dest).await.with_context(|| {
            format!("failed to create file `{dest}`", dest = dest.display())
        })?;
        let mut writer = BufWriter::new(file);
        let mut stream = response.bytes_stream();
        while let Some(bytes) = stream.next().await {
            let bytes =
                bytes.with_context(|| format!("failed to read response body from `{url}`"))?;
            writer.write_all(&bytes).await.with_context(|| {
                format!("failed to write to file `{dest}`", dest = dest.display())
            })?;
        }
        writer.flush().await.with_context(|| {
            format!("failed to flush file `{dest}`", dest = dest.display())
        })?;

        debug!("downloaded `{url}` to `{dest}`", dest = dest.display());
        Ok(())
    }

    /// Performs a single PUT of a local file to a URL.
    async fn put(&self, source: &Path, url: &str, token: Option<&str>) -> Result<()> {
        if let Some(path) = Self::as_file_path(url) {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await.with_context(|| {
                    format!(
                        "failed to create directory `{parent}`",
                        parent = parent.display()
                    )
                })?;
            }
            fs::copy(source, &path).await.with_context(|| {
                format!(
                    "failed to copy `{source}` to `{path}`",
                    source = source.display(),
                    path = path.display()
                )
            })?;
            return Ok(());
        }

        let file = fs::File::open(source).await.with_context(|| {
            format!("failed to open file `{source}`", source = source.display())
        })?;
        let len = file
            .metadata()
            .await
            .with_context(|| {
                format!("failed to stat file `{source}`", source = source.display())
            })?
            .len();

        let mut request = self
            .client
            .put(url)
            .header(CONTENT_LENGTH, len)
            .body(reqwest::Body::wrap_stream(ReaderStream::new(file)));
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        if Self::is_azure(url) {
            request = request.header(AZURE_BLOB_TYPE_HEADER, "BlockBlob");
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("failed to upload `{source}`", source = source.display()))?;

        let status = response.status();
        if !status.is_success() {
            bail!(
                "failed to upload `{source}`: server responded with status {status}",
                source = source.display()
            );
        }

        info!(
            "uploaded `{source}` ({len} bytes)",
            source = source.display()
        );
        Ok(())
    }
}

impl Transfer for HttpTransfer {
    fn download<'a, 'b, 'c>(
        &'a self,
        url: &'b str,
        dest: &'b Path,
        token: Option<&'b str>,
    ) -> BoxFuture<'c, Result<()>>
    where
        'a: 'c,
        'b: 'c,
        Self: 'c,
    {
        self.get(url, dest, token).boxed()
    }

    fn upload<'a, 'b, 'c>(
        &'a self,
        source: &'b Path,
        url: &'b str,
        token: Option<&'b str>,
    ) -> BoxFuture<'c, Result<()>>
    where
        'a: 'c,
        'b: 'c,
        Self: 'c,
    {
        self.put(source, url, token).boxed()
    }

    fn probe_upload<'a, 'b, 'c>(&'a self, url: &'b str) -> BoxFuture<'c, Result<bool>>
    where
        'a: 'c,
        'b: 'c,
        Self: 'c,
    {
        async move {
            if Self::as_file_path(url).is_some() {
                return Ok(true);
            }

            let mut request = self.client.put(url).header(CONTENT_LENGTH, 0u64);
            if Self::is_azure(url) {
                request = request.header(AZURE_BLOB_TYPE_HEADER, "BlockBlob");
            }

            match request.send().await {
                Ok(response) => Ok(response.status().is_success()),
                Err(e) => {
                    debug!("presigned URL probe failed: {e}");
                    Ok(false)
                }
            }
        }
        .boxed()
    }

    fn new_output_url<'a, 'b, 'c>(&'a self, request: NewUrlRequest<'b>) -> BoxFuture<'c, Result<String>>
    where
        'a: 'c,
        'b: 'c,
        Self: 'c,
    {
        async move {
            let endpoint = format!(
                "{api}/jobs/{job}/outputs",
                api = request.api_url.trim_end_matches('/'),
                job = request.job_id
            );

            let response = self
                .client
                .post(&endpoint)
                .bearer_auth(request.token)
                .json(&serde_json::json!({
                    "name": request.name,
                    "type": if request.directory { "directory" } else { "file" },
                }))
                .send()
                .await
                .with_context(|| format!("failed to request upload URL from `{endpoint}`"))?;

            let status = response.status();
            if !status.is_success() {
                bail!(
                    "failed to request upload URL for `{name}`: server responded with status \
                     {status}",
                    name = request.name
                );
            }

            let body: NewUrlResponse = response
                .json()
                .await
                .context("failed to parse upload URL response")?;
            Ok(body.url)
        }
        .boxed()
    }
}
