//! The command-relay channel used for MPI follower coordination.
//!
//! The main node's MPI launcher does not SSH into follower containers;
//! instead the command it wants a follower to run is published to a narrow
//! key-value channel, and the follower polls the same key until the command
//! appears. The channel is treated as at-least-once and eventually
//! consistent, so reads always compose with retry and backoff.

use std::fmt;

use anyhow::Context;
use anyhow::Result;
use anyhow::anyhow;
use anyhow::bail;
use futures::FutureExt;
use futures::future::BoxFuture;
use reqwest::Client;
use reqwest::StatusCode;
use tokio_retry2::Retry;
use tokio_retry2::RetryError;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;

use crate::retry::poll_strategy;

/// The key identifying one relayed command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayKey {
    /// The job id.
    pub job_id: u64,
    /// The address of the node the command is destined for.
    pub host: String,
    /// The index of the task within the job.
    pub task: usize,
}

impl fmt::Display for RelayKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{job}/{host}/{task}",
            job = self.job_id,
            host = self.host,
            task = self.task
        )
    }
}

/// A narrow message-passing abstraction over whatever key-value store is
/// available.
///
/// Each method represents a single attempt; polling composes with retries in
/// [`poll_until`].
pub trait CommandChannel: Send + Sync {
    /// Publishes a command under the given key.
    fn publish<'a, 'b, 'c>(&'a self, key: &'b RelayKey, command: &'b str) -> BoxFuture<'c, Result<()>>
    where
        'a: 'c,
        'b: 'c,
        Self: 'c;

    /// Polls for a command under the given key.
    ///
    /// Returns `Ok(None)` when no command has been published yet.
    fn poll<'a, 'b, 'c>(&'a self, key: &'b RelayKey) -> BoxFuture<'c, Result<Option<String>>>
    where
        'a: 'c,
        'b: 'c,
        Self: 'c;
}

/// A [`CommandChannel`] backed by the REST API's key-value endpoint,
/// authenticated with the job token.
#[derive(Debug, Clone)]
pub struct HttpCommandChannel {
    /// The underlying HTTP client.
    client: Client,
    /// The REST API base URL.
    api_url: String,
    /// The job token.
    token: String,
}

impl HttpCommandChannel {
    /// Constructs a new channel against the given API base URL.
    pub fn new(api_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_url: api_url.into(),
            token: token.into(),
        }
    }

    /// Builds the endpoint URL for a key.
    fn endpoint(&self, key: &RelayKey) -> String {
        format!(
            "{api}/kv/{key}",
            api = self.api_url.trim_end_matches('/')
        )
    }
}

impl CommandChannel for HttpCommandChannel {
    fn publish<'a, 'b, 'c>(&'a self, key: &'b RelayKey, command: &'b str) -> BoxFuture<'c, Result<()>>
    where
        'a: 'c,
        'b: 'c,
        Self: 'c,
    {
        async move {
            let endpoint = self.endpoint(key);
            let response = self
                .client
                .post(&endpoint)
                .bearer_auth(&self.token)
                .body(command.to_string())
                .send()
                .await
                .with_context(|| format!("failed to publish command to `{endpoint}`"))?;

            let status = response.status();
            if !status.is_success() {
                bail!("failed to publish command for `{key}`: server responded with status {status}");
            }

            info!("published command for `{key}`");
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
        async move {
            let endpoint = self.endpoint(key);
            let response = self
                .client
                .get(&endpoint)
                .bearer_auth(&self.token)
                .send()
                .await
                .with_context(|| format!("failed to poll `{endpoint}`"))?;

            match response.status() {
                StatusCode::NOT_FOUND => Ok(None),
                status if status.is_success() => {
                    let command = response
                        .text()
                        .await
                        .context("failed to read relayed command body")?;
                    Ok(Some(command))
                }
                status => bail!("failed to poll `{key}`: server responded with status {status}"),
            }
        }
        .boxed()
    }
}

/// Polls the channel until a command appears, the retry budget is exhausted,
/// or cancellation is requested.
///
/// Returns `Ok(None)` on exhaustion or cancellation; transport errors are
/// treated the same as "not yet published".
pub async fn poll_until(
    channel: &dyn CommandChannel,
    key: &RelayKey,
    retries: usize,
    cancel: &CancellationToken,
) -> Result<Option<String>> {
    let poll = Retry::spawn(poll_strategy(retries), || async {
        match channel.poll(key).await {
            Ok(Some(command)) => Ok(command),
            Ok(None) => {
                debug!("no command published yet for `{key}`");
                Err(RetryError::transient(anyhow!(
                    "no command published for `{key}`"
                )))
            }
            Err(e) => Err(RetryError::transient(e)),
        }
    });

    tokio::select! {
        _ = cancel.cancelled() => Ok(None),
        result = poll => Ok(result.ok()),
    }
}
