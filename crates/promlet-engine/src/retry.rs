//! Retry strategies for network-facing operations.
//!
//! Every strategy yields the sleep intervals for the retries that follow the
//! initial attempt, so a strategy with `n` intervals allows `n + 1` attempts
//! in total. Retries are composed with [`tokio_retry2::Retry`] at the call
//! sites; cancellation is raced against the retry future there.

use std::time::Duration;

use tokio_retry2::strategy::ExponentialBackoff;

/// The strategy for artifact and image downloads: 2 retries, 1 second initial
/// delay, doubling.
pub fn download_strategy() -> impl Iterator<Item = Duration> {
    ExponentialBackoff::from_millis(2).factor(500).take(2)
}

/// The strategy for presigned-URL-backed uploads: 3 retries, 2 second initial
/// delay, doubling.
pub fn upload_strategy() -> impl Iterator<Item = Duration> {
    ExponentialBackoff::from_millis(2).factor(1000).take(3)
}

/// The strategy for command-relay polls and other external status queries:
/// `retries` attempts with a linearly increasing delay of `i / 2` seconds.
pub fn poll_strategy(retries: usize) -> impl Iterator<Item = Duration> {
    (1u64..).map(|i| Duration::from_millis(i * 500)).take(retries)
}
