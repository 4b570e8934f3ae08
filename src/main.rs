//! The PROMINENCE job executor command line tool.

use std::io::IsTerminal;
use std::io::stderr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use clap_verbosity_flag::Verbosity;
use indexmap::IndexMap;
use promlet_engine::BackendSet;
use promlet_engine::CancellationToken;
use promlet_engine::HttpCommandChannel;
use promlet_engine::HttpTransfer;
use promlet_engine::JobContext;
use promlet_engine::JobDescription;
use promlet_engine::JobPaths;
use promlet_engine::JobResult;
use promlet_engine::JobRunner;
use tracing_log::AsTrace;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// The path to the job description JSON file.
    #[arg(long)]
    job: PathBuf,

    /// The task-group id assigned by the scheduler.
    #[arg(long)]
    id: u64,

    /// A `key=value` parameter substituted into task commands and
    /// environments; may be repeated.
    #[arg(long = "param", value_name = "KEY=VALUE")]
    params: Vec<String>,

    #[command(flatten)]
    verbose: Verbosity,
}

/// Parses repeated `--param key=value` arguments.
fn parse_params(params: &[String]) -> anyhow::Result<IndexMap<String, String>> {
    let mut map = IndexMap::new();
    for param in params {
        let (key, value) = param
            .split_once('=')
            .with_context(|| format!("malformed `--param {param}`; expected KEY=VALUE"))?;
        map.insert(key.to_string(), value.to_string());
    }
    Ok(map)
}

pub async fn inner() -> anyhow::Result<i32> {
    let cli = Cli::parse();

    tracing_log::LogTracer::init()?;

    let params = parse_params(&cli.params)?;
    let base = std::env::current_dir().context("failed to determine the working directory")?;
    let context = JobContext::load(cli.id, params, &base)?;
    let paths = JobPaths::new(&base, cli.id, context.node);

    // Log to stderr for the scheduler's transfer log and to the per-node
    // file delivered back to the user
    let log_file = std::fs::File::options()
        .create(true)
        .append(true)
        .open(&paths.log)
        .with_context(|| {
            format!("failed to open log file `{path}`", path = paths.log.display())
        })?;
    tracing_subscriber::registry()
        .with(cli.verbose.log_level_filter().as_trace())
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(stderr().is_terminal()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(Arc::new(log_file))
                .with_ansi(false),
        )
        .init();

    let job = JobDescription::from_file(&cli.job)?;

    let cancel = CancellationToken::new();
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("failed to install the SIGTERM handler")?;
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
            tracing::warn!("termination signal received; finishing up");
            cancel.cancel();
        });
    }

    let api_url = context.api_url.clone().unwrap_or_default();
    let token = context.token.clone().unwrap_or_default();
    let result_path = paths.result.clone();

    let runner = JobRunner::new(
        job,
        context,
        paths,
        BackendSet::native(),
        Arc::new(HttpTransfer::new()),
        Arc::new(HttpCommandChannel::new(api_url, token)),
        cancel,
    );

    match runner.run().await {
        Ok(code) => Ok(code),
        Err(e) => {
            // The scheduler always expects a result document, even when the
            // run aborted before writing one
            JobResult::ensure_exists(&result_path);
            Err(e)
        }
    }
}

#[tokio::main]
pub async fn main() {
    match inner().await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("error: {e:?}");
            std::process::exit(1);
        }
    }
}
