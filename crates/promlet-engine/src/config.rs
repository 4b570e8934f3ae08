//! The invocation context of the executor.
//!
//! Beyond the job description itself, the executor learns about its identity
//! and surroundings from a scheduler-provided job-attributes file (HTCondor
//! classad style `Key = "Value"` lines) and from the scheduler environment.
//! The context is read once at startup and immutable thereafter.

use std::env;
use std::fs;
use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use indexmap::IndexMap;
use tracing::warn;

/// The environment variable pointing to the scheduler's job-attributes file.
const JOB_AD_ENV: &str = "_CONDOR_JOB_AD";

/// The fallback name of the job-attributes file in the working directory.
const JOB_AD_FILE: &str = ".job.ad";

/// The environment variable holding this node's index within the job.
const NODE_INDEX_ENV: &str = "_CONDOR_PROCNO";

/// The directory layout of a job on a worker node.
///
/// ```text
/// <base>/                        # the scheduler-provided scratch directory
/// ├─ userhome/                   # the in-container home directory
/// ├─ tmp/                        # the in-container /tmp
/// ├─ mounts/                     # parents for artifact bind mounts
/// ├─ images/                     # resolved container images for this job
/// ├─ promlet.<id>.<node>.json    # the result document
/// ├─ promlet.<id>.<node>.log     # the per-node log file
/// ├─ promlet.lock                # guards against re-entrant execution
/// ```
#[derive(Debug, Clone)]
pub struct JobPaths {
    /// The scratch directory the scheduler placed the job in.
    pub base: PathBuf,
    /// The per-job home directory, bind-mounted as the container home.
    pub home: PathBuf,
    /// The shared temporary directory, bind-mounted as the container `/tmp`.
    pub tmp: PathBuf,
    /// The parent directory for artifact bind-mount sources.
    pub mounts: PathBuf,
    /// The directory holding images resolved for this job.
    pub images: PathBuf,
    /// The path of the result document.
    pub result: PathBuf,
    /// The path of the per-node log file.
    pub log: PathBuf,
    /// The path of the lock file.
    pub lock: PathBuf,
}

impl JobPaths {
    /// Creates the path conventions for the given base directory, task-group
    /// id, and node index.
    pub fn new(base: impl Into<PathBuf>, id: u64, node: u32) -> Self {
        let base = base.into();
        Self {
            home: base.join("userhome"),
            tmp: base.join("tmp"),
            mounts: base.join("mounts"),
            images: base.join("images"),
            result: base.join(format!("promlet.{id}.{node}.json")),
            log: base.join(format!("promlet.{id}.{node}.log")),
            lock: base.join("promlet.lock"),
            base,
        }
    }

    /// Creates the working directories of the layout.
    pub fn create_dirs(&self) -> Result<()> {
        for dir in [&self.home, &self.tmp, &self.mounts, &self.images] {
            fs::create_dir_all(dir).with_context(|| {
                format!("failed to create directory `{dir}`", dir = dir.display())
            })?;
        }
        Ok(())
    }
}

/// The identity and resource context the executor runs with.
#[derive(Debug, Clone, Default)]
pub struct JobContext {
    /// The task-group id passed on the command line.
    pub id: u64,
    /// The job id assigned by the PROMINENCE service.
    pub job_id: u64,
    /// The workflow id, if the job belongs to a workflow.
    pub workflow_id: Option<u64>,
    /// The job token, the sole credential for callbacks to the owning API.
    pub token: Option<String>,
    /// The REST API base URL.
    pub api_url: Option<String>,
    /// The provisioned CPU cores.
    pub cpus: u32,
    /// The provisioned memory, in GB.
    pub memory: u64,
    /// The provisioned disk, in GB.
    pub disk: u64,
    /// The execution site name.
    pub site: Option<String>,
    /// The peer-node addresses of a multi-node job, indexed by node number.
    pub hosts: Vec<String>,
    /// This node's index; node 0 is the main node.
    pub node: u32,
    /// The node-local shared image cache directory, if present.
    pub image_cache: Option<PathBuf>,
    /// Substitution parameters passed on the command line.
    pub params: IndexMap<String, String>,
}

impl JobContext {
    /// Loads the context from the scheduler environment and job-attributes
    /// file.
    ///
    /// A missing attributes file degrades to defaults with a warning; the
    /// executor can still run single-node jobs without API callbacks.
    pub fn load(id: u64, params: IndexMap<String, String>, base: &Path) -> Result<Self> {
        let ad_path = env::var_os(JOB_AD_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| base.join(JOB_AD_FILE));

        let attributes = match fs::read_to_string(&ad_path) {
            Ok(contents) => parse_attributes(&contents),
            Err(e) => {
                warn!(
                    "no job-attributes file at `{path}`: {e}",
                    path = ad_path.display()
                );
                IndexMap::new()
            }
        };

        let node = env::var(NODE_INDEX_ENV)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        Ok(Self::from_attributes(id, params, &attributes, node))
    }

    /// Builds the context from parsed attributes and a node index.
    pub fn from_attributes(
        id: u64,
        params: IndexMap<String, String>,
        attributes: &IndexMap<String, String>,
        node: u32,
    ) -> Self {
        let parse_u64 = |key: &str| attributes.get(key).and_then(|v| v.parse::<u64>().ok());

        Self {
            id,
            job_id: parse_u64("ProminenceJobId").unwrap_or(0),
            workflow_id: parse_u64("ProminenceWorkflowId"),
            token: attributes.get("ProminenceJobToken").cloned(),
            api_url: attributes.get("ProminenceURL").cloned(),
            cpus: parse_u64("ProminenceProvisionedCpus").unwrap_or(1) as u32,
            memory: parse_u64("ProminenceProvisionedMemory").unwrap_or(1),
            disk: parse_u64("ProminenceProvisionedDisk").unwrap_or(0),
            site: attributes.get("ProminenceExecutionSite").cloned(),
            hosts: attributes
                .get("ProminenceNodeHosts")
                .map(|v| {
                    v.split(',')
                        .map(|h| h.trim().to_string())
                        .filter(|h| !h.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            node,
            image_cache: attributes.get("ProminenceImageCache").map(PathBuf::from),
            params,
        }
    }

    /// Returns `true` if this node drives MPI launches and stage-out.
    pub fn is_main_node(&self) -> bool {
        self.node == 0
    }

    /// Substitutes `${name}` and `$name` occurrences of the invocation
    /// parameters into the given text.
    ///
    /// Parameterized task commands and output names are substituted at
    /// submission time for workflow jobs, but command-line parameters still
    /// apply here for jobs resubmitted by hand.
    pub fn substitute(&self, text: &str) -> String {
        let mut result = text.to_string();
        // Longer names first so `$ab` is never clobbered by `$a`
        let mut names: Vec<_> = self.params.keys().collect();
        names.sort_by_key(|n| std::cmp::Reverse(n.len()));
        for name in names {
            let value = &self.params[name.as_str()];
            result = result.replace(&format!("${{{name}}}"), value);
            result = result.replace(&format!("${name}"), value);
        }
        result
    }
}

/// Parses HTCondor classad style `Key = "Value"` lines into a map.
///
/// Values may be quoted strings or bare scalars; lines without `=` are
/// ignored.
pub fn parse_attributes(contents: &str) -> IndexMap<String, String> {
    let mut attributes = IndexMap::new();
    for line in contents.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value.trim().trim_matches('"');
        attributes.insert(key.to_string(), value.to_string());
    }
    attributes
}
