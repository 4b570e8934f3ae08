//! The Singularity backend.
//!
//! Images are SIF files on disk. Task environment variables are injected
//! through `SINGULARITYENV_`-prefixed variables in the launcher's own
//! environment rather than on the command line, so credentials and user
//! data never appear in the process table.

use std::path::Path;

use indexmap::IndexMap;

use super::Bind;
use super::ContainerBackend;
use super::Invocation;
use super::RunRequest;
use crate::job::PullCredential;

/// The prefix Singularity strips from launcher environment variables when
/// populating the container environment.
const ENV_PREFIX: &str = "SINGULARITYENV_";

/// Drives tasks through the `singularity` command line.
#[derive(Debug, Default, Clone, Copy)]
pub struct SingularityBackend;

impl SingularityBackend {
    /// Normalizes a bare registry reference to a `docker://` URI.
    fn registry_uri(reference: &str) -> String {
        if reference.contains("://") {
            reference.to_string()
        } else {
            format!("docker://{reference}")
        }
    }
}

impl ContainerBackend for SingularityBackend {
    fn name(&self) -> &'static str {
        "singularity"
    }

    fn image_is_file(&self) -> bool {
        true
    }

    fn pull_invocation(&self, reference: &str, dest: &Path) -> Invocation {
        Invocation::new(
            "singularity",
            vec![
                "pull".to_string(),
                "--name".to_string(),
                dest.display().to_string(),
                Self::registry_uri(reference),
            ],
        )
    }

    fn load_invocation(&self, archive: &Path, dest: &str) -> Invocation {
        Invocation::new(
            "singularity",
            vec![
                "build".to_string(),
                dest.to_string(),
                format!("docker-archive://{path}", path = archive.display()),
            ],
        )
    }

    fn credential_env(&self, credential: &PullCredential) -> IndexMap<String, String> {
        IndexMap::from([
            (
                "SINGULARITY_DOCKER_USERNAME".to_string(),
                credential.username.clone(),
            ),
            (
                "SINGULARITY_DOCKER_PASSWORD".to_string(),
                credential.token.clone(),
            ),
        ])
    }

    fn run_invocation(&self, request: &RunRequest<'_>) -> Invocation {
        // `exec` runs an explicit command, `run` the image's entrypoint
        let mut args = vec![
            if request.args.is_empty() { "run" } else { "exec" }.to_string(),
            "--home".to_string(),
            request.home.display().to_string(),
        ];

        for Bind { source, target } in request.binds {
            args.push("--bind".to_string());
            args.push(format!("{source}:{target}", source = source.display()));
        }

        if let Some(workdir) = request.workdir {
            args.push("--pwd".to_string());
            args.push(workdir.to_string());
        }

        args.push(request.image.to_string());
        args.extend(request.args.iter().cloned());

        let env = request
            .env
            .iter()
            .map(|(k, v)| (format!("{ENV_PREFIX}{k}"), v.clone()))
            .collect();

        Invocation {
            program: "singularity".to_string(),
            args,
            env,
        }
    }
}
