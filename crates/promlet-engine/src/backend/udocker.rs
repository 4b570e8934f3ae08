//! The udocker backend.
//!
//! udocker keeps pulled images in its own per-user repository, so runnable
//! references are image names rather than files; downloaded Docker-archive
//! tarballs enter the repository through `udocker load`.

use std::path::Path;

use indexmap::IndexMap;

use super::Bind;
use super::ContainerBackend;
use super::Invocation;
use super::RunRequest;
use crate::job::PullCredential;

/// Drives tasks through the `udocker` command line.
#[derive(Debug, Default, Clone, Copy)]
pub struct UdockerBackend;

impl ContainerBackend for UdockerBackend {
    fn name(&self) -> &'static str {
        "udocker"
    }

    fn image_is_file(&self) -> bool {
        false
    }

    fn pull_invocation(&self, reference: &str, _dest: &Path) -> Invocation {
        Invocation::new("udocker", vec!["pull".to_string(), reference.to_string()])
    }

    fn load_invocation(&self, archive: &Path, dest: &str) -> Invocation {
        Invocation::new(
            "udocker",
            vec![
                "load".to_string(),
                "-i".to_string(),
                archive.display().to_string(),
                dest.to_string(),
            ],
        )
    }

    fn credential_env(&self, credential: &PullCredential) -> IndexMap<String, String> {
        IndexMap::from([
            ("UDOCKER_USERNAME".to_string(), credential.username.clone()),
            ("UDOCKER_PASSWORD".to_string(), credential.token.clone()),
        ])
    }

    fn run_invocation(&self, request: &RunRequest<'_>) -> Invocation {
        let mut args = vec![
            "run".to_string(),
            format!("--home={home}", home = request.home.display()),
        ];

        for Bind { source, target } in request.binds {
            args.push(format!(
                "-v={source}:{target}",
                source = source.display()
            ));
        }

        for (key, value) in request.env {
            args.push(format!("--env={key}={value}"));
        }

        if let Some(workdir) = request.workdir {
            args.push(format!("--workdir={workdir}"));
        }

        args.push(request.image.to_string());
        args.extend(request.args.iter().cloned());

        Invocation::new("udocker", args)
    }
}
