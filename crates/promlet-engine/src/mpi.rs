//! MPI launch assembly for multi-node tasks.
//!
//! The main node writes a hosts file and a remote-execution wrapper script,
//! then runs `mpirun` inside its own task container. The wrapper stands in
//! for `ssh`: instead of connecting to the remote host it publishes the
//! launcher's daemon command on the command relay and then blocks, keeping
//! the launcher convinced the remote connection is alive while the follower
//! node polls the relay and runs the command itself. No inbound
//! connectivity into worker containers is ever required.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;

use crate::job::MpiFlavor;

/// Environment variable names propagated to remote MPI ranks.
pub const ENV_ALLOWLIST: &[&str] = &[
    "PROMINENCE_CPUS",
    "PROMINENCE_MEMORY",
    "PROMINENCE_NODES",
    "PROMINENCE_NODE_NUM",
    "PROMINENCE_JOB_ID",
    "PROMINENCE_WORKFLOW_ID",
    "PROMINENCE_PWD",
];

/// Renders the hosts file for a flavor.
///
/// Open MPI consumes `host slots=N` lines; MPICH and Intel MPI use the
/// `host:N` machinefile form.
pub fn hosts_file_contents(flavor: MpiFlavor, hosts: &[String], procs_per_node: u32) -> String {
    let mut contents = String::new();
    for host in hosts {
        match flavor {
            MpiFlavor::OpenMpi => {
                contents.push_str(&format!("{host} slots={procs_per_node}\n"));
            }
            MpiFlavor::Mpich | MpiFlavor::IntelMpi => {
                contents.push_str(&format!("{host}:{procs_per_node}\n"));
            }
        }
    }
    contents
}

/// Writes the hosts file for one task under the job home directory.
///
/// A single-node job with no peer list gets a trivial localhost entry.
pub fn write_hosts_file(
    home: &Path,
    task_index: usize,
    flavor: MpiFlavor,
    hosts: &[String],
    procs_per_node: u32,
) -> Result<PathBuf> {
    let localhost = ["localhost".to_string()];
    let hosts = if hosts.is_empty() { &localhost[..] } else { hosts };

    let path = home.join(format!(".hosts-{task_index}"));
    std::fs::write(&path, hosts_file_contents(flavor, hosts, procs_per_node))
        .with_context(|| format!("failed to write hosts file `{path}`", path = path.display()))?;
    Ok(path)
}

/// Renders the remote-execution wrapper script.
///
/// `mpirun` invokes it as `<wrapper> <host> <command...>`; the script
/// publishes the command under the relay key for that host and then blocks.
pub fn wrapper_script_contents(api_url: &str, token: &str, job_id: u64, task_index: usize) -> String {
    format!(
        r#"#!/bin/sh
host="$1"
shift
curl -s -X POST \
  -H "Authorization: Bearer {token}" \
  --data "$*" \
  "{api}/kv/{job_id}/$host/{task_index}" > /dev/null
sleep infinity
"#,
        api = api_url.trim_end_matches('/'),
    )
}

/// Writes the wrapper script for one task, executable, under the job home.
pub fn write_wrapper_script(
    home: &Path,
    task_index: usize,
    api_url: &str,
    token: &str,
    job_id: u64,
) -> Result<PathBuf> {
    let path = home.join(format!(".mpi-remote-{task_index}"));
    std::fs::write(&path, wrapper_script_contents(api_url, token, job_id, task_index))
        .with_context(|| {
            format!(
                "failed to write wrapper script `{path}`",
                path = path.display()
            )
        })?;
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
        .with_context(|| {
            format!(
                "failed to make wrapper script `{path}` executable",
                path = path.display()
            )
        })?;
    Ok(path)
}

/// Builds the `mpirun` argv for a flavor.
///
/// The hosts file, wrapper, and command paths must all be valid inside the
/// task's container, since `mpirun` itself runs there.
pub fn mpirun_args(
    flavor: MpiFlavor,
    total_procs: u32,
    hosts_file: &Path,
    wrapper: &Path,
    command: &[String],
) -> Vec<String> {
    let mut args = vec![
        "mpirun".to_string(),
        "-np".to_string(),
        total_procs.to_string(),
    ];

    match flavor {
        MpiFlavor::OpenMpi => {
            args.push("-hostfile".to_string());
            args.push(hosts_file.display().to_string());
            args.push("--mca".to_string());
            args.push("plm_rsh_agent".to_string());
            args.push(wrapper.display().to_string());
            for name in ENV_ALLOWLIST {
                args.push("-x".to_string());
                args.push((*name).to_string());
            }
        }
        MpiFlavor::Mpich => {
            args.push("-f".to_string());
            args.push(hosts_file.display().to_string());
            args.push("-launcher".to_string());
            args.push("ssh".to_string());
            args.push("-launcher-exec".to_string());
            args.push(wrapper.display().to_string());
            args.push("-genvlist".to_string());
            args.push(ENV_ALLOWLIST.join(","));
        }
        MpiFlavor::IntelMpi => {
            args.push("-machinefile".to_string());
            args.push(hosts_file.display().to_string());
            args.push("-bootstrap".to_string());
            args.push("ssh".to_string());
            args.push("-bootstrap-exec".to_string());
            args.push(wrapper.display().to_string());
            args.push("-envlist".to_string());
            args.push(ENV_ALLOWLIST.join(","));
        }
    }

    args.extend(command.iter().cloned());
    args
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn hosts_files_follow_the_flavor_syntax() {
        let hosts = vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()];
        assert_eq!(
            hosts_file_contents(MpiFlavor::OpenMpi, &hosts, 4),
            "10.0.0.1 slots=4\n10.0.0.2 slots=4\n"
        );
        assert_eq!(
            hosts_file_contents(MpiFlavor::Mpich, &hosts, 4),
            "10.0.0.1:4\n10.0.0.2:4\n"
        );
        assert_eq!(
            hosts_file_contents(MpiFlavor::IntelMpi, &hosts, 2),
            "10.0.0.1:2\n10.0.0.2:2\n"
        );
    }

    #[test]
    fn single_node_jobs_get_a_localhost_hosts_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_hosts_file(dir.path(), 0, MpiFlavor::OpenMpi, &[], 8).unwrap();
        assert_eq!(
            std::fs::read_to_string(path).unwrap(),
            "localhost slots=8\n"
        );
    }

    #[test]
    fn wrapper_publishes_to_the_relay_and_blocks() {
        let script = wrapper_script_contents("https://api.example.com/", "tok", 42, 1);
        assert!(script.starts_with("#!/bin/sh"));
        assert!(script.contains(r#""https://api.example.com/kv/42/$host/1""#));
        assert!(script.contains("Authorization: Bearer tok"));
        assert!(script.trim_end().ends_with("sleep infinity"));

        let dir = tempfile::tempdir().unwrap();
        let path = write_wrapper_script(dir.path(), 1, "https://api.example.com", "tok", 42)
            .unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111);
    }

    #[test]
    fn mpirun_args_follow_the_flavor_syntax() {
        let hosts = Path::new("/home/user/.hosts-0");
        let wrapper = Path::new("/home/user/.mpi-remote-0");
        let command = vec!["./solver".to_string(), "--fast".to_string()];

        let args = mpirun_args(MpiFlavor::OpenMpi, 8, hosts, wrapper, &command);
        assert_eq!(&args[..3], &["mpirun", "-np", "8"]);
        assert!(args.windows(2).any(|w| w
            == ["-hostfile".to_string(), "/home/user/.hosts-0".to_string()]));
        assert!(args.windows(2).any(|w| {
            w == [
                "plm_rsh_agent".to_string(),
                "/home/user/.mpi-remote-0".to_string(),
            ]
        }));
        assert!(args.contains(&"-x".to_string()));
        assert_eq!(&args[args.len() - 2..], &["./solver", "--fast"]);

        let args = mpirun_args(MpiFlavor::Mpich, 4, hosts, wrapper, &command);
        assert!(args.windows(2).any(|w| w
            == ["-launcher".to_string(), "ssh".to_string()]));
        assert!(args.contains(&ENV_ALLOWLIST.join(",")));

        let args = mpirun_args(MpiFlavor::IntelMpi, 4, hosts, wrapper, &command);
        assert!(args.windows(2).any(|w| w
            == ["-bootstrap".to_string(), "ssh".to_string()]));
        assert!(args.windows(2).any(|w| {
            w == [
                "-bootstrap-exec".to_string(),
                "/home/user/.mpi-remote-0".to_string(),
            ]
        }));
    }
}
