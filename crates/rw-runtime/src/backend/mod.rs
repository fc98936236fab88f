use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use orion_error::prelude::*;

use rw_config::{BackendKind, ContainerConfig};

use crate::error::{RuntimeReason, RuntimeResult};

mod docker_swarm;
mod podman;
mod singularity;
mod udocker;

pub use docker_swarm::DockerSwarmBackend;
pub use podman::PodmanBackend;
pub use singularity::SingularityBackend;
pub use udocker::UdockerBackend;

// ---------------------------------------------------------------------------
// Capability interface
// ---------------------------------------------------------------------------

/// An image reference the backend has made locally runnable.
#[derive(Debug, Clone)]
pub struct ImageHandle(pub String);

/// A started container run.
#[derive(Debug, Clone)]
pub struct RunHandle {
    /// Backend-specific identity: container/service name or a child slot.
    pub id: String,
    /// The engine-side container name, for out-of-band kills.
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Running,
    Exited(i32),
}

#[derive(Debug, Clone)]
pub struct Mount {
    pub host: PathBuf,
    pub container: PathBuf,
    pub read_only: bool,
}

/// Everything a backend needs to start one task attempt. The work
/// directory is bind-mounted writable at its host path and used as the
/// container cwd; the script redirects its own stdout/stderr into files
/// under it.
#[derive(Debug, Clone)]
pub struct RunSpec {
    pub image: ImageHandle,
    pub container_name: String,
    pub work_dir: PathBuf,
    pub mounts: Vec<Mount>,
    pub env: Vec<(String, String)>,
    pub command_path: PathBuf,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
    pub cpu: u32,
    pub memory_bytes: u64,
    pub privileged: bool,
}

impl RunSpec {
    /// The in-container shell line: run the script with captured output.
    pub(crate) fn shell_line(&self) -> String {
        format!(
            "cd {} && bash {} > {} 2> {}",
            shell_quote(&self.work_dir.to_string_lossy()),
            shell_quote(&self.command_path.to_string_lossy()),
            shell_quote(&self.stdout_path.to_string_lossy()),
            shell_quote(&self.stderr_path.to_string_lossy()),
        )
    }
}

/// Container lifecycle capability. One implementation per supported
/// engine; populated into the registry at startup.
#[async_trait]
pub trait ContainerBackend: Send + Sync {
    /// Ensure the image is locally available (may pull).
    async fn prepare_image(&self, image: &str) -> RuntimeResult<ImageHandle>;
    async fn run(&self, spec: &RunSpec) -> RuntimeResult<RunHandle>;
    async fn poll(&self, handle: &RunHandle) -> RuntimeResult<ContainerStatus>;
    async fn kill(&self, handle: &RunHandle) -> RuntimeResult<()>;
    /// Whether resource limits are enforced rather than advisory.
    fn enforces_resources(&self) -> bool {
        false
    }
}

/// Explicit backend registry: no runtime plugin discovery.
pub fn backend_for(config: &ContainerConfig) -> Arc<dyn ContainerBackend> {
    match config.backend {
        BackendKind::DockerSwarm => Arc::new(DockerSwarmBackend::new()),
        BackendKind::Podman => Arc::new(PodmanBackend::new()),
        BackendKind::Singularity => Arc::new(SingularityBackend::new()),
        BackendKind::Udocker => Arc::new(UdockerBackend::new()),
    }
}

// ---------------------------------------------------------------------------
// Shared subprocess helpers
// ---------------------------------------------------------------------------

/// Run an engine CLI command to completion, failing on non-zero exit.
pub(crate) async fn run_cli(program: &str, args: &[String]) -> RuntimeResult<String> {
    let output = tokio::process::Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| {
            StructError::from(RuntimeReason::Backend)
                .with_detail(format!("cannot invoke {program}: {e}"))
        })?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return StructError::from(RuntimeReason::Backend)
            .with_detail(format!(
                "{program} {} failed: {}",
                args.first().map(String::as_str).unwrap_or(""),
                stderr.trim()
            ))
            .err();
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// POSIX single-quote escaping.
pub(crate) fn shell_quote(s: &str) -> String {
    if !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || "_-./=:".contains(c)) {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Shared child-process table for backends that run attached (the engine
/// process's exit code is the container's).
#[derive(Default)]
pub(crate) struct ChildTable {
    children: std::sync::Mutex<std::collections::HashMap<String, tokio::process::Child>>,
    counter: std::sync::atomic::AtomicU64,
}

impl ChildTable {
    pub(crate) fn insert(&self, child: tokio::process::Child) -> String {
        let id = format!(
            "child-{}",
            self.counter
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
        );
        self.children.lock().unwrap().insert(id.clone(), child);
        id
    }

    pub(crate) fn poll(&self, id: &str) -> RuntimeResult<ContainerStatus> {
        let mut children = self.children.lock().unwrap();
        let Some(child) = children.get_mut(id) else {
            return StructError::from(RuntimeReason::Backend)
                .with_detail(format!("unknown run handle {id:?}"))
                .err();
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                let code = status.code().unwrap_or(128 + 15);
                children.remove(id);
                Ok(ContainerStatus::Exited(code))
            }
            Ok(None) => Ok(ContainerStatus::Running),
            Err(e) => StructError::from(RuntimeReason::Backend)
                .with_detail(format!("cannot poll child process: {e}"))
                .err(),
        }
    }

    pub(crate) fn kill(&self, id: &str) {
        let mut children = self.children.lock().unwrap();
        if let Some(child) = children.get_mut(id) {
            let _ = child.start_kill();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_quoting() {
        assert_eq!(shell_quote("plain-path/x.txt"), "plain-path/x.txt");
        assert_eq!(shell_quote("has space"), "'has space'");
        assert_eq!(shell_quote("don't"), r"'don'\''t'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn shell_line_redirects_into_workdir() {
        let spec = RunSpec {
            image: ImageHandle("ubuntu:22.04".into()),
            container_name: "t".into(),
            work_dir: "/runs/r/call-t/work".into(),
            mounts: vec![],
            env: vec![],
            command_path: "/runs/r/call-t/command.sh".into(),
            stdout_path: "/runs/r/call-t/stdout.txt".into(),
            stderr_path: "/runs/r/call-t/stderr.txt".into(),
            cpu: 1,
            memory_bytes: 1 << 30,
            privileged: false,
        };
        let line = spec.shell_line();
        assert!(line.starts_with("cd /runs/r/call-t/work && bash"));
        assert!(line.contains("> /runs/r/call-t/stdout.txt"));
        assert!(line.contains("2> /runs/r/call-t/stderr.txt"));
    }
}
