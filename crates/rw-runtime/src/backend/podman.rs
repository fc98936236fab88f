use async_trait::async_trait;
use orion_error::prelude::*;

use crate::error::{RuntimeReason, RuntimeResult};

use super::{
    ChildTable, ContainerBackend, ContainerStatus, ImageHandle, RunHandle, RunSpec, run_cli,
};

// ---------------------------------------------------------------------------
// podman backend
// ---------------------------------------------------------------------------

/// Runs containers through `sudo podman` (a passwordless sudoers entry is
/// assumed). The engine process stays attached, so the child's exit code
/// is the container's; resource limits are advisory and there is no
/// cross-process admission.
pub struct PodmanBackend {
    children: ChildTable,
}

impl PodmanBackend {
    pub fn new() -> Self {
        PodmanBackend {
            children: ChildTable::default(),
        }
    }
}

impl Default for PodmanBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerBackend for PodmanBackend {
    async fn prepare_image(&self, image: &str) -> RuntimeResult<ImageHandle> {
        let exists = run_cli(
            "sudo",
            &["podman".into(), "image".into(), "exists".into(), image.into()],
        )
        .await;
        if exists.is_err() {
            rw_info!(task, image = image, "pulling image");
            run_cli("sudo", &["podman".into(), "pull".into(), image.into()]).await?;
        }
        Ok(ImageHandle(image.to_string()))
    }

    async fn run(&self, spec: &RunSpec) -> RuntimeResult<RunHandle> {
        let mut args: Vec<String> = vec![
            "podman".into(),
            "run".into(),
            "--rm".into(),
            "--name".into(),
            spec.container_name.clone(),
            "--cpus".into(),
            spec.cpu.to_string(),
            "--memory".into(),
            format!("{}b", spec.memory_bytes),
            "--workdir".into(),
            spec.work_dir.to_string_lossy().into_owned(),
            "--volume".into(),
            format!("{0}:{0}:rw", spec.work_dir.display()),
        ];
        if spec.privileged {
            args.push("--privileged".into());
        }
        for mount in &spec.mounts {
            let mode = if mount.read_only { "ro" } else { "rw" };
            args.push("--volume".into());
            args.push(format!(
                "{}:{}:{mode}",
                mount.host.display(),
                mount.container.display()
            ));
        }
        for (k, v) in &spec.env {
            args.push("--env".into());
            args.push(format!("{k}={v}"));
        }
        args.push(spec.image.0.clone());
        args.push("bash".into());
        args.push("-c".into());
        args.push(spec.shell_line());

        let child = tokio::process::Command::new("sudo")
            .args(&args)
            .spawn()
            .map_err(|e| {
                StructError::from(RuntimeReason::Backend)
                    .with_detail(format!("cannot invoke sudo podman: {e}"))
            })?;
        let id = self.children.insert(child);
        Ok(RunHandle {
            id,
            name: spec.container_name.clone(),
        })
    }

    async fn poll(&self, handle: &RunHandle) -> RuntimeResult<ContainerStatus> {
        self.children.poll(&handle.id)
    }

    async fn kill(&self, handle: &RunHandle) -> RuntimeResult<()> {
        // Stop the container itself; reap the attached client afterwards.
        let _ = run_cli(
            "sudo",
            &["podman".into(), "kill".into(), handle.name.clone()],
        )
        .await;
        self.children.kill(&handle.id);
        Ok(())
    }
}
