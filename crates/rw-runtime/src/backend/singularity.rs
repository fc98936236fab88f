use async_trait::async_trait;
use orion_error::prelude::*;

use crate::error::{RuntimeReason, RuntimeResult};

use super::{ChildTable, ContainerBackend, ContainerStatus, ImageHandle, RunHandle, RunSpec};

// ---------------------------------------------------------------------------
// singularity backend
// ---------------------------------------------------------------------------

/// Runs tasks through `singularity exec docker://TAG`. Docker tags are
/// converted on first use by singularity's own docker import; the image
/// cache lives wherever singularity keeps it. The filesystem is read-only
/// apart from `/tmp` and the bind-mounted work directory; resource
/// reservations are advisory only.
pub struct SingularityBackend {
    children: ChildTable,
}

impl SingularityBackend {
    pub fn new() -> Self {
        SingularityBackend {
            children: ChildTable::default(),
        }
    }
}

impl Default for SingularityBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerBackend for SingularityBackend {
    async fn prepare_image(&self, image: &str) -> RuntimeResult<ImageHandle> {
        // `exec docker://` pulls and converts lazily; hand back the
        // docker-import reference.
        if image.contains("://") {
            Ok(ImageHandle(image.to_string()))
        } else {
            Ok(ImageHandle(format!("docker://{image}")))
        }
    }

    async fn run(&self, spec: &RunSpec) -> RuntimeResult<RunHandle> {
        let mut args: Vec<String> = vec![
            "exec".into(),
            "--containall".into(),
            "--pwd".into(),
            spec.work_dir.to_string_lossy().into_owned(),
            "--bind".into(),
            format!("{0}:{0}:rw", spec.work_dir.display()),
        ];
        for mount in &spec.mounts {
            let mode = if mount.read_only { "ro" } else { "rw" };
            args.push("--bind".into());
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

        let child = tokio::process::Command::new("singularity")
            .args(&args)
            .spawn()
            .map_err(|e| {
                StructError::from(RuntimeReason::Backend)
                    .with_detail(format!("cannot invoke singularity: {e}"))
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
        self.children.kill(&handle.id);
        Ok(())
    }
}
