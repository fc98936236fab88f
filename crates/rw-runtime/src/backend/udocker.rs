use async_trait::async_trait;
use orion_error::prelude::*;

use crate::error::{RuntimeReason, RuntimeResult};

use super::{
    ChildTable, ContainerBackend, ContainerStatus, ImageHandle, RunHandle, RunSpec, run_cli,
};

// ---------------------------------------------------------------------------
// udocker backend
// ---------------------------------------------------------------------------

/// Last-resort rootless engine. No isolation guarantees: inputs are
/// mounted writable (udocker cannot enforce read-only binds) and resource
/// reservations are advisory.
pub struct UdockerBackend {
    children: ChildTable,
}

impl UdockerBackend {
    pub fn new() -> Self {
        UdockerBackend {
            children: ChildTable::default(),
        }
    }
}

impl Default for UdockerBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerBackend for UdockerBackend {
    async fn prepare_image(&self, image: &str) -> RuntimeResult<ImageHandle> {
        rw_info!(task, image = image, "pulling image via udocker");
        run_cli("udocker", &["pull".into(), image.into()]).await?;
        Ok(ImageHandle(image.to_string()))
    }

    async fn run(&self, spec: &RunSpec) -> RuntimeResult<RunHandle> {
        let mut args: Vec<String> = vec![
            "run".into(),
            "--workdir".into(),
            spec.work_dir.to_string_lossy().into_owned(),
            "--volume".into(),
            format!("{0}:{0}", spec.work_dir.display()),
        ];
        for mount in &spec.mounts {
            args.push("--volume".into());
            args.push(format!(
                "{}:{}",
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

        let child = tokio::process::Command::new("udocker")
            .args(&args)
            .spawn()
            .map_err(|e| {
                StructError::from(RuntimeReason::Backend)
                    .with_detail(format!("cannot invoke udocker: {e}"))
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
