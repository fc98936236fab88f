use async_trait::async_trait;

use crate::error::RuntimeResult;

use super::{ContainerBackend, ContainerStatus, ImageHandle, RunHandle, RunSpec, run_cli};

// ---------------------------------------------------------------------------
// docker-swarm backend
// ---------------------------------------------------------------------------

/// Runs each task attempt as a one-shot swarm service on the local node.
/// Swarm enforces the CPU/memory reservation; the service is removed on
/// kill. Requires a local dockerd with swarm mode active.
pub struct DockerSwarmBackend;

impl DockerSwarmBackend {
    pub fn new() -> Self {
        DockerSwarmBackend
    }
}

impl Default for DockerSwarmBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerBackend for DockerSwarmBackend {
    async fn prepare_image(&self, image: &str) -> RuntimeResult<ImageHandle> {
        // Local image wins; otherwise pull from the registry.
        let inspect = run_cli(
            "docker",
            &["image".into(), "inspect".into(), image.into()],
        )
        .await;
        if inspect.is_err() {
            rw_info!(task, image = image, "pulling image");
            run_cli("docker", &["pull".into(), image.into()]).await?;
        }
        Ok(ImageHandle(image.to_string()))
    }

    async fn run(&self, spec: &RunSpec) -> RuntimeResult<RunHandle> {
        let nano_cpus_limit = format!("{}", spec.cpu);
        let mem_limit = format!("{}b", spec.memory_bytes);

        let mut args: Vec<String> = vec![
            "service".into(),
            "create".into(),
            "--detach".into(),
            "--quiet".into(),
            "--name".into(),
            spec.container_name.clone(),
            "--restart-condition".into(),
            "none".into(),
            "--limit-cpu".into(),
            nano_cpus_limit.clone(),
            "--reserve-cpu".into(),
            nano_cpus_limit,
            "--limit-memory".into(),
            mem_limit.clone(),
            "--reserve-memory".into(),
            mem_limit,
            "--workdir".into(),
            spec.work_dir.to_string_lossy().into_owned(),
        ];
        for mount in &spec.mounts {
            let mut m = format!(
                "type=bind,source={},destination={}",
                mount.host.display(),
                mount.container.display()
            );
            if mount.read_only {
                m.push_str(",readonly");
            }
            args.push("--mount".into());
            args.push(m);
        }
        for (k, v) in &spec.env {
            args.push("--env".into());
            args.push(format!("{k}={v}"));
        }
        args.push(spec.image.0.clone());
        args.push("bash".into());
        args.push("-c".into());
        args.push(spec.shell_line());

        run_cli("docker", &args).await?;
        Ok(RunHandle {
            id: spec.container_name.clone(),
            name: spec.container_name.clone(),
        })
    }

    async fn poll(&self, handle: &RunHandle) -> RuntimeResult<ContainerStatus> {
        let out = run_cli(
            "docker",
            &[
                "service".into(),
                "ps".into(),
                handle.id.clone(),
                "--no-trunc".into(),
                "--format".into(),
                "{{.CurrentState}}\t{{.Error}}".into(),
            ],
        )
        .await?;
        // The newest task line is first.
        let line = out.lines().next().unwrap_or_default();
        let (state, error) = line.split_once('\t').unwrap_or((line, ""));

        if state.starts_with("Complete") {
            return Ok(ContainerStatus::Exited(0));
        }
        if state.starts_with("Failed") || state.starts_with("Rejected") {
            return Ok(ContainerStatus::Exited(parse_exit_code(error)));
        }
        if state.starts_with("Shutdown") {
            return Ok(ContainerStatus::Exited(128 + 15));
        }
        Ok(ContainerStatus::Running)
    }

    async fn kill(&self, handle: &RunHandle) -> RuntimeResult<()> {
        run_cli("docker", &["service".into(), "rm".into(), handle.id.clone()])
            .await
            .map(|_| ())
            .or_else(|e| {
                // Removing an already-gone service is not a failure.
                if e.to_string().contains("not found") {
                    Ok(())
                } else {
                    Err(e)
                }
            })
    }

    fn enforces_resources(&self) -> bool {
        true
    }
}

/// Swarm reports non-zero exits as `task: non-zero exit (N)`.
fn parse_exit_code(error: &str) -> i32 {
    error
        .split("non-zero exit (")
        .nth(1)
        .and_then(|rest| rest.split(')').next())
        .and_then(|code| code.parse().ok())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::parse_exit_code;

    #[test]
    fn swarm_error_lines_parse() {
        assert_eq!(parse_exit_code("task: non-zero exit (17)"), 17);
        assert_eq!(parse_exit_code("\"task: non-zero exit (2)\""), 2);
        assert_eq!(parse_exit_code("starting container failed"), 1);
        assert_eq!(parse_exit_code(""), 1);
    }
}
