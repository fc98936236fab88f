use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use rw_config::RunnerConfig;
use rw_core::env::Env;
use rw_core::{Stdlib, Value, eval, interpolate_command};
use rw_lang::ast::{Decl, Document, Task};
use rw_lang::checker::{StructEnv, build_struct_env, resolve_type};
use rw_lang::graph::free_vars;

use crate::admission::Admission;
use crate::backend::{ContainerBackend, ContainerStatus, Mount, RunSpec};
use crate::cache::{CallCache, input_digest, source_digest};
use crate::state::JobFailure;

mod outputs;
mod staging;

pub use outputs::link_output_tree;

#[cfg(test)]
mod tests;

// ---------------------------------------------------------------------------
// TaskContext / TaskSpec
// ---------------------------------------------------------------------------

/// Shared machinery every task attempt uses.
pub struct TaskContext {
    pub config: Arc<RunnerConfig>,
    pub backend: Arc<dyn ContainerBackend>,
    pub admission: Arc<Admission>,
    pub cache: Option<Arc<CallCache>>,
    pub verbose: bool,
    /// Extra container environment variables (`--env K=V`).
    pub extra_env: Vec<(String, String)>,
}

/// One call instance to execute.
pub struct TaskSpec {
    pub task: Task,
    pub doc: Arc<Document>,
    /// `RUNDIR/call-NAME[-IDX]`.
    pub call_dir: PathBuf,
    pub inputs: Vec<(String, Value)>,
    /// Call name, for logging and container naming.
    pub name: String,
}

// ---------------------------------------------------------------------------
// run_task — the per-call attempt chain
// ---------------------------------------------------------------------------

/// Execute one call: cache probe, then up to `maxRetries + 1` container
/// attempts, then output collection. Returns the task's typed outputs.
pub async fn run_task(
    ctx: &TaskContext,
    spec: TaskSpec,
    cancel: CancellationToken,
) -> Result<Vec<(String, Value)>, JobFailure> {
    let structs = {
        let mut scratch = Vec::new();
        build_struct_env(&spec.doc, &mut scratch)
    };

    // Bind inputs and evaluate defaults before any filesystem work; the
    // cache key needs the full input environment.
    std::fs::create_dir_all(&spec.call_dir).map_err(|e| fs_failure(&spec.call_dir, e))?;
    let write_dir = spec.call_dir.join("write_");
    let stdlib = Stdlib::new(write_dir, Arc::new(rw_core::IdentityMapper));
    let env_inputs = bind_task_inputs(&spec.task, &structs, &spec.inputs, &stdlib)?;

    // Cache probe.
    let task_source = task_source_slice(&spec.doc, &spec.task);
    let cache_key = CallCache::key(&source_digest(task_source), &input_digest(&env_inputs));
    if let Some(cache) = &ctx.cache {
        if let Some(outputs) = cache.lookup(&cache_key) {
            rw_info!(task, call = %spec.name, "call cache hit; skipping container");
            write_outputs_json(&spec.call_dir, &spec.name, &outputs)?;
            return Ok(outputs);
        }
    }

    let max_retries = runtime_u32(
        &spec.task,
        "maxRetries",
        &env_of(&env_inputs),
        &stdlib,
        ctx.config.task.default_max_retries,
    )?;

    let mut last_failure: Option<JobFailure> = None;
    for attempt in 1..=(max_retries + 1) {
        if cancel.is_cancelled() {
            return Err(crate::driver::interrupted_failure(attempt));
        }
        match run_attempt(ctx, &spec, &structs, &env_inputs, attempt, &cancel).await {
            Ok(outputs) => {
                write_outputs_json(&spec.call_dir, &spec.name, &outputs)?;
                outputs::link_output_tree(&spec.call_dir.join("out"), &outputs);
                if let Some(cache) = &ctx.cache {
                    if let Err(e) = cache.store(&cache_key, &env_inputs, &outputs) {
                        rw_warn!(task, call = %spec.name, error = %e, "cache store failed");
                    }
                }
                return Ok(outputs);
            }
            Err(failure) => {
                let retryable = failure.kind == "TaskFailure" && attempt <= max_retries;
                rw_warn!(
                    task,
                    call = %spec.name,
                    attempt = attempt,
                    kind = %failure.kind,
                    retry = retryable,
                    "task attempt failed"
                );
                if !retryable {
                    write_error_json(&spec.call_dir, &failure);
                    return Err(failure);
                }
                last_failure = Some(failure);
            }
        }
    }
    // Retries exhausted (loop always returns before falling through, but
    // keep the failure if it somehow does).
    let failure = last_failure.unwrap_or_else(|| JobFailure {
        kind: "TaskFailure".to_string(),
        message: "task failed".to_string(),
        exit_status: None,
        stderr_path: None,
        attempts: max_retries + 1,
    });
    write_error_json(&spec.call_dir, &failure);
    Err(failure)
}

async fn run_attempt(
    ctx: &TaskContext,
    spec: &TaskSpec,
    structs: &StructEnv,
    env_inputs: &[(String, Value)],
    attempt: u32,
    cancel: &CancellationToken,
) -> Result<Vec<(String, Value)>, JobFailure> {
    if cancel.is_cancelled() {
        return Err(crate::driver::interrupted_failure(attempt));
    }
    let work_dir = if attempt == 1 {
        spec.call_dir.join("work")
    } else {
        spec.call_dir.join(format!("work{attempt}"))
    };
    std::fs::create_dir_all(&work_dir).map_err(|e| fs_failure(&work_dir, e))?;

    // Stage File/Directory inputs: read-only mounts, or copies under the
    // work directory when configured.
    let staged = staging::stage_inputs(
        env_inputs,
        &work_dir,
        ctx.config.task.copy_input_files,
    )?;
    let env = env_of(&staged.inputs);
    let stdlib = Stdlib::new(spec.call_dir.join("write_"), Arc::new(rw_core::IdentityMapper));

    // Image preparation.
    let image_ref = runtime_string(&spec.task, "docker", &env, &stdlib)?
        .or(runtime_string(&spec.task, "container", &env, &stdlib)?)
        .unwrap_or_else(|| ctx.config.container.default_image.clone());
    let image = ctx
        .backend
        .prepare_image(&image_ref)
        .await
        .map_err(|e| backend_failure(e, attempt))?;

    // Command assembly, with the placeholder guard and env-flagged input
    // exports at the top of the script.
    let guard = if ctx.config.task.placeholder_regex.is_empty() {
        None
    } else {
        Some(
            regex::Regex::new(&ctx.config.task.placeholder_regex).map_err(|e| JobFailure {
                kind: "ConfigurationError".to_string(),
                message: format!("invalid placeholder_regex: {e}"),
                exit_status: None,
                stderr_path: None,
                attempts: attempt,
            })?,
        )
    };
    let body = interpolate_command(&spec.task.command.parts, &env, &stdlib, guard.as_ref())
        .map_err(|e| JobFailure {
            kind: if e.to_string().contains("placeholder guard") {
                "CommandError".to_string()
            } else {
                "EvalError".to_string()
            },
            message: e.to_string(),
            exit_status: None,
            stderr_path: None,
            attempts: attempt,
        })?;
    let mut script = String::new();
    for (name, value) in env_exports(&spec.task, &staged.inputs) {
        script.push_str(&format!(
            "export {name}={}\n",
            crate::backend::shell_quote(&value)
        ));
    }
    script.push_str(&body);
    let command_path = spec.call_dir.join("command.sh");
    std::fs::write(&command_path, &script).map_err(|e| fs_failure(&command_path, e))?;

    // Resource reservations. The admission wait is a cancellation yield
    // point: a cancel often frees budget by killing siblings, so the
    // permit and the signal can arrive together. The re-check after
    // acquisition keeps a new container from starting in that race.
    let cpu = runtime_u32(&spec.task, "cpu", &env, &stdlib, 1)?;
    let memory_bytes = runtime_memory(&spec.task, &env, &stdlib, 2 << 30)?;
    let permit = tokio::select! {
        permit = ctx.admission.acquire(cpu, memory_bytes) => permit,
        _ = cancel.cancelled() => {
            rw_info!(task, call = %spec.name, "cancelled while queued for admission");
            return Err(crate::driver::interrupted_failure(attempt));
        }
    };
    if cancel.is_cancelled() {
        return Err(crate::driver::interrupted_failure(attempt));
    }

    let stdout_path = spec.call_dir.join("stdout.txt");
    let stderr_path = spec.call_dir.join("stderr.txt");
    let mut mounts = staged.mounts.clone();
    mounts.push(Mount {
        host: spec.call_dir.clone(),
        container: spec.call_dir.clone(),
        read_only: false,
    });

    let run_spec = RunSpec {
        image,
        container_name: container_name(&spec.name, attempt),
        work_dir: work_dir.clone(),
        mounts,
        env: ctx.extra_env.clone(),
        command_path: command_path.clone(),
        stdout_path: stdout_path.clone(),
        stderr_path: stderr_path.clone(),
        cpu: permit.cpu,
        memory_bytes: permit.memory_bytes,
        privileged: false,
    };

    rw_info!(task, call = %spec.name, attempt = attempt, image = %image_ref, "starting container");
    let handle = ctx
        .backend
        .run(&run_spec)
        .await
        .map_err(|e| backend_failure(e, attempt))?;

    // Poll until exit, observing cancellation at every poll boundary.
    let poll_interval: Duration = ctx.config.task.poll_interval.into();
    let exit_code = loop {
        tokio::select! {
            _ = tokio::time::sleep(poll_interval) => {
                match ctx.backend.poll(&handle).await {
                    Ok(ContainerStatus::Running) => {}
                    Ok(ContainerStatus::Exited(code)) => break code,
                    Err(e) => return Err(backend_failure(e, attempt)),
                }
            }
            _ = cancel.cancelled() => {
                rw_info!(task, call = %spec.name, "terminating container on cancel");
                let _ = ctx.backend.kill(&handle).await;
                let grace: Duration = ctx.config.task.kill_grace.into();
                let deadline = tokio::time::Instant::now() + grace;
                loop {
                    if tokio::time::Instant::now() >= deadline {
                        let _ = ctx.backend.kill(&handle).await;
                        break;
                    }
                    match ctx.backend.poll(&handle).await {
                        Ok(ContainerStatus::Exited(_)) | Err(_) => break,
                        Ok(ContainerStatus::Running) => {
                            tokio::time::sleep(poll_interval).await;
                        }
                    }
                }
                return Err(crate::driver::interrupted_failure(attempt));
            }
        }
    };
    drop(permit);

    if ctx.verbose {
        echo_stdout_sample(&stdout_path, &spec.name);
    }

    // Exit status policy: 0, or whatever `returnCodes` admits.
    let ok = exit_ok(&spec.task, &env, &stdlib, exit_code)?;
    if !ok {
        return Err(JobFailure {
            kind: "TaskFailure".to_string(),
            message: format!("command exited with status {exit_code}"),
            exit_status: Some(exit_code),
            stderr_path: Some(stderr_path.clone()),
            attempts: attempt,
        });
    }

    outputs::collect_outputs(
        &spec.task,
        structs,
        &env,
        &stdlib,
        &work_dir,
        &stdout_path,
        &stderr_path,
        attempt,
    )
}

// ---------------------------------------------------------------------------
// Input binding
// ---------------------------------------------------------------------------

/// Bind provided inputs (coerced to their declared types) and evaluate
/// defaulted inputs and post-input declarations in dependency order.
fn bind_task_inputs(
    task: &Task,
    structs: &StructEnv,
    provided: &[(String, Value)],
    stdlib: &Stdlib,
) -> Result<Vec<(String, Value)>, JobFailure> {
    let mut bound: Vec<(String, Value)> = Vec::new();
    let mut scratch = Vec::new();
    let decls: Vec<&Decl> = task.inputs.iter().chain(task.postinputs.iter()).collect();

    for d in &decls {
        let ty = resolve_type(&d.ty, structs, d.span, &mut scratch);
        match provided.iter().find(|(n, _)| n == &d.name) {
            Some((_, v)) => {
                let v = v.coerce_to(&ty).map_err(|e| input_failure(&d.name, e))?;
                bound.push((d.name.clone(), v));
            }
            None if d.expr.is_none() && !ty.optional => {
                return Err(JobFailure {
                    kind: "InputError".to_string(),
                    message: format!("required task input `{}` was not provided", d.name),
                    exit_status: None,
                    stderr_path: None,
                    attempts: 0,
                });
            }
            None => {}
        }
    }

    // Defaulted declarations evaluate once the names they reference are
    // bound; repeated passes implement dependency order without an
    // explicit sort.
    let mut remaining: Vec<&Decl> = decls
        .iter()
        .filter(|d| !bound.iter().any(|(n, _)| n == &d.name))
        .copied()
        .collect();
    while !remaining.is_empty() {
        let mut progressed = false;
        let mut next = Vec::with_capacity(remaining.len());
        for d in remaining {
            let ready = d.expr.as_ref().is_none_or(|e| {
                let mut refs = Vec::new();
                free_vars(e, &mut refs);
                refs.iter().all(|r| {
                    bound.iter().any(|(n, _)| n == r)
                        || !decls.iter().any(|dd| dd.name == *r)
                })
            });
            if !ready {
                next.push(d);
                continue;
            }
            let ty = resolve_type(&d.ty, structs, d.span, &mut scratch);
            let value = match &d.expr {
                Some(expr) => eval(expr, &env_of(&bound), stdlib)
                    .and_then(|v| v.coerce_to(&ty))
                    .map_err(|e| eval_failure_named(&d.name, e))?,
                None => Value::Null(ty.required()),
            };
            bound.push((d.name.clone(), value));
            progressed = true;
        }
        if !progressed && !next.is_empty() {
            let stuck: Vec<&str> = next.iter().map(|d| d.name.as_str()).collect();
            return Err(JobFailure {
                kind: "EvalError".to_string(),
                message: format!(
                    "task declarations form a dependency cycle: {}",
                    stuck.join(", ")
                ),
                exit_status: None,
                stderr_path: None,
                attempts: 0,
            });
        }
        remaining = next;
    }

    Ok(bound)
}

pub(crate) fn env_of(bindings: &[(String, Value)]) -> Env {
    let mut env = Env::new();
    for (name, value) in bindings {
        env = env.bind(name.clone(), value.clone());
    }
    env
}

/// `env`-flagged inputs, rendered for export lines.
fn env_exports(task: &Task, bound: &[(String, Value)]) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for d in task.inputs.iter().chain(task.postinputs.iter()) {
        if !d.env {
            continue;
        }
        if let Some((_, v)) = bound.iter().find(|(n, _)| n == &d.name) {
            if let Ok(s) = v.display_string() {
                out.push((d.name.clone(), s));
            }
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Runtime attributes
// ---------------------------------------------------------------------------

fn runtime_expr_value(
    task: &Task,
    key: &str,
    env: &Env,
    stdlib: &Stdlib,
) -> Result<Option<Value>, JobFailure> {
    match task.runtime_attr(key) {
        Some(expr) => eval(expr, env, stdlib)
            .map(Some)
            .map_err(|e| eval_failure_named(key, e)),
        None => Ok(None),
    }
}

fn runtime_string(
    task: &Task,
    key: &str,
    env: &Env,
    stdlib: &Stdlib,
) -> Result<Option<String>, JobFailure> {
    Ok(match runtime_expr_value(task, key, env, stdlib)? {
        Some(v) => Some(v.display_string().map_err(|e| eval_failure_named(key, e))?),
        None => None,
    })
}

fn runtime_u32(
    task: &Task,
    key: &str,
    env: &Env,
    stdlib: &Stdlib,
    default: u32,
) -> Result<u32, JobFailure> {
    Ok(match runtime_expr_value(task, key, env, stdlib)? {
        Some(Value::Int(i)) => i.max(0) as u32,
        Some(Value::Float(f)) => f.ceil().max(0.0) as u32,
        Some(other) => {
            return Err(JobFailure {
                kind: "EvalError".to_string(),
                message: format!("runtime.{key} must be numeric, got {}", other.wdl_type()),
                exit_status: None,
                stderr_path: None,
                attempts: 0,
            });
        }
        None => default,
    })
}

fn runtime_memory(
    task: &Task,
    env: &Env,
    stdlib: &Stdlib,
    default: u64,
) -> Result<u64, JobFailure> {
    Ok(match runtime_expr_value(task, "memory", env, stdlib)? {
        Some(Value::Int(i)) => i.max(0) as u64,
        Some(Value::String(s)) => s
            .parse::<rw_config::ByteSize>()
            .map_err(|e| JobFailure {
                kind: "EvalError".to_string(),
                message: format!("runtime.memory: {e}"),
                exit_status: None,
                stderr_path: None,
                attempts: 0,
            })?
            .as_bytes(),
        Some(other) => {
            return Err(JobFailure {
                kind: "EvalError".to_string(),
                message: format!(
                    "runtime.memory must be an Int or String, got {}",
                    other.wdl_type()
                ),
                exit_status: None,
                stderr_path: None,
                attempts: 0,
            });
        }
        None => default,
    })
}

/// `returnCodes`: an Int, an Array[Int], or `"*"`.
fn exit_ok(
    task: &Task,
    env: &Env,
    stdlib: &Stdlib,
    exit_code: i32,
) -> Result<bool, JobFailure> {
    Ok(match runtime_expr_value(task, "returnCodes", env, stdlib)? {
        None => exit_code == 0,
        Some(Value::Int(code)) => exit_code as i64 == code,
        Some(Value::String(s)) if s == "*" => true,
        Some(Value::Array { items, .. }) => items
            .iter()
            .any(|v| matches!(v, Value::Int(code) if *code == exit_code as i64)),
        Some(other) => {
            return Err(JobFailure {
                kind: "EvalError".to_string(),
                message: format!(
                    "runtime.returnCodes must be Int, Array[Int], or \"*\", got {}",
                    other.wdl_type()
                ),
                exit_status: None,
                stderr_path: None,
                attempts: 0,
            });
        }
    })
}

// ---------------------------------------------------------------------------
// Small helpers
// ---------------------------------------------------------------------------

fn task_source_slice<'a>(doc: &'a Document, task: &Task) -> &'a str {
    doc.source
        .get(task.span.start..task.span.end)
        .unwrap_or(&doc.source)
}

fn container_name(call_name: &str, attempt: u32) -> String {
    let sanitized: String = call_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    format!("runwdl-{sanitized}-{attempt}-{}", std::process::id())
}

fn echo_stdout_sample(stdout_path: &std::path::Path, call: &str) {
    if let Ok(text) = std::fs::read_to_string(stdout_path) {
        for line in text.lines().take(10) {
            rw_info!(task, call = %call, "| {}", line);
        }
    }
}

fn write_outputs_json(
    call_dir: &std::path::Path,
    name: &str,
    outputs: &[(String, Value)],
) -> Result<(), JobFailure> {
    let json = rw_core::json::outputs_json(name, outputs);
    let path = call_dir.join("outputs.json");
    std::fs::write(&path, serde_json::to_string_pretty(&json).unwrap_or_default())
        .map_err(|e| fs_failure(&path, e))
}

fn write_error_json(call_dir: &std::path::Path, failure: &JobFailure) {
    let json = serde_json::json!({
        "error": failure.kind,
        "message": failure.message,
        "exit_status": failure.exit_status,
        "attempts": failure.attempts,
    });
    let path = call_dir.join("error.json");
    let _ = std::fs::write(&path, serde_json::to_string_pretty(&json).unwrap_or_default());
}

fn backend_failure(e: crate::error::RuntimeError, attempt: u32) -> JobFailure {
    JobFailure {
        kind: "TaskFailure".to_string(),
        message: format!("container backend: {e}"),
        exit_status: None,
        stderr_path: None,
        attempts: attempt,
    }
}

fn fs_failure(path: &std::path::Path, e: std::io::Error) -> JobFailure {
    JobFailure {
        kind: "FilesystemError".to_string(),
        message: format!("{}: {e}", path.display()),
        exit_status: None,
        stderr_path: None,
        attempts: 0,
    }
}

fn input_failure(name: &str, e: rw_core::CoreError) -> JobFailure {
    JobFailure {
        kind: "InputError".to_string(),
        message: format!("input `{name}`: {e}"),
        exit_status: None,
        stderr_path: None,
        attempts: 0,
    }
}

fn eval_failure_named(name: &str, e: rw_core::CoreError) -> JobFailure {
    JobFailure {
        kind: "EvalError".to_string(),
        message: format!("`{name}`: {e}"),
        exit_status: None,
        stderr_path: None,
        attempts: 0,
    }
}
