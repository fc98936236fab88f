use std::path::{Path, PathBuf};
use std::sync::Arc;

use rw_core::env::Env;
use rw_core::error::CoreResult;
use rw_core::stdlib::PathMapper;
use rw_core::{Stdlib, TaskIo, Value, eval};
use rw_lang::ast::Task;
use rw_lang::checker::{StructEnv, resolve_type};

use crate::state::JobFailure;

// ---------------------------------------------------------------------------
// Output collection
// ---------------------------------------------------------------------------

/// Resolves relative file handles (e.g. `read_int("n.txt")`) against the
/// attempt's work directory; absolute handles pass through.
#[derive(Debug)]
struct WorkDirMapper {
    work_dir: PathBuf,
}

impl PathMapper for WorkDirMapper {
    fn to_host(&self, virt: &str) -> CoreResult<PathBuf> {
        let path = Path::new(virt);
        if path.is_absolute() {
            Ok(path.to_path_buf())
        } else {
            Ok(self.work_dir.join(path))
        }
    }

    fn virtualize(&self, host: &Path) -> String {
        host.to_string_lossy().into_owned()
    }
}

/// Evaluate the task's output declarations against the post-execution
/// environment. `File` outputs must resolve to existing paths under the
/// attempt's work directory; anything else is a filesystem error.
#[allow(clippy::too_many_arguments)]
pub(super) fn collect_outputs(
    task: &Task,
    structs: &StructEnv,
    env: &Env,
    stdlib: &Stdlib,
    work_dir: &Path,
    stdout_path: &Path,
    stderr_path: &Path,
    attempt: u32,
) -> Result<Vec<(String, Value)>, JobFailure> {
    let stdlib = stdlib
        .clone()
        .with_mapper(Arc::new(WorkDirMapper {
            work_dir: work_dir.to_path_buf(),
        }))
        .with_task_io(TaskIo {
            stdout: stdout_path.to_path_buf(),
            stderr: stderr_path.to_path_buf(),
            work_dir: work_dir.to_path_buf(),
        });
    let work_root = work_dir
        .canonicalize()
        .unwrap_or_else(|_| work_dir.to_path_buf());

    let mut scratch = Vec::new();
    let mut env = env.clone();
    let mut outputs = Vec::with_capacity(task.outputs.len());
    for d in &task.outputs {
        let ty = resolve_type(&d.ty, structs, d.span, &mut scratch);
        let Some(expr) = &d.expr else {
            return Err(JobFailure {
                kind: "EvalError".to_string(),
                message: format!("output `{}` has no expression", d.name),
                exit_status: None,
                stderr_path: None,
                attempts: attempt,
            });
        };
        let value = eval(expr, &env, &stdlib)
            .and_then(|v| v.coerce_to(&ty))
            .map_err(|e| JobFailure {
                kind: "EvalError".to_string(),
                message: format!("output `{}`: {e}", d.name),
                exit_status: None,
                stderr_path: None,
                attempts: attempt,
            })?;
        let value = resolve_output_files(&value, &work_root, stdout_path, stderr_path, &d.name, attempt)?;
        env = env.bind(d.name.clone(), value.clone());
        outputs.push((d.name.clone(), value));
    }
    Ok(outputs)
}

/// Resolve relative file handles against the work dir and reject paths
/// escaping it. `stdout()`/`stderr()` files sit beside the work dir and
/// are allowed explicitly.
fn resolve_output_files(
    value: &Value,
    work_root: &Path,
    stdout_path: &Path,
    stderr_path: &Path,
    output: &str,
    attempt: u32,
) -> Result<Value, JobFailure> {
    match value {
        Value::File(path) | Value::Directory(path) => {
            let raw = PathBuf::from(path);
            let host = if raw.is_absolute() {
                raw
            } else {
                work_root.join(raw)
            };
            if host == stdout_path || host == stderr_path {
                return Ok(value_with_path(value, &host));
            }
            let canonical = host.canonicalize().map_err(|_| JobFailure {
                kind: "FilesystemError".to_string(),
                message: format!(
                    "output `{output}` refers to {} which does not exist",
                    host.display()
                ),
                exit_status: None,
                stderr_path: None,
                attempts: attempt,
            })?;
            if !canonical.starts_with(work_root) {
                return Err(JobFailure {
                    kind: "FilesystemError".to_string(),
                    message: format!(
                        "output `{output}` resolves outside the task work directory: {}",
                        canonical.display()
                    ),
                    exit_status: None,
                    stderr_path: None,
                    attempts: attempt,
                });
            }
            Ok(value_with_path(value, &canonical))
        }
        Value::Array { item, items } => {
            let resolved: Result<Vec<Value>, JobFailure> = items
                .iter()
                .map(|v| resolve_output_files(v, work_root, stdout_path, stderr_path, output, attempt))
                .collect();
            Ok(Value::Array {
                item: item.clone(),
                items: resolved?,
            })
        }
        Value::Map { key, value: vt, entries } => {
            let resolved: Result<Vec<(Value, Value)>, JobFailure> = entries
                .iter()
                .map(|(k, v)| {
                    Ok((
                        k.clone(),
                        resolve_output_files(v, work_root, stdout_path, stderr_path, output, attempt)?,
                    ))
                })
                .collect();
            Ok(Value::Map {
                key: key.clone(),
                value: vt.clone(),
                entries: resolved?,
            })
        }
        Value::Pair(l, r) => Ok(Value::Pair(
            Box::new(resolve_output_files(l, work_root, stdout_path, stderr_path, output, attempt)?),
            Box::new(resolve_output_files(r, work_root, stdout_path, stderr_path, output, attempt)?),
        )),
        Value::Struct { type_name, members } => {
            let resolved: Result<Vec<(String, Value)>, JobFailure> = members
                .iter()
                .map(|(n, v)| {
                    Ok((
                        n.clone(),
                        resolve_output_files(v, work_root, stdout_path, stderr_path, output, attempt)?,
                    ))
                })
                .collect();
            Ok(Value::Struct {
                type_name: type_name.clone(),
                members: resolved?,
            })
        }
        other => Ok(other.clone()),
    }
}

fn value_with_path(value: &Value, path: &Path) -> Value {
    let s = path.to_string_lossy().into_owned();
    match value {
        Value::Directory(_) => Value::Directory(s),
        _ => Value::File(s),
    }
}

// ---------------------------------------------------------------------------
// out/ symlink tree
// ---------------------------------------------------------------------------

/// Build the `out/` link tree: one subdirectory per output name, with
/// symlinks to every file or directory value (array elements in numbered
/// subdirectories). Best-effort: link failures are logged, not fatal.
pub fn link_output_tree(out_dir: &Path, outputs: &[(String, Value)]) {
    for (name, value) in outputs {
        link_value(&out_dir.join(name), value);
    }
}

fn link_value(dir: &Path, value: &Value) {
    match value {
        Value::File(path) | Value::Directory(path) => {
            let target = Path::new(path);
            let Some(base) = target.file_name() else { return };
            if std::fs::create_dir_all(dir).is_err() {
                return;
            }
            let link = dir.join(base);
            #[cfg(unix)]
            if let Err(e) = std::os::unix::fs::symlink(target, &link) {
                rw_debug!(task, link = %link.display(), error = %e, "cannot create output symlink");
            }
        }
        Value::Array { items, .. } => {
            for (i, item) in items.iter().enumerate() {
                link_value(&dir.join(i.to_string()), item);
            }
        }
        Value::Pair(l, r) => {
            link_value(&dir.join("left"), l);
            link_value(&dir.join("right"), r);
        }
        Value::Map { entries, .. } => {
            for (k, v) in entries {
                if let Ok(key) = k.display_string() {
                    link_value(&dir.join(key), v);
                }
            }
        }
        Value::Struct { members, .. } => {
            for (n, v) in members {
                link_value(&dir.join(n), v);
            }
        }
        _ => {}
    }
}
