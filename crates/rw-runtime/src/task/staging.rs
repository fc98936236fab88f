use std::path::{Path, PathBuf};

use rw_core::Value;

use crate::backend::Mount;
use crate::state::JobFailure;

use super::fs_failure;

// ---------------------------------------------------------------------------
// Input staging
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub(super) struct StagedInputs {
    /// Input bindings with file handles rewritten where copies were made.
    pub inputs: Vec<(String, Value)>,
    /// Read-only bind mounts for files left in place.
    pub mounts: Vec<Mount>,
}

/// Make every `File`/`Directory` input reachable from inside the
/// container: by default a read-only bind mount at its host path; under
/// `copy_input_files`, a private copy inside the work directory (making
/// the input writable and the container hermetic).
pub(super) fn stage_inputs(
    inputs: &[(String, Value)],
    work_dir: &Path,
    copy_input_files: bool,
) -> Result<StagedInputs, JobFailure> {
    let mut out = StagedInputs {
        inputs: Vec::with_capacity(inputs.len()),
        mounts: Vec::new(),
    };
    let mut copy_index = 0usize;

    for (name, value) in inputs {
        let staged = stage_value(value, work_dir, copy_input_files, &mut copy_index, &mut out.mounts)?;
        out.inputs.push((name.clone(), staged));
    }

    // One mount per distinct path.
    out.mounts.sort_by(|a, b| a.host.cmp(&b.host));
    out.mounts.dedup_by(|a, b| a.host == b.host);
    Ok(out)
}

fn stage_value(
    value: &Value,
    work_dir: &Path,
    copy: bool,
    copy_index: &mut usize,
    mounts: &mut Vec<Mount>,
) -> Result<Value, JobFailure> {
    match value {
        Value::File(path) | Value::Directory(path) => {
            let host = PathBuf::from(path);
            // Files synthesized inside the run directory are mounted like
            // any other input; only paths under the work dir need nothing.
            if host.starts_with(work_dir) {
                return Ok(value.clone());
            }
            if !host.exists() {
                return Err(JobFailure {
                    kind: "FilesystemError".to_string(),
                    message: format!("input file {} does not exist", host.display()),
                    exit_status: None,
                    stderr_path: None,
                    attempts: 0,
                });
            }
            if copy {
                let staged = copy_into_work(&host, work_dir, copy_index)?;
                let staged_str = staged.to_string_lossy().into_owned();
                Ok(match value {
                    Value::Directory(_) => Value::Directory(staged_str),
                    _ => Value::File(staged_str),
                })
            } else {
                mounts.push(Mount {
                    host: host.clone(),
                    container: host,
                    read_only: true,
                });
                Ok(value.clone())
            }
        }
        Value::Array { item, items } => {
            let staged: Result<Vec<Value>, JobFailure> = items
                .iter()
                .map(|v| stage_value(v, work_dir, copy, copy_index, mounts))
                .collect();
            Ok(Value::Array {
                item: item.clone(),
                items: staged?,
            })
        }
        Value::Map { key, value: vt, entries } => {
            let staged: Result<Vec<(Value, Value)>, JobFailure> = entries
                .iter()
                .map(|(k, v)| {
                    Ok((
                        k.clone(),
                        stage_value(v, work_dir, copy, copy_index, mounts)?,
                    ))
                })
                .collect();
            Ok(Value::Map {
                key: key.clone(),
                value: vt.clone(),
                entries: staged?,
            })
        }
        Value::Pair(l, r) => Ok(Value::Pair(
            Box::new(stage_value(l, work_dir, copy, copy_index, mounts)?),
            Box::new(stage_value(r, work_dir, copy, copy_index, mounts)?),
        )),
        Value::Struct { type_name, members } => {
            let staged: Result<Vec<(String, Value)>, JobFailure> = members
                .iter()
                .map(|(n, v)| Ok((n.clone(), stage_value(v, work_dir, copy, copy_index, mounts)?)))
                .collect();
            Ok(Value::Struct {
                type_name: type_name.clone(),
                members: staged?,
            })
        }
        other => Ok(other.clone()),
    }
}

fn copy_into_work(
    host: &Path,
    work_dir: &Path,
    copy_index: &mut usize,
) -> Result<PathBuf, JobFailure> {
    let base = host
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "input".to_string());
    let slot = work_dir.join("_inputs").join(copy_index.to_string());
    *copy_index += 1;
    std::fs::create_dir_all(&slot).map_err(|e| fs_failure(&slot, e))?;
    let dest = slot.join(base);

    if host.is_dir() {
        copy_dir(host, &dest)?;
    } else {
        std::fs::copy(host, &dest).map_err(|e| fs_failure(&dest, e))?;
    }
    Ok(dest)
}

fn copy_dir(from: &Path, to: &Path) -> Result<(), JobFailure> {
    std::fs::create_dir_all(to).map_err(|e| fs_failure(to, e))?;
    let entries = std::fs::read_dir(from).map_err(|e| fs_failure(from, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| fs_failure(from, e))?;
        let dest = to.join(entry.file_name());
        let ty = entry.file_type().map_err(|e| fs_failure(from, e))?;
        if ty.is_dir() {
            copy_dir(&entry.path(), &dest)?;
        } else {
            std::fs::copy(entry.path(), &dest).map_err(|e| fs_failure(&dest, e))?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rw_lang::types::Type;

    #[test]
    fn mounts_inputs_read_only_by_default() {
        let tmp = tempfile::tempdir().unwrap();
        let input = tmp.path().join("data.txt");
        std::fs::write(&input, "x").unwrap();
        let work = tmp.path().join("work");
        std::fs::create_dir(&work).unwrap();

        let staged = stage_inputs(
            &[(
                "f".to_string(),
                Value::File(input.to_string_lossy().into_owned()),
            )],
            &work,
            false,
        )
        .unwrap();
        assert_eq!(staged.mounts.len(), 1);
        assert!(staged.mounts[0].read_only);
        assert_eq!(staged.mounts[0].host, input);
        // The value keeps its original handle.
        assert!(matches!(&staged.inputs[0].1, Value::File(p) if *p == input.to_string_lossy()));
    }

    #[test]
    fn copies_when_configured() {
        let tmp = tempfile::tempdir().unwrap();
        let input = tmp.path().join("data.txt");
        std::fs::write(&input, "payload").unwrap();
        let work = tmp.path().join("work");
        std::fs::create_dir(&work).unwrap();

        let staged = stage_inputs(
            &[(
                "f".to_string(),
                Value::File(input.to_string_lossy().into_owned()),
            )],
            &work,
            true,
        )
        .unwrap();
        assert!(staged.mounts.is_empty());
        let Value::File(path) = &staged.inputs[0].1 else {
            panic!("expected file");
        };
        assert!(path.starts_with(work.to_string_lossy().as_ref()));
        assert_eq!(std::fs::read_to_string(path).unwrap(), "payload");
    }

    #[test]
    fn nested_files_are_staged() {
        let tmp = tempfile::tempdir().unwrap();
        let a = tmp.path().join("a.txt");
        let b = tmp.path().join("b.txt");
        std::fs::write(&a, "a").unwrap();
        std::fs::write(&b, "b").unwrap();
        let work = tmp.path().join("work");
        std::fs::create_dir(&work).unwrap();

        let arr = Value::array_of(
            Type::file(),
            vec![
                Value::File(a.to_string_lossy().into_owned()),
                Value::File(b.to_string_lossy().into_owned()),
                Value::File(a.to_string_lossy().into_owned()),
            ],
        );
        let staged = stage_inputs(&[("fs".to_string(), arr)], &work, false).unwrap();
        // Deduplicated mounts.
        assert_eq!(staged.mounts.len(), 2);
    }

    #[test]
    fn missing_input_is_a_filesystem_error() {
        let tmp = tempfile::tempdir().unwrap();
        let work = tmp.path().join("work");
        std::fs::create_dir(&work).unwrap();
        let err = stage_inputs(
            &[("f".to_string(), Value::File("/no/such/file".to_string()))],
            &work,
            false,
        )
        .unwrap_err();
        assert_eq!(err.kind, "FilesystemError");
    }
}
