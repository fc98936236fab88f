use std::path::PathBuf;

use orion_error::prelude::*;
use sha2::{Digest, Sha256};

use rw_lang::types::Type;

use crate::error::{CoreReason, CoreResult};
use crate::value::Value;

use super::{Stdlib, eval_err, take};

// ---------------------------------------------------------------------------
// Readers
// ---------------------------------------------------------------------------

fn resolve(stdlib: &Stdlib, v: &Value) -> CoreResult<PathBuf> {
    let virt = match v {
        Value::File(p) | Value::Directory(p) | Value::String(p) => p.as_str(),
        other => {
            return eval_err(format!("expected a File, got {}", other.wdl_type()));
        }
    };
    stdlib.mapper().to_host(virt)
}

fn read_to_string(stdlib: &Stdlib, v: &Value) -> CoreResult<String> {
    let path = resolve(stdlib, v)?;
    std::fs::read_to_string(&path).map_err(|e| {
        StructError::from(CoreReason::Filesystem)
            .with_detail(format!("cannot read {}: {e}", path.display()))
    })
}

pub(super) fn read_string(stdlib: &Stdlib, args: Vec<Value>) -> CoreResult<Value> {
    let [f] = take::<1>("read_string", args)?;
    let mut text = read_to_string(stdlib, &f)?;
    // A single trailing newline is not part of the value.
    if text.ends_with('\n') {
        text.pop();
        if text.ends_with('\r') {
            text.pop();
        }
    }
    Ok(Value::String(text))
}

pub(super) fn read_scalar(stdlib: &Stdlib, args: Vec<Value>, which: &str) -> CoreResult<Value> {
    let [f] = take::<1>(which, args)?;
    let text = read_to_string(stdlib, &f)?;
    let token = text.trim();
    match which {
        "read_int" => token
            .parse::<i64>()
            .map(Value::Int)
            .map_err(|_| {
                StructError::from(CoreReason::Eval)
                    .with_detail(format!("read_int(): {token:?} is not an Int"))
            }),
        "read_float" => token
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|_| {
                StructError::from(CoreReason::Eval)
                    .with_detail(format!("read_float(): {token:?} is not a Float"))
            }),
        "read_boolean" => match token.to_ascii_lowercase().as_str() {
            "true" => Ok(Value::Boolean(true)),
            "false" => Ok(Value::Boolean(false)),
            _ => eval_err(format!("read_boolean(): {token:?} is not a Boolean")),
        },
        _ => unreachable!(),
    }
}

pub(super) fn read_lines(stdlib: &Stdlib, args: Vec<Value>) -> CoreResult<Value> {
    let [f] = take::<1>("read_lines", args)?;
    let text = read_to_string(stdlib, &f)?;
    let items: Vec<Value> = text
        .lines()
        .map(|l| Value::String(l.to_string()))
        .collect();
    Ok(Value::array_of(Type::string(), items))
}

pub(super) fn read_tsv(stdlib: &Stdlib, args: Vec<Value>) -> CoreResult<Value> {
    let [f] = take::<1>("read_tsv", args)?;
    let text = read_to_string(stdlib, &f)?;
    let rows: Vec<Value> = text
        .lines()
        .map(|line| {
            Value::array_of(
                Type::string(),
                line.split('\t')
                    .map(|cell| Value::String(cell.to_string()))
                    .collect(),
            )
        })
        .collect();
    Ok(Value::array_of(Type::array(Type::string()), rows))
}

pub(super) fn read_map(stdlib: &Stdlib, args: Vec<Value>) -> CoreResult<Value> {
    let [f] = take::<1>("read_map", args)?;
    let text = read_to_string(stdlib, &f)?;
    let mut entries = Vec::new();
    for line in text.lines() {
        let Some((k, v)) = line.split_once('\t') else {
            return eval_err(format!("read_map(): line {line:?} has no tab separator"));
        };
        entries.push((
            Value::String(k.to_string()),
            Value::String(v.to_string()),
        ));
    }
    Ok(Value::Map {
        key: Type::string(),
        value: Type::string(),
        entries,
    })
}

pub(super) fn read_json(stdlib: &Stdlib, args: Vec<Value>) -> CoreResult<Value> {
    let [f] = take::<1>("read_json", args)?;
    let text = read_to_string(stdlib, &f)?;
    let json: serde_json::Value = serde_json::from_str(&text).map_err(|e| {
        StructError::from(CoreReason::Eval).with_detail(format!("read_json(): {e}"))
    })?;
    Value::from_json(&json, &Type::any())
}

// ---------------------------------------------------------------------------
// Writers — content-addressed files under write_/
// ---------------------------------------------------------------------------

fn write_file(stdlib: &Stdlib, prefix: &str, content: &str) -> CoreResult<Value> {
    let dir = stdlib.write_dir()?;
    std::fs::create_dir_all(dir).map_err(|e| {
        StructError::from(CoreReason::Filesystem)
            .with_detail(format!("cannot create {}: {e}", dir.display()))
    })?;
    let digest = Sha256::digest(content.as_bytes());
    let name = format!("{prefix}_{:016x}.txt", u64::from_be_bytes(digest[..8].try_into().unwrap()));
    let path = dir.join(name);
    if !path.exists() {
        std::fs::write(&path, content).map_err(|e| {
            StructError::from(CoreReason::Filesystem)
                .with_detail(format!("cannot write {}: {e}", path.display()))
        })?;
    }
    Ok(Value::File(stdlib.mapper().virtualize(&path)))
}

pub(super) fn write_lines(stdlib: &Stdlib, args: Vec<Value>) -> CoreResult<Value> {
    let [arr] = take::<1>("write_lines", args)?;
    let mut content = String::new();
    for v in arr.as_array()? {
        content.push_str(&v.display_string()?);
        content.push('\n');
    }
    write_file(stdlib, "write_lines", &content)
}

pub(super) fn write_tsv(stdlib: &Stdlib, args: Vec<Value>) -> CoreResult<Value> {
    let [rows] = take::<1>("write_tsv", args)?;
    let mut content = String::new();
    let mut width: Option<usize> = None;
    for row in rows.as_array()? {
        let cells = row.as_array()?;
        match width {
            None => width = Some(cells.len()),
            Some(w) if w != cells.len() => {
                return eval_err("write_tsv() requires a rectangular array");
            }
            _ => {}
        }
        let rendered: CoreResult<Vec<String>> =
            cells.iter().map(Value::display_string).collect();
        content.push_str(&rendered?.join("\t"));
        content.push('\n');
    }
    write_file(stdlib, "write_tsv", &content)
}

pub(super) fn write_map(stdlib: &Stdlib, args: Vec<Value>) -> CoreResult<Value> {
    let [map] = take::<1>("write_map", args)?;
    let Value::Map { entries, .. } = &map else {
        return eval_err(format!("write_map() expects a Map, got {}", map.wdl_type()));
    };
    let mut content = String::new();
    for (k, v) in entries {
        content.push_str(&k.display_string()?);
        content.push('\t');
        content.push_str(&v.display_string()?);
        content.push('\n');
    }
    write_file(stdlib, "write_map", &content)
}

pub(super) fn write_json(stdlib: &Stdlib, args: Vec<Value>) -> CoreResult<Value> {
    let [v] = take::<1>("write_json", args)?;
    let content = serde_json::to_string(&v.to_json()).map_err(|e| {
        StructError::from(CoreReason::Eval).with_detail(format!("write_json(): {e}"))
    })?;
    write_file(stdlib, "write_json", &content)
}

// ---------------------------------------------------------------------------
// size / glob
// ---------------------------------------------------------------------------

pub(super) fn size(stdlib: &Stdlib, name: &str, mut args: Vec<Value>) -> CoreResult<Value> {
    let unit = if args.len() == 2 {
        Some(args.pop().unwrap())
    } else {
        None
    };
    let [v] = take::<1>(name, args)?;

    let mut total = 0u64;
    collect_size(stdlib, &v, &mut total)?;

    let divisor = match unit {
        None => 1.0,
        Some(u) => unit_bytes(u.as_str()?)?,
    };
    Ok(Value::Float(total as f64 / divisor))
}

fn collect_size(stdlib: &Stdlib, v: &Value, total: &mut u64) -> CoreResult<()> {
    match v {
        Value::Null(_) => Ok(()),
        Value::Array { items, .. } => {
            for item in items {
                collect_size(stdlib, item, total)?;
            }
            Ok(())
        }
        other => {
            let path = resolve(stdlib, other)?;
            let meta = std::fs::metadata(&path).map_err(|e| {
                StructError::from(CoreReason::Filesystem)
                    .with_detail(format!("size(): cannot stat {}: {e}", path.display()))
            })?;
            if meta.is_dir() {
                *total += dir_size(&path)?;
            } else {
                *total += meta.len();
            }
            Ok(())
        }
    }
}

fn dir_size(path: &std::path::Path) -> CoreResult<u64> {
    let mut total = 0;
    let entries = std::fs::read_dir(path).map_err(|e| {
        StructError::from(CoreReason::Filesystem)
            .with_detail(format!("size(): cannot list {}: {e}", path.display()))
    })?;
    for entry in entries {
        let entry = entry.map_err(|e| {
            StructError::from(CoreReason::Filesystem).with_detail(format!("size(): {e}"))
        })?;
        let meta = entry.metadata().map_err(|e| {
            StructError::from(CoreReason::Filesystem).with_detail(format!("size(): {e}"))
        })?;
        if meta.is_dir() {
            total += dir_size(&entry.path())?;
        } else {
            total += meta.len();
        }
    }
    Ok(total)
}

fn unit_bytes(unit: &str) -> CoreResult<f64> {
    let bytes: f64 = match unit {
        "B" => 1.0,
        "K" | "KB" => 1e3,
        "M" | "MB" => 1e6,
        "G" | "GB" => 1e9,
        "T" | "TB" => 1e12,
        "Ki" | "KiB" => 1024.0,
        "Mi" | "MiB" => 1024.0 * 1024.0,
        "Gi" | "GiB" => 1024.0 * 1024.0 * 1024.0,
        "Ti" | "TiB" => 1024.0f64.powi(4),
        _ => {
            return eval_err(format!("size(): unknown unit {unit:?}"));
        }
    };
    Ok(bytes)
}

pub(super) fn glob_files(stdlib: &Stdlib, name: &str, args: Vec<Value>) -> CoreResult<Value> {
    let [pattern] = take::<1>(name, args)?;
    let Some(io) = stdlib.task_io() else {
        return eval_err("glob() is only available in task output sections");
    };
    let full = io.work_dir.join(pattern.as_str()?);
    let matches = glob::glob(&full.to_string_lossy()).map_err(|e| {
        StructError::from(CoreReason::Eval).with_detail(format!("glob(): bad pattern: {e}"))
    })?;

    let mut items = Vec::new();
    for entry in matches {
        let path = entry.map_err(|e| {
            StructError::from(CoreReason::Filesystem).with_detail(format!("glob(): {e}"))
        })?;
        if path.is_file() {
            items.push(Value::File(stdlib.mapper().virtualize(&path)));
        }
    }
    items.sort_by(|a, b| {
        let (Value::File(x), Value::File(y)) = (a, b) else {
            return std::cmp::Ordering::Equal;
        };
        x.cmp(y)
    });
    Ok(Value::array_of(Type::file(), items))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::super::{IdentityMapper, Stdlib, TaskIo};
    use super::*;

    fn stdlib_in(dir: &std::path::Path) -> Stdlib {
        Stdlib::new(dir.join("write_"), Arc::new(IdentityMapper))
    }

    #[test]
    fn lines_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let stdlib = stdlib_in(tmp.path());

        let lines = Value::array_of(
            Type::string(),
            vec![
                Value::String("alpha".into()),
                Value::String("beta".into()),
                Value::String("".into()),
            ],
        );
        let file = stdlib.call("write_lines", vec![lines.clone()]).unwrap();
        let back = stdlib.call("read_lines", vec![file]).unwrap();
        assert_eq!(back, lines);
    }

    #[test]
    fn json_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let stdlib = stdlib_in(tmp.path());

        let v = Value::Map {
            key: Type::string(),
            value: Type::array(Type::int()),
            entries: vec![(
                Value::String("xs".into()),
                Value::array_of(Type::int(), vec![Value::Int(1), Value::Int(2)]),
            )],
        };
        let file = stdlib.call("write_json", vec![v.clone()]).unwrap();
        let back = stdlib.call("read_json", vec![file]).unwrap();
        assert_eq!(back.to_json(), v.to_json());
    }

    #[test]
    fn tsv_requires_rectangles() {
        let tmp = tempfile::tempdir().unwrap();
        let stdlib = stdlib_in(tmp.path());

        let ragged = Value::array_of(
            Type::array(Type::string()),
            vec![
                Value::array_of(Type::string(), vec![Value::String("a".into())]),
                Value::array_of(
                    Type::string(),
                    vec![Value::String("b".into()), Value::String("c".into())],
                ),
            ],
        );
        assert!(stdlib.call("write_tsv", vec![ragged]).is_err());
    }

    #[test]
    fn read_scalars() {
        let tmp = tempfile::tempdir().unwrap();
        let stdlib = stdlib_in(tmp.path());
        let path = tmp.path().join("n.txt");
        std::fs::write(&path, "42\n").unwrap();
        let f = Value::File(path.to_string_lossy().into_owned());
        assert_eq!(
            stdlib.call("read_int", vec![f.clone()]).unwrap(),
            Value::Int(42)
        );
        assert!(stdlib.call("read_boolean", vec![f]).is_err());
    }

    #[test]
    fn size_with_units() {
        let tmp = tempfile::tempdir().unwrap();
        let stdlib = stdlib_in(tmp.path());
        let path = tmp.path().join("k.bin");
        std::fs::write(&path, vec![0u8; 2048]).unwrap();
        let f = Value::File(path.to_string_lossy().into_owned());
        let v = stdlib
            .call("size", vec![f, Value::String("Ki".into())])
            .unwrap();
        assert_eq!(v, Value::Float(2.0));
    }

    #[test]
    fn glob_needs_task_context_and_sorts() {
        let tmp = tempfile::tempdir().unwrap();
        let work = tmp.path().join("work");
        std::fs::create_dir(&work).unwrap();
        std::fs::write(work.join("b.txt"), "b").unwrap();
        std::fs::write(work.join("a.txt"), "a").unwrap();

        let bare = stdlib_in(tmp.path());
        assert!(bare.call("glob", vec![Value::String("*.txt".into())]).is_err());

        let stdlib = bare.with_task_io(TaskIo {
            stdout: work.join("stdout.txt"),
            stderr: work.join("stderr.txt"),
            work_dir: work.clone(),
        });
        let v = stdlib
            .call("glob", vec![Value::String("*.txt".into())])
            .unwrap();
        let items = v.as_array().unwrap();
        assert_eq!(items.len(), 2);
        assert!(matches!(&items[0], Value::File(p) if p.ends_with("a.txt")));
    }

    #[test]
    fn stdout_stderr_need_task_context() {
        let tmp = tempfile::tempdir().unwrap();
        let stdlib = stdlib_in(tmp.path());
        assert!(stdlib.call("stdout", vec![]).is_err());
    }
}
