use std::path::{Path, PathBuf};

use fs2::FileExt;
use orion_error::prelude::*;
use sha2::{Digest, Sha256};

use rw_config::CallCacheConfig;
use rw_core::Value;

use crate::error::{RuntimeReason, RuntimeResult};

// ---------------------------------------------------------------------------
// Source normalization — the digesting conformance boundary
// ---------------------------------------------------------------------------

/// Normalize WDL source for digesting: strip `#` comments (outside string
/// literals) and collapse whitespace runs to single spaces. Two sources
/// that differ only in comments or layout digest identically.
pub fn normalize_source(source: &str) -> String {
    let mut out = String::with_capacity(source.len());
    let mut chars = source.chars().peekable();
    let mut in_string: Option<char> = None;
    let mut pending_space = false;

    while let Some(c) = chars.next() {
        match in_string {
            Some(quote) => {
                out.push(c);
                if c == '\\' {
                    if let Some(escaped) = chars.next() {
                        out.push(escaped);
                    }
                } else if c == quote {
                    in_string = None;
                }
            }
            None => match c {
                '#' => {
                    for n in chars.by_ref() {
                        if n == '\n' {
                            break;
                        }
                    }
                    pending_space = true;
                }
                '"' | '\'' => {
                    if pending_space && !out.is_empty() {
                        out.push(' ');
                    }
                    pending_space = false;
                    in_string = Some(c);
                    out.push(c);
                }
                c if c.is_whitespace() => pending_space = true,
                c => {
                    if pending_space && !out.is_empty() {
                        out.push(' ');
                    }
                    pending_space = false;
                    out.push(c);
                }
            },
        }
    }
    out
}

fn hex_digest(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Digest of a task's normalized source text.
pub fn source_digest(task_source: &str) -> String {
    hex_digest(normalize_source(task_source).as_bytes())
}

/// Canonical digest of a call's inputs: sorted-key JSON, with local file
/// handles replaced by an `mtime+size` stamp (or a plain marker when the
/// file does not exist locally).
pub fn input_digest(inputs: &[(String, Value)]) -> String {
    let mut sorted: Vec<&(String, Value)> = inputs.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));

    let mut canonical = serde_json::Map::new();
    for (name, value) in sorted {
        canonical.insert(name.clone(), canonicalize(value));
    }
    hex_digest(serde_json::Value::Object(canonical).to_string().as_bytes())
}

fn canonicalize(value: &Value) -> serde_json::Value {
    match value {
        Value::File(path) | Value::Directory(path) => match file_stamp(Path::new(path)) {
            Some((mtime, size)) => serde_json::json!({
                "path": path,
                "mtime": mtime,
                "size": size,
            }),
            None => serde_json::json!({ "path": path }),
        },
        Value::Array { items, .. } => {
            serde_json::Value::Array(items.iter().map(canonicalize).collect())
        }
        Value::Map { entries, .. } => {
            let mut sorted: Vec<&(Value, Value)> = entries.iter().collect();
            sorted.sort_by_key(|(k, _)| k.display_string().unwrap_or_default());
            let mut map = serde_json::Map::new();
            for (k, v) in sorted {
                map.insert(k.display_string().unwrap_or_default(), canonicalize(v));
            }
            serde_json::Value::Object(map)
        }
        Value::Pair(l, r) => serde_json::json!({
            "left": canonicalize(l),
            "right": canonicalize(r),
        }),
        Value::Struct { members, .. } => {
            let mut sorted: Vec<&(String, Value)> = members.iter().collect();
            sorted.sort_by(|a, b| a.0.cmp(&b.0));
            let mut map = serde_json::Map::new();
            for (n, v) in sorted {
                map.insert(n.clone(), canonicalize(v));
            }
            serde_json::Value::Object(map)
        }
        other => other.to_json(),
    }
}

fn file_stamp(path: &Path) -> Option<(i64, u64)> {
    let meta = std::fs::metadata(path).ok()?;
    let mtime = meta
        .modified()
        .ok()?
        .duration_since(std::time::UNIX_EPOCH)
        .ok()?;
    Some((mtime.as_nanos() as i64, meta.len()))
}

// ---------------------------------------------------------------------------
// CallCache — persistent (source, inputs) → outputs store
// ---------------------------------------------------------------------------

/// Content-addressed store of task outputs, persisted as JSON files in a
/// configured directory. Keyed by `H(source_digest || input_digest)`;
/// entries are invalidated when any referenced local file changes.
pub struct CallCache {
    dir: PathBuf,
    get: bool,
    put: bool,
}

impl CallCache {
    pub fn from_config(config: &CallCacheConfig) -> Option<Self> {
        if !config.get && !config.put {
            return None;
        }
        let dir = config.dir.clone()?;
        Some(CallCache {
            dir,
            get: config.get,
            put: config.put,
        })
    }

    pub fn key(source_digest: &str, input_digest: &str) -> String {
        hex_digest(format!("{source_digest}{input_digest}").as_bytes())
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    /// Look up an entry. A hit requires `get = true`, no writer holding
    /// the entry lock, and every referenced local file unchanged since the
    /// entry was written.
    pub fn lookup(&self, key: &str) -> Option<Vec<(String, Value)>> {
        if !self.get {
            return None;
        }
        let path = self.entry_path(key);
        let file = std::fs::File::open(&path).ok()?;
        // A held exclusive lock means a writer is mid-flight.
        if file.try_lock_shared().is_err() {
            return None;
        }
        let entry: serde_json::Value = serde_json::from_reader(&file).ok()?;
        let _ = fs2::FileExt::unlock(&file);

        // Validate file stamps recorded at write time.
        for stamp in entry.get("files")?.as_array()? {
            let path = Path::new(stamp.get("path")?.as_str()?);
            let (mtime, size) = file_stamp(path)?;
            if mtime != stamp.get("mtime")?.as_i64()? || size != stamp.get("size")?.as_u64()? {
                rw_debug!(task, path = %path.display(), "cache entry invalidated by file change");
                return None;
            }
        }

        let outputs_json = entry.get("outputs")?.as_object()?;
        let mut outputs = Vec::with_capacity(outputs_json.len());
        for (name, j) in outputs_json {
            let value =
                Value::from_json(j, &rw_lang::types::Type::any()).ok()?;
            outputs.push((name.clone(), value));
        }
        Some(outputs)
    }

    /// Store a successful call's outputs, stamping every referenced local
    /// file for later invalidation. Takes an exclusive lock on the entry
    /// while writing.
    pub fn store(
        &self,
        key: &str,
        inputs: &[(String, Value)],
        outputs: &[(String, Value)],
    ) -> RuntimeResult<()> {
        if !self.put {
            return Ok(());
        }
        std::fs::create_dir_all(&self.dir).map_err(|e| {
            StructError::from(RuntimeReason::Configuration)
                .with_detail(format!("cannot create cache dir {}: {e}", self.dir.display()))
        })?;

        let mut files = Vec::new();
        for (_, value) in inputs.iter().chain(outputs.iter()) {
            collect_file_stamps(value, &mut files);
        }
        let mut outputs_json = serde_json::Map::new();
        for (name, value) in outputs {
            outputs_json.insert(name.clone(), value.to_json());
        }
        let entry = serde_json::json!({
            "files": files,
            "outputs": outputs_json,
        });

        let path = self.entry_path(key);
        let file = std::fs::File::create(&path).map_err(|e| {
            StructError::from(RuntimeReason::Configuration)
                .with_detail(format!("cannot write cache entry {}: {e}", path.display()))
        })?;
        file.lock_exclusive().map_err(|e| {
            StructError::from(RuntimeReason::Configuration)
                .with_detail(format!("cannot lock cache entry: {e}"))
        })?;
        serde_json::to_writer_pretty(&file, &entry).map_err(|e| {
            StructError::from(RuntimeReason::Configuration)
                .with_detail(format!("cannot serialize cache entry: {e}"))
        })?;
        let _ = fs2::FileExt::unlock(&file);
        Ok(())
    }
}

fn collect_file_stamps(value: &Value, out: &mut Vec<serde_json::Value>) {
    match value {
        Value::File(path) | Value::Directory(path) => {
            if let Some((mtime, size)) = file_stamp(Path::new(path)) {
                out.push(serde_json::json!({
                    "path": path,
                    "mtime": mtime,
                    "size": size,
                }));
            }
        }
        Value::Array { items, .. } => {
            for v in items {
                collect_file_stamps(v, out);
            }
        }
        Value::Map { entries, .. } => {
            for (_, v) in entries {
                collect_file_stamps(v, out);
            }
        }
        Value::Pair(l, r) => {
            collect_file_stamps(l, out);
            collect_file_stamps(r, out);
        }
        Value::Struct { members, .. } => {
            for (_, v) in members {
                collect_file_stamps(v, out);
            }
        }
        _ => {}
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_ignores_comments_and_layout() {
        let a = "task t {\n  # say hello\n  command <<<echo hi>>>\n}\n";
        let b = "task t { command <<<echo hi>>> }";
        assert_eq!(normalize_source(a), normalize_source(b));
        assert_eq!(source_digest(a), source_digest(b));
    }

    #[test]
    fn normalization_preserves_string_contents() {
        let a = "String x = \"a  #  b\"";
        let b = "String x = \"a # b\"";
        assert_ne!(normalize_source(a), normalize_source(b));
        assert!(normalize_source(a).contains("a  #  b"));
    }

    #[test]
    fn normalization_fixture_is_stable() {
        // Digesting is a conformance boundary: this fixture must not drift.
        let src = "version 1.0\ntask wc {\n  input { File f }  # input\n  command <<<\n    wc -l ~{f}\n  >>>\n}\n";
        assert_eq!(
            normalize_source(src),
            "version 1.0 task wc { input { File f } command <<< wc -l ~{f} >>> }"
        );
    }

    #[test]
    fn input_digest_is_order_insensitive() {
        let a = vec![
            ("x".to_string(), Value::Int(1)),
            ("y".to_string(), Value::String("s".into())),
        ];
        let b = vec![
            ("y".to_string(), Value::String("s".into())),
            ("x".to_string(), Value::Int(1)),
        ];
        assert_eq!(input_digest(&a), input_digest(&b));
    }

    #[test]
    fn file_inputs_digest_by_stamp() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("in.txt");
        std::fs::write(&path, "aaa").unwrap();
        let inputs = vec![(
            "f".to_string(),
            Value::File(path.to_string_lossy().into_owned()),
        )];
        let before = input_digest(&inputs);

        // Same stamp → same digest.
        assert_eq!(before, input_digest(&inputs));

        // Changing the file changes the digest.
        std::fs::write(&path, "bbbbbb").unwrap();
        assert_ne!(before, input_digest(&inputs));
    }

    #[test]
    fn cache_round_trip_and_invalidation() {
        let tmp = tempfile::tempdir().unwrap();
        let input_file = tmp.path().join("data.txt");
        std::fs::write(&input_file, "100 lines worth").unwrap();

        let cache = CallCache {
            dir: tmp.path().join("cache"),
            get: true,
            put: true,
        };
        let inputs = vec![(
            "f".to_string(),
            Value::File(input_file.to_string_lossy().into_owned()),
        )];
        let outputs = vec![("n".to_string(), Value::Int(100))];
        let key = CallCache::key(&source_digest("task wc {}"), &input_digest(&inputs));

        assert!(cache.lookup(&key).is_none());
        cache.store(&key, &inputs, &outputs).unwrap();

        let hit = cache.lookup(&key).expect("expected a cache hit");
        assert_eq!(hit[0].0, "n");
        assert_eq!(hit[0].1, Value::Int(100));

        // Touching the referenced input invalidates the entry.
        std::thread::sleep(std::time::Duration::from_millis(20));
        std::fs::write(&input_file, "different now!").unwrap();
        assert!(cache.lookup(&key).is_none());
    }

    #[test]
    fn get_put_flags_gate_access() {
        let tmp = tempfile::tempdir().unwrap();
        let no_get = CallCache {
            dir: tmp.path().to_path_buf(),
            get: false,
            put: true,
        };
        let outputs = vec![("n".to_string(), Value::Int(1))];
        no_get.store("k", &[], &outputs).unwrap();
        assert!(no_get.lookup("k").is_none());

        let no_put = CallCache {
            dir: tmp.path().to_path_buf(),
            get: true,
            put: false,
        };
        assert!(no_put.lookup("k").is_some());
    }
}
