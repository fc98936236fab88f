use std::path::{Path, PathBuf};
use std::sync::Arc;

use fs2::FileExt;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use rw_config::DownloadCacheConfig;
use rw_core::Value;
use rw_core::json::RunInputs;
use rw_lang::ast::Document;

use crate::state::JobFailure;
use crate::task::{TaskContext, TaskSpec, run_task};

// ---------------------------------------------------------------------------
// URI detection
// ---------------------------------------------------------------------------

const SCHEMES: &[&str] = &["http", "https", "ftp", "s3", "gs"];

/// Whether a `File`/`Directory` handle is a downloadable URI rather than a
/// local path.
pub fn is_downloadable(handle: &str) -> bool {
    match handle.split_once("://") {
        Some((scheme, _)) => SCHEMES.contains(&scheme),
        None => false,
    }
}

/// Helper container images, referenced by tag only (spec'd external
/// collaborators, invoked through the ordinary task runtime).
fn helper_for(scheme: &str) -> (&'static str, &'static str) {
    match scheme {
        "s3" => (
            "amazon/aws-cli:2.15.0",
            "aws s3 cp \"~{uri}\" download",
        ),
        "gs" => (
            "google/cloud-sdk:464.0.0-slim",
            "gsutil cp \"~{uri}\" download",
        ),
        // http / https / ftp
        _ => (
            "runwdl/aria2:1",
            "aria2c -x 4 -s 4 -o download \"~{uri}\"",
        ),
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Resolves URI-typed inputs to local files before the workflow starts:
/// each distinct URI runs a synthetic download task (scheme-specific
/// helper image), optionally mediated by the cross-run download cache.
/// Shared flocks are held on cached entries for the run's lifetime so an
/// external eviction tool can coordinate.
pub struct DownloadOrchestrator<'a> {
    ctx: &'a TaskContext,
    run_dir: &'a Path,
    cache: &'a DownloadCacheConfig,
    /// Shared locks on cache entries in use; released on drop at run end.
    locks: Vec<std::fs::File>,
    counter: usize,
}

impl<'a> DownloadOrchestrator<'a> {
    pub fn new(ctx: &'a TaskContext, run_dir: &'a Path, cache: &'a DownloadCacheConfig) -> Self {
        DownloadOrchestrator {
            ctx,
            run_dir,
            cache,
            locks: Vec::new(),
            counter: 0,
        }
    }

    /// Rewrite every downloadable input to a local file path.
    pub async fn localize_inputs(
        &mut self,
        mut inputs: RunInputs,
        cancel: &CancellationToken,
    ) -> Result<RunInputs, JobFailure> {
        let names: Vec<String> = inputs.direct.keys().cloned().collect();
        for name in names {
            let value = inputs.direct.get(&name).cloned().unwrap();
            let localized = self.localize_value(&value, cancel).await?;
            inputs.direct.insert(name, localized);
        }
        Ok(inputs)
    }

    async fn localize_value(
        &mut self,
        value: &Value,
        cancel: &CancellationToken,
    ) -> Result<Value, JobFailure> {
        match value {
            Value::File(handle) | Value::Directory(handle) if is_downloadable(handle) => {
                let local = self.fetch(handle, cancel).await?;
                Ok(match value {
                    Value::Directory(_) => Value::Directory(local),
                    _ => Value::File(local),
                })
            }
            Value::Array { item, items } => {
                let mut out = Vec::with_capacity(items.len());
                for v in items {
                    out.push(Box::pin(self.localize_value(v, cancel)).await?);
                }
                Ok(Value::Array {
                    item: item.clone(),
                    items: out,
                })
            }
            Value::Pair(l, r) => Ok(Value::Pair(
                Box::new(Box::pin(self.localize_value(l, cancel)).await?),
                Box::new(Box::pin(self.localize_value(r, cancel)).await?),
            )),
            Value::Map { key, value: vt, entries } => {
                let mut out = Vec::with_capacity(entries.len());
                for (k, v) in entries {
                    out.push((k.clone(), Box::pin(self.localize_value(v, cancel)).await?));
                }
                Ok(Value::Map {
                    key: key.clone(),
                    value: vt.clone(),
                    entries: out,
                })
            }
            other => Ok(other.clone()),
        }
    }

    async fn fetch(&mut self, uri: &str, cancel: &CancellationToken) -> Result<String, JobFailure> {
        // Cross-run cache: keyed by URI alone.
        if self.cache.enabled && self.cache.uri_allowed(uri) {
            if let Some(dir) = self.cache.dir.clone() {
                let slot = dir.join(uri_digest(uri));
                if let Some(cached) = self.cached_entry(&slot)? {
                    rw_info!(task, uri = uri, "download cache hit");
                    return Ok(cached);
                }
                let local = self.download_via_task(uri, cancel).await?;
                self.install_into_cache(&slot, &local)?;
                return self.cached_entry(&slot)?.ok_or_else(|| JobFailure {
                    kind: "FilesystemError".to_string(),
                    message: format!("download cache entry for {uri} vanished"),
                    exit_status: None,
                    stderr_path: None,
                    attempts: 1,
                });
            }
        }
        self.download_via_task(uri, cancel).await
    }

    /// Take a shared flock on the entry and return the cached file.
    fn cached_entry(&mut self, slot: &Path) -> Result<Option<String>, JobFailure> {
        let marker = slot.join(".lock");
        if !marker.exists() {
            return Ok(None);
        }
        let lock = std::fs::File::open(&marker).map_err(|e| fs_failure(&marker, e))?;
        lock.lock_shared().map_err(|e| fs_failure(&marker, e))?;
        let entries = std::fs::read_dir(slot).map_err(|e| fs_failure(slot, e))?;
        for entry in entries.flatten() {
            if entry.file_name() != ".lock" {
                self.locks.push(lock);
                return Ok(Some(entry.path().to_string_lossy().into_owned()));
            }
        }
        Ok(None)
    }

    fn install_into_cache(&self, slot: &Path, local: &str) -> Result<(), JobFailure> {
        std::fs::create_dir_all(slot).map_err(|e| fs_failure(slot, e))?;
        let src = Path::new(local);
        let dest = slot.join(src.file_name().unwrap_or_default());
        std::fs::rename(src, &dest)
            .or_else(|_| std::fs::copy(src, &dest).map(|_| ()))
            .map_err(|e| fs_failure(&dest, e))?;
        std::fs::File::create(slot.join(".lock")).map_err(|e| fs_failure(slot, e))?;
        Ok(())
    }

    /// Materialize the synthetic task and run it like any user task.
    async fn download_via_task(
        &mut self,
        uri: &str,
        cancel: &CancellationToken,
    ) -> Result<String, JobFailure> {
        let scheme = uri.split("://").next().unwrap_or("https");
        let (image, command) = helper_for(scheme);
        let source = format!(
            "version 1.1\ntask fetch {{\n  input {{ String uri }}\n  command <<<\n    set -euo pipefail\n    {command}\n  >>>\n  output {{ File out = \"download\" }}\n  runtime {{ docker: \"{image}\" }}\n}}\n"
        );
        let doc = Arc::new(
            rw_lang::parse_document(&source, "download.wdl").expect("synthetic task parses"),
        );
        let task = doc.tasks[0].clone();

        self.counter += 1;
        let call_dir = self.run_dir.join("download").join(self.counter.to_string());
        rw_info!(task, uri = uri, image = image, "downloading input");
        let outputs = run_task(
            self.ctx,
            TaskSpec {
                task,
                doc,
                call_dir,
                inputs: vec![("uri".to_string(), Value::String(uri.to_string()))],
                name: format!("download-{}", self.counter),
            },
            cancel.clone(),
        )
        .await?;

        match outputs.into_iter().find(|(n, _)| n == "out") {
            Some((_, Value::File(path))) => Ok(path),
            _ => Err(JobFailure {
                kind: "FilesystemError".to_string(),
                message: format!("download of {uri} produced no file"),
                exit_status: None,
                stderr_path: None,
                attempts: 1,
            }),
        }
    }
}

fn uri_digest(uri: &str) -> String {
    let digest = Sha256::digest(uri.as_bytes());
    digest.iter().take(16).map(|b| format!("{b:02x}")).collect()
}

fn fs_failure(path: &Path, e: std::io::Error) -> JobFailure {
    JobFailure {
        kind: "FilesystemError".to_string(),
        message: format!("{}: {e}", path.display()),
        exit_status: None,
        stderr_path: None,
        attempts: 1,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheme_detection() {
        assert!(is_downloadable("https://example.org/ref.fa"));
        assert!(is_downloadable("s3://bucket/key"));
        assert!(is_downloadable("gs://bucket/key"));
        assert!(!is_downloadable("/local/path.txt"));
        assert!(!is_downloadable("relative/path.txt"));
        assert!(!is_downloadable("weird://thing"));
    }

    #[test]
    fn uri_digests_are_stable() {
        assert_eq!(
            uri_digest("https://example.org/a"),
            uri_digest("https://example.org/a")
        );
        assert_ne!(
            uri_digest("https://example.org/a"),
            uri_digest("https://example.org/b")
        );
    }

    #[test]
    fn helper_selection() {
        assert!(helper_for("s3").0.starts_with("amazon/"));
        assert!(helper_for("gs").0.starts_with("google/"));
        assert!(helper_for("https").1.contains("aria2c"));
    }
}
