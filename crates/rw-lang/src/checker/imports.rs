use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use crate::ast::Document;
use crate::parser::parse_document;

// ---------------------------------------------------------------------------
// ImportResolver — capability for loading import URIs
// ---------------------------------------------------------------------------

/// Loads the source text behind an `import "URI"` statement.
pub trait ImportResolver {
    /// Return the source text and the canonical URI of the resolved
    /// document. `importer` is the URI of the importing document, for
    /// relative resolution.
    fn read(&self, uri: &str, importer: Option<&str>) -> anyhow::Result<(String, String)>;
}

/// Filesystem resolver rooted at the main document's directory. Relative
/// imports resolve against the importing file; imports that escape the
/// root (`..` past the top) are denied unless `allow_outside` is set.
pub struct FileResolver {
    root: PathBuf,
    pub allow_outside: bool,
}

impl FileResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FileResolver {
            root: root.into(),
            allow_outside: false,
        }
    }
}

impl ImportResolver for FileResolver {
    fn read(&self, uri: &str, importer: Option<&str>) -> anyhow::Result<(String, String)> {
        if uri.contains("://") {
            anyhow::bail!("cannot import remote URI {uri:?} with the file resolver");
        }
        let path = Path::new(uri);
        let resolved = if path.is_absolute() {
            path.to_path_buf()
        } else {
            let base = importer
                .map(Path::new)
                .and_then(|p| p.parent())
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| self.root.clone());
            base.join(path)
        };
        let normalized = normalize_path(&resolved);
        if !self.allow_outside && !normalized.starts_with(normalize_path(&self.root)) {
            anyhow::bail!(
                "import {:?} resolves outside the workflow directory (pass --path to allow)",
                uri
            );
        }
        let text = std::fs::read_to_string(&normalized)
            .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", normalized.display()))?;
        Ok((text, normalized.to_string_lossy().into_owned()))
    }
}

/// Lexically resolve `.` and `..` without touching the filesystem.
fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Import loading and linking
// ---------------------------------------------------------------------------

/// An import failure: cycle, unreadable URI, or a parse error inside an
/// imported document.
#[derive(Debug)]
pub struct ImportError {
    pub uri: String,
    pub message: String,
}

impl std::fmt::Display for ImportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "import {:?}: {}", self.uri, self.message)
    }
}

impl std::error::Error for ImportError {}

/// Parse `uri` and recursively load its import tree, linking each
/// `Import.doc`. Import cycles are detected by URI.
pub fn load_document(
    uri: &str,
    resolver: &dyn ImportResolver,
) -> Result<Arc<Document>, ImportError> {
    let mut stack = Vec::new();
    load_recursive(uri, None, resolver, &mut stack)
}

/// Parse already-read source text as the root document, then link imports.
pub fn load_document_from_source(
    source: &str,
    uri: &str,
    resolver: &dyn ImportResolver,
) -> Result<Arc<Document>, ImportError> {
    let mut stack = vec![uri.to_string()];
    link(source, uri, resolver, &mut stack)
}

fn load_recursive(
    uri: &str,
    importer: Option<&str>,
    resolver: &dyn ImportResolver,
    stack: &mut Vec<String>,
) -> Result<Arc<Document>, ImportError> {
    let (source, canonical) = resolver.read(uri, importer).map_err(|e| ImportError {
        uri: uri.to_string(),
        message: e.to_string(),
    })?;
    if stack.contains(&canonical) {
        return Err(ImportError {
            uri: uri.to_string(),
            message: format!("import cycle through {canonical:?}"),
        });
    }
    stack.push(canonical.clone());
    let doc = link(&source, &canonical, resolver, stack);
    stack.pop();
    doc
}

fn link(
    source: &str,
    uri: &str,
    resolver: &dyn ImportResolver,
    stack: &mut Vec<String>,
) -> Result<Arc<Document>, ImportError> {
    let mut doc = parse_document(source, uri).map_err(|e| ImportError {
        uri: uri.to_string(),
        message: e.to_string(),
    })?;
    for import in &mut doc.imports {
        let child = load_recursive(&import.uri, Some(uri), resolver, stack)?;
        import.doc = Some(child);
    }
    Ok(Arc::new(doc))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, text: &str) {
        std::fs::write(dir.join(name), text).unwrap();
    }

    #[test]
    fn loads_and_links_imports() {
        let tmp = tempfile::tempdir().unwrap();
        write(
            tmp.path(),
            "lib.wdl",
            "version 1.0\ntask t { command <<<true>>> }\n",
        );
        write(
            tmp.path(),
            "main.wdl",
            "version 1.0\nimport \"lib.wdl\" as lib\nworkflow w { call lib.t }\n",
        );

        let resolver = FileResolver::new(tmp.path());
        let main = tmp.path().join("main.wdl");
        let doc = load_document(main.to_str().unwrap(), &resolver).unwrap();
        assert_eq!(doc.imports.len(), 1);
        let lib = doc.imports[0].doc.as_ref().unwrap();
        assert_eq!(lib.tasks.len(), 1);
        assert_eq!(doc.imports[0].namespace(), "lib");
    }

    #[test]
    fn detects_import_cycles() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "a.wdl", "version 1.0\nimport \"b.wdl\"\n");
        write(tmp.path(), "b.wdl", "version 1.0\nimport \"a.wdl\"\n");

        let resolver = FileResolver::new(tmp.path());
        let a = tmp.path().join("a.wdl");
        let err = load_document(a.to_str().unwrap(), &resolver).unwrap_err();
        assert!(err.message.contains("cycle"), "unexpected: {err}");
    }

    #[test]
    fn denies_outside_imports() {
        let tmp = tempfile::tempdir().unwrap();
        let inner = tmp.path().join("project");
        std::fs::create_dir(&inner).unwrap();
        write(tmp.path(), "secret.wdl", "version 1.0\n");
        write(&inner, "main.wdl", "version 1.0\nimport \"../secret.wdl\"\n");

        let resolver = FileResolver::new(&inner);
        let main = inner.join("main.wdl");
        let err = load_document(main.to_str().unwrap(), &resolver).unwrap_err();
        assert!(err.message.contains("outside"), "unexpected: {err}");
    }
}
