use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;

// ---------------------------------------------------------------------------
// LoggingConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Plain,
    Json,
}

/// Logging knobs: base level, per-module overrides, output format, and an
/// optional extra log file (the run directory's `workflow.log` is always
/// written).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Base tracing directive, e.g. `"info"` or `"debug"`.
    pub level: String,
    /// Per-module level overrides, e.g. `{ "rw_runtime" = "debug" }`.
    pub modules: HashMap<String, String>,
    pub format: LogFormat,
    /// Additional log file outside the run directory.
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            modules: HashMap::new(),
            format: LogFormat::Plain,
            file: None,
        }
    }
}
