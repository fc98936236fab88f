use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;

use crate::logging::LoggingConfig;
use crate::overlay;
use crate::types::{ByteSize, HumanDuration};

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Host resource budgets and failure policy for the scheduler.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// CPU budget for concurrently-running tasks; 0 means all host CPUs.
    pub cpu: u32,
    /// Memory budget; 0 bytes means all host memory.
    pub memory: ByteSize,
    /// Let running sibling tasks finish after a failure instead of
    /// cancelling them.
    pub fail_slow: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            cpu: 0,
            memory: ByteSize::from(0),
            fail_slow: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    DockerSwarm,
    Podman,
    Singularity,
    Udocker,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::DockerSwarm => "docker_swarm",
            BackendKind::Podman => "podman",
            BackendKind::Singularity => "singularity",
            BackendKind::Udocker => "udocker",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    pub backend: BackendKind,
    /// Image used when a task declares no `runtime.docker`.
    pub default_image: String,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        ContainerConfig {
            backend: BackendKind::DockerSwarm,
            default_image: "ubuntu:22.04".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    /// Copy input files into the work directory instead of read-only
    /// mounts.
    pub copy_input_files: bool,
    /// Template-injection guard: every interpolated command value must
    /// match. Empty disables the guard.
    pub placeholder_regex: String,
    /// Default retry count when a task declares no `runtime.maxRetries`.
    pub default_max_retries: u32,
    /// Grace period between cooperative termination and a hard kill.
    pub kill_grace: HumanDuration,
    /// Interval between container status polls.
    pub poll_interval: HumanDuration,
}

impl Default for TaskConfig {
    fn default() -> Self {
        TaskConfig {
            copy_input_files: false,
            placeholder_regex: String::new(),
            default_max_retries: 0,
            kill_grace: HumanDuration::from(std::time::Duration::from_secs(10)),
            poll_interval: HumanDuration::from(std::time::Duration::from_millis(500)),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CallCacheConfig {
    /// Read cached outputs when digests match.
    pub get: bool,
    /// Write outputs after successful calls.
    pub put: bool,
    pub dir: Option<PathBuf>,
}

impl Default for CallCacheConfig {
    fn default() -> Self {
        CallCacheConfig {
            get: false,
            put: false,
            dir: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct DownloadCacheConfig {
    pub enabled: bool,
    pub dir: Option<PathBuf>,
    /// URI glob patterns eligible for caching; empty allows all.
    pub allow: Vec<String>,
    pub deny: Vec<String>,
}

impl DownloadCacheConfig {
    /// Whether a URI may be served from / stored into the cache.
    pub fn uri_allowed(&self, uri: &str) -> bool {
        let matches = |patterns: &[String]| {
            patterns.iter().any(|p| {
                glob::Pattern::new(p)
                    .map(|pat| pat.matches(uri))
                    .unwrap_or(false)
            })
        };
        if matches(&self.deny) {
            return false;
        }
        self.allow.is_empty() || matches(&self.allow)
    }
}

// ---------------------------------------------------------------------------
// RunnerConfig (resolved, validated)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RunnerConfigRaw {
    scheduler: SchedulerConfig,
    container: ContainerConfig,
    task: TaskConfig,
    call_cache: CallCacheConfig,
    download_cache: DownloadCacheConfig,
    logging: LoggingConfig,
}

/// The full runner configuration. Priority of sources: command line >
/// `RUNWDL__SECTION__KEY` environment variables > first-found user config
/// file > built-in defaults.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub scheduler: SchedulerConfig,
    pub container: ContainerConfig,
    pub task: TaskConfig,
    pub call_cache: CallCacheConfig,
    pub download_cache: DownloadCacheConfig,
    pub logging: LoggingConfig,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        RunnerConfigRaw::default().resolve().expect("defaults are valid")
    }
}

impl RunnerConfig {
    /// Load the effective configuration: the first user config file found
    /// (or defaults), overlaid with `RUNWDL__*` environment variables.
    pub fn load() -> anyhow::Result<Self> {
        let file_toml = match overlay::find_user_config() {
            Some(path) => std::fs::read_to_string(&path)
                .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?,
            None => String::new(),
        };
        Self::from_toml_with_env(&file_toml, std::env::vars())
    }

    /// Read and parse one specific config file (no env overlay).
    pub fn load_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.as_ref().display()))?;
        content.parse()
    }

    /// Parse TOML text, then apply `RUNWDL__SECTION__KEY` overrides from
    /// the given environment.
    pub fn from_toml_with_env(
        toml_str: &str,
        env: impl Iterator<Item = (String, String)>,
    ) -> anyhow::Result<Self> {
        let mut table: toml::Table = toml::from_str(toml_str)?;
        overlay::apply_env(&mut table, env)?;
        let raw: RunnerConfigRaw = toml::Table::try_into(table)?;
        raw.resolve()
    }
}

impl FromStr for RunnerConfig {
    type Err = anyhow::Error;

    fn from_str(toml_str: &str) -> anyhow::Result<Self> {
        let raw: RunnerConfigRaw = toml::from_str(toml_str)?;
        raw.resolve()
    }
}

impl RunnerConfigRaw {
    fn resolve(self) -> anyhow::Result<RunnerConfig> {
        if !self.task.placeholder_regex.is_empty() {
            // Surface bad guard patterns at load time, not mid-run.
            regex::Regex::new(&self.task.placeholder_regex)
                .map_err(|e| anyhow::anyhow!("invalid placeholder_regex: {e}"))?;
        }
        if self.call_cache.get || self.call_cache.put {
            if self.call_cache.dir.is_none() {
                anyhow::bail!("call_cache requires `dir` when get/put is enabled");
            }
        }
        if self.download_cache.enabled && self.download_cache.dir.is_none() {
            anyhow::bail!("download_cache requires `dir` when enabled");
        }
        Ok(RunnerConfig {
            scheduler: self.scheduler,
            container: self.container,
            task: self.task,
            call_cache: self.call_cache,
            download_cache: self.download_cache,
            logging: self.logging,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const FULL_TOML: &str = r#"
[scheduler]
cpu = 8
memory = "16GB"
fail_slow = true

[container]
backend = "podman"
default_image = "debian:12"

[task]
copy_input_files = true
placeholder_regex = "^[\\w./-]*$"
default_max_retries = 2
kill_grace = "30s"

[call_cache]
get = true
put = true
dir = "/tmp/rw-cache"

[download_cache]
enabled = true
dir = "/tmp/rw-downloads"
deny = ["ftp://*"]

[logging]
level = "debug"
format = "json"
"#;

    #[test]
    fn load_full_toml() {
        let cfg: RunnerConfig = FULL_TOML.parse().unwrap();
        assert_eq!(cfg.scheduler.cpu, 8);
        assert_eq!(cfg.scheduler.memory.as_bytes(), 16_000_000_000);
        assert!(cfg.scheduler.fail_slow);
        assert_eq!(cfg.container.backend, BackendKind::Podman);
        assert_eq!(cfg.task.default_max_retries, 2);
        assert!(cfg.call_cache.get && cfg.call_cache.put);
        assert!(!cfg.download_cache.uri_allowed("ftp://x/y"));
        assert!(cfg.download_cache.uri_allowed("https://x/y"));
        assert_eq!(cfg.logging.format, crate::LogFormat::Json);
    }

    #[test]
    fn defaults_are_complete() {
        let cfg: RunnerConfig = "".parse().unwrap();
        assert_eq!(cfg.scheduler.cpu, 0);
        assert_eq!(cfg.container.backend, BackendKind::DockerSwarm);
        assert!(!cfg.call_cache.get);
    }

    #[test]
    fn cache_without_dir_rejected() {
        let toml = "[call_cache]\nget = true\n";
        assert!(toml.parse::<RunnerConfig>().is_err());
    }

    #[test]
    fn unknown_backend_rejected() {
        let toml = "[container]\nbackend = \"kubernetes\"\n";
        assert!(toml.parse::<RunnerConfig>().is_err());
    }

    #[test]
    fn env_overlay_wins_over_file() {
        let env = vec![
            ("RUNWDL__SCHEDULER__CPU".to_string(), "2".to_string()),
            (
                "RUNWDL__CONTAINER__DEFAULT_IMAGE".to_string(),
                "alpine:3".to_string(),
            ),
            ("HOME".to_string(), "/root".to_string()),
        ];
        let cfg =
            RunnerConfig::from_toml_with_env("[scheduler]\ncpu = 8\n", env.into_iter()).unwrap();
        assert_eq!(cfg.scheduler.cpu, 2);
        assert_eq!(cfg.container.default_image, "alpine:3");
    }

    #[test]
    fn env_overlay_accepts_json_values() {
        let env = vec![(
            "RUNWDL__DOWNLOAD_CACHE__DENY".to_string(),
            r#"["s3://*", "gs://*"]"#.to_string(),
        ),
        (
            "RUNWDL__DOWNLOAD_CACHE__ENABLED".to_string(),
            "true".to_string(),
        ),
        (
            "RUNWDL__DOWNLOAD_CACHE__DIR".to_string(),
            "/tmp/dl".to_string(),
        )];
        let cfg = RunnerConfig::from_toml_with_env("", env.into_iter()).unwrap();
        assert!(cfg.download_cache.enabled);
        assert_eq!(cfg.download_cache.deny.len(), 2);
    }

    #[test]
    fn bad_placeholder_regex_rejected_at_load() {
        let toml = "[task]\nplaceholder_regex = \"([a-z\"\n";
        assert!(toml.parse::<RunnerConfig>().is_err());
    }
}
