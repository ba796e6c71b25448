//! Drover configuration: `.drover/config.toml` layered under environment
//! variables (`spec.md` §6). A missing or partial config file is never an
//! error — every field defaults — and an unparseable environment variable
//! falls back silently to the config-file (or built-in) value rather than
//! failing the run.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Fully-resolved Drover configuration: file defaults overridden by
/// environment variables.
#[derive(Clone, Debug, PartialEq)]
pub struct DroverConfig {
    /// Maximum number of worker threads the scheduler may run concurrently
    /// at start (`m_max` in the backpressure model is derived from this).
    pub workers: u32,
    /// Per-task deadline for the agent executor.
    pub task_timeout: Duration,
    /// Scheduler main-loop poll interval.
    pub poll_interval: Duration,
    /// Path to the agent binary to invoke (e.g. `claude`).
    pub agent_binary: PathBuf,
    /// Trunk branch name (default `"main"`).
    pub trunk_branch: String,
    /// Minimum warm workspaces the pool tries to maintain.
    pub pool_min: u32,
    /// Maximum total workspaces (warm + in-use) the pool may hold.
    pub pool_max: u32,
    /// Number of workspaces to warm up eagerly at pool start.
    pub pool_warmup: u32,
    /// Available-memory floor (bytes) below which the memory guard trips.
    pub mem_hard_threshold_bytes: u64,
    /// Per-worker RSS ceiling (bytes) above which that worker is killed.
    pub mem_worker_ceiling_bytes: u64,
    /// Base directory for `.drover/cache/`.
    pub cache_dir: PathBuf,
    /// Wall-time threshold above which an agent run is classified
    /// `slow-response` (default 10s).
    pub slow_threshold: Duration,
}

impl Default for DroverConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            task_timeout: Duration::from_secs(30 * 60),
            poll_interval: Duration::from_secs(2),
            agent_binary: PathBuf::from("claude"),
            trunk_branch: "main".to_owned(),
            pool_min: 2,
            pool_max: 8,
            pool_warmup: 2,
            mem_hard_threshold_bytes: 512 * 1024 * 1024,
            mem_worker_ceiling_bytes: 4 * 1024 * 1024 * 1024,
            cache_dir: PathBuf::from(".drover/cache"),
            slow_threshold: Duration::from_secs(10),
        }
    }
}

impl DroverConfig {
    /// Load `.drover/config.toml` under `project_root` (defaults if absent),
    /// then apply environment variable overrides.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] if the file exists but fails to parse.
    pub fn load(project_root: &Path) -> Result<Self, ConfigError> {
        let file = FileConfig::load(&project_root.join(".drover").join("config.toml"))?;
        Ok(file.into_config().with_env_overrides(|k| std::env::var(k).ok()))
    }

    /// Apply environment-variable overrides using an arbitrary lookup
    /// function. Production code always calls this via [`Self::load`] with
    /// `std::env::var`; tests pass a `HashMap` lookup instead, so overrides
    /// are exercised without mutating real process-global environment state.
    fn with_env_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(v) = env_u32(&lookup, "DROVER_WORKERS") {
            self.workers = v;
        }
        if let Some(v) = env_duration_secs(&lookup, "DROVER_TASK_TIMEOUT_SECS") {
            self.task_timeout = v;
        }
        if let Some(v) = env_duration_secs(&lookup, "DROVER_POLL_INTERVAL_SECS") {
            self.poll_interval = v;
        }
        if let Some(v) = lookup("DROVER_AGENT_BINARY").filter(|v| !v.is_empty()) {
            self.agent_binary = PathBuf::from(v);
        }
        if let Some(v) = lookup("DROVER_TRUNK_BRANCH").filter(|v| !v.is_empty()) {
            self.trunk_branch = v;
        }
        if let Some(v) = env_u32(&lookup, "DROVER_POOL_MIN") {
            self.pool_min = v;
        }
        if let Some(v) = env_u32(&lookup, "DROVER_POOL_MAX") {
            self.pool_max = v;
        }
        if let Some(v) = env_u32(&lookup, "DROVER_POOL_WARMUP") {
            self.pool_warmup = v;
        }
        if let Some(v) = env_u64(&lookup, "DROVER_MEM_HARD_THRESHOLD_BYTES") {
            self.mem_hard_threshold_bytes = v;
        }
        if let Some(v) = env_u64(&lookup, "DROVER_MEM_WORKER_CEILING_BYTES") {
            self.mem_worker_ceiling_bytes = v;
        }
        if let Some(v) = lookup("DROVER_CACHE_DIR").filter(|v| !v.is_empty()) {
            self.cache_dir = PathBuf::from(v);
        }
        if let Some(v) = env_duration_secs(&lookup, "DROVER_SLOW_THRESHOLD_SECS") {
            self.slow_threshold = v;
        }
        self
    }
}

/// Parse an environment variable as `u32`, falling back to `None` (i.e. the
/// existing default) on missing or unparseable values — per `spec.md` §6,
/// "unknown values fall back to defaults."
fn env_u32(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<u32> {
    lookup(key)?.parse().ok()
}

fn env_u64(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<u64> {
    lookup(key)?.parse().ok()
}

fn env_duration_secs(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<Duration> {
    lookup(key)?.parse().ok().map(Duration::from_secs)
}

// ---------------------------------------------------------------------------
// FileConfig — the on-disk `.drover/config.toml` shape
// ---------------------------------------------------------------------------

/// On-disk shape of `.drover/config.toml`. Every field is optional; a
/// missing file parses to all-`None` and `into_config()` then applies
/// [`DroverConfig::default`] for anything unset.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    #[serde(default)]
    scheduler: SchedulerSection,
    #[serde(default)]
    pool: PoolSection,
    #[serde(default)]
    memory: MemorySection,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
struct SchedulerSection {
    workers: Option<u32>,
    task_timeout_secs: Option<u64>,
    poll_interval_secs: Option<u64>,
    agent_binary: Option<PathBuf>,
    trunk_branch: Option<String>,
    slow_threshold_secs: Option<u64>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
struct PoolSection {
    min: Option<u32>,
    max: Option<u32>,
    warmup: Option<u32>,
    cache_dir: Option<PathBuf>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
struct MemorySection {
    hard_threshold_bytes: Option<u64>,
    worker_ceiling_bytes: Option<u64>,
}

impl FileConfig {
    fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(ConfigError {
                    path: Some(path.to_owned()),
                    message: format!("could not read file: {e}"),
                });
            }
        };
        Self::parse(&contents).map_err(|mut e| {
            e.path = Some(path.to_owned());
            e
        })
    }

    fn parse(toml_str: &str) -> Result<Self, ConfigError> {
        toml::from_str(toml_str).map_err(|e| {
            let mut message = e.message().to_owned();
            if let Some(span) = e.span() {
                let line = toml_str[..span.start].chars().filter(|&c| c == '\n').count() + 1;
                message = format!("line {line}: {message}");
            }
            ConfigError {
                path: None,
                message,
            }
        })
    }

    fn into_config(self) -> DroverConfig {
        let d = DroverConfig::default();
        DroverConfig {
            workers: self.scheduler.workers.unwrap_or(d.workers),
            task_timeout: self
                .scheduler
                .task_timeout_secs
                .map_or(d.task_timeout, Duration::from_secs),
            poll_interval: self
                .scheduler
                .poll_interval_secs
                .map_or(d.poll_interval, Duration::from_secs),
            agent_binary: self.scheduler.agent_binary.unwrap_or(d.agent_binary),
            trunk_branch: self.scheduler.trunk_branch.unwrap_or(d.trunk_branch),
            pool_min: self.pool.min.unwrap_or(d.pool_min),
            pool_max: self.pool.max.unwrap_or(d.pool_max),
            pool_warmup: self.pool.warmup.unwrap_or(d.pool_warmup),
            mem_hard_threshold_bytes: self
                .memory
                .hard_threshold_bytes
                .unwrap_or(d.mem_hard_threshold_bytes),
            mem_worker_ceiling_bytes: self
                .memory
                .worker_ceiling_bytes
                .unwrap_or(d.mem_worker_ceiling_bytes),
            cache_dir: self.pool.cache_dir.unwrap_or(d.cache_dir),
            slow_threshold: self
                .scheduler
                .slow_threshold_secs
                .map_or(d.slow_threshold, Duration::from_secs),
        }
    }
}

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

/// Error loading/parsing `.drover/config.toml`.
#[derive(Debug)]
pub struct ConfigError {
    /// The path that was being loaded, if known.
    pub path: Option<PathBuf>,
    /// Human-readable message, with line-level detail when available.
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(p) = &self.path {
            write!(f, "{}: {}", p.display(), self.message)
        } else {
            write!(f, "config error: {}", self.message)
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<ConfigError> for crate::error::DroverError {
    fn from(err: ConfigError) -> Self {
        Self::ConfigError {
            path: err.path.unwrap_or_default(),
            detail: err.message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn missing_file_returns_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = DroverConfig::load(dir.path()).unwrap();
        assert_eq!(cfg.workers, DroverConfig::default().workers);
        assert_eq!(cfg.trunk_branch, "main");
    }

    #[test]
    fn file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".drover")).unwrap();
        std::fs::write(
            dir.path().join(".drover/config.toml"),
            "[scheduler]\nworkers = 7\ntrunk_branch = \"trunk\"\n",
        )
        .unwrap();
        let cfg = DroverConfig::load(dir.path()).unwrap();
        assert_eq!(cfg.workers, 7);
        assert_eq!(cfg.trunk_branch, "trunk");
    }

    #[test]
    fn unknown_field_is_an_error() {
        let err = FileConfig::parse("[scheduler]\nbogus = 1\n").unwrap_err();
        assert!(err.message.contains("bogus") || err.message.contains("unknown"));
    }

    #[test]
    fn env_override_wins_over_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".drover")).unwrap();
        std::fs::write(
            dir.path().join(".drover/config.toml"),
            "[scheduler]\nworkers = 7\n",
        )
        .unwrap();
        let file = FileConfig::load(&dir.path().join(".drover").join("config.toml")).unwrap();
        let env: HashMap<&str, &str> = HashMap::from([("DROVER_WORKERS", "11")]);
        let cfg = file
            .into_config()
            .with_env_overrides(|k| env.get(k).map(|v| (*v).to_owned()));
        assert_eq!(cfg.workers, 11);
    }

    #[test]
    fn unparseable_env_falls_back_to_default() {
        let env: HashMap<&str, &str> = HashMap::from([("DROVER_POOL_MIN", "not-a-number")]);
        let cfg = DroverConfig::default()
            .with_env_overrides(|k| env.get(k).map(|v| (*v).to_owned()));
        assert_eq!(cfg.pool_min, DroverConfig::default().pool_min);
    }
}
