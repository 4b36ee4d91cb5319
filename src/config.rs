//! Engine configuration (`engine.toml`).
//!
//! ```toml
//! [store]
//! path = ".engine/store"
//!
//! [remote]
//! store_concurrency_limit = 128
//! cache_concurrency_limit = 128
//! rpc_timeout_ms = 30000
//!
//! [local]
//! parallelism = 8
//! keep_sandboxes = "on_failure"
//! execution_slot_variable = "SLOT"
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use process_execution::local::KeepSandboxes;
use serde::Deserialize;
use store::RemoteOptions;

/// Top-level engine configuration. Missing file → all defaults.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub remote: RemoteConfig,

    #[serde(default)]
    pub local: LocalConfig,
}

// ---------------------------------------------------------------------------
// StoreConfig
// ---------------------------------------------------------------------------

/// Where the local content-addressed store lives.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    /// Store root (default: `.engine/store`).
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

fn default_store_path() -> PathBuf {
    PathBuf::from(".engine/store")
}

// ---------------------------------------------------------------------------
// RemoteConfig
// ---------------------------------------------------------------------------

/// Limits for remote store and action cache requests.
///
/// Requests over the limit wait for a slot; they are never rejected.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemoteConfig {
    #[serde(default = "default_concurrency_limit")]
    pub store_concurrency_limit: usize,

    #[serde(default = "default_concurrency_limit")]
    pub cache_concurrency_limit: usize,

    /// Per-request deadline, in milliseconds.
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            store_concurrency_limit: default_concurrency_limit(),
            cache_concurrency_limit: default_concurrency_limit(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
        }
    }
}

const fn default_concurrency_limit() -> usize {
    128
}

const fn default_rpc_timeout_ms() -> u64 {
    30_000
}

impl RemoteConfig {
    #[must_use]
    pub const fn store_options(&self) -> RemoteOptions {
        RemoteOptions {
            concurrency_limit: self.store_concurrency_limit,
            timeout: Duration::from_millis(self.rpc_timeout_ms),
        }
    }

    #[must_use]
    pub const fn cache_options(&self) -> RemoteOptions {
        RemoteOptions {
            concurrency_limit: self.cache_concurrency_limit,
            timeout: Duration::from_millis(self.rpc_timeout_ms),
        }
    }
}

// ---------------------------------------------------------------------------
// LocalConfig
// ---------------------------------------------------------------------------

/// Local process execution settings.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LocalConfig {
    /// How many processes may run at once (default: one per CPU).
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,

    /// Which sandboxes survive their process (`always`, `never`,
    /// `on_failure`).
    #[serde(default)]
    pub keep_sandboxes: KeepSandboxes,

    /// Where sandboxes are created (default: the system temp dir).
    #[serde(default = "std::env::temp_dir")]
    pub work_dir: PathBuf,

    /// Root of the append-only named caches.
    #[serde(default = "default_named_caches_dir")]
    pub named_caches_dir: PathBuf,

    /// Environment variable that receives each process's slot number.
    #[serde(default)]
    pub execution_slot_variable: Option<String>,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            keep_sandboxes: KeepSandboxes::default(),
            work_dir: std::env::temp_dir(),
            named_caches_dir: default_named_caches_dir(),
            execution_slot_variable: None,
        }
    }
}

fn default_parallelism() -> usize {
    std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
}

fn default_named_caches_dir() -> PathBuf {
    PathBuf::from(".engine/named_caches")
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Error loading an engine configuration file.
#[derive(Debug)]
pub struct ConfigError {
    /// The path that was being loaded (if available).
    pub path: Option<PathBuf>,
    /// Human-readable message with line-level detail when possible.
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

impl EngineConfig {
    /// Load configuration from a TOML file.
    ///
    /// - If the file does not exist, returns all defaults (not an error).
    /// - If the file exists but contains invalid TOML or unknown fields,
    ///   returns a [`ConfigError`] with line-level detail.
    ///
    /// # Errors
    /// Returns `ConfigError` on I/O errors (other than not-found) or parse errors.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
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

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    /// Returns `ConfigError` on invalid TOML, unknown fields, or a zero
    /// concurrency limit.
    pub fn parse(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| {
            let mut message = e.message().to_owned();
            if let Some(span) = e.span() {
                let line = toml_str[..span.start]
                    .chars()
                    .filter(|&c| c == '\n')
                    .count()
                    + 1;
                message = format!("line {line}: {message}");
            }
            ConfigError {
                path: None,
                message,
            }
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let limits = [
            ("remote.store_concurrency_limit", self.remote.store_concurrency_limit),
            ("remote.cache_concurrency_limit", self.remote.cache_concurrency_limit),
            ("local.parallelism", self.local.parallelism),
        ];
        for (key, value) in limits {
            if value == 0 {
                return Err(ConfigError {
                    path: None,
                    message: format!("{key} must be at least 1"),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_string_is_all_defaults() {
        let cfg = EngineConfig::parse("").unwrap();
        assert_eq!(cfg, EngineConfig::default());
        assert_eq!(cfg.store.path, PathBuf::from(".engine/store"));
        assert_eq!(cfg.remote.rpc_timeout_ms, 30_000);
        assert_eq!(cfg.local.keep_sandboxes, KeepSandboxes::Never);
        assert!(cfg.local.parallelism >= 1);
    }

    #[test]
    fn parse_all_sections() {
        let toml = r#"
[store]
path = "/var/cache/engine"

[remote]
store_concurrency_limit = 4
cache_concurrency_limit = 2
rpc_timeout_ms = 1500

[local]
parallelism = 3
keep_sandboxes = "on_failure"
work_dir = "/tmp/sandboxes"
named_caches_dir = "/tmp/caches"
execution_slot_variable = "SLOT"
"#;
        let cfg = EngineConfig::parse(toml).unwrap();
        assert_eq!(cfg.store.path, PathBuf::from("/var/cache/engine"));
        assert_eq!(
            cfg.remote.store_options(),
            RemoteOptions {
                concurrency_limit: 4,
                timeout: Duration::from_millis(1500),
            }
        );
        assert_eq!(cfg.remote.cache_options().concurrency_limit, 2);
        assert_eq!(cfg.local.parallelism, 3);
        assert_eq!(cfg.local.keep_sandboxes, KeepSandboxes::OnFailure);
        assert_eq!(cfg.local.work_dir, PathBuf::from("/tmp/sandboxes"));
        assert_eq!(cfg.local.named_caches_dir, PathBuf::from("/tmp/caches"));
        assert_eq!(cfg.local.execution_slot_variable.as_deref(), Some("SLOT"));
    }

    #[test]
    fn parse_rejects_unknown_field() {
        let err = EngineConfig::parse("[remote]\nconcurrency = 3\n").unwrap_err();
        assert!(
            err.message.contains("unknown field"),
            "error should mention unknown field: {}",
            err.message
        );
    }

    #[test]
    fn parse_rejects_unknown_keep_policy() {
        let err = EngineConfig::parse("[local]\nkeep_sandboxes = \"sometimes\"\n").unwrap_err();
        assert!(
            err.message.contains("unknown variant"),
            "error should mention unknown variant: {}",
            err.message
        );
    }

    #[test]
    fn parse_includes_line_number_on_error() {
        let toml = "[store]\npath = \"ok\"\n[remote]\nrpc_timeout_ms = \"soon\"\n";
        let err = EngineConfig::parse(toml).unwrap_err();
        assert!(
            err.message.starts_with("line 4"),
            "error should include line number: {}",
            err.message
        );
    }

    #[test]
    fn zero_limits_are_rejected() {
        let err = EngineConfig::parse("[local]\nparallelism = 0\n").unwrap_err();
        assert_eq!(err.message, "local.parallelism must be at least 1");
        let err = EngineConfig::parse("[remote]\nstore_concurrency_limit = 0\n").unwrap_err();
        assert!(err.message.contains("remote.store_concurrency_limit"));
    }

    #[test]
    fn load_missing_file_returns_defaults() {
        let cfg = EngineConfig::load(Path::new("/nonexistent/engine.toml")).unwrap();
        assert_eq!(cfg, EngineConfig::default());
    }

    #[test]
    fn load_invalid_file_shows_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        std::fs::write(&path, "not valid [[[toml").unwrap();
        let err = EngineConfig::load(&path).unwrap_err();
        assert_eq!(err.path.as_deref(), Some(path.as_path()));
        assert!(err.to_string().starts_with(&path.display().to_string()));
    }

    #[test]
    fn display_without_path() {
        let err = ConfigError {
            path: None,
            message: "bad".to_owned(),
        };
        assert_eq!(err.to_string(), "config error: bad");
    }
}
