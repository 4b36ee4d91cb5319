//! Running build processes.
//!
//! A [`Process`] is a fully described, hermetic command: argv, environment,
//! an input tree (by digest), and the outputs to capture. Runners implement
//! [`CommandRunner`] and are stacked:
//!
//! ```text
//! cache::CommandRunner  ->  bounded::CommandRunner  ->  local::CommandRunner
//! ```
//!
//! The local runner executes in a fresh sandbox directory and captures
//! stdout, stderr and declared outputs into the [`store::Store`].

pub mod bounded;
pub mod cache;
pub mod local;
mod named_caches;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use fs::{FsError, RelativePath};
use hashing::{Digest, EMPTY_DIGEST};
use serde::{Deserialize, Serialize};
use store::StoreError;
use thiserror::Error;

pub use named_caches::{CacheDest, CacheName, NamedCaches};

// ---------------------------------------------------------------------------
// ProcessError
// ---------------------------------------------------------------------------

/// Errors from running a [`Process`].
///
/// A process that runs and exits non-zero is not an error; its exit code is
/// reported in the result.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("process has an empty argv")]
    EmptyArgv,

    /// The binary could not be started.
    #[error("Failed to execute: {argv}: {source}")]
    Spawn {
        /// The shell-rendered argv.
        argv: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unsupported platform: {0}")]
    UnsupportedPlatform(String),

    #[error("process requires platform {required} but this host is {current}")]
    PlatformMismatch { required: Platform, current: Platform },

    #[error("execution slots are closed")]
    SlotsClosed,

    #[error("invalid named cache name '{name}': {reason}")]
    InvalidCacheName { name: String, reason: &'static str },

    /// A cached result could not be decoded.
    #[error("malformed cached result {digest}: {detail}")]
    MalformedCachedResult { digest: Digest, detail: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Fs(#[from] FsError),

    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A spawned task panicked or was cancelled.
    #[error("{0}")]
    Join(String),
}

impl ProcessError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

// ---------------------------------------------------------------------------
// Platform
// ---------------------------------------------------------------------------

/// The OS and architecture a process ran on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    #[serde(rename = "linux_x86_64")]
    LinuxX8664,
    LinuxArm64,
    #[serde(rename = "macos_x86_64")]
    MacosX8664,
    MacosArm64,
}

impl Platform {
    /// The platform of this host.
    ///
    /// # Errors
    /// Returns a description of the host for unsupported combinations.
    pub fn current() -> Result<Self, String> {
        match (std::env::consts::OS, std::env::consts::ARCH) {
            ("linux", "x86_64") => Ok(Self::LinuxX8664),
            ("linux", "aarch64") => Ok(Self::LinuxArm64),
            ("macos", "x86_64") => Ok(Self::MacosX8664),
            ("macos", "aarch64") => Ok(Self::MacosArm64),
            (os, arch) => Err(format!("{os}-{arch}")),
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LinuxX8664 => "linux_x86_64",
            Self::LinuxArm64 => "linux_arm64",
            Self::MacosX8664 => "macos_x86_64",
            Self::MacosArm64 => "macos_arm64",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Process
// ---------------------------------------------------------------------------

/// When a result may be written to the action cache.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessCacheScope {
    /// Cache regardless of exit code.
    Always,
    /// Cache only zero exit codes.
    #[default]
    Successful,
    /// Never read or write the cache.
    Never,
}

/// A hermetic command to run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Process {
    pub argv: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Directory (relative to the sandbox root) to run in. Output paths are
    /// relative to it as well.
    pub working_directory: Option<RelativePath>,
    /// Digest of the tree materialized into the sandbox before running.
    pub input_files: Digest,
    pub output_files: BTreeSet<RelativePath>,
    pub output_directories: BTreeSet<RelativePath>,
    pub timeout: Option<Duration>,
    /// Human-readable label used in logs and timeout messages. Not part of
    /// the action digest.
    pub description: String,
    pub append_only_caches: BTreeMap<CacheName, CacheDest>,
    /// Linked into the sandbox as `.jdk`.
    pub jdk_home: Option<PathBuf>,
    /// Environment variable that receives the execution slot id when run
    /// under a [`bounded::CommandRunner`].
    pub execution_slot_variable: Option<String>,
    pub platform_constraint: Option<Platform>,
    pub cache_scope: ProcessCacheScope,
}

impl Process {
    /// A process with no inputs, outputs or environment.
    #[must_use]
    pub fn new(argv: Vec<String>) -> Self {
        Self {
            argv,
            env: BTreeMap::new(),
            working_directory: None,
            input_files: EMPTY_DIGEST,
            output_files: BTreeSet::new(),
            output_directories: BTreeSet::new(),
            timeout: None,
            description: String::new(),
            append_only_caches: BTreeMap::new(),
            jdk_home: None,
            execution_slot_variable: None,
            platform_constraint: None,
            cache_scope: ProcessCacheScope::default(),
        }
    }

    #[must_use]
    pub fn env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    #[must_use]
    pub fn output_files(mut self, output_files: BTreeSet<RelativePath>) -> Self {
        self.output_files = output_files;
        self
    }

    #[must_use]
    pub fn output_directories(mut self, output_directories: BTreeSet<RelativePath>) -> Self {
        self.output_directories = output_directories;
        self
    }

    #[must_use]
    pub fn append_only_caches(mut self, caches: BTreeMap<CacheName, CacheDest>) -> Self {
        self.append_only_caches = caches;
        self
    }

    #[must_use]
    pub fn input_files(mut self, digest: Digest) -> Self {
        self.input_files = digest;
        self
    }

    #[must_use]
    pub fn working_directory(mut self, dir: RelativePath) -> Self {
        self.working_directory = Some(dir);
        self
    }

    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    #[must_use]
    pub const fn cache_scope(mut self, scope: ProcessCacheScope) -> Self {
        self.cache_scope = scope;
        self
    }

    /// Every declared output path, files and directories together.
    #[must_use]
    pub fn output_paths(&self) -> BTreeSet<RelativePath> {
        self.output_files
            .iter()
            .chain(&self.output_directories)
            .cloned()
            .collect()
    }

    /// The digest identifying this process in the action cache.
    ///
    /// Computed over the canonical JSON encoding with the description
    /// cleared, so relabelling a process does not invalidate its cache entry.
    #[must_use]
    pub fn action_digest(&self) -> Digest {
        let keyed = Self {
            description: String::new(),
            ..self.clone()
        };
        // Every field serializes to JSON with string map keys.
        let bytes = serde_json::to_vec(&keyed).unwrap_or_default();
        Digest::of_bytes(&bytes)
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Where a result came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessResultSource {
    Ran,
    Cached,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessResultMetadata {
    /// Wall time spent running, when the process actually ran.
    pub total_elapsed: Option<Duration>,
    pub source: ProcessResultSource,
}

impl ProcessResultMetadata {
    #[must_use]
    pub const fn ran(elapsed: Duration) -> Self {
        Self {
            total_elapsed: Some(elapsed),
            source: ProcessResultSource::Ran,
        }
    }

    #[must_use]
    pub const fn cached() -> Self {
        Self {
            total_elapsed: None,
            source: ProcessResultSource::Cached,
        }
    }
}

/// The outcome of a process that ran (whatever its exit code).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FallibleProcessResultWithPlatform {
    pub stdout_digest: Digest,
    pub stderr_digest: Digest,
    /// The exit code, or the negated signal number if the process was killed.
    pub exit_code: i32,
    /// Digest of the tree of captured outputs.
    pub output_directory: Digest,
    pub platform: Platform,
    pub metadata: ProcessResultMetadata,
}

/// Per-request information threaded through runners.
#[derive(Clone, Debug, Default)]
pub struct Context {
    pub build_id: String,
}

impl Context {
    #[must_use]
    pub fn new(build_id: impl Into<String>) -> Self {
        Self {
            build_id: build_id.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// CommandRunner
// ---------------------------------------------------------------------------

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `process` to completion.
    ///
    /// # Errors
    /// Returns an error if the process could not be run at all. A non-zero
    /// exit is reported through
    /// [`FallibleProcessResultWithPlatform::exit_code`].
    async fn run(
        &self,
        context: Context,
        process: Process,
    ) -> Result<FallibleProcessResultWithPlatform, ProcessError>;
}

/// Render argv the way a POSIX shell would need it quoted.
#[must_use]
pub fn render_argv(argv: &[String]) -> String {
    argv.iter()
        .map(|arg| shell_quote(arg))
        .collect::<Vec<_>>()
        .join(" ")
}

pub(crate) fn shell_quote(s: &str) -> String {
    let plain = !s.is_empty()
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"-_./=:,+@%".contains(&b));
    if plain {
        s.to_owned()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}
