//! Runs processes on this machine, each in a fresh sandbox directory.
//!
//! A sandbox is a `process-execution*` directory under the runner's work
//! directory. The input tree is materialized into it, output parents are
//! created, named caches and the JDK are linked in, and the process runs
//! with a cleared environment. Whatever declared outputs exist afterwards
//! are captured, whatever the exit code.

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use fs::RelativePath;
use serde::{Deserialize, Serialize};
use store::Store;
use task_executor::Executor;
use tokio::io::{AsyncRead, AsyncReadExt as _};
use tokio::process::Child;
use tracing::Instrument as _;

use crate::named_caches::symlink;
use crate::{
    CacheDest, CacheName, Context, FallibleProcessResultWithPlatform, NamedCaches, Platform,
    Process, ProcessError, ProcessResultMetadata, render_argv, shell_quote,
};

/// Name of the reproduction script written into preserved sandboxes.
pub const RUN_SCRIPT_NAME: &str = "__run.sh";

/// When sandboxes are left on disk after a run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeepSandboxes {
    Always,
    #[default]
    Never,
    /// Keep when the process could not be run or exited non-zero.
    OnFailure,
}

impl KeepSandboxes {
    const fn keeps(self, failed: bool) -> bool {
        match self {
            Self::Always => true,
            Self::Never => false,
            Self::OnFailure => failed,
        }
    }
}

#[derive(Clone, Debug)]
pub struct CommandRunner {
    store: Store,
    executor: Executor,
    work_dir_base: PathBuf,
    named_caches: NamedCaches,
    keep_sandboxes: KeepSandboxes,
}

struct Outcome {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    exit_code: i32,
}

impl CommandRunner {
    #[must_use]
    pub fn new(
        store: Store,
        executor: Executor,
        work_dir_base: PathBuf,
        named_caches: NamedCaches,
        keep_sandboxes: KeepSandboxes,
    ) -> Self {
        Self {
            store,
            executor,
            work_dir_base,
            named_caches,
            keep_sandboxes,
        }
    }

    #[must_use]
    pub const fn store(&self) -> &Store {
        &self.store
    }

    #[must_use]
    pub fn work_dir_base(&self) -> &Path {
        &self.work_dir_base
    }

    async fn run_sandboxed(
        &self,
        process: Process,
    ) -> Result<FallibleProcessResultWithPlatform, ProcessError> {
        let platform = Platform::current().map_err(ProcessError::UnsupportedPlatform)?;
        match process.platform_constraint {
            Some(required) if required != platform => {
                return Err(ProcessError::PlatformMismatch {
                    required,
                    current: platform,
                });
            }
            _ => {}
        }
        if process.argv.is_empty() {
            return Err(ProcessError::EmptyArgv);
        }

        fs::safe_create_dir_all(&self.work_dir_base)
            .map_err(|e| ProcessError::io(&self.work_dir_base, e))?;
        let sandbox = tempfile::Builder::new()
            .prefix("process-execution")
            .tempdir_in(&self.work_dir_base)
            .map_err(|e| ProcessError::io(&self.work_dir_base, e))?
            .keep();

        let result = self.run_in_sandbox(&sandbox, &process, platform).await;

        let failed = !matches!(&result, Ok(r) if r.exit_code == 0);
        if self.keep_sandboxes.keeps(failed) {
            if let Err(e) = write_run_script(&sandbox, &process) {
                tracing::warn!(error = %e, "failed to write {RUN_SCRIPT_NAME}");
            }
            tracing::info!(
                sandbox = %sandbox.display(),
                "preserving local process execution sandbox"
            );
        } else {
            self.remove_sandbox(sandbox).await;
        }
        result
    }

    async fn run_in_sandbox(
        &self,
        sandbox: &Path,
        process: &Process,
        platform: Platform,
    ) -> Result<FallibleProcessResultWithPlatform, ProcessError> {
        let started = Instant::now();
        self.store
            .materialize_directory(sandbox.to_owned(), process.input_files)
            .await?;

        let workdir = process
            .working_directory
            .as_ref()
            .map_or_else(|| sandbox.to_owned(), |dir| sandbox.join(dir));
        let outputs = process.output_paths();
        let prepare = {
            let sandbox = sandbox.to_owned();
            let workdir = workdir.clone();
            let outputs = outputs.clone();
            let named_caches = self.named_caches.clone();
            let caches = process.append_only_caches.clone();
            let jdk_home = process.jdk_home.clone();
            move || {
                prepare_sandbox(
                    &sandbox,
                    &workdir,
                    &outputs,
                    &named_caches,
                    &caches,
                    jdk_home.as_deref(),
                )
            }
        };
        task_executor::join_blocking(self.executor.spawn_blocking(prepare))
            .await
            .map_err(ProcessError::Join)??;

        let outcome = self.spawn_and_wait(&workdir, process).await?;
        tracing::debug!(exit_code = outcome.exit_code, "local process finished");

        let stdout_digest = self
            .store
            .store_file_bytes(Bytes::from(outcome.stdout))
            .await?;
        let stderr_digest = self
            .store
            .store_file_bytes(Bytes::from(outcome.stderr))
            .await?;
        let output_directory = self.store.snapshot_of(workdir, outputs).await?;

        Ok(FallibleProcessResultWithPlatform {
            stdout_digest,
            stderr_digest,
            exit_code: outcome.exit_code,
            output_directory,
            platform,
            metadata: ProcessResultMetadata::ran(started.elapsed()),
        })
    }

    async fn spawn_and_wait(
        &self,
        workdir: &Path,
        process: &Process,
    ) -> Result<Outcome, ProcessError> {
        let rendered = render_argv(&process.argv);
        let program = resolve_program(&process.argv[0], &process.env).ok_or_else(|| {
            ProcessError::Spawn {
                argv: rendered.clone(),
                source: io::Error::new(
                    io::ErrorKind::NotFound,
                    "binary not found on the process PATH",
                ),
            }
        })?;

        let mut command = tokio::process::Command::new(program);
        command
            .args(&process.argv[1..])
            .env_clear()
            .envs(&process.env)
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so a timeout also reaches grandchildren.
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|source| ProcessError::Spawn {
            argv: rendered,
            source,
        })?;
        tracing::debug!(pid = ?child.id(), "spawned local process");

        let stdout = self.executor.spawn(read_to_end(child.stdout.take()));
        let stderr = self.executor.spawn(read_to_end(child.stderr.take()));

        let (status, timed_out) = match process.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(status) => (status, None),
                Err(_) => {
                    tracing::warn!(timeout = ?limit, "local process timed out; terminating");
                    terminate(&mut child);
                    (child.wait().await, Some(limit))
                }
            },
            None => (child.wait().await, None),
        };
        let status = status.map_err(|e| ProcessError::io(workdir, e))?;

        let mut stdout = task_executor::join_blocking(stdout)
            .await
            .map_err(ProcessError::Join)?
            .map_err(|e| ProcessError::io(workdir, e))?;
        let stderr = task_executor::join_blocking(stderr)
            .await
            .map_err(ProcessError::Join)?
            .map_err(|e| ProcessError::io(workdir, e))?;

        if let Some(limit) = timed_out {
            stdout.extend_from_slice(timeout_message(limit, &process.description).as_bytes());
        }
        Ok(Outcome {
            stdout,
            stderr,
            exit_code: exit_code(status),
        })
    }

    async fn remove_sandbox(&self, sandbox: PathBuf) {
        let shown = sandbox.display().to_string();
        let removal = self
            .executor
            .spawn_blocking(move || std::fs::remove_dir_all(&sandbox));
        match task_executor::join_blocking(removal).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(sandbox = %shown, error = %e, "failed to remove sandbox"),
            Err(e) => tracing::warn!(sandbox = %shown, error = %e, "sandbox removal task failed"),
        }
    }
}

#[async_trait]
impl crate::CommandRunner for CommandRunner {
    async fn run(
        &self,
        context: Context,
        process: Process,
    ) -> Result<FallibleProcessResultWithPlatform, ProcessError> {
        let span = tracing::info_span!(
            "local_process",
            description = %process.description,
            build_id = %context.build_id,
        );
        self.run_sandboxed(process).instrument(span).await
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn prepare_sandbox(
    sandbox: &Path,
    workdir: &Path,
    outputs: &BTreeSet<RelativePath>,
    named_caches: &NamedCaches,
    caches: &BTreeMap<CacheName, CacheDest>,
    jdk_home: Option<&Path>,
) -> Result<(), ProcessError> {
    fs::safe_create_dir_all(workdir).map_err(|e| ProcessError::io(workdir, e))?;
    // Only the parents: a process that declares an output directory is
    // expected to create it.
    for output in outputs {
        if let Some(parent) = output.parent() {
            let dir = workdir.join(parent);
            fs::safe_create_dir_all(&dir).map_err(|e| ProcessError::io(&dir, e))?;
        }
    }
    named_caches.link_into(sandbox, caches)?;
    if let Some(jdk_home) = jdk_home {
        symlink(jdk_home, &sandbox.join(".jdk"))?;
    }
    Ok(())
}

/// Find `program` the way `execvp` would, but only on the process's own
/// `PATH`: the parent environment never leaks into resolution.
fn resolve_program(program: &str, env: &BTreeMap<String, String>) -> Option<PathBuf> {
    if program.contains('/') {
        return Some(PathBuf::from(program));
    }
    env.get("PATH")?
        .split(':')
        .filter(|dir| !dir.is_empty())
        .map(|dir| Path::new(dir).join(program))
        .find(|candidate| is_executable_file(candidate))
}

#[cfg(unix)]
fn is_executable_file(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt as _;
    std::fs::metadata(path).is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable_file(path: &Path) -> bool {
    path.is_file()
}

async fn read_to_end<R: AsyncRead + Unpin>(reader: Option<R>) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut reader) = reader {
        reader.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}

#[cfg(unix)]
fn terminate(child: &mut Child) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    if let Err(e) = killpg(Pid::from_raw(pid), Signal::SIGTERM) {
        tracing::warn!(pid, error = %e, "failed to signal process group");
        let _ = child.start_kill();
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) {
    let _ = child.start_kill();
}

/// The exit code, or the negated signal number if the process was killed.
#[must_use]
pub fn exit_code(status: ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt as _;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }
    status.code().unwrap_or(-1)
}

fn timeout_message(limit: Duration, description: &str) -> String {
    format!("\n\nExceeded timeout of {limit:?} for local process execution, {description}")
}

/// Write a script that re-runs `process` from its sandbox.
fn write_run_script(sandbox: &Path, process: &Process) -> Result<(), ProcessError> {
    let workdir = process
        .working_directory
        .as_ref()
        .map_or_else(|| sandbox.to_owned(), |dir| sandbox.join(dir));

    let mut script = String::from("#!/usr/bin/env bash\n");
    for (key, value) in &process.env {
        script.push_str(&format!("export {key}={}\n", shell_quote(value)));
    }
    script.push_str(&format!("cd {}\n", shell_quote(&workdir.to_string_lossy())));
    script.push_str(&render_argv(&process.argv));
    script.push('\n');

    let path = sandbox.join(RUN_SCRIPT_NAME);
    std::fs::write(&path, script).map_err(|e| ProcessError::io(&path, e))?;
    make_executable(&path)
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<(), ProcessError> {
    use std::os::unix::fs::PermissionsExt as _;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .map_err(|e| ProcessError::io(path, e))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<(), ProcessError> {
    Ok(())
}
