//! A [`Nail`] that runs each request as a child process of the server.

use std::process::Stdio;

use async_trait::async_trait;
use nailgun::{Nail, NailgunError, Request, Session};
use process_execution::local::exit_code;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::process::Command;

/// Exit code reported when the command cannot be started, as a shell would.
pub const COMMAND_NOT_FOUND: i32 = 127;

const READ_BUF_SIZE: usize = 8 * 1024;

/// Runs `request.command` with the client's arguments, environment and
/// working directory, relaying stdin, stdout and stderr.
#[derive(Clone, Copy, Debug, Default)]
pub struct SubprocessNail;

#[async_trait]
impl Nail for SubprocessNail {
    async fn run(&self, request: Request, session: &mut Session) -> Result<i32, NailgunError> {
        let input = session.read_all_stdin().await?;

        let mut command = Command::new(&request.command);
        command
            .args(&request.args)
            .env_clear()
            .envs(&request.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if !request.working_dir.as_os_str().is_empty() {
            command.current_dir(&request.working_dir);
        }
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::debug!(command = %request.command, error = %e, "failed to spawn");
                session
                    .write_stderr(format!("failed to execute {}: {e}\n", request.command).as_bytes())
                    .await?;
                return Ok(COMMAND_NOT_FOUND);
            }
        };

        // Fed from its own task so a child that writes before reading cannot
        // deadlock against us.
        let feeder = child.stdin.take().map(|mut stdin| {
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&input).await {
                    tracing::debug!(error = %e, "child closed stdin early");
                }
            })
        });

        let (Some(mut stdout), Some(mut stderr)) = (child.stdout.take(), child.stderr.take())
        else {
            return Err(NailgunError::Protocol("child output was not piped".to_owned()));
        };
        let mut out_buf = vec![0u8; READ_BUF_SIZE];
        let mut err_buf = vec![0u8; READ_BUF_SIZE];
        let (mut out_done, mut err_done) = (false, false);
        while !(out_done && err_done) {
            tokio::select! {
                n = stdout.read(&mut out_buf), if !out_done => {
                    let n = n?;
                    if n == 0 {
                        out_done = true;
                    } else {
                        session.write_stdout(&out_buf[..n]).await?;
                    }
                }
                n = stderr.read(&mut err_buf), if !err_done => {
                    let n = n?;
                    if n == 0 {
                        err_done = true;
                    } else {
                        session.write_stderr(&err_buf[..n]).await?;
                    }
                }
            }
        }

        if let Some(feeder) = feeder {
            let _ = feeder.await;
        }
        let status = child.wait().await?;
        Ok(exit_code(status))
    }
}
