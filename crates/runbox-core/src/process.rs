//! Local process runner with wall-clock timeout enforcement
//!
//! The child is started in its own process group so the whole tree it spawns
//! can be killed at once when the timeout fires. Its stdout and stderr are
//! redirected straight into append-only files, which means every byte is on
//! disk by the time the child has been reaped and `run` returns.

use crate::errors::RunError;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};

pub const STDOUT_FILE: &str = "stdout";
pub const STDERR_FILE: &str = "stderr";

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessOutcome {
    /// `None` when the process was killed on timeout.
    pub exit_code: Option<i32>,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

impl ProcessOutcome {
    pub fn timed_out(&self) -> bool {
        self.exit_code.is_none()
    }
}

pub struct ProcessRunner;

impl ProcessRunner {
    /// Runs `command` with `argv`, writing its streams to `<sink_dir>/stdout`
    /// and `<sink_dir>/stderr`. A timeout is not an error: the outcome simply
    /// carries no exit code.
    pub async fn run(
        command: &str,
        argv: &[String],
        cwd: Option<&Path>,
        timeout: Duration,
        sink_dir: &Path,
    ) -> Result<ProcessOutcome, RunError> {
        let stdout_path = sink_dir.join(STDOUT_FILE);
        let stderr_path = sink_dir.join(STDERR_FILE);

        let mut cmd = Command::new(command);
        cmd.args(argv)
            .stdin(Stdio::null())
            .stdout(open_sink(&stdout_path).await?)
            .stderr(open_sink(&stderr_path).await?)
            .kill_on_drop(true);
        if let Some(cwd) = cwd {
            cmd.current_dir(cwd);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| RunError::Spawn {
            command: command.to_string(),
            source,
        })?;
        log::debug!("Spawned '{}' (pid {:?})", command, child.id());

        let exit_code = tokio::select! {
            status = child.wait() => Some(exit_code_of(status?)),
            _ = tokio::time::sleep(timeout) => {
                log::warn!(
                    "Process '{}' exceeded its {}ms allowance, killing process tree",
                    command,
                    timeout.as_millis()
                );
                kill_process_tree(&mut child)?;
                child.start_kill().ok();
                child.wait().await?;
                None
            }
        };

        Ok(ProcessOutcome {
            exit_code,
            stdout: stdout_path,
            stderr: stderr_path,
        })
    }
}

async fn open_sink(path: &Path) -> Result<Stdio, RunError> {
    let file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    Ok(Stdio::from(file.into_std().await))
}

#[cfg(unix)]
fn exit_code_of(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code_of(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

#[cfg(unix)]
fn kill_process_tree(child: &mut Child) -> std::io::Result<()> {
    use std::io::ErrorKind;

    let Some(pid) = child.id() else {
        return Ok(());
    };
    let pgid = unsafe { libc::getpgid(pid as libc::pid_t) };
    if pgid == -1 {
        let err = std::io::Error::last_os_error();
        if err.kind() != ErrorKind::NotFound {
            return Err(err);
        }
        return Ok(());
    }

    if unsafe { libc::killpg(pgid, libc::SIGKILL) } == -1 {
        let err = std::io::Error::last_os_error();
        if err.kind() != ErrorKind::NotFound {
            return Err(err);
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn kill_process_tree(_child: &mut Child) -> std::io::Result<()> {
    Ok(())
}
