// ABOUTME: ProcessRunner backed by tokio::process
// ABOUTME: Drains both pipes on their own tasks and kills whole process trees on cancel

use std::io;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::{Invocation, ProcessExit, ProcessHandle, ProcessRunner};
use crate::error::{EngineError, Result};

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x08000000;

#[derive(Debug, Clone, Default)]
pub struct TokioProcessRunner;

impl TokioProcessRunner {
    pub fn new() -> Self {
        Self
    }
}

impl ProcessRunner for TokioProcessRunner {
    fn spawn(&self, invocation: &Invocation) -> Result<ProcessHandle> {
        debug!(tool = %invocation.tool, args = ?invocation.args, "Spawning process");

        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .envs(invocation.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &invocation.current_dir {
            cmd.current_dir(dir);
        }

        // Own process group so a cancel reaches every descendant.
        #[cfg(unix)]
        cmd.process_group(0);

        #[cfg(windows)]
        cmd.creation_flags(CREATE_NO_WINDOW);

        let mut child = cmd
            .spawn()
            .map_err(|e| spawn_error(&invocation.tool, e))?;

        let (stdout_tx, stdout_rx) = mpsc::unbounded_channel();
        let (stderr_tx, stderr_rx) = mpsc::unbounded_channel();
        let stdout_task = child.stdout.take().map(|pipe| tokio::spawn(drain(pipe, stdout_tx)));
        let stderr_task = child.stderr.take().map(|pipe| tokio::spawn(drain(pipe, stderr_tx)));

        let (exit_tx, exit_rx) = oneshot::channel();
        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();
        let tool = invocation.tool.clone();

        tokio::spawn(async move {
            let pid = child.id();
            let outcome = tokio::select! {
                status = child.wait() => match status {
                    Ok(status) => match status.code() {
                        Some(code) => ProcessExit::Exited(code),
                        None => ProcessExit::Signaled,
                    },
                    Err(e) => {
                        warn!(tool = %tool, error = %e, "Failed to wait for process");
                        ProcessExit::Signaled
                    }
                },
                _ = &mut kill_rx => {
                    debug!(tool = %tool, pid = ?pid, "Killing process tree");
                    kill_tree(pid).await;
                    let _ = child.kill().await;
                    ProcessExit::Terminated
                }
            };

            for task in [stdout_task, stderr_task].into_iter().flatten() {
                let _ = task.await;
            }
            let _ = exit_tx.send(outcome);
        });

        Ok(ProcessHandle::new(stdout_rx, stderr_rx, exit_rx, kill_tx))
    }
}

fn spawn_error(tool: &str, err: io::Error) -> EngineError {
    match err.kind() {
        io::ErrorKind::NotFound => EngineError::tool_not_found(tool),
        _ => EngineError::SpawnFailed {
            tool: tool.to_string(),
            reason: err.to_string(),
        },
    }
}

/// Reads the pipe to EOF even after the receiver is gone, so the child never
/// blocks on a full pipe. Invalid UTF-8 is replaced rather than ending the read.
async fn drain<R>(pipe: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(pipe);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']).to_string();
                let _ = tx.send(line);
            }
            Err(e) => {
                warn!(error = %e, "Failed to read process output");
                break;
            }
        }
    }
}

#[cfg(unix)]
async fn kill_tree(pid: Option<u32>) {
    let Some(pid) = pid else { return };
    let status = Command::new("kill")
        .args(["-KILL", "--", &format!("-{}", pid)])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    if let Err(e) = status {
        warn!(pid, error = %e, "Failed to signal process group");
    }
}

#[cfg(windows)]
async fn kill_tree(pid: Option<u32>) {
    let Some(pid) = pid else { return };
    let status = Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .creation_flags(CREATE_NO_WINDOW)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    if let Err(e) = status {
        warn!(pid, error = %e, "Failed to kill process tree");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sh(script: &str) -> Invocation {
        Invocation::new("sh", "sh").args(["-c", script])
    }

    #[tokio::test]
    async fn test_split_streams_and_exit_code() {
        let runner = TokioProcessRunner::new();
        let handle = runner
            .spawn(&sh("echo one; echo two >&2; echo three; exit 3"))
            .unwrap();
        let output = handle.collect().await;

        assert_eq!(output.stdout, vec!["one", "three"]);
        assert_eq!(output.stderr, vec!["two"]);
        assert_eq!(output.exit, ProcessExit::Exited(3));
    }

    #[tokio::test]
    async fn test_missing_program_is_tool_not_found() {
        let runner = TokioProcessRunner::new();
        let err = runner
            .spawn(&Invocation::new("pg_dump", "/nonexistent/bin/pg_dump"))
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::ToolNotFound { ref tool } if tool == "pg_dump"));
    }

    #[tokio::test]
    async fn test_env_is_passed() {
        let runner = TokioProcessRunner::new();
        let inv = sh("printf '%s\\n' \"$PGSSLMODE\"")
            .envs(vec![("PGSSLMODE".to_string(), "require".to_string())]);
        let output = runner.spawn(&inv).unwrap().collect().await;
        assert_eq!(output.stdout, vec!["require"]);
    }

    #[tokio::test]
    async fn test_kill_terminates_descendants() {
        let runner = TokioProcessRunner::new();
        let mut handle = runner.spawn(&sh("echo started; sleep 30 & wait")).unwrap();

        let first = handle.next_line().await.unwrap();
        assert_eq!(first.text(), "started");

        handle.kill();
        let exit = tokio::time::timeout(Duration::from_secs(10), async {
            while handle.next_line().await.is_some() {}
            handle.wait().await
        })
        .await
        .expect("killed process should exit promptly");
        assert_eq!(exit, ProcessExit::Terminated);
    }

    #[tokio::test]
    async fn test_output_flushed_before_exit() {
        let runner = TokioProcessRunner::new();
        let handle = runner
            .spawn(&sh("i=0; while [ $i -lt 500 ]; do echo line$i; i=$((i+1)); done"))
            .unwrap();
        let output = handle.collect().await;
        assert_eq!(output.stdout.len(), 500);
        assert_eq!(output.stdout[499], "line499");
        assert!(output.exit.success());
    }
}
