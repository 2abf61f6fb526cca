// ABOUTME: Boundary for running external PostgreSQL client tools
// ABOUTME: Exposes live stdout/stderr line streams and an exit future per child process

pub mod scripted;
mod tokio_runner;

use std::fmt;
use std::path::PathBuf;

use tokio::sync::{mpsc, oneshot};

use crate::error::Result;

pub use scripted::{Script, ScriptedRunner};
pub use tokio_runner::TokioProcessRunner;

/// One external program call: what to run, with which arguments and environment.
#[derive(Clone)]
pub struct Invocation {
    /// Short tool name used in errors and log lines, e.g. `pg_dump`.
    pub tool: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
    pub current_dir: Option<PathBuf>,
}

impl Invocation {
    pub fn new(tool: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        Self {
            tool: tool.into(),
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            current_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn envs(mut self, envs: Vec<(String, String)>) -> Self {
        self.envs.extend(envs);
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Value following `flag` in the argument list, e.g. the path after `-f`.
    pub fn arg_value(&self, flag: &str) -> Option<&str> {
        self.args
            .iter()
            .position(|a| a == flag)
            .and_then(|i| self.args.get(i + 1))
            .map(String::as_str)
    }

    pub fn has_arg(&self, arg: &str) -> bool {
        self.args.iter().any(|a| a == arg)
    }
}

impl fmt::Debug for Invocation {
    // Environment values carry PGPASSWORD; only the keys are shown.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let env_keys: Vec<&str> = self.envs.iter().map(|(k, _)| k.as_str()).collect();
        f.debug_struct("Invocation")
            .field("tool", &self.tool)
            .field("program", &self.program)
            .field("args", &self.args)
            .field("env", &env_keys)
            .field("current_dir", &self.current_dir)
            .finish()
    }
}

/// How a child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessExit {
    Exited(i32),
    /// Killed by a signal nobody in this process asked for.
    Signaled,
    /// Killed through [`ProcessHandle::kill`].
    Terminated,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        matches!(self, ProcessExit::Exited(0))
    }

    pub fn code(&self) -> Option<i32> {
        match self {
            ProcessExit::Exited(code) => Some(*code),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputLine {
    Stdout(String),
    Stderr(String),
}

impl OutputLine {
    pub fn text(&self) -> &str {
        match self {
            OutputLine::Stdout(line) | OutputLine::Stderr(line) => line,
        }
    }
}

/// A running child. Every line is delivered on `stdout`/`stderr` before the
/// exit future resolves. Dropping the handle kills the child.
pub struct ProcessHandle {
    pub stdout: mpsc::UnboundedReceiver<String>,
    pub stderr: mpsc::UnboundedReceiver<String>,
    exit: oneshot::Receiver<ProcessExit>,
    kill: Option<oneshot::Sender<()>>,
    stdout_done: bool,
    stderr_done: bool,
}

impl ProcessHandle {
    pub fn new(
        stdout: mpsc::UnboundedReceiver<String>,
        stderr: mpsc::UnboundedReceiver<String>,
        exit: oneshot::Receiver<ProcessExit>,
        kill: oneshot::Sender<()>,
    ) -> Self {
        Self {
            stdout,
            stderr,
            exit,
            kill: Some(kill),
            stdout_done: false,
            stderr_done: false,
        }
    }

    /// Terminate the child and all of its descendants. Idempotent.
    pub fn kill(&mut self) {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
    }

    /// Next line from either stream, in arrival order per stream.
    /// `None` once both streams are exhausted.
    pub async fn next_line(&mut self) -> Option<OutputLine> {
        loop {
            if self.stdout_done && self.stderr_done {
                return None;
            }
            tokio::select! {
                line = self.stdout.recv(), if !self.stdout_done => match line {
                    Some(line) => return Some(OutputLine::Stdout(line)),
                    None => self.stdout_done = true,
                },
                line = self.stderr.recv(), if !self.stderr_done => match line {
                    Some(line) => return Some(OutputLine::Stderr(line)),
                    None => self.stderr_done = true,
                },
            }
        }
    }

    /// Resolves once the child has exited and its output has been flushed.
    pub async fn wait(&mut self) -> ProcessExit {
        // A supervisor that vanished without reporting can only mean the
        // runtime tore it down.
        (&mut self.exit).await.unwrap_or(ProcessExit::Terminated)
    }

    /// Drain both streams to the end, then wait for the exit status.
    pub async fn collect(mut self) -> CollectedOutput {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        while let Some(line) = self.next_line().await {
            match line {
                OutputLine::Stdout(line) => stdout.push(line),
                OutputLine::Stderr(line) => stderr.push(line),
            }
        }
        let exit = self.wait().await;
        CollectedOutput {
            stdout,
            stderr,
            exit,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CollectedOutput {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    pub exit: ProcessExit,
}

/// Spawns external tools. The production implementation is
/// [`TokioProcessRunner`]; tests use [`ScriptedRunner`].
pub trait ProcessRunner: Send + Sync {
    /// Must be called from within a Tokio runtime. Never blocks on the child.
    fn spawn(&self, invocation: &Invocation) -> Result<ProcessHandle>;
}
