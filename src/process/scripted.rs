// ABOUTME: Scripted ProcessRunner for tests: replays canned output and exit codes
// ABOUTME: Records every invocation so tests can assert on arguments and ordering

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};

use super::{Invocation, ProcessExit, ProcessHandle, ProcessRunner};
use crate::error::{EngineError, Result};

/// Canned behaviour for one spawned process.
#[derive(Debug, Clone)]
pub struct Script {
    stdout: Vec<String>,
    stderr: Vec<String>,
    exit: i32,
    /// Content written to the path following `-f`, as pg_dump would.
    output_file: Option<String>,
    /// Emit output, then stay alive until killed.
    hang: bool,
    /// Exit as if killed by an outside signal.
    signaled: bool,
    not_found: bool,
}

impl Default for Script {
    fn default() -> Self {
        Self::success()
    }
}

impl Script {
    pub fn success() -> Self {
        Self {
            stdout: Vec::new(),
            stderr: Vec::new(),
            exit: 0,
            output_file: None,
            hang: false,
            signaled: false,
            not_found: false,
        }
    }

    pub fn failure(exit: i32, stderr: &str) -> Self {
        Self::success().exit(exit).stderr(stderr)
    }

    /// Behaves like a tool missing from disk.
    pub fn not_found() -> Self {
        Self {
            not_found: true,
            ..Self::success()
        }
    }

    pub fn stdout(mut self, text: &str) -> Self {
        self.stdout.extend(text.lines().map(str::to_string));
        self
    }

    pub fn stderr(mut self, text: &str) -> Self {
        self.stderr.extend(text.lines().map(str::to_string));
        self
    }

    pub fn exit(mut self, code: i32) -> Self {
        self.exit = code;
        self
    }

    pub fn writes_file(mut self, content: &str) -> Self {
        self.output_file = Some(content.to_string());
        self
    }

    pub fn hang(mut self) -> Self {
        self.hang = true;
        self
    }

    pub fn signaled(mut self) -> Self {
        self.signaled = true;
        self
    }
}

#[derive(Default)]
struct ScriptState {
    queues: HashMap<String, VecDeque<Script>>,
    defaults: HashMap<String, Script>,
    invocations: Vec<Invocation>,
}

/// Runner whose processes follow queued [`Script`]s, per tool name. A tool
/// with an empty queue falls back to its default script, or plain success.
#[derive(Clone, Default)]
pub struct ScriptedRunner {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a script for the next call of `tool`.
    pub fn push(&self, tool: &str, script: Script) -> &Self {
        let mut state = self.lock();
        state
            .queues
            .entry(tool.to_string())
            .or_default()
            .push_back(script);
        drop(state);
        self
    }

    /// Script used for every call of `tool` once its queue is empty.
    pub fn set_default(&self, tool: &str, script: Script) -> &Self {
        self.lock().defaults.insert(tool.to_string(), script);
        self
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.lock().invocations.clone()
    }

    pub fn invocations_of(&self, tool: &str) -> Vec<Invocation> {
        self.lock()
            .invocations
            .iter()
            .filter(|inv| inv.tool == tool)
            .cloned()
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScriptState> {
        // A panicking test thread must not hide the invocations from the rest.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next_script(&self, invocation: &Invocation) -> Script {
        let mut state = self.lock();
        state.invocations.push(invocation.clone());
        if let Some(script) = state
            .queues
            .get_mut(&invocation.tool)
            .and_then(VecDeque::pop_front)
        {
            return script;
        }
        state
            .defaults
            .get(&invocation.tool)
            .cloned()
            .unwrap_or_default()
    }
}

impl ProcessRunner for ScriptedRunner {
    fn spawn(&self, invocation: &Invocation) -> Result<ProcessHandle> {
        let script = self.next_script(invocation);

        if script.not_found {
            return Err(EngineError::tool_not_found(&invocation.tool));
        }

        if let (Some(content), Some(path)) = (&script.output_file, invocation.arg_value("-f")) {
            std::fs::write(path, content).map_err(|e| EngineError::SpawnFailed {
                tool: invocation.tool.clone(),
                reason: e.to_string(),
            })?;
        }

        let (stdout_tx, stdout_rx) = mpsc::unbounded_channel();
        let (stderr_tx, stderr_rx) = mpsc::unbounded_channel();
        for line in script.stdout {
            let _ = stdout_tx.send(line);
        }
        for line in script.stderr {
            let _ = stderr_tx.send(line);
        }

        let (exit_tx, exit_rx) = oneshot::channel();
        let (kill_tx, kill_rx) = oneshot::channel();

        if script.hang {
            tokio::spawn(async move {
                let _ = kill_rx.await;
                drop(stdout_tx);
                drop(stderr_tx);
                let _ = exit_tx.send(ProcessExit::Terminated);
            });
        } else {
            drop(stdout_tx);
            drop(stderr_tx);
            let exit = if script.signaled {
                ProcessExit::Signaled
            } else {
                ProcessExit::Exited(script.exit)
            };
            let _ = exit_tx.send(exit);
        }

        Ok(ProcessHandle::new(stdout_rx, stderr_rx, exit_rx, kill_tx))
    }
}
