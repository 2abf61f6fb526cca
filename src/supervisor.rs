// ABOUTME: Runs one external tool for a pipeline stage and relays its output
// ABOUTME: Forwards every line to the reporter, ticks sub-progress, kills the child on cancel

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::cancel::CancelSignal;
use crate::error::{EngineError, Result};
use crate::models::{CloneProgress, Stage};
use crate::process::{Invocation, OutputLine, ProcessExit, ProcessRunner};
use crate::progress::{ProgressReporter, StagePlan};

/// Lines of stderr quoted in a failure message.
const STDERR_TAIL_LINES: usize = 15;

/// Turns matching output lines into within-stage progress when the number of
/// expected matches is known. Without an estimate the stage is indeterminate.
pub struct LineTicker {
    expected: Option<usize>,
    seen: usize,
    matches: fn(&str) -> bool,
    label: &'static str,
}

impl LineTicker {
    pub fn new(expected: Option<usize>, label: &'static str, matches: fn(&str) -> bool) -> Self {
        Self {
            expected,
            seen: 0,
            matches,
            label,
        }
    }

    /// Feeds one line; returns the new fraction if it advanced.
    fn observe(&mut self, line: &str) -> Option<f64> {
        let expected = self.expected.filter(|n| *n > 0)?;
        if !(self.matches)(line) {
            return None;
        }
        self.seen += 1;
        // Never claim the stage is done before the tool says so.
        Some((self.seen as f64 / expected as f64).min(0.99))
    }
}

/// What a finished tool left behind.
#[derive(Debug, Clone)]
pub struct ToolRun {
    pub tool: String,
    pub exit: ProcessExit,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    pub elapsed: Duration,
}

impl ToolRun {
    pub fn stderr_tail(&self) -> String {
        let skip = self.stderr.len().saturating_sub(STDERR_TAIL_LINES);
        self.stderr[skip..].join("\n")
    }

    pub fn failure(&self, stage: Stage) -> EngineError {
        EngineError::ProcessFailed {
            stage,
            tool: self.tool.clone(),
            exit_code: self.exit.code(),
            stderr_tail: self.stderr_tail(),
        }
    }

    pub fn ensure_success(self, stage: Stage) -> Result<Self> {
        if self.exit.success() {
            Ok(self)
        } else {
            Err(self.failure(stage))
        }
    }
}

pub struct Supervisor<'a> {
    pub runner: &'a dyn ProcessRunner,
    pub reporter: &'a ProgressReporter,
    pub plan: &'a StagePlan,
    pub cancel: &'a CancelSignal,
}

impl Supervisor<'_> {
    /// Spawn `invocation` and drive it to completion. Returns `Cancelled` if
    /// the run was cancelled while the tool was running.
    pub async fn run(
        &self,
        stage: Stage,
        invocation: &Invocation,
        mut ticker: Option<LineTicker>,
    ) -> Result<ToolRun> {
        if self.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let started = Instant::now();
        let mut handle = self.runner.spawn(invocation)?;
        let mut cancel = self.cancel.clone();
        let mut killed = false;
        let mut stdout = Vec::new();
        let mut stderr = VecDeque::new();

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled(), if !killed => {
                    debug!(tool = %invocation.tool, stage = %stage, "Cancelling running tool");
                    handle.kill();
                    killed = true;
                }
                line = handle.next_line() => {
                    let Some(line) = line else { break };
                    self.reporter.raw(&invocation.tool, line.text());
                    if let Some(fraction) = ticker.as_mut().and_then(|t| t.observe(line.text())) {
                        let label = ticker.as_ref().map(|t| t.label).unwrap_or_default();
                        self.reporter.progress(CloneProgress::new(
                            stage,
                            self.plan.percent(stage, fraction),
                            label,
                        ));
                    }
                    match line {
                        OutputLine::Stdout(line) => stdout.push(line),
                        OutputLine::Stderr(line) => stderr.push_back(line),
                    }
                }
            }
        }

        let exit = handle.wait().await;
        if killed || exit == ProcessExit::Terminated {
            return Err(EngineError::Cancelled);
        }

        let elapsed = started.elapsed();
        debug!(tool = %invocation.tool, stage = %stage, ?exit, ?elapsed, "Tool finished");
        Ok(ToolRun {
            tool: invocation.tool.clone(),
            exit,
            stdout,
            stderr: stderr.into(),
            elapsed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::cancel_pair;
    use crate::process::{Script, ScriptedRunner};
    use crate::progress::RunEvent;

    fn plan() -> StagePlan {
        StagePlan::new(&[(Stage::Dumping, 50), (Stage::Restoring, 50)])
    }

    #[tokio::test]
    async fn test_lines_forwarded_and_ticked() {
        let runner = ScriptedRunner::new();
        runner.push(
            "pg_dump",
            Script::success().stderr(
                "pg_dump: dumping contents of table \"public.a\"\n\
                 pg_dump: dumping contents of table \"public.b\"\n",
            ),
        );
        let reporter = ProgressReporter::new(CloneProgress::preparing());
        let mut events = reporter.subscribe();
        let plan = plan();
        let (_handle, signal) = cancel_pair();
        let supervisor = Supervisor {
            runner: &runner,
            reporter: &reporter,
            plan: &plan,
            cancel: &signal,
        };

        let ticker = LineTicker::new(Some(4), "Dumping source database...", |l| {
            l.contains("dumping contents of table")
        });
        let run = supervisor
            .run(Stage::Dumping, &Invocation::new("pg_dump", "pg_dump"), Some(ticker))
            .await
            .unwrap();
        assert_eq!(run.stderr.len(), 2);
        drop(reporter);

        let mut percents = Vec::new();
        let mut logs = 0;
        while let Some(event) = events.recv().await {
            match event {
                RunEvent::Progress(p) if p.stage == Stage::Dumping => percents.push(p.progress),
                RunEvent::Log(_) => logs += 1,
                _ => {}
            }
        }
        assert_eq!(logs, 2);
        assert_eq!(percents, vec![12, 25]);
    }

    #[tokio::test]
    async fn test_failure_carries_stderr_tail() {
        let runner = ScriptedRunner::new();
        runner.push("psql", Script::failure(3, "ERROR:  permission denied for schema public"));
        let reporter = ProgressReporter::new(CloneProgress::preparing());
        let plan = plan();
        let (_handle, signal) = cancel_pair();
        let supervisor = Supervisor {
            runner: &runner,
            reporter: &reporter,
            plan: &plan,
            cancel: &signal,
        };
        let err = supervisor
            .run(Stage::Restoring, &Invocation::new("psql", "psql"), None)
            .await
            .unwrap()
            .ensure_success(Stage::Restoring)
            .unwrap_err();
        match err {
            EngineError::ProcessFailed {
                stage,
                exit_code,
                stderr_tail,
                ..
            } => {
                assert_eq!(stage, Stage::Restoring);
                assert_eq!(exit_code, Some(3));
                assert!(stderr_tail.contains("permission denied"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_cancel_kills_running_tool() {
        let runner = ScriptedRunner::new();
        runner.push("pg_restore", Script::success().stderr("pg_restore: connecting").hang());
        let reporter = ProgressReporter::new(CloneProgress::preparing());
        let plan = plan();
        let (handle, signal) = cancel_pair();
        let supervisor = Supervisor {
            runner: &runner,
            reporter: &reporter,
            plan: &plan,
            cancel: &signal,
        };

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            handle.cancel();
        });
        let err = supervisor
            .run(Stage::Restoring, &Invocation::new("pg_restore", "pg_restore"), None)
            .await
            .unwrap_err();
        canceller.await.unwrap();
        assert!(err.is_cancelled());
        assert_eq!(reporter.logs().len(), 1);
    }

    #[test]
    fn test_ticker_without_estimate_is_indeterminate() {
        let mut ticker = LineTicker::new(None, "x", |_| true);
        assert_eq!(ticker.observe("anything"), None);
        let mut capped = LineTicker::new(Some(1), "x", |_| true);
        assert_eq!(capped.observe("a"), Some(0.99));
    }
}
