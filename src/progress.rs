// ABOUTME: Per-run progress and log broadcast with weighted stage percentages
// ABOUTME: One writer, any number of subscribers; log lines are never dropped or reordered

use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::models::{CloneOptions, CloneProgress, LogLevel, LogLine, Stage};

/// Relative share of the bar each optional or mandatory stage takes.
const STAGE_WEIGHTS: [(Stage, u32); 5] = [
    (Stage::Backup, 10),
    (Stage::Cleaning, 5),
    (Stage::Dumping, 40),
    (Stage::Restoring, 40),
    (Stage::Verifying, 5),
];

#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    Progress(CloneProgress),
    Log(LogLine),
}

/// The ordered list of stages one run will go through, with the percentage
/// band each occupies. Fixed once at `preparing`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagePlan {
    bands: Vec<(Stage, u8, u8)>,
}

impl StagePlan {
    pub fn new(weighted: &[(Stage, u32)]) -> Self {
        let total: u32 = weighted.iter().map(|(_, w)| *w).sum();
        let mut bands = Vec::with_capacity(weighted.len());
        let mut cumulative = 0u32;
        for (stage, weight) in weighted {
            let start = if total == 0 { 0 } else { cumulative * 100 / total };
            cumulative += weight;
            let end = if total == 0 { 100 } else { cumulative * 100 / total };
            bands.push((*stage, start as u8, end as u8));
        }
        Self { bands }
    }

    /// Backup and cleaning only appear when requested.
    pub fn for_clone(options: &CloneOptions) -> Self {
        let weighted: Vec<(Stage, u32)> = STAGE_WEIGHTS
            .iter()
            .copied()
            .filter(|(stage, _)| match stage {
                Stage::Backup => options.create_backup,
                Stage::Cleaning => options.clean_destination,
                _ => true,
            })
            .collect();
        Self::new(&weighted)
    }

    pub fn for_schema_export() -> Self {
        Self::new(&[(Stage::Dumping, 1)])
    }

    pub fn stages(&self) -> impl Iterator<Item = Stage> + '_ {
        self.bands.iter().map(|(stage, _, _)| *stage)
    }

    pub fn contains(&self, stage: Stage) -> bool {
        self.bands.iter().any(|(s, _, _)| *s == stage)
    }

    /// `(start, end)` percentage for `stage`.
    pub fn band(&self, stage: Stage) -> (u8, u8) {
        match stage {
            Stage::Preparing => (0, 0),
            Stage::Completed => (100, 100),
            _ => self
                .bands
                .iter()
                .find(|(s, _, _)| *s == stage)
                .map(|(_, start, end)| (*start, *end))
                .unwrap_or((0, 0)),
        }
    }

    /// Percentage for `fraction` (0.0..=1.0) of the way through `stage`.
    pub fn percent(&self, stage: Stage, fraction: f64) -> u8 {
        let (start, end) = self.band(stage);
        let fraction = fraction.clamp(0.0, 1.0);
        let span = f64::from(end - start);
        start + (span * fraction).floor() as u8
    }
}

struct Shared {
    subscribers: Vec<mpsc::UnboundedSender<RunEvent>>,
    latest: CloneProgress,
    logs: Vec<LogLine>,
    closed: bool,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

fn subscribe(shared: &Mutex<Shared>) -> EventStream {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut state = lock(shared);
    // Replay under the lock so nothing published concurrently slips between
    // the history and the live feed.
    for line in &state.logs {
        let _ = tx.send(RunEvent::Log(line.clone()));
    }
    let _ = tx.send(RunEvent::Progress(state.latest.clone()));
    if !state.closed {
        state.subscribers.push(tx);
    }
    EventStream { rx }
}

/// Writer side of a run's event feed. Not `Clone`: a run has exactly one writer.
pub struct ProgressReporter {
    shared: Arc<Mutex<Shared>>,
}

impl ProgressReporter {
    pub fn new(initial: CloneProgress) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                subscribers: Vec::new(),
                latest: initial,
                logs: Vec::new(),
                closed: false,
            })),
        }
    }

    /// Read-only handle that can hand out more subscriptions.
    pub fn feed(&self) -> ProgressFeed {
        ProgressFeed {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn subscribe(&self) -> EventStream {
        subscribe(&self.shared)
    }

    /// Publish a progress update. The percentage never goes backwards and
    /// nothing is accepted after a terminal stage.
    pub fn progress(&self, mut progress: CloneProgress) {
        let mut state = lock(&self.shared);
        if state.latest.stage.is_terminal() {
            debug!(stage = %progress.stage, "Ignoring progress after terminal stage");
            return;
        }
        progress.progress = progress.progress.max(state.latest.progress);
        if progress.stage == Stage::Completed {
            progress.progress = 100;
        }
        state.latest = progress.clone();
        broadcast(&mut state, RunEvent::Progress(progress));
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        let line = LogLine::new(level, message);
        match level {
            LogLevel::Warning | LogLevel::Error => warn!("{}", line.message),
            LogLevel::Info | LogLevel::Success => info!("{}", line.message),
        }
        let mut state = lock(&self.shared);
        state.logs.push(line.clone());
        broadcast(&mut state, RunEvent::Log(line));
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message);
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.log(LogLevel::Warning, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message);
    }

    pub fn success(&self, message: impl Into<String>) {
        self.log(LogLevel::Success, message);
    }

    /// Raw tool output, forwarded before any interpretation. Kept out of the
    /// tracing output at info level since dumps can be chatty.
    pub fn raw(&self, tool: &str, line: &str) {
        debug!(tool = %tool, "{}", line);
        let line = LogLine::new(LogLevel::Info, format!("{}> {}", tool, line));
        let mut state = lock(&self.shared);
        state.logs.push(line.clone());
        broadcast(&mut state, RunEvent::Log(line));
    }

    pub fn latest(&self) -> CloneProgress {
        lock(&self.shared).latest.clone()
    }

    pub fn logs(&self) -> Vec<LogLine> {
        lock(&self.shared).logs.clone()
    }

    /// End every subscriber's stream and hand back the full log.
    pub fn close(self) -> Vec<LogLine> {
        let mut state = lock(&self.shared);
        state.closed = true;
        state.subscribers.clear();
        state.logs.clone()
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        let mut state = lock(&self.shared);
        state.closed = true;
        state.subscribers.clear();
    }
}

fn broadcast(state: &mut Shared, event: RunEvent) {
    state
        .subscribers
        .retain(|tx| tx.send(event.clone()).is_ok());
}

/// Subscription-only view of a run's feed.
#[derive(Clone)]
pub struct ProgressFeed {
    shared: Arc<Mutex<Shared>>,
}

impl ProgressFeed {
    /// Late subscribers first receive every log line so far, then the
    /// latest progress, then live events.
    pub fn subscribe(&self) -> EventStream {
        subscribe(&self.shared)
    }

    pub fn latest(&self) -> CloneProgress {
        lock(&self.shared).latest.clone()
    }
}

/// A subscriber's ordered event stream. Ends when the run closes its reporter.
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<RunEvent>,
}

impl EventStream {
    pub async fn recv(&mut self) -> Option<RunEvent> {
        self.rx.recv().await
    }
}

impl Stream for EventStream {
    type Item = RunEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
