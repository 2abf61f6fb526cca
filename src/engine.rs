// ABOUTME: Entry point for callers: starts clone and schema-export runs, one at a time
// ABOUTME: Owns the shared collaborators and the run slot that enforces a single active operation

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::info;

use crate::cancel::{cancel_pair, CancelHandle};
use crate::catalog::CatalogReader;
use crate::clone::{CloneOrchestrator, CloneServices, ResolvedClone};
use crate::config::ProfileSource;
use crate::error::{EngineError, Result};
use crate::history::{HistoryRecorder, HistorySink};
use crate::models::{
    CloneHistoryEntry, CloneOptions, CloneProgress, ConnectionProfile, DatabaseInfo,
    DatabaseStructure, SchemaExportOptions, Stage,
};
use crate::process::ProcessRunner;
use crate::progress::{EventStream, ProgressFeed, ProgressReporter};
use crate::schema::SchemaExtractor;
use crate::tools::ToolPaths;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub backup_dir: PathBuf,
    /// `pg_restore -j`.
    pub parallel_jobs: usize,
    /// Tables whose exact row counts are compared after a data clone.
    pub verify_sample: usize,
}

pub struct Engine {
    profiles: Arc<dyn ProfileSource>,
    services: Arc<CloneServices>,
    history: HistoryRecorder,
    slot: Arc<Mutex<()>>,
}

/// Handle to a running clone.
pub struct CloneRun {
    run_id: String,
    events: Option<EventStream>,
    feed: ProgressFeed,
    cancel: CancelHandle,
    task: JoinHandle<CloneHistoryEntry>,
}

impl CloneRun {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// The stream opened when the run started: it holds every event from
    /// `preparing` on. Later calls get a replaying subscription.
    pub fn events(&mut self) -> EventStream {
        self.events.take().unwrap_or_else(|| self.feed.subscribe())
    }

    pub fn latest(&self) -> CloneProgress {
        self.feed.latest()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Wait for the terminal state; the entry has already been recorded.
    pub async fn wait(self) -> Result<CloneHistoryEntry> {
        self.task
            .await
            .map_err(|e| EngineError::Internal(format!("clone task failed: {}", e)))
    }
}

/// Handle to a running schema export.
pub struct SchemaExportRun {
    events: Option<EventStream>,
    feed: ProgressFeed,
    cancel: CancelHandle,
    task: JoinHandle<Result<String>>,
}

impl SchemaExportRun {
    pub fn events(&mut self) -> EventStream {
        self.events.take().unwrap_or_else(|| self.feed.subscribe())
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub async fn wait(self) -> Result<String> {
        self.task
            .await
            .map_err(|e| EngineError::Internal(format!("schema export task failed: {}", e)))?
    }
}

impl Engine {
    pub fn new(
        profiles: Arc<dyn ProfileSource>,
        tools: ToolPaths,
        runner: Arc<dyn ProcessRunner>,
        catalog: Arc<dyn CatalogReader>,
        history: Arc<dyn HistorySink>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            profiles,
            services: Arc::new(CloneServices {
                runner,
                catalog,
                tools,
                settings,
            }),
            history: HistoryRecorder::new(history),
            slot: Arc::new(Mutex::new(())),
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.services.settings
    }

    pub fn is_busy(&self) -> bool {
        self.slot.try_lock().is_err()
    }

    fn claim_slot(&self) -> Result<OwnedMutexGuard<()>> {
        Arc::clone(&self.slot)
            .try_lock_owned()
            .map_err(|_| EngineError::Busy)
    }

    fn profile(&self, id: &str) -> Result<ConnectionProfile> {
        self.profiles
            .profile(id)
            .ok_or_else(|| EngineError::validation(format!("Unknown connection '{}'", id)))
    }

    /// Validate and start a clone. Validation failures come back here,
    /// before any event is emitted or any process spawned.
    pub fn start_clone(&self, options: CloneOptions) -> Result<CloneRun> {
        let request = ResolvedClone::resolve(self.profiles.as_ref(), options)?;
        let guard = self.claim_slot()?;

        let run_id = request.run_id.clone();
        info!(
            run_id = %run_id,
            source = %request.source.name,
            destination = %request.destination.name,
            clone_type = %request.options.clone_type,
            "Starting clone"
        );

        let reporter = ProgressReporter::new(CloneProgress::preparing());
        let events = reporter.subscribe();
        let feed = reporter.feed();
        let (cancel, signal) = cancel_pair();
        let orchestrator =
            CloneOrchestrator::new(Arc::clone(&self.services), request, reporter, signal);
        let history = self.history.clone();

        let task = tokio::spawn(async move {
            let outcome = orchestrator.run().await;
            let entry = history.record(outcome);
            info!(run_id = %entry.id, status = ?entry.status, duration = entry.duration, "Clone finished");
            drop(guard);
            entry
        });

        Ok(CloneRun {
            run_id,
            events: Some(events),
            feed,
            cancel,
            task,
        })
    }

    pub fn start_schema_export(&self, options: SchemaExportOptions) -> Result<SchemaExportRun> {
        let profile = self.profile(&options.profile_id)?;
        let guard = self.claim_slot()?;

        let reporter = ProgressReporter::new(CloneProgress::new(
            Stage::Preparing,
            0,
            "Preparing schema export...",
        ));
        let events = reporter.subscribe();
        let feed = reporter.feed();
        let (cancel, signal) = cancel_pair();
        let extractor = SchemaExtractor::new(
            Arc::clone(&self.services.runner),
            Arc::clone(&self.services.catalog),
            self.services.tools.clone(),
        );

        let task = tokio::spawn(async move {
            let result = extractor.run(&profile, &options, &reporter, &signal).await;
            drop(reporter);
            drop(guard);
            result
        });

        Ok(SchemaExportRun {
            events: Some(events),
            feed,
            cancel,
            task,
        })
    }

    /// Export and wait for the SQL text.
    pub async fn download_schema(&self, options: SchemaExportOptions) -> Result<String> {
        self.start_schema_export(options)?.wait().await
    }

    pub async fn database_structure(&self, profile_id: &str) -> Result<DatabaseStructure> {
        let profile = self.profile(profile_id)?;
        self.services.catalog.read_structure(&profile).await
    }

    pub async fn probe(&self, profile_id: &str) -> Result<DatabaseInfo> {
        let profile = self.profile(profile_id)?;
        self.services.catalog.probe(&profile).await
    }
}
