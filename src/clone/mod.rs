// ABOUTME: Clone pipeline: preparing, backup, cleaning, dumping, restoring, verifying
// ABOUTME: Drives pg_dump/pg_restore/psql stage by stage and settles every run in one terminal state

pub mod commands;
pub mod verify;

use std::fs;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tempfile::TempDir;
use tracing::{debug, warn};

use crate::cancel::CancelSignal;
use crate::catalog::CatalogReader;
use crate::config::ProfileSource;
use crate::engine::EngineSettings;
use crate::error::{EngineError, Result};
use crate::ident::QualifiedName;
use crate::models::{
    generate_id, CloneOptions, CloneProgress, CloneStatus, CloneType, ConnectionProfile,
    DatabaseStructure, LogLine, Stage,
};
use crate::process::{Invocation, ProcessExit, ProcessRunner};
use crate::progress::{ProgressReporter, StagePlan};
use crate::supervisor::{LineTicker, Supervisor, ToolRun};
use crate::tools::{Tool, ToolPaths};

use commands::DumpFormat;
use verify::Verifier;

/// Lines of pg_restore error output quoted when a restore fails.
const RESTORE_ERROR_LINES: usize = 10;

/// Collaborators shared by every run of one engine.
pub struct CloneServices {
    pub runner: Arc<dyn ProcessRunner>,
    pub catalog: Arc<dyn CatalogReader>,
    pub tools: ToolPaths,
    pub settings: EngineSettings,
}

/// A clone request whose profiles and table names have been checked and
/// snapshotted. Building one is the only validation a run gets.
#[derive(Debug, Clone)]
pub struct ResolvedClone {
    pub run_id: String,
    pub source: ConnectionProfile,
    pub destination: ConnectionProfile,
    pub options: CloneOptions,
    pub excluded: Vec<QualifiedName>,
}

impl ResolvedClone {
    pub fn resolve(profiles: &dyn ProfileSource, options: CloneOptions) -> Result<Self> {
        if options.source_id.trim().is_empty() || options.destination_id.trim().is_empty() {
            return Err(EngineError::validation(
                "Both a source and a destination connection must be selected",
            ));
        }
        if options.source_id == options.destination_id {
            return Err(EngineError::validation(
                "Source and destination cannot be the same connection",
            ));
        }

        let source = profiles.profile(&options.source_id).ok_or_else(|| {
            EngineError::validation(format!("Unknown source connection '{}'", options.source_id))
        })?;
        let destination = profiles.profile(&options.destination_id).ok_or_else(|| {
            EngineError::validation(format!(
                "Unknown destination connection '{}'",
                options.destination_id
            ))
        })?;
        if source.host == destination.host
            && source.port == destination.port
            && source.database == destination.database
        {
            return Err(EngineError::validation(format!(
                "'{}' and '{}' point at the same database ({})",
                source.name,
                destination.name,
                destination.location()
            )));
        }

        let excluded = options
            .exclude_tables
            .iter()
            .map(|name| QualifiedName::parse(name))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            run_id: generate_id(),
            source,
            destination,
            options,
            excluded,
        })
    }
}

/// Everything a finished run hands to history.
#[derive(Debug, Clone)]
pub struct CloneOutcome {
    pub run_id: String,
    pub source: ConnectionProfile,
    pub destination: ConnectionProfile,
    pub clone_type: CloneType,
    pub status: CloneStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub error_message: Option<String>,
    pub backup_path: Option<PathBuf>,
    pub logs: Vec<LogLine>,
}

pub struct CloneOrchestrator {
    services: Arc<CloneServices>,
    request: ResolvedClone,
    plan: StagePlan,
    reporter: ProgressReporter,
    cancel: CancelSignal,
    started_at: DateTime<Utc>,
    clock: Instant,
    stage: Stage,
    source_structure: Option<DatabaseStructure>,
    backup_path: Option<PathBuf>,
    work_dir: Option<TempDir>,
    dump_path: Option<PathBuf>,
}

fn is_dump_table_line(line: &str) -> bool {
    line.contains("dumping contents of table")
}

fn is_restore_data_line(line: &str) -> bool {
    line.contains("processing data for table")
}

fn is_restore_table_line(line: &str) -> bool {
    line.contains("creating TABLE ")
}

fn is_copy_line(line: &str) -> bool {
    line.starts_with("COPY ")
}

/// pg_restore exits nonzero for ignorable warnings too; only `error:` lines
/// make a restore fatal.
fn restore_errors(stderr: &[String]) -> Vec<&str> {
    stderr
        .iter()
        .map(String::as_str)
        .filter(|line| {
            let lower = line.to_lowercase();
            lower.contains("error:") && !lower.contains("errors ignored on restore")
        })
        .collect()
}

fn restore_warning_count(stderr: &[String]) -> usize {
    stderr
        .iter()
        .filter(|line| {
            let lower = line.to_lowercase();
            lower.contains("warning:") || lower.contains("errors ignored on restore")
        })
        .count()
}

/// Claim `path` for a new backup. An existing file is never overwritten.
fn reserve_backup_file(path: &Path) -> Result<()> {
    fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map(drop)
        .map_err(|e| {
            EngineError::Io(io::Error::new(
                e.kind(),
                format!("cannot create backup file {}: {}", path.display(), e),
            ))
        })
}

/// Human-readable byte count, binary units.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

fn stage_message(stage: Stage) -> &'static str {
    match stage {
        Stage::Preparing => "Preparing clone operation...",
        Stage::Backup => "Creating backup of destination database...",
        Stage::Cleaning => "Cleaning destination database...",
        Stage::Dumping => "Dumping source database...",
        Stage::Restoring => "Restoring to destination database...",
        Stage::Verifying => "Verifying clone...",
        Stage::Completed => "Clone completed successfully",
        Stage::Error => "Clone failed",
        Stage::Cancelled => "Clone cancelled",
    }
}

impl CloneOrchestrator {
    pub fn new(
        services: Arc<CloneServices>,
        request: ResolvedClone,
        reporter: ProgressReporter,
        cancel: CancelSignal,
    ) -> Self {
        let plan = StagePlan::for_clone(&request.options);
        Self {
            services,
            request,
            plan,
            reporter,
            cancel,
            started_at: Utc::now(),
            clock: Instant::now(),
            stage: Stage::Preparing,
            source_structure: None,
            backup_path: None,
            work_dir: None,
            dump_path: None,
        }
    }

    /// Run to a terminal state. Never returns early: every failure,
    /// including cancellation, ends up in the outcome.
    pub async fn run(mut self) -> CloneOutcome {
        let result = self.execute().await;
        let current = self.reporter.latest().progress;

        let (status, error_message) = match result {
            Ok(()) => {
                self.reporter.info(format!("Stage: {}", Stage::Completed));
                let message = format!(
                    "Clone completed successfully in {:.1}s",
                    self.clock.elapsed().as_secs_f64()
                );
                self.reporter.success(&message);
                self.reporter
                    .progress(CloneProgress::new(Stage::Completed, 100, message));
                (CloneStatus::Success, None)
            }
            Err(EngineError::Cancelled) => {
                self.reporter.info(format!("Stage: {}", Stage::Cancelled));
                let message = format!("Clone cancelled during {}", self.stage);
                self.reporter.warning(&message);
                self.reporter
                    .progress(CloneProgress::new(Stage::Cancelled, current, &message));
                (CloneStatus::Cancelled, Some(message))
            }
            Err(err) => {
                self.reporter.info(format!("Stage: {}", Stage::Error));
                let message = self.failure_message(&err);
                self.reporter.error(&message);
                self.reporter
                    .progress(CloneProgress::new(Stage::Error, current, &message));
                (CloneStatus::Error, Some(message))
            }
        };

        if let Some(dir) = self.work_dir.take() {
            let path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                warn!(path = %path.display(), error = %e, "Failed to remove dump directory");
            }
        }

        let CloneOrchestrator {
            request,
            reporter,
            started_at,
            backup_path,
            ..
        } = self;
        CloneOutcome {
            run_id: request.run_id,
            source: request.source,
            destination: request.destination,
            clone_type: request.options.clone_type,
            status,
            started_at,
            completed_at: Utc::now(),
            error_message,
            backup_path,
            logs: reporter.close(),
        }
    }

    fn failure_message(&self, err: &EngineError) -> String {
        let mut message = err.to_string();
        if let Some(path) = &self.backup_path {
            message.push_str(&format!(
                ". The destination was backed up before cloning; restore it with: psql -f {}",
                path.display()
            ));
        }
        message
    }

    async fn execute(&mut self) -> Result<()> {
        self.prepare().await?;

        let stages: Vec<Stage> = self.plan.stages().collect();
        for stage in stages {
            self.check_cancelled()?;
            self.enter(stage);
            match stage {
                Stage::Backup => self.backup().await?,
                Stage::Cleaning => self.clean().await?,
                Stage::Dumping => self.dump().await?,
                Stage::Restoring => self.restore().await?,
                Stage::Verifying => self.verify().await?,
                other => debug!(stage = %other, "Stage has no work"),
            }
        }
        self.check_cancelled()
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(EngineError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Race `work` against cancellation. Abandoning `work` drops any child
    /// process it spawned, which kills it.
    async fn or_cancelled<F: Future>(&self, work: F) -> Result<F::Output> {
        let mut cancel = self.cancel.clone();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(EngineError::Cancelled),
            output = work => Ok(output),
        }
    }

    fn enter(&mut self, stage: Stage) {
        self.stage = stage;
        self.reporter.info(format!("Stage: {}", stage));
        let (start, _) = self.plan.band(stage);
        self.reporter
            .progress(CloneProgress::new(stage, start, stage_message(stage)));
    }

    async fn supervise(
        &self,
        stage: Stage,
        invocation: &Invocation,
        ticker: Option<LineTicker>,
    ) -> Result<ToolRun> {
        let supervisor = Supervisor {
            runner: self.services.runner.as_ref(),
            reporter: &self.reporter,
            plan: &self.plan,
            cancel: &self.cancel,
        };
        supervisor.run(stage, invocation, ticker).await
    }

    fn tool(&self, tool: Tool) -> Result<PathBuf> {
        self.services.tools.require(tool).map(|p| p.to_path_buf())
    }

    /// Tables the dump should contain, when the source catalog could be read.
    fn expected_tables(&self) -> Option<usize> {
        let structure = self.source_structure.as_ref()?;
        Some(
            structure
                .tables
                .iter()
                .filter(|t| {
                    !self
                        .request
                        .excluded
                        .iter()
                        .any(|e| e.schema == t.schema && e.table == t.name)
                })
                .count(),
        )
    }

    async fn prepare(&mut self) -> Result<()> {
        self.reporter.info(format!("Stage: {}", Stage::Preparing));
        let (source, destination) = (&self.request.source, &self.request.destination);
        let options = &self.request.options;
        self.reporter.info(format!(
            "Starting {} clone from '{}' ({}) to '{}' ({})",
            options.clone_type,
            source.name,
            source.location(),
            destination.name,
            destination.location()
        ));

        for tool in Tool::ALL {
            let path = self.tool(tool)?;
            debug!(tool = %tool, path = %path.display(), "Using tool");
        }

        if !self.request.excluded.is_empty() {
            let names: Vec<String> = self.request.excluded.iter().map(|n| n.to_string()).collect();
            self.reporter.info(format!(
                "Excluding {} table(s): {}",
                names.len(),
                names.join(", ")
            ));
        }
        if options.clean_destination && !options.create_backup {
            self.reporter
                .warning("Destination will be cleaned without a backup");
        }

        self.check_cancelled()?;
        let read = self.services.catalog.read_structure(source);
        let snapshot = self.or_cancelled(read).await?;
        match snapshot {
            Ok(structure) => {
                self.reporter.info(format!(
                    "Source has {} table(s) in {} schema(s)",
                    structure.tables.len(),
                    structure.schemas.len()
                ));
                self.source_structure = Some(structure);
            }
            Err(e) => self.reporter.warning(format!(
                "Could not read source catalog, stage progress will be approximate: {}",
                e
            )),
        }
        Ok(())
    }

    async fn backup(&mut self) -> Result<()> {
        let dir = self.services.settings.backup_dir.clone();
        fs::create_dir_all(&dir).map_err(|e| {
            io::Error::new(
                e.kind(),
                format!("cannot create backup directory {}: {}", dir.display(), e),
            )
        })?;
        let path = dir.join(commands::backup_file_name(
            &self.request.destination,
            &self.request.run_id,
            self.started_at,
        ));
        reserve_backup_file(&path)?;
        self.reporter
            .info(format!("Backing up destination to {}", path.display()));

        let pg_dump = self.tool(Tool::PgDump)?;
        let invocation = commands::backup_dump(&pg_dump, &self.request.destination, &path);
        let run = match self.supervise(Stage::Backup, &invocation, None).await {
            Ok(run) if run.exit.success() => run,
            Ok(run) => {
                let _ = fs::remove_file(&path);
                return Err(run.failure(Stage::Backup));
            }
            Err(e) => {
                let _ = fs::remove_file(&path);
                return Err(e);
            }
        };

        let size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        if size == 0 {
            let _ = fs::remove_file(&path);
            return Err(EngineError::ProcessFailed {
                stage: Stage::Backup,
                tool: run.tool.clone(),
                exit_code: run.exit.code(),
                stderr_tail: format!("backup file {} is empty", path.display()),
            });
        }
        self.reporter.success(format!(
            "Backup created: {} ({}) in {:.1}s",
            path.display(),
            format_size(size),
            run.elapsed.as_secs_f64()
        ));
        self.backup_path = Some(path);
        Ok(())
    }

    async fn clean(&mut self) -> Result<()> {
        let clone_type = self.request.options.clone_type;
        if clone_type.includes_structure() {
            self.reporter
                .info("Dropping all user schemas and objects in the destination");
        } else {
            self.reporter
                .info("Truncating destination tables, structure is kept");
            if !self.request.excluded.is_empty() {
                self.reporter.info(format!(
                    "Keeping existing data in {} excluded table(s)",
                    self.request.excluded.len()
                ));
            }
        }

        let psql = self.tool(Tool::Psql)?;
        let sql = commands::clean_sql(clone_type, &self.request.excluded);
        let invocation = commands::clean(&psql, &self.request.destination, &sql);
        self.supervise(Stage::Cleaning, &invocation, None)
            .await?
            .ensure_success(Stage::Cleaning)?;
        self.reporter.success("Destination cleaned");
        Ok(())
    }

    async fn dump(&mut self) -> Result<()> {
        let clone_type = self.request.options.clone_type;
        let work_dir = tempfile::Builder::new().prefix("pgclone-").tempdir()?;
        let format = DumpFormat::for_clone(clone_type);
        let path = work_dir.path().join(format.file_name());
        self.work_dir = Some(work_dir);

        self.reporter.info(match format {
            DumpFormat::Custom => "Dumping source as a compressed custom-format archive",
            DumpFormat::Plain => "Dumping source data as plain SQL",
        });

        let pg_dump = self.tool(Tool::PgDump)?;
        let invocation = commands::source_dump(
            &pg_dump,
            &self.request.source,
            clone_type,
            &self.request.excluded,
            &path,
        );
        let expected = if clone_type.includes_data() {
            self.expected_tables()
        } else {
            None
        };
        let ticker = LineTicker::new(expected, "Dumping table data...", is_dump_table_line);
        let run = self
            .supervise(Stage::Dumping, &invocation, Some(ticker))
            .await?
            .ensure_success(Stage::Dumping)?;

        let size = fs::metadata(&path)
            .map_err(|_| EngineError::ProcessFailed {
                stage: Stage::Dumping,
                tool: run.tool.clone(),
                exit_code: run.exit.code(),
                stderr_tail: format!("dump file {} was not created", path.display()),
            })?
            .len();
        self.reporter.info(format!(
            "Dump completed in {:.1}s ({})",
            run.elapsed.as_secs_f64(),
            format_size(size)
        ));
        self.dump_path = Some(path);
        Ok(())
    }

    async fn restore(&mut self) -> Result<()> {
        let Some(dump) = self.dump_path.clone() else {
            return Err(EngineError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                "no dump file to restore",
            )));
        };
        let clone_type = self.request.options.clone_type;
        let expected = self.expected_tables();

        let run = match DumpFormat::for_clone(clone_type) {
            DumpFormat::Custom => {
                let jobs = self.services.settings.parallel_jobs;
                self.reporter
                    .info(format!("Restoring with pg_restore using {} parallel job(s)", jobs));
                let ticker = if clone_type.includes_data() {
                    LineTicker::new(expected, "Restoring table data...", is_restore_data_line)
                } else {
                    LineTicker::new(expected, "Creating tables...", is_restore_table_line)
                };
                let pg_restore = self.tool(Tool::PgRestore)?;
                let invocation =
                    commands::restore_archive(&pg_restore, &self.request.destination, &dump, jobs);
                let run = self
                    .supervise(Stage::Restoring, &invocation, Some(ticker))
                    .await?;
                if !run.exit.success() {
                    let errors = restore_errors(&run.stderr);
                    if !errors.is_empty() {
                        let quoted: Vec<&str> =
                            errors.iter().take(RESTORE_ERROR_LINES).copied().collect();
                        return Err(EngineError::ProcessFailed {
                            stage: Stage::Restoring,
                            tool: run.tool.clone(),
                            exit_code: run.exit.code(),
                            stderr_tail: quoted.join("\n"),
                        });
                    }
                    // Only a normal nonzero exit can be a warnings-only restore.
                    let ProcessExit::Exited(code) = run.exit else {
                        return Err(run.failure(Stage::Restoring));
                    };
                    self.reporter.warning(format!(
                        "pg_restore exited with code {} after {} warning(s) and no errors; continuing",
                        code,
                        restore_warning_count(&run.stderr)
                    ));
                }
                run
            }
            DumpFormat::Plain => {
                self.reporter.info("Loading data with psql");
                let psql = self.tool(Tool::Psql)?;
                let invocation = commands::restore_plain(&psql, &self.request.destination, &dump);
                let ticker = LineTicker::new(expected, "Loading table data...", is_copy_line);
                self.supervise(Stage::Restoring, &invocation, Some(ticker))
                    .await?
                    .ensure_success(Stage::Restoring)?
            }
        };

        self.reporter.success(format!(
            "Restore completed in {:.1}s",
            run.elapsed.as_secs_f64()
        ));
        Ok(())
    }

    /// Findings become warnings; only cancellation ends the run here.
    async fn verify(&mut self) -> Result<()> {
        let snapshot = self.source_structure.take();
        let verifier = Verifier {
            catalog: self.services.catalog.as_ref(),
            source: &self.request.source,
            destination: &self.request.destination,
            clone_type: self.request.options.clone_type,
            clean_destination: self.request.options.clean_destination,
            excluded: &self.request.excluded,
            sample: self.services.settings.verify_sample,
        };

        match self.or_cancelled(verifier.run(snapshot)).await? {
            Ok(report) if report.is_clean() => {
                for check in &report.row_checks {
                    self.reporter.info(format!(
                        "{}: {} rows on both sides",
                        check.table, check.destination
                    ));
                }
                self.reporter.success(format!(
                    "Verification passed: {} table(s) in destination",
                    report.destination_tables
                ));
            }
            Ok(report) => {
                for mismatch in report.mismatches {
                    self.reporter
                        .warning(EngineError::VerificationMismatch(mismatch).to_string());
                }
            }
            Err(e) => self
                .reporter
                .warning(format!("Verification skipped: {}", e)),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProfileBook;

    fn profile(id: &str, database: &str) -> ConnectionProfile {
        ConnectionProfile {
            id: id.to_string(),
            name: id.to_uppercase(),
            host: "localhost".to_string(),
            port: 5432,
            database: database.to_string(),
            user: "postgres".to_string(),
            password: String::new(),
            ssl: false,
            tag_id: None,
        }
    }

    fn options(source: &str, destination: &str) -> CloneOptions {
        CloneOptions {
            source_id: source.to_string(),
            destination_id: destination.to_string(),
            clean_destination: false,
            create_backup: false,
            clone_type: CloneType::Both,
            exclude_tables: Default::default(),
        }
    }

    fn book() -> ProfileBook {
        ProfileBook::new(vec![profile("prod", "shop"), profile("staging", "shop_staging")])
    }

    #[test]
    fn test_resolve_snapshots_profiles() {
        let mut opts = options("prod", "staging");
        opts.exclude_tables.insert("audit_log".to_string());
        let resolved = ResolvedClone::resolve(&book(), opts).unwrap();
        assert_eq!(resolved.source.database, "shop");
        assert_eq!(resolved.destination.database, "shop_staging");
        assert_eq!(resolved.excluded, vec![QualifiedName::new("public", "audit_log")]);
        assert_eq!(resolved.run_id.len(), 32);
    }

    #[test]
    fn test_resolve_rejects_same_profile() {
        let err = ResolvedClone::resolve(&book(), options("prod", "prod")).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn test_resolve_rejects_unknown_and_empty() {
        assert!(matches!(
            ResolvedClone::resolve(&book(), options("prod", "missing")),
            Err(EngineError::Validation(ref m)) if m.contains("missing")
        ));
        assert!(matches!(
            ResolvedClone::resolve(&book(), options("", "staging")),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn test_resolve_rejects_same_database_under_two_profiles() {
        let book = ProfileBook::new(vec![profile("a", "shop"), profile("b", "shop")]);
        let err = ResolvedClone::resolve(&book, options("a", "b")).unwrap_err();
        assert!(err.to_string().contains("same database"));
    }

    #[test]
    fn test_restore_error_classification() {
        let stderr: Vec<String> = [
            "pg_restore: creating TABLE \"public.users\"",
            "pg_restore: warning: could not find where to insert IF EXISTS",
            "pg_restore: warning: errors ignored on restore: 1",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert!(restore_errors(&stderr).is_empty());
        assert_eq!(restore_warning_count(&stderr), 2);

        let mut failing = stderr.clone();
        failing.push(
            "pg_restore: error: could not execute query: ERROR:  relation \"users\" already exists"
                .to_string(),
        );
        assert_eq!(restore_errors(&failing).len(), 1);
    }

    #[test]
    fn test_reserve_backup_file_never_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shop_dst_backup.sql");
        reserve_backup_file(&path).unwrap();
        assert!(path.exists());

        fs::write(&path, "-- earlier backup\n").unwrap();
        let err = reserve_backup_file(&path).unwrap_err();
        assert!(err.to_string().contains("cannot create backup file"), "{}", err);
        assert_eq!(fs::read_to_string(&path).unwrap(), "-- earlier backup\n");
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.0 KB");
        assert_eq!(format_size(5 * 1024 * 1024 + 512 * 1024), "5.5 MB");
    }
}
