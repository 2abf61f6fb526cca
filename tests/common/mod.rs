// ABOUTME: Shared fixtures for the integration tests: profiles, tool paths and engine wiring
// ABOUTME: Every external process is scripted and every catalog read is served from memory

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use pgclone::catalog::FixedCatalog;
use pgclone::config::ProfileBook;
use pgclone::history::HistorySink;
use pgclone::models::{CloneOptions, CloneType, ConnectionProfile, LogLine};
use pgclone::process::ScriptedRunner;
use pgclone::progress::{EventStream, RunEvent};
use pgclone::tools::ToolPaths;
use pgclone::{Engine, EngineSettings};

pub fn profile(id: &str, database: &str) -> ConnectionProfile {
    ConnectionProfile {
        id: id.to_string(),
        name: format!("{} db", id),
        host: "db.internal".to_string(),
        port: 5432,
        database: database.to_string(),
        user: "postgres".to_string(),
        password: "secret".to_string(),
        ssl: false,
        tag_id: None,
    }
}

pub fn all_tools() -> ToolPaths {
    ToolPaths {
        psql: Some(PathBuf::from("/usr/bin/psql")),
        pg_dump: Some(PathBuf::from("/usr/bin/pg_dump")),
        pg_restore: Some(PathBuf::from("/usr/bin/pg_restore")),
    }
}

const TABLES: [(&str, i64); 3] = [
    ("public.users", 65536),
    ("public.orders", 32768),
    ("audit.events", 8192),
];

pub fn catalog() -> FixedCatalog {
    FixedCatalog::new()
        .with_tables("prod", &TABLES)
        .with_tables("staging", &TABLES)
}

pub fn engine(
    runner: &ScriptedRunner,
    tools: ToolPaths,
    history: Arc<dyn HistorySink>,
    backup_dir: &Path,
) -> Engine {
    engine_with_catalog(runner, tools, history, backup_dir, catalog())
}

pub fn engine_with_catalog(
    runner: &ScriptedRunner,
    tools: ToolPaths,
    history: Arc<dyn HistorySink>,
    backup_dir: &Path,
    catalog: FixedCatalog,
) -> Engine {
    Engine::new(
        Arc::new(ProfileBook::new(vec![
            profile("prod", "app"),
            profile("staging", "app_staging"),
        ])),
        tools,
        Arc::new(runner.clone()),
        Arc::new(catalog),
        history,
        EngineSettings {
            backup_dir: backup_dir.to_path_buf(),
            parallel_jobs: 4,
            verify_sample: 3,
        },
    )
}

pub fn clone_options(clone_type: CloneType) -> CloneOptions {
    CloneOptions {
        source_id: "prod".to_string(),
        destination_id: "staging".to_string(),
        clean_destination: false,
        create_backup: false,
        clone_type,
        exclude_tables: Default::default(),
    }
}

/// Read the stream until the run closes it.
pub async fn drain(mut events: EventStream) -> Vec<RunEvent> {
    let mut seen = Vec::new();
    while let Some(event) = events.recv().await {
        seen.push(event);
    }
    seen
}

pub fn progress_values(events: &[RunEvent]) -> Vec<u8> {
    events
        .iter()
        .filter_map(|e| match e {
            RunEvent::Progress(p) => Some(p.progress),
            RunEvent::Log(_) => None,
        })
        .collect()
}

/// Stage names in the order the run announced them.
pub fn stages_entered(logs: &[LogLine]) -> Vec<String> {
    logs.iter()
        .filter_map(|l| l.message.strip_prefix("Stage: "))
        .map(str::to_string)
        .collect()
}

pub fn logs_of(events: &[RunEvent]) -> Vec<LogLine> {
    events
        .iter()
        .filter_map(|e| match e {
            RunEvent::Log(line) => Some(line.clone()),
            RunEvent::Progress(_) => None,
        })
        .collect()
}
