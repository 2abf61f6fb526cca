// ABOUTME: Structure-only export of one database as a single SQL document
// ABOUTME: Restricts pg_dump to the selected schemas/tables, then filters object kinds out of the script

pub mod filter;

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::cancel::CancelSignal;
use crate::catalog::CatalogReader;
use crate::clone::format_size;
use crate::error::{EngineError, Result};
use crate::ident::{schema_pattern, QualifiedName};
use crate::models::{CloneProgress, ConnectionProfile, SchemaExportOptions, Stage};
use crate::process::{Invocation, ProcessRunner};
use crate::progress::{ProgressReporter, StagePlan};
use crate::supervisor::Supervisor;
use crate::tools::{Tool, ToolPaths};

use filter::{filter_dump, FilterOptions};

/// What pg_dump is asked for. Empty lists mean the whole database.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    pub schemas: Vec<String>,
    pub tables: Vec<QualifiedName>,
}

impl Selection {
    /// Normalise the allow-lists. When both are given, only tables inside
    /// the selected schemas are kept.
    pub fn from_options(options: &SchemaExportOptions) -> Result<Self> {
        let schemas: BTreeSet<String> = options
            .schemas
            .iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        let mut tables: BTreeSet<QualifiedName> = options
            .tables
            .iter()
            .filter(|t| !t.trim().is_empty())
            .map(|t| QualifiedName::parse(t))
            .collect::<Result<_>>()?;

        if !schemas.is_empty() && !tables.is_empty() {
            tables.retain(|t| schemas.contains(&t.schema));
            if tables.is_empty() {
                return Err(EngineError::validation(
                    "None of the selected tables belong to the selected schemas",
                ));
            }
        }

        Ok(Self {
            schemas: schemas.into_iter().collect(),
            tables: tables.into_iter().collect(),
        })
    }

    pub fn is_everything(&self) -> bool {
        self.schemas.is_empty() && self.tables.is_empty()
    }

    /// Drop names the catalog does not know. Returns the dropped names.
    fn retain_known(&mut self, schemas: &[String], tables: &[QualifiedName]) -> Vec<String> {
        let mut unknown = Vec::new();
        self.schemas.retain(|s| {
            let known = schemas.contains(s);
            if !known {
                unknown.push(format!("schema {}", s));
            }
            known
        });
        self.tables.retain(|t| {
            let known = tables.contains(t);
            if !known {
                unknown.push(format!("table {}", t));
            }
            known
        });
        unknown
    }
}

/// pg_dump call for a structure-only plain script written to `path`.
/// A table list takes precedence over a schema list.
pub fn dump_invocation(
    pg_dump: &Path,
    profile: &ConnectionProfile,
    selection: &Selection,
    path: &Path,
) -> Invocation {
    let mut invocation = Invocation::new("pg_dump", pg_dump)
        .arg("-d")
        .arg(profile.conninfo())
        .envs(profile.libpq_env())
        .args(["--schema-only", "-Fp"]);
    if selection.tables.is_empty() {
        for schema in &selection.schemas {
            invocation = invocation.arg("-n").arg(schema_pattern(schema));
        }
    } else {
        for table in &selection.tables {
            invocation = invocation.arg("-t").arg(table.dump_pattern());
        }
    }
    invocation.arg("-f").arg(path.to_string_lossy())
}

pub struct SchemaExtractor {
    runner: Arc<dyn ProcessRunner>,
    catalog: Arc<dyn CatalogReader>,
    tools: ToolPaths,
}

impl SchemaExtractor {
    pub fn new(
        runner: Arc<dyn ProcessRunner>,
        catalog: Arc<dyn CatalogReader>,
        tools: ToolPaths,
    ) -> Self {
        Self {
            runner,
            catalog,
            tools,
        }
    }

    /// Export and settle the reporter in a terminal state either way.
    pub async fn run(
        &self,
        profile: &ConnectionProfile,
        options: &SchemaExportOptions,
        reporter: &ProgressReporter,
        cancel: &CancelSignal,
    ) -> Result<String> {
        let result = self.extract(profile, options, reporter, cancel).await;
        let current = reporter.latest().progress;
        match &result {
            Ok(_) => {
                reporter.info(format!("Stage: {}", Stage::Completed));
                reporter.progress(CloneProgress::new(
                    Stage::Completed,
                    100,
                    "Schema ready for download",
                ));
            }
            Err(EngineError::Cancelled) => {
                reporter.info(format!("Stage: {}", Stage::Cancelled));
                reporter.warning("Schema export cancelled");
                reporter.progress(CloneProgress::new(
                    Stage::Cancelled,
                    current,
                    "Schema export cancelled",
                ));
            }
            Err(e) => {
                reporter.info(format!("Stage: {}", Stage::Error));
                let message = format!("Schema export failed: {}", e);
                reporter.error(&message);
                reporter.progress(CloneProgress::new(Stage::Error, current, message));
            }
        }
        result
    }

    async fn extract(
        &self,
        profile: &ConnectionProfile,
        options: &SchemaExportOptions,
        reporter: &ProgressReporter,
        cancel: &CancelSignal,
    ) -> Result<String> {
        reporter.info(format!("Stage: {}", Stage::Preparing));
        reporter.info(format!(
            "Extracting schema from '{}' ({})",
            profile.name,
            profile.location()
        ));
        let pg_dump = self.tools.require(Tool::PgDump)?.to_path_buf();

        let mut selection = Selection::from_options(options)?;
        if !selection.is_everything() {
            self.check_selection(profile, &mut selection, reporter, cancel)
                .await?;
        }

        let filters = FilterOptions::from(options);
        if !filters.keeps_everything() {
            reporter.info("Some object kinds are excluded and will be filtered from the dump");
        }

        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let plan = StagePlan::for_schema_export();
        reporter.info(format!("Stage: {}", Stage::Dumping));
        reporter.progress(CloneProgress::new(
            Stage::Dumping,
            0,
            "Extracting database schema...",
        ));

        let work_dir = tempfile::Builder::new().prefix("pgclone-schema-").tempdir()?;
        let path = work_dir.path().join("schema.sql");
        let invocation = dump_invocation(&pg_dump, profile, &selection, &path);
        let supervisor = Supervisor {
            runner: self.runner.as_ref(),
            reporter,
            plan: &plan,
            cancel,
        };
        supervisor
            .run(Stage::Dumping, &invocation, None)
            .await?
            .ensure_success(Stage::Dumping)?;

        let raw = fs::read_to_string(&path)?;
        let schema = filter_dump(&raw, &filters);
        reporter.success(format!(
            "Schema extracted ({})",
            format_size(schema.len() as u64)
        ));
        info!(profile = %profile.id, bytes = schema.len(), "Schema export finished");
        Ok(schema)
    }

    async fn check_selection(
        &self,
        profile: &ConnectionProfile,
        selection: &mut Selection,
        reporter: &ProgressReporter,
        cancel: &CancelSignal,
    ) -> Result<()> {
        let mut cancel = cancel.clone();
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            read = self.catalog.read_structure(profile) => read,
        };
        let structure = match read {
            Ok(structure) => structure,
            Err(e) => {
                reporter.warning(format!(
                    "Could not check the selection against the catalog: {}",
                    e
                ));
                return Ok(());
            }
        };
        let schemas: Vec<String> = structure.schemas.iter().map(|s| s.name.clone()).collect();
        let tables: Vec<QualifiedName> = structure
            .tables
            .iter()
            .map(|t| QualifiedName::new(&t.schema, &t.name))
            .collect();

        for name in selection.retain_known(&schemas, &tables) {
            reporter.warning(format!("Skipping unknown {}", name));
        }
        if selection.is_everything() {
            return Err(EngineError::validation(format!(
                "None of the selected schemas or tables exist in {}",
                profile.database
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> SchemaExportOptions {
        SchemaExportOptions::new("prod")
    }

    #[test]
    fn test_selection_intersects_tables_with_schemas() {
        let mut opts = options();
        opts.schemas = vec!["sales".to_string(), " ".to_string(), "sales".to_string()];
        opts.tables = vec!["sales.orders".to_string(), "public.users".to_string()];
        let selection = Selection::from_options(&opts).unwrap();
        assert_eq!(selection.schemas, vec!["sales".to_string()]);
        assert_eq!(selection.tables, vec![QualifiedName::new("sales", "orders")]);
    }

    #[test]
    fn test_disjoint_selection_is_rejected() {
        let mut opts = options();
        opts.schemas = vec!["sales".to_string()];
        opts.tables = vec!["users".to_string()];
        let err = Selection::from_options(&opts).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn test_empty_selection_is_everything() {
        assert!(Selection::from_options(&options()).unwrap().is_everything());
    }

    #[test]
    fn test_dump_invocation_prefers_tables() {
        let profile = ConnectionProfile {
            id: "prod".to_string(),
            name: "Prod".to_string(),
            host: "db".to_string(),
            port: 5432,
            database: "shop".to_string(),
            user: "app".to_string(),
            password: String::new(),
            ssl: true,
            tag_id: None,
        };
        let selection = Selection {
            schemas: vec!["sales".to_string()],
            tables: vec![QualifiedName::new("sales", "Orders")],
        };
        let inv = dump_invocation(Path::new("pg_dump"), &profile, &selection, Path::new("/tmp/s.sql"));
        assert!(inv.has_arg("--schema-only"));
        assert_eq!(inv.arg_value("-t"), Some("\"sales\".\"Orders\""));
        assert!(!inv.has_arg("-n"));
        assert_eq!(inv.arg_value("-f"), Some("/tmp/s.sql"));
        assert!(inv.envs.iter().any(|(k, v)| k == "PGSSLMODE" && v == "require"));

        let schemas_only = Selection {
            schemas: vec!["sales".to_string(), "audit".to_string()],
            tables: Vec::new(),
        };
        let inv = dump_invocation(Path::new("pg_dump"), &profile, &schemas_only, Path::new("/tmp/s.sql"));
        let patterns: Vec<&str> = inv
            .args
            .windows(2)
            .filter(|w| w[0] == "-n")
            .map(|w| w[1].as_str())
            .collect();
        assert_eq!(patterns, vec!["\"sales\"", "\"audit\""]);
    }
}
