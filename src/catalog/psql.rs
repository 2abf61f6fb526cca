// ABOUTME: Catalog backend that runs queries through the psql binary
// ABOUTME: Unaligned, tuples-only output with a unit-separator delimiter keeps parsing unambiguous

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{
    row_count_query, CatalogReader, DATABASE_SIZE_QUERY, SCHEMAS_QUERY, TABLES_QUERY,
    VERSION_QUERY,
};
use crate::error::{EngineError, Result};
use crate::ident::QualifiedName;
use crate::models::{ConnectionProfile, DatabaseInfo, DatabaseStructure, SchemaInfo, TableInfo};
use crate::process::{Invocation, ProcessRunner};

/// ASCII unit separator: cannot appear in an identifier typed by a human.
pub const FIELD_SEPARATOR: char = '\u{1f}';

pub struct PsqlCatalog {
    runner: Arc<dyn ProcessRunner>,
    psql: Option<PathBuf>,
}

impl PsqlCatalog {
    pub fn new(runner: Arc<dyn ProcessRunner>, psql: Option<PathBuf>) -> Self {
        Self { runner, psql }
    }

    /// Build the psql call for a read-only query.
    pub fn query_invocation(psql: PathBuf, profile: &ConnectionProfile, sql: &str) -> Invocation {
        Invocation::new("psql", psql)
            .args(["-X", "-q", "-t", "-A", "-v", "ON_ERROR_STOP=1"])
            .arg("-F")
            .arg(FIELD_SEPARATOR.to_string())
            .arg("-d")
            .arg(profile.conninfo())
            .arg("-c")
            .arg(sql)
            .envs(profile.libpq_env())
            .envs(vec![(
                "PGOPTIONS".to_string(),
                "-c default_transaction_read_only=on".to_string(),
            )])
    }

    async fn query(&self, profile: &ConnectionProfile, sql: &str) -> Result<Vec<Vec<String>>> {
        let psql = self
            .psql
            .clone()
            .ok_or_else(|| EngineError::catalog("psql not found. Please install PostgreSQL client tools"))?;
        let invocation = Self::query_invocation(psql, profile, sql);
        // The handle owns the child: a caller that abandons this future on
        // cancel kills psql with it.
        let handle = self
            .runner
            .spawn(&invocation)
            .map_err(|e| EngineError::catalog(e.to_string()))?;
        let output = handle.collect().await;

        if !output.exit.success() {
            let stderr = output.stderr.join("\n");
            return Err(EngineError::catalog(format!(
                "psql query against {} failed: {}",
                profile.location(),
                stderr.trim()
            )));
        }

        debug!(rows = output.stdout.len(), "psql catalog query finished");
        Ok(parse_rows(&output.stdout))
    }
}

pub(crate) fn parse_rows(lines: &[String]) -> Vec<Vec<String>> {
    lines
        .iter()
        .filter(|line| !line.trim().is_empty())
        .map(|line| line.split(FIELD_SEPARATOR).map(str::to_string).collect())
        .collect()
}

fn parse_i64(field: Option<&String>) -> i64 {
    field.and_then(|f| f.trim().parse().ok()).unwrap_or(0)
}

fn parse_structure(schema_rows: Vec<Vec<String>>, table_rows: Vec<Vec<String>>) -> DatabaseStructure {
    let schemas = schema_rows
        .into_iter()
        .filter(|row| row.len() >= 2)
        .map(|row| SchemaInfo {
            table_count: parse_i64(row.get(1)),
            name: row[0].clone(),
        })
        .collect();
    let tables = table_rows
        .into_iter()
        .filter(|row| row.len() >= 4)
        .map(|row| TableInfo {
            row_count: parse_i64(row.get(2)),
            size: parse_i64(row.get(3)),
            schema: row[0].clone(),
            name: row[1].clone(),
        })
        .collect();
    DatabaseStructure { schemas, tables }
}

#[async_trait]
impl CatalogReader for PsqlCatalog {
    async fn read_structure(&self, profile: &ConnectionProfile) -> Result<DatabaseStructure> {
        let schema_rows = self.query(profile, SCHEMAS_QUERY).await?;
        let table_rows = self.query(profile, TABLES_QUERY).await?;
        Ok(parse_structure(schema_rows, table_rows))
    }

    async fn probe(&self, profile: &ConnectionProfile) -> Result<DatabaseInfo> {
        let version = self
            .query(profile, VERSION_QUERY)
            .await?
            .into_iter()
            .next()
            .and_then(|row| row.into_iter().next())
            .unwrap_or_default();
        let size_rows = self.query(profile, DATABASE_SIZE_QUERY).await?;
        let total_size = parse_i64(size_rows.first().and_then(|row| row.first()));
        let structure = self.read_structure(profile).await?;
        Ok(DatabaseInfo {
            version: version.trim().to_string(),
            total_size,
            tables: structure.tables,
        })
    }

    async fn exact_row_counts(
        &self,
        profile: &ConnectionProfile,
        tables: &[QualifiedName],
    ) -> Result<Vec<(QualifiedName, i64)>> {
        if tables.is_empty() {
            return Ok(Vec::new());
        }
        let rows = self.query(profile, &row_count_query(tables)).await?;
        if rows.len() != tables.len() {
            return Err(EngineError::catalog(format!(
                "expected {} row counts, got {}",
                tables.len(),
                rows.len()
            )));
        }
        Ok(tables
            .iter()
            .cloned()
            .zip(rows.iter().map(|row| parse_i64(row.get(1))))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{Script, ScriptedRunner};

    fn profile() -> ConnectionProfile {
        ConnectionProfile {
            id: "src".to_string(),
            name: "Source".to_string(),
            host: "localhost".to_string(),
            port: 5432,
            database: "shop".to_string(),
            user: "postgres".to_string(),
            password: "pw".to_string(),
            ssl: false,
            tag_id: None,
        }
    }

    fn row(fields: &[&str]) -> String {
        fields.join(&FIELD_SEPARATOR.to_string())
    }

    #[tokio::test]
    async fn test_read_structure_parses_rows() {
        let runner = ScriptedRunner::new();
        runner.push(
            "psql",
            Script::success().stdout(&format!("{}\n{}\n", row(&["public", "2"]), row(&["audit", "0"]))),
        );
        runner.push(
            "psql",
            Script::success().stdout(&format!(
                "{}\n{}\n",
                row(&["public", "orders", "1200", "98304"]),
                row(&["public", "users", "40", "16384"])
            )),
        );
        let catalog = PsqlCatalog::new(Arc::new(runner.clone()), Some(PathBuf::from("psql")));

        let structure = catalog.read_structure(&profile()).await.unwrap();
        assert_eq!(structure.schemas.len(), 2);
        assert_eq!(structure.schemas[0].name, "public");
        assert_eq!(structure.schemas[0].table_count, 2);
        assert_eq!(structure.tables[0].qualified_name(), "public.orders");
        assert_eq!(structure.tables[0].row_count, 1200);
        assert_eq!(structure.tables[1].size, 16384);

        let inv = &runner.invocations()[0];
        assert_eq!(inv.arg_value("-d"), Some("host=localhost port=5432 dbname=shop user=postgres"));
        assert!(inv.envs.iter().any(|(k, v)| k == "PGPASSWORD" && v == "pw"));
        assert!(inv.envs.iter().any(|(k, v)| k == "PGOPTIONS" && v.contains("read_only")));
    }

    #[tokio::test]
    async fn test_query_failure_is_catalog_error() {
        let runner = ScriptedRunner::new();
        runner.push("psql", Script::failure(2, "psql: error: connection refused"));
        let catalog = PsqlCatalog::new(Arc::new(runner), Some(PathBuf::from("psql")));

        let err = catalog.read_structure(&profile()).await.unwrap_err();
        assert!(matches!(err, EngineError::Catalog(ref msg) if msg.contains("connection refused")));
    }

    #[tokio::test]
    async fn test_missing_psql_is_catalog_error() {
        let catalog = PsqlCatalog::new(Arc::new(ScriptedRunner::new()), None);
        let err = catalog.read_structure(&profile()).await.unwrap_err();
        assert!(matches!(err, EngineError::Catalog(_)));
    }

    #[tokio::test]
    async fn test_exact_row_counts() {
        let runner = ScriptedRunner::new();
        runner.push(
            "psql",
            Script::success().stdout(&format!(
                "{}\n{}\n",
                row(&["public.users", "40"]),
                row(&["public.orders", "7"])
            )),
        );
        let catalog = PsqlCatalog::new(Arc::new(runner), Some(PathBuf::from("psql")));
        let tables = vec![
            QualifiedName::new("public", "users"),
            QualifiedName::new("public", "orders"),
        ];
        let counts = catalog.exact_row_counts(&profile(), &tables).await.unwrap();
        assert_eq!(counts[0], (QualifiedName::new("public", "users"), 40));
        assert_eq!(counts[1].1, 7);
    }

    #[tokio::test]
    async fn test_probe() {
        let runner = ScriptedRunner::new();
        runner
            .push("psql", Script::success().stdout(" PostgreSQL 16.2 on x86_64-pc-linux-gnu\n"))
            .push("psql", Script::success().stdout("8413999\n"))
            .push("psql", Script::success().stdout(&row(&["public", "1"])))
            .push("psql", Script::success().stdout(&row(&["public", "users", "3", "8192"])));
        let catalog = PsqlCatalog::new(Arc::new(runner), Some(PathBuf::from("psql")));

        let info = catalog.probe(&profile()).await.unwrap();
        assert_eq!(info.version, "PostgreSQL 16.2 on x86_64-pc-linux-gnu");
        assert_eq!(info.total_size, 8413999);
        assert_eq!(info.tables.len(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_abandoned_query_kills_psql() {
        use crate::process::TokioProcessRunner;
        use std::os::unix::fs::PermissionsExt;
        use std::time::Duration;

        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("psql.pid");
        let fake_psql = dir.path().join("psql");
        std::fs::write(
            &fake_psql,
            format!("#!/bin/sh\necho $$ > '{}'\nexec sleep 30\n", pid_file.display()),
        )
        .unwrap();
        std::fs::set_permissions(&fake_psql, std::fs::Permissions::from_mode(0o755)).unwrap();

        let catalog = PsqlCatalog::new(Arc::new(TokioProcessRunner::new()), Some(fake_psql));
        let profile = profile();
        let read_pid = async {
            loop {
                if let Ok(text) = std::fs::read_to_string(&pid_file) {
                    if let Ok(pid) = text.trim().parse::<u32>() {
                        return pid;
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        let pid = tokio::select! {
            result = catalog.read_structure(&profile) => panic!("query finished: {:?}", result),
            pid = read_pid => pid,
        };

        let alive = |pid: u32| {
            std::process::Command::new("kill")
                .args(["-0", &pid.to_string()])
                .stderr(std::process::Stdio::null())
                .status()
                .map(|s| s.success())
                .unwrap_or(false)
        };
        for _ in 0..100 {
            if !alive(pid) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("psql {} still running after its query was dropped", pid);
    }
}
