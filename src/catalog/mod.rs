// ABOUTME: Read-only catalog introspection: schemas, tables, sizes and row estimates
// ABOUTME: Two backends share one set of queries: the psql binary and a direct tokio-postgres connection

mod fixed;
mod postgres;
mod psql;

use async_trait::async_trait;

use crate::error::Result;
use crate::ident::{quote_literal, QualifiedName};
use crate::models::{ConnectionProfile, DatabaseInfo, DatabaseStructure};

pub use fixed::FixedCatalog;
pub use postgres::PostgresCatalog;
pub use psql::{PsqlCatalog, FIELD_SEPARATOR};

/// Schemas that hold user objects, with their ordinary/partitioned table count.
pub(crate) const SCHEMAS_QUERY: &str = r#"
SELECT n.nspname AS schema_name,
       COUNT(c.oid)::bigint AS table_count
FROM pg_namespace n
LEFT JOIN pg_class c ON c.relnamespace = n.oid AND c.relkind IN ('r', 'p')
WHERE n.nspname NOT IN ('pg_catalog', 'information_schema', 'pg_toast')
  AND n.nspname NOT LIKE 'pg_temp_%'
  AND n.nspname NOT LIKE 'pg_toast_temp_%'
GROUP BY n.nspname
ORDER BY n.nspname
"#;

/// Row counts come from statistics, never from scanning the table.
pub(crate) const TABLES_QUERY: &str = r#"
SELECT n.nspname AS schema_name,
       c.relname AS table_name,
       GREATEST(COALESCE(s.n_live_tup, c.reltuples::bigint, 0), 0)::bigint AS row_count,
       COALESCE(pg_total_relation_size(c.oid), 0)::bigint AS size
FROM pg_class c
JOIN pg_namespace n ON n.oid = c.relnamespace
LEFT JOIN pg_stat_user_tables s ON s.relid = c.oid
WHERE c.relkind IN ('r', 'p')
  AND n.nspname NOT IN ('pg_catalog', 'information_schema', 'pg_toast')
  AND n.nspname NOT LIKE 'pg_temp_%'
  AND n.nspname NOT LIKE 'pg_toast_temp_%'
ORDER BY n.nspname, c.relname
"#;

pub(crate) const VERSION_QUERY: &str = "SELECT version()";

pub(crate) const DATABASE_SIZE_QUERY: &str =
    "SELECT pg_database_size(current_database())::bigint";

/// Exact `count(*)` for each table, one row per table, in input order.
pub(crate) fn row_count_query(tables: &[QualifiedName]) -> String {
    tables
        .iter()
        .map(|table| {
            format!(
                "SELECT {} AS table_name, count(*)::bigint AS row_count FROM {}",
                quote_literal(&table.to_string()),
                table.quoted()
            )
        })
        .collect::<Vec<_>>()
        .join("\nUNION ALL\n")
}

/// Source of [`DatabaseStructure`] snapshots. Failures come back as
/// `EngineError::Catalog` so callers can fall back to "select all".
#[async_trait]
pub trait CatalogReader: Send + Sync {
    async fn read_structure(&self, profile: &ConnectionProfile) -> Result<DatabaseStructure>;

    /// Connection test: server version, database size and tables.
    async fn probe(&self, profile: &ConnectionProfile) -> Result<DatabaseInfo>;

    /// Exact row counts. Scans the tables, so callers keep the list short.
    async fn exact_row_counts(
        &self,
        profile: &ConnectionProfile,
        tables: &[QualifiedName],
    ) -> Result<Vec<(QualifiedName, i64)>>;
}
