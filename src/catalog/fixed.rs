// ABOUTME: In-memory CatalogReader keyed by profile id, for tests and dry runs
// ABOUTME: Profiles without a configured structure behave like unreachable servers

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use super::CatalogReader;
use crate::error::{EngineError, Result};
use crate::ident::QualifiedName;
use crate::models::{ConnectionProfile, DatabaseInfo, DatabaseStructure, SchemaInfo, TableInfo};

#[derive(Debug, Clone, Default)]
pub struct FixedCatalog {
    structures: HashMap<String, DatabaseStructure>,
    counts: HashMap<(String, QualifiedName), i64>,
    delays: HashMap<String, Duration>,
}

impl FixedCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_structure(mut self, profile_id: &str, structure: DatabaseStructure) -> Self {
        self.structures.insert(profile_id.to_string(), structure);
        self
    }

    /// Shorthand: tables as `(schema.table, size)`; schema counts are derived.
    pub fn with_tables(self, profile_id: &str, tables: &[(&str, i64)]) -> Self {
        let tables: Vec<TableInfo> = tables
            .iter()
            .filter_map(|(name, size)| {
                let name = QualifiedName::parse(name).ok()?;
                Some(TableInfo {
                    schema: name.schema,
                    name: name.table,
                    row_count: 0,
                    size: *size,
                })
            })
            .collect();
        let mut schemas: Vec<SchemaInfo> = Vec::new();
        for table in &tables {
            match schemas.iter_mut().find(|s| s.name == table.schema) {
                Some(schema) => schema.table_count += 1,
                None => schemas.push(SchemaInfo {
                    name: table.schema.clone(),
                    table_count: 1,
                }),
            }
        }
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        self.with_structure(profile_id, DatabaseStructure { schemas, tables })
    }

    pub fn with_count(mut self, profile_id: &str, table: &str, count: i64) -> Self {
        if let Ok(name) = QualifiedName::parse(table) {
            self.counts.insert((profile_id.to_string(), name), count);
        }
        self
    }

    /// Every read against `profile_id` waits `delay` first, like a slow server.
    pub fn with_delay(mut self, profile_id: &str, delay: Duration) -> Self {
        self.delays.insert(profile_id.to_string(), delay);
        self
    }

    async fn stall(&self, profile: &ConnectionProfile) {
        if let Some(delay) = self.delays.get(&profile.id) {
            tokio::time::sleep(*delay).await;
        }
    }

    fn structure(&self, profile: &ConnectionProfile) -> Result<DatabaseStructure> {
        self.structures.get(&profile.id).cloned().ok_or_else(|| {
            EngineError::catalog(format!("Failed to connect to {}", profile.location()))
        })
    }
}

#[async_trait]
impl CatalogReader for FixedCatalog {
    async fn read_structure(&self, profile: &ConnectionProfile) -> Result<DatabaseStructure> {
        self.stall(profile).await;
        self.structure(profile)
    }

    async fn probe(&self, profile: &ConnectionProfile) -> Result<DatabaseInfo> {
        let structure = self.structure(profile)?;
        Ok(DatabaseInfo {
            version: "PostgreSQL 16.0".to_string(),
            total_size: structure.tables.iter().map(|t| t.size).sum(),
            tables: structure.tables,
        })
    }

    async fn exact_row_counts(
        &self,
        profile: &ConnectionProfile,
        tables: &[QualifiedName],
    ) -> Result<Vec<(QualifiedName, i64)>> {
        self.stall(profile).await;
        self.structure(profile)?;
        Ok(tables
            .iter()
            .map(|table| {
                let count = self
                    .counts
                    .get(&(profile.id.clone(), table.clone()))
                    .copied()
                    .unwrap_or(0);
                (table.clone(), count)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(id: &str) -> ConnectionProfile {
        ConnectionProfile {
            id: id.to_string(),
            name: id.to_string(),
            host: "localhost".to_string(),
            port: 5432,
            database: id.to_string(),
            user: "postgres".to_string(),
            password: String::new(),
            ssl: false,
            tag_id: None,
        }
    }

    #[tokio::test]
    async fn test_with_tables_derives_schemas() {
        let catalog = FixedCatalog::new().with_tables(
            "src",
            &[("public.users", 10), ("audit.log", 5), ("public.orders", 20)],
        );
        let structure = catalog.read_structure(&profile("src")).await.unwrap();
        assert_eq!(structure.schemas.len(), 2);
        assert_eq!(structure.schemas[0].name, "audit");
        assert_eq!(structure.schemas[1].table_count, 2);
        assert_eq!(structure.tables.len(), 3);
    }

    #[tokio::test]
    async fn test_delay_holds_reads_back() {
        let catalog = FixedCatalog::new()
            .with_tables("src", &[("public.users", 10)])
            .with_delay("src", Duration::from_millis(50));
        let started = tokio::time::Instant::now();
        catalog.read_structure(&profile("src")).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_unknown_profile_is_unreachable() {
        let catalog = FixedCatalog::new();
        let err = catalog.read_structure(&profile("nope")).await.unwrap_err();
        assert!(matches!(err, EngineError::Catalog(_)));
    }
}
