// ABOUTME: Post-restore comparison of source and destination catalogs
// ABOUTME: Findings are advisory; a clone never fails because of them

use std::collections::HashSet;

use crate::catalog::CatalogReader;
use crate::error::Result;
use crate::ident::QualifiedName;
use crate::models::{CloneType, ConnectionProfile, DatabaseStructure, TableInfo};

/// Names listed in a mismatch message before it is truncated.
const MAX_LISTED: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowCheck {
    pub table: QualifiedName,
    pub source: i64,
    pub destination: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerificationReport {
    /// Source tables that should have been cloned.
    pub expected_tables: usize,
    pub destination_tables: usize,
    pub row_checks: Vec<RowCheck>,
    pub mismatches: Vec<String>,
}

impl VerificationReport {
    pub fn is_clean(&self) -> bool {
        self.mismatches.is_empty()
    }
}

pub struct Verifier<'a> {
    pub catalog: &'a dyn CatalogReader,
    pub source: &'a ConnectionProfile,
    pub destination: &'a ConnectionProfile,
    pub clone_type: CloneType,
    pub clean_destination: bool,
    pub excluded: &'a [QualifiedName],
    /// How many of the smallest tables get an exact row count on both sides.
    pub sample: usize,
}

fn qualified(table: &TableInfo) -> QualifiedName {
    QualifiedName::new(&table.schema, &table.name)
}

fn listing(names: &[QualifiedName]) -> String {
    let mut shown: Vec<String> = names.iter().take(MAX_LISTED).map(|n| n.to_string()).collect();
    if names.len() > MAX_LISTED {
        shown.push(format!("and {} more", names.len() - MAX_LISTED));
    }
    shown.join(", ")
}

impl Verifier<'_> {
    /// Compare catalogs. `source_snapshot` is reused when the caller already
    /// read the source during preparation.
    pub async fn run(&self, source_snapshot: Option<DatabaseStructure>) -> Result<VerificationReport> {
        let source = match source_snapshot {
            Some(snapshot) => snapshot,
            None => self.catalog.read_structure(self.source).await?,
        };
        let destination = self.catalog.read_structure(self.destination).await?;

        let excluded: HashSet<&QualifiedName> = self.excluded.iter().collect();
        let present: HashSet<QualifiedName> = destination.tables.iter().map(qualified).collect();
        let expected: Vec<&TableInfo> = source
            .tables
            .iter()
            .filter(|t| !excluded.contains(&qualified(t)))
            .collect();

        let mut report = VerificationReport {
            expected_tables: expected.len(),
            destination_tables: destination.tables.len(),
            ..Default::default()
        };

        let missing: Vec<QualifiedName> = expected
            .iter()
            .map(|t| qualified(t))
            .filter(|name| !present.contains(name))
            .collect();
        if !missing.is_empty() {
            report.mismatches.push(format!(
                "{} of {} source tables missing in destination: {}",
                missing.len(),
                expected.len(),
                listing(&missing)
            ));
        }

        if self.clone_type.includes_structure() && self.clean_destination {
            let leaked: Vec<QualifiedName> = self
                .excluded
                .iter()
                .filter(|name| present.contains(*name))
                .cloned()
                .collect();
            if !leaked.is_empty() {
                report.mismatches.push(format!(
                    "Excluded tables present in cleaned destination: {}",
                    listing(&leaked)
                ));
            }
        }

        if self.clone_type.includes_data() && self.sample > 0 {
            let mut candidates: Vec<&TableInfo> = expected
                .into_iter()
                .filter(|t| present.contains(&qualified(t)))
                .collect();
            candidates.sort_by(|a, b| {
                a.size
                    .cmp(&b.size)
                    .then_with(|| a.schema.cmp(&b.schema))
                    .then_with(|| a.name.cmp(&b.name))
            });
            let sample: Vec<QualifiedName> = candidates
                .into_iter()
                .take(self.sample)
                .map(qualified)
                .collect();

            let source_counts = self.catalog.exact_row_counts(self.source, &sample).await?;
            let destination_counts = self
                .catalog
                .exact_row_counts(self.destination, &sample)
                .await?;
            for ((table, source), (_, destination)) in source_counts.into_iter().zip(destination_counts) {
                if source != destination {
                    report.mismatches.push(format!(
                        "Row count mismatch for {}: source {} rows, destination {} rows",
                        table, source, destination
                    ));
                }
                report.row_checks.push(RowCheck {
                    table,
                    source,
                    destination,
                });
            }
        }

        Ok(report)
    }
}
