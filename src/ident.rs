// ABOUTME: Qualified table names and SQL / pg_dump pattern quoting
// ABOUTME: Keeps user-supplied names exact when they reach psql and pg_dump

use std::fmt;

use crate::error::{EngineError, Result};

/// `schema.table`. An unqualified name lives in `public`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QualifiedName {
    pub schema: String,
    pub table: String,
}

impl QualifiedName {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
        }
    }

    /// Splits on the first dot; table names may themselves contain dots.
    pub fn parse(name: &str) -> Result<Self> {
        let name = name.trim();
        let (schema, table) = match name.split_once('.') {
            Some((schema, table)) => (schema.trim(), table.trim()),
            None => ("public", name),
        };
        if schema.is_empty() || table.is_empty() {
            return Err(EngineError::validation(format!(
                "'{}' is not a valid table name, expected schema.table",
                name
            )));
        }
        Ok(Self::new(schema, table))
    }

    /// `"schema"."table"` for use in SQL.
    pub fn quoted(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.table))
    }

    /// Pattern for pg_dump's `--table`/`--exclude-table`: double quotes make
    /// the match exact, case-sensitive and wildcard-free.
    pub fn dump_pattern(&self) -> String {
        self.quoted()
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Exact-match pg_dump pattern for a schema name.
pub fn schema_pattern(schema: &str) -> String {
    quote_ident(schema)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_qualified() {
        let name = QualifiedName::parse("public.orders").unwrap();
        assert_eq!(name, QualifiedName::new("public", "orders"));
        assert_eq!(name.to_string(), "public.orders");
    }

    #[test]
    fn test_parse_unqualified_defaults_to_public() {
        let name = QualifiedName::parse("users").unwrap();
        assert_eq!(name.schema, "public");
    }

    #[test]
    fn test_parse_rejects_empty_parts() {
        assert!(QualifiedName::parse("public.").is_err());
        assert!(QualifiedName::parse(".orders").is_err());
        assert!(QualifiedName::parse("  ").is_err());
    }

    #[test]
    fn test_quoting_escapes() {
        assert_eq!(quote_ident("Weird\"Name"), "\"Weird\"\"Name\"");
        assert_eq!(quote_literal("o'brien"), "'o''brien'");
        assert_eq!(
            QualifiedName::new("Sales", "Order Items").dump_pattern(),
            "\"Sales\".\"Order Items\""
        );
    }
}
