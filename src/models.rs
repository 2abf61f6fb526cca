// ABOUTME: Data structures shared by the clone pipeline, schema export and history
// ABOUTME: Serialized as camelCase JSON for the UI and the persistence store

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Random 128-bit identifier rendered as lowercase hex.
pub fn generate_id() -> String {
    let bytes: [u8; 16] = rand::thread_rng().gen();
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn default_port() -> u16 {
    5432
}

#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionProfile {
    pub id: String,
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub database: String,
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub ssl: bool,
    #[serde(default)]
    pub tag_id: Option<String>,
}

impl ConnectionProfile {
    /// libpq keyword/value connection string. The password travels in the
    /// environment instead so it never shows up in a process listing.
    pub fn conninfo(&self) -> String {
        format!(
            "host={} port={} dbname={} user={}",
            conninfo_value(&self.host),
            self.port,
            conninfo_value(&self.database),
            conninfo_value(&self.user)
        )
    }

    pub fn ssl_mode(&self) -> &'static str {
        if self.ssl {
            "require"
        } else {
            "prefer"
        }
    }

    /// Environment handed to every psql/pg_dump/pg_restore invocation.
    pub fn libpq_env(&self) -> Vec<(String, String)> {
        vec![
            ("PGPASSWORD".to_string(), self.password.clone()),
            ("PGSSLMODE".to_string(), self.ssl_mode().to_string()),
            ("PGCONNECT_TIMEOUT".to_string(), "30".to_string()),
        ]
    }

    /// `host:port/database`, used in log lines.
    pub fn location(&self) -> String {
        format!("{}:{}/{}", self.host, self.port, self.database)
    }
}

impl fmt::Debug for ConnectionProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionProfile")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("ssl", &self.ssl)
            .field("tag_id", &self.tag_id)
            .finish()
    }
}

fn conninfo_value(value: &str) -> String {
    let needs_quotes =
        value.is_empty() || value.chars().any(|c| c.is_whitespace() || c == '\'' || c == '\\');
    if !needs_quotes {
        return value.to_string();
    }
    let escaped = value.replace('\\', "\\\\").replace('\'', "\\'");
    format!("'{}'", escaped)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloneType {
    Structure,
    Data,
    Both,
}

impl CloneType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloneType::Structure => "structure",
            CloneType::Data => "data",
            CloneType::Both => "both",
        }
    }

    pub fn includes_structure(&self) -> bool {
        matches!(self, CloneType::Structure | CloneType::Both)
    }

    pub fn includes_data(&self) -> bool {
        matches!(self, CloneType::Data | CloneType::Both)
    }
}

impl fmt::Display for CloneType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CloneType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "structure" | "schema" => Ok(CloneType::Structure),
            "data" => Ok(CloneType::Data),
            "both" | "full" => Ok(CloneType::Both),
            other => Err(format!(
                "unknown clone type '{}', expected structure, data or both",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloneOptions {
    pub source_id: String,
    pub destination_id: String,
    #[serde(default)]
    pub clean_destination: bool,
    #[serde(default)]
    pub create_backup: bool,
    pub clone_type: CloneType,
    /// Qualified `schema.table` names left out of the dump entirely.
    #[serde(default)]
    pub exclude_tables: BTreeSet<String>,
}

/// Pipeline stage. `Completed`, `Error` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Preparing,
    Backup,
    Cleaning,
    Dumping,
    Restoring,
    Verifying,
    Completed,
    Error,
    Cancelled,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Preparing => "preparing",
            Stage::Backup => "backup",
            Stage::Cleaning => "cleaning",
            Stage::Dumping => "dumping",
            Stage::Restoring => "restoring",
            Stage::Verifying => "verifying",
            Stage::Completed => "completed",
            Stage::Error => "error",
            Stage::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Completed | Stage::Error | Stage::Cancelled)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloneProgress {
    pub stage: Stage,
    pub progress: u8,
    pub message: String,
    pub is_complete: bool,
    pub is_error: bool,
}

impl CloneProgress {
    pub fn new(stage: Stage, progress: u8, message: impl Into<String>) -> Self {
        Self {
            stage,
            progress: progress.min(100),
            message: message.into(),
            is_complete: stage.is_terminal(),
            is_error: stage == Stage::Error,
        }
    }

    pub fn preparing() -> Self {
        Self::new(Stage::Preparing, 0, "Preparing clone operation...")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
    Success,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
            LogLevel::Success => "SUCCESS",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

impl LogLine {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            message: message.into(),
        }
    }
}

impl fmt::Display for LogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.level, self.message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloneStatus {
    Success,
    Error,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloneHistoryEntry {
    pub id: String,
    pub source_id: String,
    pub source_name: String,
    pub destination_id: String,
    pub destination_name: String,
    pub clone_type: CloneType,
    pub status: CloneStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    /// Whole seconds between start and completion.
    pub duration: i64,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub backup_path: Option<String>,
    #[serde(default)]
    pub logs: Vec<LogLine>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaExportOptions {
    pub profile_id: String,
    /// Empty means every schema.
    #[serde(default)]
    pub schemas: Vec<String>,
    /// Qualified `schema.table`; empty means every table.
    #[serde(default)]
    pub tables: Vec<String>,
    #[serde(default = "default_true")]
    pub include_comments: bool,
    #[serde(default = "default_true")]
    pub include_indexes: bool,
    #[serde(default = "default_true")]
    pub include_constraints: bool,
    #[serde(default = "default_true")]
    pub include_triggers: bool,
    #[serde(default = "default_true")]
    pub include_sequences: bool,
    #[serde(default = "default_true")]
    pub include_types: bool,
    #[serde(default = "default_true")]
    pub include_functions: bool,
    #[serde(default = "default_true")]
    pub include_views: bool,
}

impl SchemaExportOptions {
    pub fn new(profile_id: impl Into<String>) -> Self {
        Self {
            profile_id: profile_id.into(),
            schemas: Vec::new(),
            tables: Vec::new(),
            include_comments: true,
            include_indexes: true,
            include_constraints: true,
            include_triggers: true,
            include_sequences: true,
            include_types: true,
            include_functions: true,
            include_views: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaInfo {
    pub name: String,
    pub table_count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableInfo {
    pub schema: String,
    pub name: String,
    /// Planner estimate, not an exact count.
    pub row_count: i64,
    pub size: i64,
}

impl TableInfo {
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseStructure {
    pub schemas: Vec<SchemaInfo>,
    pub tables: Vec<TableInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseInfo {
    pub version: String,
    pub total_size: i64,
    pub tables: Vec<TableInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedOperation {
    pub id: String,
    pub name: String,
    pub source_id: String,
    pub destination_id: String,
    pub clean_destination: bool,
    pub create_backup: bool,
    pub clone_type: CloneType,
    #[serde(default)]
    pub exclude_tables: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
}

impl SavedOperation {
    pub fn new(name: impl Into<String>, options: &CloneOptions) -> Self {
        Self {
            id: generate_id(),
            name: name.into(),
            source_id: options.source_id.clone(),
            destination_id: options.destination_id.clone(),
            clean_destination: options.clean_destination,
            create_backup: options.create_backup,
            clone_type: options.clone_type,
            exclude_tables: options.exclude_tables.clone(),
            created_at: Utc::now(),
        }
    }

    pub fn to_clone_options(&self) -> CloneOptions {
        CloneOptions {
            source_id: self.source_id.clone(),
            destination_id: self.destination_id.clone(),
            clean_destination: self.clean_destination,
            create_backup: self.create_backup,
            clone_type: self.clone_type,
            exclude_tables: self.exclude_tables.clone(),
        }
    }
}
