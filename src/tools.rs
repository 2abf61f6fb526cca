// ABOUTME: Locates psql, pg_dump and pg_restore on this machine
// ABOUTME: PATH first, then well-known PostgreSQL install directories; config overrides win

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{EngineError, Result};
use crate::process::{Invocation, ProcessRunner};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tool {
    Psql,
    PgDump,
    PgRestore,
}

impl Tool {
    pub const ALL: [Tool; 3] = [Tool::Psql, Tool::PgDump, Tool::PgRestore];

    pub fn name(&self) -> &'static str {
        match self {
            Tool::Psql => "psql",
            Tool::PgDump => "pg_dump",
            Tool::PgRestore => "pg_restore",
        }
    }

    fn file_name(&self) -> String {
        if cfg!(windows) {
            format!("{}.exe", self.name())
        } else {
            self.name().to_string()
        }
    }
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Resolved executable paths. `None` means the tool could not be found.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolPaths {
    #[serde(default)]
    pub psql: Option<PathBuf>,
    #[serde(default)]
    pub pg_dump: Option<PathBuf>,
    #[serde(default)]
    pub pg_restore: Option<PathBuf>,
}

impl ToolPaths {
    /// Probe the system for every tool.
    pub fn detect() -> Self {
        let dirs = install_dirs();
        Self {
            psql: find_tool(Tool::Psql, &dirs),
            pg_dump: find_tool(Tool::PgDump, &dirs),
            pg_restore: find_tool(Tool::PgRestore, &dirs),
        }
    }

    /// Explicit paths from `overrides` replace detected ones.
    pub fn with_overrides(mut self, overrides: &ToolPaths) -> Self {
        for tool in Tool::ALL {
            if let Some(path) = overrides.get(tool) {
                self.set(tool, path.to_path_buf());
            }
        }
        self
    }

    pub fn get(&self, tool: Tool) -> Option<&Path> {
        match tool {
            Tool::Psql => self.psql.as_deref(),
            Tool::PgDump => self.pg_dump.as_deref(),
            Tool::PgRestore => self.pg_restore.as_deref(),
        }
    }

    pub fn set(&mut self, tool: Tool, path: PathBuf) {
        match tool {
            Tool::Psql => self.psql = Some(path),
            Tool::PgDump => self.pg_dump = Some(path),
            Tool::PgRestore => self.pg_restore = Some(path),
        }
    }

    pub fn require(&self, tool: Tool) -> Result<&Path> {
        self.get(tool)
            .ok_or_else(|| EngineError::tool_not_found(tool.name()))
    }

    pub fn missing(&self) -> Vec<Tool> {
        Tool::ALL
            .into_iter()
            .filter(|tool| self.get(*tool).is_none())
            .collect()
    }

    /// Invocation skeleton for `tool`, or `ToolNotFound`.
    pub fn invocation(&self, tool: Tool) -> Result<Invocation> {
        Ok(Invocation::new(tool.name(), self.require(tool)?))
    }
}

/// `which` lookup, then the given install directories in order.
pub fn find_tool(tool: Tool, dirs: &[PathBuf]) -> Option<PathBuf> {
    if let Ok(path) = which::which(tool.name()) {
        debug!(tool = %tool, path = %path.display(), "Found tool on PATH");
        return Some(path);
    }
    find_tool_in(tool, dirs)
}

pub fn find_tool_in(tool: Tool, dirs: &[PathBuf]) -> Option<PathBuf> {
    let found = dirs
        .iter()
        .map(|dir| dir.join(tool.file_name()))
        .find(|candidate| candidate.is_file())?;
    debug!(tool = %tool, path = %found.display(), "Found tool in install dir");
    Some(found)
}

/// Common PostgreSQL `bin` directories, newest version first on Windows.
fn install_dirs() -> Vec<PathBuf> {
    if cfg!(windows) {
        let mut versioned: Vec<(u32, PathBuf)> = Vec::new();
        for base in [
            "C:\\Program Files\\PostgreSQL",
            "C:\\Program Files (x86)\\PostgreSQL",
        ] {
            let Ok(entries) = std::fs::read_dir(base) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                let version = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .and_then(|n| n.parse::<u32>().ok());
                let bin = path.join("bin");
                if let (Some(version), true) = (version, bin.is_dir()) {
                    versioned.push((version, bin));
                }
            }
        }
        versioned.sort_by(|a, b| b.0.cmp(&a.0));
        versioned.into_iter().map(|(_, bin)| bin).collect()
    } else {
        [
            "/usr/bin",
            "/usr/local/bin",
            "/opt/homebrew/bin",
            "/usr/local/pgsql/bin",
        ]
        .iter()
        .map(PathBuf::from)
        .collect()
    }
}

/// `psql --version`, e.g. `psql (PostgreSQL) 16.1`.
pub async fn client_version(runner: &dyn ProcessRunner, paths: &ToolPaths) -> Result<String> {
    let invocation = paths.invocation(Tool::Psql)?.arg("--version");
    let output = runner.spawn(&invocation)?.collect().await;
    if !output.exit.success() {
        return Err(EngineError::ProcessFailed {
            stage: crate::models::Stage::Preparing,
            tool: Tool::Psql.name().to_string(),
            exit_code: output.exit.code(),
            stderr_tail: output.stderr.join("\n"),
        });
    }
    Ok(output.stdout.join("\n").trim().to_string())
}
