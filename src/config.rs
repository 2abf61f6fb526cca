// ABOUTME: TOML configuration: connection profiles, tool overrides and engine settings
// ABOUTME: Also provides the profile lookup the engine resolves source/destination ids against

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::engine::EngineSettings;
use crate::error::EngineError;
use crate::models::ConnectionProfile;
use crate::tools::ToolPaths;

const APP_DIR: &str = "pgclone";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CatalogBackend {
    /// Catalog queries through the psql binary.
    #[default]
    Psql,
    /// Catalog queries over a direct tokio-postgres connection.
    Native,
}

fn default_history_limit() -> usize {
    50
}

fn default_verify_sample() -> usize {
    3
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub backup_dir: Option<PathBuf>,
    #[serde(default)]
    pub data_file: Option<PathBuf>,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default)]
    pub parallel_jobs: Option<usize>,
    #[serde(default = "default_verify_sample")]
    pub verify_sample: usize,
    #[serde(default)]
    pub catalog_backend: CatalogBackend,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backup_dir: None,
            data_file: None,
            history_limit: default_history_limit(),
            parallel_jobs: None,
            verify_sample: default_verify_sample(),
            catalog_backend: CatalogBackend::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub tools: ToolPaths,
    #[serde(default)]
    pub profiles: Vec<ConnectionProfile>,
}

impl Config {
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_DIR).join("config.toml"))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).context("Failed to parse config TOML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// An explicit path must exist; the default location may be absent.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> std::result::Result<(), EngineError> {
        let mut seen = HashSet::new();
        for profile in &self.profiles {
            if profile.id.trim().is_empty() {
                return Err(EngineError::Config(format!(
                    "profile '{}' has an empty id",
                    profile.name
                )));
            }
            if !seen.insert(profile.id.as_str()) {
                return Err(EngineError::Config(format!(
                    "duplicate profile id '{}'",
                    profile.id
                )));
            }
        }
        if self.engine.parallel_jobs == Some(0) {
            return Err(EngineError::Config(
                "engine.parallel_jobs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.engine
            .backup_dir
            .clone()
            .unwrap_or_else(|| data_dir().join("backups"))
    }

    pub fn data_file(&self) -> PathBuf {
        self.engine
            .data_file
            .clone()
            .unwrap_or_else(|| data_dir().join("data.json"))
    }

    pub fn parallel_jobs(&self) -> usize {
        self.engine.parallel_jobs.unwrap_or_else(default_parallel_jobs)
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            backup_dir: self.backup_dir(),
            parallel_jobs: self.parallel_jobs(),
            verify_sample: self.engine.verify_sample,
        }
    }

    pub fn profile_book(&self) -> ProfileBook {
        ProfileBook::new(self.profiles.clone())
    }
}

fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_DIR)
}

/// CPU count clamped to 2..=8 so a restore never swamps the server.
pub fn default_parallel_jobs() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        .clamp(2, 8)
}

/// Lookup of connection profiles by id.
pub trait ProfileSource: Send + Sync {
    fn profile(&self, id: &str) -> Option<ConnectionProfile>;
}

/// In-memory profile store. Lookups return copies, so a run that resolved
/// its profiles is unaffected by later edits.
#[derive(Debug, Clone, Default)]
pub struct ProfileBook {
    profiles: Arc<RwLock<HashMap<String, ConnectionProfile>>>,
}

impl ProfileBook {
    pub fn new(profiles: Vec<ConnectionProfile>) -> Self {
        let map = profiles.into_iter().map(|p| (p.id.clone(), p)).collect();
        Self {
            profiles: Arc::new(RwLock::new(map)),
        }
    }

    pub fn upsert(&self, profile: ConnectionProfile) {
        self.profiles
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(profile.id.clone(), profile);
    }

    pub fn remove(&self, id: &str) -> Option<ConnectionProfile> {
        self.profiles
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
    }

    /// All profiles sorted by name.
    pub fn list(&self) -> Vec<ConnectionProfile> {
        let mut profiles: Vec<ConnectionProfile> = self
            .profiles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        profiles.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        profiles
    }
}

impl ProfileSource for ProfileBook {
    fn profile(&self, id: &str) -> Option<ConnectionProfile> {
        self.profiles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }
}
