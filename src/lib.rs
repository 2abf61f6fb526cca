// ABOUTME: pgclone library: clone PostgreSQL databases and export schemas via the client tools
// ABOUTME: The Engine in `engine` is the entry point; everything else is a collaborator it wires together

pub mod cancel;
pub mod catalog;
pub mod clone;
pub mod config;
pub mod engine;
pub mod error;
pub mod history;
pub mod ident;
pub mod logging;
pub mod models;
pub mod process;
pub mod progress;
pub mod schema;
pub mod supervisor;
pub mod tools;

pub use engine::{CloneRun, Engine, EngineSettings, SchemaExportRun};
pub use error::{EngineError, Result};
