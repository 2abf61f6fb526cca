// ABOUTME: Command-line surface: argument definitions and one handler per subcommand
// ABOUTME: Wires config, detected tools, catalog backend and the JSON store into an Engine

mod render;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use dialoguer::Confirm;
use pgclone::catalog::{CatalogReader, PostgresCatalog, PsqlCatalog};
use pgclone::cancel::CancelHandle;
use pgclone::clone::format_size;
use pgclone::config::{CatalogBackend, Config, ProfileBook, ProfileSource};
use pgclone::history::JsonStore;
use pgclone::models::{
    CloneHistoryEntry, CloneOptions, CloneStatus, CloneType, SavedOperation, SchemaExportOptions,
};
use pgclone::process::{ProcessRunner, TokioProcessRunner};
use pgclone::tools::{client_version, Tool, ToolPaths};
use pgclone::Engine;
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;

#[derive(Parser, Debug)]
#[command(name = "pgclone", version, about = "Clone PostgreSQL databases and export schemas")]
pub struct Cli {
    /// Config file (defaults to the platform config dir)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level when RUST_LOG is unset
    #[arg(long, global = true, default_value = "warn")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Clone one profile's database into another
    Clone {
        #[command(flatten)]
        clone: CloneArgs,
        /// Skip the confirmation prompt for --clean
        #[arg(short, long)]
        yes: bool,
        /// Print every tool output line
        #[arg(short, long)]
        verbose: bool,
    },
    /// Export schema DDL
    Schema(SchemaArgs),
    /// List schemas and tables of a profile's database
    Structure {
        #[arg(long)]
        profile: String,
    },
    /// Server version and size of a profile's database
    Probe {
        #[arg(long)]
        profile: String,
    },
    /// Show detected client tools
    Tools,
    /// Clone history
    History {
        #[command(subcommand)]
        action: HistoryAction,
    },
    /// Saved clone operations
    Ops {
        #[command(subcommand)]
        action: OpsAction,
    },
}

#[derive(Args, Debug, Clone)]
pub struct CloneArgs {
    /// Source profile id
    #[arg(long = "from")]
    pub source: String,
    /// Destination profile id
    #[arg(long = "to")]
    pub destination: String,
    /// structure, data or both
    #[arg(long = "type", default_value = "both")]
    pub clone_type: CloneType,
    /// Clear the destination before restoring
    #[arg(long)]
    pub clean: bool,
    /// Back up the destination first
    #[arg(long)]
    pub backup: bool,
    /// Table to skip, as schema.table (repeatable)
    #[arg(long = "exclude", value_name = "SCHEMA.TABLE")]
    pub exclude: Vec<String>,
}

impl CloneArgs {
    fn to_options(&self) -> CloneOptions {
        CloneOptions {
            source_id: self.source.clone(),
            destination_id: self.destination.clone(),
            clean_destination: self.clean,
            create_backup: self.backup,
            clone_type: self.clone_type,
            exclude_tables: self.exclude.iter().cloned().collect(),
        }
    }
}

#[derive(Args, Debug)]
pub struct SchemaArgs {
    #[arg(long)]
    pub profile: String,
    /// Limit to these schemas (repeatable)
    #[arg(long = "schema")]
    pub schemas: Vec<String>,
    /// Limit to these tables, as schema.table (repeatable)
    #[arg(long = "table")]
    pub tables: Vec<String>,
    #[arg(long)]
    pub no_comments: bool,
    #[arg(long)]
    pub no_indexes: bool,
    #[arg(long)]
    pub no_constraints: bool,
    #[arg(long)]
    pub no_triggers: bool,
    #[arg(long)]
    pub no_sequences: bool,
    #[arg(long)]
    pub no_types: bool,
    #[arg(long)]
    pub no_functions: bool,
    #[arg(long)]
    pub no_views: bool,
    /// Write to a file instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

impl SchemaArgs {
    fn to_options(&self) -> SchemaExportOptions {
        SchemaExportOptions {
            schemas: self.schemas.clone(),
            tables: self.tables.clone(),
            include_comments: !self.no_comments,
            include_indexes: !self.no_indexes,
            include_constraints: !self.no_constraints,
            include_triggers: !self.no_triggers,
            include_sequences: !self.no_sequences,
            include_types: !self.no_types,
            include_functions: !self.no_functions,
            include_views: !self.no_views,
            ..SchemaExportOptions::new(self.profile.clone())
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum HistoryAction {
    /// Most recent runs first
    List,
    /// One run with its log trail; accepts an id prefix
    Show { id: String },
    /// Delete all history entries
    Clear,
}

#[derive(Subcommand, Debug)]
pub enum OpsAction {
    List,
    /// Save a clone configuration under a name
    Save {
        name: String,
        #[command(flatten)]
        clone: CloneArgs,
    },
    /// Delete by id or name
    Delete { id: String },
    /// Run a saved operation, by id or name
    Run {
        id: String,
        #[arg(short, long)]
        yes: bool,
        #[arg(short, long)]
        verbose: bool,
    },
}

struct App {
    profiles: Arc<ProfileBook>,
    tools: ToolPaths,
    runner: Arc<dyn ProcessRunner>,
    store: Arc<JsonStore>,
    engine: Engine,
}

impl App {
    fn build(config_path: Option<&Path>) -> Result<Self> {
        let config = Config::load_or_default(config_path)?;
        let tools = ToolPaths::detect().with_overrides(&config.tools);
        let runner: Arc<dyn ProcessRunner> = Arc::new(TokioProcessRunner::new());
        let catalog: Arc<dyn CatalogReader> = match config.engine.catalog_backend {
            CatalogBackend::Psql => Arc::new(PsqlCatalog::new(
                Arc::clone(&runner),
                tools.psql.clone(),
            )),
            CatalogBackend::Native => Arc::new(PostgresCatalog::new()),
        };
        let store = Arc::new(JsonStore::new(
            config.data_file(),
            config.engine.history_limit,
        ));
        let profiles = Arc::new(config.profile_book());

        tracing::debug!(
            data_file = %store.path().display(),
            profiles = profiles.list().len(),
            "Loaded configuration"
        );

        let engine = Engine::new(
            profiles.clone(),
            tools.clone(),
            Arc::clone(&runner),
            catalog,
            store.clone(),
            config.engine_settings(),
        );

        Ok(Self {
            profiles,
            tools,
            runner,
            store,
            engine,
        })
    }
}

pub async fn run(cli: Cli) -> Result<()> {
    let app = App::build(cli.config.as_deref())?;

    match cli.command {
        Commands::Clone {
            clone,
            yes,
            verbose,
        } => run_clone(&app, clone.to_options(), yes, verbose).await,
        Commands::Schema(args) => export_schema(&app, &args).await,
        Commands::Structure { profile } => show_structure(&app, &profile).await,
        Commands::Probe { profile } => probe(&app, &profile).await,
        Commands::Tools => show_tools(&app).await,
        Commands::History { action } => history(&app, action),
        Commands::Ops { action } => ops(&app, action).await,
    }
}

fn cancel_on_ctrl_c(cancel: CancelHandle) -> JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Cancelling...");
            cancel.cancel();
        }
    })
}

fn confirm_clean(app: &App, options: &CloneOptions) -> Result<bool> {
    let Some(destination) = app.profiles.profile(&options.destination_id) else {
        // Unknown ids are reported by start_clone.
        return Ok(true);
    };
    let prompt = format!(
        "This drops existing objects in '{}' ({}). Continue?",
        destination.name,
        destination.location()
    );
    Confirm::new()
        .with_prompt(prompt)
        .default(false)
        .interact()
        .context("Failed to read confirmation")
}

async fn run_clone(app: &App, options: CloneOptions, yes: bool, verbose: bool) -> Result<()> {
    if options.clean_destination && !yes && !confirm_clean(app, &options)? {
        eprintln!("Aborted.");
        return Ok(());
    }

    let mut run = app.engine.start_clone(options)?;
    let watcher = cancel_on_ctrl_c(run.cancel_handle());
    render::follow(run.events(), verbose).await;
    watcher.abort();

    let entry = run.wait().await?;
    print_entry(&entry);
    match entry.status {
        CloneStatus::Success => Ok(()),
        CloneStatus::Cancelled => bail!("Clone cancelled"),
        CloneStatus::Error => bail!(
            "{}",
            entry
                .error_message
                .unwrap_or_else(|| "Clone failed".to_string())
        ),
    }
}

async fn export_schema(app: &App, args: &SchemaArgs) -> Result<()> {
    let mut run = app.engine.start_schema_export(args.to_options())?;
    let watcher = cancel_on_ctrl_c(run.cancel_handle());
    render::follow(run.events(), false).await;
    watcher.abort();

    let sql = run.wait().await?;
    let digest = Sha256::digest(sql.as_bytes());

    match &args.output {
        Some(path) => {
            tokio::fs::write(path, &sql)
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;
            eprintln!(
                "Wrote {} to {} (sha256 {:x})",
                format_size(sql.len() as u64),
                path.display(),
                digest
            );
        }
        None => {
            print!("{}", sql);
            eprintln!("sha256 {:x}", digest);
        }
    }
    Ok(())
}

async fn show_structure(app: &App, profile: &str) -> Result<()> {
    let structure = app.engine.database_structure(profile).await?;
    for schema in &structure.schemas {
        println!("{} ({} tables)", schema.name, schema.table_count);
        for table in structure.tables.iter().filter(|t| t.schema == schema.name) {
            println!(
                "  {:<40} {:>12} rows {:>10}",
                table.name,
                table.row_count,
                format_size(table.size.max(0) as u64)
            );
        }
    }
    Ok(())
}

async fn probe(app: &App, profile: &str) -> Result<()> {
    let info = app.engine.probe(profile).await?;
    println!("Version: {}", info.version);
    println!("Size:    {}", format_size(info.total_size.max(0) as u64));
    println!("Tables:  {}", info.tables.len());
    Ok(())
}

async fn show_tools(app: &App) -> Result<()> {
    for tool in Tool::ALL {
        match app.tools.get(tool) {
            Some(path) => println!("{:<11} {}", tool.name(), path.display()),
            None => println!("{:<11} not found", tool.name()),
        }
    }
    match client_version(app.runner.as_ref(), &app.tools).await {
        Ok(version) => println!("Client:     {}", version),
        Err(e) => println!("Client:     unknown ({})", e),
    }
    Ok(())
}

fn print_entry(entry: &CloneHistoryEntry) {
    println!(
        "{}  {}  {} -> {}  {}  {:?}  {}s",
        &entry.id[..entry.id.len().min(8)],
        entry.started_at.format("%Y-%m-%d %H:%M:%S"),
        entry.source_name,
        entry.destination_name,
        entry.clone_type,
        entry.status,
        entry.duration
    );
    if let Some(path) = &entry.backup_path {
        println!("    backup: {}", path);
    }
}

fn history(app: &App, action: HistoryAction) -> Result<()> {
    match action {
        HistoryAction::List => {
            let entries = app.store.history()?;
            if entries.is_empty() {
                println!("No clone history.");
            }
            for entry in &entries {
                print_entry(entry);
            }
        }
        HistoryAction::Show { id } => {
            let Some(entry) = app.store.history_entry(&id)? else {
                bail!("No history entry matches '{}'", id);
            };
            print_entry(&entry);
            if let Some(message) = &entry.error_message {
                println!("    error: {}", message);
            }
            for line in &entry.logs {
                println!("{} {}", line.timestamp.format("%H:%M:%S"), line);
            }
        }
        HistoryAction::Clear => {
            let removed = app.store.clear_history()?;
            println!("Removed {} history entries.", removed);
        }
    }
    Ok(())
}

async fn ops(app: &App, action: OpsAction) -> Result<()> {
    match action {
        OpsAction::List => {
            let operations = app.store.operations()?;
            if operations.is_empty() {
                println!("No saved operations.");
            }
            for op in operations {
                println!(
                    "{}  {:<24} {} -> {}  {}{}{}",
                    &op.id[..op.id.len().min(8)],
                    op.name,
                    op.source_id,
                    op.destination_id,
                    op.clone_type,
                    if op.clean_destination { " clean" } else { "" },
                    if op.create_backup { " backup" } else { "" },
                );
            }
        }
        OpsAction::Save { name, clone } => {
            for id in [&clone.source, &clone.destination] {
                if app.profiles.profile(id).is_none() {
                    bail!("Unknown connection '{}'", id);
                }
            }
            let operation = SavedOperation::new(name, &clone.to_options());
            app.store.save_operation(operation.clone())?;
            println!("Saved '{}' ({})", operation.name, operation.id);
        }
        OpsAction::Delete { id } => {
            if !app.store.delete_operation(&id)? {
                bail!("No saved operation matches '{}'", id);
            }
            println!("Deleted '{}'", id);
        }
        OpsAction::Run { id, yes, verbose } => {
            let Some(operation) = app.store.operation(&id)? else {
                bail!("No saved operation matches '{}'", id);
            };
            run_clone(app, operation.to_clone_options(), yes, verbose).await?;
        }
    }
    Ok(())
}
