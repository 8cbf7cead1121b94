use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use once_cell::sync::OnceCell;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::ConfigLoader;
use crate::storage;

pub mod commands;

use self::commands::{
    CacheArgs, DeleteArgs, EditArgs, ExportArgs, ImportArgs, ListArgs, NewArgs, NoteArgs, PrefsArgs,
    ShowArgs,
};

#[derive(Parser, Debug)]
#[command(
    name = "mynote",
    version,
    about = "Offline-first notes kept in a local key-value store"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Override the config file location (takes precedence over MYNOTE_CONFIG)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override the data directory (takes precedence over MYNOTE_DATA)
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Minimum log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the note cards, newest first (default)
    List(ListArgs),
    /// Create a note
    New(NewArgs),
    /// Print one note in full
    Show(ShowArgs),
    /// Change a note's title or body
    Edit(EditArgs),
    /// Delete a note
    Delete(DeleteArgs),
    /// Toggle a note's important flag
    Star(NoteArgs),
    /// Write every note to a timestamped backup file
    Export(ExportArgs),
    /// Add the notes from a backup file
    Import(ImportArgs),
    /// Show or change display preferences
    Prefs(PrefsArgs),
    /// Manage the offline response cache
    Cache(CacheArgs),
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    if let Some(path) = &cli.config {
        env::set_var("MYNOTE_CONFIG", path);
    }
    if let Some(path) = &cli.data_dir {
        env::set_var("MYNOTE_DATA", path);
    }

    let loader = ConfigLoader::discover()?;
    loader.paths().ensure_directories()?;
    let paths = loader.paths().clone();
    init_tracing(&cli.log_level)
        .with_context(|| format!("initialising logging at level {}", cli.log_level))?;
    let config = loader.load_or_init()?;
    let storage = storage::init(&paths, &config.storage)?;

    let config = Arc::new(config);
    let command = cli
        .command
        .unwrap_or_else(|| Commands::List(ListArgs::default()));
    match command {
        Commands::List(args) => commands::list_notes(config, storage, args),
        Commands::New(args) => commands::new_note(config, storage, args),
        Commands::Show(args) => commands::show_note(config, storage, args),
        Commands::Edit(args) => commands::edit_note(config, storage, args),
        Commands::Delete(args) => commands::delete_note(config, storage, args),
        Commands::Star(args) => commands::star_note(config, storage, args),
        Commands::Export(args) => commands::export_notes(config, storage, args),
        Commands::Import(args) => commands::import_notes(config, storage, args),
        Commands::Prefs(args) => commands::handle_prefs(storage, args),
        Commands::Cache(args) => commands::handle_cache_command(config, storage, args),
    }
}

fn init_tracing(level: &str) -> Result<()> {
    static INIT: OnceCell<()> = OnceCell::new();
    INIT.get_or_try_init(|| {
        let env_filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
        fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
        Ok(())
    })
    .map(|_| ())
}
