use std::fmt::Write as _;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand, ValueEnum};
use serde_json::Value;
use crossbeam_channel::unbounded;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use unicode_segmentation::UnicodeSegmentation;

use crate::config::{AppConfig, CacheOptions, FontSize, Preferences};
use crate::notes::{backup_file_name, Note, NoteId, NoteStore, NoteUpdate, View, CORRUPT_KEY};
use crate::storage::{KeyValueStore, StorageHandle};
use crate::worker::{
    CacheStorage, CacheWorker, Network, OfflineNetwork, Registration, Request, Response,
    SqliteCache, StaticOrigin, WorkerError, WorkerEvent, WorkerState,
};

const PREVIEW_GRAPHEMES: usize = 60;
const EMPTY_PREVIEW: &str = "(no content)";

#[derive(Args, Debug, Clone, Default)]
pub struct ListArgs {
    /// Only notes whose title or body contains this text
    #[arg(long, short)]
    pub search: Option<String>,
    /// Only notes marked important
    #[arg(long, short)]
    pub important: bool,
}

#[derive(Args, Debug, Clone)]
pub struct NewArgs {
    /// Title for the note (defaults to the configured new-note title)
    #[arg(long)]
    pub title: Option<String>,
    /// Provide the note body inline. If omitted, reads from stdin.
    #[arg(long)]
    pub body: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct NoteArgs {
    /// Note identifier
    pub id: String,
}

#[derive(Args, Debug, Clone)]
pub struct ShowArgs {
    /// Note identifier
    pub id: String,
    /// Print only the title and body, as copied to the clipboard
    #[arg(long)]
    pub plain: bool,
}

#[derive(Args, Debug, Clone)]
pub struct DeleteArgs {
    /// Note identifier
    pub id: String,
    /// Skip the confirmation prompt
    #[arg(long, short)]
    pub yes: bool,
}

#[derive(Args, Debug, Clone)]
pub struct EditArgs {
    /// Note identifier
    pub id: String,
    #[arg(long)]
    pub title: Option<String>,
    /// Replacement body. If omitted, reads from stdin when it is piped.
    #[arg(long)]
    pub body: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct ExportArgs {
    /// Directory for the backup file (defaults to the configured export dir)
    #[arg(long)]
    pub out: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct ImportArgs {
    /// Backup file produced by `export`
    pub file: PathBuf,
    /// Skip the confirmation prompt
    #[arg(long, short)]
    pub yes: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Switch {
    On,
    Off,
}

#[derive(Args, Debug, Clone, Default)]
pub struct PrefsArgs {
    #[arg(long, value_enum)]
    pub dark_mode: Option<Switch>,
    /// small, medium or large
    #[arg(long)]
    pub font_size: Option<FontSize>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum CacheCommand {
    /// Pre-cache the application shell under the configured version
    Install,
    /// Switch to a waiting version and drop every other cache
    Activate,
    /// List cache buckets and the worker state
    Status,
    /// Request a URL through the cache worker
    Fetch(FetchArgs),
}

#[derive(Args, Debug, Clone)]
pub struct FetchArgs {
    pub url: String,
    /// Treat the request as a page navigation
    #[arg(long)]
    pub navigate: bool,
    /// Pretend the network is unreachable
    #[arg(long)]
    pub offline: bool,
}

#[derive(Args, Debug, Clone)]
pub struct CacheArgs {
    #[command(subcommand)]
    pub command: CacheCommand,
}

pub fn list_notes(config: Arc<AppConfig>, storage: StorageHandle, args: ListArgs) -> Result<()> {
    let mut store = open_store(&config, storage)?;
    print!("{}", run_list(&mut store, &args));
    Ok(())
}

pub fn new_note(config: Arc<AppConfig>, storage: StorageHandle, args: NewArgs) -> Result<()> {
    let body = match args.body {
        Some(body) => Some(body),
        None => read_stdin()?,
    };
    let mut store = open_store(&config, storage)?;
    let id = run_new(&mut store, args.title, body)?;
    println!("Created note {id}");
    Ok(())
}

pub fn show_note(config: Arc<AppConfig>, storage: StorageHandle, args: ShowArgs) -> Result<()> {
    let store = open_store(&config, storage)?;
    let id = NoteId::from(args.id);
    let Some(note) = store.get(&id) else {
        bail!("note {id} not found");
    };
    let untitled = &store.options().untitled_placeholder;
    if args.plain {
        println!("{}", note.copy_text(untitled));
    } else {
        print!("{}", format_note(note, untitled));
    }
    Ok(())
}

pub fn edit_note(config: Arc<AppConfig>, storage: StorageHandle, args: EditArgs) -> Result<()> {
    let body = match args.body {
        Some(body) => Some(body),
        None => read_stdin()?,
    };
    let mut store = open_store(&config, storage)?;
    let id = NoteId::from(args.id);
    let note = run_edit(&mut store, &id, args.title, body)?;
    println!("Updated note {} ({})", note.id, note.title);
    Ok(())
}

pub fn delete_note(config: Arc<AppConfig>, storage: StorageHandle, args: DeleteArgs) -> Result<()> {
    let mut store = open_store(&config, storage)?;
    let id = NoteId::from(args.id);
    let output = run_delete(&mut store, &id, |note| {
        if args.yes {
            return Ok(true);
        }
        confirm(&format!("Delete \"{}\"?", note.title))
    })?;
    print!("{output}");
    Ok(())
}

pub fn star_note(config: Arc<AppConfig>, storage: StorageHandle, args: NoteArgs) -> Result<()> {
    let mut store = open_store(&config, storage)?;
    let id = NoteId::from(args.id);
    let important = store
        .toggle_important(&id)
        .with_context(|| format!("toggling note {id}"))?;
    println!(
        "{} note {id}",
        if important { "Starred" } else { "Unstarred" }
    );
    Ok(())
}

pub fn export_notes(config: Arc<AppConfig>, storage: StorageHandle, args: ExportArgs) -> Result<()> {
    let store = open_store(&config, storage)?;
    let dir = args.out.unwrap_or_else(|| config.export.dir.clone());
    let path = run_export(&store, &dir, OffsetDateTime::now_utc())?;
    println!("Exported {} notes to {}", store.len(), path.display());
    Ok(())
}

pub fn import_notes(config: Arc<AppConfig>, storage: StorageHandle, args: ImportArgs) -> Result<()> {
    let mut store = open_store(&config, storage)?;
    let before = store.len();
    let imported = run_import(&mut store, &args.file, |incoming, existing| {
        if args.yes {
            return Ok(true);
        }
        confirm(&format!(
            "Import {incoming} note{} alongside the {existing} you have?",
            plural(incoming)
        ))
    })?;
    match imported {
        Some(imported) => println!(
            "Imported {imported} note{} ({before} existing kept)",
            plural(imported)
        ),
        None => println!("Import cancelled, nothing changed"),
    }
    Ok(())
}

pub fn handle_prefs(storage: StorageHandle, args: PrefsArgs) -> Result<()> {
    print!("{}", run_prefs(&storage, &args)?);
    Ok(())
}

pub fn handle_cache_command(
    config: Arc<AppConfig>,
    storage: StorageHandle,
    args: CacheArgs,
) -> Result<()> {
    let options = config.cache.clone();
    let cache = SqliteCache::new(storage);
    let output = match args.command {
        CacheCommand::Install => {
            let network = network_for(&options, false);
            run_cache_install(options, cache, network)?
        }
        CacheCommand::Activate => {
            let network = network_for(&options, false);
            run_cache_activate(options, cache, network)?
        }
        CacheCommand::Status => run_cache_status(&options, &cache)?,
        CacheCommand::Fetch(args) => {
            let network = network_for(&options, args.offline);
            run_cache_fetch(options, cache, network, &args)?
        }
    };
    print!("{output}");
    Ok(())
}

fn open_store<S: KeyValueStore>(config: &AppConfig, storage: S) -> Result<NoteStore<S>> {
    let (store, report) =
        NoteStore::open(storage, config.notes.clone()).context("loading notes")?;
    if let Some(reason) = &report.recovered {
        warn!(%reason, backup_key = CORRUPT_KEY, "stored notes were unreadable, starting empty");
    }
    if report.skipped > 0 || report.rekeyed > 0 {
        warn!(
            skipped = report.skipped,
            rekeyed = report.rekeyed,
            "repaired stored notes"
        );
    }
    if let Some(version) = report.migrated_from {
        info!(from = version, "migrated stored notes");
    }
    Ok(store)
}

fn run_list<S: KeyValueStore>(store: &mut NoteStore<S>, args: &ListArgs) -> String {
    store.set_search(args.search.clone().unwrap_or_default());
    if store.view_filter().important_only() != args.important {
        store.toggle_important_filter();
    }
    format_cards(&store.view(), &store.options().untitled_placeholder)
}

fn run_new<S: KeyValueStore>(
    store: &mut NoteStore<S>,
    title: Option<String>,
    body: Option<String>,
) -> Result<NoteId> {
    let id = store.create().context("creating note")?;
    if title.is_some() || body.is_some() {
        store
            .update(
                &id,
                NoteUpdate {
                    title,
                    content: body,
                },
            )
            .with_context(|| format!("filling in note {id}"))?;
    }
    Ok(id)
}

fn run_edit<S: KeyValueStore>(
    store: &mut NoteStore<S>,
    id: &NoteId,
    title: Option<String>,
    body: Option<String>,
) -> Result<Note> {
    if title.is_none() && body.is_none() {
        bail!("nothing to change, pass --title or --body");
    }
    let note = store
        .update(
            id,
            NoteUpdate {
                title,
                content: body,
            },
        )
        .with_context(|| format!("updating note {id}"))?;
    Ok(note.clone())
}

fn run_export<S: KeyValueStore>(
    store: &NoteStore<S>,
    dir: &Path,
    at: OffsetDateTime,
) -> Result<PathBuf> {
    fs::create_dir_all(dir)
        .with_context(|| format!("creating export directory {}", dir.display()))?;
    let path = dir.join(backup_file_name(at));
    let json = store.export_json().context("serialising notes")?;
    fs::write(&path, json).with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

/// `confirm` gets the incoming and existing note counts; `None` means it
/// declined and the store is untouched.
fn run_import<S, F>(store: &mut NoteStore<S>, file: &Path, confirm: F) -> Result<Option<usize>>
where
    S: KeyValueStore,
    F: FnOnce(usize, usize) -> Result<bool>,
{
    let is_json = file
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    if !is_json {
        bail!("{} is not a .json file, only exports can be imported", file.display());
    }
    let text =
        fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    let records: Value = serde_json::from_str(&text)
        .with_context(|| format!("importing {}: not valid JSON", file.display()))?;
    if let Some(incoming) = records.as_array().map(Vec::len) {
        if !confirm(incoming, store.len())? {
            return Ok(None);
        }
    }
    let imported = store
        .import_batch(records)
        .with_context(|| format!("importing {}", file.display()))?;
    Ok(Some(imported))
}

fn run_delete<S, F>(store: &mut NoteStore<S>, id: &NoteId, confirm: F) -> Result<String>
where
    S: KeyValueStore,
    F: FnOnce(&Note) -> Result<bool>,
{
    let Some(note) = store.get(id) else {
        return Ok(format!("Note {id} is already gone\n"));
    };
    if !confirm(note)? {
        return Ok(format!("Kept note {id}\n"));
    }
    store
        .delete(id)
        .with_context(|| format!("deleting note {id}"))?;
    Ok(format!("Deleted note {id}\n"))
}

fn run_prefs<S: KeyValueStore>(storage: &S, args: &PrefsArgs) -> Result<String> {
    let mut prefs = Preferences::load(storage).context("loading preferences")?;
    if let Some(switch) = args.dark_mode {
        prefs.set_dark_mode(storage, switch == Switch::On)?;
    }
    if let Some(size) = args.font_size {
        prefs.set_font_size(storage, size)?;
    }
    let mut out = String::new();
    let _ = writeln!(
        &mut out,
        "dark mode  {}",
        if prefs.dark_mode { "on" } else { "off" }
    );
    let _ = writeln!(&mut out, "font size  {}", prefs.font_size);
    Ok(out)
}

fn network_for(options: &CacheOptions, offline: bool) -> Box<dyn Network + Send> {
    if offline {
        Box::new(OfflineNetwork)
    } else {
        Box::new(StaticOrigin::new(
            options.origin.clone(),
            options.origin_dir.clone(),
        ))
    }
}

fn run_cache_install<C, N>(options: CacheOptions, cache: C, network: N) -> Result<String>
where
    C: CacheStorage + Send + 'static,
    N: Network + Send + 'static,
{
    let version = options.version.clone();
    let origin_dir = options.origin_dir.clone();
    let registration = Registration::register(CacheWorker::new(options, cache, network))
        .with_context(|| {
            format!(
                "installing offline cache {version} from {}",
                origin_dir.display()
            )
        })?;
    let state = registration.state()?;
    let events = registration.drain_events();
    registration.unregister();

    let mut out = String::new();
    let mut update_ready = false;
    for event in &events {
        log_event(event);
        match event {
            WorkerEvent::CacheDeleted { name } => {
                let _ = writeln!(&mut out, "Removed stale cache {name}");
            }
            WorkerEvent::UpdateReady { .. } => update_ready = true,
            _ => {}
        }
    }
    if update_ready && state == WorkerState::Installed {
        let _ = writeln!(
            &mut out,
            "New version {version} installed, run `mynote cache activate` to switch"
        );
    } else {
        let _ = writeln!(&mut out, "Offline cache {version} is {state}");
    }
    Ok(out)
}

fn run_cache_activate<C: CacheStorage, N: Network>(
    options: CacheOptions,
    cache: C,
    network: N,
) -> Result<String> {
    let (events, received) = unbounded();
    let mut worker = match CacheWorker::resume(options, cache, network) {
        Ok(worker) => worker.with_events(events),
        Err(WorkerError::NotInstalled { version }) => {
            return Ok(format!(
                "Offline cache {version} is not installed, run `mynote cache install` first\n"
            ));
        }
        Err(err) => return Err(err.into()),
    };
    if worker.state() == WorkerState::Activated {
        return Ok(format!("Offline cache {} is already active\n", worker.version()));
    }
    let deleted = worker.activate()?;
    received.try_iter().for_each(|event| log_event(&event));

    let mut out = String::new();
    for name in &deleted {
        let _ = writeln!(&mut out, "Removed stale cache {name}");
    }
    let _ = writeln!(&mut out, "Offline cache {} is {}", worker.version(), worker.state());
    Ok(out)
}

fn run_cache_status<C: CacheStorage>(options: &CacheOptions, cache: &C) -> Result<String> {
    let buckets = cache.keys().context("listing caches")?;
    if buckets.is_empty() {
        return Ok("No offline cache installed.\n".to_string());
    }
    let mut out = String::new();
    for name in &buckets {
        let entries = cache.entries(name)?.len();
        let marker = if name == &options.version {
            "current"
        } else {
            "stale"
        };
        let _ = writeln!(
            &mut out,
            "{name}  {entries} entr{}  ({marker})",
            if entries == 1 { "y" } else { "ies" }
        );
    }
    let state = match CacheWorker::resume(options.clone(), cache, OfflineNetwork) {
        Ok(worker) => worker.state().to_string(),
        Err(WorkerError::NotInstalled { .. }) => "not installed".to_string(),
        Err(err) => return Err(err.into()),
    };
    let _ = writeln!(&mut out, "worker     {state}");
    Ok(out)
}

fn run_cache_fetch<C: CacheStorage, N: Network>(
    options: CacheOptions,
    cache: C,
    network: N,
    args: &FetchArgs,
) -> Result<String> {
    let worker = CacheWorker::resume(options, cache, network)
        .context("the offline cache must be installed before it can serve requests")?;
    let request = if args.navigate {
        Request::navigate(args.url.as_str())
    } else {
        Request::get(args.url.as_str())
    };
    match worker.fetch(&request)? {
        Some(response) => Ok(format_response(&response)),
        None => Ok("No response: the network is unreachable and nothing is cached.\n".to_string()),
    }
}

fn log_event(event: &WorkerEvent) {
    match event {
        WorkerEvent::StateChanged { version, state } => {
            debug!(%version, %state, "worker state changed")
        }
        WorkerEvent::CacheDeleted { name } => info!(bucket = %name, "stale cache removed"),
        WorkerEvent::ClientsClaimed { version } => info!(%version, "offline cache in control"),
        WorkerEvent::UpdateReady { version } => info!(%version, "new version available"),
    }
}

fn prompt(label: &str) -> Result<String> {
    use std::io::Write;
    let mut stdout = io::stdout();
    write!(stdout, "{}: ", label)?;
    stdout.flush()?;
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim_end().to_owned())
}

fn confirm(question: &str) -> Result<bool> {
    let answer = prompt(&format!("{question} [y/N]"))?;
    Ok(answer.trim().eq_ignore_ascii_case("y"))
}

fn plural(count: usize) -> &'static str {
    if count == 1 {
        ""
    } else {
        "s"
    }
}

fn read_stdin() -> Result<Option<String>> {
    if atty::is(atty::Stream::Stdin) {
        return Ok(None);
    }
    let mut buf = String::new();
    io::stdin().read_to_string(&mut buf)?;
    Ok(Some(buf))
}

/// The card list: title with a star, a one-line preview, date and id.
fn format_cards(view: &View<'_>, untitled: &str) -> String {
    if let Some(empty) = view.empty {
        return format!("{}\n", empty.message());
    }
    let mut out = String::new();
    for note in &view.notes {
        let _ = writeln!(&mut out, "{} {}", star(note), display_title(note, untitled));
        let _ = writeln!(&mut out, "    {}", preview(&note.content, PREVIEW_GRAPHEMES));
        let _ = writeln!(&mut out, "    {}  #{}", note.date.date(), note.id);
        out.push('\n');
    }
    out
}

fn format_note(note: &Note, untitled: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(&mut out, "{} {}", star(note), display_title(note, untitled));
    let _ = writeln!(&mut out, "id    {}", note.id);
    let _ = writeln!(
        &mut out,
        "date  {}",
        note.date
            .format(&Rfc3339)
            .unwrap_or_else(|_| note.date.date().to_string())
    );
    out.push('\n');
    if note.content.is_empty() {
        let _ = writeln!(&mut out, "{EMPTY_PREVIEW}");
    } else {
        let _ = writeln!(&mut out, "{}", note.content);
    }
    out
}

fn format_response(response: &Response) -> String {
    let mut out = String::new();
    let _ = writeln!(&mut out, "{} ({})", response.status, response.kind);
    for (name, value) in &response.headers {
        let _ = writeln!(&mut out, "{name}: {value}");
    }
    let textual = response
        .header("content-type")
        .is_some_and(|kind| kind.starts_with("text/") || kind.contains("json"));
    if textual {
        out.push('\n');
        out.push_str(&String::from_utf8_lossy(&response.body));
        if !out.ends_with('\n') {
            out.push('\n');
        }
    } else {
        let _ = writeln!(&mut out, "\n<{} bytes>", response.body.len());
    }
    out
}

fn star(note: &Note) -> char {
    if note.important {
        '★'
    } else {
        '☆'
    }
}

fn display_title<'a>(note: &'a Note, untitled: &'a str) -> &'a str {
    if note.title.trim().is_empty() {
        untitled
    } else {
        &note.title
    }
}

/// Body collapsed to one line and cut at `limit` grapheme clusters.
fn preview(content: &str, limit: usize) -> String {
    let flattened = content.split_whitespace().collect::<Vec<_>>().join(" ");
    if flattened.is_empty() {
        return EMPTY_PREVIEW.to_string();
    }
    let mut graphemes = flattened.graphemes(true);
    let head: String = graphemes.by_ref().take(limit).collect();
    if graphemes.next().is_some() {
        format!("{head}…")
    } else {
        head
    }
}
