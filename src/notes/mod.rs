//! The note store.
//!
//! [`NoteStore`] owns the ordered note list and the storage it is mirrored
//! to. Every mutation rewrites the whole list under [`NOTES_KEY`] before it
//! returns; there is no partial or deferred persistence.

use std::collections::HashSet;

use serde_json::Value;
use thiserror::Error;
use time::macros::format_description;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::config::NoteOptions;
use crate::storage::KeyValueStore;

pub mod filter;
pub mod model;

pub use filter::{filter, EmptyState, View, ViewFilter};
pub use model::{Note, NoteId, SCHEMA_VERSION};

use model::{fresh_id, now_millis, NoteRecord, LEGACY_SCHEMA_VERSION};

pub const NOTES_KEY: &str = "myNotes";
pub const SCHEMA_KEY: &str = "myNotes:schema";
/// Holds the last blob that could not be read back, so recovery never
/// silently discards user data.
pub const CORRUPT_KEY: &str = "myNotes:corrupt";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("note not found: {id}")]
    NotFound { id: NoteId },

    #[error("invalid note data: {message}")]
    Validation { message: String },

    #[error("malformed note data: {0}")]
    Parse(#[from] serde_json::Error),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub loaded: usize,
    /// Records dropped because they were not note-shaped.
    pub skipped: usize,
    /// Records given a new id because theirs was missing or duplicated.
    pub rekeyed: usize,
    pub migrated_from: Option<u32>,
    /// Set when the stored blob was unreadable and the list started empty.
    pub recovered: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct NoteUpdate {
    pub title: Option<String>,
    pub content: Option<String>,
}

pub struct NoteStore<S> {
    storage: S,
    notes: Vec<Note>,
    view: ViewFilter,
    options: NoteOptions,
}

impl<S: KeyValueStore> NoteStore<S> {
    pub fn open(storage: S, options: NoteOptions) -> StoreResult<(Self, LoadReport)> {
        let mut store = Self {
            storage,
            notes: Vec::new(),
            view: ViewFilter::default(),
            options,
        };
        let report = store.load()?;
        Ok((store, report))
    }

    /// Replaces the in-memory list with what storage holds.
    ///
    /// Unreadable data yields an empty list and a populated
    /// [`LoadReport::recovered`]; only storage access failures are errors.
    pub fn load(&mut self) -> StoreResult<LoadReport> {
        let mut report = LoadReport::default();
        let Some(raw) = self.storage.get_item(NOTES_KEY)? else {
            self.notes.clear();
            debug!("no stored notes, starting empty");
            return Ok(report);
        };
        let version = self.stored_version()?;

        let values = match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Array(values)) => values,
            Ok(other) => {
                let reason = format!("expected a JSON array, found {}", json_kind(&other));
                return self.recover(&raw, reason, report);
            }
            Err(err) => return self.recover(&raw, err.to_string(), report),
        };

        let now = now_millis();
        let mut seen: HashSet<NoteId> = HashSet::with_capacity(values.len());
        let mut notes = Vec::with_capacity(values.len());
        for (index, value) in values.into_iter().enumerate() {
            let record = match NoteRecord::from_value(value) {
                Ok(record) => record,
                Err(err) => {
                    warn!(index, %err, "skipping unreadable note record");
                    report.skipped += 1;
                    continue;
                }
            };
            let id = match record.usable_id() {
                Some(id) if !seen.contains(id) => id.clone(),
                _ => {
                    report.rekeyed += 1;
                    fresh_id(now, true, |candidate| seen.contains(candidate))
                }
            };
            let date = record.parsed_date().unwrap_or(now);
            seen.insert(id.clone());
            notes.push(record.into_note(id, date, &self.options.untitled_placeholder));
        }

        report.loaded = notes.len();
        self.notes = notes;

        if version > SCHEMA_VERSION {
            warn!(version, "stored notes use a newer schema, reading best-effort");
        }
        if version < SCHEMA_VERSION {
            report.migrated_from = Some(version);
        }
        if report.skipped > 0 {
            self.storage.set_item(CORRUPT_KEY, &raw)?;
        }
        if version < SCHEMA_VERSION || report.skipped > 0 || report.rekeyed > 0 {
            info!(
                from = version,
                skipped = report.skipped,
                rekeyed = report.rekeyed,
                "migrating stored notes"
            );
            self.persist()?;
        }
        info!(count = report.loaded, "notes loaded");
        Ok(report)
    }

    /// Writes the full list back to storage.
    pub fn persist(&self) -> StoreResult<()> {
        write_list(&self.storage, &self.notes)
    }

    pub fn create(&mut self) -> StoreResult<NoteId> {
        let now = now_millis();
        let id = fresh_id(now, false, |candidate| self.contains(candidate));
        self.notes.insert(
            0,
            Note {
                id: id.clone(),
                title: self.options.new_note_title.clone(),
                content: String::new(),
                date: now,
                important: false,
            },
        );
        self.persist()?;
        info!(%id, "note created");
        Ok(id)
    }

    /// Applies the given fields (trimmed) and stamps a new modification date.
    pub fn update(&mut self, id: &NoteId, update: NoteUpdate) -> StoreResult<&Note> {
        let index = self.position(id)?;
        let placeholder = &self.options.untitled_placeholder;
        let note = &mut self.notes[index];
        if let Some(title) = update.title {
            let trimmed = title.trim();
            note.title = if trimmed.is_empty() {
                placeholder.clone()
            } else {
                trimmed.to_string()
            };
        }
        if let Some(content) = update.content {
            note.content = content.trim().to_string();
        }
        note.date = now_millis();
        self.persist()?;
        debug!(%id, "note updated");
        Ok(&self.notes[index])
    }

    /// Removes the note if present. Storage is rewritten either way.
    pub fn delete(&mut self, id: &NoteId) -> StoreResult<bool> {
        let before = self.notes.len();
        self.notes.retain(|note| &note.id != id);
        let removed = self.notes.len() != before;
        self.persist()?;
        if removed {
            info!(%id, "note deleted");
        } else {
            debug!(%id, "delete of unknown note");
        }
        Ok(removed)
    }

    /// Returns the new value of the flag.
    pub fn toggle_important(&mut self, id: &NoteId) -> StoreResult<bool> {
        let index = self.position(id)?;
        let note = &mut self.notes[index];
        note.important = !note.important;
        let important = note.important;
        self.persist()?;
        debug!(%id, important, "importance toggled");
        Ok(important)
    }

    /// Prepends the records as new notes, each under a fresh id.
    ///
    /// The whole batch is validated before the list is touched: the input
    /// must be an array whose elements are all note-shaped objects.
    pub fn import_batch(&mut self, records: Value) -> StoreResult<usize> {
        let Value::Array(values) = records else {
            return Err(StoreError::Validation {
                message: format!(
                    "expected a JSON array of notes, found {}",
                    json_kind(&records)
                ),
            });
        };
        let parsed = values
            .into_iter()
            .enumerate()
            .map(|(index, value)| {
                if !value.is_object() {
                    return Err(StoreError::Validation {
                        message: format!("record {index} is {}, not a note", json_kind(&value)),
                    });
                }
                NoteRecord::from_value(value).map_err(|err| StoreError::Validation {
                    message: format!("record {index}: {err}"),
                })
            })
            .collect::<StoreResult<Vec<_>>>()?;

        let now = now_millis();
        let mut taken: HashSet<NoteId> = self.notes.iter().map(|note| note.id.clone()).collect();
        let mut batch = Vec::with_capacity(parsed.len() + self.notes.len());
        for record in parsed {
            let id = fresh_id(now, true, |candidate| taken.contains(candidate));
            taken.insert(id.clone());
            let date = record.parsed_date().unwrap_or(now);
            batch.push(record.into_note(id, date, &self.options.untitled_placeholder));
        }
        let imported = batch.len();
        batch.extend(self.notes.iter().cloned());
        write_list(&self.storage, &batch)?;
        self.notes = batch;
        info!(imported, total = self.notes.len(), "notes imported");
        Ok(imported)
    }

    /// Parses an import file body and hands it to [`Self::import_batch`].
    pub fn import_json(&mut self, text: &str) -> StoreResult<usize> {
        let value: Value = serde_json::from_str(text)?;
        self.import_batch(value)
    }

    pub fn export_all(&self) -> Vec<Note> {
        self.notes.clone()
    }

    /// Pretty-printed export document.
    pub fn export_json(&self) -> StoreResult<String> {
        Ok(serde_json::to_string_pretty(&self.notes)?)
    }

    pub fn get(&self, id: &NoteId) -> Option<&Note> {
        self.notes.iter().find(|note| &note.id == id)
    }

    pub fn notes(&self) -> &[Note] {
        &self.notes
    }

    pub fn len(&self) -> usize {
        self.notes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }

    pub fn options(&self) -> &NoteOptions {
        &self.options
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn view_filter(&self) -> &ViewFilter {
        &self.view
    }

    pub fn set_search(&mut self, term: impl Into<String>) {
        self.view.set_search(term);
    }

    pub fn toggle_important_filter(&mut self) -> bool {
        self.view.toggle_important_only()
    }

    /// The list as currently filtered.
    pub fn view(&self) -> View<'_> {
        self.view.apply(&self.notes)
    }

    fn contains(&self, id: &NoteId) -> bool {
        self.notes.iter().any(|note| &note.id == id)
    }

    fn position(&self, id: &NoteId) -> StoreResult<usize> {
        self.notes
            .iter()
            .position(|note| &note.id == id)
            .ok_or_else(|| StoreError::NotFound { id: id.clone() })
    }

    fn stored_version(&self) -> StoreResult<u32> {
        let version = self
            .storage
            .get_item(SCHEMA_KEY)?
            .and_then(|raw| raw.trim().parse::<u32>().ok())
            .unwrap_or(LEGACY_SCHEMA_VERSION);
        Ok(version)
    }

    fn recover(&mut self, raw: &str, reason: String, mut report: LoadReport) -> StoreResult<LoadReport> {
        warn!(%reason, "stored notes are unreadable, starting empty");
        self.storage.set_item(CORRUPT_KEY, raw)?;
        self.notes.clear();
        report.recovered = Some(reason);
        Ok(report)
    }
}

/// The schema tag goes first: the reader accepts either schema, so a list
/// left behind by a failed second write still loads.
fn write_list<S: KeyValueStore>(storage: &S, notes: &[Note]) -> StoreResult<()> {
    let blob = serde_json::to_string(notes)?;
    storage.set_item(SCHEMA_KEY, &SCHEMA_VERSION.to_string())?;
    storage.set_item(NOTES_KEY, &blob)?;
    debug!(count = notes.len(), bytes = blob.len(), "notes persisted");
    Ok(())
}

/// `my-note-backup_YYYYMMDD_HHMMSS.json` for the given moment.
pub fn backup_file_name(at: OffsetDateTime) -> String {
    let stamp = at
        .format(format_description!(
            "[year][month][day]_[hour][minute][second]"
        ))
        .unwrap_or_else(|_| at.unix_timestamp().to_string());
    format!("my-note-backup_{stamp}.json")
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tests::init_storage;
    use crate::storage::MemoryStorage;
    use assert_matches::assert_matches;
    use serde_json::json;
    use time::macros::datetime;

    type TestResult<T = ()> = anyhow::Result<T>;

    fn open_memory() -> TestResult<NoteStore<MemoryStorage>> {
        let (store, report) = NoteStore::open(MemoryStorage::new(), NoteOptions::default())?;
        assert_eq!(report, LoadReport::default());
        Ok(store)
    }

    fn persisted<S: KeyValueStore>(store: &NoteStore<S>) -> TestResult<Vec<Note>> {
        let raw = store.storage().get_item(NOTES_KEY)?.expect("notes persisted");
        Ok(serde_json::from_str(&raw)?)
    }

    #[test]
    fn create_prepends_with_defaults() -> TestResult {
        let mut store = open_memory()?;
        let first = store.create()?;
        let second = store.create()?;
        assert_ne!(first, second);

        let ids: Vec<_> = store.notes().iter().map(|note| note.id.clone()).collect();
        assert_eq!(ids, vec![second.clone(), first]);
        let note = store.get(&second).expect("created note");
        assert_eq!(note.title, "New Note");
        assert_eq!(note.content, "");
        assert!(!note.important);
        Ok(())
    }

    #[test]
    fn persisted_blob_tracks_every_mutation() -> TestResult {
        let mut store = open_memory()?;
        let a = store.create()?;
        assert_eq!(persisted(&store)?, store.export_all());
        let b = store.create()?;
        assert_eq!(persisted(&store)?, store.export_all());
        store.update(
            &a,
            NoteUpdate {
                title: Some("Groceries".into()),
                content: Some("milk".into()),
            },
        )?;
        assert_eq!(persisted(&store)?, store.export_all());
        store.toggle_important(&b)?;
        assert_eq!(persisted(&store)?, store.export_all());
        store.delete(&a)?;
        assert_eq!(persisted(&store)?, store.export_all());
        assert_eq!(
            store.storage().get_item(SCHEMA_KEY)?.as_deref(),
            Some("2")
        );
        Ok(())
    }

    #[test]
    fn update_trims_and_substitutes_empty_title() -> TestResult {
        let mut store = open_memory()?;
        let id = store.create()?;
        let before = store.get(&id).expect("note").date;

        let note = store.update(
            &id,
            NoteUpdate {
                title: Some("   ".into()),
                content: Some("  body  ".into()),
            },
        )?;
        assert_eq!(note.title, "Untitled");
        assert_eq!(note.content, "body");
        assert!(note.date >= before);
        Ok(())
    }

    #[test]
    fn update_and_toggle_report_missing_notes() -> TestResult {
        let mut store = open_memory()?;
        let missing = NoteId::from("nope");
        assert_matches!(
            store.update(&missing, NoteUpdate::default()),
            Err(StoreError::NotFound { .. })
        );
        assert_matches!(
            store.toggle_important(&missing),
            Err(StoreError::NotFound { id }) if id == missing
        );
        Ok(())
    }

    #[test]
    fn toggle_important_flips_flag() -> TestResult {
        let mut store = open_memory()?;
        let id = store.create()?;
        assert!(store.toggle_important(&id)?);
        assert!(!store.toggle_important(&id)?);
        Ok(())
    }

    #[test]
    fn delete_is_idempotent() -> TestResult {
        let mut store = open_memory()?;
        let keep = store.create()?;
        let gone = store.create()?;

        assert!(store.delete(&gone)?);
        let once = persisted(&store)?;
        assert!(!store.delete(&gone)?);
        assert_eq!(persisted(&store)?, once);
        assert_eq!(store.len(), 1);
        assert!(store.get(&keep).is_some());
        Ok(())
    }

    #[test]
    fn import_rekeys_colliding_ids_and_keeps_existing_notes() -> TestResult {
        let mut store = open_memory()?;
        let existing = store.create()?;
        store.update(
            &existing,
            NoteUpdate {
                title: Some("Mine".into()),
                content: None,
            },
        )?;
        let before = store.get(&existing).cloned().expect("existing note");

        let imported = store.import_batch(json!([
            { "id": existing.as_str(), "title": "Copy A", "date": "2023-01-02T03:04:05.000Z" },
            { "id": existing.as_str(), "title": "Copy B", "important": true },
            { "title": "" }
        ]))?;
        assert_eq!(imported, 3);
        assert_eq!(store.len(), 4);

        let ids: HashSet<_> = store.notes().iter().map(|note| note.id.clone()).collect();
        assert_eq!(ids.len(), 4, "ids must be unique");

        let titles: Vec<_> = store.notes().iter().map(|note| note.title.as_str()).collect();
        assert_eq!(titles, vec!["Copy A", "Copy B", "Untitled", "Mine"]);
        assert_eq!(store.notes()[0].date, datetime!(2023-01-02 03:04:05 UTC));
        assert!(store.notes()[1].important);
        assert_eq!(store.notes()[3], before);
        assert_eq!(persisted(&store)?, store.export_all());
        Ok(())
    }

    #[test]
    fn import_rejects_non_arrays_without_touching_the_store() -> TestResult {
        let mut store = open_memory()?;
        store.create()?;
        let snapshot = persisted(&store)?;

        assert_matches!(
            store.import_batch(json!({ "title": "not a list" })),
            Err(StoreError::Validation { .. })
        );
        assert_matches!(
            store.import_batch(json!([{ "title": "ok" }, 42])),
            Err(StoreError::Validation { message }) if message.contains("record 1")
        );
        assert_matches!(store.import_json("[{"), Err(StoreError::Parse(_)));

        assert_eq!(store.len(), 1);
        assert_eq!(persisted(&store)?, snapshot);
        Ok(())
    }

    #[test]
    fn import_is_always_additive() -> TestResult {
        let mut store = open_memory()?;
        let doc = r#"[{ "title": "Same", "content": "same" }]"#;
        store.import_json(doc)?;
        store.import_json(doc)?;
        assert_eq!(store.len(), 2);
        Ok(())
    }

    #[test]
    fn export_snapshot_is_the_full_list() -> TestResult {
        let mut store = open_memory()?;
        store.import_batch(json!([
            { "title": "Imported", "content": "body", "important": true,
              "date": "2024-03-01T09:30:00.000Z" }
        ]))?;

        insta::assert_json_snapshot!(store.export_all(), { "[].id" => "[id]" }, @r###"
        [
          {
            "id": "[id]",
            "title": "Imported",
            "content": "body",
            "date": "2024-03-01T09:30:00Z",
            "important": true
          }
        ]
        "###);
        let pretty = store.export_json()?;
        assert!(pretty.starts_with("[\n  {\n"));
        Ok(())
    }

    #[test]
    fn malformed_blob_recovers_to_empty_and_keeps_a_copy() -> TestResult {
        let storage = MemoryStorage::new();
        storage.set_item(NOTES_KEY, "{not json")?;

        let (store, report) = NoteStore::open(&storage, NoteOptions::default())?;
        assert!(store.is_empty());
        assert!(report.recovered.is_some());
        assert_eq!(storage.get_item(CORRUPT_KEY)?.as_deref(), Some("{not json"));

        storage.set_item(NOTES_KEY, r#"{"title":"x"}"#)?;
        let (store, report) = NoteStore::open(&storage, NoteOptions::default())?;
        assert!(store.is_empty());
        assert_matches!(report.recovered, Some(reason) if reason.contains("an object"));
        Ok(())
    }

    #[test]
    fn legacy_blob_is_migrated_on_load() -> TestResult {
        let storage = MemoryStorage::new();
        let legacy = json!([
            { "id": 1709285400000_i64, "title": "Work", "content": "plan",
              "date": "2024-03-01T09:30:00.000Z", "important": true },
            { "id": 1709285400000_i64, "title": "Dup" },
            "garbage"
        ]);
        storage.set_item(NOTES_KEY, &legacy.to_string())?;

        let (store, report) = NoteStore::open(&storage, NoteOptions::default())?;
        assert_eq!(report.loaded, 2);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.rekeyed, 1);
        assert_eq!(report.migrated_from, Some(1));

        assert_eq!(store.notes()[0].id.as_str(), "1709285400000");
        assert_ne!(store.notes()[1].id, store.notes()[0].id);
        assert_eq!(store.notes()[1].content, "");
        assert_eq!(storage.get_item(SCHEMA_KEY)?.as_deref(), Some("2"));
        assert!(storage.get_item(CORRUPT_KEY)?.is_some());
        assert_eq!(persisted(&store)?, store.export_all());

        let (_reloaded, report) = NoteStore::open(&storage, NoteOptions::default())?;
        assert_eq!(report.migrated_from, None);
        assert_eq!(report.loaded, 2);
        Ok(())
    }

    /// Memory storage whose writes can be switched off.
    #[derive(Default)]
    struct FlakyStorage {
        inner: MemoryStorage,
        read_only: std::cell::Cell<bool>,
    }

    impl KeyValueStore for FlakyStorage {
        fn get_item(&self, key: &str) -> anyhow::Result<Option<String>> {
            self.inner.get_item(key)
        }

        fn set_item(&self, key: &str, value: &str) -> anyhow::Result<()> {
            if self.read_only.get() {
                anyhow::bail!("storage is read-only");
            }
            self.inner.set_item(key, value)
        }

        fn remove_item(&self, key: &str) -> anyhow::Result<()> {
            self.inner.remove_item(key)
        }
    }

    #[test]
    fn out_of_range_dates_fall_back_to_now_on_load() -> TestResult {
        let storage = MemoryStorage::new();
        storage.set_item(
            NOTES_KEY,
            r#"[{"id":1,"title":"old","date":-100000000000000}]"#,
        )?;
        let before = OffsetDateTime::now_utc() - time::Duration::seconds(1);

        let (store, report) = NoteStore::open(&storage, NoteOptions::default())?;
        assert_eq!(report.loaded, 1);
        assert_eq!(store.notes()[0].title, "old");
        assert!(store.notes()[0].date >= before);
        assert_eq!(persisted(&store)?, store.export_all());
        Ok(())
    }

    #[test]
    fn import_with_out_of_range_date_is_persisted() -> TestResult {
        let mut store = open_memory()?;
        store.create()?;
        store.import_batch(json!([{ "title": "x", "date": -100000000000000_i64 }]))?;
        assert_eq!(store.len(), 2);
        assert_eq!(persisted(&store)?, store.export_all());
        Ok(())
    }

    #[test]
    fn failed_import_write_leaves_the_list_alone() -> TestResult {
        let (mut store, _) = NoteStore::open(FlakyStorage::default(), NoteOptions::default())?;
        store.create()?;
        let snapshot = store.export_all();

        store.storage().read_only.set(true);
        assert_matches!(
            store.import_batch(json!([{ "title": "x" }])),
            Err(StoreError::Storage(_))
        );
        assert_eq!(store.export_all(), snapshot);

        store.storage().read_only.set(false);
        store.import_batch(json!([{ "title": "y" }]))?;
        assert_eq!(store.len(), 2);
        assert_eq!(persisted(&store)?, store.export_all());
        Ok(())
    }

    #[test]
    fn sqlite_storage_round_trips_the_list() -> TestResult {
        let (_temp, storage) = init_storage()?;
        let (mut store, _) = NoteStore::open(storage.clone(), NoteOptions::default())?;
        let id = store.create()?;
        store.update(
            &id,
            NoteUpdate {
                title: Some("Persisted".into()),
                content: Some("across opens".into()),
            },
        )?;
        let expected = store.export_all();

        let (reopened, report) = NoteStore::open(storage, NoteOptions::default())?;
        assert_eq!(report.loaded, 1);
        assert_eq!(reopened.export_all(), expected);
        Ok(())
    }

    #[test]
    fn view_uses_store_filter_inputs() -> TestResult {
        let mut store = open_memory()?;
        store.import_batch(json!([
            { "title": "Groceries" },
            { "title": "Work", "important": true }
        ]))?;

        store.set_search("gro");
        let view = store.view();
        assert_eq!(view.notes.len(), 1);
        assert_eq!(view.notes[0].title, "Groceries");

        store.set_search("");
        assert!(store.toggle_important_filter());
        let view = store.view();
        assert_eq!(view.notes.len(), 1);
        assert_eq!(view.notes[0].title, "Work");
        Ok(())
    }

    #[test]
    fn backup_file_name_encodes_timestamp() {
        assert_eq!(
            backup_file_name(datetime!(2024-03-01 09:05:07 UTC)),
            "my-note-backup_20240301_090507.json"
        );
    }
}
