//! Persisted note records.
//!
//! The list under `myNotes` is a JSON array of [`Note`] objects. Schema
//! version 1 is what the web app wrote: numeric ids, optional
//! `content` and `important`, loosely formatted dates. Version 2 is the
//! normalized form written by this crate. [`NoteRecord`] reads either.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use uuid::Uuid;

pub const SCHEMA_VERSION: u32 = 2;
pub const LEGACY_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct NoteId(String);

impl NoteId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NoteId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for NoteId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Text(String),
    Integer(i64),
    Float(f64),
}

impl<'de> Deserialize<'de> for NoteId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match RawId::deserialize(deserializer)? {
            RawId::Text(text) => NoteId(text),
            RawId::Integer(value) => NoteId(value.to_string()),
            RawId::Float(value) => NoteId(value.to_string()),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    pub id: NoteId,
    pub title: String,
    pub content: String,
    /// Last modification.
    #[serde(with = "time::serde::rfc3339")]
    pub date: OffsetDateTime,
    pub important: bool,
}

impl Note {
    /// Text handed to the clipboard or a share sheet.
    pub fn copy_text(&self, untitled: &str) -> String {
        let title = if self.title.is_empty() {
            untitled
        } else {
            &self.title
        };
        format!("{title}\n\n{}", self.content)
    }
}

/// A note-shaped record as found in storage or an import file.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct NoteRecord {
    pub id: Option<NoteId>,
    pub title: Option<String>,
    pub content: Option<String>,
    pub date: Option<Value>,
    pub important: Option<bool>,
}

impl NoteRecord {
    pub fn from_value(value: Value) -> serde_json::Result<Self> {
        serde_json::from_value(value)
    }

    /// RFC 3339 strings and Unix millisecond numbers are accepted.
    ///
    /// Dates outside years 0 to 9999 cannot be written back as RFC 3339 and
    /// count as unparseable.
    pub fn parsed_date(&self) -> Option<OffsetDateTime> {
        let date = match self.date.as_ref()? {
            Value::String(raw) => OffsetDateTime::parse(raw, &Rfc3339).ok()?,
            Value::Number(number) => {
                let millis = number.as_i64()?;
                OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000).ok()?
            }
            _ => return None,
        };
        (0..=9999).contains(&date.year()).then_some(date)
    }

    pub fn usable_id(&self) -> Option<&NoteId> {
        self.id.as_ref().filter(|id| !id.as_str().trim().is_empty())
    }

    pub fn into_note(self, id: NoteId, date: OffsetDateTime, untitled: &str) -> Note {
        let title = self
            .title
            .filter(|title| !title.trim().is_empty())
            .unwrap_or_else(|| untitled.to_string());
        Note {
            id,
            title,
            content: self.content.unwrap_or_default(),
            date,
            important: self.important.unwrap_or(false),
        }
    }
}

/// Current UTC time at millisecond precision, the resolution the web app stored.
pub(crate) fn now_millis() -> OffsetDateTime {
    let now = OffsetDateTime::now_utc();
    now.replace_nanosecond(u32::from(now.millisecond()) * 1_000_000)
        .unwrap_or(now)
}

/// Timestamp-based id that `taken` does not already claim.
///
/// With `always_suffix` unset the bare millisecond timestamp is tried first;
/// otherwise, and on collision, an 8 hex digit random suffix is appended.
pub(crate) fn fresh_id<F>(now: OffsetDateTime, always_suffix: bool, taken: F) -> NoteId
where
    F: Fn(&NoteId) -> bool,
{
    let millis = now.unix_timestamp_nanos() / 1_000_000;
    if !always_suffix {
        let id = NoteId(millis.to_string());
        if !taken(&id) {
            return id;
        }
    }
    loop {
        let id = NoteId(format!("{millis}-{}", random_suffix()));
        if !taken(&id) {
            return id;
        }
    }
}

fn random_suffix() -> String {
    let mut suffix = Uuid::new_v4().simple().to_string();
    suffix.truncate(8);
    suffix
}
