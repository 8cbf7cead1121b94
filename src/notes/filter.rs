use crate::notes::model::Note;

/// Notes whose title or content contains `term` case-insensitively, limited
/// to important notes when `important_only` is set. Input order is kept.
pub fn filter<'a>(
    notes: &'a [Note],
    term: &str,
    important_only: bool,
) -> impl Iterator<Item = &'a Note> + 'a {
    let needle = term.to_lowercase();
    notes
        .iter()
        .filter(move |note| matches(note, &needle, important_only))
}

fn matches(note: &Note, needle: &str, important_only: bool) -> bool {
    if important_only && !note.important {
        return false;
    }
    needle.is_empty()
        || note.title.to_lowercase().contains(needle)
        || note.content.to_lowercase().contains(needle)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmptyState {
    /// The important-only filter left nothing to show.
    NoImportantNotes,
    NoNotes,
}

impl EmptyState {
    pub fn message(&self) -> &'static str {
        match self {
            EmptyState::NoImportantNotes => "No important notes.",
            EmptyState::NoNotes => "No notes yet. Add a new note!",
        }
    }
}

#[derive(Debug)]
pub struct View<'a> {
    pub notes: Vec<&'a Note>,
    pub empty: Option<EmptyState>,
}

/// The two transient inputs the list is filtered by.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViewFilter {
    search: String,
    important_only: bool,
}

impl ViewFilter {
    pub fn new(search: impl Into<String>, important_only: bool) -> Self {
        Self {
            search: search.into(),
            important_only,
        }
    }

    pub fn search(&self) -> &str {
        &self.search
    }

    pub fn important_only(&self) -> bool {
        self.important_only
    }

    pub fn set_search(&mut self, search: impl Into<String>) {
        self.search = search.into();
    }

    pub fn toggle_important_only(&mut self) -> bool {
        self.important_only = !self.important_only;
        self.important_only
    }

    pub fn apply<'a>(&self, notes: &'a [Note]) -> View<'a> {
        let notes: Vec<&Note> = filter(notes, &self.search, self.important_only).collect();
        let empty = if notes.is_empty() {
            Some(if self.important_only {
                EmptyState::NoImportantNotes
            } else {
                EmptyState::NoNotes
            })
        } else {
            None
        };
        View { notes, empty }
    }
}
