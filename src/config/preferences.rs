use std::str::FromStr;

use anyhow::Result;
use strum::{Display, EnumString, IntoStaticStr};

use crate::storage::KeyValueStore;

const DARK_MODE_KEY: &str = "darkMode";
const FONT_SIZE_KEY: &str = "fontSize";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display, EnumString, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum FontSize {
    Small,
    #[default]
    Medium,
    Large,
}

/// Display preferences kept next to the notes in local storage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Preferences {
    pub dark_mode: bool,
    pub font_size: FontSize,
}

impl Preferences {
    pub fn load<S: KeyValueStore>(storage: &S) -> Result<Self> {
        let dark_mode = storage.get_item(DARK_MODE_KEY)?.as_deref() == Some("true");
        let font_size = match storage.get_item(FONT_SIZE_KEY)? {
            Some(raw) => FontSize::from_str(&raw).unwrap_or_else(|_| {
                tracing::warn!(value = %raw, "unknown font size in storage, using medium");
                FontSize::default()
            }),
            None => FontSize::default(),
        };
        Ok(Self {
            dark_mode,
            font_size,
        })
    }

    pub fn set_dark_mode<S: KeyValueStore>(&mut self, storage: &S, enabled: bool) -> Result<()> {
        storage.set_item(DARK_MODE_KEY, if enabled { "true" } else { "false" })?;
        self.dark_mode = enabled;
        tracing::info!(enabled, "dark mode updated");
        Ok(())
    }

    pub fn set_font_size<S: KeyValueStore>(&mut self, storage: &S, size: FontSize) -> Result<()> {
        let value: &'static str = size.into();
        storage.set_item(FONT_SIZE_KEY, value)?;
        self.font_size = size;
        tracing::info!(%size, "font size updated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    #[test]
    fn defaults_when_nothing_stored() -> Result<()> {
        let storage = MemoryStorage::new();
        let prefs = Preferences::load(&storage)?;
        assert!(!prefs.dark_mode);
        assert_eq!(prefs.font_size, FontSize::Medium);
        Ok(())
    }

    #[test]
    fn setters_write_the_page_keys() -> Result<()> {
        let storage = MemoryStorage::new();
        let mut prefs = Preferences::load(&storage)?;
        prefs.set_dark_mode(&storage, true)?;
        prefs.set_font_size(&storage, FontSize::Large)?;

        assert_eq!(storage.get_item("darkMode")?.as_deref(), Some("true"));
        assert_eq!(storage.get_item("fontSize")?.as_deref(), Some("large"));
        assert_eq!(Preferences::load(&storage)?, prefs);
        Ok(())
    }

    #[test]
    fn unknown_font_size_falls_back_to_medium() -> Result<()> {
        let storage = MemoryStorage::new();
        storage.set_item("fontSize", "huge")?;
        assert_eq!(Preferences::load(&storage)?.font_size, FontSize::Medium);
        Ok(())
    }
}
