use std::env;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

pub mod preferences;

pub use preferences::{FontSize, Preferences};

const APP_DOMAIN: &str = "io";
const APP_ORG: &str = "MyNote";
const APP_NAME: &str = "mynote";

pub struct ConfigLoader {
    paths: ConfigPaths,
}

impl ConfigLoader {
    pub fn discover() -> Result<Self> {
        let paths = ConfigPaths::discover()?;
        Ok(Self { paths })
    }

    pub fn with_paths(paths: ConfigPaths) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &ConfigPaths {
        &self.paths
    }

    pub fn load_or_init(&self) -> Result<AppConfig> {
        self.paths.ensure_directories()?;
        if !self.paths.config_file.exists() {
            let mut default_cfg = AppConfig::default();
            default_cfg.post_load(&self.paths)?;
            self.write_default_config(&default_cfg)?;
            return Ok(default_cfg);
        }

        self.load()
    }

    pub fn load(&self) -> Result<AppConfig> {
        let raw = fs::read_to_string(&self.paths.config_file)
            .with_context(|| format!("reading config {}", self.paths.config_file.display()))?;
        let mut cfg: AppConfig = toml::from_str(&raw).context("parsing config toml")?;
        cfg.post_load(&self.paths)?;
        Ok(cfg)
    }

    fn write_default_config(&self, cfg: &AppConfig) -> Result<()> {
        let toml = toml::to_string_pretty(cfg).context("serializing default config")?;
        if let Some(parent) = self.paths.config_file.parent() {
            fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
        }
        let mut file = fs::File::create(&self.paths.config_file)
            .with_context(|| format!("creating config {}", self.paths.config_file.display()))?;
        file.write_all(toml.as_bytes())
            .context("writing default config")?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ConfigPaths {
    pub config_dir: PathBuf,
    pub config_file: PathBuf,
    pub data_dir: PathBuf,
    pub database_path: PathBuf,
    pub backup_dir: PathBuf,
    /// Directory served as the same-origin site for the offline cache.
    pub origin_dir: PathBuf,
}

impl ConfigPaths {
    pub fn discover() -> Result<Self> {
        let override_config = env::var("MYNOTE_CONFIG").ok().map(PathBuf::from);
        let override_data = env::var("MYNOTE_DATA").ok().map(PathBuf::from);

        let project_dirs = ProjectDirs::from(APP_DOMAIN, APP_ORG, APP_NAME)
            .context("resolving XDG project directories")?;

        let config_dir = override_config
            .clone()
            .map(|p| {
                if p.is_dir() {
                    p
                } else {
                    p.parent().map(Path::to_path_buf).unwrap_or(p)
                }
            })
            .unwrap_or_else(|| project_dirs.config_dir().to_path_buf());

        let config_file = override_config
            .filter(|p| p.is_file() || p.extension().is_some())
            .unwrap_or_else(|| config_dir.join("config.toml"));

        let data_root = override_data.unwrap_or_else(|| project_dirs.data_dir().to_path_buf());

        Ok(Self {
            config_dir,
            config_file,
            database_path: data_root.join("mynote.db"),
            backup_dir: data_root.join("backups"),
            origin_dir: data_root.join("public"),
            data_dir: data_root,
        })
    }

    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [&self.config_dir, &self.data_dir, &self.backup_dir] {
            fs::create_dir_all(dir)
                .with_context(|| format!("creating application directory {}", dir.display()))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub notes: NoteOptions,
    pub storage: StorageOptions,
    pub cache: CacheOptions,
    pub export: ExportOptions,
}

impl AppConfig {
    fn post_load(&mut self, paths: &ConfigPaths) -> Result<()> {
        self.storage
            .resolve(paths)
            .context("resolving storage paths")?;
        self.cache.resolve(paths);
        self.export.resolve(paths);
        if self.cache.version.trim().is_empty() {
            tracing::warn!("empty cache version in config, falling back to the default");
            self.cache.version = CacheOptions::default().version;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NoteOptions {
    /// Title given to a note created without one.
    pub new_note_title: String,
    /// Stored in place of an empty title.
    pub untitled_placeholder: String,
}

impl Default for NoteOptions {
    fn default() -> Self {
        Self {
            new_note_title: "New Note".into(),
            untitled_placeholder: "Untitled".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageOptions {
    #[serde(skip)]
    pub database_path: PathBuf,
    pub wal_autocheckpoint: u32,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            database_path: PathBuf::new(),
            wal_autocheckpoint: 1000,
        }
    }
}

impl StorageOptions {
    fn resolve(&mut self, paths: &ConfigPaths) -> Result<()> {
        if self.database_path.as_os_str().is_empty() {
            self.database_path = paths.database_path.clone();
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheOptions {
    /// Bucket name of the current application shell generation.
    pub version: String,
    /// Files pre-cached on install.
    pub shell_files: Vec<String>,
    /// Origin whose URLs are treated as same-origin requests.
    pub origin: String,
    /// Directory served for that origin; defaults to `<data>/public`.
    pub origin_dir: PathBuf,
    pub skip_waiting: bool,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            version: "my-note-v1".into(),
            shell_files: [
                "./",
                "./index.html",
                "./css/style.css",
                "./js/app.js",
                "./js/sw-register.js",
                "./manifest.json",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            origin: "http://localhost".into(),
            origin_dir: PathBuf::new(),
            skip_waiting: true,
        }
    }
}

impl CacheOptions {
    fn resolve(&mut self, paths: &ConfigPaths) {
        if self.origin_dir.as_os_str().is_empty() {
            self.origin_dir = paths.origin_dir.clone();
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportOptions {
    /// Where `export` writes backups unless told otherwise.
    pub dir: PathBuf,
}

impl ExportOptions {
    fn resolve(&mut self, paths: &ConfigPaths) {
        if self.dir.as_os_str().is_empty() {
            self.dir = paths.backup_dir.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tests::temp_paths;
    use tempfile::TempDir;

    #[test]
    fn load_or_init_writes_defaults_and_resolves_paths() -> Result<()> {
        let temp = TempDir::new()?;
        let paths = temp_paths(&temp);
        let loader = ConfigLoader::with_paths(paths.clone());

        let cfg = loader.load_or_init()?;
        assert!(paths.config_file.exists());
        assert_eq!(cfg.cache.version, "my-note-v1");
        assert_eq!(cfg.cache.shell_files.len(), 6);
        assert_eq!(cfg.storage.database_path, paths.database_path);
        assert_eq!(cfg.cache.origin_dir, paths.origin_dir);
        assert_eq!(cfg.export.dir, paths.backup_dir);
        Ok(())
    }

    #[test]
    fn partial_config_keeps_defaults_for_missing_sections() -> Result<()> {
        let temp = TempDir::new()?;
        let paths = temp_paths(&temp);
        paths.ensure_directories()?;
        fs::write(
            &paths.config_file,
            "[cache]\nversion = \"my-note-v7\"\nskip_waiting = false\n",
        )?;

        let cfg = ConfigLoader::with_paths(paths).load()?;
        assert_eq!(cfg.cache.version, "my-note-v7");
        assert!(!cfg.cache.skip_waiting);
        assert_eq!(cfg.cache.origin, "http://localhost");
        assert_eq!(cfg.notes.untitled_placeholder, "Untitled");
        Ok(())
    }

    #[test]
    fn blank_cache_version_falls_back_to_default() -> Result<()> {
        let temp = TempDir::new()?;
        let paths = temp_paths(&temp);
        paths.ensure_directories()?;
        fs::write(&paths.config_file, "[cache]\nversion = \"  \"\n")?;

        let cfg = ConfigLoader::with_paths(paths).load()?;
        assert_eq!(cfg.cache.version, "my-note-v1");
        Ok(())
    }
}
