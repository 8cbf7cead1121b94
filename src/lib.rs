pub mod cli;
pub mod config;
pub mod notes;
pub mod storage;
pub mod worker;

pub use config::{AppConfig, ConfigLoader, ConfigPaths};
pub use notes::{Note, NoteId, NoteStore};
pub use storage::{KeyValueStore, MemoryStorage, StorageHandle};
pub use worker::{CacheWorker, Registration};
