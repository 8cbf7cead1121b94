use anyhow::{Context, Result};
use rusqlite::Connection;

pub fn apply(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA foreign_keys = ON;
        CREATE TABLE IF NOT EXISTS local_storage (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS cache_buckets (
            name TEXT PRIMARY KEY,
            created_at INTEGER NOT NULL,
            seq INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS cache_entries (
            bucket TEXT NOT NULL,
            url TEXT NOT NULL,
            status INTEGER NOT NULL,
            kind TEXT NOT NULL,
            headers TEXT NOT NULL,
            body BLOB NOT NULL,
            stored_at INTEGER NOT NULL,
            PRIMARY KEY (bucket, url),
            FOREIGN KEY (bucket) REFERENCES cache_buckets(name) ON DELETE CASCADE
        );
        "#,
    )
    .context("applying schema migrations")?;
    Ok(())
}
