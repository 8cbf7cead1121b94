//! Named cache buckets of stored responses, keyed by normalized URL.

use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use indexmap::IndexMap;
use parking_lot::Mutex;
use rusqlite::{params, OptionalExtension};
use time::OffsetDateTime;

use crate::storage::StorageHandle;
use crate::worker::network::{Response, ResponseType};

pub trait CacheStorage {
    /// Creates the bucket if it does not exist yet.
    fn open(&self, bucket: &str) -> Result<()>;

    fn has(&self, bucket: &str) -> Result<bool>;

    /// Bucket names in creation order.
    fn keys(&self) -> Result<Vec<String>>;

    /// Returns whether a bucket was removed.
    fn delete(&self, bucket: &str) -> Result<bool>;

    /// Stores `response` under `url`, opening the bucket first if needed.
    fn put(&self, bucket: &str, url: &str, response: &Response) -> Result<()>;

    fn match_in(&self, bucket: &str, url: &str) -> Result<Option<Response>>;

    /// URLs stored in `bucket`, oldest first.
    fn entries(&self, bucket: &str) -> Result<Vec<String>>;

    /// First match across all buckets, searched in creation order.
    fn match_any(&self, url: &str) -> Result<Option<Response>> {
        for bucket in self.keys()? {
            if let Some(response) = self.match_in(&bucket, url)? {
                return Ok(Some(response));
            }
        }
        Ok(None)
    }
}

impl<T: CacheStorage + ?Sized> CacheStorage for &T {
    fn open(&self, bucket: &str) -> Result<()> {
        (**self).open(bucket)
    }

    fn has(&self, bucket: &str) -> Result<bool> {
        (**self).has(bucket)
    }

    fn keys(&self) -> Result<Vec<String>> {
        (**self).keys()
    }

    fn delete(&self, bucket: &str) -> Result<bool> {
        (**self).delete(bucket)
    }

    fn put(&self, bucket: &str, url: &str, response: &Response) -> Result<()> {
        (**self).put(bucket, url, response)
    }

    fn match_in(&self, bucket: &str, url: &str) -> Result<Option<Response>> {
        (**self).match_in(bucket, url)
    }

    fn entries(&self, bucket: &str) -> Result<Vec<String>> {
        (**self).entries(bucket)
    }
}

impl<T: CacheStorage + ?Sized> CacheStorage for Arc<T> {
    fn open(&self, bucket: &str) -> Result<()> {
        (**self).open(bucket)
    }

    fn has(&self, bucket: &str) -> Result<bool> {
        (**self).has(bucket)
    }

    fn keys(&self) -> Result<Vec<String>> {
        (**self).keys()
    }

    fn delete(&self, bucket: &str) -> Result<bool> {
        (**self).delete(bucket)
    }

    fn put(&self, bucket: &str, url: &str, response: &Response) -> Result<()> {
        (**self).put(bucket, url, response)
    }

    fn match_in(&self, bucket: &str, url: &str) -> Result<Option<Response>> {
        (**self).match_in(bucket, url)
    }

    fn entries(&self, bucket: &str) -> Result<Vec<String>> {
        (**self).entries(bucket)
    }
}

/// Buckets kept in the application database next to local storage.
#[derive(Clone)]
pub struct SqliteCache {
    storage: StorageHandle,
}

impl SqliteCache {
    pub fn new(storage: StorageHandle) -> Self {
        Self { storage }
    }
}

impl CacheStorage for SqliteCache {
    fn open(&self, bucket: &str) -> Result<()> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        self.storage.with_connection(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO cache_buckets (name, created_at, seq)
                 VALUES (?1, ?2, (SELECT COALESCE(MAX(seq), 0) + 1 FROM cache_buckets))",
                params![bucket, now],
            )
            .with_context(|| format!("opening cache bucket {bucket}"))?;
            Ok(())
        })
    }

    fn has(&self, bucket: &str) -> Result<bool> {
        self.storage.with_connection(|conn| {
            let exists = conn
                .query_row(
                    "SELECT 1 FROM cache_buckets WHERE name = ?1",
                    params![bucket],
                    |_row| Ok(()),
                )
                .optional()?
                .is_some();
            Ok(exists)
        })
    }

    fn keys(&self) -> Result<Vec<String>> {
        self.storage.with_connection(|conn| {
            let mut stmt = conn.prepare("SELECT name FROM cache_buckets ORDER BY seq")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            rows.collect::<Result<Vec<_>, _>>()
                .context("listing cache buckets")
        })
    }

    fn delete(&self, bucket: &str) -> Result<bool> {
        self.storage.with_connection(|conn| {
            let removed = conn
                .execute("DELETE FROM cache_buckets WHERE name = ?1", params![bucket])
                .with_context(|| format!("deleting cache bucket {bucket}"))?;
            Ok(removed > 0)
        })
    }

    fn put(&self, bucket: &str, url: &str, response: &Response) -> Result<()> {
        self.open(bucket)?;
        let headers =
            serde_json::to_string(&response.headers).context("serialising response headers")?;
        let kind: &'static str = response.kind.into();
        let now = OffsetDateTime::now_utc().unix_timestamp();
        self.storage.with_connection(|conn| {
            conn.execute(
                "INSERT INTO cache_entries (bucket, url, status, kind, headers, body, stored_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(bucket, url) DO UPDATE SET status = excluded.status,
                                                        kind = excluded.kind,
                                                        headers = excluded.headers,
                                                        body = excluded.body,
                                                        stored_at = excluded.stored_at",
                params![bucket, url, response.status, kind, headers, response.body, now],
            )
            .with_context(|| format!("caching {url} in {bucket}"))?;
            Ok(())
        })
    }

    fn match_in(&self, bucket: &str, url: &str) -> Result<Option<Response>> {
        let row = self.storage.with_connection(|conn| {
            conn.query_row(
                "SELECT status, kind, headers, body FROM cache_entries
                 WHERE bucket = ?1 AND url = ?2",
                params![bucket, url],
                |row| {
                    Ok((
                        row.get::<_, u16>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Vec<u8>>(3)?,
                    ))
                },
            )
            .optional()
            .with_context(|| format!("matching {url} in {bucket}"))
        })?;
        let Some((status, kind, headers, body)) = row else {
            return Ok(None);
        };
        let kind = ResponseType::from_str(&kind)
            .map_err(|_| anyhow!("unknown response type '{kind}' cached for {url}"))?;
        let headers = serde_json::from_str(&headers)
            .with_context(|| format!("parsing cached headers for {url}"))?;
        Ok(Some(Response {
            status,
            kind,
            headers,
            body,
        }))
    }

    fn entries(&self, bucket: &str) -> Result<Vec<String>> {
        self.storage.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT url FROM cache_entries WHERE bucket = ?1 ORDER BY stored_at, rowid",
            )?;
            let rows = stmt.query_map(params![bucket], |row| row.get::<_, String>(0))?;
            rows.collect::<Result<Vec<_>, _>>()
                .with_context(|| format!("listing entries of {bucket}"))
        })
    }
}

/// In-process buckets, insertion ordered.
#[derive(Debug, Default)]
pub struct MemoryCache {
    buckets: Mutex<IndexMap<String, IndexMap<String, Response>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheStorage for MemoryCache {
    fn open(&self, bucket: &str) -> Result<()> {
        self.buckets.lock().entry(bucket.to_string()).or_default();
        Ok(())
    }

    fn has(&self, bucket: &str) -> Result<bool> {
        Ok(self.buckets.lock().contains_key(bucket))
    }

    fn keys(&self) -> Result<Vec<String>> {
        Ok(self.buckets.lock().keys().cloned().collect())
    }

    fn delete(&self, bucket: &str) -> Result<bool> {
        Ok(self.buckets.lock().shift_remove(bucket).is_some())
    }

    fn put(&self, bucket: &str, url: &str, response: &Response) -> Result<()> {
        self.buckets
            .lock()
            .entry(bucket.to_string())
            .or_default()
            .insert(url.to_string(), response.clone());
        Ok(())
    }

    fn match_in(&self, bucket: &str, url: &str) -> Result<Option<Response>> {
        Ok(self
            .buckets
            .lock()
            .get(bucket)
            .and_then(|entries| entries.get(url))
            .cloned())
    }

    fn entries(&self, bucket: &str) -> Result<Vec<String>> {
        Ok(self
            .buckets
            .lock()
            .get(bucket)
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tests::init_storage;

    fn exercise(cache: &dyn CacheStorage) -> Result<()> {
        cache.open("my-note-v1")?;
        cache.open("my-note-v2")?;
        cache.open("my-note-v1")?;
        assert_eq!(cache.keys()?, vec!["my-note-v1", "my-note-v2"]);

        let old = Response::basic(200, "text/html", "old");
        let new = Response::basic(200, "text/html", "new");
        cache.put("my-note-v1", "/index.html", &old)?;
        cache.put("my-note-v2", "/index.html", &new)?;
        cache.put("my-note-v2", "/app.js", &new)?;

        assert_eq!(cache.match_in("my-note-v2", "/index.html")?, Some(new.clone()));
        assert_eq!(cache.match_any("/index.html")?, Some(old));
        assert_eq!(cache.match_any("/missing")?, None);
        assert_eq!(cache.entries("my-note-v2")?, vec!["/index.html", "/app.js"]);

        assert!(cache.delete("my-note-v1")?);
        assert!(!cache.delete("my-note-v1")?);
        assert!(!cache.has("my-note-v1")?);
        assert_eq!(cache.match_any("/index.html")?, Some(new));
        assert!(cache.entries("my-note-v1")?.is_empty());
        Ok(())
    }

    #[test]
    fn memory_cache_semantics() -> Result<()> {
        exercise(&MemoryCache::new())
    }

    #[test]
    fn sqlite_cache_semantics() -> Result<()> {
        let (_temp, storage) = init_storage()?;
        exercise(&SqliteCache::new(storage))
    }

    #[test]
    fn sqlite_cache_round_trips_response_fields() -> Result<()> {
        let (_temp, storage) = init_storage()?;
        let cache = SqliteCache::new(storage);
        let response = Response {
            status: 200,
            kind: ResponseType::Basic,
            headers: vec![
                ("content-type".into(), "text/css".into()),
                ("etag".into(), "\"abc\"".into()),
            ],
            body: vec![0, 159, 146, 150],
        };
        cache.put("my-note-v1", "/css/style.css", &response)?;
        assert_eq!(
            cache.match_in("my-note-v1", "/css/style.css")?,
            Some(response)
        );
        Ok(())
    }
}
