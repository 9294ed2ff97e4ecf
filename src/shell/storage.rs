//! Cache generation storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use url::Url;

use super::request::ShellResponse;

/// A single cached response.
#[derive(Debug, Clone)]
pub struct CachedEntry {
  pub response: ShellResponse,
  /// When the entry was stored
  pub cached_at: DateTime<Utc>,
}

/// Trait for cache storage backends.
///
/// A cache is identified by name (e.g. "shell-v51"); each operation is
/// atomic at the storage layer.
pub trait CacheStorage: Send + Sync {
  /// Store (or replace) the response for `url` in `cache`.
  fn put(&self, cache: &str, url: &Url, response: &ShellResponse) -> Result<()>;

  /// Look up `url` in `cache`. With `ignore_query` any entry with the same
  /// URL minus its query string matches, most recently stored first.
  fn get(&self, cache: &str, url: &Url, ignore_query: bool) -> Result<Option<CachedEntry>>;

  /// Names of every cache holding at least one entry.
  fn cache_names(&self) -> Result<Vec<String>>;

  /// Delete a whole cache. Returns false if it held nothing.
  fn delete_cache(&self, cache: &str) -> Result<bool>;

  /// Delete every cache. Returns the number of entries removed.
  fn delete_all(&self) -> Result<usize>;

  fn get_meta(&self, key: &str) -> Result<Option<String>>;

  fn set_meta(&self, key: &str, value: &str) -> Result<()>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteCacheStorage {
  conn: Mutex<Connection>,
}

impl SqliteCacheStorage {
  pub fn open(path: &Path) -> Result<Self> {
    let conn = crate::db::open(path)?;
    Ok(Self::from_connection(conn))
  }

  pub fn from_connection(conn: Connection) -> Self {
    Self {
      conn: Mutex::new(conn),
    }
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// SHA256 of the full URL for stable, fixed-length keys.
fn url_hash(url: &Url) -> String {
  let mut hasher = Sha256::new();
  hasher.update(url.as_str().as_bytes());
  hex::encode(hasher.finalize())
}

fn without_query(url: &Url) -> String {
  let mut url = url.clone();
  url.set_query(None);
  url.set_fragment(None);
  url.to_string()
}

impl CacheStorage for SqliteCacheStorage {
  fn put(&self, cache: &str, url: &Url, response: &ShellResponse) -> Result<()> {
    let conn = self.conn()?;
    let headers = serde_json::to_string(&response.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO cache_entries
           (cache_name, url_hash, url, url_without_query, status, headers, body, stored_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, datetime('now'))",
        params![
          cache,
          url_hash(url),
          url.as_str(),
          without_query(url),
          response.status,
          headers,
          response.body,
        ],
      )
      .map_err(|e| eyre!("Failed to store {} in {}: {}", url, cache, e))?;

    Ok(())
  }

  fn get(&self, cache: &str, url: &Url, ignore_query: bool) -> Result<Option<CachedEntry>> {
    let conn = self.conn()?;

    let row: Option<(u16, String, Vec<u8>, String)> = if ignore_query {
      conn
        .query_row(
          "SELECT status, headers, body, stored_at FROM cache_entries
           WHERE cache_name = ? AND url_without_query = ?
           ORDER BY stored_at DESC, rowid DESC LIMIT 1",
          params![cache, without_query(url)],
          |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .optional()
    } else {
      conn
        .query_row(
          "SELECT status, headers, body, stored_at FROM cache_entries
           WHERE cache_name = ? AND url_hash = ?",
          params![cache, url_hash(url)],
          |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .optional()
    }
    .map_err(|e| eyre!("Failed to look up {} in {}: {}", url, cache, e))?;

    match row {
      Some((status, headers, body, stored_at)) => {
        let headers: Vec<(String, String)> = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers: {}", e))?;
        Ok(Some(CachedEntry {
          response: ShellResponse {
            status,
            headers,
            body,
          },
          cached_at: parse_datetime(&stored_at)?,
        }))
      }
      None => Ok(None),
    }
  }

  fn cache_names(&self) -> Result<Vec<String>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare("SELECT DISTINCT cache_name FROM cache_entries ORDER BY cache_name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list caches: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache name: {}", e))?;

    Ok(names)
  }

  fn delete_cache(&self, cache: &str) -> Result<bool> {
    let conn = self.conn()?;
    let removed = conn
      .execute("DELETE FROM cache_entries WHERE cache_name = ?", params![cache])
      .map_err(|e| eyre!("Failed to delete cache {}: {}", cache, e))?;
    Ok(removed > 0)
  }

  fn delete_all(&self) -> Result<usize> {
    let conn = self.conn()?;
    let removed = conn
      .execute("DELETE FROM cache_entries", [])
      .map_err(|e| eyre!("Failed to purge caches: {}", e))?;
    Ok(removed)
  }

  fn get_meta(&self, key: &str) -> Result<Option<String>> {
    let conn = self.conn()?;
    conn
      .query_row(
        "SELECT value FROM shell_meta WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read shell metadata {}: {}", key, e))
  }

  fn set_meta(&self, key: &str, value: &str) -> Result<()> {
    let conn = self.conn()?;
    conn
      .execute(
        "INSERT OR REPLACE INTO shell_meta (key, value) VALUES (?, ?)",
        params![key, value],
      )
      .map_err(|e| eyre!("Failed to write shell metadata {}: {}", key, e))?;
    Ok(())
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn storage() -> SqliteCacheStorage {
    SqliteCacheStorage::from_connection(crate::db::open_in_memory().unwrap())
  }

  fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
  }

  #[test]
  fn test_put_then_get_exact() {
    let storage = storage();
    let response = ShellResponse::new(200, "body").with_header("content-type", "text/css");
    storage
      .put("runtime-v1", &url("https://app.test/style.css?v=54"), &response)
      .unwrap();

    let hit = storage
      .get("runtime-v1", &url("https://app.test/style.css?v=54"), false)
      .unwrap()
      .unwrap();
    assert_eq!(hit.response, response);

    assert!(storage
      .get("runtime-v1", &url("https://app.test/style.css?v=55"), false)
      .unwrap()
      .is_none());
    assert!(storage
      .get("shell-v1", &url("https://app.test/style.css?v=54"), false)
      .unwrap()
      .is_none());
  }

  #[test]
  fn test_ignore_query_matches_any_search() {
    let storage = storage();
    storage
      .put(
        "shell-v1",
        &url("https://app.test/salida.html?v=51"),
        &ShellResponse::new(200, "page"),
      )
      .unwrap();

    let hit = storage
      .get("shell-v1", &url("https://app.test/salida.html?from=menu"), true)
      .unwrap()
      .unwrap();
    assert_eq!(hit.response.body, b"page");
  }

  #[test]
  fn test_put_replaces_existing_entry() {
    let storage = storage();
    let u = url("https://app.test/app.js");
    storage
      .put("runtime-v1", &u, &ShellResponse::new(200, "old"))
      .unwrap();
    storage
      .put("runtime-v1", &u, &ShellResponse::new(200, "new"))
      .unwrap();

    let hit = storage.get("runtime-v1", &u, false).unwrap().unwrap();
    assert_eq!(hit.response.body, b"new");
    assert_eq!(storage.cache_names().unwrap(), vec!["runtime-v1"]);
  }

  #[test]
  fn test_delete_cache_and_purge() {
    let storage = storage();
    let u = url("https://app.test/");
    storage.put("shell-v1", &u, &ShellResponse::new(200, "a")).unwrap();
    storage.put("shell-v2", &u, &ShellResponse::new(200, "b")).unwrap();
    storage.put("runtime-v2", &u, &ShellResponse::new(200, "c")).unwrap();

    assert!(storage.delete_cache("shell-v1").unwrap());
    assert!(!storage.delete_cache("shell-v1").unwrap());
    assert_eq!(
      storage.cache_names().unwrap(),
      vec!["runtime-v2", "shell-v2"]
    );

    assert_eq!(storage.delete_all().unwrap(), 2);
    assert!(storage.cache_names().unwrap().is_empty());
  }

  #[test]
  fn test_meta_roundtrip() {
    let storage = storage();
    assert_eq!(storage.get_meta("active_version").unwrap(), None);
    storage.set_meta("active_version", "v51").unwrap();
    storage.set_meta("active_version", "v52").unwrap();
    assert_eq!(
      storage.get_meta("active_version").unwrap().as_deref(),
      Some("v52")
    );
  }
}
