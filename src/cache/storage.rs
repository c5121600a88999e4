//! Cache store trait and SQLite implementation.

use chrono::{DateTime, SecondsFormat, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::traits::{CacheEntry, CacheHandle, EntryValue};
use crate::request::CacheKey;

/// Key/value blob storage partitioned into named namespaces.
///
/// Every put/delete is atomic at the key level; there are no cross-key transactions
/// except [`CacheStore::put_all`].
pub trait CacheStore: Send + Sync {
  /// Open a namespace, creating it (not ready) if missing.
  fn open(&self, namespace: &str) -> Result<CacheHandle>;

  /// Store an entry, replacing any entry with the same key.
  fn put(&self, handle: &CacheHandle, entry: &CacheEntry) -> Result<()>;

  /// Store all entries in one transaction: either every entry lands or none does.
  fn put_all(&self, handle: &CacheHandle, entries: &[CacheEntry]) -> Result<()>;

  fn get(&self, handle: &CacheHandle, key: &CacheKey) -> Result<Option<CacheEntry>>;

  /// Delete an entry. Returns whether it existed.
  fn delete(&self, handle: &CacheHandle, key: &CacheKey) -> Result<bool>;

  /// Delete `entry` only while the stored row is still the one that was read:
  /// same insertion time and attempt count. A newer put under the same key
  /// survives. Returns whether a row was deleted.
  fn delete_if_unchanged(&self, handle: &CacheHandle, entry: &CacheEntry) -> Result<bool>;

  /// Overwrite `previous` with `updated` under the same rule as
  /// [`CacheStore::delete_if_unchanged`]. Returns whether the row was replaced.
  fn replace_if_unchanged(
    &self,
    handle: &CacheHandle,
    previous: &CacheEntry,
    updated: &CacheEntry,
  ) -> Result<bool>;

  fn keys(&self, handle: &CacheHandle) -> Result<Vec<CacheKey>>;

  /// All entries of a namespace in insertion order.
  fn entries(&self, handle: &CacheHandle) -> Result<Vec<CacheEntry>>;

  /// Remove every entry but keep the namespace.
  fn clear(&self, handle: &CacheHandle) -> Result<()>;

  /// Look up a stored response across all namespaces, ready namespaces first.
  fn match_any(&self, key: &CacheKey) -> Result<Option<CacheEntry>>;

  fn mark_ready(&self, handle: &CacheHandle) -> Result<()>;

  fn is_ready(&self, namespace: &str) -> Result<bool>;

  fn list_namespaces(&self) -> Result<Vec<String>>;

  /// Delete a namespace with all its entries. Returns whether it existed.
  fn delete_namespace(&self, namespace: &str) -> Result<bool>;
}

/// SQLite-based cache store.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the store at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Open a private in-memory store.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::with_connection(conn)
  }

  /// Get the default database path inside `data_dir`.
  pub fn default_path(data_dir: Option<&Path>) -> Result<PathBuf> {
    let data_dir = match data_dir {
      Some(dir) => dir.to_path_buf(),
      None => default_data_dir()?,
    };
    Ok(data_dir.join("cache.db"))
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Default data directory for the database and log files.
pub fn default_data_dir() -> Result<PathBuf> {
  let data_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?;

  Ok(data_dir.join("offline-relay"))
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cache_namespaces (
    name TEXT PRIMARY KEY,
    ready INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

-- One row per request identity; data holds the serialized response or request
CREATE TABLE IF NOT EXISTS cache_entries (
    namespace TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    kind TEXT NOT NULL,
    data BLOB NOT NULL,
    inserted_at TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    next_attempt_at TEXT,
    last_error TEXT,
    PRIMARY KEY (namespace, key_hash)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_hash ON cache_entries(key_hash);
"#;

const ENTRY_COLUMNS: &str =
  "e.method, e.url, e.data, e.inserted_at, e.attempts, e.next_attempt_at, e.last_error";

/// Row as read from SQLite, before the payload is decoded.
struct RawEntry {
  method: String,
  url: String,
  data: Vec<u8>,
  inserted_at: String,
  attempts: u32,
  next_attempt_at: Option<String>,
  last_error: Option<String>,
}

impl RawEntry {
  fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      method: row.get(0)?,
      url: row.get(1)?,
      data: row.get(2)?,
      inserted_at: row.get(3)?,
      attempts: row.get(4)?,
      next_attempt_at: row.get(5)?,
      last_error: row.get(6)?,
    })
  }

  fn into_entry(self) -> Result<CacheEntry> {
    let value: EntryValue = serde_json::from_slice(&self.data)
      .map_err(|e| eyre!("Failed to deserialize entry {} {}: {}", self.method, self.url, e))?;

    Ok(CacheEntry {
      key: CacheKey {
        method: self.method,
        url: self.url,
      },
      value,
      inserted_at: parse_datetime(&self.inserted_at)?,
      attempts: self.attempts,
      next_attempt_at: self
        .next_attempt_at
        .as_deref()
        .map(parse_datetime)
        .transpose()?,
      last_error: self.last_error,
    })
  }
}

fn ensure_namespace(conn: &Connection, namespace: &str) -> Result<()> {
  conn
    .execute(
      "INSERT OR IGNORE INTO cache_namespaces (name, ready, created_at) VALUES (?, 0, ?)",
      params![namespace, format_datetime(Utc::now())],
    )
    .map_err(|e| eyre!("Failed to open namespace {}: {}", namespace, e))?;
  Ok(())
}

fn insert_entry(conn: &Connection, namespace: &str, entry: &CacheEntry) -> Result<()> {
  let data = serde_json::to_vec(&entry.value)
    .map_err(|e| eyre!("Failed to serialize entry {}: {}", entry.key, e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO cache_entries
         (namespace, key_hash, method, url, kind, data, inserted_at, attempts, next_attempt_at, last_error)
       VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
      params![
        namespace,
        entry.key.hash(),
        entry.key.method,
        entry.key.url,
        entry.kind().as_str(),
        data,
        format_datetime(entry.inserted_at),
        entry.attempts,
        entry.next_attempt_at.map(format_datetime),
        entry.last_error,
      ],
    )
    .map_err(|e| eyre!("Failed to store entry {}: {}", entry.key, e))?;

  Ok(())
}

impl CacheStore for SqliteStorage {
  fn open(&self, namespace: &str) -> Result<CacheHandle> {
    let conn = self.conn()?;
    ensure_namespace(&conn, namespace)?;
    Ok(CacheHandle::new(namespace))
  }

  fn put(&self, handle: &CacheHandle, entry: &CacheEntry) -> Result<()> {
    let conn = self.conn()?;
    ensure_namespace(&conn, handle.name())?;
    insert_entry(&conn, handle.name(), entry)
  }

  fn put_all(&self, handle: &CacheHandle, entries: &[CacheEntry]) -> Result<()> {
    let mut conn = self.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    ensure_namespace(&tx, handle.name())?;
    for entry in entries {
      insert_entry(&tx, handle.name(), entry)?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn get(&self, handle: &CacheHandle, key: &CacheKey) -> Result<Option<CacheEntry>> {
    let conn = self.conn()?;

    let raw = conn
      .query_row(
        &format!(
          "SELECT {} FROM cache_entries e WHERE e.namespace = ? AND e.key_hash = ?",
          ENTRY_COLUMNS
        ),
        params![handle.name(), key.hash()],
        RawEntry::from_row,
      )
      .optional()
      .map_err(|e| eyre!("Failed to query entry {}: {}", key, e))?;

    raw.map(RawEntry::into_entry).transpose()
  }

  fn delete(&self, handle: &CacheHandle, key: &CacheKey) -> Result<bool> {
    let conn = self.conn()?;
    let deleted = conn
      .execute(
        "DELETE FROM cache_entries WHERE namespace = ? AND key_hash = ?",
        params![handle.name(), key.hash()],
      )
      .map_err(|e| eyre!("Failed to delete entry {}: {}", key, e))?;
    Ok(deleted > 0)
  }

  fn delete_if_unchanged(&self, handle: &CacheHandle, entry: &CacheEntry) -> Result<bool> {
    let conn = self.conn()?;
    let deleted = conn
      .execute(
        "DELETE FROM cache_entries
         WHERE namespace = ? AND key_hash = ? AND inserted_at = ? AND attempts = ?",
        params![
          handle.name(),
          entry.key.hash(),
          format_datetime(entry.inserted_at),
          entry.attempts,
        ],
      )
      .map_err(|e| eyre!("Failed to delete entry {}: {}", entry.key, e))?;
    Ok(deleted > 0)
  }

  fn replace_if_unchanged(
    &self,
    handle: &CacheHandle,
    previous: &CacheEntry,
    updated: &CacheEntry,
  ) -> Result<bool> {
    let data = serde_json::to_vec(&updated.value)
      .map_err(|e| eyre!("Failed to serialize entry {}: {}", updated.key, e))?;

    let conn = self.conn()?;
    let replaced = conn
      .execute(
        "UPDATE cache_entries
         SET kind = ?, data = ?, inserted_at = ?, attempts = ?, next_attempt_at = ?, last_error = ?
         WHERE namespace = ? AND key_hash = ? AND inserted_at = ? AND attempts = ?",
        params![
          updated.kind().as_str(),
          data,
          format_datetime(updated.inserted_at),
          updated.attempts,
          updated.next_attempt_at.map(format_datetime),
          updated.last_error,
          handle.name(),
          previous.key.hash(),
          format_datetime(previous.inserted_at),
          previous.attempts,
        ],
      )
      .map_err(|e| eyre!("Failed to update entry {}: {}", previous.key, e))?;
    Ok(replaced > 0)
  }

  fn keys(&self, handle: &CacheHandle) -> Result<Vec<CacheKey>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare("SELECT method, url FROM cache_entries WHERE namespace = ? ORDER BY inserted_at")
      .map_err(|e| eyre!("Failed to prepare key query: {}", e))?;

    let keys = stmt
      .query_map(params![handle.name()], |row| {
        Ok(CacheKey {
          method: row.get(0)?,
          url: row.get(1)?,
        })
      })
      .map_err(|e| eyre!("Failed to list keys: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read key: {}", e))?;

    Ok(keys)
  }

  fn entries(&self, handle: &CacheHandle) -> Result<Vec<CacheEntry>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare(&format!(
        "SELECT {} FROM cache_entries e WHERE e.namespace = ? ORDER BY e.inserted_at",
        ENTRY_COLUMNS
      ))
      .map_err(|e| eyre!("Failed to prepare entry query: {}", e))?;

    let raw = stmt
      .query_map(params![handle.name()], RawEntry::from_row)
      .map_err(|e| eyre!("Failed to list entries: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read entry: {}", e))?;

    raw.into_iter().map(RawEntry::into_entry).collect()
  }

  fn clear(&self, handle: &CacheHandle) -> Result<()> {
    let conn = self.conn()?;
    conn
      .execute(
        "DELETE FROM cache_entries WHERE namespace = ?",
        params![handle.name()],
      )
      .map_err(|e| eyre!("Failed to clear namespace {}: {}", handle.name(), e))?;
    Ok(())
  }

  fn match_any(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
    let conn = self.conn()?;

    let raw = conn
      .query_row(
        &format!(
          "SELECT {} FROM cache_entries e
           INNER JOIN cache_namespaces n ON n.name = e.namespace
           WHERE e.key_hash = ? AND e.kind = 'cached_read'
           ORDER BY n.ready DESC, n.created_at DESC
           LIMIT 1",
          ENTRY_COLUMNS
        ),
        params![key.hash()],
        RawEntry::from_row,
      )
      .optional()
      .map_err(|e| eyre!("Failed to match {}: {}", key, e))?;

    raw.map(RawEntry::into_entry).transpose()
  }

  fn mark_ready(&self, handle: &CacheHandle) -> Result<()> {
    let conn = self.conn()?;
    conn
      .execute(
        "UPDATE cache_namespaces SET ready = 1 WHERE name = ?",
        params![handle.name()],
      )
      .map_err(|e| eyre!("Failed to mark namespace {} ready: {}", handle.name(), e))?;
    Ok(())
  }

  fn is_ready(&self, namespace: &str) -> Result<bool> {
    let conn = self.conn()?;
    let ready: Option<bool> = conn
      .query_row(
        "SELECT ready FROM cache_namespaces WHERE name = ?",
        params![namespace],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to query namespace {}: {}", namespace, e))?;
    Ok(ready.unwrap_or(false))
  }

  fn list_namespaces(&self) -> Result<Vec<String>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare("SELECT name FROM cache_namespaces ORDER BY created_at, name")
      .map_err(|e| eyre!("Failed to prepare namespace query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list namespaces: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read namespace: {}", e))?;

    Ok(names)
  }

  fn delete_namespace(&self, namespace: &str) -> Result<bool> {
    let mut conn = self.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "DELETE FROM cache_entries WHERE namespace = ?",
      params![namespace],
    )
    .map_err(|e| eyre!("Failed to delete entries of {}: {}", namespace, e))?;

    let deleted = tx
      .execute(
        "DELETE FROM cache_namespaces WHERE name = ?",
        params![namespace],
      )
      .map_err(|e| eyre!("Failed to delete namespace {}: {}", namespace, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(deleted > 0)
  }
}

/// Fixed-width RFC 3339 so stored timestamps sort lexically.
fn format_datetime(at: DateTime<Utc>) -> String {
  at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 timestamp as written by this store.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
