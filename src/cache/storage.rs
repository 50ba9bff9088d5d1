//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension};

use super::traits::{Request, Response};
use crate::db::Database;

const ACTIVE_GENERATION_KEY: &str = "agent.active_generation";

/// A single cached response.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  pub response: Response,
  /// When the response was cached
  pub cached_at: DateTime<Utc>,
}

/// Trait for named cache stores.
pub trait CacheStorage: Send + Sync {
  /// Create a store if it does not exist.
  fn open_store(&self, name: &str) -> Result<()>;

  fn has_store(&self, name: &str) -> Result<bool>;

  /// All store names, sorted.
  fn store_names(&self) -> Result<Vec<String>>;

  /// Delete a store and its entries. Returns false if it did not exist.
  fn delete_store(&self, name: &str) -> Result<bool>;

  /// Store one response, replacing any entry for the same request.
  fn put(&self, store: &str, request: &Request, response: &Response) -> Result<()>;

  /// Store a whole set atomically: either every entry lands or none does.
  fn put_all(&self, store: &str, entries: &[(Request, Response)]) -> Result<()>;

  /// Look up a response by request identity.
  fn match_request(&self, store: &str, request: &Request) -> Result<Option<CachedResponse>>;

  /// The generation tag of the active agent, if one was ever activated.
  fn active_generation(&self) -> Result<Option<String>>;

  fn set_active_generation(&self, version: &str) -> Result<()>;
}

/// SQLite-based cache storage implementation.
#[derive(Clone)]
pub struct SqliteStorage {
  db: Database,
}

impl SqliteStorage {
  pub fn new(db: Database) -> Self {
    Self { db }
  }
}

fn insert_entry(
  conn: &rusqlite::Connection,
  store: &str,
  request: &Request,
  response: &Response,
) -> Result<()> {
  let headers = serde_json::to_string(&response.headers)
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO cache_entries (store, request_key, request_identity, status, headers, body, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        store,
        request.cache_key(),
        request.identity(),
        response.status,
        headers,
        response.body
      ],
    )
    .map_err(|e| eyre!("Failed to store cache entry: {}", e))?;
  Ok(())
}

impl CacheStorage for SqliteStorage {
  fn open_store(&self, name: &str) -> Result<()> {
    self
      .db
      .conn()?
      .execute(
        "INSERT OR IGNORE INTO cache_stores (name) VALUES (?)",
        params![name],
      )
      .map_err(|e| eyre!("Failed to open cache store '{}': {}", name, e))?;
    Ok(())
  }

  fn has_store(&self, name: &str) -> Result<bool> {
    self
      .db
      .conn()?
      .query_row(
        "SELECT EXISTS(SELECT 1 FROM cache_stores WHERE name = ?)",
        params![name],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to check cache store '{}': {}", name, e))
  }

  fn store_names(&self) -> Result<Vec<String>> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare("SELECT name FROM cache_stores ORDER BY name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list cache stores: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache store name: {}", e))?;
    Ok(names)
  }

  fn delete_store(&self, name: &str) -> Result<bool> {
    let mut conn = self.db.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM cache_entries WHERE store = ?", params![name])
      .map_err(|e| eyre!("Failed to delete entries of '{}': {}", name, e))?;
    let removed = tx
      .execute("DELETE FROM cache_stores WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete cache store '{}': {}", name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    Ok(removed > 0)
  }

  fn put(&self, store: &str, request: &Request, response: &Response) -> Result<()> {
    let conn = self.db.conn()?;
    conn
      .execute(
        "INSERT OR IGNORE INTO cache_stores (name) VALUES (?)",
        params![store],
      )
      .map_err(|e| eyre!("Failed to open cache store '{}': {}", store, e))?;
    insert_entry(&conn, store, request, response)
  }

  fn put_all(&self, store: &str, entries: &[(Request, Response)]) -> Result<()> {
    let mut conn = self.db.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "INSERT OR IGNORE INTO cache_stores (name) VALUES (?)",
      params![store],
    )
    .map_err(|e| eyre!("Failed to open cache store '{}': {}", store, e))?;

    for (request, response) in entries {
      insert_entry(&tx, store, request, response)?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    Ok(())
  }

  fn match_request(&self, store: &str, request: &Request) -> Result<Option<CachedResponse>> {
    let conn = self.db.conn()?;

    let row: Option<(u16, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT status, headers, body, cached_at FROM cache_entries
         WHERE store = ? AND request_key = ?",
        params![store, request.cache_key()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up cache entry: {}", e))?;

    match row {
      Some((status, headers, body, cached_at)) => {
        let headers = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers: {}", e))?;
        Ok(Some(CachedResponse {
          response: Response {
            status,
            headers,
            body,
          },
          cached_at: parse_datetime(&cached_at)?,
        }))
      }
      None => Ok(None),
    }
  }

  fn active_generation(&self) -> Result<Option<String>> {
    self.db.get_meta(ACTIVE_GENERATION_KEY)
  }

  fn set_active_generation(&self, version: &str) -> Result<()> {
    self.db.set_meta(ACTIVE_GENERATION_KEY, version)
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

  fn storage() -> SqliteStorage {
    SqliteStorage::new(Database::open_in_memory().unwrap())
  }

  #[test]
  fn test_put_and_match() {
    let s = storage();
    let req = Request::get_str("https://app.example.com/logo.svg").unwrap();
    let mut resp = Response::new(200, "<svg/>");
    resp.headers.push(("content-type".into(), "image/svg+xml".into()));

    s.put("runtime", &req, &resp).unwrap();
    let hit = s.match_request("runtime", &req).unwrap().unwrap();
    assert_eq!(hit.response, resp);
    assert!(s.has_store("runtime").unwrap());

    // Same request, other store
    assert!(s.match_request("precache-v1", &req).unwrap().is_none());
  }

  #[test]
  fn test_put_replaces_entry() {
    let s = storage();
    let req = Request::get_str("https://app.example.com/a").unwrap();
    s.put("runtime", &req, &Response::new(200, "old")).unwrap();
    s.put("runtime", &req, &Response::new(200, "new")).unwrap();
    let hit = s.match_request("runtime", &req).unwrap().unwrap();
    assert_eq!(hit.response.text(), "new");
  }

  #[test]
  fn test_delete_store_drops_entries() {
    let s = storage();
    let req = Request::get_str("https://app.example.com/a").unwrap();
    s.put("old", &req, &Response::new(200, "x")).unwrap();
    s.open_store("keep").unwrap();

    assert!(s.delete_store("old").unwrap());
    assert!(!s.delete_store("old").unwrap());
    assert_eq!(s.store_names().unwrap(), vec!["keep".to_string()]);
    assert!(s.match_request("old", &req).unwrap().is_none());
  }

  #[test]
  fn test_active_generation() {
    let s = storage();
    assert_eq!(s.active_generation().unwrap(), None);
    s.set_active_generation("v3").unwrap();
    assert_eq!(s.active_generation().unwrap().as_deref(), Some("v3"));
  }
}
