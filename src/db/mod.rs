pub mod schema;

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// Shared handle to the durable store.
///
/// Cache stores, the pending-operation log and the `meta` table all live in
/// one SQLite file so that a reload (or a new process) sees the same state.
#[derive(Clone)]
pub struct Database {
  conn: Arc<Mutex<Connection>>,
}

impl Database {
  /// Open or create the database inside `data_dir`, or at the default location.
  pub fn open(data_dir: Option<&Path>) -> Result<Self> {
    let path = match data_dir {
      Some(dir) => dir.join("stockroom.db"),
      None => Self::default_path()?,
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create database directory: {}", e))?;
    }

    let conn = Connection::open(&path)
      .map_err(|e| eyre!("Failed to open database at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// Open a private in-memory database. Nothing survives the handle.
  #[cfg(test)]
  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    let db = Self {
      conn: Arc::new(Mutex::new(conn)),
    };
    db.run_migrations()?;
    Ok(db)
  }

  /// Get the default data directory.
  pub fn default_dir() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("stockroom"))
  }

  fn default_path() -> Result<PathBuf> {
    Ok(Self::default_dir()?.join("stockroom.db"))
  }

  /// Run database migrations
  fn run_migrations(&self) -> Result<()> {
    self
      .conn()?
      .execute_batch(schema::SCHEMA)
      .map_err(|e| eyre!("Failed to run migrations: {}", e))?;
    Ok(())
  }

  /// Lock the connection.
  pub fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Read a value from the `meta` table.
  pub fn get_meta(&self, key: &str) -> Result<Option<String>> {
    self
      .conn()?
      .query_row("SELECT value FROM meta WHERE key = ?", params![key], |row| {
        row.get(0)
      })
      .optional()
      .map_err(|e| eyre!("Failed to read meta '{}': {}", key, e))
  }

  /// Write a value to the `meta` table.
  pub fn set_meta(&self, key: &str, value: &str) -> Result<()> {
    self
      .conn()?
      .execute(
        "INSERT OR REPLACE INTO meta (key, value) VALUES (?, ?)",
        params![key, value],
      )
      .map_err(|e| eyre!("Failed to write meta '{}': {}", key, e))?;
    Ok(())
  }

  /// Remove a value from the `meta` table.
  pub fn delete_meta(&self, key: &str) -> Result<()> {
    self
      .conn()?
      .execute("DELETE FROM meta WHERE key = ?", params![key])
      .map_err(|e| eyre!("Failed to delete meta '{}': {}", key, e))?;
    Ok(())
  }
}
