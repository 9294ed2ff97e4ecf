pub mod schema;

use color_eyre::{eyre::eyre, Result};
use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;

/// Open or create the database at `path` and bring the schema up to date.
///
/// The queue and the shell cache each hold their own connection to the same
/// file; WAL mode lets the sync loop and the gateway write concurrently.
pub fn open(path: &Path) -> Result<Connection> {
  // Ensure parent directory exists
  if let Some(parent) = path.parent() {
    std::fs::create_dir_all(parent)
      .map_err(|e| eyre!("Failed to create database directory: {}", e))?;
  }

  let conn = Connection::open(path)
    .map_err(|e| eyre!("Failed to open database at {}: {}", path.display(), e))?;

  conn
    .busy_timeout(Duration::from_secs(5))
    .map_err(|e| eyre!("Failed to set busy timeout: {}", e))?;
  conn
    .pragma_update(None, "journal_mode", "WAL")
    .map_err(|e| eyre!("Failed to enable WAL journal: {}", e))?;

  run_migrations(&conn)?;
  Ok(conn)
}

/// Open a private in-memory database with the full schema.
#[cfg(test)]
pub fn open_in_memory() -> Result<Connection> {
  let conn =
    Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;
  run_migrations(&conn)?;
  Ok(conn)
}

fn run_migrations(conn: &Connection) -> Result<()> {
  conn
    .execute_batch(schema::SCHEMA)
    .map_err(|e| eyre!("Failed to run migrations: {}", e))?;
  Ok(())
}
