// Database module

pub mod migrations;
pub mod schema;
pub mod store;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rusqlite::Connection;

use crate::constants::{APP_FOLDER, DATA_DIR_ENV, DB_FILENAME, PLUGINS_FOLDER, TEMP_FILES_FOLDER};

/// Resolve the application data directory, creating it if needed.
/// MAHPASTES_DATA_DIR overrides the platform default (useful for tests).
pub fn get_data_dir() -> Result<PathBuf> {
    if let Ok(custom) = std::env::var(DATA_DIR_ENV) {
        if !custom.is_empty() {
            let dir = PathBuf::from(custom);
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create custom data directory {}", dir.display()))?;
            return Ok(dir);
        }
    }

    // macOS: ~/Library/Application Support, Windows: %APPDATA%, Linux: ~/.config
    let base = dirs::config_dir().context("could not determine platform config directory")?;
    let dir = base.join(APP_FOLDER);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create data directory {}", dir.display()))?;
    Ok(dir)
}

pub fn get_db_path(data_dir: &Path) -> PathBuf {
    data_dir.join(DB_FILENAME)
}

pub fn get_temp_files_dir(data_dir: &Path) -> PathBuf {
    data_dir.join(TEMP_FILES_FOLDER)
}

pub fn get_plugins_dir(data_dir: &Path) -> PathBuf {
    data_dir.join(PLUGINS_FOLDER)
}

/// Open or create the content store database at the given path.
pub fn open_db(db_path: &Path) -> Result<Connection> {
    let conn = Connection::open(db_path)?;

    // Enable WAL mode for concurrent reads
    conn.execute_batch("PRAGMA journal_mode = WAL;")?;

    // Enable foreign keys (must be done per connection) for CASCADE to work
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;

    // Run migrations
    migrations::run_migrations(&conn)?;

    Ok(conn)
}

/// Open an in-memory database with all migrations applied. Test helper used
/// across the crate's test modules.
pub fn open_memory_db() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    migrations::run_migrations(&conn)?;
    Ok(conn)
}
