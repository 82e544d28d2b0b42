// Database migrations
// Migrations are forward-only. Never edit or delete a migration after it ships.

use anyhow::Result;
use rusqlite::Connection;

/// All migrations in order. Each migration is a SQL batch.
const MIGRATIONS: &[&str] = &[
    // Migration 1: Initial schema
    r#"
    -- Clips table (the primary entity)
    CREATE TABLE clips (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        content_type TEXT NOT NULL,
        data BLOB NOT NULL,
        filename TEXT,
        created_at TEXT NOT NULL DEFAULT (datetime('now'))
    );

    -- Settings key/value map
    CREATE TABLE settings (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );

    INSERT OR IGNORE INTO settings (key, value) VALUES ('global_watch_paused', 'false');

    -- Watched folders
    CREATE TABLE watched_folders (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        path TEXT NOT NULL UNIQUE,
        filter_mode TEXT NOT NULL DEFAULT 'all',
        filter_presets TEXT,
        filter_regex TEXT,
        process_existing INTEGER NOT NULL DEFAULT 0,
        is_paused INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL DEFAULT (datetime('now'))
    );

    -- Tags
    CREATE TABLE tags (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        color TEXT NOT NULL
    );

    -- Clip-Tag mapping
    CREATE TABLE clip_tags (
        clip_id INTEGER NOT NULL,
        tag_id INTEGER NOT NULL,
        PRIMARY KEY (clip_id, tag_id),
        FOREIGN KEY (clip_id) REFERENCES clips(id) ON DELETE CASCADE,
        FOREIGN KEY (tag_id) REFERENCES tags(id) ON DELETE CASCADE
    );

    -- Plugin registry
    CREATE TABLE plugins (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        filename TEXT UNIQUE NOT NULL,
        name TEXT NOT NULL,
        version TEXT,
        enabled INTEGER NOT NULL DEFAULT 1,
        status TEXT NOT NULL DEFAULT 'enabled',
        error_count INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL DEFAULT (datetime('now'))
    );

    -- Filesystem paths granted to plugins
    CREATE TABLE plugin_permissions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        plugin_id INTEGER NOT NULL,
        permission_type TEXT NOT NULL,
        path TEXT NOT NULL,
        granted_at TEXT NOT NULL DEFAULT (datetime('now')),
        FOREIGN KEY (plugin_id) REFERENCES plugins(id) ON DELETE CASCADE
    );

    -- Plugin-scoped key/value storage
    CREATE TABLE plugin_storage (
        plugin_id INTEGER NOT NULL,
        key TEXT NOT NULL,
        value BLOB,
        PRIMARY KEY (plugin_id, key),
        FOREIGN KEY (plugin_id) REFERENCES plugins(id) ON DELETE CASCADE
    );

    -- Indexes for common queries
    CREATE INDEX idx_clips_created_at ON clips(created_at);
    CREATE INDEX idx_clip_tags_clip ON clip_tags(clip_id);
    CREATE INDEX idx_clip_tags_tag ON clip_tags(tag_id);
    CREATE INDEX idx_plugin_permissions_plugin ON plugin_permissions(plugin_id);
    "#,
    // Migration 2: Archive flag on clips
    r#"
    ALTER TABLE clips ADD COLUMN is_archived INTEGER NOT NULL DEFAULT 0;
    "#,
    // Migration 3: Clip TTL
    r#"
    ALTER TABLE clips ADD COLUMN expires_at TEXT;
    CREATE INDEX idx_clips_expires_at ON clips(expires_at);
    "#,
    // Migration 4: Watched-folder extras
    r#"
    ALTER TABLE watched_folders ADD COLUMN auto_archive INTEGER NOT NULL DEFAULT 0;
    ALTER TABLE watched_folders ADD COLUMN auto_tag_id INTEGER;
    "#,
    // Migration 5: Restored permissions require re-approval
    r#"
    ALTER TABLE plugin_permissions ADD COLUMN pending_reconfirm INTEGER NOT NULL DEFAULT 0;
    "#,
];

/// Get current schema version from database
fn get_schema_version(conn: &Connection) -> Result<u32> {
    let version: u32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    Ok(version)
}

/// Run all pending migrations (crash-safe)
pub fn run_migrations(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;
    let target_version = MIGRATIONS.len() as u32;

    // Refuse to open a DB created by a newer build
    if current_version > target_version {
        anyhow::bail!(
            "Database schema version {} is newer than this build supports (max {}). Please upgrade mahpastes.",
            current_version,
            target_version
        );
    }

    if current_version == target_version {
        return Ok(());
    }

    // Apply pending migrations one-by-one
    for (i, migration) in MIGRATIONS.iter().enumerate() {
        let migration_version = (i + 1) as u32;
        if migration_version <= current_version {
            continue;
        }

        conn.execute_batch(migration)?;
        conn.execute_batch(&format!("PRAGMA user_version = {}", migration_version))?;

        log::info!("Applied migration {}", migration_version);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_apply_cleanly() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), MIGRATIONS.len() as u32);

        // Running again is a no-op
        run_migrations(&conn).unwrap();
    }

    #[test]
    fn test_refuses_newer_schema() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA user_version = 999").unwrap();
        assert!(run_migrations(&conn).is_err());
    }

    #[test]
    fn test_global_watch_paused_seeded() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        let value: String = conn
            .query_row(
                "SELECT value FROM settings WHERE key = 'global_watch_paused'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(value, "false");
    }
}
