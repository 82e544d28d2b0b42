// Database schema types and query helpers
// Functions here take a &Connection; transactional logic and event emission
// live in db::store.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// All timestamps are UTC, formatted so SQLite datetime('now') comparisons
/// work on the raw text.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

pub fn now_timestamp() -> String {
    format_timestamp(Utc::now())
}

// ----- Clip -----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClipPreview {
    pub id: i64,
    pub content_type: String,
    pub filename: String,
    pub created_at: String,
    pub expires_at: Option<String>,
    pub preview: String,
    pub is_archived: bool,
    #[serde(default)]
    pub tags: Vec<Tag>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClipData {
    pub id: i64,
    pub content_type: String,
    /// Raw text for text-ish content types, base64 for binary.
    pub data: String,
    pub filename: String,
}

/// Full clip row with raw bytes. Only handed out inside the store layer.
#[derive(Debug)]
pub struct ClipRow {
    pub id: i64,
    pub content_type: String,
    pub data: Vec<u8>,
    pub filename: Option<String>,
    pub created_at: String,
    pub expires_at: Option<String>,
    pub is_archived: bool,
}

pub fn insert_clip(
    conn: &Connection,
    content_type: &str,
    data: &[u8],
    filename: Option<&str>,
    expires_at: Option<&str>,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO clips (content_type, data, filename, expires_at) VALUES (?1, ?2, ?3, ?4)",
        params![content_type, data, filename, expires_at],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn get_clip_row(conn: &Connection, id: i64) -> Result<Option<ClipRow>> {
    let result = conn
        .query_row(
            "SELECT id, content_type, data, filename, created_at, expires_at, is_archived
             FROM clips WHERE id = ?1",
            params![id],
            |row| {
                Ok(ClipRow {
                    id: row.get(0)?,
                    content_type: row.get(1)?,
                    data: row.get(2)?,
                    filename: row.get(3)?,
                    created_at: row.get(4)?,
                    expires_at: row.get(5)?,
                    is_archived: row.get::<_, i64>(6)? != 0,
                })
            },
        )
        .optional()?;
    Ok(result)
}

/// Lightweight clip listing row for the plugin API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClipMeta {
    pub id: i64,
    pub content_type: String,
    pub filename: String,
    pub created_at: String,
    pub is_archived: bool,
}

/// Plugin-facing listing: optional content-type filter, caller-controlled
/// limit/offset, expired rows hidden.
pub fn list_clip_meta(
    conn: &Connection,
    content_type: Option<&str>,
    limit: i64,
    offset: i64,
) -> Result<Vec<ClipMeta>> {
    let mut sql = String::from(
        "SELECT id, content_type, filename, created_at, is_archived
         FROM clips WHERE (expires_at IS NULL OR expires_at > datetime('now'))",
    );
    let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
    if let Some(ct) = content_type {
        sql.push_str(" AND content_type = ?1");
        args.push(Box::new(ct.to_string()));
    }
    sql.push_str(&format!(
        " ORDER BY created_at DESC, id DESC LIMIT {} OFFSET {}",
        limit, offset
    ));

    let mut stmt = conn.prepare(&sql)?;
    let params_ref: Vec<&dyn rusqlite::ToSql> = args.iter().map(|b| b.as_ref()).collect();
    let rows = stmt.query_map(params_ref.as_slice(), |row| {
        let filename: Option<String> = row.get(2)?;
        Ok(ClipMeta {
            id: row.get(0)?,
            content_type: row.get(1)?,
            filename: filename.unwrap_or_default(),
            created_at: row.get(3)?,
            is_archived: row.get::<_, i64>(4)? != 0,
        })
    })?;

    let mut clips = Vec::new();
    for row in rows {
        match row {
            Ok(clip) => clips.push(clip),
            Err(e) => log::warn!("list_clip_meta: failed to scan row: {}", e),
        }
    }
    Ok(clips)
}

pub fn clip_exists(conn: &Connection, id: i64) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row("SELECT 1 FROM clips WHERE id = ?1", params![id], |row| row.get(0))
        .optional()?;
    Ok(found.is_some())
}

/// Delete rows whose TTL elapsed. Returns the affected-row count.
pub fn delete_expired_clips(conn: &Connection) -> Result<usize> {
    let rows = conn.execute(
        "DELETE FROM clips WHERE expires_at IS NOT NULL AND expires_at <= datetime('now')",
        [],
    )?;
    Ok(rows)
}

// ----- Tag -----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tag {
    pub id: i64,
    pub name: String,
    pub color: String,
    #[serde(default)]
    pub count: i64,
}

pub fn list_tags(conn: &Connection) -> Result<Vec<Tag>> {
    let mut stmt = conn.prepare(
        "SELECT t.id, t.name, t.color, COUNT(ct.clip_id) AS count
         FROM tags t
         LEFT JOIN clip_tags ct ON t.id = ct.tag_id
         GROUP BY t.id
         ORDER BY t.name",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(Tag {
            id: row.get(0)?,
            name: row.get(1)?,
            color: row.get(2)?,
            count: row.get(3)?,
        })
    })?;

    let mut tags = Vec::new();
    for row in rows {
        match row {
            Ok(tag) => tags.push(tag),
            Err(e) => log::warn!("list_tags: failed to scan row: {}", e),
        }
    }
    Ok(tags)
}

pub fn get_tag(conn: &Connection, id: i64) -> Result<Option<Tag>> {
    let result = conn
        .query_row(
            "SELECT t.id, t.name, t.color, COUNT(ct.clip_id) AS count
             FROM tags t
             LEFT JOIN clip_tags ct ON t.id = ct.tag_id
             WHERE t.id = ?1
             GROUP BY t.id",
            params![id],
            |row| {
                Ok(Tag {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    color: row.get(2)?,
                    count: row.get(3)?,
                })
            },
        )
        .optional()?;
    Ok(result)
}

pub fn tags_for_clip(conn: &Connection, clip_id: i64) -> Result<Vec<Tag>> {
    let mut stmt = conn.prepare(
        "SELECT t.id, t.name, t.color
         FROM tags t
         INNER JOIN clip_tags ct ON t.id = ct.tag_id
         WHERE ct.clip_id = ?1
         ORDER BY t.name",
    )?;
    let rows = stmt.query_map(params![clip_id], |row| {
        Ok(Tag {
            id: row.get(0)?,
            name: row.get(1)?,
            color: row.get(2)?,
            count: 0,
        })
    })?;

    let mut tags = Vec::new();
    for row in rows {
        if let Ok(tag) = row {
            tags.push(tag);
        }
    }
    Ok(tags)
}

/// Tag ids currently attached to a clip. Used to scope orphan cleanup.
pub fn tag_ids_for_clip(conn: &Connection, clip_id: i64) -> Result<Vec<i64>> {
    let mut stmt = conn.prepare("SELECT tag_id FROM clip_tags WHERE clip_id = ?1")?;
    let rows = stmt.query_map(params![clip_id], |row| row.get(0))?;
    let mut ids = Vec::new();
    for row in rows {
        ids.push(row?);
    }
    Ok(ids)
}

/// Delete the given tags if they no longer have any clip association.
/// Returns the names of deleted tags so callers can emit events.
pub fn delete_orphan_tags(conn: &Connection, candidate_ids: &[i64]) -> Result<Vec<(i64, String)>> {
    let mut deleted = Vec::new();
    for &tag_id in candidate_ids {
        let in_use: i64 = conn.query_row(
            "SELECT COUNT(*) FROM clip_tags WHERE tag_id = ?1",
            params![tag_id],
            |row| row.get(0),
        )?;
        if in_use == 0 {
            let name: Option<String> = conn
                .query_row("SELECT name FROM tags WHERE id = ?1", params![tag_id], |row| row.get(0))
                .optional()?;
            if let Some(name) = name {
                conn.execute("DELETE FROM tags WHERE id = ?1", params![tag_id])?;
                deleted.push((tag_id, name));
            }
        }
    }
    Ok(deleted)
}

// ----- Watched folder -----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchedFolder {
    pub id: i64,
    pub path: String,
    pub filter_mode: String,
    pub filter_presets: Vec<String>,
    pub filter_regex: String,
    pub process_existing: bool,
    pub auto_archive: bool,
    pub auto_tag_id: Option<i64>,
    pub is_paused: bool,
    pub created_at: String,
    /// Whether the folder path exists on disk. Missing paths are reported,
    /// not treated as errors.
    pub exists: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WatchedFolderConfig {
    pub path: String,
    #[serde(default)]
    pub filter_mode: String,
    #[serde(default)]
    pub filter_presets: Vec<String>,
    #[serde(default)]
    pub filter_regex: String,
    #[serde(default)]
    pub process_existing: bool,
    #[serde(default)]
    pub auto_archive: bool,
    #[serde(default)]
    pub auto_tag_id: Option<i64>,
}

fn folder_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<WatchedFolder> {
    let presets_json: Option<String> = row.get(3)?;
    let filter_presets = presets_json
        .as_deref()
        .filter(|s| !s.is_empty())
        .and_then(|s| serde_json::from_str::<Vec<String>>(s).ok())
        .unwrap_or_default();
    let filter_regex: Option<String> = row.get(4)?;

    let path: String = row.get(1)?;
    let exists = std::path::Path::new(&path).exists();

    Ok(WatchedFolder {
        id: row.get(0)?,
        path,
        filter_mode: row.get(2)?,
        filter_presets,
        filter_regex: filter_regex.unwrap_or_default(),
        process_existing: row.get::<_, i64>(5)? != 0,
        auto_archive: row.get::<_, i64>(6)? != 0,
        auto_tag_id: row.get(7)?,
        is_paused: row.get::<_, i64>(8)? != 0,
        created_at: row.get(9)?,
        exists,
    })
}

const FOLDER_COLUMNS: &str = "id, path, filter_mode, filter_presets, filter_regex,
       process_existing, auto_archive, auto_tag_id, is_paused, created_at";

pub fn list_watched_folders(conn: &Connection) -> Result<Vec<WatchedFolder>> {
    let sql = format!(
        "SELECT {} FROM watched_folders ORDER BY created_at DESC",
        FOLDER_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], folder_from_row)?;

    let mut folders = Vec::new();
    for row in rows {
        match row {
            Ok(folder) => folders.push(folder),
            Err(e) => log::warn!("list_watched_folders: failed to scan row: {}", e),
        }
    }
    Ok(folders)
}

pub fn get_watched_folder(conn: &Connection, id: i64) -> Result<Option<WatchedFolder>> {
    let sql = format!("SELECT {} FROM watched_folders WHERE id = ?1", FOLDER_COLUMNS);
    let result = conn.query_row(&sql, params![id], folder_from_row).optional()?;
    Ok(result)
}

// ----- Settings -----

pub fn get_setting(conn: &Connection, key: &str) -> Result<Option<String>> {
    let result = conn
        .query_row("SELECT value FROM settings WHERE key = ?1", params![key], |row| row.get(0))
        .optional()?;
    Ok(result)
}

pub fn set_setting(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO settings (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}

// ----- Plugin registry -----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginRow {
    pub id: i64,
    pub filename: String,
    pub name: String,
    pub version: String,
    pub enabled: bool,
    pub status: String,
    pub error_count: i64,
}

fn plugin_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PluginRow> {
    let version: Option<String> = row.get(3)?;
    Ok(PluginRow {
        id: row.get(0)?,
        filename: row.get(1)?,
        name: row.get(2)?,
        version: version.unwrap_or_default(),
        enabled: row.get::<_, i64>(4)? != 0,
        status: row.get(5)?,
        error_count: row.get(6)?,
    })
}

const PLUGIN_COLUMNS: &str = "id, filename, name, version, enabled, status, error_count";

pub fn list_plugins(conn: &Connection) -> Result<Vec<PluginRow>> {
    let sql = format!("SELECT {} FROM plugins ORDER BY name", PLUGIN_COLUMNS);
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], plugin_from_row)?;

    let mut plugins = Vec::new();
    for row in rows {
        match row {
            Ok(p) => plugins.push(p),
            Err(e) => log::warn!("list_plugins: failed to scan row: {}", e),
        }
    }
    Ok(plugins)
}

pub fn list_loadable_plugins(conn: &Connection) -> Result<Vec<PluginRow>> {
    let sql = format!(
        "SELECT {} FROM plugins WHERE enabled = 1 AND status != 'error'",
        PLUGIN_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], plugin_from_row)?;

    let mut plugins = Vec::new();
    for row in rows {
        match row {
            Ok(p) => plugins.push(p),
            Err(e) => log::warn!("list_loadable_plugins: failed to scan row: {}", e),
        }
    }
    Ok(plugins)
}

pub fn get_plugin(conn: &Connection, id: i64) -> Result<Option<PluginRow>> {
    let sql = format!("SELECT {} FROM plugins WHERE id = ?1", PLUGIN_COLUMNS);
    let result = conn.query_row(&sql, params![id], plugin_from_row).optional()?;
    Ok(result)
}

/// Upsert a plugin row keyed by filename; returns the row id.
/// last_insert_rowid is unreliable on conflict-update, so the id is re-read.
pub fn upsert_plugin(conn: &Connection, filename: &str, name: &str, version: &str) -> Result<i64> {
    conn.execute(
        "INSERT INTO plugins (filename, name, version, enabled, status)
         VALUES (?1, ?2, ?3, 1, 'enabled')
         ON CONFLICT(filename) DO UPDATE SET
             name = excluded.name,
             version = excluded.version,
             enabled = 1,
             status = 'enabled',
             error_count = 0",
        params![filename, name, version],
    )?;
    let id: i64 = conn.query_row(
        "SELECT id FROM plugins WHERE filename = ?1",
        params![filename],
        |row| row.get(0),
    )?;
    Ok(id)
}

pub fn set_plugin_enabled(conn: &Connection, id: i64, enabled: bool) -> Result<()> {
    if enabled {
        conn.execute(
            "UPDATE plugins SET enabled = 1, status = 'enabled', error_count = 0 WHERE id = ?1",
            params![id],
        )?;
    } else {
        conn.execute(
            "UPDATE plugins SET enabled = 0, status = 'disabled' WHERE id = ?1",
            params![id],
        )?;
    }
    Ok(())
}

pub fn delete_plugin(conn: &Connection, id: i64) -> Result<()> {
    // Cascades to plugin_permissions and plugin_storage
    conn.execute("DELETE FROM plugins WHERE id = ?1", params![id])?;
    Ok(())
}

pub fn increment_plugin_error_count(conn: &Connection, id: i64) -> Result<i64> {
    conn.execute(
        "UPDATE plugins SET error_count = error_count + 1 WHERE id = ?1",
        params![id],
    )?;
    let count: i64 = conn.query_row(
        "SELECT error_count FROM plugins WHERE id = ?1",
        params![id],
        |row| row.get(0),
    )?;
    Ok(count)
}

pub fn reset_plugin_error_count(conn: &Connection, id: i64) -> Result<()> {
    conn.execute("UPDATE plugins SET error_count = 0 WHERE id = ?1", params![id])?;
    Ok(())
}

pub fn mark_plugin_errored(conn: &Connection, id: i64) -> Result<()> {
    conn.execute("UPDATE plugins SET status = 'error' WHERE id = ?1", params![id])?;
    Ok(())
}

// ----- Plugin permissions -----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginPermission {
    pub permission_type: String,
    pub path: String,
    pub granted_at: String,
    pub pending_reconfirm: bool,
}

pub fn list_plugin_permissions(conn: &Connection, plugin_id: i64) -> Result<Vec<PluginPermission>> {
    let mut stmt = conn.prepare(
        "SELECT permission_type, path, granted_at, pending_reconfirm
         FROM plugin_permissions WHERE plugin_id = ?1",
    )?;
    let rows = stmt.query_map(params![plugin_id], |row| {
        Ok(PluginPermission {
            permission_type: row.get(0)?,
            path: row.get(1)?,
            granted_at: row.get(2)?,
            pending_reconfirm: row.get::<_, i64>(3)? != 0,
        })
    })?;

    let mut perms = Vec::new();
    for row in rows {
        match row {
            Ok(p) => perms.push(p),
            Err(e) => log::warn!("list_plugin_permissions: failed to scan row: {}", e),
        }
    }
    Ok(perms)
}

pub fn insert_plugin_permission(
    conn: &Connection,
    plugin_id: i64,
    permission_type: &str,
    path: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO plugin_permissions (plugin_id, permission_type, path) VALUES (?1, ?2, ?3)",
        params![plugin_id, permission_type, path],
    )?;
    Ok(())
}

pub fn revoke_plugin_permission(
    conn: &Connection,
    plugin_id: i64,
    permission_type: &str,
    path: &str,
) -> Result<()> {
    conn.execute(
        "DELETE FROM plugin_permissions
         WHERE plugin_id = ?1 AND permission_type = ?2 AND path = ?3",
        params![plugin_id, permission_type, path],
    )?;
    Ok(())
}

// ----- Plugin storage -----

pub fn get_plugin_storage(conn: &Connection, plugin_id: i64, key: &str) -> Result<Option<Vec<u8>>> {
    let result = conn
        .query_row(
            "SELECT value FROM plugin_storage WHERE plugin_id = ?1 AND key = ?2",
            params![plugin_id, key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(result)
}

pub fn set_plugin_storage(conn: &Connection, plugin_id: i64, key: &str, value: &[u8]) -> Result<()> {
    conn.execute(
        "INSERT INTO plugin_storage (plugin_id, key, value) VALUES (?1, ?2, ?3)
         ON CONFLICT(plugin_id, key) DO UPDATE SET value = excluded.value",
        params![plugin_id, key, value],
    )?;
    Ok(())
}

pub fn delete_plugin_storage(conn: &Connection, plugin_id: i64, key: &str) -> Result<()> {
    conn.execute(
        "DELETE FROM plugin_storage WHERE plugin_id = ?1 AND key = ?2",
        params![plugin_id, key],
    )?;
    Ok(())
}

pub fn list_plugin_storage(conn: &Connection, plugin_id: i64) -> Result<Vec<(String, Vec<u8>)>> {
    let mut stmt =
        conn.prepare("SELECT key, value FROM plugin_storage WHERE plugin_id = ?1 ORDER BY key")?;
    let rows = stmt.query_map(params![plugin_id], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
    })?;

    let mut entries = Vec::new();
    for row in rows {
        if let Ok(entry) = row {
            entries.push(entry);
        }
    }
    Ok(entries)
}
