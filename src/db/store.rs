// Content store
// Single-writer facade over the SQLite connection. All mutation goes through
// one mutex; committed writes publish on the event bus.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::constants::{
    extension_for_mime, is_textual_content_type, preset_extensions, CLEANUP_INTERVAL_SECS,
    CLIP_LIST_LIMIT, CLIP_PREVIEW_BYTES, GLOBAL_WATCH_PAUSED_KEY, MAX_CLIP_DATA_SIZE,
    MAX_TAG_NAME_LENGTH, TAG_COLORS,
};
use crate::db::schema::{
    self, format_timestamp, ClipData, ClipPreview, ClipRow, PluginPermission, PluginRow, Tag,
    WatchedFolder, WatchedFolderConfig,
};
use crate::error::{MahPastesError, Result};
use crate::events::EventBus;

/// An upload unit: bytes plus client-declared metadata.
#[derive(Debug, Clone)]
pub struct FileUpload {
    pub name: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchStatus {
    pub global_paused: bool,
    pub active_count: usize,
    pub total_count: usize,
    pub is_watching: bool,
}

pub struct Store {
    conn: Mutex<Connection>,
    bus: Arc<EventBus>,
}

impl Store {
    pub fn new(conn: Connection, bus: Arc<EventBus>) -> Arc<Store> {
        Arc::new(Store {
            conn: Mutex::new(conn),
            bus,
        })
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Lock the underlying connection. Used by the backup exporter, which
    /// needs raw table access under the single-writer guarantee.
    pub(crate) fn lock_conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }

    // ----- Clips -----

    /// At most 50 previews, newest first. When tag_ids is non-empty only
    /// clips bearing all of the given tags are returned. Previews carry text
    /// only for text-ish content types; tags are batch-loaded in a second
    /// query.
    pub fn list_clips(&self, archived: bool, tag_ids: &[i64]) -> Result<Vec<ClipPreview>> {
        let conn = self.lock_conn();

        let mut sql = format!(
            "SELECT id, content_type, filename, created_at, expires_at,
                    SUBSTR(data, 1, {}), is_archived
             FROM clips
             WHERE is_archived = ?1 AND (expires_at IS NULL OR expires_at > datetime('now'))",
            CLIP_PREVIEW_BYTES
        );
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(archived as i64)];

        if !tag_ids.is_empty() {
            let placeholders = vec!["?"; tag_ids.len()].join(",");
            sql.push_str(&format!(
                " AND id IN (SELECT clip_id FROM clip_tags WHERE tag_id IN ({})
                             GROUP BY clip_id HAVING COUNT(DISTINCT tag_id) = {})",
                placeholders,
                tag_ids.len()
            ));
            for &tag_id in tag_ids {
                args.push(Box::new(tag_id));
            }
        }
        // id breaks ties between same-second inserts
        sql.push_str(&format!(
            " ORDER BY created_at DESC, id DESC LIMIT {}",
            CLIP_LIST_LIMIT
        ));

        let mut stmt = conn.prepare(&sql)?;
        let params_ref: Vec<&dyn rusqlite::ToSql> = args.iter().map(|b| b.as_ref()).collect();
        let rows = stmt.query_map(params_ref.as_slice(), |row| {
            let content_type: String = row.get(1)?;
            let filename: Option<String> = row.get(2)?;
            let preview_data: Vec<u8> = row.get(5)?;
            let preview = if is_textual_content_type(&content_type) {
                String::from_utf8_lossy(&preview_data).into_owned()
            } else {
                String::new()
            };
            Ok(ClipPreview {
                id: row.get(0)?,
                content_type,
                filename: filename.unwrap_or_default(),
                created_at: row.get(3)?,
                expires_at: row.get(4)?,
                preview,
                is_archived: row.get::<_, i64>(6)? != 0,
                tags: Vec::new(),
            })
        })?;

        let mut clips = Vec::new();
        for row in rows {
            match row {
                Ok(clip) => clips.push(clip),
                Err(e) => log::warn!("list_clips: failed to scan row: {}", e),
            }
        }
        drop(stmt);

        // Batch-load tags for the returned set (no per-clip queries)
        if !clips.is_empty() {
            let ids: Vec<String> = clips.iter().map(|c| c.id.to_string()).collect();
            let sql = format!(
                "SELECT ct.clip_id, t.id, t.name, t.color
                 FROM clip_tags ct
                 INNER JOIN tags t ON t.id = ct.tag_id
                 WHERE ct.clip_id IN ({})
                 ORDER BY t.name",
                ids.join(",")
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    Tag {
                        id: row.get(1)?,
                        name: row.get(2)?,
                        color: row.get(3)?,
                        count: 0,
                    },
                ))
            })?;

            let mut by_clip: HashMap<i64, Vec<Tag>> = HashMap::new();
            for row in rows {
                if let Ok((clip_id, tag)) = row {
                    by_clip.entry(clip_id).or_default().push(tag);
                }
            }
            for clip in &mut clips {
                if let Some(tags) = by_clip.remove(&clip.id) {
                    clip.tags = tags;
                }
            }
        }

        Ok(clips)
    }

    /// Full clip payload. Text-ish data is returned as the raw string,
    /// binary data as base64.
    pub fn get_clip(&self, id: i64) -> Result<ClipData> {
        let row = {
            let conn = self.lock_conn();
            schema::get_clip_row(&conn, id)?
        }
        .ok_or(MahPastesError::ClipNotFound(id))?;

        let data = if is_textual_content_type(&row.content_type) {
            String::from_utf8_lossy(&row.data).into_owned()
        } else {
            BASE64.encode(&row.data)
        };

        Ok(ClipData {
            id: row.id,
            content_type: row.content_type,
            data,
            filename: row.filename.unwrap_or_default(),
        })
    }

    /// Full row with raw bytes; store-internal consumers only (temp files,
    /// transform pipeline).
    pub(crate) fn get_clip_raw(&self, id: i64) -> Result<ClipRow> {
        let conn = self.lock_conn();
        schema::get_clip_row(&conn, id)?.ok_or(MahPastesError::ClipNotFound(id))
    }

    /// Plugin-facing listing with its own limit/offset contract.
    pub fn list_clip_meta(
        &self,
        content_type: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<schema::ClipMeta>> {
        let conn = self.lock_conn();
        schema::list_clip_meta(&conn, content_type, limit, offset)
    }

    /// Insert a clip, sniffing the content type for empty / text/plain
    /// declarations. Emits clip:created.
    pub fn put_clip(
        &self,
        content_type: &str,
        data: Vec<u8>,
        filename: Option<&str>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<i64> {
        let content_type = sniff_content_type(content_type, &data);
        self.insert_clip(&content_type, data, filename, expires_at)
    }

    /// Insert a clip with the content type taken as-is (callers such as the
    /// plugin API validate it themselves). Emits clip:created.
    pub fn insert_clip(
        &self,
        content_type: &str,
        data: Vec<u8>,
        filename: Option<&str>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<i64> {
        if content_type.is_empty() {
            return Err(MahPastesError::Validation(
                "content type cannot be empty".into(),
            ));
        }
        if data.len() > MAX_CLIP_DATA_SIZE {
            return Err(MahPastesError::ResourceLimit(format!(
                "data too large: {} bytes (max {})",
                data.len(),
                MAX_CLIP_DATA_SIZE
            )));
        }
        let now = Utc::now();
        if let Some(expiry) = expires_at {
            if expiry <= now {
                return Err(MahPastesError::Validation(
                    "expiration must be in the future".into(),
                ));
            }
        }
        let expires_str = expires_at.map(format_timestamp);

        let id = {
            let conn = self.lock_conn();
            schema::insert_clip(
                &conn,
                content_type,
                &data,
                filename,
                expires_str.as_deref(),
            )?
        };

        self.bus.emit(
            "clip:created",
            json!({
                "id": id,
                "content_type": content_type,
                "filename": filename.unwrap_or_default(),
            }),
        );
        Ok(id)
    }

    /// Multi-file upload with an optional shared TTL in minutes. Per-file
    /// failures are logged and skipped; the batch completes.
    pub fn upload_files(&self, files: Vec<FileUpload>, expiration_minutes: i64) -> Result<Vec<i64>> {
        let expires_at = if expiration_minutes > 0 {
            Some(Utc::now() + chrono::Duration::minutes(expiration_minutes))
        } else {
            None
        };

        let mut ids = Vec::new();
        for file in files {
            let name = file.name.clone();
            match self.put_clip(&file.content_type, file.data, Some(&file.name), expires_at) {
                Ok(id) => ids.push(id),
                Err(e) => log::warn!("upload_files: failed to store {}: {}", name, e),
            }
        }
        Ok(ids)
    }

    /// Delete a clip. Join rows are removed explicitly before the clip so
    /// cleanup never depends on cascade ordering. Idempotent.
    pub fn delete_clip(&self, id: i64) -> Result<()> {
        let deleted = {
            let mut conn = self.lock_conn();
            let tx = conn.transaction()?;
            let tag_ids = schema::tag_ids_for_clip(&tx, id)?;
            tx.execute("DELETE FROM clip_tags WHERE clip_id = ?1", params![id])?;
            let rows = tx.execute("DELETE FROM clips WHERE id = ?1", params![id])?;
            let orphans = schema::delete_orphan_tags(&tx, &tag_ids)?;
            tx.commit()?;
            (rows > 0, orphans)
        };

        if deleted.0 {
            self.bus.emit("clip:deleted", json!({ "id": id }));
        }
        for (tag_id, name) in deleted.1 {
            self.bus
                .emit("tag:deleted", json!({ "id": tag_id, "name": name }));
        }
        Ok(())
    }

    pub fn bulk_delete(&self, ids: &[i64]) -> Result<()> {
        for &id in ids {
            if let Err(e) = self.delete_clip(id) {
                log::warn!("bulk_delete: failed to delete clip {}: {}", id, e);
            }
        }
        Ok(())
    }

    /// Flip the archive bit; returns the new state.
    pub fn toggle_archive(&self, id: i64) -> Result<bool> {
        let archived = {
            let conn = self.lock_conn();
            let rows = conn.execute(
                "UPDATE clips SET is_archived = NOT is_archived WHERE id = ?1",
                params![id],
            )?;
            if rows == 0 {
                return Err(MahPastesError::ClipNotFound(id));
            }
            conn.query_row(
                "SELECT is_archived FROM clips WHERE id = ?1",
                params![id],
                |row| row.get::<_, i64>(0),
            )? != 0
        };

        let event = if archived { "clip:archived" } else { "clip:unarchived" };
        self.bus.emit(event, json!({ "id": id }));
        Ok(archived)
    }

    pub fn bulk_toggle_archive(&self, ids: &[i64]) -> Result<()> {
        for &id in ids {
            if let Err(e) = self.toggle_archive(id) {
                log::warn!("bulk_toggle_archive: failed for clip {}: {}", id, e);
            }
        }
        Ok(())
    }

    pub fn set_archived(&self, id: i64, archived: bool) -> Result<()> {
        let rows = {
            let conn = self.lock_conn();
            conn.execute(
                "UPDATE clips SET is_archived = ?1 WHERE id = ?2",
                params![archived as i64, id],
            )?
        };
        if rows == 0 {
            return Err(MahPastesError::ClipNotFound(id));
        }
        let event = if archived { "clip:archived" } else { "clip:unarchived" };
        self.bus.emit(event, json!({ "id": id }));
        Ok(())
    }

    pub fn cancel_expiration(&self, id: i64) -> Result<()> {
        let conn = self.lock_conn();
        conn.execute(
            "UPDATE clips SET expires_at = NULL WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    /// Expiry sweep: drop rows past their TTL. Returns affected-row count.
    pub fn delete_expired(&self) -> Result<usize> {
        let conn = self.lock_conn();
        schema::delete_expired_clips(&conn)
    }

    // ----- Tags -----

    pub fn list_tags(&self) -> Result<Vec<Tag>> {
        let conn = self.lock_conn();
        schema::list_tags(&conn)
    }

    pub fn get_tag(&self, id: i64) -> Result<Option<Tag>> {
        let conn = self.lock_conn();
        schema::get_tag(&conn, id)
    }

    pub fn tags_for_clip(&self, clip_id: i64) -> Result<Vec<Tag>> {
        let conn = self.lock_conn();
        schema::tags_for_clip(&conn, clip_id)
    }

    /// Create a tag with a palette color chosen from count(tags) mod palette
    /// size. Count and insert run in one transaction so concurrent creators
    /// never abort over the color slot.
    pub fn create_tag(&self, name: &str) -> Result<Tag> {
        let name = name.trim();
        if name.is_empty() {
            return Err(MahPastesError::Validation("tag name cannot be empty".into()));
        }
        if name.len() > MAX_TAG_NAME_LENGTH {
            return Err(MahPastesError::Validation("tag name too long".into()));
        }

        let tag = {
            let mut conn = self.lock_conn();
            let tx = conn.transaction()?;
            let count: i64 = tx.query_row("SELECT COUNT(*) FROM tags", [], |row| row.get(0))?;
            let color = TAG_COLORS[(count as usize) % TAG_COLORS.len()];

            let inserted = tx.execute(
                "INSERT INTO tags (name, color) VALUES (?1, ?2)",
                params![name, color],
            );
            if let Err(e) = inserted {
                return if is_unique_violation(&e) {
                    Err(MahPastesError::Validation(format!(
                        "tag already exists: {}",
                        name
                    )))
                } else {
                    Err(e.into())
                };
            }
            let id = tx.last_insert_rowid();
            tx.commit()?;
            Tag {
                id,
                name: name.to_string(),
                color: color.to_string(),
                count: 0,
            }
        };

        self.bus.emit(
            "tag:created",
            json!({ "id": tag.id, "name": tag.name, "color": tag.color }),
        );
        Ok(tag)
    }

    pub fn update_tag(&self, id: i64, name: Option<&str>, color: Option<&str>) -> Result<()> {
        let (current_name, current_color) = {
            let conn = self.lock_conn();
            conn.query_row(
                "SELECT name, color FROM tags WHERE id = ?1",
                params![id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?
            .ok_or_else(|| MahPastesError::NotFound(format!("tag {}", id)))?
        };

        let new_name = match name {
            Some(n) => {
                let n = n.trim();
                if n.is_empty() {
                    return Err(MahPastesError::Validation("tag name cannot be empty".into()));
                }
                if n.len() > MAX_TAG_NAME_LENGTH {
                    return Err(MahPastesError::Validation("tag name too long".into()));
                }
                n.to_string()
            }
            None => current_name,
        };
        let new_color = color.map(str::to_string).unwrap_or(current_color);

        {
            let conn = self.lock_conn();
            let result = conn.execute(
                "UPDATE tags SET name = ?1, color = ?2 WHERE id = ?3",
                params![new_name, new_color, id],
            );
            if let Err(e) = result {
                return if is_unique_violation(&e) {
                    Err(MahPastesError::Validation(format!(
                        "tag name already exists: {}",
                        new_name
                    )))
                } else {
                    Err(e.into())
                };
            }
        }

        self.bus
            .emit("tag:updated", json!({ "id": id, "name": new_name, "color": new_color }));
        Ok(())
    }

    pub fn delete_tag(&self, id: i64) -> Result<()> {
        let deleted = {
            let conn = self.lock_conn();
            conn.execute("DELETE FROM tags WHERE id = ?1", params![id])?
        };
        if deleted > 0 {
            self.bus.emit("tag:deleted", json!({ "id": id }));
        }
        Ok(())
    }

    pub fn add_tag_to_clip(&self, tag_id: i64, clip_id: i64) -> Result<()> {
        {
            let conn = self.lock_conn();
            if schema::get_tag(&conn, tag_id)?.is_none() {
                return Err(MahPastesError::NotFound(format!("tag {}", tag_id)));
            }
            if !schema::clip_exists(&conn, clip_id)? {
                return Err(MahPastesError::ClipNotFound(clip_id));
            }
            conn.execute(
                "INSERT OR IGNORE INTO clip_tags (clip_id, tag_id) VALUES (?1, ?2)",
                params![clip_id, tag_id],
            )?;
        }
        self.bus.emit(
            "tag:added_to_clip",
            json!({ "tag_id": tag_id, "clip_id": clip_id }),
        );
        Ok(())
    }

    /// Detach a tag; if that was its last association the tag is deleted
    /// (orphan-tag rule).
    pub fn remove_tag_from_clip(&self, tag_id: i64, clip_id: i64) -> Result<()> {
        let orphans = {
            let mut conn = self.lock_conn();
            let tx = conn.transaction()?;
            if schema::get_tag(&tx, tag_id)?.is_none() {
                return Err(MahPastesError::NotFound(format!("tag {}", tag_id)));
            }
            if !schema::clip_exists(&tx, clip_id)? {
                return Err(MahPastesError::ClipNotFound(clip_id));
            }
            tx.execute(
                "DELETE FROM clip_tags WHERE clip_id = ?1 AND tag_id = ?2",
                params![clip_id, tag_id],
            )?;
            let orphans = schema::delete_orphan_tags(&tx, &[tag_id])?;
            tx.commit()?;
            orphans
        };

        self.bus.emit(
            "tag:removed_from_clip",
            json!({ "tag_id": tag_id, "clip_id": clip_id }),
        );
        for (id, name) in orphans {
            self.bus.emit("tag:deleted", json!({ "id": id, "name": name }));
        }
        Ok(())
    }

    // ----- Watched folders -----

    pub fn list_watched_folders(&self) -> Result<Vec<WatchedFolder>> {
        let conn = self.lock_conn();
        schema::list_watched_folders(&conn)
    }

    pub fn get_watched_folder(&self, id: i64) -> Result<Option<WatchedFolder>> {
        let conn = self.lock_conn();
        schema::get_watched_folder(&conn, id)
    }

    pub fn add_watched_folder(&self, mut config: WatchedFolderConfig) -> Result<WatchedFolder> {
        let path = Path::new(&config.path);
        if !path.is_dir() {
            return Err(MahPastesError::Validation(format!(
                "folder does not exist: {}",
                config.path
            )));
        }
        if config.filter_mode.is_empty() {
            config.filter_mode = "all".to_string();
        }
        validate_filter_config(&config.filter_mode, &config.filter_presets)?;

        let presets_json = if config.filter_presets.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&config.filter_presets)?)
        };

        let id = {
            let conn = self.lock_conn();
            let result = conn.execute(
                "INSERT INTO watched_folders
                     (path, filter_mode, filter_presets, filter_regex,
                      process_existing, auto_archive, auto_tag_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    config.path,
                    config.filter_mode,
                    presets_json,
                    config.filter_regex,
                    config.process_existing as i64,
                    config.auto_archive as i64,
                    config.auto_tag_id,
                ],
            );
            if let Err(e) = result {
                return if is_unique_violation(&e) {
                    Err(MahPastesError::Validation("folder already watched".into()))
                } else {
                    Err(e.into())
                };
            }
            conn.last_insert_rowid()
        };

        Ok(WatchedFolder {
            id,
            path: config.path,
            filter_mode: config.filter_mode,
            filter_presets: config.filter_presets,
            filter_regex: config.filter_regex,
            process_existing: config.process_existing,
            auto_archive: config.auto_archive,
            auto_tag_id: config.auto_tag_id,
            is_paused: false,
            created_at: schema::now_timestamp(),
            exists: true,
        })
    }

    /// Update folder config. The path is never reassigned.
    pub fn update_watched_folder(&self, id: i64, config: WatchedFolderConfig) -> Result<()> {
        validate_filter_config(&config.filter_mode, &config.filter_presets)?;
        let presets_json = if config.filter_presets.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&config.filter_presets)?)
        };

        let conn = self.lock_conn();
        let rows = conn.execute(
            "UPDATE watched_folders
             SET filter_mode = ?1, filter_presets = ?2, filter_regex = ?3,
                 process_existing = ?4, auto_archive = ?5, auto_tag_id = ?6
             WHERE id = ?7",
            params![
                config.filter_mode,
                presets_json,
                config.filter_regex,
                config.process_existing as i64,
                config.auto_archive as i64,
                config.auto_tag_id,
                id,
            ],
        )?;
        if rows == 0 {
            return Err(MahPastesError::NotFound(format!("watched folder {}", id)));
        }
        Ok(())
    }

    pub fn remove_watched_folder(&self, id: i64) -> Result<()> {
        let conn = self.lock_conn();
        conn.execute("DELETE FROM watched_folders WHERE id = ?1", params![id])?;
        Ok(())
    }

    pub fn set_folder_paused(&self, id: i64, paused: bool) -> Result<()> {
        let conn = self.lock_conn();
        conn.execute(
            "UPDATE watched_folders SET is_paused = ?1 WHERE id = ?2",
            params![paused as i64, id],
        )?;
        Ok(())
    }

    pub fn pause_all_folders(&self) -> Result<()> {
        let conn = self.lock_conn();
        conn.execute("UPDATE watched_folders SET is_paused = 1", [])?;
        Ok(())
    }

    pub fn watch_status(&self) -> Result<WatchStatus> {
        let global_paused = self.global_watch_paused();
        let folders = self.list_watched_folders()?;
        let active_count = folders.iter().filter(|f| !f.is_paused && f.exists).count();
        Ok(WatchStatus {
            global_paused,
            active_count,
            total_count: folders.len(),
            is_watching: !global_paused && active_count > 0,
        })
    }

    // ----- Settings -----

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.lock_conn();
        schema::get_setting(&conn, key)
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.lock_conn();
        schema::set_setting(&conn, key, value)
    }

    pub fn global_watch_paused(&self) -> bool {
        self.get_setting(GLOBAL_WATCH_PAUSED_KEY)
            .ok()
            .flatten()
            .map(|v| v == "true")
            .unwrap_or(false)
    }

    pub fn set_global_watch_paused(&self, paused: bool) -> Result<()> {
        self.set_setting(GLOBAL_WATCH_PAUSED_KEY, if paused { "true" } else { "false" })
    }

    // ----- Plugin registry -----

    pub fn list_plugins(&self) -> Result<Vec<PluginRow>> {
        let conn = self.lock_conn();
        schema::list_plugins(&conn)
    }

    pub fn list_loadable_plugins(&self) -> Result<Vec<PluginRow>> {
        let conn = self.lock_conn();
        schema::list_loadable_plugins(&conn)
    }

    pub fn get_plugin(&self, id: i64) -> Result<Option<PluginRow>> {
        let conn = self.lock_conn();
        schema::get_plugin(&conn, id)
    }

    pub fn upsert_plugin(&self, filename: &str, name: &str, version: &str) -> Result<i64> {
        let conn = self.lock_conn();
        schema::upsert_plugin(&conn, filename, name, version)
    }

    pub fn set_plugin_enabled(&self, id: i64, enabled: bool) -> Result<()> {
        let conn = self.lock_conn();
        schema::set_plugin_enabled(&conn, id, enabled)
    }

    pub fn delete_plugin(&self, id: i64) -> Result<()> {
        let conn = self.lock_conn();
        schema::delete_plugin(&conn, id)
    }

    pub fn increment_plugin_error_count(&self, id: i64) -> Result<i64> {
        let conn = self.lock_conn();
        schema::increment_plugin_error_count(&conn, id)
    }

    pub fn reset_plugin_error_count(&self, id: i64) -> Result<()> {
        let conn = self.lock_conn();
        schema::reset_plugin_error_count(&conn, id)
    }

    pub fn mark_plugin_errored(&self, id: i64) -> Result<()> {
        let conn = self.lock_conn();
        schema::mark_plugin_errored(&conn, id)
    }

    pub fn list_plugin_permissions(&self, plugin_id: i64) -> Result<Vec<PluginPermission>> {
        let conn = self.lock_conn();
        schema::list_plugin_permissions(&conn, plugin_id)
    }

    pub fn insert_plugin_permission(
        &self,
        plugin_id: i64,
        permission_type: &str,
        path: &str,
    ) -> Result<()> {
        let conn = self.lock_conn();
        schema::insert_plugin_permission(&conn, plugin_id, permission_type, path)
    }

    pub fn revoke_plugin_permission(
        &self,
        plugin_id: i64,
        permission_type: &str,
        path: &str,
    ) -> Result<()> {
        let conn = self.lock_conn();
        schema::revoke_plugin_permission(&conn, plugin_id, permission_type, path)
    }

    pub fn get_plugin_storage(&self, plugin_id: i64, key: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.lock_conn();
        schema::get_plugin_storage(&conn, plugin_id, key)
    }

    pub fn set_plugin_storage(&self, plugin_id: i64, key: &str, value: &[u8]) -> Result<()> {
        let conn = self.lock_conn();
        schema::set_plugin_storage(&conn, plugin_id, key, value)
    }

    pub fn delete_plugin_storage(&self, plugin_id: i64, key: &str) -> Result<()> {
        let conn = self.lock_conn();
        schema::delete_plugin_storage(&conn, plugin_id, key)
    }

    pub fn list_plugin_storage(&self, plugin_id: i64) -> Result<Vec<(String, Vec<u8>)>> {
        let conn = self.lock_conn();
        schema::list_plugin_storage(&conn, plugin_id)
    }

    // ----- Transient exports -----

    /// Materialize a clip into the temp-files directory and return the path.
    pub fn create_temp_file(&self, temp_dir: &Path, id: i64) -> Result<PathBuf> {
        let row = self.get_clip_raw(id)?;

        let safe_name = match row.filename.as_deref().filter(|f| !f.is_empty()) {
            Some(name) => {
                let base = Path::new(name)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| name.to_string());
                format!("{}_{}", id, base)
            }
            None => format!("{}{}", id, extension_for_mime(&row.content_type)),
        };

        std::fs::create_dir_all(temp_dir)?;
        let path = temp_dir.join(safe_name);
        std::fs::write(&path, &row.data)?;
        Ok(path)
    }

    /// Write a ZIP of the selected clips to dest. Returns the entry count.
    /// Per-clip failures are logged and skipped.
    pub fn bulk_download_zip(&self, ids: &[i64], dest: &Path) -> Result<usize> {
        if ids.is_empty() {
            return Err(MahPastesError::Validation("no clip ids provided".into()));
        }

        let file = std::fs::File::create(dest)?;
        let mut zip = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();

        let mut count = 0;
        for &id in ids {
            let row = match self.get_clip_raw(id) {
                Ok(row) => row,
                Err(e) => {
                    log::warn!("bulk_download_zip: skipping clip {}: {}", id, e);
                    continue;
                }
            };

            let name = match row.filename.as_deref().filter(|f| !f.is_empty()) {
                Some(filename) => format!("{}_{}", id, filename),
                None => format!("clip_{}{}", id, extension_for_mime(&row.content_type)),
            };

            zip.start_file(&name, options)?;
            if let Err(e) = std::io::Write::write_all(&mut zip, &row.data) {
                log::warn!("bulk_download_zip: failed writing {}: {}", name, e);
                continue;
            }
            count += 1;
        }

        zip.finish()?;
        Ok(count)
    }
}

/// Sniff the effective content type when the declared one is empty or
/// text/plain: HTML doctype, then JSON, then plain text.
pub fn sniff_content_type(content_type: &str, data: &[u8]) -> String {
    if !content_type.is_empty() && content_type != "text/plain" {
        return content_type.to_string();
    }

    let text = String::from_utf8_lossy(data);
    let trimmed = text.trim();
    if trimmed.starts_with("<!DOCTYPE html") {
        "text/html".to_string()
    } else if serde_json::from_str::<serde_json::Value>(trimmed).is_ok() && !trimmed.is_empty() {
        "application/json".to_string()
    } else {
        "text/plain".to_string()
    }
}

fn validate_filter_config(filter_mode: &str, presets: &[String]) -> Result<()> {
    match filter_mode {
        "all" | "presets" | "custom" => {}
        other => {
            return Err(MahPastesError::Validation(format!(
                "unknown filter mode: {}",
                other
            )))
        }
    }
    for preset in presets {
        if preset_extensions(preset).is_none() {
            return Err(MahPastesError::Validation(format!(
                "unknown filter preset: {}",
                preset
            )));
        }
    }
    Ok(())
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, msg) => {
            e.code == rusqlite::ErrorCode::ConstraintViolation
                && msg
                    .as_deref()
                    .map(|m| m.contains("UNIQUE"))
                    .unwrap_or(true)
        }
        _ => false,
    }
}

// ----- Expiry sweeper -----

pub struct SweeperHandle {
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    pub fn stop(mut self) {
        let _ = self.stop_tx.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Spawn the once-per-minute expiry sweep. The thread lives until the handle
/// is stopped or dropped with the process.
pub fn spawn_expiry_sweeper(store: Arc<Store>) -> SweeperHandle {
    let (stop_tx, stop_rx) = channel();
    let handle = std::thread::Builder::new()
        .name("expiry-sweeper".into())
        .spawn(move || loop {
            match stop_rx.recv_timeout(Duration::from_secs(CLEANUP_INTERVAL_SECS)) {
                Err(RecvTimeoutError::Timeout) => match store.delete_expired() {
                    Ok(rows) if rows > 0 => log::info!("Cleaned up {} expired clips", rows),
                    Ok(_) => {}
                    Err(e) => log::error!("Failed to delete expired clips: {}", e),
                },
                _ => return,
            }
        })
        .expect("failed to spawn expiry sweeper thread");

    SweeperHandle {
        stop_tx,
        handle: Some(handle),
    }
}
