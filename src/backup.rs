// Backup and restore
// A backup is a ZIP holding manifest.json, database.sql (INSERT statements
// in dependency order, blobs as X'..' hex literals, sensitive settings
// excluded), and the plugin source files. Restore wipes and replays under a
// single transaction and marks restored filesystem grants pending_reconfirm.

use std::io::{Read, Write};
use std::path::{Component, Path};

use chrono::Utc;
use rusqlite::types::ValueRef;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::constants::{APP_VERSION, BACKUP_FORMAT_VERSION, SENSITIVE_SETTING_PATTERNS};
use crate::db::store::Store;
use crate::error::{MahPastesError, Result};

/// Tables in dependency order: tags before clip_tags, plugins before
/// plugin_storage / plugin_permissions.
const BACKUP_TABLES: [&str; 8] = [
    "clips",
    "tags",
    "clip_tags",
    "settings",
    "watched_folders",
    "plugins",
    "plugin_storage",
    "plugin_permissions",
];

/// Wipe order is the reverse dependency order so foreign keys never trip.
const WIPE_TABLES: [&str; 8] = [
    "plugin_permissions",
    "plugin_storage",
    "plugins",
    "clip_tags",
    "tags",
    "clips",
    "watched_folders",
    "settings",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupManifest {
    pub format_version: u32,
    pub app_version: String,
    pub created_at: String,
    pub platform: String,
    pub summary: BackupSummary,
    pub excluded: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackupSummary {
    pub clips: usize,
    pub tags: usize,
    pub plugins: usize,
    pub watch_folders: usize,
}

pub fn is_sensitive_setting(key: &str) -> bool {
    let key = key.to_lowercase();
    SENSITIVE_SETTING_PATTERNS
        .iter()
        .any(|pattern| key.contains(pattern))
}

fn format_sql_value(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => "NULL".to_string(),
        ValueRef::Integer(i) => i.to_string(),
        ValueRef::Real(f) => f.to_string(),
        ValueRef::Text(t) => {
            let text = String::from_utf8_lossy(t);
            format!("'{}'", text.replace('\'', "''"))
        }
        ValueRef::Blob(b) => format!("X'{}'", hex::encode(b)),
    }
}

/// Export one table as INSERT statements. For the settings table, sensitive
/// keys are skipped and collected into `excluded`.
fn export_table(
    conn: &Connection,
    table: &str,
    out: &mut impl Write,
    excluded: &mut Vec<String>,
) -> Result<usize> {
    let mut stmt = conn.prepare(&format!("SELECT * FROM {}", table))?;
    let column_names: Vec<String> = stmt
        .column_names()
        .iter()
        .map(|name| name.to_string())
        .collect();
    let key_index = column_names.iter().position(|name| name == "key");

    let mut count = 0;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        if table == "settings" {
            if let Some(idx) = key_index {
                if let Ok(ValueRef::Text(key)) = row.get_ref(idx) {
                    let key = String::from_utf8_lossy(key).into_owned();
                    if is_sensitive_setting(&key) {
                        excluded.push(key);
                        continue;
                    }
                }
            }
        }

        let mut values = Vec::with_capacity(column_names.len());
        for i in 0..column_names.len() {
            values.push(format_sql_value(row.get_ref(i)?));
        }

        writeln!(
            out,
            "INSERT INTO {} ({}) VALUES ({});",
            table,
            column_names.join(", "),
            values.join(", ")
        )?;
        count += 1;
    }
    Ok(count)
}

fn export_database_sql(store: &Store, out: &mut impl Write) -> Result<(BackupSummary, Vec<String>)> {
    let conn = store.lock_conn();

    writeln!(out, "-- mahpastes backup")?;
    writeln!(out, "-- Created: {}", Utc::now().to_rfc3339())?;
    writeln!(out, "-- Format version: {}", BACKUP_FORMAT_VERSION)?;
    writeln!(out)?;

    let mut summary = BackupSummary::default();
    let mut excluded = Vec::new();

    for table in BACKUP_TABLES {
        writeln!(out, "-- Table: {}", table)?;
        let count = export_table(&conn, table, out, &mut excluded)?;
        writeln!(out)?;
        match table {
            "clips" => summary.clips = count,
            "tags" => summary.tags = count,
            "plugins" => summary.plugins = count,
            "watched_folders" => summary.watch_folders = count,
            _ => {}
        }
    }

    Ok((summary, excluded))
}

/// Create a backup ZIP at dest. Returns the written manifest.
pub fn create_backup(store: &Store, plugins_dir: &Path, dest: &Path) -> Result<BackupManifest> {
    let mut sql = Vec::new();
    let (summary, excluded) = export_database_sql(store, &mut sql)?;

    let manifest = BackupManifest {
        format_version: BACKUP_FORMAT_VERSION,
        app_version: APP_VERSION.to_string(),
        created_at: Utc::now().to_rfc3339(),
        platform: std::env::consts::OS.to_string(),
        summary,
        excluded,
    };

    let file = std::fs::File::create(dest)?;
    let mut zip = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default();

    zip.start_file("manifest.json", options)?;
    zip.write_all(&serde_json::to_vec_pretty(&manifest)?)?;

    zip.start_file("database.sql", options)?;
    zip.write_all(&sql)?;

    // Plugin sources travel with the data they configure
    if let Ok(entries) = std::fs::read_dir(plugins_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            if path.is_dir() || !name.ends_with(".lua") {
                continue;
            }
            match std::fs::read(&path) {
                Ok(source) => {
                    zip.start_file(format!("plugins/{}", name), options)?;
                    zip.write_all(&source)?;
                }
                Err(e) => log::warn!("Failed to copy plugin {}: {}", name, e),
            }
        }
    }

    zip.finish()?;
    Ok(manifest)
}

/// Open a backup and return its manifest without touching the store.
pub fn validate_backup(backup_path: &Path) -> Result<BackupManifest> {
    let file = std::fs::File::open(backup_path)?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|e| MahPastesError::Backup(format!("invalid backup file: {}", e)))?;

    let mut manifest_file = archive.by_name("manifest.json").map_err(|_| {
        MahPastesError::Backup("this doesn't appear to be a mahpastes backup (missing manifest)".into())
    })?;
    let mut content = String::new();
    manifest_file.read_to_string(&mut content)?;

    let manifest: BackupManifest = serde_json::from_str(&content)
        .map_err(|e| MahPastesError::Backup(format!("failed to parse manifest: {}", e)))?;
    Ok(manifest)
}

/// Restore a backup: pause all watches, wipe and replay the database under
/// one transaction, mark restored grants pending_reconfirm, extract plugin
/// sources (zip-slip checked). The caller reloads plugins and refreshes the
/// watcher afterwards.
pub fn restore_backup(store: &Store, plugins_dir: &Path, backup_path: &Path) -> Result<BackupManifest> {
    let manifest = validate_backup(backup_path)?;
    if manifest.format_version > BACKUP_FORMAT_VERSION {
        return Err(MahPastesError::Backup(format!(
            "backup format version {} is newer than supported ({})",
            manifest.format_version, BACKUP_FORMAT_VERSION
        )));
    }

    // Stop ingestion while the tables are in flux
    store.pause_all_folders()?;

    let file = std::fs::File::open(backup_path)?;
    let mut archive = zip::ZipArchive::new(file)?;

    let mut sql = String::new();
    archive
        .by_name("database.sql")
        .map_err(|_| MahPastesError::Backup("backup is missing database.sql".into()))?
        .read_to_string(&mut sql)?;

    {
        let mut conn = store.lock_conn();
        let tx = conn.transaction()?;
        for table in WIPE_TABLES {
            tx.execute(&format!("DELETE FROM {}", table), [])?;
        }
        tx.execute_batch(&sql)?;
        // Every restored grant awaits explicit user re-approval
        tx.execute("UPDATE plugin_permissions SET pending_reconfirm = 1", [])?;
        tx.commit()?;
    }

    extract_plugin_sources(&mut archive, plugins_dir)?;

    Ok(manifest)
}

/// Extract plugins/<name>.lua entries. An entry whose cleaned path would
/// escape the plugins directory is rejected.
fn extract_plugin_sources(
    archive: &mut zip::ZipArchive<std::fs::File>,
    plugins_dir: &Path,
) -> Result<()> {
    std::fs::create_dir_all(plugins_dir)?;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let name = entry.name().to_string();

        let rel = match name.strip_prefix("plugins/") {
            Some(rel) if !rel.is_empty() => rel.to_string(),
            _ => continue,
        };
        if entry.is_dir() {
            continue;
        }

        // Zip-slip: only plain file names are allowed under plugins/
        let rel_path = Path::new(&rel);
        let is_plain = rel_path
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
            && rel_path.components().count() == 1;
        if !is_plain {
            log::warn!("Skipping suspicious backup entry: {}", name);
            continue;
        }

        let dest = plugins_dir.join(rel_path);
        if !dest.starts_with(plugins_dir) {
            log::warn!("Skipping backup entry escaping plugins dir: {}", name);
            continue;
        }

        let mut content = Vec::new();
        entry.read_to_end(&mut content)?;
        std::fs::write(&dest, &content)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_memory_db;
    use crate::db::schema::WatchedFolderConfig;
    use crate::db::store::Store;
    use crate::events::EventBus;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn test_store() -> Arc<Store> {
        let bus = Arc::new(EventBus::new());
        let conn = open_memory_db().unwrap();
        Store::new(conn, bus)
    }

    fn populate(store: &Store, watch_dir: &Path) -> (i64, i64) {
        let text_clip = store
            .put_clip("text/plain", b"hello backup".to_vec(), Some("note.txt"), None)
            .unwrap();
        let binary_clip = store
            .put_clip(
                "image/png",
                vec![0x89, 0x50, 0x4E, 0x47, 0x00, 0xFF],
                Some("img.png"),
                None,
            )
            .unwrap();

        let tag = store.create_tag("backup-tag").unwrap();
        store.add_tag_to_clip(tag.id, text_clip).unwrap();

        store.set_setting("theme", "dark").unwrap();
        store.set_setting("fal_api_key", "super-secret").unwrap();

        store
            .add_watched_folder(WatchedFolderConfig {
                path: watch_dir.to_string_lossy().into_owned(),
                ..Default::default()
            })
            .unwrap();

        let plugin_id = store.upsert_plugin("helper.lua", "Helper", "1.0.0").unwrap();
        store
            .set_plugin_storage(plugin_id, "counter", b"41")
            .unwrap();
        store
            .insert_plugin_permission(plugin_id, "fs_read", "/granted/path")
            .unwrap();

        (text_clip, binary_clip)
    }

    #[test]
    fn test_backup_round_trip() {
        let source_store = test_store();
        let watch_dir = TempDir::new().unwrap();
        let (text_clip, binary_clip) = populate(&source_store, watch_dir.path());

        let plugins_dir = TempDir::new().unwrap();
        std::fs::write(
            plugins_dir.path().join("helper.lua"),
            b"Plugin = { name = \"Helper\" }\n",
        )
        .unwrap();

        let out_dir = TempDir::new().unwrap();
        let backup_path = out_dir.path().join("backup.zip");
        let manifest =
            create_backup(&source_store, plugins_dir.path(), &backup_path).unwrap();

        assert_eq!(manifest.format_version, BACKUP_FORMAT_VERSION);
        assert_eq!(manifest.summary.clips, 2);
        assert_eq!(manifest.summary.tags, 1);
        assert_eq!(manifest.summary.plugins, 1);
        assert_eq!(manifest.summary.watch_folders, 1);
        assert_eq!(manifest.excluded, vec!["fal_api_key".to_string()]);

        // Restore into a fresh store
        let target_store = test_store();
        let target_plugins = TempDir::new().unwrap();
        let restored =
            restore_backup(&target_store, target_plugins.path(), &backup_path).unwrap();
        assert_eq!(restored.summary.clips, 2);

        // Clip payloads survive, including binary bytes via hex literals
        let text = target_store.get_clip(text_clip).unwrap();
        assert_eq!(text.data, "hello backup");
        let binary = target_store.get_clip_raw(binary_clip).unwrap();
        assert_eq!(binary.data, vec![0x89, 0x50, 0x4E, 0x47, 0x00, 0xFF]);

        // Tags and associations
        let tags = target_store.list_tags().unwrap();
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].name, "backup-tag");
        assert_eq!(tags[0].count, 1);

        // Sensitive settings excluded, normal ones restored
        assert_eq!(
            target_store.get_setting("theme").unwrap().as_deref(),
            Some("dark")
        );
        assert_eq!(target_store.get_setting("fal_api_key").unwrap(), None);

        // Watched folder restored
        assert_eq!(target_store.list_watched_folders().unwrap().len(), 1);

        // Plugin row, storage, and source file restored
        let plugins = target_store.list_plugins().unwrap();
        assert_eq!(plugins.len(), 1);
        assert_eq!(
            target_store
                .get_plugin_storage(plugins[0].id, "counter")
                .unwrap()
                .as_deref(),
            Some(b"41".as_slice())
        );
        assert!(target_plugins.path().join("helper.lua").exists());

        // Every restored grant is pending re-approval
        let perms = target_store.list_plugin_permissions(plugins[0].id).unwrap();
        assert_eq!(perms.len(), 1);
        assert!(perms[0].pending_reconfirm);
    }

    #[test]
    fn test_restore_pauses_existing_folders() {
        let store = test_store();
        let watch_dir = TempDir::new().unwrap();
        populate(&store, watch_dir.path());

        let plugins_dir = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let backup_path = out.path().join("b.zip");
        create_backup(&store, plugins_dir.path(), &backup_path).unwrap();

        // The folder in the backup was not paused; after restore its stored
        // state is replayed (restore only pauses during the window)
        restore_backup(&store, plugins_dir.path(), &backup_path).unwrap();
        let folders = store.list_watched_folders().unwrap();
        assert_eq!(folders.len(), 1);
        assert!(!folders[0].is_paused);
    }

    #[test]
    fn test_zip_slip_entry_never_escapes() {
        let store = test_store();
        let plugins_dir = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let backup_path = out.path().join("evil.zip");

        // Hand-craft a backup with a traversal entry
        let manifest = BackupManifest {
            format_version: BACKUP_FORMAT_VERSION,
            app_version: APP_VERSION.to_string(),
            created_at: Utc::now().to_rfc3339(),
            platform: std::env::consts::OS.to_string(),
            summary: BackupSummary::default(),
            excluded: Vec::new(),
        };
        {
            let file = std::fs::File::create(&backup_path).unwrap();
            let mut zip = zip::ZipWriter::new(file);
            let options = zip::write::SimpleFileOptions::default();
            zip.start_file("manifest.json", options).unwrap();
            zip.write_all(&serde_json::to_vec(&manifest).unwrap()).unwrap();
            zip.start_file("database.sql", options).unwrap();
            zip.write_all(b"-- empty\n").unwrap();
            zip.start_file("plugins/../outside.lua", options).unwrap();
            zip.write_all(b"Plugin = { name = \"Evil\" }\n").unwrap();
            zip.start_file("plugins/nested/dir.lua", options).unwrap();
            zip.write_all(b"Plugin = { name = \"Nested\" }\n").unwrap();
            zip.finish().unwrap();
        }

        restore_backup(&store, plugins_dir.path(), &backup_path).unwrap();

        // Neither entry materialized anywhere
        assert!(!plugins_dir.path().join("outside.lua").exists());
        assert!(!plugins_dir
            .path()
            .parent()
            .unwrap()
            .join("outside.lua")
            .exists());
        assert!(!plugins_dir.path().join("nested").exists());
    }

    #[test]
    fn test_newer_format_version_rejected() {
        let store = test_store();
        let plugins_dir = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let backup_path = out.path().join("future.zip");

        let manifest = BackupManifest {
            format_version: BACKUP_FORMAT_VERSION + 1,
            app_version: "99.0.0".to_string(),
            created_at: Utc::now().to_rfc3339(),
            platform: "linux".to_string(),
            summary: BackupSummary::default(),
            excluded: Vec::new(),
        };
        {
            let file = std::fs::File::create(&backup_path).unwrap();
            let mut zip = zip::ZipWriter::new(file);
            let options = zip::write::SimpleFileOptions::default();
            zip.start_file("manifest.json", options).unwrap();
            zip.write_all(&serde_json::to_vec(&manifest).unwrap()).unwrap();
            zip.start_file("database.sql", options).unwrap();
            zip.write_all(b"").unwrap();
            zip.finish().unwrap();
        }

        let err = restore_backup(&store, plugins_dir.path(), &backup_path).unwrap_err();
        assert!(err.to_string().contains("newer than supported"));
    }

    #[test]
    fn test_validate_rejects_garbage() {
        let out = TempDir::new().unwrap();
        let not_zip = out.path().join("garbage.zip");
        std::fs::write(&not_zip, b"this is not a zip file").unwrap();
        assert!(validate_backup(&not_zip).is_err());

        // A zip without a manifest is not a backup
        let no_manifest = out.path().join("nomanifest.zip");
        {
            let file = std::fs::File::create(&no_manifest).unwrap();
            let mut zip = zip::ZipWriter::new(file);
            zip.start_file("random.txt", zip::write::SimpleFileOptions::default())
                .unwrap();
            zip.write_all(b"hi").unwrap();
            zip.finish().unwrap();
        }
        let err = validate_backup(&no_manifest).unwrap_err();
        assert!(err.to_string().contains("missing manifest"));
    }

    #[test]
    fn test_sensitive_setting_patterns() {
        assert!(is_sensitive_setting("fal_api_key"));
        assert!(is_sensitive_setting("MY_SECRET_VALUE"));
        assert!(is_sensitive_setting("password"));
        assert!(is_sensitive_setting("auth_token"));
        assert!(!is_sensitive_setting("theme"));
        assert!(!is_sensitive_setting("global_watch_paused"));
    }
}
