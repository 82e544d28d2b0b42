// Plugin filesystem API
// Manifest filesystem.read/write flags are capability intents, not grants.
// Each call resolves the requested path against already-granted prefixes or
// asks the host's permission callback; grants persist in the store. Rows
// marked pending_reconfirm (restored from a backup) do not count as granted.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};

use mlua::Lua;

use super::PermissionCallback;
use crate::constants::{FS_OPERATIONS_PER_MINUTE, MAX_READ_FILE_SIZE};
use crate::db::store::Store;
use crate::plugin::manifest::FilesystemPerms;
use crate::plugin::MinuteWindow;

pub const PERM_READ: &str = "fs_read";
pub const PERM_WRITE: &str = "fs_write";

struct FsApi {
    store: Arc<Store>,
    plugin_id: i64,
    plugin_name: String,
    wants_read: bool,
    wants_write: bool,
    perm_callback: Option<PermissionCallback>,
    /// "permType:path" -> approved path
    approved: Mutex<HashMap<String, String>>,
    window: Mutex<MinuteWindow>,
}

impl FsApi {
    fn new(
        store: Arc<Store>,
        plugin_id: i64,
        plugin_name: String,
        perms: FilesystemPerms,
        perm_callback: Option<PermissionCallback>,
    ) -> FsApi {
        let api = FsApi {
            store,
            plugin_id,
            plugin_name,
            wants_read: perms.read,
            wants_write: perms.write,
            perm_callback,
            approved: Mutex::new(HashMap::new()),
            window: Mutex::new(MinuteWindow::new(
                FS_OPERATIONS_PER_MINUTE,
                "operations per minute",
            )),
        };
        api.load_permissions();
        api
    }

    fn load_permissions(&self) {
        let perms = match self.store.list_plugin_permissions(self.plugin_id) {
            Ok(perms) => perms,
            Err(_) => return,
        };
        let mut approved = self.approved.lock().unwrap();
        for perm in perms {
            // Restored grants await user re-approval
            if perm.pending_reconfirm {
                continue;
            }
            approved.insert(
                format!("{}:{}", perm.permission_type, perm.path),
                perm.path,
            );
        }
    }

    fn check_rate_limit(&self) -> Result<(), String> {
        self.window.lock().unwrap().check()
    }

    /// Resolve access for one call. Returns the absolute path to operate on.
    fn check_permission(&self, perm_type: &str, path: &str) -> Result<PathBuf, String> {
        let abs_path = std::path::absolute(path).map_err(|e| format!("invalid path: {}", e))?;
        let abs_path = clean_path(&abs_path);
        let abs_str = abs_path.to_string_lossy().into_owned();

        if perm_type == PERM_READ && !self.wants_read {
            return Err("plugin did not declare filesystem.read permission".to_string());
        }
        if perm_type == PERM_WRITE && !self.wants_write {
            return Err("plugin did not declare filesystem.write permission".to_string());
        }

        {
            let approved = self.approved.lock().unwrap();

            // Exact match
            if approved.contains_key(&format!("{}:{}", perm_type, abs_str)) {
                return Ok(abs_path);
            }

            // Any granted ancestor directory covers the request
            let prefix = format!("{}:", perm_type);
            for key in approved.keys() {
                if let Some(granted) = key.strip_prefix(&prefix) {
                    if is_sub_path(Path::new(granted), &abs_path) {
                        return Ok(abs_path);
                    }
                }
            }
        }

        // Ask the host for a grant
        let callback = self
            .perm_callback
            .as_ref()
            .ok_or_else(|| "filesystem access not available".to_string())?;

        let granted = callback(&self.plugin_name, perm_type, &abs_path)
            .ok_or_else(|| format!("permission denied for {}", abs_str))?;
        let granted = clean_path(&granted);
        let granted_str = granted.to_string_lossy().into_owned();

        // Persist and cache the grant, then confirm it actually covers the
        // requested path
        if self
            .store
            .insert_plugin_permission(self.plugin_id, perm_type, &granted_str)
            .is_ok()
        {
            self.approved
                .lock()
                .unwrap()
                .insert(format!("{}:{}", perm_type, granted_str), granted_str.clone());
        }

        if !is_sub_path(&granted, &abs_path) {
            return Err(format!(
                "approved path {} does not cover requested path {}",
                granted_str, abs_str
            ));
        }

        Ok(abs_path)
    }

    /// True only when the path sits under an already-approved read grant.
    /// Existence of anything else is not leaked.
    fn exists_allowed(&self, path: &Path) -> bool {
        if !self.wants_read {
            return false;
        }
        let approved = self.approved.lock().unwrap();
        let prefix = format!("{}:", PERM_READ);
        approved.keys().any(|key| {
            key.strip_prefix(&prefix)
                .map(|granted| is_sub_path(Path::new(granted), path))
                .unwrap_or(false)
        })
    }
}

/// Resolve `.` and `..` components lexically. Symlinks are not chased; the
/// comparison is over the path the plugin actually named.
pub(crate) fn clean_path(path: &Path) -> PathBuf {
    let mut cleaned = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                cleaned.pop();
            }
            other => cleaned.push(other),
        }
    }
    cleaned
}

/// base covers target when target == base or target is inside base.
fn is_sub_path(base: &Path, target: &Path) -> bool {
    target.starts_with(base)
}

pub fn register(
    lua: &Lua,
    store: Arc<Store>,
    plugin_id: i64,
    plugin_name: String,
    perms: FilesystemPerms,
    perm_callback: Option<PermissionCallback>,
) -> mlua::Result<()> {
    let api = Arc::new(FsApi::new(store, plugin_id, plugin_name, perms, perm_callback));
    let fs_mod = lua.create_table()?;

    let read_api = Arc::clone(&api);
    fs_mod.set(
        "read",
        lua.create_function(move |lua, path: String| {
            if let Err(e) = read_api.check_rate_limit() {
                return Ok((None, Some(e)));
            }
            let approved = match read_api.check_permission(PERM_READ, &path) {
                Ok(p) => p,
                Err(e) => return Ok((None, Some(e))),
            };

            // Size check before reading to prevent memory exhaustion
            let meta = match std::fs::metadata(&approved) {
                Ok(m) => m,
                Err(e) => return Ok((None, Some(e.to_string()))),
            };
            if meta.len() > MAX_READ_FILE_SIZE {
                return Ok((
                    None,
                    Some(format!(
                        "file too large: {} bytes (max {} bytes)",
                        meta.len(),
                        MAX_READ_FILE_SIZE
                    )),
                ));
            }

            match std::fs::read(&approved) {
                Ok(data) => Ok((Some(lua.create_string(&data)?), None)),
                Err(e) => Ok((None, Some(e.to_string()))),
            }
        })?,
    )?;

    let write_api = Arc::clone(&api);
    fs_mod.set(
        "write",
        lua.create_function(move |_, (path, content): (String, mlua::String)| {
            if let Err(e) = write_api.check_rate_limit() {
                return Ok((false, Some(e)));
            }
            let approved = match write_api.check_permission(PERM_WRITE, &path) {
                Ok(p) => p,
                Err(e) => return Ok((false, Some(e))),
            };

            if let Some(parent) = approved.parent() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    return Ok((false, Some(e.to_string())));
                }
            }
            match std::fs::write(&approved, content.as_bytes()) {
                Ok(()) => Ok((true, None)),
                Err(e) => Ok((false, Some(e.to_string()))),
            }
        })?,
    )?;

    let list_api = Arc::clone(&api);
    fs_mod.set(
        "list",
        lua.create_function(move |lua, path: String| {
            if let Err(e) = list_api.check_rate_limit() {
                return Ok((None, Some(e)));
            }
            let approved = match list_api.check_permission(PERM_READ, &path) {
                Ok(p) => p,
                Err(e) => return Ok((None, Some(e))),
            };

            let entries = match std::fs::read_dir(&approved) {
                Ok(entries) => entries,
                Err(e) => return Ok((None, Some(e.to_string()))),
            };

            let result = lua.create_table()?;
            let mut index = 1;
            for entry in entries.flatten() {
                let meta = match entry.metadata() {
                    Ok(m) => m,
                    Err(_) => continue,
                };
                let item = lua.create_table()?;
                item.set("name", entry.file_name().to_string_lossy().into_owned())?;
                item.set("is_dir", meta.is_dir())?;
                item.set("size", meta.len())?;
                if let Ok(modified) = meta.modified() {
                    if let Ok(secs) = modified.duration_since(std::time::UNIX_EPOCH) {
                        item.set("modified", secs.as_secs())?;
                    }
                }
                result.set(index, item)?;
                index += 1;
            }
            Ok((Some(result), None))
        })?,
    )?;

    let exists_api = api;
    fs_mod.set(
        "exists",
        lua.create_function(move |_, path: String| {
            let abs = match std::path::absolute(&path) {
                Ok(p) => clean_path(&p),
                Err(_) => return Ok(false),
            };
            if !exists_api.exists_allowed(&abs) {
                return Ok(false);
            }
            Ok(abs.exists())
        })?,
    )?;

    lua.globals().set("fs", fs_mod)?;
    Ok(())
}
