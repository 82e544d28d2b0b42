// Sandboxed script host
// Loads plugins from the plugins directory, wires their capability-gated
// host APIs, dispatches bus events to subscribed handlers, runs manifest
// schedules, and quarantines plugins after repeated failures.

pub mod manifest;
pub mod sandbox;
pub mod scheduler;

mod api_clips;
mod api_fs;
mod api_http;
mod api_storage;
mod api_tags;
mod api_task;
mod api_toast;
mod api_utils;

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::MAX_CONSECUTIVE_ERRORS;
use crate::db::store::Store;
use crate::error::{MahPastesError, Result};
use crate::events::{is_valid_event, BusEvent, EventBus, EventSink};
use self::manifest::{parse_manifest, FormField, Manifest};
use self::sandbox::Sandbox;
use self::scheduler::Scheduler;

/// Host-supplied decision point for filesystem grants: given plugin name,
/// permission type and requested path, returns the approved path (possibly
/// an ancestor directory) or None to deny.
pub type PermissionCallback = Arc<dyn Fn(&str, &str, &Path) -> Option<PathBuf> + Send + Sync>;

/// Result of a plugin UI action execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_clip_id: Option<i64>,
}

/// Aggregate plugin view for the shell.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginInfo {
    pub id: i64,
    pub name: String,
    pub version: String,
    pub description: String,
    pub author: String,
    pub enabled: bool,
    pub status: String,
    pub events: Vec<String>,
    pub settings: Vec<FormField>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginUiAction {
    pub plugin_id: i64,
    pub plugin_name: String,
    pub id: String,
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<FormField>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UiActionsResponse {
    pub lightbox_buttons: Vec<PluginUiAction>,
    pub card_actions: Vec<PluginUiAction>,
}

/// Fixed-window rate limiter shared by the host APIs.
pub(crate) struct MinuteWindow {
    max: u32,
    what: &'static str,
    count: u32,
    window_start: Instant,
}

impl MinuteWindow {
    pub(crate) fn new(max: u32, what: &'static str) -> MinuteWindow {
        MinuteWindow {
            max,
            what,
            count: 0,
            window_start: Instant::now(),
        }
    }

    pub(crate) fn check(&mut self) -> std::result::Result<(), String> {
        let now = Instant::now();
        if now.duration_since(self.window_start).as_secs() >= 60 {
            self.count = 0;
            self.window_start = now;
        }
        if self.count >= self.max {
            return Err(format!("rate limit exceeded: {} {}", self.max, self.what));
        }
        self.count += 1;
        Ok(())
    }
}

struct LoadedPlugin {
    id: i64,
    filename: String,
    name: String,
    enabled: bool,
    manifest: Manifest,
    sandbox: Arc<Sandbox>,
}

pub struct PluginManager {
    store: Arc<Store>,
    bus: Arc<EventBus>,
    plugins_dir: PathBuf,
    plugins: Mutex<HashMap<i64, Arc<LoadedPlugin>>>,
    /// event name -> subscribed plugin ids
    subscribers: Mutex<HashMap<String, Vec<i64>>>,
    scheduler: Scheduler,
    perm_callback: Mutex<Option<PermissionCallback>>,
}

impl PluginManager {
    pub fn new(store: Arc<Store>, bus: Arc<EventBus>, plugins_dir: PathBuf) -> Result<Arc<PluginManager>> {
        std::fs::create_dir_all(&plugins_dir)?;
        Ok(Arc::new(PluginManager {
            store,
            bus,
            plugins_dir,
            plugins: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
            scheduler: Scheduler::new(),
            perm_callback: Mutex::new(None),
        }))
    }

    pub fn plugins_dir(&self) -> &Path {
        &self.plugins_dir
    }

    pub fn set_permission_callback(&self, callback: PermissionCallback) {
        *self.perm_callback.lock().unwrap() = Some(callback);
    }

    /// Load every enabled, non-quarantined plugin from the registry.
    pub fn load_plugins(&self) -> Result<()> {
        for row in self.store.list_loadable_plugins()? {
            let name = row.name.clone();
            let id = row.id;
            if let Err(e) = self.load_plugin(id, &row.filename, row.enabled) {
                log::warn!("Failed to load plugin {}: {}", name, e);
                self.record_plugin_failure(id);
            }
        }
        Ok(())
    }

    fn load_plugin(&self, plugin_id: i64, filename: &str, enabled: bool) -> Result<()> {
        let source_path = self.plugins_dir.join(filename);
        let source = std::fs::read_to_string(&source_path)?;

        // Parse the manifest first; it must never require execution
        let manifest = parse_manifest(&source)?;

        let sandbox = Arc::new(Sandbox::new(plugin_id)?);
        self.register_apis(&sandbox, &manifest, plugin_id)?;
        sandbox.load_source(&source)?;

        let plugin = Arc::new(LoadedPlugin {
            id: plugin_id,
            filename: filename.to_string(),
            name: manifest.name.clone(),
            enabled,
            manifest: manifest.clone(),
            sandbox: Arc::clone(&sandbox),
        });

        {
            let mut plugins = self.plugins.lock().unwrap();
            plugins.insert(plugin_id, plugin);
        }
        {
            let mut subscribers = self.subscribers.lock().unwrap();
            for event in &manifest.events {
                if !is_valid_event(event) {
                    log::warn!(
                        "Plugin {} subscribes to unknown event '{}'",
                        manifest.name,
                        event
                    );
                }
                subscribers.entry(event.clone()).or_default().push(plugin_id);
            }
        }

        for schedule in &manifest.schedules {
            self.scheduler.add_task(
                plugin_id,
                &schedule.name,
                schedule.interval,
                Arc::clone(&sandbox),
            );
        }

        log::info!("Loaded plugin: {} v{}", manifest.name, manifest.version);
        Ok(())
    }

    fn register_apis(&self, sandbox: &Sandbox, manifest: &Manifest, plugin_id: i64) -> Result<()> {
        let perm_callback = self.perm_callback.lock().unwrap().clone();
        let store = &self.store;
        let bus = &self.bus;
        sandbox.with_lua(|lua| {
            api_clips::register(lua, Arc::clone(store), manifest.network.clone())?;
            api_tags::register(lua, Arc::clone(store))?;
            api_storage::register(lua, Arc::clone(store), plugin_id)?;
            api_http::register(lua, manifest.network.clone())?;
            api_fs::register(
                lua,
                Arc::clone(store),
                plugin_id,
                manifest.name.clone(),
                manifest.filesystem,
                perm_callback,
            )?;
            api_task::register(lua, Arc::clone(bus), plugin_id)?;
            api_toast::register(lua, Arc::clone(bus), plugin_id)?;
            api_utils::register(lua, manifest.name.clone())?;
            Ok(())
        })
    }

    /// Drop a plugin from memory: schedules, subscriptions, sandbox.
    pub fn unload_plugin(&self, plugin_id: i64) {
        self.scheduler.remove_plugin_tasks(plugin_id);

        {
            let mut subscribers = self.subscribers.lock().unwrap();
            for ids in subscribers.values_mut() {
                ids.retain(|id| *id != plugin_id);
            }
        }

        let removed = self.plugins.lock().unwrap().remove(&plugin_id);
        if let Some(plugin) = removed {
            log::info!("Unloaded plugin: {}", plugin.name);
        }
    }

    /// Dispatch an event to every subscribed plugin. Iterates a snapshot so
    /// handlers can trigger load/unload without deadlocking.
    pub fn dispatch_event(&self, event: &str, payload: &Value) {
        let subscriber_ids: Vec<i64> = {
            let subscribers = self.subscribers.lock().unwrap();
            subscribers.get(event).cloned().unwrap_or_default()
        };
        if subscriber_ids.is_empty() {
            return;
        }

        let handler = event_to_handler(event);
        let payload = if payload.is_null() { None } else { Some(payload) };

        for plugin_id in subscriber_ids {
            let plugin = {
                let plugins = self.plugins.lock().unwrap();
                plugins.get(&plugin_id).cloned()
            };
            let plugin = match plugin {
                Some(p) => p,
                None => continue,
            };

            match plugin.sandbox.call_handler(&handler, payload) {
                Ok(_) => {
                    if let Err(e) = self.store.reset_plugin_error_count(plugin_id) {
                        log::warn!("Failed to reset error count for plugin {}: {}", plugin_id, e);
                    }
                }
                Err(e) => {
                    log::warn!("Plugin {} handler {} failed: {}", plugin.name, handler, e);
                    self.record_plugin_failure(plugin_id);
                }
            }
        }
    }

    /// Count a failure; three consecutive failures quarantine the plugin.
    fn record_plugin_failure(&self, plugin_id: i64) {
        let count = match self.store.increment_plugin_error_count(plugin_id) {
            Ok(count) => count,
            Err(e) => {
                log::warn!("Failed to count error for plugin {}: {}", plugin_id, e);
                return;
            }
        };

        if count >= MAX_CONSECUTIVE_ERRORS {
            if let Err(e) = self.store.mark_plugin_errored(plugin_id) {
                log::warn!("Failed to mark plugin {} errored: {}", plugin_id, e);
            }
            self.unload_plugin(plugin_id);
            log::warn!(
                "Plugin {} disabled after {} consecutive errors",
                plugin_id,
                count
            );
        }
    }

    /// Install a plugin from a source file: parse (without executing), copy
    /// into the plugins directory, upsert the registry row, load.
    pub fn import_plugin(&self, source_path: &Path) -> Result<PluginInfo> {
        let source = std::fs::read_to_string(source_path)?;
        let manifest = parse_manifest(&source)?;

        let filename = source_path
            .file_name()
            .ok_or_else(|| MahPastesError::Validation("invalid plugin path".into()))?
            .to_string_lossy()
            .into_owned();

        let dest_path = self.plugins_dir.join(&filename);
        std::fs::write(&dest_path, &source)?;

        let plugin_id = self
            .store
            .upsert_plugin(&filename, &manifest.name, &manifest.version)?;

        // Replace any previously loaded copy
        self.unload_plugin(plugin_id);
        self.load_plugin(plugin_id, &filename, true)?;

        Ok(PluginInfo {
            id: plugin_id,
            name: manifest.name,
            version: manifest.version,
            description: manifest.description,
            author: manifest.author,
            enabled: true,
            status: "enabled".to_string(),
            events: manifest.events,
            settings: manifest.settings,
        })
    }

    pub fn enable_plugin(&self, plugin_id: i64) -> Result<()> {
        if self.plugins.lock().unwrap().contains_key(&plugin_id) {
            return Ok(()); // already loaded
        }

        self.store.set_plugin_enabled(plugin_id, true)?;
        let row = self
            .store
            .get_plugin(plugin_id)?
            .ok_or_else(|| MahPastesError::NotFound(format!("plugin {}", plugin_id)))?;
        self.load_plugin(plugin_id, &row.filename, true)
    }

    pub fn disable_plugin(&self, plugin_id: i64) -> Result<()> {
        self.unload_plugin(plugin_id);
        self.store.set_plugin_enabled(plugin_id, false)
    }

    /// Remove a plugin completely: memory, registry row (cascading to
    /// permissions and storage), and the source file.
    pub fn remove_plugin(&self, plugin_id: i64) -> Result<()> {
        let filename = {
            let plugins = self.plugins.lock().unwrap();
            plugins.get(&plugin_id).map(|p| p.filename.clone())
        };
        let filename = match filename {
            Some(f) => Some(f),
            None => self.store.get_plugin(plugin_id)?.map(|row| row.filename),
        };

        self.unload_plugin(plugin_id);
        self.store.delete_plugin(plugin_id)?;

        if let Some(filename) = filename {
            let path = self.plugins_dir.join(filename);
            if let Err(e) = std::fs::remove_file(&path) {
                log::warn!("Failed to remove plugin file {}: {}", path.display(), e);
            }
        }
        Ok(())
    }

    /// Registry rows merged with manifest details for loaded plugins.
    pub fn plugin_infos(&self) -> Result<Vec<PluginInfo>> {
        let loaded = self.plugins.lock().unwrap();
        let mut infos = Vec::new();
        for row in self.store.list_plugins()? {
            let mut info = PluginInfo {
                id: row.id,
                name: row.name,
                version: row.version,
                description: String::new(),
                author: String::new(),
                enabled: row.enabled,
                status: row.status,
                events: Vec::new(),
                settings: Vec::new(),
            };
            if let Some(plugin) = loaded.get(&row.id) {
                info.description = plugin.manifest.description.clone();
                info.author = plugin.manifest.author.clone();
                info.events = plugin.manifest.events.clone();
                info.settings = plugin.manifest.settings.clone();
            }
            infos.push(info);
        }
        Ok(infos)
    }

    /// UI actions declared by enabled plugins, aggregated for the shell.
    pub fn ui_actions(&self) -> UiActionsResponse {
        let plugins = self.plugins.lock().unwrap();
        let mut response = UiActionsResponse::default();

        for plugin in plugins.values() {
            if !plugin.enabled {
                continue;
            }
            let ui = match &plugin.manifest.ui {
                Some(ui) => ui,
                None => continue,
            };
            for button in &ui.lightbox_buttons {
                response.lightbox_buttons.push(PluginUiAction {
                    plugin_id: plugin.id,
                    plugin_name: plugin.name.clone(),
                    id: button.id.clone(),
                    label: button.label.clone(),
                    icon: button.icon.clone(),
                    options: button.options.clone(),
                });
            }
            for action in &ui.card_actions {
                response.card_actions.push(PluginUiAction {
                    plugin_id: plugin.id,
                    plugin_name: plugin.name.clone(),
                    id: action.id.clone(),
                    label: action.label.clone(),
                    icon: action.icon.clone(),
                    options: action.options.clone(),
                });
            }
        }
        response
    }

    /// Invoke a plugin's on_ui_action handler under the normal sandbox
    /// contract.
    pub fn execute_ui_action(
        &self,
        plugin_id: i64,
        action_id: &str,
        clip_ids: &[i64],
        options: &serde_json::Map<String, Value>,
    ) -> Result<ActionResult> {
        let plugin = {
            let plugins = self.plugins.lock().unwrap();
            plugins.get(&plugin_id).cloned()
        }
        .ok_or_else(|| MahPastesError::NotFound(format!("plugin {}", plugin_id)))?;

        if !plugin.enabled {
            return Err(MahPastesError::Validation(format!(
                "plugin is disabled: {}",
                plugin.name
            )));
        }

        let raw = plugin
            .sandbox
            .call_ui_action(action_id, clip_ids, options)
            .map_err(|e| MahPastesError::Plugin(format!("plugin action failed: {}", e)))?;

        let mut result = ActionResult {
            success: true,
            error: None,
            result_clip_id: None,
        };
        if let Some(Value::Bool(success)) = raw.get("success") {
            result.success = *success;
        }
        if let Some(Value::String(error)) = raw.get("error") {
            result.error = Some(error.clone());
        }
        if let Some(Value::Number(id)) = raw.get("result_clip_id") {
            result.result_clip_id = id.as_i64();
        }
        Ok(result)
    }

    /// Drop every plugin without notifying them. Used around restores.
    pub fn unload_all(&self) {
        self.scheduler.stop_all();
        self.plugins.lock().unwrap().clear();
        self.subscribers.lock().unwrap().clear();
    }

    /// Shutdown sequence: final app:shutdown dispatch, stop schedules, drop
    /// all sandboxes and subscriptions.
    pub fn shutdown(&self) {
        self.dispatch_event("app:shutdown", &Value::Null);
        self.unload_all();
    }

    #[cfg(test)]
    pub(crate) fn loaded_plugin_ids(&self) -> Vec<i64> {
        self.plugins.lock().unwrap().keys().copied().collect()
    }

    #[cfg(test)]
    pub(crate) fn scheduler_task_count(&self) -> usize {
        self.scheduler.task_count()
    }
}

impl EventSink for PluginManager {
    fn deliver(&self, event: &BusEvent) {
        self.dispatch_event(&event.name, &event.payload);
    }
}

/// Derive a handler name from an event name: the app: prefix is stripped
/// ("app:startup" -> "on_startup"), everything else maps ':' to '_' under an
/// on_ prefix ("clip:created" -> "on_clip_created").
pub(crate) fn event_to_handler(event: &str) -> String {
    if let Some(rest) = event.strip_prefix("app:") {
        return format!("on_{}", rest);
    }
    format!("on_{}", event.replace(':', "_"))
}
