// File system watcher pipeline
// Observes watched folders, debounces bursts, filters, and ingests matching
// files into the content store. The source file is deleted only after the
// store has committed and returned a clip id.


use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc::channel;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use notify::{Config as NotifyConfig, RecommendedWatcher, RecursiveMode, Watcher};
use regex::Regex;
use serde_json::json;

use crate::constants::{mime_type_for_extension, preset_extensions, WATCH_DEBOUNCE_MS};
use crate::db::schema::WatchedFolder;
use crate::db::store::Store;
use crate::error::{MahPastesError, Result};
use crate::events::EventBus;

struct WatcherState {
    running: bool,
    watcher: Option<RecommendedWatcher>,
    /// folder id -> watched path
    active: HashMap<i64, PathBuf>,
    /// folder id -> cached config, refreshed together with the active set
    folder_cache: HashMap<i64, WatchedFolder>,
    /// path -> generation stamp; a debounce timer only fires if its stamp is
    /// still current when it wakes
    debounce: HashMap<PathBuf, u64>,
    next_generation: u64,
}

pub struct WatcherManager {
    store: Arc<Store>,
    bus: Arc<EventBus>,
    state: Mutex<WatcherState>,
}

impl WatcherManager {
    pub fn new(store: Arc<Store>, bus: Arc<EventBus>) -> Arc<WatcherManager> {
        Arc::new(WatcherManager {
            store,
            bus,
            state: Mutex::new(WatcherState {
                running: false,
                watcher: None,
                active: HashMap::new(),
                folder_cache: HashMap::new(),
                debounce: HashMap::new(),
                next_generation: 0,
            }),
        })
    }

    /// Begin watching all non-paused folders. Idempotent.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            if state.running {
                return Ok(());
            }

            let (tx, rx) = channel::<notify::Result<notify::Event>>();
            let watcher = RecommendedWatcher::new(
                move |res| {
                    let _ = tx.send(res);
                },
                NotifyConfig::default(),
            )
            .map_err(|e| MahPastesError::Watcher(e.to_string()))?;

            state.watcher = Some(watcher);
            state.running = true;
            // Discard any bookkeeping from refreshes made before start
            state.active.clear();
            state.folder_cache.clear();

            let manager = Arc::clone(self);
            std::thread::Builder::new()
                .name("watch-events".into())
                .spawn(move || {
                    for res in rx {
                        match res {
                            Ok(event) => manager.handle_event(event),
                            Err(e) => log::warn!("Watcher error: {}", e),
                        }
                    }
                })
                .expect("failed to spawn watcher event thread");
        }

        self.refresh()
    }

    /// Stop watching: cancel pending debounce timers, close the OS watcher.
    pub fn stop(&self) {
        let mut state = self.state.lock().unwrap();
        state.running = false;
        state.debounce.clear();
        state.watcher = None; // dropping closes the OS watcher and ends the event thread
        state.active.clear();
        state.folder_cache.clear();
    }

    /// Re-read the folder table and diff the active watch set against it.
    pub fn refresh(&self) -> Result<()> {
        let global_paused = self.store.global_watch_paused();
        let folders = self.store.list_watched_folders()?;

        let mut state = self.state.lock().unwrap();

        let mut should_watch: HashMap<i64, PathBuf> = HashMap::new();
        for folder in &folders {
            if !global_paused && !folder.is_paused && folder.exists {
                should_watch.insert(folder.id, PathBuf::from(&folder.path));
            }
        }

        // Remove watches that should no longer be active
        let stale: Vec<(i64, PathBuf)> = state
            .active
            .iter()
            .filter(|(id, _)| !should_watch.contains_key(id))
            .map(|(id, path)| (*id, path.clone()))
            .collect();
        for (id, path) in stale {
            if let Some(watcher) = state.watcher.as_mut() {
                if let Err(e) = watcher.unwatch(&path) {
                    log::warn!("Failed to unwatch {}: {}", path.display(), e);
                }
            }
            state.active.remove(&id);
            log::info!("Stopped watching: {}", path.display());
        }

        // Add watches for new folders
        for (id, path) in &should_watch {
            if state.active.contains_key(id) {
                continue;
            }
            if let Some(watcher) = state.watcher.as_mut() {
                if let Err(e) = watcher.watch(path, RecursiveMode::NonRecursive) {
                    log::warn!("Failed to watch {}: {}", path.display(), e);
                    continue;
                }
            }
            state.active.insert(*id, path.clone());
            log::info!("Started watching: {}", path.display());
        }

        // Repopulate the config cache with the active set
        let cache: HashMap<i64, WatchedFolder> = folders
            .into_iter()
            .filter(|f| state.active.contains_key(&f.id))
            .map(|f| (f.id, f))
            .collect();
        state.folder_cache = cache;

        Ok(())
    }

    fn handle_event(self: &Arc<Self>, event: notify::Event) {
        use notify::event::{EventKind, ModifyKind};

        // Only creations and content writes matter
        let relevant = match event.kind {
            EventKind::Create(_) => true,
            EventKind::Modify(ModifyKind::Metadata(_)) => false,
            EventKind::Modify(_) => true,
            _ => false,
        };
        if !relevant {
            return;
        }

        for path in event.paths {
            // Skip directories and paths that vanished already
            match std::fs::metadata(&path) {
                Ok(meta) if meta.is_file() => {}
                _ => continue,
            }

            // Skip hidden files
            if path
                .file_name()
                .map(|n| n.to_string_lossy().starts_with('.'))
                .unwrap_or(true)
            {
                continue;
            }

            self.debounce_file(path);
        }
    }

    /// Delay processing until the file has been quiet for the debounce
    /// window. Repeated events on the same path reset the timer.
    fn debounce_file(self: &Arc<Self>, path: PathBuf) {
        let generation = {
            let mut state = self.state.lock().unwrap();
            if !state.running {
                return;
            }
            state.next_generation += 1;
            let generation = state.next_generation;
            state.debounce.insert(path.clone(), generation);
            generation
        };

        let manager = Arc::clone(self);
        std::thread::Builder::new()
            .name("watch-debounce".into())
            .spawn(move || {
                std::thread::sleep(Duration::from_millis(WATCH_DEBOUNCE_MS));
                let fire = {
                    let mut state = manager.state.lock().unwrap();
                    if state.debounce.get(&path) == Some(&generation) {
                        state.debounce.remove(&path);
                        state.running
                    } else {
                        false
                    }
                };
                if fire {
                    manager.process_file(&path);
                }
            })
            .expect("failed to spawn debounce timer thread");
    }

    /// Run a debounced file through filter -> import -> post-import ->
    /// delete-source. The state lock covers only the cache lookup, never I/O.
    pub(crate) fn process_file(&self, path: &Path) {
        let folder = {
            let state = self.state.lock().unwrap();
            let parent = match path.parent() {
                Some(p) => p.to_path_buf(),
                None => return,
            };
            state
                .active
                .iter()
                .find(|(_, watched)| **watched == parent)
                .and_then(|(id, _)| state.folder_cache.get(id))
                .cloned()
        };

        let folder = match folder {
            Some(f) => f,
            None => return,
        };

        if !matches_filter(path, &folder) {
            log::debug!("File does not match filter: {}", path.display());
            return;
        }

        let basename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.bus
            .emit("watch:file_detected", json!({ "file": basename }));

        let clip_id = match self.import_file(path, &folder) {
            Ok(id) => id,
            Err(e) => {
                log::warn!("Failed to import file {}: {}", path.display(), e);
                self.emit_watch_error(path, &e.to_string());
                return;
            }
        };

        // Delete the original only after a confirmed commit
        if clip_id == 0 {
            log::warn!(
                "Import returned no clip ID for {}, not deleting original",
                path.display()
            );
            self.emit_watch_error(path, "import failed to return clip ID");
            return;
        }

        if let Err(e) = std::fs::remove_file(path) {
            log::warn!("Failed to delete original file {}: {}", path.display(), e);
        }

        log::info!(
            "Successfully imported (clip ID {}) and removed: {}",
            clip_id,
            path.display()
        );
    }

    /// Read, store, and post-process one file. Returns the new clip id.
    fn import_file(&self, path: &Path, folder: &WatchedFolder) -> Result<i64> {
        let data = std::fs::read(path)?;

        let ext = lowercase_extension(path);
        let content_type = mime_type_for_extension(&ext);
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let clip_id = self.store.put_clip(content_type, data, Some(&filename), None)?;

        // Post-import actions target the specific clip id returned above
        if folder.auto_archive {
            if let Err(e) = self.store.toggle_archive(clip_id) {
                log::warn!("Auto-archive failed for clip {}: {}", clip_id, e);
            }
        }
        if let Some(tag_id) = folder.auto_tag_id {
            if let Err(e) = self.store.add_tag_to_clip(tag_id, clip_id) {
                log::warn!("Auto-tag failed for clip {}: {}", clip_id, e);
            }
        }

        self.bus
            .emit("watch:import_complete", json!({ "filename": filename }));

        Ok(clip_id)
    }

    /// One-shot import of the files already present in a watched folder.
    /// Non-recursive; per-file failures are logged and skipped.
    pub fn process_existing_files(&self, folder_id: i64) -> Result<()> {
        let folder = self
            .store
            .get_watched_folder(folder_id)?
            .ok_or_else(|| MahPastesError::NotFound(format!("watched folder {}", folder_id)))?;

        let entries = std::fs::read_dir(&folder.path)?;
        for entry in entries {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    log::warn!("Failed to read directory entry: {}", e);
                    continue;
                }
            };

            let path = entry.path();
            if path.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            if !matches_filter(&path, &folder) {
                continue;
            }

            let clip_id = match self.import_file(&path, &folder) {
                Ok(id) => id,
                Err(e) => {
                    log::warn!("Failed to import existing file {}: {}", path.display(), e);
                    self.emit_watch_error(&path, &e.to_string());
                    continue;
                }
            };

            if clip_id == 0 {
                log::warn!("Import returned no clip ID for {}, not deleting", path.display());
                continue;
            }

            if let Err(e) = std::fs::remove_file(&path) {
                log::warn!("Failed to delete file {}: {}", path.display(), e);
            }
        }

        Ok(())
    }

    fn emit_watch_error(&self, path: &Path, message: &str) {
        let basename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.bus
            .emit("watch:error", json!({ "file": basename, "error": message }));
    }

    #[cfg(test)]
    pub(crate) fn pending_debounce_count(&self) -> usize {
        self.state.lock().unwrap().debounce.len()
    }

    #[cfg(test)]
    pub(crate) fn debounce_for_test(self: &Arc<Self>, path: PathBuf) {
        self.debounce_file(path);
    }

    /// Test-only: mark the manager running without opening an OS watcher, so
    /// refresh/debounce bookkeeping can be driven directly.
    #[cfg(test)]
    pub(crate) fn set_running_for_test(&self, running: bool) {
        self.state.lock().unwrap().running = running;
    }

    #[cfg(test)]
    pub(crate) fn active_paths_for_test(&self) -> Vec<PathBuf> {
        self.state.lock().unwrap().active.values().cloned().collect()
    }
}

/// Check a path against the folder's filter settings.
pub(crate) fn matches_filter(path: &Path, folder: &WatchedFolder) -> bool {
    let ext = lowercase_extension(path);

    match folder.filter_mode.as_str() {
        "all" => true,

        "presets" => folder.filter_presets.iter().any(|preset| {
            preset_extensions(preset)
                .map(|exts| exts.contains(&ext.as_str()))
                .unwrap_or(false)
        }),

        "custom" => {
            if folder.filter_regex.is_empty() {
                return true;
            }
            // Compiled on use; a broken pattern fails closed
            let re = match Regex::new(&folder.filter_regex) {
                Ok(re) => re,
                Err(e) => {
                    log::warn!("Invalid regex {}: {}", folder.filter_regex, e);
                    return false;
                }
            };
            let basename = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            re.is_match(&basename)
        }

        _ => true,
    }
}

/// Lowercase file extension including the leading dot, or empty.
fn lowercase_extension(path: &Path) -> String {
    path.extension()
        .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
        .unwrap_or_default()
}
