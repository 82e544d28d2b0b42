// mahpastes library entry point
// Local-first clipboard/asset manager: a single SQLite content store, an
// in-process event bus, a filesystem watcher pipeline, a sandboxed Lua
// plugin host, a cancellable background task manager, an expiry sweeper,
// and portable backups.

pub mod backup;
pub mod constants;
pub mod db;
pub mod error;
pub mod events;
pub mod plugin;
pub mod tasks;
pub mod watcher;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use serde_json::Value;

use backup::BackupManifest;
use db::store::{spawn_expiry_sweeper, Store, SweeperHandle};
use events::{EventBus, EventSink};
use plugin::PluginManager;
use tasks::transform::FalClient;
use tasks::TaskManager;
use watcher::WatcherManager;

pub use error::{MahPastesError, Result};

/// The application context: owns the store, the bus and every subsystem.
/// Created once at startup and passed around explicitly; there are no
/// hidden singletons.
pub struct App {
    pub data_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub store: Arc<Store>,
    pub bus: Arc<EventBus>,
    pub watcher: Arc<WatcherManager>,
    pub plugins: Arc<PluginManager>,
    pub tasks: Arc<TaskManager>,
    sweeper: Option<SweeperHandle>,
}

impl App {
    /// Open the store, start the sweeper, the watcher and the plugin host,
    /// and emit app:startup. A failing watcher or plugin load is logged but
    /// does not abort startup; a failing store open does.
    pub fn start() -> Result<App> {
        let data_dir = db::get_data_dir()?;
        let conn = db::open_db(&db::get_db_path(&data_dir))?;

        let bus = Arc::new(EventBus::new());
        let store = Store::new(conn, Arc::clone(&bus));

        let temp_dir = db::get_temp_files_dir(&data_dir);
        std::fs::create_dir_all(&temp_dir)?;
        log::info!("Temporary files will be stored in {}", temp_dir.display());

        let sweeper = spawn_expiry_sweeper(Arc::clone(&store));

        let watcher = WatcherManager::new(Arc::clone(&store), Arc::clone(&bus));
        if let Err(e) = watcher.start() {
            log::warn!("Failed to start watcher: {}", e);
        }

        let plugins_dir = db::get_plugins_dir(&data_dir);
        let plugins = PluginManager::new(Arc::clone(&store), Arc::clone(&bus), plugins_dir)?;
        if let Err(e) = plugins.load_plugins() {
            log::warn!("Failed to load plugins: {}", e);
        }
        let sink: Weak<dyn EventSink> = Arc::downgrade(&(Arc::clone(&plugins) as Arc<dyn EventSink>));
        bus.register_sink(sink);

        let transform = FalClient::new(Arc::clone(&store)).map_err(MahPastesError::Http)?;
        let tasks = TaskManager::new(Arc::clone(&store), Arc::clone(&bus), Arc::new(transform));

        bus.emit("app:startup", Value::Null);

        Ok(App {
            data_dir,
            temp_dir,
            store,
            bus,
            watcher,
            plugins,
            tasks,
            sweeper: Some(sweeper),
        })
    }

    /// Orderly shutdown: plugins get app:shutdown, the watcher and sweeper
    /// stop, transient exports are wiped, the bus drains.
    pub fn shutdown(mut self) {
        self.plugins.shutdown();
        self.watcher.stop();
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.stop();
        }
        if let Err(e) = self.delete_all_temp_files() {
            log::warn!("Failed to clean temp files: {}", e);
        }
        self.bus.shutdown();
    }

    /// Materialize a clip into the transient export directory.
    pub fn create_temp_file(&self, clip_id: i64) -> Result<PathBuf> {
        self.store.create_temp_file(&self.temp_dir, clip_id)
    }

    pub fn delete_all_temp_files(&self) -> Result<()> {
        if self.temp_dir.as_os_str().is_empty() {
            return Ok(());
        }
        if self.temp_dir.exists() {
            std::fs::remove_dir_all(&self.temp_dir)?;
        }
        std::fs::create_dir_all(&self.temp_dir)?;
        Ok(())
    }

    pub fn create_backup(&self, dest: &Path) -> Result<BackupManifest> {
        backup::create_backup(&self.store, self.plugins.plugins_dir(), dest)
    }

    /// Restore a backup and bring the runtime back in sync: plugins are
    /// reloaded from the restored registry and the watcher re-reads its
    /// folder table.
    pub fn restore_backup(&self, backup_path: &Path) -> Result<BackupManifest> {
        self.plugins.unload_all();
        let manifest = backup::restore_backup(&self.store, self.plugins.plugins_dir(), backup_path)?;
        if let Err(e) = self.plugins.load_plugins() {
            log::warn!("Failed to reload plugins after restore: {}", e);
        }
        self.watcher.refresh()?;
        Ok(manifest)
    }
}
