// mahpastes CLI binary
// Headless embedding of the library: runs the full app (watcher, plugins,
// sweeper) or performs one-shot store operations.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};

use mahpastes::db::schema::WatchedFolderConfig;
use mahpastes::db::store::{FileUpload, Store};
use mahpastes::db::{get_data_dir, get_db_path, get_plugins_dir, open_db};
use mahpastes::events::EventBus;
use mahpastes::plugin::PluginManager;
use mahpastes::tasks::transform::available_models;
use mahpastes::watcher::WatcherManager;
use mahpastes::App;

#[derive(Parser)]
#[command(name = "mahpastes")]
#[command(about = "mahpastes - local-first clipboard and asset manager", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the app headless: watcher, plugins, sweeper
    Run,

    /// Show watcher status
    Status,

    /// List clips
    List {
        /// Show archived clips instead of active ones
        #[arg(long)]
        archived: bool,
    },

    /// Upload files as clips
    Upload {
        /// Files to upload
        files: Vec<PathBuf>,
        /// Expire the clips after this many minutes
        #[arg(long, default_value = "0")]
        expires_minutes: i64,
    },

    /// Manage watched folders
    Watch {
        #[command(subcommand)]
        command: WatchCommands,
    },

    /// Manage tags
    Tag {
        #[command(subcommand)]
        command: TagCommands,
    },

    /// Manage plugins
    Plugin {
        #[command(subcommand)]
        command: PluginCommands,
    },

    /// List available image-transform models
    Models,

    /// Create a backup ZIP
    Backup {
        /// Destination path
        dest: PathBuf,
    },

    /// Restore from a backup ZIP
    Restore {
        /// Backup path
        path: PathBuf,
    },
}

#[derive(Subcommand)]
enum WatchCommands {
    /// Watch a folder
    Add {
        path: PathBuf,
        /// Filter mode: all, presets, custom
        #[arg(long, default_value = "all")]
        mode: String,
        /// Preset names (images, documents, videos)
        #[arg(long)]
        presets: Vec<String>,
        /// Regex for custom mode
        #[arg(long, default_value = "")]
        regex: String,
        /// Archive imports immediately
        #[arg(long)]
        auto_archive: bool,
        /// Import files already in the folder
        #[arg(long)]
        process_existing: bool,
    },
    /// List watched folders
    List,
    /// Pause a folder
    Pause { id: i64 },
    /// Resume a folder
    Resume { id: i64 },
    /// Stop watching a folder
    Remove { id: i64 },
}

#[derive(Subcommand)]
enum TagCommands {
    /// List tags
    List,
    /// Create a tag
    Create { name: String },
}

#[derive(Subcommand)]
enum PluginCommands {
    /// List installed plugins
    List,
    /// Install a plugin from a .lua file
    Install { path: PathBuf },
    /// Enable a plugin
    Enable { id: i64 },
    /// Disable a plugin
    Disable { id: i64 },
    /// Remove a plugin
    Remove { id: i64 },
    /// List filesystem paths granted to a plugin
    Permissions { id: i64 },
    /// Revoke a granted filesystem path
    Revoke {
        id: i64,
        /// Permission type: fs_read or fs_write
        perm_type: String,
        /// Granted path to revoke
        path: String,
    },
}

/// Open the store without starting the watcher/plugin/sweeper threads.
fn open_store() -> Result<Arc<Store>> {
    let data_dir = get_data_dir()?;
    let conn = open_db(&get_db_path(&data_dir))?;
    let bus = Arc::new(EventBus::new());
    Ok(Store::new(conn, bus))
}

fn open_plugin_manager(store: &Arc<Store>) -> Result<Arc<PluginManager>> {
    let data_dir = get_data_dir()?;
    let manager = PluginManager::new(
        Arc::clone(store),
        Arc::clone(store.bus()),
        get_plugins_dir(&data_dir),
    )?;
    Ok(manager)
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run => cmd_run(),
        Commands::Status => cmd_status(),
        Commands::List { archived } => cmd_list(archived),
        Commands::Upload {
            files,
            expires_minutes,
        } => cmd_upload(files, expires_minutes),
        Commands::Watch { command } => cmd_watch(command),
        Commands::Tag { command } => cmd_tag(command),
        Commands::Plugin { command } => cmd_plugin(command),
        Commands::Models => cmd_models(),
        Commands::Backup { dest } => cmd_backup(dest),
        Commands::Restore { path } => cmd_restore(path),
    }
}

fn cmd_run() -> Result<()> {
    let app = App::start()?;
    println!("mahpastes running (data dir: {})", app.data_dir.display());
    println!("Press Ctrl-C to stop.");
    loop {
        std::thread::park();
    }
}

fn cmd_status() -> Result<()> {
    let store = open_store()?;
    let status = store.watch_status()?;
    println!(
        "watching: {} ({} of {} folders active{})",
        status.is_watching,
        status.active_count,
        status.total_count,
        if status.global_paused { ", globally paused" } else { "" }
    );
    Ok(())
}

fn cmd_list(archived: bool) -> Result<()> {
    let store = open_store()?;
    let clips = store.list_clips(archived, &[])?;
    if clips.is_empty() {
        println!("No clips.");
        return Ok(());
    }
    for clip in clips {
        let tags: Vec<&str> = clip.tags.iter().map(|t| t.name.as_str()).collect();
        println!(
            "{:>6}  {:<28} {:<20} {}  {}",
            clip.id,
            clip.content_type,
            clip.filename,
            clip.created_at,
            tags.join(",")
        );
    }
    Ok(())
}

fn cmd_upload(files: Vec<PathBuf>, expires_minutes: i64) -> Result<()> {
    let store = open_store()?;
    let mut uploads = Vec::new();
    for path in files {
        let data = std::fs::read(&path)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let ext = path
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
            .unwrap_or_default();
        uploads.push(FileUpload {
            name,
            content_type: mahpastes::constants::mime_type_for_extension(&ext).to_string(),
            data,
        });
    }

    let ids = store
        .upload_files(uploads, expires_minutes)?;
    println!("Uploaded {} clip(s): {:?}", ids.len(), ids);
    Ok(())
}

fn cmd_watch(command: WatchCommands) -> Result<()> {
    let store = open_store()?;
    match command {
        WatchCommands::Add {
            path,
            mode,
            presets,
            regex,
            auto_archive,
            process_existing,
        } => {
            let folder = store
                .add_watched_folder(WatchedFolderConfig {
                    path: path.to_string_lossy().into_owned(),
                    filter_mode: mode,
                    filter_presets: presets,
                    filter_regex: regex,
                    process_existing,
                    auto_archive,
                    auto_tag_id: None,
                })?;
            println!("Watching folder {} (id {})", folder.path, folder.id);

            // The existing-files pass runs right after add, like a watcher
            // event for each file already in the folder
            if folder.process_existing {
                let watcher = WatcherManager::new(Arc::clone(&store), Arc::clone(store.bus()));
                watcher.process_existing_files(folder.id)?;
                println!("Imported existing files from {}", folder.path);
            }
        }
        WatchCommands::List => {
            for folder in store.list_watched_folders()? {
                println!(
                    "{:>4}  {:<40} mode={} paused={} exists={}",
                    folder.id, folder.path, folder.filter_mode, folder.is_paused, folder.exists
                );
            }
        }
        WatchCommands::Pause { id } => {
            store.set_folder_paused(id, true)?;
            println!("Paused folder {}", id);
        }
        WatchCommands::Resume { id } => {
            store.set_folder_paused(id, false)?;
            println!("Resumed folder {}", id);
        }
        WatchCommands::Remove { id } => {
            store.remove_watched_folder(id)?;
            println!("Removed folder {}", id);
        }
    }
    Ok(())
}

fn cmd_tag(command: TagCommands) -> Result<()> {
    let store = open_store()?;
    match command {
        TagCommands::List => {
            for tag in store.list_tags()? {
                println!("{:>4}  {:<24} {}  ({} clips)", tag.id, tag.name, tag.color, tag.count);
            }
        }
        TagCommands::Create { name } => {
            let tag = store.create_tag(&name)?;
            println!("Created tag {} (id {}, color {})", tag.name, tag.id, tag.color);
        }
    }
    Ok(())
}

fn cmd_plugin(command: PluginCommands) -> Result<()> {
    let store = open_store()?;
    let manager = open_plugin_manager(&store)?;
    match command {
        PluginCommands::List => {
            for info in manager.plugin_infos()? {
                println!(
                    "{:>4}  {:<24} v{:<10} {} ({})",
                    info.id, info.name, info.version, info.status,
                    if info.enabled { "enabled" } else { "disabled" }
                );
            }
        }
        PluginCommands::Install { path } => {
            let info = manager.import_plugin(&path)?;
            println!("Installed plugin {} v{} (id {})", info.name, info.version, info.id);
        }
        PluginCommands::Enable { id } => {
            manager.enable_plugin(id)?;
            println!("Enabled plugin {}", id);
        }
        PluginCommands::Disable { id } => {
            manager.disable_plugin(id)?;
            println!("Disabled plugin {}", id);
        }
        PluginCommands::Remove { id } => {
            manager.remove_plugin(id)?;
            println!("Removed plugin {}", id);
        }
        PluginCommands::Permissions { id } => {
            let perms = store.list_plugin_permissions(id)?;
            if perms.is_empty() {
                println!("No permissions granted.");
            }
            for perm in perms {
                println!(
                    "{:<9} {:<48} granted {}{}",
                    perm.permission_type,
                    perm.path,
                    perm.granted_at,
                    if perm.pending_reconfirm { " (pending re-approval)" } else { "" }
                );
            }
        }
        PluginCommands::Revoke { id, perm_type, path } => {
            store.revoke_plugin_permission(id, &perm_type, &path)?;
            println!("Revoked {} on {} for plugin {}", perm_type, path, id);
        }
    }
    Ok(())
}

fn cmd_models() -> Result<()> {
    for (task, models) in available_models() {
        println!("{}:", task);
        for model in models {
            println!("  {:<40} {} - {}", model.id, model.name, model.description);
        }
    }
    Ok(())
}

fn cmd_backup(dest: PathBuf) -> Result<()> {
    let store = open_store()?;
    let data_dir = get_data_dir()?;
    let manifest = mahpastes::backup::create_backup(&store, &get_plugins_dir(&data_dir), &dest)?;
    println!(
        "Backup written to {} ({} clips, {} tags, {} plugins, {} watch folders)",
        dest.display(),
        manifest.summary.clips,
        manifest.summary.tags,
        manifest.summary.plugins,
        manifest.summary.watch_folders
    );
    if !manifest.excluded.is_empty() {
        println!("Excluded sensitive settings: {}", manifest.excluded.join(", "));
    }
    Ok(())
}

fn cmd_restore(path: PathBuf) -> Result<()> {
    let store = open_store()?;
    let data_dir = get_data_dir()?;
    let manifest = mahpastes::backup::restore_backup(&store, &get_plugins_dir(&data_dir), &path)?;
    println!(
        "Restored backup from {} (created {}, app v{})",
        path.display(),
        manifest.created_at,
        manifest.app_version
    );
    Ok(())
}
