// Plugin task API
// Lets plugins surface long-running work to the shell as progress events.
// Task ids are unique across all plugins in the process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mlua::Lua;
use serde_json::json;

use crate::events::EventBus;

/// Completed and failed tasks are dropped from memory after this delay.
const TASK_CLEANUP_DELAY_SECS: u64 = 5 * 60;

static GLOBAL_TASK_ID: AtomicI64 = AtomicI64::new(0);

struct PluginTask {
    name: String,
    total: i64,
}

struct TaskApi {
    bus: Arc<EventBus>,
    plugin_id: i64,
    tasks: Mutex<HashMap<i64, PluginTask>>,
}

impl TaskApi {
    fn schedule_cleanup(self: &Arc<Self>, task_id: i64) {
        let api = Arc::clone(self);
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_secs(TASK_CLEANUP_DELAY_SECS));
            api.tasks.lock().unwrap().remove(&task_id);
        });
    }
}

pub fn register(lua: &Lua, bus: Arc<EventBus>, plugin_id: i64) -> mlua::Result<()> {
    let api = Arc::new(TaskApi {
        bus,
        plugin_id,
        tasks: Mutex::new(HashMap::new()),
    });
    let task_mod = lua.create_table()?;

    let start_api = Arc::clone(&api);
    task_mod.set(
        "start",
        lua.create_function(move |_, (name, total): (String, Option<i64>)| {
            let total = total.unwrap_or(1);
            let task_id = GLOBAL_TASK_ID.fetch_add(1, Ordering::SeqCst) + 1;

            start_api.tasks.lock().unwrap().insert(
                task_id,
                PluginTask {
                    name: name.clone(),
                    total,
                },
            );

            start_api.bus.emit(
                "plugin:task:started",
                json!({
                    "task_id": task_id,
                    "plugin_id": start_api.plugin_id,
                    "name": name,
                    "total": total,
                }),
            );
            Ok(task_id)
        })?,
    )?;

    let progress_api = Arc::clone(&api);
    task_mod.set(
        "progress",
        lua.create_function(move |_, (task_id, current): (i64, i64)| {
            let (name, total) = {
                let tasks = progress_api.tasks.lock().unwrap();
                match tasks.get(&task_id) {
                    Some(task) => (task.name.clone(), task.total),
                    None => return Ok((false, Some("task not found".to_string()))),
                }
            };

            progress_api.bus.emit(
                "plugin:task:progress",
                json!({
                    "task_id": task_id,
                    "plugin_id": progress_api.plugin_id,
                    "current": current,
                    "total": total,
                    "name": name,
                }),
            );
            Ok((true, None))
        })?,
    )?;

    let complete_api = Arc::clone(&api);
    task_mod.set(
        "complete",
        lua.create_function(move |_, task_id: i64| {
            let name = {
                let tasks = complete_api.tasks.lock().unwrap();
                match tasks.get(&task_id) {
                    Some(task) => task.name.clone(),
                    None => return Ok((false, Some("task not found".to_string()))),
                }
            };

            complete_api.bus.emit(
                "plugin:task:completed",
                json!({
                    "task_id": task_id,
                    "plugin_id": complete_api.plugin_id,
                    "name": name,
                }),
            );
            complete_api.schedule_cleanup(task_id);
            Ok((true, None))
        })?,
    )?;

    let fail_api = api;
    task_mod.set(
        "fail",
        lua.create_function(move |_, (task_id, error): (i64, Option<String>)| {
            let error = error.unwrap_or_else(|| "Unknown error".to_string());
            let name = {
                let tasks = fail_api.tasks.lock().unwrap();
                match tasks.get(&task_id) {
                    Some(task) => task.name.clone(),
                    None => return Ok((false, Some("task not found".to_string()))),
                }
            };

            fail_api.bus.emit(
                "plugin:task:failed",
                json!({
                    "task_id": task_id,
                    "plugin_id": fail_api.plugin_id,
                    "name": name,
                    "error": error,
                }),
            );
            fail_api.schedule_cleanup(task_id);
            Ok((true, None))
        })?,
    )?;

    lua.globals().set("task", task_mod)?;
    Ok(())
}
