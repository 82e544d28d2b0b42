// Plugin scheduler
// Runs manifest-declared periodic handlers, one thread per (plugin, task).
// Handler errors and panics are logged; they never kill the tick thread.

use std::collections::HashMap;
use std::sync::mpsc::{channel, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::plugin::sandbox::Sandbox;

struct ScheduledTask {
    stop_tx: Sender<()>,
    _handle: JoinHandle<()>,
}

impl ScheduledTask {
    /// Signal the tick thread to exit. Idempotent, and deliberately not a
    /// join: a tick mid-handler winds down on its own without blocking the
    /// caller.
    fn stop(self) {
        let _ = self.stop_tx.send(());
    }
}

pub struct Scheduler {
    /// key: "pluginID:taskName"
    tasks: Mutex<HashMap<String, ScheduledTask>>,
}

impl Scheduler {
    pub fn new() -> Scheduler {
        Scheduler {
            tasks: Mutex::new(HashMap::new()),
        }
    }

    pub fn add_task(
        &self,
        plugin_id: i64,
        task_name: &str,
        interval_secs: u64,
        sandbox: Arc<Sandbox>,
    ) {
        let key = task_key(plugin_id, task_name);
        let (stop_tx, stop_rx) = channel();

        let name = task_name.to_string();
        let handle = std::thread::Builder::new()
            .name(format!("plugin-schedule-{}", key))
            .spawn(move || loop {
                match stop_rx.recv_timeout(Duration::from_secs(interval_secs)) {
                    Err(RecvTimeoutError::Timeout) => {
                        // A panicking handler must not take the tick thread down
                        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                            sandbox.call_handler(&name, None)
                        }));
                        match result {
                            Ok(Ok(_)) => {}
                            Ok(Err(e)) => log::warn!("Scheduled task {} failed: {}", name, e),
                            Err(_) => log::error!("Scheduled task {} panicked (recovered)", name),
                        }
                    }
                    _ => return,
                }
            })
            .expect("failed to spawn scheduler thread");

        let task = ScheduledTask {
            stop_tx,
            _handle: handle,
        };

        let mut tasks = self.tasks.lock().unwrap();
        if let Some(existing) = tasks.insert(key, task) {
            existing.stop();
        }
    }

    pub fn remove_plugin_tasks(&self, plugin_id: i64) {
        let prefix = format!("{}:", plugin_id);
        let removed: Vec<ScheduledTask> = {
            let mut tasks = self.tasks.lock().unwrap();
            let keys: Vec<String> = tasks
                .keys()
                .filter(|k| k.starts_with(&prefix))
                .cloned()
                .collect();
            keys.into_iter().filter_map(|k| tasks.remove(&k)).collect()
        };
        for task in removed {
            task.stop();
        }
    }

    pub fn stop_all(&self) {
        let removed: Vec<ScheduledTask> = {
            let mut tasks = self.tasks.lock().unwrap();
            tasks.drain().map(|(_, task)| task).collect()
        };
        for task in removed {
            task.stop();
        }
    }

    #[cfg(test)]
    pub(crate) fn task_count(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

fn task_key(plugin_id: i64, task_name: &str) -> String {
    format!("{}:{}", plugin_id, task_name)
}
