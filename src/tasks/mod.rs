// Background task manager
// Tracked, cancellable, progress-reporting jobs running remote image
// transforms per clip. Items are processed strictly in submission order;
// result append, progress increment, and the progress read for the emitted
// event all happen under the task mutex.

pub mod transform;

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::constants::FAL_API_KEY_SETTING;
use crate::db::schema::now_timestamp;
use crate::db::store::Store;
use crate::error::{MahPastesError, Result};
use crate::events::EventBus;
use self::transform::{ImageTransform, TransformError, TransformKind, TransformOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Cancelled | TaskStatus::Failed
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clip_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub original_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiTask {
    pub id: String,
    pub task_name: String,
    pub status: TaskStatus,
    pub clip_ids: Vec<i64>,
    pub options: TransformOptions,
    pub progress: usize,
    pub total: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<ItemResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: String,
}

pub struct TaskManager {
    store: Arc<Store>,
    bus: Arc<EventBus>,
    transform: Arc<dyn ImageTransform>,
    tasks: Mutex<HashMap<String, Arc<Mutex<AiTask>>>>,
    cancel_flags: Mutex<HashMap<String, Arc<AtomicBool>>>,
    next_id: AtomicU64,
}

impl TaskManager {
    pub fn new(
        store: Arc<Store>,
        bus: Arc<EventBus>,
        transform: Arc<dyn ImageTransform>,
    ) -> Arc<TaskManager> {
        Arc::new(TaskManager {
            store,
            bus,
            transform,
            tasks: Mutex::new(HashMap::new()),
            cancel_flags: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        })
    }

    /// Start a background task over the given clips. The remote-transform
    /// credential is validated before this returns.
    pub fn start_task(
        self: &Arc<Self>,
        clip_ids: Vec<i64>,
        options: TransformOptions,
        task_name: &str,
    ) -> Result<String> {
        let api_key = self.store.get_setting(FAL_API_KEY_SETTING)?.unwrap_or_default();
        if api_key.is_empty() {
            return Err(MahPastesError::Validation(
                "fal.ai API key not configured".into(),
            ));
        }

        let task_id = format!("task_{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let total = clip_ids.len();
        let task = Arc::new(Mutex::new(AiTask {
            id: task_id.clone(),
            task_name: task_name.to_string(),
            status: TaskStatus::Pending,
            clip_ids,
            options,
            progress: 0,
            total,
            results: Vec::new(),
            error: None,
            created_at: now_timestamp(),
        }));
        let cancel = Arc::new(AtomicBool::new(false));

        self.tasks
            .lock()
            .unwrap()
            .insert(task_id.clone(), Arc::clone(&task));
        self.cancel_flags
            .lock()
            .unwrap()
            .insert(task_id.clone(), Arc::clone(&cancel));

        let manager = Arc::clone(self);
        std::thread::Builder::new()
            .name(format!("ai-{}", task_id))
            .spawn(move || manager.run_task(task, cancel))
            .expect("failed to spawn task executor thread");

        Ok(task_id)
    }

    fn run_task(&self, task: Arc<Mutex<AiTask>>, cancel: Arc<AtomicBool>) {
        let (clip_ids, options) = {
            let mut guard = task.lock().unwrap();
            guard.status = TaskStatus::Running;
            (guard.clip_ids.clone(), guard.options.clone())
        };
        self.emit_task_snapshot("task:started", &task);

        for (index, clip_id) in clip_ids.iter().enumerate() {
            if cancel.load(Ordering::Relaxed) {
                self.finish_cancelled(&task);
                return;
            }

            let item = match self.process_item(&cancel, *clip_id, &options) {
                Ok(item) => item,
                Err(TransformError::Cancelled) => {
                    // Token fired mid-item: nothing is appended
                    self.finish_cancelled(&task);
                    return;
                }
                Err(TransformError::Failed(msg)) => ItemResult {
                    success: false,
                    clip_id: None,
                    error: Some(msg),
                    original_id: *clip_id,
                },
            };

            // Append, increment, and read progress under one lock
            let (task_id, progress, total) = {
                let mut guard = task.lock().unwrap();
                guard.results.push(item);
                guard.progress = index + 1;
                (guard.id.clone(), guard.progress, guard.total)
            };
            self.bus.emit(
                "task:progress",
                json!({ "taskId": task_id, "progress": progress, "total": total }),
            );
        }

        // Terminal classification under the lock
        {
            let mut guard = task.lock().unwrap();
            let failed = guard.results.iter().filter(|r| !r.success).count();
            if failed == guard.results.len() && failed > 0 {
                guard.status = TaskStatus::Failed;
                guard.error = Some(format!("All {} images failed to process", failed));
            } else if failed > 0 {
                guard.status = TaskStatus::Failed;
                guard.error = Some(format!("{} of {} images failed", failed, guard.results.len()));
            } else {
                guard.status = TaskStatus::Completed;
            }
        }

        // The completed event always carries the task; consumers read status
        // from the payload, not from the event name
        self.emit_task_snapshot("task:completed", &task);
    }

    /// Run one clip through the remote transform and save the output.
    fn process_item(
        &self,
        cancel: &Arc<AtomicBool>,
        clip_id: i64,
        options: &TransformOptions,
    ) -> std::result::Result<ItemResult, TransformError> {
        let row = match self.store.get_clip_raw(clip_id) {
            Ok(row) => row,
            Err(e) => {
                return Ok(ItemResult {
                    success: false,
                    clip_id: None,
                    error: Some(format!("failed to get clip: {}", e)),
                    original_id: clip_id,
                });
            }
        };

        if !row.content_type.starts_with("image/") {
            return Ok(ItemResult {
                success: false,
                clip_id: None,
                error: Some("clip is not an image".into()),
                original_id: clip_id,
            });
        }

        let data_uri = format!(
            "data:{};base64,{}",
            row.content_type,
            BASE64.encode(&row.data)
        );

        let image = match self.transform.transform(cancel, &data_uri, options) {
            Ok(image) => image,
            Err(TransformError::Cancelled) => return Err(TransformError::Cancelled),
            Err(TransformError::Failed(msg)) => {
                return Ok(ItemResult {
                    success: false,
                    clip_id: None,
                    error: Some(msg),
                    original_id: clip_id,
                });
            }
        };

        let filename = generate_processed_filename(
            row.filename.as_deref().unwrap_or_default(),
            clip_id,
            options.task,
        );
        match self
            .store
            .insert_clip(&image.content_type, image.data, Some(&filename), None)
        {
            Ok(new_clip_id) => Ok(ItemResult {
                success: true,
                clip_id: Some(new_clip_id),
                error: None,
                original_id: clip_id,
            }),
            Err(e) => Ok(ItemResult {
                success: false,
                clip_id: None,
                error: Some(format!("failed to save result: {}", e)),
                original_id: clip_id,
            }),
        }
    }

    fn finish_cancelled(&self, task: &Arc<Mutex<AiTask>>) {
        let task_id = {
            let mut guard = task.lock().unwrap();
            guard.status = TaskStatus::Cancelled;
            guard.id.clone()
        };
        self.bus.emit("task:cancelled", json!({ "taskId": task_id }));
    }

    fn emit_task_snapshot(&self, event: &str, task: &Arc<Mutex<AiTask>>) {
        let snapshot = task.lock().unwrap().clone();
        match serde_json::to_value(&snapshot) {
            Ok(payload) => self.bus.emit(event, payload),
            Err(e) => log::warn!("Failed to serialize task {}: {}", snapshot.id, e),
        }
    }

    /// Cancel a pending or running task. Cancellation is cooperative: the
    /// executor observes the token at the next boundary.
    pub fn cancel_task(&self, task_id: &str) -> Result<()> {
        let task = self
            .tasks
            .lock()
            .unwrap()
            .get(task_id)
            .cloned()
            .ok_or_else(|| MahPastesError::NotFound(format!("task {}", task_id)))?;
        let cancel = self
            .cancel_flags
            .lock()
            .unwrap()
            .get(task_id)
            .cloned()
            .ok_or_else(|| MahPastesError::NotFound(format!("task {}", task_id)))?;

        let status = task.lock().unwrap().status;
        if status.is_terminal() {
            return Err(MahPastesError::Task(format!(
                "task is not running: {}",
                status
            )));
        }

        cancel.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn get_task(&self, task_id: &str) -> Option<AiTask> {
        self.tasks
            .lock()
            .unwrap()
            .get(task_id)
            .map(|task| task.lock().unwrap().clone())
    }

    pub fn list_tasks(&self) -> Vec<AiTask> {
        self.tasks
            .lock()
            .unwrap()
            .values()
            .map(|task| task.lock().unwrap().clone())
            .collect()
    }

    /// Drop completed, failed and cancelled tasks from both maps.
    pub fn clear_terminal_tasks(&self) {
        let mut tasks = self.tasks.lock().unwrap();
        let mut flags = self.cancel_flags.lock().unwrap();
        let terminal: Vec<String> = tasks
            .iter()
            .filter(|(_, task)| task.lock().unwrap().status.is_terminal())
            .map(|(id, _)| id.clone())
            .collect();
        for id in terminal {
            tasks.remove(&id);
            flags.remove(&id);
        }
    }
}

fn generate_processed_filename(original: &str, clip_id: i64, task: TransformKind) -> String {
    let original = if original.is_empty() {
        format!("clip_{}", clip_id)
    } else {
        original.to_string()
    };
    let path = Path::new(&original);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| original.clone());
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_else(|| ".png".to_string());
    format!("{}_{}{}", stem, task, ext)
}

#[cfg(test)]
mod tests {
    use super::transform::TransformedImage;
    use super::*;
    use crate::db::open_memory_db;
    use std::sync::mpsc::{channel, Receiver, Sender};
    use std::time::{Duration, Instant};

    fn test_store() -> (Arc<Store>, Arc<EventBus>) {
        let bus = Arc::new(EventBus::new());
        let conn = open_memory_db().unwrap();
        let store = Store::new(conn, Arc::clone(&bus));
        store.set_setting(FAL_API_KEY_SETTING, "test-key").unwrap();
        (store, bus)
    }

    fn options(task: TransformKind) -> TransformOptions {
        TransformOptions {
            task,
            model: String::new(),
            prompt: String::new(),
            strength: 0.0,
            fix_colors: false,
            remove_scratches: false,
        }
    }

    fn image_clips(store: &Store, count: usize) -> Vec<i64> {
        (0..count)
            .map(|i| {
                store
                    .insert_clip(
                        "image/png",
                        vec![0x89, 0x50, i as u8],
                        Some(&format!("photo{}.png", i)),
                        None,
                    )
                    .unwrap()
            })
            .collect()
    }

    fn wait_terminal(manager: &TaskManager, task_id: &str) -> AiTask {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(task) = manager.get_task(task_id) {
                if task.status.is_terminal() {
                    return task;
                }
            }
            assert!(Instant::now() < deadline, "task did not reach a terminal state");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    /// Transform double: succeeds with a fixed payload, optionally failing
    /// selected input URIs, recording call order.
    struct MockTransform {
        calls: Mutex<Vec<String>>,
        fail_nth: Option<usize>,
        fail_all: bool,
    }

    impl MockTransform {
        fn new() -> MockTransform {
            MockTransform {
                calls: Mutex::new(Vec::new()),
                fail_nth: None,
                fail_all: false,
            }
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    impl ImageTransform for MockTransform {
        fn transform(
            &self,
            _cancel: &Arc<AtomicBool>,
            image_data_uri: &str,
            _options: &TransformOptions,
        ) -> std::result::Result<TransformedImage, TransformError> {
            let call_index = {
                let mut calls = self.calls.lock().unwrap();
                calls.push(image_data_uri.to_string());
                calls.len()
            };
            if self.fail_all || self.fail_nth == Some(call_index) {
                return Err(TransformError::Failed("model exploded".into()));
            }
            Ok(TransformedImage {
                data: vec![1, 2, 3],
                content_type: "image/png".into(),
            })
        }
    }

    /// Blocks on the given call index until the cancel token fires.
    struct BlockingTransform {
        calls: Mutex<usize>,
        block_at: usize,
        reached_tx: Mutex<Option<Sender<()>>>,
    }

    impl ImageTransform for BlockingTransform {
        fn transform(
            &self,
            cancel: &Arc<AtomicBool>,
            _image_data_uri: &str,
            _options: &TransformOptions,
        ) -> std::result::Result<TransformedImage, TransformError> {
            let call_index = {
                let mut calls = self.calls.lock().unwrap();
                *calls += 1;
                *calls
            };
            if call_index == self.block_at {
                if let Some(tx) = self.reached_tx.lock().unwrap().take() {
                    let _ = tx.send(());
                }
                // Abandon the in-flight item once the token fires
                while !cancel.load(Ordering::Relaxed) {
                    std::thread::sleep(Duration::from_millis(5));
                }
                return Err(TransformError::Cancelled);
            }
            Ok(TransformedImage {
                data: vec![9],
                content_type: "image/png".into(),
            })
        }
    }

    #[test]
    fn test_start_requires_api_key() {
        let bus = Arc::new(EventBus::new());
        let conn = open_memory_db().unwrap();
        let store = Store::new(conn, Arc::clone(&bus));
        let manager = TaskManager::new(store, bus, Arc::new(MockTransform::new()));

        let err = manager
            .start_task(vec![1], options(TransformKind::Colorize), "Colorize")
            .unwrap_err();
        assert!(err.to_string().contains("API key not configured"));
    }

    #[test]
    fn test_task_completes_in_order() {
        let (store, bus) = test_store();
        let clips = image_clips(&store, 3);
        let mock = Arc::new(MockTransform::new());
        let manager = TaskManager::new(Arc::clone(&store), bus, Arc::clone(&mock) as Arc<dyn ImageTransform>);

        let task_id = manager
            .start_task(clips.clone(), options(TransformKind::Colorize), "Colorize")
            .unwrap();
        assert_eq!(task_id, "task_1");

        let task = wait_terminal(&manager, &task_id);
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.progress, 3);
        assert_eq!(task.total, 3);
        assert_eq!(task.results.len(), 3);
        assert!(task.results.iter().all(|r| r.success));
        assert!(task.error.is_none());

        // Items were processed strictly in submission order
        for (result, original) in task.results.iter().zip(&clips) {
            assert_eq!(result.original_id, *original);
        }

        // Result clips were saved with derived filenames
        let new_id = task.results[0].clip_id.unwrap();
        let saved = store.get_clip(new_id).unwrap();
        assert_eq!(saved.filename, "photo0_colorize.png");
    }

    #[test]
    fn test_partial_failure_classification() {
        let (store, bus) = test_store();
        let clips = image_clips(&store, 3);
        let mut mock = MockTransform::new();
        mock.fail_nth = Some(2);
        let manager = TaskManager::new(store, bus, Arc::new(mock));

        let task_id = manager
            .start_task(clips, options(TransformKind::Restore), "Restore")
            .unwrap();
        let task = wait_terminal(&manager, &task_id);

        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("1 of 3 images failed"));
        assert_eq!(task.results.len(), 3);
        assert_eq!(task.results.iter().filter(|r| r.success).count(), 2);
    }

    #[test]
    fn test_all_failed_classification() {
        let (store, bus) = test_store();
        let clips = image_clips(&store, 2);
        let mut mock = MockTransform::new();
        mock.fail_all = true;
        let manager = TaskManager::new(store, bus, Arc::new(mock));

        let task_id = manager
            .start_task(clips, options(TransformKind::Upscale), "Upscale")
            .unwrap();
        let task = wait_terminal(&manager, &task_id);

        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("All 2 images failed to process"));
    }

    #[test]
    fn test_non_image_clip_is_per_item_failure() {
        let (store, bus) = test_store();
        let text = store
            .insert_clip("text/plain", b"not an image".to_vec(), None, None)
            .unwrap();
        let image = image_clips(&store, 1);
        let manager = TaskManager::new(store, bus, Arc::new(MockTransform::new()));

        let task_id = manager
            .start_task(vec![text, image[0]], options(TransformKind::Colorize), "Mixed")
            .unwrap();
        let task = wait_terminal(&manager, &task_id);

        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.results[0].error.as_deref(), Some("clip is not an image"));
        assert!(task.results[1].success);
    }

    /// Scenario: cancel after the third progress event. No new result is
    /// appended after the cancel, and no further transforms start.
    #[test]
    fn test_cancellation_mid_task() {
        let (store, bus) = test_store();
        let clips = image_clips(&store, 10);
        let (reached_tx, reached_rx): (Sender<()>, Receiver<()>) = channel();
        let blocking = Arc::new(BlockingTransform {
            calls: Mutex::new(0),
            block_at: 4,
            reached_tx: Mutex::new(Some(reached_tx)),
        });
        let manager = TaskManager::new(
            store,
            bus,
            Arc::clone(&blocking) as Arc<dyn ImageTransform>,
        );

        let task_id = manager
            .start_task(clips, options(TransformKind::Colorize), "Colorize")
            .unwrap();

        // Item 4 is in flight (3 results recorded); cancel now
        reached_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        manager.cancel_task(&task_id).unwrap();

        let task = wait_terminal(&manager, &task_id);
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert_eq!(task.progress, 3);
        assert_eq!(task.results.len(), 3);
        assert_eq!(*blocking.calls.lock().unwrap(), 4, "items 5..10 never started");

        // Terminal tasks cannot be cancelled again
        let err = manager.cancel_task(&task_id).unwrap_err();
        assert!(err.to_string().contains("task is not running"));
    }

    #[test]
    fn test_progress_events_and_completed_payload() {
        let (store, bus) = test_store();
        let clips = image_clips(&store, 2);
        let rx = bus.subscribe();
        let manager = TaskManager::new(store, Arc::clone(&bus), Arc::new(MockTransform::new()));

        let task_id = manager
            .start_task(clips, options(TransformKind::Colorize), "Colorize")
            .unwrap();
        wait_terminal(&manager, &task_id);

        let mut progress_values = Vec::new();
        let mut completed_status = None;
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            match rx.recv_timeout(Duration::from_millis(100)) {
                Ok(event) if event.name == "task:progress" => {
                    progress_values.push(event.payload["progress"].as_u64().unwrap());
                }
                Ok(event) if event.name == "task:completed" => {
                    completed_status = Some(event.payload["status"].as_str().unwrap().to_string());
                    break;
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }

        // Progress only increases
        assert_eq!(progress_values, vec![1, 2]);
        assert_eq!(completed_status.as_deref(), Some("completed"));
    }

    #[test]
    fn test_clear_terminal_tasks() {
        let (store, bus) = test_store();
        let clips = image_clips(&store, 1);
        let manager = TaskManager::new(store, bus, Arc::new(MockTransform::new()));

        let task_id = manager
            .start_task(clips, options(TransformKind::Colorize), "Colorize")
            .unwrap();
        wait_terminal(&manager, &task_id);

        assert_eq!(manager.list_tasks().len(), 1);
        manager.clear_terminal_tasks();
        assert!(manager.list_tasks().is_empty());
        assert!(manager.get_task(&task_id).is_none());
    }

    #[test]
    fn test_task_ids_are_monotonic() {
        let (store, bus) = test_store();
        let clips = image_clips(&store, 1);
        let manager = TaskManager::new(store, bus, Arc::new(MockTransform::new()));

        let first = manager
            .start_task(clips.clone(), options(TransformKind::Colorize), "A")
            .unwrap();
        let second = manager
            .start_task(clips, options(TransformKind::Colorize), "B")
            .unwrap();
        assert_eq!(first, "task_1");
        assert_eq!(second, "task_2");
    }
}
