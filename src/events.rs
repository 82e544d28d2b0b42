// In-process pub-sub event bus
// Emitters never block on consumers: UI-side subscribers get the event on
// unbounded channels, and plugin-side sinks are driven by a dedicated
// dispatch thread (plugin handlers can take up to the sandbox deadline).

use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;

use serde_json::Value;

/// The closed set of event names emitted over the bus. Plugins subscribe by
/// the same strings.
pub const VALID_EVENTS: [&str; 24] = [
    "app:startup",
    "app:shutdown",
    "clip:created",
    "clip:deleted",
    "clip:archived",
    "clip:unarchived",
    "watch:file_detected",
    "watch:import_complete",
    "watch:error",
    "tag:created",
    "tag:updated",
    "tag:deleted",
    "tag:added_to_clip",
    "tag:removed_from_clip",
    "task:started",
    "task:progress",
    "task:completed",
    "task:failed",
    "task:cancelled",
    "plugin:toast",
    "plugin:task:started",
    "plugin:task:progress",
    "plugin:task:completed",
    "plugin:task:failed",
];

pub fn is_valid_event(name: &str) -> bool {
    VALID_EVENTS.contains(&name)
}

#[derive(Debug, Clone)]
pub struct BusEvent {
    pub name: String,
    pub payload: Value,
}

/// Consumers that need ordered, potentially slow delivery (the plugin
/// manager). Delivery happens on the bus dispatch thread.
pub trait EventSink: Send + Sync {
    fn deliver(&self, event: &BusEvent);
}

struct BusState {
    subscribers: Vec<Sender<BusEvent>>,
    sinks: Vec<Weak<dyn EventSink>>,
}

pub struct EventBus {
    state: Arc<Mutex<BusState>>,
    dispatch_tx: Mutex<Option<Sender<BusEvent>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl EventBus {
    pub fn new() -> Self {
        let state = Arc::new(Mutex::new(BusState {
            subscribers: Vec::new(),
            sinks: Vec::new(),
        }));

        let (tx, rx) = channel::<BusEvent>();
        let dispatch_state = Arc::clone(&state);
        let dispatcher = std::thread::Builder::new()
            .name("event-dispatch".into())
            .spawn(move || {
                for event in rx {
                    let sinks: Vec<Weak<dyn EventSink>> = {
                        let guard = dispatch_state.lock().unwrap();
                        guard.sinks.clone()
                    };
                    for weak in sinks {
                        if let Some(sink) = weak.upgrade() {
                            sink.deliver(&event);
                        }
                    }
                }
            })
            .expect("failed to spawn event dispatch thread");

        EventBus {
            state,
            dispatch_tx: Mutex::new(Some(tx)),
            dispatcher: Mutex::new(Some(dispatcher)),
        }
    }

    /// Subscribe as a UI-side consumer. Delivery is push-only best-effort;
    /// dropped receivers are pruned on the next emit.
    pub fn subscribe(&self) -> Receiver<BusEvent> {
        let (tx, rx) = channel();
        self.state.lock().unwrap().subscribers.push(tx);
        rx
    }

    /// Register a slow-path sink (held weakly so the bus never keeps a
    /// manager alive).
    pub fn register_sink(&self, sink: Weak<dyn EventSink>) {
        self.state.lock().unwrap().sinks.push(sink);
    }

    /// Emit a named event. Never blocks on any consumer.
    pub fn emit(&self, name: &str, payload: Value) {
        let event = BusEvent {
            name: name.to_string(),
            payload,
        };

        {
            let mut guard = self.state.lock().unwrap();
            guard
                .subscribers
                .retain(|tx| tx.send(event.clone()).is_ok());
        }

        if let Some(tx) = self.dispatch_tx.lock().unwrap().as_ref() {
            let _ = tx.send(event);
        }
    }

    /// Stop the dispatch thread after draining queued events. Idempotent.
    pub fn shutdown(&self) {
        let tx = self.dispatch_tx.lock().unwrap().take();
        drop(tx);
        if let Some(handle) = self.dispatcher.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_subscriber_receives_events() {
        let bus = EventBus::new();
        let rx = bus.subscribe();

        bus.emit("clip:created", json!({"id": 1}));
        let event = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(event.name, "clip:created");
        assert_eq!(event.payload["id"], 1);
    }

    #[test]
    fn test_emit_with_no_subscribers_does_not_block() {
        let bus = EventBus::new();
        for i in 0..100 {
            bus.emit("tag:created", json!({"i": i}));
        }
    }

    #[test]
    fn test_dropped_subscriber_is_pruned() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        drop(rx);
        // Must not error or block
        bus.emit("clip:deleted", json!({"id": 2}));
        bus.emit("clip:deleted", json!({"id": 3}));
    }

    struct CountingSink {
        count: AtomicUsize,
    }

    impl EventSink for CountingSink {
        fn deliver(&self, _event: &BusEvent) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_sink_receives_events_on_dispatch_thread() {
        let bus = EventBus::new();
        let sink = Arc::new(CountingSink {
            count: AtomicUsize::new(0),
        });
        let weak: Weak<dyn EventSink> = Arc::downgrade(&(Arc::clone(&sink) as Arc<dyn EventSink>));
        bus.register_sink(weak);

        bus.emit("app:startup", Value::Null);
        bus.emit("app:shutdown", Value::Null);
        bus.shutdown(); // joins the dispatcher, so deliveries are complete

        assert_eq!(sink.count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_valid_event_names() {
        assert!(is_valid_event("clip:created"));
        assert!(is_valid_event("plugin:task:progress"));
        assert!(!is_valid_event("clip:exploded"));
    }
}
