// Plugin toast API
// Messages are truncated, HTML-escaped and rate limited before being
// forwarded to the shell. Rate-limited calls are dropped silently.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use mlua::Lua;
use serde_json::json;

use crate::constants::{MAX_TOAST_MESSAGE_LENGTH, TOASTS_PER_MINUTE};
use crate::events::EventBus;

struct ToastApi {
    bus: Arc<EventBus>,
    plugin_id: i64,
    call_times: Mutex<Vec<Instant>>,
}

impl ToastApi {
    /// Sliding one-minute window; returns false when over the limit.
    fn allow(&self) -> bool {
        let mut calls = self.call_times.lock().unwrap();
        let cutoff = Instant::now() - Duration::from_secs(60);
        calls.retain(|t| *t > cutoff);
        if calls.len() >= TOASTS_PER_MINUTE as usize {
            return false;
        }
        calls.push(Instant::now());
        true
    }
}

pub fn register(lua: &Lua, bus: Arc<EventBus>, plugin_id: i64) -> mlua::Result<()> {
    let api = Arc::new(ToastApi {
        bus,
        plugin_id,
        call_times: Mutex::new(Vec::new()),
    });
    let toast_mod = lua.create_table()?;

    toast_mod.set(
        "show",
        lua.create_function(move |_, (message, kind): (String, Option<String>)| {
            let kind = kind.unwrap_or_default();
            let kind = match kind.as_str() {
                "info" | "success" | "error" => kind,
                _ => "info".to_string(),
            };

            // Truncate on a char boundary, then escape
            let message = if message.chars().count() > MAX_TOAST_MESSAGE_LENGTH {
                let truncated: String =
                    message.chars().take(MAX_TOAST_MESSAGE_LENGTH - 3).collect();
                format!("{}...", truncated)
            } else {
                message
            };
            let message = html_escape::encode_text(&message).into_owned();

            if !api.allow() {
                return Ok(false);
            }

            api.bus.emit(
                "plugin:toast",
                json!({
                    "plugin_id": api.plugin_id,
                    "message": message,
                    "type": kind,
                }),
            );
            Ok(true)
        })?,
    )?;

    lua.globals().set("toast", toast_mod)?;
    Ok(())
}
