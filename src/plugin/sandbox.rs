// Plugin sandbox
// Each plugin gets its own Lua interpreter loaded with only the base,
// table, string and math libraries. Code loaders, raw table accessors,
// metatable accessors and GC control are removed. Every entry into the
// interpreter is serialized by a mutex and bounded by a wall-clock deadline
// enforced through an instruction-count hook.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use mlua::{HookTriggers, Lua, LuaOptions, LuaSerdeExt, StdLib};
use serde_json::Value;

use crate::constants::{MAX_EXECUTION_TIME_SECS, MAX_SANDBOX_MEMORY, SANDBOX_HOOK_INSTRUCTIONS};
use crate::error::{MahPastesError, Result};

/// Globals stripped from every sandbox. Loaders would let a plugin smuggle
/// code past the manifest; raw accessors and metatable control would let it
/// break out of host-provided tables.
const REMOVED_GLOBALS: [&str; 10] = [
    "dofile",
    "loadfile",
    "load",
    "loadstring",
    "rawequal",
    "rawget",
    "rawset",
    "getmetatable",
    "setmetatable",
    "collectgarbage",
];

const DEADLINE_MSG: &str = "execution deadline exceeded";

pub struct Sandbox {
    lua: Mutex<Lua>,
    plugin_id: i64,
    /// External cancel token polled by the instruction hook alongside the
    /// per-call deadline.
    cancel: Arc<AtomicBool>,
}

impl Sandbox {
    pub fn new(plugin_id: i64) -> Result<Sandbox> {
        let lua = Lua::new_with(
            StdLib::TABLE | StdLib::STRING | StdLib::MATH,
            LuaOptions::default(),
        )?;

        lua.set_memory_limit(MAX_SANDBOX_MEMORY)?;

        let globals = lua.globals();
        for name in REMOVED_GLOBALS {
            globals.set(name, mlua::Value::Nil)?;
        }
        drop(globals);

        Ok(Sandbox {
            lua: Mutex::new(lua),
            plugin_id,
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn plugin_id(&self) -> i64 {
        self.plugin_id
    }

    /// Token that aborts the current and any future interpreter entry.
    pub fn cancel_token(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Run API registration (or any other setup) against the interpreter
    /// under the sandbox mutex.
    pub fn with_lua<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&Lua) -> mlua::Result<()>,
    {
        let lua = self.lua.lock().unwrap();
        f(&lua)?;
        Ok(())
    }

    /// Load and execute the plugin source under the deadline.
    pub fn load_source(&self, source: &str) -> Result<()> {
        let lua = self.lua.lock().unwrap();
        self.run_with_deadline(&lua, "plugin load", || lua.load(source).exec())
    }

    /// Call a global handler if it exists. The payload is converted to a Lua
    /// value inside the mutex. Returns false when the handler is absent.
    pub fn call_handler(&self, name: &str, payload: Option<&Value>) -> Result<bool> {
        let lua = self.lua.lock().unwrap();

        let func = match lua.globals().get::<_, mlua::Value>(name)? {
            mlua::Value::Function(f) => f,
            mlua::Value::Nil => return Ok(false), // handler not defined, skip silently
            _ => {
                return Err(MahPastesError::Plugin(format!("{} is not a function", name)));
            }
        };

        let arg = match payload {
            Some(value) => Some(lua.to_value(value)?),
            None => None,
        };

        self.run_with_deadline(&lua, name, || match arg {
            Some(a) => func.call::<_, ()>(a),
            None => func.call::<_, ()>(()),
        })?;
        Ok(true)
    }

    /// Call on_ui_action(action_id, clip_ids, options) and collect the scalar
    /// fields of the returned table.
    pub fn call_ui_action(
        &self,
        action_id: &str,
        clip_ids: &[i64],
        options: &serde_json::Map<String, Value>,
    ) -> Result<HashMap<String, Value>> {
        let lua = self.lua.lock().unwrap();

        let func = match lua.globals().get::<_, mlua::Value>("on_ui_action")? {
            mlua::Value::Function(f) => f,
            mlua::Value::Nil => {
                return Err(MahPastesError::Plugin(
                    "plugin does not implement on_ui_action".into(),
                ));
            }
            _ => {
                return Err(MahPastesError::Plugin(
                    "on_ui_action is not a function".into(),
                ));
            }
        };

        let ids_table = lua.create_table()?;
        for (i, id) in clip_ids.iter().enumerate() {
            ids_table.set(i + 1, *id)?;
        }
        let options_value = lua.to_value(&Value::Object(options.clone()))?;

        let ret: mlua::Value = self.run_with_deadline(&lua, "on_ui_action", || {
            func.call((action_id, ids_table, options_value))
        })?;

        let mut result = HashMap::new();
        if let mlua::Value::Table(table) = ret {
            for pair in table.pairs::<String, mlua::Value>() {
                let (key, value) = match pair {
                    Ok(kv) => kv,
                    Err(_) => continue, // non-string keys and exotic values are ignored
                };
                match value {
                    mlua::Value::Boolean(b) => {
                        result.insert(key, Value::Bool(b));
                    }
                    mlua::Value::Integer(n) => {
                        result.insert(key, Value::from(n));
                    }
                    mlua::Value::Number(n) => {
                        if let Some(num) = serde_json::Number::from_f64(n) {
                            result.insert(key, Value::Number(num));
                        }
                    }
                    mlua::Value::String(s) => {
                        result.insert(key, Value::String(s.to_string_lossy().into_owned()));
                    }
                    _ => {}
                }
            }
        }
        Ok(result)
    }

    /// Execute f with the instruction hook armed: the call is aborted once
    /// the wall-clock deadline passes or the cancel token fires.
    fn run_with_deadline<T>(
        &self,
        lua: &Lua,
        what: &str,
        f: impl FnOnce() -> mlua::Result<T>,
    ) -> Result<T> {
        let deadline = Instant::now() + Duration::from_secs(MAX_EXECUTION_TIME_SECS);
        let cancel = Arc::clone(&self.cancel);

        lua.set_hook(
            HookTriggers::default().every_nth_instruction(SANDBOX_HOOK_INSTRUCTIONS),
            move |_lua, _debug| {
                if cancel.load(Ordering::Relaxed) || Instant::now() >= deadline {
                    Err(mlua::Error::RuntimeError(DEADLINE_MSG.into()))
                } else {
                    Ok(())
                }
            },
        );

        let result = f();
        lua.remove_hook();

        match result {
            Ok(value) => Ok(value),
            Err(e) => {
                let msg = e.to_string();
                if msg.contains(DEADLINE_MSG) {
                    Err(MahPastesError::Timeout(format!(
                        "{} timed out after {}s",
                        what, MAX_EXECUTION_TIME_SECS
                    )))
                } else {
                    Err(MahPastesError::Plugin(format!("{} failed: {}", what, msg)))
                }
            }
        }
    }
}
