// Plugin host tests
// End-to-end over real sandboxes: capability gating, isolation, error
// quarantine, UI actions. No network requests are made; denial paths fail
// before any socket is opened.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;

use super::{event_to_handler, PermissionCallback, PluginManager};
use crate::db::open_memory_db;
use crate::db::store::Store;
use crate::events::EventBus;
use crate::plugin::sandbox::Sandbox;

fn test_store() -> (Arc<Store>, Arc<EventBus>) {
    let bus = Arc::new(EventBus::new());
    let conn = open_memory_db().unwrap();
    (Store::new(conn, Arc::clone(&bus)), bus)
}

/// Write a plugin source into its own temp dir and import it.
fn install_plugin(
    manager: &PluginManager,
    filename: &str,
    source: &str,
) -> crate::error::Result<super::PluginInfo> {
    let staging = TempDir::new().unwrap();
    let path = staging.path().join(filename);
    std::fs::write(&path, source).unwrap();
    manager.import_plugin(&path)
}

fn test_manager(store: &Arc<Store>, bus: &Arc<EventBus>) -> (Arc<PluginManager>, TempDir) {
    let plugins_dir = TempDir::new().unwrap();
    let manager = PluginManager::new(
        Arc::clone(store),
        Arc::clone(bus),
        plugins_dir.path().to_path_buf(),
    )
    .unwrap();
    (manager, plugins_dir)
}

#[test]
fn test_event_to_handler_names() {
    assert_eq!(event_to_handler("app:startup"), "on_startup");
    assert_eq!(event_to_handler("app:shutdown"), "on_shutdown");
    assert_eq!(event_to_handler("clip:created"), "on_clip_created");
    assert_eq!(event_to_handler("tag:added_to_clip"), "on_tag_added_to_clip");
    assert_eq!(event_to_handler("plugin:task:started"), "on_plugin_task_started");
}

#[test]
fn test_import_and_dispatch_event() {
    let (store, bus) = test_store();
    let (manager, _dir) = test_manager(&store, &bus);

    let info = install_plugin(
        &manager,
        "recorder.lua",
        r#"Plugin = {
    name = "Recorder",
    version = "0.1.0",
    events = {"clip:created"},
}

function on_clip_created(clip)
    storage.set("last_clip_id", tostring(clip.id))
end
"#,
    )
    .unwrap();

    manager.dispatch_event("clip:created", &json!({"id": 41}));

    let value = store.get_plugin_storage(info.id, "last_clip_id").unwrap();
    assert_eq!(value.as_deref(), Some(b"41".as_slice()));
}

#[test]
fn test_absent_handler_is_silent_noop() {
    let (store, bus) = test_store();
    let (manager, _dir) = test_manager(&store, &bus);

    let info = install_plugin(
        &manager,
        "quiet.lua",
        r#"Plugin = {
    name = "Quiet",
    events = {"clip:created", "clip:deleted"},
}

function on_clip_created() end
"#,
    )
    .unwrap();

    // No on_clip_deleted defined: dispatch must not count an error
    manager.dispatch_event("clip:deleted", &json!({"id": 1}));
    let row = store.get_plugin(info.id).unwrap().unwrap();
    assert_eq!(row.error_count, 0);
    assert_eq!(row.status, "enabled");
}

#[test]
fn test_dangerous_globals_removed() {
    let (store, bus) = test_store();
    let (manager, _dir) = test_manager(&store, &bus);

    let info = install_plugin(
        &manager,
        "probe.lua",
        r#"Plugin = {
    name = "Probe",
}

local missing = {"dofile", "loadfile", "load", "loadstring", "rawget",
                 "rawset", "rawequal", "getmetatable", "setmetatable",
                 "collectgarbage", "os", "io"}
local all_nil = true
for _, name in ipairs(missing) do
    if _G[name] ~= nil then
        all_nil = false
    end
end
storage.set("all_nil", tostring(all_nil))
"#,
    )
    .unwrap();

    let value = store.get_plugin_storage(info.id, "all_nil").unwrap();
    assert_eq!(value.as_deref(), Some(b"true".as_slice()));
}

#[test]
fn test_storage_isolation_between_plugins() {
    let (store, bus) = test_store();
    let (manager, _dir) = test_manager(&store, &bus);

    let writer = install_plugin(
        &manager,
        "writer.lua",
        r#"Plugin = { name = "Writer" }
storage.set("shared_key", "secret")
"#,
    )
    .unwrap();

    let reader = install_plugin(
        &manager,
        "reader.lua",
        r#"Plugin = { name = "Reader" }
local value = storage.get("shared_key")
storage.set("observed", tostring(value))
"#,
    )
    .unwrap();

    // The reader sees nil: plugin KV is scoped by plugin id
    assert_eq!(
        store.get_plugin_storage(reader.id, "observed").unwrap().as_deref(),
        Some(b"nil".as_slice())
    );
    assert_eq!(
        store.get_plugin_storage(writer.id, "shared_key").unwrap().as_deref(),
        Some(b"secret".as_slice())
    );
}

/// Scenario: http.post against a domain that only allows GET.
#[test]
fn test_http_method_denial_message() {
    let (store, bus) = test_store();
    let (manager, _dir) = test_manager(&store, &bus);

    let info = install_plugin(
        &manager,
        "poster.lua",
        r#"Plugin = {
    name = "Poster",
    network = {
        ["api.example.com"] = {"GET"},
    },
}

local result, err = http.post("https://api.example.com/x")
storage.set("result", tostring(result))
storage.set("err", err or "")
"#,
    )
    .unwrap();

    assert_eq!(
        store.get_plugin_storage(info.id, "result").unwrap().as_deref(),
        Some(b"nil".as_slice())
    );
    assert_eq!(
        store.get_plugin_storage(info.id, "err").unwrap().as_deref(),
        Some(b"POST not allowed for domain api.example.com (allowed: [GET])".as_slice())
    );
}

#[test]
fn test_http_unlisted_domain_denied() {
    let (store, bus) = test_store();
    let (manager, _dir) = test_manager(&store, &bus);

    let info = install_plugin(
        &manager,
        "fetcher.lua",
        r#"Plugin = {
    name = "Fetcher",
    network = { ["api.example.com"] = {"GET"} },
}

local result, err = http.get("https://evil.example.net/payload")
storage.set("err", err or "")
"#,
    )
    .unwrap();

    assert_eq!(
        store.get_plugin_storage(info.id, "err").unwrap().as_deref(),
        Some(b"domain not in allowlist: evil.example.net".as_slice())
    );
}

#[test]
fn test_create_from_url_requires_network_permission() {
    let (store, bus) = test_store();
    let (manager, _dir) = test_manager(&store, &bus);

    let info = install_plugin(
        &manager,
        "urlclip.lua",
        r#"Plugin = { name = "UrlClip" }

local clip, err = clips.create_from_url("https://cdn.example.com/cat.png")
storage.set("err", err or "")

local _, scheme_err = clips.create_from_url("ftp://cdn.example.com/cat.png")
storage.set("scheme_err", scheme_err or "")
"#,
    )
    .unwrap();

    let err = store.get_plugin_storage(info.id, "err").unwrap().unwrap();
    assert!(String::from_utf8_lossy(&err).starts_with("no network permissions"));

    let scheme_err = store.get_plugin_storage(info.id, "scheme_err").unwrap().unwrap();
    assert_eq!(
        String::from_utf8_lossy(&scheme_err),
        "only http:// and https:// URLs are allowed"
    );
}

#[test]
fn test_clips_api_round_trip() {
    let (store, bus) = test_store();
    let (manager, _dir) = test_manager(&store, &bus);

    let info = install_plugin(
        &manager,
        "clipper.lua",
        r#"Plugin = { name = "Clipper" }

local created, err = clips.create({data = "hello from lua", content_type = "text/plain", filename = "lua.txt"})
storage.set("created_id", tostring(created.id))

local clip = clips.get(created.id)
storage.set("round_trip", clip.data)

clips.archive(created.id)
local archived = clips.get(created.id)
storage.set("archived", tostring(archived.is_archived))
"#,
    )
    .unwrap();

    let id_bytes = store.get_plugin_storage(info.id, "created_id").unwrap().unwrap();
    let clip_id: i64 = String::from_utf8_lossy(&id_bytes).parse().unwrap();
    assert!(store.get_clip(clip_id).is_ok());

    assert_eq!(
        store.get_plugin_storage(info.id, "round_trip").unwrap().as_deref(),
        Some(b"hello from lua".as_slice())
    );
    assert_eq!(
        store.get_plugin_storage(info.id, "archived").unwrap().as_deref(),
        Some(b"true".as_slice())
    );
}

#[test]
fn test_clips_create_invalid_mime_replaced() {
    let (store, bus) = test_store();
    let (manager, _dir) = test_manager(&store, &bus);

    let info = install_plugin(
        &manager,
        "mime.lua",
        r#"Plugin = { name = "Mime" }

local created = clips.create({data = "AAAA", content_type = "not a mime type", data_encoding = "base64"})
storage.set("id", tostring(created.id))
"#,
    )
    .unwrap();

    let id_bytes = store.get_plugin_storage(info.id, "id").unwrap().unwrap();
    let clip_id: i64 = String::from_utf8_lossy(&id_bytes).parse().unwrap();
    let row = store.get_clip(clip_id).unwrap();
    assert_eq!(row.content_type, "application/octet-stream");
}

#[test]
fn test_fs_requires_manifest_intent() {
    let (store, bus) = test_store();
    let (manager, _dir) = test_manager(&store, &bus);

    let info = install_plugin(
        &manager,
        "nofs.lua",
        r#"Plugin = { name = "NoFs" }

local data, err = fs.read("/tmp/anything")
storage.set("err", err or "")
storage.set("exists", tostring(fs.exists("/tmp/anything")))
"#,
    )
    .unwrap();

    assert_eq!(
        store.get_plugin_storage(info.id, "err").unwrap().as_deref(),
        Some(b"plugin did not declare filesystem.read permission".as_slice())
    );
    // exists never leaks outside approved paths
    assert_eq!(
        store.get_plugin_storage(info.id, "exists").unwrap().as_deref(),
        Some(b"false".as_slice())
    );
}

#[test]
fn test_fs_grant_flow() {
    let (store, bus) = test_store();
    let (manager, _dir) = test_manager(&store, &bus);

    let sandbox_dir = TempDir::new().unwrap();
    let file_path = sandbox_dir.path().join("granted.txt");
    std::fs::write(&file_path, b"grant me").unwrap();

    // Grant the whole directory whenever asked
    let grant_root = sandbox_dir.path().to_path_buf();
    let callback: PermissionCallback =
        Arc::new(move |_plugin, _perm, _path| Some(grant_root.clone()));
    manager.set_permission_callback(callback);

    let source = format!(
        r#"Plugin = {{
    name = "FsReader",
    filesystem = {{ read = true, write = true }},
}}

local data, err = fs.read("{path}")
storage.set("data", data or "")
storage.set("err", err or "")
storage.set("exists", tostring(fs.exists("{path}")))

local ok = fs.write("{dir}/out.txt", "written by plugin")
storage.set("wrote", tostring(ok))
"#,
        path = file_path.display(),
        dir = sandbox_dir.path().display()
    );

    let info = install_plugin(&manager, "fsreader.lua", &source).unwrap();

    assert_eq!(
        store.get_plugin_storage(info.id, "data").unwrap().as_deref(),
        Some(b"grant me".as_slice())
    );
    assert_eq!(
        store.get_plugin_storage(info.id, "exists").unwrap().as_deref(),
        Some(b"true".as_slice())
    );
    assert_eq!(
        store.get_plugin_storage(info.id, "wrote").unwrap().as_deref(),
        Some(b"true".as_slice())
    );
    assert_eq!(
        std::fs::read(sandbox_dir.path().join("out.txt")).unwrap(),
        b"written by plugin"
    );

    // The grant was persisted
    let perms = store.list_plugin_permissions(info.id).unwrap();
    assert!(perms.iter().any(|p| p.permission_type == "fs_read"));
}

#[test]
fn test_fs_denied_grant() {
    let (store, bus) = test_store();
    let (manager, _dir) = test_manager(&store, &bus);

    let callback: PermissionCallback = Arc::new(|_plugin, _perm, _path| None);
    manager.set_permission_callback(callback);

    let info = install_plugin(
        &manager,
        "denied.lua",
        r#"Plugin = {
    name = "Denied",
    filesystem = { read = true },
}

local data, err = fs.read("/etc/hostname")
storage.set("err", err or "")
"#,
    )
    .unwrap();

    let err = store.get_plugin_storage(info.id, "err").unwrap().unwrap();
    assert!(String::from_utf8_lossy(&err).starts_with("permission denied for"));
}

#[test]
fn test_error_quarantine_after_three_failures() {
    let (store, bus) = test_store();
    let (manager, _dir) = test_manager(&store, &bus);

    let info = install_plugin(
        &manager,
        "crasher.lua",
        r#"Plugin = {
    name = "Crasher",
    events = {"clip:created"},
}

function on_clip_created()
    error("boom")
end
"#,
    )
    .unwrap();

    manager.dispatch_event("clip:created", &json!({"id": 1}));
    manager.dispatch_event("clip:created", &json!({"id": 2}));
    assert!(manager.loaded_plugin_ids().contains(&info.id));

    manager.dispatch_event("clip:created", &json!({"id": 3}));

    // Third consecutive failure quarantines and unloads
    assert!(!manager.loaded_plugin_ids().contains(&info.id));
    let row = store.get_plugin(info.id).unwrap().unwrap();
    assert_eq!(row.status, "error");
    assert_eq!(row.error_count, 3);

    // Further dispatches are no-ops
    manager.dispatch_event("clip:created", &json!({"id": 4}));
}

#[test]
fn test_successful_call_resets_error_count() {
    let (store, bus) = test_store();
    let (manager, _dir) = test_manager(&store, &bus);

    let info = install_plugin(
        &manager,
        "flaky.lua",
        r#"Plugin = {
    name = "Flaky",
    events = {"clip:created", "clip:deleted"},
}

function on_clip_created()
    error("boom")
end

function on_clip_deleted()
end
"#,
    )
    .unwrap();

    manager.dispatch_event("clip:created", &json!({"id": 1}));
    manager.dispatch_event("clip:created", &json!({"id": 2}));
    assert_eq!(store.get_plugin(info.id).unwrap().unwrap().error_count, 2);

    // A successful handler call resets the streak
    manager.dispatch_event("clip:deleted", &json!({"id": 1}));
    assert_eq!(store.get_plugin(info.id).unwrap().unwrap().error_count, 0);

    manager.dispatch_event("clip:created", &json!({"id": 3}));
    manager.dispatch_event("clip:created", &json!({"id": 4}));
    assert!(manager.loaded_plugin_ids().contains(&info.id), "streak restarted, not quarantined");
}

#[test]
fn test_ui_actions_aggregation_and_execution() {
    let (store, bus) = test_store();
    let (manager, _dir) = test_manager(&store, &bus);

    install_plugin(
        &manager,
        "uiplugin.lua",
        r#"Plugin = {
    name = "UiPlugin",
    ui = {
        lightbox_buttons = {
            {id = "enhance", label = "Enhance", icon = "wand"},
        },
        card_actions = {
            {id = "note", label = "Add note"},
        },
    },
}

function on_ui_action(action_id, clip_ids, options)
    if action_id == "enhance" then
        return {success = true, result_clip_id = clip_ids[1] + 100}
    end
    return {success = false, error = "unknown action: " .. action_id}
end
"#,
    )
    .unwrap();

    let actions = manager.ui_actions();
    assert_eq!(actions.lightbox_buttons.len(), 1);
    assert_eq!(actions.lightbox_buttons[0].id, "enhance");
    assert_eq!(actions.lightbox_buttons[0].icon.as_deref(), Some("wand"));
    assert_eq!(actions.card_actions.len(), 1);

    let plugin_id = actions.lightbox_buttons[0].plugin_id;
    let result = manager
        .execute_ui_action(plugin_id, "enhance", &[7], &serde_json::Map::new())
        .unwrap();
    assert!(result.success);
    assert_eq!(result.result_clip_id, Some(107));

    let result = manager
        .execute_ui_action(plugin_id, "mystery", &[7], &serde_json::Map::new())
        .unwrap();
    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("unknown action: mystery"));

    let _ = store;
}

#[test]
fn test_schedules_registered_and_removed() {
    let (store, bus) = test_store();
    let (manager, _dir) = test_manager(&store, &bus);

    let info = install_plugin(
        &manager,
        "ticker.lua",
        r#"Plugin = {
    name = "Ticker",
    schedules = {
        {name = "tick", interval = 3600},
    },
}

function tick() end
"#,
    )
    .unwrap();

    assert_eq!(manager.scheduler_task_count(), 1);
    manager.disable_plugin(info.id).unwrap();
    assert_eq!(manager.scheduler_task_count(), 0);
    assert!(!store.get_plugin(info.id).unwrap().unwrap().enabled);
}

#[test]
fn test_remove_plugin_cascades() {
    let (store, bus) = test_store();
    let (manager, plugins_dir) = test_manager(&store, &bus);

    let info = install_plugin(
        &manager,
        "goner.lua",
        r#"Plugin = { name = "Goner" }
storage.set("k", "v")
"#,
    )
    .unwrap();

    let file = plugins_dir.path().join("goner.lua");
    assert!(file.exists());

    manager.remove_plugin(info.id).unwrap();

    assert!(!file.exists());
    assert!(store.get_plugin(info.id).unwrap().is_none());
    assert!(store.get_plugin_storage(info.id, "k").unwrap().is_none());
    assert!(!manager.loaded_plugin_ids().contains(&info.id));
}

#[test]
fn test_toast_rate_limit_and_escaping() {
    let (store, bus) = test_store();
    let (manager, _dir) = test_manager(&store, &bus);

    let rx = bus.subscribe();
    let info = install_plugin(
        &manager,
        "toaster.lua",
        r#"Plugin = { name = "Toaster" }

local sent = 0
for i = 1, 7 do
    if toast.show("<b>hello</b> " .. i, "success") then
        sent = sent + 1
    end
end
storage.set("sent", tostring(sent))
"#,
    )
    .unwrap();

    // Five allowed per minute, the rest silently dropped
    assert_eq!(
        store.get_plugin_storage(info.id, "sent").unwrap().as_deref(),
        Some(b"5".as_slice())
    );

    let mut toasts = 0;
    while let Ok(event) = rx.recv_timeout(Duration::from_millis(200)) {
        if event.name == "plugin:toast" {
            let message = event.payload["message"].as_str().unwrap();
            assert!(!message.contains('<'), "messages are HTML-escaped: {}", message);
            toasts += 1;
        }
    }
    assert_eq!(toasts, 5);
}

#[test]
fn test_plugin_task_events() {
    let (store, bus) = test_store();
    let (manager, _dir) = test_manager(&store, &bus);

    let rx = bus.subscribe();
    install_plugin(
        &manager,
        "worker.lua",
        r#"Plugin = { name = "Worker" }

local id = task.start("crunch", 3)
task.progress(id, 1)
task.progress(id, 2)
task.complete(id)
"#,
    )
    .unwrap();

    let mut names = Vec::new();
    while let Ok(event) = rx.recv_timeout(Duration::from_millis(200)) {
        if event.name.starts_with("plugin:task:") {
            names.push(event.name);
        }
    }
    assert_eq!(
        names,
        vec![
            "plugin:task:started",
            "plugin:task:progress",
            "plugin:task:progress",
            "plugin:task:completed",
        ]
    );
    let _ = store;
}

#[test]
fn test_json_and_base64_utils() {
    let (store, bus) = test_store();
    let (manager, _dir) = test_manager(&store, &bus);

    let info = install_plugin(
        &manager,
        "utils.lua",
        r#"Plugin = { name = "Utils" }

local encoded = json.encode({alpha = 1, nested = {true, false}})
local decoded = json.decode(encoded)
storage.set("alpha", tostring(decoded.alpha))
storage.set("nested_first", tostring(decoded.nested[1]))

storage.set("b64", base64.encode("binary\1data"))
storage.set("b64_rt", base64.decode(base64.encode("round trip")))
"#,
    )
    .unwrap();

    assert_eq!(
        store.get_plugin_storage(info.id, "alpha").unwrap().as_deref(),
        Some(b"1".as_slice())
    );
    assert_eq!(
        store.get_plugin_storage(info.id, "nested_first").unwrap().as_deref(),
        Some(b"true".as_slice())
    );
    assert_eq!(
        store.get_plugin_storage(info.id, "b64_rt").unwrap().as_deref(),
        Some(b"round trip".as_slice())
    );
}

#[test]
fn test_cancel_token_aborts_busy_loop() {
    let sandbox = Sandbox::new(1).unwrap();
    sandbox
        .load_source("function spin() while true do end end")
        .unwrap();

    // Fire the token first; the instruction hook aborts the call almost
    // immediately instead of waiting out the 30s deadline
    sandbox.cancel_token().store(true, std::sync::atomic::Ordering::SeqCst);
    let err = sandbox.call_handler("spin", None).unwrap_err();
    assert!(matches!(err, crate::error::MahPastesError::Timeout(_)));
}

#[test]
fn test_load_failure_on_malicious_top_level_call() {
    let (store, bus) = test_store();
    let (manager, _dir) = test_manager(&store, &bus);

    // The manifest parses (no execution), but loading fails because os is
    // not available inside the sandbox. Nothing outside the sandbox runs.
    let result = install_plugin(
        &manager,
        "malicious.lua",
        r#"os.execute("rm -rf /")

Plugin = { name = "Innocent" }
"#,
    );
    assert!(result.is_err());
    let _ = store;
}
