// Plugin storage API: per-plugin key-value store

use std::sync::Arc;

use mlua::Lua;

use crate::db::store::Store;

pub fn register(lua: &Lua, store: Arc<Store>, plugin_id: i64) -> mlua::Result<()> {
    let storage_mod = lua.create_table()?;

    let get_store = Arc::clone(&store);
    storage_mod.set(
        "get",
        lua.create_function(move |lua, key: String| {
            match get_store.get_plugin_storage(plugin_id, &key) {
                Ok(Some(value)) => Ok(Some(lua.create_string(&value)?)),
                _ => Ok(None),
            }
        })?,
    )?;

    let set_store = Arc::clone(&store);
    storage_mod.set(
        "set",
        lua.create_function(move |_, (key, value): (String, mlua::String)| {
            match set_store.set_plugin_storage(plugin_id, &key, value.as_bytes()) {
                Ok(()) => Ok((true, None)),
                Err(e) => Ok((false, Some(e.to_string()))),
            }
        })?,
    )?;

    let delete_store = store;
    storage_mod.set(
        "delete",
        lua.create_function(move |_, key: String| {
            match delete_store.delete_plugin_storage(plugin_id, &key) {
                Ok(()) => Ok(true),
                Err(_) => Ok(false),
            }
        })?,
    )?;

    lua.globals().set("storage", storage_mod)?;
    Ok(())
}
