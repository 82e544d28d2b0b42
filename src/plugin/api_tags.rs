// Plugin tags API

use std::sync::Arc;

use mlua::Lua;

use crate::db::schema::Tag;
use crate::db::store::Store;

fn tag_to_table<'lua>(lua: &'lua Lua, tag: &Tag) -> mlua::Result<mlua::Table<'lua>> {
    let table = lua.create_table()?;
    table.set("id", tag.id)?;
    table.set("name", tag.name.as_str())?;
    table.set("color", tag.color.as_str())?;
    table.set("count", tag.count)?;
    Ok(table)
}

pub fn register(lua: &Lua, store: Arc<Store>) -> mlua::Result<()> {
    let tags_mod = lua.create_table()?;

    let list_store = Arc::clone(&store);
    tags_mod.set(
        "list",
        lua.create_function(move |lua, ()| match list_store.list_tags() {
            Ok(tags) => {
                let result = lua.create_table()?;
                for (i, tag) in tags.iter().enumerate() {
                    result.set(i + 1, tag_to_table(lua, tag)?)?;
                }
                Ok((Some(result), None))
            }
            Err(e) => Ok((None, Some(e.to_string()))),
        })?,
    )?;

    let get_store = Arc::clone(&store);
    tags_mod.set(
        "get",
        lua.create_function(move |lua, id: i64| match get_store.get_tag(id) {
            Ok(Some(tag)) => Ok((Some(tag_to_table(lua, &tag)?), None)),
            Ok(None) => Ok((None, None)),
            Err(e) => Ok((None, Some(e.to_string()))),
        })?,
    )?;

    let create_store = Arc::clone(&store);
    tags_mod.set(
        "create",
        lua.create_function(move |lua, name: String| match create_store.create_tag(&name) {
            Ok(tag) => Ok((Some(tag_to_table(lua, &tag)?), None)),
            Err(e) => Ok((None, Some(e.to_string()))),
        })?,
    )?;

    let update_store = Arc::clone(&store);
    tags_mod.set(
        "update",
        lua.create_function(move |_, (id, opts): (i64, mlua::Table)| {
            let name: Option<String> = opts.get("name").ok();
            let color: Option<String> = opts.get("color").ok();
            match update_store.update_tag(id, name.as_deref(), color.as_deref()) {
                Ok(()) => Ok((true, None)),
                Err(e) => Ok((false, Some(e.to_string()))),
            }
        })?,
    )?;

    let delete_store = Arc::clone(&store);
    tags_mod.set(
        "delete",
        lua.create_function(move |_, id: i64| match delete_store.delete_tag(id) {
            Ok(()) => Ok((true, None)),
            Err(e) => Ok((false, Some(e.to_string()))),
        })?,
    )?;

    let add_store = Arc::clone(&store);
    tags_mod.set(
        "add_to_clip",
        lua.create_function(move |_, (tag_id, clip_id): (i64, i64)| {
            match add_store.add_tag_to_clip(tag_id, clip_id) {
                Ok(()) => Ok((true, None)),
                Err(e) => Ok((false, Some(e.to_string()))),
            }
        })?,
    )?;

    let remove_store = Arc::clone(&store);
    tags_mod.set(
        "remove_from_clip",
        lua.create_function(move |_, (tag_id, clip_id): (i64, i64)| {
            match remove_store.remove_tag_from_clip(tag_id, clip_id) {
                Ok(()) => Ok((true, None)),
                Err(e) => Ok((false, Some(e.to_string()))),
            }
        })?,
    )?;

    let for_clip_store = store;
    tags_mod.set(
        "get_for_clip",
        lua.create_function(move |lua, clip_id: i64| {
            match for_clip_store.tags_for_clip(clip_id) {
                Ok(tags) => {
                    let result = lua.create_table()?;
                    for (i, tag) in tags.iter().enumerate() {
                        result.set(i + 1, tag_to_table(lua, tag)?)?;
                    }
                    Ok((Some(result), None))
                }
                Err(e) => Ok((None, Some(e.to_string()))),
            }
        })?,
    )?;

    lua.globals().set("tags", tags_mod)?;
    Ok(())
}
