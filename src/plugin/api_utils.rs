// Plugin utils API: log, json encode/decode, base64 encode/decode

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use mlua::{Lua, LuaSerdeExt};
use serde_json::Value;

pub fn register(lua: &Lua, plugin_name: String) -> mlua::Result<()> {
    let log_name = plugin_name.clone();
    let log_fn = lua.create_function(move |_, msg: String| {
        log::info!("[plugin:{}] {}", log_name, msg);
        Ok(())
    })?;
    lua.globals().set("log", log_fn)?;

    let json_mod = lua.create_table()?;
    json_mod.set(
        "encode",
        lua.create_function(|_, value: mlua::Value| match lua_value_to_json(&value) {
            Ok(json) => match serde_json::to_string(&json) {
                Ok(text) => Ok((Some(text), None)),
                Err(e) => Ok((None, Some(e.to_string()))),
            },
            Err(e) => Ok((None, Some(e))),
        })?,
    )?;
    json_mod.set(
        "decode",
        lua.create_function(|lua, text: String| {
            match serde_json::from_str::<Value>(&text) {
                Ok(json) => Ok((Some(lua.to_value(&json)?), None)),
                Err(e) => Ok((None, Some(e.to_string()))),
            }
        })?,
    )?;
    lua.globals().set("json", json_mod)?;

    let b64_mod = lua.create_table()?;
    b64_mod.set(
        "encode",
        lua.create_function(|_, data: mlua::String| Ok(BASE64.encode(data.as_bytes())))?,
    )?;
    b64_mod.set(
        "decode",
        lua.create_function(|lua, encoded: String| match BASE64.decode(&encoded) {
            Ok(bytes) => Ok((Some(lua.create_string(&bytes)?), None)),
            Err(e) => Ok((None, Some(e.to_string()))),
        })?,
    )?;
    lua.globals().set("base64", b64_mod)?;

    Ok(())
}

/// Convert a Lua value into JSON. Tables with consecutive integer keys from
/// 1 become arrays, everything else becomes an object with stringified keys.
pub(crate) fn lua_value_to_json(value: &mlua::Value) -> Result<Value, String> {
    match value {
        mlua::Value::Nil => Ok(Value::Null),
        mlua::Value::Boolean(b) => Ok(Value::Bool(*b)),
        mlua::Value::Integer(i) => Ok(Value::from(*i)),
        mlua::Value::Number(n) => serde_json::Number::from_f64(*n)
            .map(Value::Number)
            .ok_or_else(|| "cannot encode non-finite number".to_string()),
        mlua::Value::String(s) => Ok(Value::String(s.to_string_lossy().into_owned())),
        mlua::Value::Table(table) => {
            let mut max_index: i64 = 0;
            let mut count: i64 = 0;
            let mut is_array = true;
            for pair in table.clone().pairs::<mlua::Value, mlua::Value>() {
                let (key, _) = pair.map_err(|e| e.to_string())?;
                match key {
                    mlua::Value::Integer(i) if i >= 1 => {
                        max_index = max_index.max(i);
                        count += 1;
                    }
                    _ => {
                        is_array = false;
                        break;
                    }
                }
            }

            if is_array && count > 0 && max_index == count {
                let mut array = Vec::with_capacity(count as usize);
                for i in 1..=max_index {
                    let item: mlua::Value = table.get(i).map_err(|e| e.to_string())?;
                    array.push(lua_value_to_json(&item)?);
                }
                Ok(Value::Array(array))
            } else {
                let mut map = serde_json::Map::new();
                for pair in table.clone().pairs::<mlua::Value, mlua::Value>() {
                    let (key, item) = pair.map_err(|e| e.to_string())?;
                    let key = match key {
                        mlua::Value::String(s) => s.to_string_lossy().into_owned(),
                        mlua::Value::Integer(i) => i.to_string(),
                        mlua::Value::Number(n) => n.to_string(),
                        mlua::Value::Boolean(b) => b.to_string(),
                        _ => return Err("unsupported table key".to_string()),
                    };
                    map.insert(key, lua_value_to_json(&item)?);
                }
                Ok(Value::Object(map))
            }
        }
        _ => Err("unsupported value".to_string()),
    }
}
