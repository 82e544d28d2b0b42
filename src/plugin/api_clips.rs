// Plugin clips API
// CRUD over the content store plus URL ingestion. create_from_url is gated
// by the manifest network allowlist (GET on the target host) on top of the
// store's size caps.

use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use mlua::Lua;
use regex::Regex;
use reqwest::redirect;

use crate::constants::{
    is_textual_content_type, MAX_CLIP_DATA_SIZE, MAX_CONTENT_TYPE_LENGTH, URL_FETCH_MAX_REDIRECTS,
    URL_FETCH_TIMEOUT_SECS,
};
use crate::db::store::Store;

/// Standard MIME shape; anything else is replaced with octet-stream.
fn valid_mime_regex() -> &'static Regex {
    use std::sync::OnceLock;
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9!#$&\-^_.+]*/[a-zA-Z0-9][a-zA-Z0-9!#$&\-^_.+]*$")
            .unwrap()
    })
}

pub(crate) fn validate_content_type(content_type: &str) -> String {
    if content_type.len() > MAX_CONTENT_TYPE_LENGTH || !valid_mime_regex().is_match(content_type) {
        return "application/octet-stream".to_string();
    }
    content_type.to_string()
}

/// Check that the plugin may GET the given URL's host.
fn check_url_domain(
    allowed_domains: &HashMap<String, Vec<String>>,
    url: &str,
) -> Result<(), String> {
    let parsed = reqwest::Url::parse(url).map_err(|e| format!("invalid URL: {}", e))?;
    let domain = parsed.host_str().unwrap_or_default();

    if allowed_domains.is_empty() {
        return Err(format!(
            "no network permissions: plugin must declare network permissions to fetch URLs (domain: {})",
            domain
        ));
    }

    let allowed_methods = allowed_domains
        .get(domain)
        .ok_or_else(|| format!("domain not in allowlist: {}", domain))?;

    if !allowed_methods.iter().any(|m| m.eq_ignore_ascii_case("GET")) {
        return Err(format!(
            "GET not allowed for domain {} (allowed: [{}])",
            domain,
            allowed_methods.join(", ")
        ));
    }
    Ok(())
}

fn fetch_url(
    allowed_domains: &HashMap<String, Vec<String>>,
    url: &str,
) -> Result<(Vec<u8>, String), String> {
    // Per-hop redirect validation against the same allowlist
    let redirect_domains = allowed_domains.clone();
    let policy = redirect::Policy::custom(move |attempt| {
        if attempt.previous().len() >= URL_FETCH_MAX_REDIRECTS {
            return attempt.error("too many redirects");
        }
        let domain = attempt.url().host_str().unwrap_or_default().to_string();
        if !redirect_domains.contains_key(&domain) {
            return attempt.error(format!("redirect to unauthorized domain: {}", domain));
        }
        attempt.follow()
    });

    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(URL_FETCH_TIMEOUT_SECS))
        .redirect(policy)
        .build()
        .map_err(|e| e.to_string())?;

    let response = client
        .get(url)
        .send()
        .map_err(|e| format!("failed to fetch URL: {}", e))?;

    let status = response.status();
    if status != reqwest::StatusCode::OK {
        return Err(format!("HTTP error: {}", status));
    }

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.split(';').next().unwrap_or("").trim().to_string())
        .filter(|ct| !ct.is_empty())
        .unwrap_or_else(|| "application/octet-stream".to_string());

    let mut data = Vec::new();
    response
        .take(MAX_CLIP_DATA_SIZE as u64 + 1)
        .read_to_end(&mut data)
        .map_err(|e| format!("failed to read response: {}", e))?;
    if data.len() > MAX_CLIP_DATA_SIZE {
        return Err(format!(
            "response too large: exceeds {} bytes",
            MAX_CLIP_DATA_SIZE
        ));
    }

    Ok((data, content_type))
}

fn filename_from_url(url: &str) -> String {
    let base = url
        .split('?')
        .next()
        .unwrap_or(url)
        .rsplit('/')
        .next()
        .unwrap_or("")
        .to_string();
    if base.is_empty() || base.contains(':') {
        "downloaded".to_string()
    } else {
        base
    }
}

pub fn register(
    lua: &Lua,
    store: Arc<Store>,
    allowed_domains: HashMap<String, Vec<String>>,
) -> mlua::Result<()> {
    let clips_mod = lua.create_table()?;

    let list_store = Arc::clone(&store);
    clips_mod.set(
        "list",
        lua.create_function(move |lua, filter: Option<mlua::Table>| {
            let mut content_type = None;
            let mut limit: i64 = 100;
            let mut offset: i64 = 0;
            if let Some(filter) = filter {
                if let Ok(ct) = filter.get::<_, String>("content_type") {
                    content_type = Some(ct);
                }
                if let Ok(l) = filter.get::<_, i64>("limit") {
                    limit = l.clamp(1, 1000);
                }
                if let Ok(o) = filter.get::<_, i64>("offset") {
                    offset = o.max(0);
                }
            }

            match list_store.list_clip_meta(content_type.as_deref(), limit, offset) {
                Ok(clips) => {
                    let result = lua.create_table()?;
                    for (i, clip) in clips.iter().enumerate() {
                        let item = lua.create_table()?;
                        item.set("id", clip.id)?;
                        item.set("content_type", clip.content_type.as_str())?;
                        item.set("filename", clip.filename.as_str())?;
                        item.set("created_at", clip.created_at.as_str())?;
                        item.set("is_archived", clip.is_archived)?;
                        result.set(i + 1, item)?;
                    }
                    Ok((Some(result), None))
                }
                Err(e) => Ok((None, Some(e.to_string()))),
            }
        })?,
    )?;

    let get_store = Arc::clone(&store);
    clips_mod.set(
        "get",
        lua.create_function(move |lua, id: i64| {
            let row = match get_store.get_clip_raw(id) {
                Ok(row) => row,
                Err(crate::error::MahPastesError::ClipNotFound(_)) => return Ok((None, None)),
                Err(e) => return Ok((None, Some(e.to_string()))),
            };

            let clip = lua.create_table()?;
            clip.set("id", row.id)?;
            clip.set("content_type", row.content_type.as_str())?;
            clip.set("filename", row.filename.as_deref().unwrap_or_default())?;
            clip.set("created_at", row.created_at.as_str())?;
            clip.set("is_archived", row.is_archived)?;
            if is_textual_content_type(&row.content_type) {
                clip.set("data", lua.create_string(&row.data)?)?;
            } else {
                clip.set("data", BASE64.encode(&row.data))?;
                clip.set("data_encoding", "base64")?;
            }
            Ok((Some(clip), None))
        })?,
    )?;

    let get_data_store = Arc::clone(&store);
    clips_mod.set(
        "get_data",
        lua.create_function(move |lua, id: i64| {
            // Returns (data, mime_type) or (nil, error)
            let row = match get_data_store.get_clip_raw(id) {
                Ok(row) => row,
                Err(crate::error::MahPastesError::ClipNotFound(_)) => {
                    return Ok((
                        mlua::Value::Nil,
                        mlua::Value::String(lua.create_string("clip not found")?),
                    ));
                }
                Err(e) => {
                    return Ok((
                        mlua::Value::Nil,
                        mlua::Value::String(lua.create_string(&e.to_string())?),
                    ));
                }
            };

            let data = if is_textual_content_type(&row.content_type) {
                lua.create_string(&row.data)?
            } else {
                lua.create_string(&BASE64.encode(&row.data))?
            };
            Ok((
                mlua::Value::String(data),
                mlua::Value::String(lua.create_string(&row.content_type)?),
            ))
        })?,
    )?;

    let create_store = Arc::clone(&store);
    clips_mod.set(
        "create",
        lua.create_function(move |lua, opts: mlua::Table| {
            let data_str: String = match opts.get("data") {
                Ok(d) => d,
                Err(_) => return Ok((None, Some("data is required".to_string()))),
            };
            if data_str.len() > MAX_CLIP_DATA_SIZE {
                return Ok((
                    None,
                    Some(format!(
                        "data too large: {} bytes (max {})",
                        data_str.len(),
                        MAX_CLIP_DATA_SIZE
                    )),
                ));
            }

            // content_type and mime_type are both accepted
            let content_type: String = opts
                .get("content_type")
                .or_else(|_| opts.get("mime_type"))
                .unwrap_or_else(|_| "application/octet-stream".to_string());
            let content_type = validate_content_type(&content_type);

            let filename: Option<String> =
                opts.get("filename").or_else(|_| opts.get("name")).ok();

            // Explicit encoding flag, or assumed base64 for binary types
            let is_base64 = opts
                .get::<_, String>("data_encoding")
                .map(|e| e == "base64")
                .unwrap_or_else(|_| !is_textual_content_type(&content_type));

            let data = if is_base64 {
                match BASE64.decode(&data_str) {
                    Ok(decoded) => {
                        if decoded.len() > MAX_CLIP_DATA_SIZE {
                            return Ok((
                                None,
                                Some(format!(
                                    "decoded data too large: {} bytes (max {})",
                                    decoded.len(),
                                    MAX_CLIP_DATA_SIZE
                                )),
                            ));
                        }
                        decoded
                    }
                    Err(e) => {
                        return Ok((None, Some(format!("invalid base64 data: {}", e))));
                    }
                }
            } else {
                data_str.into_bytes()
            };

            match create_store.insert_clip(&content_type, data, filename.as_deref(), None) {
                Ok(id) => {
                    let clip = lua.create_table()?;
                    clip.set("id", id)?;
                    Ok((Some(clip), None))
                }
                Err(e) => Ok((None, Some(e.to_string()))),
            }
        })?,
    )?;

    let url_store = Arc::clone(&store);
    let url_domains = allowed_domains;
    clips_mod.set(
        "create_from_url",
        lua.create_function(move |lua, (url, opts): (String, Option<mlua::Table>)| {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Ok((
                    None,
                    Some("only http:// and https:// URLs are allowed".to_string()),
                ));
            }
            if let Err(e) = check_url_domain(&url_domains, &url) {
                return Ok((None, Some(e)));
            }

            let (data, mut content_type) = match fetch_url(&url_domains, &url) {
                Ok(fetched) => fetched,
                Err(e) => return Ok((None, Some(e))),
            };

            let mut filename = String::new();
            if let Some(opts) = &opts {
                if let Ok(ct) = opts
                    .get::<_, String>("mime_type")
                    .or_else(|_| opts.get("content_type"))
                {
                    content_type = ct;
                }
                if let Ok(name) = opts
                    .get::<_, String>("name")
                    .or_else(|_| opts.get("filename"))
                {
                    filename = name;
                }
            }
            let content_type = validate_content_type(&content_type);
            if filename.is_empty() {
                filename = filename_from_url(&url);
            }

            match url_store.insert_clip(&content_type, data, Some(&filename), None) {
                Ok(id) => {
                    let clip = lua.create_table()?;
                    clip.set("id", id)?;
                    Ok((Some(clip), None))
                }
                Err(e) => Ok((None, Some(e.to_string()))),
            }
        })?,
    )?;

    let update_store = Arc::clone(&store);
    clips_mod.set(
        "update",
        lua.create_function(move |_, (id, opts): (i64, mlua::Table)| {
            // Only the archive flag is mutable through this API
            if let Ok(archived) = opts.get::<_, bool>("is_archived") {
                if let Err(e) = update_store.set_archived(id, archived) {
                    return Ok((false, Some(e.to_string())));
                }
            }
            Ok((true, None))
        })?,
    )?;

    let delete_store = Arc::clone(&store);
    clips_mod.set(
        "delete",
        lua.create_function(move |_, id: i64| match delete_store.delete_clip(id) {
            Ok(()) => Ok((true, None)),
            Err(e) => Ok((false, Some(e.to_string()))),
        })?,
    )?;

    let delete_many_store = Arc::clone(&store);
    clips_mod.set(
        "delete_many",
        lua.create_function(move |_, ids: mlua::Table| {
            let mut id_list = Vec::new();
            for value in ids.sequence_values::<i64>() {
                if let Ok(id) = value {
                    id_list.push(id);
                }
            }
            match delete_many_store.bulk_delete(&id_list) {
                Ok(()) => Ok((true, None)),
                Err(e) => Ok((false, Some(e.to_string()))),
            }
        })?,
    )?;

    let archive_store = Arc::clone(&store);
    clips_mod.set(
        "archive",
        lua.create_function(move |_, id: i64| match archive_store.set_archived(id, true) {
            Ok(()) => Ok((true, None)),
            Err(e) => Ok((false, Some(e.to_string()))),
        })?,
    )?;

    let unarchive_store = store;
    clips_mod.set(
        "unarchive",
        lua.create_function(move |_, id: i64| {
            match unarchive_store.set_archived(id, false) {
                Ok(()) => Ok((true, None)),
                Err(e) => Ok((false, Some(e.to_string()))),
            }
        })?,
    )?;

    lua.globals().set("clips", clips_mod)?;
    Ok(())
}
