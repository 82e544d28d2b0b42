// Plugin HTTP API
// Requests are gated by the manifest network allowlist (domain + method),
// rate limited, and size capped. Redirects are re-validated per hop and a
// downgrade to plain HTTP is rejected.

use std::collections::HashMap;
use std::io::Read;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mlua::Lua;
use reqwest::blocking::Client;
use reqwest::redirect;

use super::MinuteWindow;
use crate::constants::{
    HTTP_MAX_REDIRECTS, HTTP_MAX_RESPONSE_SIZE, HTTP_REQUESTS_PER_MINUTE, HTTP_TIMEOUT_SECS,
};

struct HttpApi {
    allowed_domains: HashMap<String, Vec<String>>,
    client: Client,
    window: Mutex<MinuteWindow>,
}

struct HttpResponse {
    status: u16,
    body: Vec<u8>,
    headers: Vec<(String, String)>,
}

impl HttpApi {
    fn new(allowed_domains: HashMap<String, Vec<String>>) -> Result<HttpApi, String> {
        // Redirect validation prevents domain bypass through a compliant
        // first hop
        let redirect_domains = allowed_domains.clone();
        let policy = redirect::Policy::custom(move |attempt| {
            if attempt.previous().len() >= HTTP_MAX_REDIRECTS {
                return attempt.error("too many redirects");
            }
            let url = attempt.url();
            let domain = url.host_str().unwrap_or_default().to_string();
            let scheme = url.scheme().to_string();
            let url_string = url.to_string();
            if !redirect_domains.contains_key(&domain) {
                return attempt.error(format!("redirect to unauthorized domain: {}", domain));
            }
            if scheme != "https" {
                return attempt.error(format!(
                    "redirect to non-HTTPS URL not allowed: {}",
                    url_string
                ));
            }
            attempt.follow()
        });

        let client = Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .redirect(policy)
            .build()
            .map_err(|e| e.to_string())?;

        Ok(HttpApi {
            allowed_domains,
            client,
            window: Mutex::new(MinuteWindow::new(
                HTTP_REQUESTS_PER_MINUTE,
                "requests per minute",
            )),
        })
    }

    /// Validate that the URL's host is allowlisted and the method permitted.
    fn check_domain_permission(&self, url: &str, method: &str) -> Result<(), String> {
        let parsed = reqwest::Url::parse(url).map_err(|e| format!("invalid URL: {}", e))?;
        let domain = parsed.host_str().unwrap_or_default();

        let allowed_methods = self
            .allowed_domains
            .get(domain)
            .ok_or_else(|| format!("domain not in allowlist: {}", domain))?;

        if !allowed_methods.iter().any(|m| m.eq_ignore_ascii_case(method)) {
            return Err(format!(
                "{} not allowed for domain {} (allowed: [{}])",
                method,
                domain,
                allowed_methods.join(", ")
            ));
        }
        Ok(())
    }

    fn request(
        &self,
        method: &str,
        url: &str,
        body: Option<String>,
        headers: Vec<(String, String)>,
    ) -> Result<HttpResponse, String> {
        self.check_domain_permission(url, method)?;
        self.window.lock().unwrap().check()?;

        let method = reqwest::Method::from_bytes(method.as_bytes()).map_err(|e| e.to_string())?;
        let mut request = self.client.request(method, url);
        for (key, value) in headers {
            request = request.header(&key, &value);
        }
        if let Some(body) = body {
            request = request.body(body);
        }

        let response = request.send().map_err(|e| e.to_string())?;
        let status = response.status().as_u16();
        let response_headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .filter_map(|(key, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (key.as_str().to_string(), v.to_string()))
            })
            .collect();

        // Response body capped to prevent memory exhaustion
        let mut body = Vec::new();
        response
            .take(HTTP_MAX_RESPONSE_SIZE as u64)
            .read_to_end(&mut body)
            .map_err(|e| e.to_string())?;

        Ok(HttpResponse {
            status,
            body,
            headers: response_headers,
        })
    }
}

pub fn register(lua: &Lua, allowed_domains: HashMap<String, Vec<String>>) -> mlua::Result<()> {
    let api = Arc::new(HttpApi::new(allowed_domains).map_err(mlua::Error::external)?);
    let http_mod = lua.create_table()?;

    for (lua_name, method) in [
        ("get", "GET"),
        ("post", "POST"),
        ("put", "PUT"),
        ("patch", "PATCH"),
        ("delete", "DELETE"),
    ] {
        let api = Arc::clone(&api);
        http_mod.set(
            lua_name,
            lua.create_function(move |lua, (url, opts): (String, Option<mlua::Table>)| {
                let mut body = None;
                let mut headers = Vec::new();
                if let Some(opts) = opts {
                    if let Ok(b) = opts.get::<_, String>("body") {
                        body = Some(b);
                    }
                    if let Ok(header_table) = opts.get::<_, mlua::Table>("headers") {
                        for pair in header_table.pairs::<String, String>() {
                            if let Ok((key, value)) = pair {
                                headers.push((key, value));
                            }
                        }
                    }
                }

                match api.request(method, &url, body, headers) {
                    Ok(response) => {
                        let result = lua.create_table()?;
                        result.set("status", response.status)?;
                        result.set("body", lua.create_string(&response.body)?)?;
                        let header_table = lua.create_table()?;
                        for (key, value) in response.headers {
                            header_table.set(key, value)?;
                        }
                        result.set("headers", header_table)?;
                        Ok((Some(result), None))
                    }
                    Err(e) => Ok((None, Some(e))),
                }
            })?,
        )?;
    }

    lua.globals().set("http", http_mod)?;
    Ok(())
}
