// mahpastes constants
// Limits and fixed tables shared across the store, watcher, plugin host and
// backup code. Do not change values that are part of the backup format.

/// Environment variable that overrides the platform data directory.
pub const DATA_DIR_ENV: &str = "MAHPASTES_DATA_DIR";
pub const APP_FOLDER: &str = "mahpastes";
pub const DB_FILENAME: &str = "clips.db";
pub const TEMP_FILES_FOLDER: &str = "clip_temp_files";
pub const PLUGINS_FOLDER: &str = "plugins";

// Clip limits
pub const MAX_CLIP_DATA_SIZE: usize = 10 * 1024 * 1024; // 10 MiB
pub const CLIP_PREVIEW_BYTES: usize = 500;
pub const CLIP_LIST_LIMIT: i64 = 50;

// Tags
pub const MAX_TAG_NAME_LENGTH: usize = 50;

/// Tag color palette. Assignment is palette[count(tags) % len] inside the
/// creating transaction.
pub const TAG_COLORS: [&str; 8] = [
    "#78716C", // stone
    "#EF4444", // red
    "#F59E0B", // amber
    "#22C55E", // green
    "#3B82F6", // blue
    "#8B5CF6", // violet
    "#EC4899", // pink
    "#06B6D4", // cyan
];

// Watcher
pub const WATCH_DEBOUNCE_MS: u64 = 500;

pub const PRESET_IMAGE_EXTENSIONS: [&str; 9] = [
    ".jpg", ".jpeg", ".png", ".gif", ".webp", ".heic", ".bmp", ".tiff", ".svg",
];
pub const PRESET_DOCUMENT_EXTENSIONS: [&str; 9] = [
    ".pdf", ".doc", ".docx", ".txt", ".md", ".rtf", ".odt", ".xls", ".xlsx",
];
pub const PRESET_VIDEO_EXTENSIONS: [&str; 7] = [
    ".mp4", ".mov", ".avi", ".mkv", ".webm", ".m4v", ".wmv",
];

// Plugin sandbox
pub const MAX_EXECUTION_TIME_SECS: u64 = 30;
pub const MAX_SANDBOX_MEMORY: usize = 50 * 1024 * 1024; // 50 MiB
pub const MAX_CONSECUTIVE_ERRORS: i64 = 3;
/// Lua instruction count between deadline checks.
pub const SANDBOX_HOOK_INSTRUCTIONS: u32 = 4096;

// Plugin host API limits
pub const HTTP_REQUESTS_PER_MINUTE: u32 = 100;
pub const HTTP_TIMEOUT_SECS: u64 = 30;
pub const HTTP_MAX_REDIRECTS: usize = 10;
pub const HTTP_MAX_RESPONSE_SIZE: usize = 10 * 1024 * 1024;
pub const URL_FETCH_TIMEOUT_SECS: u64 = 60;
pub const URL_FETCH_MAX_REDIRECTS: usize = 5;
pub const FS_OPERATIONS_PER_MINUTE: u32 = 50;
pub const MAX_READ_FILE_SIZE: u64 = 50 * 1024 * 1024;
pub const TOASTS_PER_MINUTE: u32 = 5;
pub const MAX_TOAST_MESSAGE_LENGTH: usize = 200;
pub const MAX_CONTENT_TYPE_LENGTH: usize = 256;

// Expiry sweeper
pub const CLEANUP_INTERVAL_SECS: u64 = 60;

// Backup format
pub const BACKUP_FORMAT_VERSION: u32 = 1;
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Settings whose key contains one of these (case-insensitive) are never
/// written into a backup.
pub const SENSITIVE_SETTING_PATTERNS: [&str; 4] = ["api_key", "secret", "password", "token"];

/// Reserved settings key acting as the watcher kill-switch.
pub const GLOBAL_WATCH_PAUSED_KEY: &str = "global_watch_paused";

/// Settings key holding the remote image-transform credential.
pub const FAL_API_KEY_SETTING: &str = "fal_api_key";

/// Map a lowercase file extension (with leading dot) to a MIME type for
/// watcher ingestion. Unknown extensions fall back to octet-stream and rely
/// on content sniffing in the store.
pub fn mime_type_for_extension(ext: &str) -> &'static str {
    match ext {
        ".jpg" | ".jpeg" => "image/jpeg",
        ".png" => "image/png",
        ".gif" => "image/gif",
        ".webp" => "image/webp",
        ".heic" => "image/heic",
        ".bmp" => "image/bmp",
        ".tiff" => "image/tiff",
        ".svg" => "image/svg+xml",
        ".pdf" => "application/pdf",
        ".doc" => "application/msword",
        ".docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        ".txt" => "text/plain",
        ".md" => "text/markdown",
        ".rtf" => "application/rtf",
        ".odt" => "application/vnd.oasis.opendocument.text",
        ".xls" => "application/vnd.ms-excel",
        ".xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        ".mp4" => "video/mp4",
        ".mov" => "video/quicktime",
        ".avi" => "video/x-msvideo",
        ".mkv" => "video/x-matroska",
        ".webm" => "video/webm",
        ".m4v" => "video/x-m4v",
        ".wmv" => "video/x-ms-wmv",
        ".json" => "application/json",
        ".html" | ".htm" => "text/html",
        ".csv" => "text/csv",
        ".zip" => "application/zip",
        _ => "application/octet-stream",
    }
}

/// Best-effort file extension for a MIME type, used when materializing
/// clips without a stored filename.
pub fn extension_for_mime(content_type: &str) -> &'static str {
    match content_type {
        "image/jpeg" => ".jpg",
        "image/png" => ".png",
        "image/gif" => ".gif",
        "image/webp" => ".webp",
        "image/bmp" => ".bmp",
        "image/tiff" => ".tiff",
        "image/svg+xml" => ".svg",
        "application/pdf" => ".pdf",
        "application/json" => ".json",
        "text/plain" => ".txt",
        "text/html" => ".html",
        "text/markdown" => ".md",
        "text/csv" => ".csv",
        "video/mp4" => ".mp4",
        "video/quicktime" => ".mov",
        "video/webm" => ".webm",
        "application/zip" => ".zip",
        _ => "",
    }
}

/// Extensions for a named preset, or None for an unknown preset key.
pub fn preset_extensions(preset: &str) -> Option<&'static [&'static str]> {
    match preset {
        "images" => Some(&PRESET_IMAGE_EXTENSIONS),
        "documents" => Some(&PRESET_DOCUMENT_EXTENSIONS),
        "videos" => Some(&PRESET_VIDEO_EXTENSIONS),
        _ => None,
    }
}

/// True when a content type is rendered as text (raw string at the API
/// boundary, text preview in listings).
pub fn is_textual_content_type(content_type: &str) -> bool {
    content_type.starts_with("text/") || content_type == "application/json"
}
