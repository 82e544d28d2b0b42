// mahpastes error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MahPastesError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Clip not found: {0}")]
    ClipNotFound(i64),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Resource limit: {0}")]
    ResourceLimit(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("plugin must define a Plugin table")]
    ManifestMissing,

    #[error("Invalid manifest: {0}")]
    ManifestInvalid(String),

    #[error("Plugin error: {0}")]
    Plugin(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Task error: {0}")]
    Task(String),

    #[error("Backup error: {0}")]
    Backup(String),

    #[error("Watcher error: {0}")]
    Watcher(String),

    #[error("{0}")]
    Other(String),
}

impl From<anyhow::Error> for MahPastesError {
    fn from(err: anyhow::Error) -> Self {
        MahPastesError::Other(err.to_string())
    }
}

impl From<mlua::Error> for MahPastesError {
    fn from(err: mlua::Error) -> Self {
        MahPastesError::Plugin(err.to_string())
    }
}

impl From<zip::result::ZipError> for MahPastesError {
    fn from(err: zip::result::ZipError) -> Self {
        MahPastesError::Backup(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MahPastesError>;
