use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum LdmError {
    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("required tool not found: {0}")]
    #[diagnostic(help(
        "install the WebDriver binary (for example geckodriver together with Firefox) and make sure it is on PATH, or set driver_command in ldm-snapshot.json"
    ))]
    MissingTool(String),

    #[error("browser driver failed to start on port {port}: {message}")]
    #[diagnostic(help(
        "another process may already be bound to this port; pass --port with a free port, or stop the stale driver process"
    ))]
    DriverStartup { port: u16, message: String },

    #[error("webdriver command failed ({error}): {message}")]
    WebDriver { error: String, message: String },

    #[error("page element not found: {0}")]
    ElementNotFound(String),

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("HTTP status {status} for {url}")]
    HttpStatus { status: u16, url: String },

    #[error("download of {url} failed after {attempts} attempt(s)")]
    Download { url: String, attempts: u32 },

    #[error("snapshot acquisition failed: {0}")]
    Acquisition(String),

    #[error("archive error: {0}")]
    Archive(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("failed to load profile collection: {0}")]
    Load(String),

    #[error("cache I/O failed: {0}")]
    Cache(String),

    #[error("manifest error: {0}")]
    Manifest(String),
}

impl From<rusqlite::Error> for LdmError {
    fn from(err: rusqlite::Error) -> Self {
        LdmError::Database(err.to_string())
    }
}
