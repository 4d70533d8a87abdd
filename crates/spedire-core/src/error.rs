//! Error types shared across the workspace.

use thiserror::Error;

/// Result alias used by stores, admin operations and config loading.
pub type Result<T> = std::result::Result<T, SpedireError>;

/// Top-level error for the automation engine.
#[derive(Debug, Error)]
pub enum SpedireError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Handler error: {0}")]
    Handler(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(String),
}

impl SpedireError {
    /// Short machine-readable kind, used in API responses.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Database(_) => "database",
            Self::NotFound(_) => "not_found",
            Self::Lock(_) => "lock",
            Self::Handler(_) => "handler",
            Self::InvalidInput(_) => "invalid_input",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
            Self::Toml(_) => "toml",
        }
    }
}
