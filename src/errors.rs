use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LauncherError {
    #[error("Invalid URL: {0}")]
    Validation(String),
    #[error("Metadata fetch failed: {0}")]
    Fetch(String),
    #[error("Download failed: {message}")]
    Download {
        message: String,
        #[source]
        source: Option<Box<LauncherError>>,
    },
    #[error("Launch failed: {0}")]
    Launch(String),
    #[error("Cancelled")]
    Cancelled,
    #[error("Cleanup failed: {0}")]
    Cleanup(String),
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Config error: {0}")]
    Config(String),
    #[error("Not found: {0}")]
    NotFound(String),
}

impl LauncherError {
    /// Stable kind label recorded into a task's error field.
    pub fn kind(&self) -> &'static str {
        match self {
            LauncherError::Validation(_) => "Validation",
            LauncherError::Fetch(_) => "Fetch",
            LauncherError::Download { .. } => "Download",
            LauncherError::Launch(_) => "Launch",
            LauncherError::Cancelled => "Cancelled",
            LauncherError::Cleanup(_) => "Cleanup",
            LauncherError::Network(_) => "Network",
            LauncherError::Io(_) => "Io",
            LauncherError::Serde(_) => "Serde",
            LauncherError::Config(_) => "Config",
            LauncherError::NotFound(_) => "NotFound",
        }
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            LauncherError::Cancelled => true,
            LauncherError::Download { source: Some(cause), .. } => cause.is_cancelled(),
            _ => false,
        }
    }

    pub fn download(message: impl Into<String>, source: LauncherError) -> Self {
        LauncherError::Download {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

pub type Result<T> = std::result::Result<T, LauncherError>;
