use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] tether_core::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("No entity JSON provided")]
    EmptyEntity,
    #[error("Entity id cannot be empty")]
    EmptyId,
    #[error("Collection name cannot be empty")]
    EmptyCollection,
    #[error("Invalid JSON for {0}: {1}")]
    InvalidJson(&'static str, String),
    #[error("Entity not found: {0}")]
    NotFound(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error(
        "Backend is not configured. Run `tether config init` or set TETHER_BASE_URL, TETHER_APP_KEY and TETHER_APP_SECRET."
    )]
    NotConfigured,
}
