use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Lookup error: {0}")]
    Lookup(#[from] LookupError),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Discovery has been shut down")]
    Shutdown,
}

/// Failure talking to the service registry. Always retried by the watcher.
#[derive(Error, Debug, Clone)]
pub enum RegistryError {
    #[error("Registry unavailable: {0}")]
    Unavailable(String),

    #[error("Registry request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Unexpected registry response: {0}")]
    InvalidResponse(String),
}

/// Failure resolving a hostname. Never surfaced as an empty endpoint set
/// while a previous answer is cached.
#[derive(Error, Debug, Clone)]
pub enum LookupError {
    #[error("Lookup of {host} timed out after {timeout:?}")]
    Timeout { host: String, timeout: Duration },

    #[error("Lookup of {host} failed: {reason}")]
    Failed { host: String, reason: String },
}

/// Failure delivering a snapshot diff downstream.
#[derive(Error, Debug, Clone)]
pub enum PushError {
    #[error("Push rejected with status {0}")]
    Rejected(u16),

    #[error("Push transport error: {0}")]
    Transport(String),
}
