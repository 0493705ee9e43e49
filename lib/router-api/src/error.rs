use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Invalid instance address: {0:?}")]
    InvalidAddress(String),

    #[error("Invalid record: {0}")]
    InvalidRecord(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
