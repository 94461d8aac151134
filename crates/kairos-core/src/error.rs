use thiserror::Error;

#[derive(Debug, Error)]
pub enum KairosError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown timezone: {0}")]
    InvalidTimezone(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl KairosError {
    /// Short, stable error code for logs and API layers.
    pub fn code(&self) -> &'static str {
        match self {
            KairosError::Config(_) => "CONFIG_ERROR",
            KairosError::InvalidTimezone(_) => "INVALID_TIMEZONE",
            KairosError::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, KairosError>;
