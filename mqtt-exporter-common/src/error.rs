use thiserror::Error;

/// Common error type for the exporter components.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid topic filter '{filter}': {reason}")]
    TopicFilter { filter: String, reason: String },
}

impl Error {
    /// Create a topic filter error.
    pub fn topic_filter(filter: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::TopicFilter {
            filter: filter.into(),
            reason: reason.into(),
        }
    }
}

/// Result type alias using the exporter's Error.
pub type Result<T> = std::result::Result<T, Error>;
