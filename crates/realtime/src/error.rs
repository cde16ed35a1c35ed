use thiserror::Error;

/// Errors raised by feeds and store adapters.
#[derive(Error, Debug)]
pub enum RealtimeError {
    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("URL parse error: {0}")]
    UrlParseError(#[from] url::ParseError),

    #[error("JSON serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("API error ({status}): {message}")]
    ApiError { status: u16, message: String },

    #[error("Feed '{0}' is already attached")]
    AlreadyAttached(String),

    #[error("Path error: {0}")]
    PathError(String),

    #[error("Subscription error: {0}")]
    SubscriptionError(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Store error: {0}")]
    StoreError(String),
}

impl RealtimeError {
    pub fn new(message: String) -> Self {
        Self::StoreError(message)
    }
}
