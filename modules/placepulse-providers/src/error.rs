use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProviderError>;

/// Typed provider failures. Callers branch on these: a `NotFound` is an
/// ambiguous empty (the provider may simply lack coverage), a `Transport`
/// or `Timeout` is no evidence of absence at all.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("No data for this query")]
    NotFound,

    #[error("Network error: {0}")]
    Transport(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Rate limited by provider")]
    RateLimited,

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Provider not configured: {0}")]
    Config(String),
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout
        } else {
            ProviderError::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(err: serde_json::Error) -> Self {
        ProviderError::Parse(err.to_string())
    }
}

impl ProviderError {
    /// Map a non-2xx HTTP status to the right variant.
    pub fn from_status(status: u16, message: String) -> Self {
        match status {
            404 => ProviderError::NotFound,
            429 => ProviderError::RateLimited,
            _ => ProviderError::Api { status, message },
        }
    }
}
