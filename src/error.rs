use thiserror::Error;

/// Failures surfaced by the sync core.
///
/// A missing worksheet is not an error; it is reported as
/// [`crate::sheets::SheetSnapshot::NotFound`].
#[derive(Debug, Error)]
pub enum SyncError {
    /// Missing credential, unusable config value, or missing lookback window.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The interactive OAuth flow did not complete before the deadline.
    #[error("timed out after {seconds}s waiting for {provider} authorization")]
    AuthorizationTimeout { provider: String, seconds: u64 },

    /// No usable token and the session is not allowed to prompt.
    #[error("{provider} authorization required but interactive login is disabled")]
    AuthorizationRequired { provider: String },

    #[error("{provider} token refresh failed: {message}")]
    TokenRefresh { provider: String, message: String },

    /// Any other provider failure; the upstream message is kept verbatim.
    #[error("{provider} API error: {message}")]
    Upstream { provider: String, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl SyncError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn upstream(provider: &str, message: impl Into<String>) -> Self {
        Self::Upstream {
            provider: provider.to_string(),
            message: message.into(),
        }
    }

    pub fn token_refresh(provider: &str, message: impl Into<String>) -> Self {
        Self::TokenRefresh {
            provider: provider.to_string(),
            message: message.into(),
        }
    }

    /// Timeouts are reported separately by the serverless entry point.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::AuthorizationTimeout { .. })
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
