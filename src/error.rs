use std::sync::Arc;

/// Result type used throughout the SDK.
///
/// This is a standard Rust `Result` where the error variant is the flagwire-specific [`Error`]
/// enum.
pub type Result<T> = std::result::Result<T, Error>;

/// Enum representing possible errors that can occur in the SDK.
///
/// `Error` is `Clone` because a single failure may need to be delivered to multiple waiters
/// (coalesced cohort requests share one in-flight future). Non-clonable sources are wrapped in
/// `Arc`.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// Invalid server URL configuration.
    #[error("invalid server url configuration")]
    InvalidUrl(#[source] url::ParseError),

    /// The request was unauthorized, possibly due to an invalid API key.
    #[error("unauthorized, api key is likely invalid")]
    Unauthorized,

    /// The server returned a non-success status code.
    #[error("request failed with status {status}")]
    RequestFailed {
        /// HTTP status code returned by the server.
        status: u16,
    },

    /// The requested cohort exceeds the configured maximum size. This error is not retriable.
    #[error("cohort {cohort_id} exceeds the maximum cohort size {max_size}")]
    CohortTooLarge {
        /// Id of the cohort that was requested.
        cohort_id: String,
        /// Configured maximum cohort size.
        max_size: usize,
    },

    /// The streaming connection failed or delivered an invalid payload.
    #[error("stream error: {0}")]
    Stream(String),

    /// Timed out waiting for the streaming connection to deliver data.
    #[error("timed out waiting for stream data")]
    StreamTimeout,

    /// Failed to parse a server response.
    #[error("failed to parse server response")]
    // serde_json::Error is not clonable, so we're wrapping it in an Arc.
    Parse(#[source] Arc<serde_json::Error>),

    /// Network error.
    #[error(transparent)]
    Network(Arc<reqwest::Error>),

    /// An I/O error.
    #[error(transparent)]
    Io(Arc<std::io::Error>),
}

impl Error {
    /// Whether the operation that produced this error may be retried.
    ///
    /// Authorization failures, oversized cohorts, and other client-side errors are permanent;
    /// network failures, timeouts, and 5xx/429 responses are transient.
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::Unauthorized | Error::CohortTooLarge { .. } | Error::InvalidUrl(_) => false,
            Error::RequestFailed { status } => *status >= 500 || *status == 429,
            _ => true,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::Io(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Network(Arc::new(value.without_url()))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::Parse(Arc::new(value))
    }
}

impl From<url::ParseError> for Error {
    fn from(value: url::ParseError) -> Self {
        Error::InvalidUrl(value)
    }
}
