use std::sync::Arc;

/// Represents a result type for fallible operations in this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Enum representing errors raised by I/O-facing parts of the SDK (fetching, data adapters,
/// event delivery).
///
/// Evaluation never returns an `Error`: unknown specs, type mismatches and nested gate cycles
/// surface as a [`Reason`](crate::Reason), a fallback diagnostic event, or a non-matching
/// condition instead.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// Network error.
    #[error(transparent)]
    Network(Arc<reqwest::Error>),

    /// A custom [`Fetcher`](crate::Fetcher) reported a transport failure.
    #[error("transport failure: {0}")]
    Transport(String),

    /// Server responded with a non-success status.
    #[error("unexpected response status: {0}")]
    UnexpectedStatus(u16),

    /// The request was unauthorized, the server secret key is likely invalid.
    #[error("unauthorized, secret key is likely invalid")]
    Unauthorized,

    /// Invalid api URL configuration.
    #[error("invalid api url configuration")]
    InvalidApiUrl(#[source] url::ParseError),

    /// A payload (network response, bootstrap values, data adapter value) could not be parsed.
    #[error("malformed payload")]
    MalformedPayload(#[source] Arc<serde_json::Error>),

    /// A [`DataAdapter`](crate::DataAdapter) failed.
    #[error("data adapter error: {0}")]
    DataAdapter(String),
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Network(Arc::new(value.without_url()))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::MalformedPayload(Arc::new(value))
    }
}
