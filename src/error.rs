use std::sync::Arc;

/// Result type used throughout the crate, with [`Error`] as the error variant.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by SDK components.
///
/// Flag evaluation itself never returns this type: evaluation failures are data, carried in the
/// evaluation reason so that the caller always receives a value.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// Invalid base, stream, or events URI configuration.
    #[error("invalid service URI configuration")]
    InvalidUri(#[source] url::ParseError),

    /// The request was unauthorized; the SDK key is likely invalid.
    #[error("unauthorized, sdk_key is likely invalid")]
    Unauthorized,

    /// The service answered with a status that permanently disables the subsystem
    /// that received it (401, 403, 404, 410).
    #[error("received HTTP status {0}, giving up permanently")]
    UnrecoverableHttpStatus(u16),

    /// A background thread panicked. This should normally never happen.
    #[error("background thread panicked")]
    BackgroundThreadPanicked,

    /// The client was closed while an operation was in progress.
    #[error("client has been closed")]
    Closed,

    /// A data store driver failed.
    #[error("data store error: {0}")]
    DataStore(String),

    /// An I/O error.
    #[error(transparent)]
    // std::io::Error is not clonable, so we wrap it in an Arc.
    Io(Arc<std::io::Error>),

    /// Network error.
    #[error(transparent)]
    Network(Arc<reqwest::Error>),
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Network(Arc::new(value.without_url()))
    }
}

impl From<url::ParseError> for Error {
    fn from(value: url::ParseError) -> Self {
        Error::InvalidUri(value)
    }
}
