use hyper::StatusCode;
use thiserror::Error;

/// Result type alias for relay operations
pub type Result<T, E = RelayError> = std::result::Result<T, E>;

/// Errors that can occur during relay operations
#[derive(Error, Debug)]
pub enum RelayError {
    /// Invalid input at construction; fatal at startup.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Missing or malformed credential on a request.
    #[error("no valid token found")]
    NoCredential,

    /// Credential has a valid shape but no environment owns it.
    #[error("relay is not configured for the requested environment")]
    UnknownEnvironment,

    /// A feature (e.g. event forwarding) is disabled for the environment.
    #[error("{0}")]
    ServiceUnavailable(String),

    #[error("invalid request: {0}")]
    BadRequest(String),

    #[error("unsupported content type")]
    UnsupportedContentType,

    /// Upstream failure worth retrying (connection error, 5xx, 408, 429).
    #[error("upstream request failed: {0}")]
    UpstreamTransient(String),

    /// Upstream rejection that must not be retried.
    #[error("upstream rejected request with status {0}")]
    UpstreamPermanent(u16),

    #[error("data store error: {0}")]
    Store(String),

    #[error("environment has been closed")]
    Closed,

    #[error("internal error: {0}")]
    Internal(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    /// Status code used when this error surfaces at the HTTP edge.
    pub fn status_code(&self) -> StatusCode {
        match self {
            RelayError::NoCredential => StatusCode::UNAUTHORIZED,
            RelayError::UnknownEnvironment => StatusCode::NOT_FOUND,
            RelayError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            RelayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            RelayError::UnsupportedContentType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            RelayError::UpstreamTransient(_) | RelayError::UpstreamPermanent(_) => {
                StatusCode::BAD_GATEWAY
            }
            RelayError::Closed => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
