use thiserror::Error;

/// When things go awry
#[derive(Debug, Error)]
pub enum ChappsError {
    /// The payload could not be decoded into key=value lines
    #[error("malformed policy frame: {0}")]
    MalformedFrame(String),
    /// The sender field was empty where a sender address was required
    #[error("null sender")]
    NullSender,
    #[error("sender address has more than one at-sign: {0}")]
    TooManyAts(String),
    #[error("sender address has no at-sign: {0}")]
    NotAnEmailAddress(String),
    /// An inbound request with an empty recipient list
    #[error("policy request contains no recipients")]
    NoRecipients,
    /// No usable user identity could be resolved from the request
    #[error("no user key found in request: tried {0}")]
    AuthenticationFailure(String),
    #[error("cache unavailable: {0}")]
    CacheUnavailable(#[from] redis::RedisError),
    #[error("config store unavailable: {0}")]
    ConfigStoreUnavailable(#[from] sqlx::Error),
    #[error("SPF query failed: {0}")]
    SpfQueryError(String),
    /// Something failed in the start up of the platform
    #[error("startup error: {0}")]
    StartupError(String),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error("invalid value: {0}")]
    InvalidValue(String),
    #[error("{0}")]
    Generic(String),
}

impl From<ChappsError> for std::io::Error {
    fn from(error: ChappsError) -> Self {
        match error {
            ChappsError::IoError(err) => err,
            other => std::io::Error::other(other.to_string()),
        }
    }
}
