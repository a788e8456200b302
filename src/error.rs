//! Error types for the throttle.

/// Result type for throttle operations.
pub type ThrottleResult<T> = Result<T, ThrottleError>;

/// Errors from throttle operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ThrottleError {
    #[error("Unknown host: {0}")]
    UnknownHost(String),
    #[error("Misuse: {0}")]
    Misuse(#[from] MisuseError),
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    /// Only reachable if a gate's semaphore is closed, which this crate
    /// never does.
    #[error("Concurrency gate closed for {0}")]
    GateClosed(String),
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Caller bugs, as opposed to transient conditions.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MisuseError {
    #[error("max_concurrency must be at least 1")]
    ZeroConcurrency,
    #[error("base delay must be a finite, non-negative number of seconds (got {0})")]
    InvalidBaseDelay(String),
    #[error("sensitivity window must be a finite, non-negative number of seconds (got {0})")]
    InvalidSensitivityWindow(String),
    #[error("invalid pressure table: {0}")]
    InvalidPressureTable(String),
    #[error("release without matching acquire for {0}")]
    ReleaseWithoutAcquire(String),
}

impl From<toml::de::Error> for ThrottleError {
    fn from(e: toml::de::Error) -> Self {
        ThrottleError::Config(e.to_string())
    }
}

impl ThrottleError {
    /// Whether this error indicates a caller bug.
    pub fn is_misuse(&self) -> bool {
        matches!(self, ThrottleError::Misuse(_))
    }
}
