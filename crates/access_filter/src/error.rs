//! Error types for the access filter.
//!
//! Only lifecycle, configuration and database failures are ever returned to
//! the operator as `Err`. Failures inside the decision path (bad input, a
//! stalled lookup) still produce a `Deny` verdict and ride along with it.

/// Errors raised by the access filter and its components.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FilterError {
    /// The connecting address could not be parsed
    #[error("Invalid client address: {0:?}")]
    InvalidInput(String),

    /// A rule document was rejected; the previous rule set stays active
    #[error("Configuration error: {0}")]
    Config(String),

    /// A geolocation database could not be opened; the previous one stays active
    #[error("Failed to load geolocation database {path}: {reason}")]
    DatabaseLoad { path: String, reason: String },

    /// `evaluate` was called before any rule set was installed
    #[error("Access filter is not ready: no rule set has been loaded")]
    NotReady,

    /// The filter has been shut down
    #[error("Access filter has been shut down")]
    Shutdown,

    /// The geolocation lookup did not finish within the configured budget
    #[error("Geolocation lookup timed out after {0}ms")]
    Timeout(u64),

    /// Too many bounded lookups are still running, typically behind a stalled database
    #[error("Geolocation lookup refused: {0} lookups already in flight")]
    LookupBacklog(usize),

    /// Filesystem failure outside of database loading (blacklist persistence)
    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for FilterError {
    fn from(e: std::io::Error) -> Self {
        FilterError::Io(e.to_string())
    }
}
