use thiserror::Error;

/// Failure kinds surfaced by reference resolution.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("Malformed reference: {0}")]
    MalformedReference(String),

    #[error("Invalid payload encoding: {0}")]
    InvalidPayloadEncoding(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Execution environment unavailable: {0}")]
    EnvironmentUnavailable(String),

    #[error("Materialization failed: {0}")]
    MaterializationFailed(String),

    #[error("Invalid extension: {0}")]
    InvalidExtension(String),

    #[error("Fetch from {host} timed out")]
    FetchTimeout { host: String },

    #[error("Fetch from {host} failed: {reason}")]
    FetchFailed { host: String, reason: String },

    #[error("Authorization failed for {host} (status {status})")]
    AuthorizationFailed { host: String, status: u16 },
}

impl ResolveError {
    /// Parsing and validation errors point at a configuration problem and are
    /// never worth retrying.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            ResolveError::MalformedReference(_)
                | ResolveError::InvalidPayloadEncoding(_)
                | ResolveError::InvalidExtension(_)
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ResolveError::FetchTimeout { .. })
    }

    /// Stable short code, used in reports and log lines.
    pub fn code(&self) -> &'static str {
        match self {
            ResolveError::MalformedReference(_) => "MALFORMED_REFERENCE",
            ResolveError::InvalidPayloadEncoding(_) => "INVALID_PAYLOAD_ENCODING",
            ResolveError::FileNotFound(_) => "FILE_NOT_FOUND",
            ResolveError::EnvironmentUnavailable(_) => "ENVIRONMENT_UNAVAILABLE",
            ResolveError::MaterializationFailed(_) => "MATERIALIZATION_FAILED",
            ResolveError::InvalidExtension(_) => "INVALID_EXTENSION",
            ResolveError::FetchTimeout { .. } => "FETCH_TIMEOUT",
            ResolveError::FetchFailed { .. } => "FETCH_FAILED",
            ResolveError::AuthorizationFailed { .. } => "AUTHORIZATION_FAILED",
        }
    }
}

pub type Result<T, E = ResolveError> = std::result::Result<T, E>;
