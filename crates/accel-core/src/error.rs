//! Error handling for the accelerator exporter
//!
//! Provides the unified error type shared by the device clients, the
//! snapshot cache and the agent coordinator.

/// Result type alias for exporter operations
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for the exporter
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The remote call could not complete (socket/channel level)
    #[error("Transport error: {0}")]
    Transport(String),

    /// The remote call completed with a non-OK application status
    #[error("Application error (status {code}): {message}")]
    Application { code: i32, message: String },

    /// Remote call exceeded its deadline
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Resource not found
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Invalid request or parameters
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    InvalidConfiguration(String),

    /// Client or connection not usable right now
    #[error("Resource unavailable: {0}")]
    Unavailable(String),

    /// External profiler failures
    #[error("Profiler error: {0}")]
    Profiler(String),

    /// Workload scheduler back end failures
    #[error("Scheduler error: {0}")]
    Scheduler(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Generic error with context
    #[error("Error: {0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create an application status error
    pub fn application(code: i32, msg: impl Into<String>) -> Self {
        Self::Application {
            code,
            message: msg.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create an invalid request error
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    /// Create an unavailable error
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    /// Create a profiler error
    pub fn profiler(msg: impl Into<String>) -> Self {
        Self::Profiler(msg.into())
    }

    /// Create a scheduler error
    pub fn scheduler(msg: impl Into<String>) -> Self {
        Self::Scheduler(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this error came from talking to the control plane.
    ///
    /// Transport and application failures are handled identically: the
    /// current cycle is aborted and the connection is re-established.
    pub fn is_remote_failure(&self) -> bool {
        matches!(
            self,
            Error::Transport(_) | Error::Application { .. } | Error::Timeout(_)
        )
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Transport(_) | Error::Timeout(_) | Error::Unavailable(_)
        )
    }

    /// Check if this error indicates a client-side problem
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidConfiguration(_) | Error::InvalidRequest(_) | Error::NotFound(_)
        )
    }

    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Error::Transport(_) => "transport",
            Error::Application { .. } => "application",
            Error::Timeout(_) => "timeout",
            Error::NotFound(_) => "not_found",
            Error::InvalidRequest(_) => "invalid_request",
            Error::InvalidConfiguration(_) => "configuration",
            Error::Unavailable(_) => "unavailable",
            Error::Profiler(_) => "profiler",
            Error::Scheduler(_) => "scheduler",
            Error::Internal(_) => "internal",
            Error::Io(_) => "io",
            Error::Json(_) => "json",
            Error::Yaml(_) => "yaml",
            Error::Other(_) => "other",
        }
    }
}

/// Extension trait for adding context to Results
pub trait ErrorContext<T> {
    /// Add context to an error
    fn with_context(self, context: impl Into<String>) -> Result<T>;

    /// Add context to an error using a closure
    fn with_context_fn<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: Into<Error>,
{
    fn with_context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| {
            let original_error = e.into();
            Error::Other(anyhow::anyhow!("{}: {}", context.into(), original_error))
        })
    }

    fn with_context_fn<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| {
            let original_error = e.into();
            Error::Other(anyhow::anyhow!("{}: {}", f(), original_error))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = Error::config("bad selector");
        assert!(matches!(err, Error::InvalidConfiguration(_)));
        assert_eq!(err.to_string(), "Configuration error: bad selector");

        let err = Error::application(3, "device busy");
        assert_eq!(err.to_string(), "Application error (status 3): device busy");
    }

    #[test]
    fn test_remote_failures_are_equivalent() {
        assert!(Error::transport("connection reset").is_remote_failure());
        assert!(Error::application(1, "nope").is_remote_failure());
        assert!(Error::timeout("get_devices").is_remote_failure());
        assert!(!Error::not_found("gpu").is_remote_failure());
        assert!(!Error::profiler("core dumped").is_remote_failure());
    }

    #[test]
    fn test_error_categories() {
        assert_eq!(Error::transport("x").category(), "transport");
        assert_eq!(Error::application(2, "x").category(), "application");
        assert_eq!(Error::scheduler("x").category(), "scheduler");
        assert!(Error::invalid_request("x").is_client_error());
        assert!(!Error::internal("x").is_client_error());
    }

    #[test]
    fn test_error_context() {
        let result: std::result::Result<(), std::io::Error> =
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "file not found"));

        let err = result.with_context("failed to read snapshot").unwrap_err();

        assert!(matches!(err, Error::Other(_)));
        assert!(err.to_string().contains("failed to read snapshot"));
        assert!(err.to_string().contains("file not found"));
    }
}
