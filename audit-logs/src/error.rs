//! Error types for the audit pipeline
//!
//! Only configuration errors ever reach the host application: they are
//! returned from [`AuditLogs::builder().build()`](crate::AuditLogs::builder)
//! and are meant to block startup. Every other error is produced inside the
//! capture or delivery path, where it is logged, counted and dropped.

use thiserror::Error;

/// Result type alias using the audit error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the audit pipeline
///
/// Large error variants are boxed to reduce stack size
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration could not be loaded or extracted
    #[error("Configuration error: {0}")]
    Config(Box<figment::Error>),

    /// Auditing is enabled for an endpoint that has no sink configured
    #[error("Audit logs are enabled but no endpoint is defined for: {0}")]
    MissingEndpoint(String),

    /// A setting holds a value the pipeline cannot work with
    #[error("Invalid audit logs setting: {0}")]
    InvalidSetting(String),

    /// Sink request could not be built or sent (connect error, timeout, ...)
    #[error("HTTP error: {0}")]
    Http(Box<reqwest::Error>),

    /// Sink answered with a non-success status
    #[error("Audit sink responded with status {0}")]
    SinkStatus(u16),

    /// Record could not be serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Custom fields generator could not be constructed
    #[error("Custom fields generator error: {0}")]
    Generator(String),
}

impl Error {
    /// Whether the error happened while delivering a record to the sink
    pub fn is_delivery(&self) -> bool {
        matches!(self, Error::Http(_) | Error::SinkStatus(_))
    }
}

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Error::Config(Box::new(err))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Http(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_endpoint_message() {
        let err = Error::MissingEndpoint("server".to_string());
        assert_eq!(
            err.to_string(),
            "Audit logs are enabled but no endpoint is defined for: server"
        );
    }

    #[test]
    fn test_delivery_classification() {
        assert!(Error::SinkStatus(503).is_delivery());
        assert!(!Error::Generator("boom".into()).is_delivery());
        assert!(!Error::MissingEndpoint("server".into()).is_delivery());
    }

    #[test]
    fn test_figment_error_is_boxed() {
        let err: Error = figment::Error::from("bad value".to_string()).into();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().starts_with("Configuration error"));
    }
}
