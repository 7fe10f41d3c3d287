//! Runtime error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation and provide
//! clear error messages with context.

use thiserror::Error;

/// Runtime result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error enum for the service runtime.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid registration or argument.
    #[error("validation error: {0}")]
    Validation(String),

    /// Service, property or hook not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Metadata that cannot be satisfied at container build time
    /// (e.g. a wired field pointing at an unregistered service type).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Target service does not handle the requested hook.
    #[error("service {service} has no handler for `{hook}`")]
    MissingHandler { service: String, hook: &'static str },

    /// Internal errors (panicked tasks, dropped container).
    #[error("internal error: {0}")]
    Internal(String),

    /// Timeout.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

// Convenience constructors
impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn missing_handler(service: impl Into<String>, hook: &'static str) -> Self {
        Self::MissingHandler {
            service: service.into(),
            hook,
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_handler_message() {
        let err = Error::missing_handler("Counter", "created");
        assert_eq!(err.to_string(), "service Counter has no handler for `created`");
    }

    #[test]
    fn test_serialization_from() {
        let parse: std::result::Result<serde_json::Value, _> = serde_json::from_str("{");
        let err: Error = parse.unwrap_err().into();
        assert!(matches!(err, Error::Serialization(_)));
    }
}
