//! Error types and handling for the edge agent.
//!
//! This module defines the error types used throughout the application,
//! providing consistent error handling and reporting.

use thiserror::Error;

/// Result type alias for edge agent operations.
pub type Result<T> = std::result::Result<T, EdgeError>;

/// Main error type for the edge agent.
#[derive(Debug, Error)]
pub enum EdgeError {
    /// Configuration-related errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Field-bus (Modbus) communication errors
    #[error("Field-bus error: {message}")]
    FieldBus { message: String },

    /// Message-bus (MQTT) errors
    #[error("Message-bus error: {message}")]
    Bus { message: String },

    /// Backend HTTP errors
    #[error("Backend error: {message}")]
    Backend { message: String },

    /// Serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// File I/O errors
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Network-related errors
    #[error("Network error: {message}")]
    Network { message: String },

    /// Authentication/authorization errors
    #[error("Authentication error: {message}")]
    Auth { message: String },

    /// Validation errors
    #[error("Validation error: {field} - {message}")]
    Validation { field: String, message: String },

    /// Timeout errors
    #[error("Timeout error: {message}")]
    Timeout { message: String },

    /// Generic errors with context
    #[error("Error: {message}")]
    Generic { message: String },
}

impl EdgeError {
    /// Create a new configuration error.
    pub fn config<S: Into<String>>(message: S) -> Self {
        EdgeError::Config {
            message: message.into(),
        }
    }

    /// Create a new field-bus error.
    pub fn field_bus<S: Into<String>>(message: S) -> Self {
        EdgeError::FieldBus {
            message: message.into(),
        }
    }

    /// Create a new message-bus error.
    pub fn bus<S: Into<String>>(message: S) -> Self {
        EdgeError::Bus {
            message: message.into(),
        }
    }

    /// Create a new backend error.
    pub fn backend<S: Into<String>>(message: S) -> Self {
        EdgeError::Backend {
            message: message.into(),
        }
    }

    /// Create a new validation error.
    pub fn validation<S: Into<String>>(field: S, message: S) -> Self {
        EdgeError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a new I/O error.
    pub fn io<S: Into<String>>(message: S) -> Self {
        EdgeError::Io {
            message: message.into(),
        }
    }

    /// Create a new network error.
    pub fn network<S: Into<String>>(message: S) -> Self {
        EdgeError::Network {
            message: message.into(),
        }
    }

    /// Create a new timeout error.
    pub fn timeout<S: Into<String>>(message: S) -> Self {
        EdgeError::Timeout {
            message: message.into(),
        }
    }

    /// Create a new auth error.
    pub fn auth<S: Into<String>>(message: S) -> Self {
        EdgeError::Auth {
            message: message.into(),
        }
    }

    /// Create a new generic error.
    pub fn generic<S: Into<String>>(message: S) -> Self {
        EdgeError::Generic {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for EdgeError {
    fn from(err: std::io::Error) -> Self {
        EdgeError::io(err.to_string())
    }
}

impl From<serde_json::Error> for EdgeError {
    fn from(err: serde_json::Error) -> Self {
        EdgeError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for EdgeError {
    fn from(err: reqwest::Error) -> Self {
        EdgeError::network(err.to_string())
    }
}

impl From<chrono::ParseError> for EdgeError {
    fn from(err: chrono::ParseError) -> Self {
        EdgeError::validation("datetime", &err.to_string())
    }
}

impl From<rumqttc::ClientError> for EdgeError {
    fn from(err: rumqttc::ClientError) -> Self {
        EdgeError::bus(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = EdgeError::config("test config error");
        assert!(matches!(err, EdgeError::Config { .. }));

        let err = EdgeError::field_bus("test field-bus error");
        assert!(matches!(err, EdgeError::FieldBus { .. }));

        let err = EdgeError::validation("field", "test validation error");
        assert!(matches!(err, EdgeError::Validation { .. }));
    }

    #[test]
    fn test_error_display() {
        let err = EdgeError::config("test error");
        let error_string = format!("{}", err);
        assert_eq!(error_string, "Configuration error: test error");

        let err = EdgeError::validation("test_field", "invalid value");
        let error_string = format!("{}", err);
        assert_eq!(error_string, "Validation error: test_field - invalid value");
    }
}
