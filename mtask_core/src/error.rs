//! Unified error handling for MTASK
//!
//! Configuration, registration, binding and startup APIs report failures with
//! [`MtaskError`]. Call paths (functions, commands, proxies) never do: they
//! encode their outcome in an [`ExecutionResult`] so that nothing unwinds across
//! a mailbox or a network boundary. [`MtaskError::execution_result`] bridges the
//! two worlds when a binding-time failure must be reported to a caller.

use crate::core::result::ExecutionResult;
use thiserror::Error;

/// Main error type for MTASK operations
#[derive(Debug, Error)]
pub enum MtaskError {
    /// I/O related errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration parsing or validation errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/Deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Communication layer errors (mailboxes, event fan-out)
    #[error("Communication error: {0}")]
    Communication(String),

    /// Component-related errors
    #[error("Component '{component}' error: {message}")]
    Component { component: String, message: String },

    /// Component, interface, command or process not found
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Duplicate registration (component, interface, command, handler)
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Invalid input/argument errors
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A lifecycle transition was requested from a state that does not allow it
    #[error("Invalid state transition for '{component}': {from} -> {to}")]
    InvalidTransition {
        component: String,
        from: String,
        to: String,
    },

    /// Timeout errors
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Transport or peer failures
    #[error("Network error: {0}")]
    Network(String),

    /// Generic internal errors (use sparingly)
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Convenience type alias for Results using MtaskError
pub type MtaskResult<T> = Result<T, MtaskError>;

impl From<bincode::Error> for MtaskError {
    fn from(err: bincode::Error) -> Self {
        MtaskError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for MtaskError {
    fn from(err: serde_yaml::Error) -> Self {
        MtaskError::Config(format!("YAML error: {}", err))
    }
}

impl From<toml::de::Error> for MtaskError {
    fn from(err: toml::de::Error) -> Self {
        MtaskError::Config(format!("TOML parse error: {}", err))
    }
}

impl From<toml::ser::Error> for MtaskError {
    fn from(err: toml::ser::Error) -> Self {
        MtaskError::Serialization(format!("TOML serialization error: {}", err))
    }
}

// Helper methods
impl MtaskError {
    /// Create a configuration error with a custom message
    pub fn config<S: Into<String>>(msg: S) -> Self {
        MtaskError::Config(msg.into())
    }

    /// Create a component error with component name and message
    pub fn component<S: Into<String>, T: Into<String>>(component: S, message: T) -> Self {
        MtaskError::Component {
            component: component.into(),
            message: message.into(),
        }
    }

    /// Create a communication error
    pub fn communication<S: Into<String>>(msg: S) -> Self {
        MtaskError::Communication(msg.into())
    }

    /// Create a network error
    pub fn network<S: Into<String>>(msg: S) -> Self {
        MtaskError::Network(msg.into())
    }

    /// Create a not found error
    pub fn not_found<S: Into<String>>(resource: S) -> Self {
        MtaskError::NotFound(resource.into())
    }

    /// Create an already exists error
    pub fn already_exists<S: Into<String>>(resource: S) -> Self {
        MtaskError::AlreadyExists(resource.into())
    }

    /// Create an invalid input error
    pub fn invalid_input<S: Into<String>>(msg: S) -> Self {
        MtaskError::InvalidInput(msg.into())
    }

    /// Check if this is a not found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, MtaskError::NotFound(_))
    }

    /// Check if this is a duplicate registration
    pub fn is_already_exists(&self) -> bool {
        matches!(self, MtaskError::AlreadyExists(_))
    }

    /// Check if this is a timeout error
    pub fn is_timeout(&self) -> bool {
        matches!(self, MtaskError::Timeout(_))
    }

    /// Map this error onto the closed set of call outcomes.
    pub fn execution_result(&self) -> ExecutionResult {
        match self {
            MtaskError::NotFound(_) => ExecutionResult::ComponentNotFound,
            MtaskError::Serialization(_) | MtaskError::InvalidInput(_) => {
                ExecutionResult::InvalidInputType
            }
            MtaskError::Timeout(_) => ExecutionResult::Timeout,
            MtaskError::Network(_) | MtaskError::Io(_) => ExecutionResult::NetworkError,
            _ => ExecutionResult::Disabled,
        }
    }
}
