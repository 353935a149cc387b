//! Error types shared by every layer of the bridge.

use std::fmt;
use thiserror::Error;

/// A JavaScript exception raised while running script code.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptException {
    /// Error constructor name (`TypeError`, `ReferenceError`, ...) when the thrown
    /// value was an Error object.
    pub name: Option<String>,
    /// String form of the thrown value, e.g. `ReferenceError: foo is not defined`.
    pub message: String,
    /// The `stack` property of the thrown value, if it had one.
    pub stack: Option<String>,
}

impl ScriptException {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            name: None,
            message: message.into(),
            stack: None,
        }
    }
}

impl fmt::Display for ScriptException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Errors surfaced by contexts, groups, processes and value projection.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Script error: {0}")]
    Script(ScriptException),

    #[error("Value used off its owning context group thread")]
    InvalidThreadAccess,

    #[error("Process failed to start: {0}")]
    ProcessFailed(String),

    #[error("Context or process is no longer active")]
    StaleReference,

    #[error("Context group thread has terminated")]
    Terminated,

    #[error("Contexts cannot be created while the group is running JavaScript")]
    Reentrant,

    #[error("Value belongs to a different context group")]
    ForeignGroup,

    #[error("Conversion failed: {0}")]
    Conversion(String),

    #[error("Cannot coerce argument {index} to {expected}")]
    Coercion { index: usize, expected: &'static str },

    #[error("Native call failed: {0}")]
    Native(String),

    #[error("A process with identity '{0}' is still active")]
    IdentityInUse(String),

    #[error("Invalid process identity '{0}'")]
    InvalidIdentity(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Shorthand for errors raised by native callables.
    pub fn native(message: impl Into<String>) -> Self {
        Self::Native(message.into())
    }

    /// The script exception carried by this error, if any.
    pub fn as_script(&self) -> Option<&ScriptException> {
        match self {
            BridgeError::Script(exception) => Some(exception),
            _ => None,
        }
    }
}

impl From<ScriptException> for BridgeError {
    fn from(exception: ScriptException) -> Self {
        BridgeError::Script(exception)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_error_display_uses_message() {
        let err = BridgeError::from(ScriptException::new("ReferenceError: nope is not defined"));
        assert_eq!(
            err.to_string(),
            "Script error: ReferenceError: nope is not defined"
        );
        assert!(err.as_script().is_some());
    }

    #[test]
    fn test_coercion_error_names_argument() {
        let err = BridgeError::Coercion {
            index: 1,
            expected: "integer",
        };
        assert_eq!(err.to_string(), "Cannot coerce argument 1 to integer");
        assert!(err.as_script().is_none());
    }
}
