//! Error types for the plugin runtime.

use std::any::Any;

use crate::types::{codes, LifecycleState};

/// Errors that can occur in the runtime.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Host communication failed: {0}")]
    HostCommunication(#[from] HostError),

    #[error("Serialization failed: {0}")]
    Serialization(String),

    #[error("Plugin '{plugin_id}' handler failed: {message}")]
    Handler { plugin_id: String, message: String },

    #[error("{0} not implemented")]
    NotImplemented(&'static str),

    #[error("Plugin '{0}' not loaded")]
    UnknownPlugin(String),

    #[error("Plugin '{id}' cannot {operation} while {state}")]
    InvalidState {
        id: String,
        operation: &'static str,
        state: LifecycleState,
    },

    #[error("No plugin id given and no plugin is registered")]
    NoCurrentPlugin,

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl RuntimeError {
    /// Wire code used when this error is reported inside a `ServiceResponse`.
    pub fn code(&self) -> &'static str {
        match self {
            RuntimeError::Validation(_) => codes::INVALID_REQUEST,
            RuntimeError::HostCommunication(_) => "HOST_ERROR",
            RuntimeError::Serialization(_) => "SERIALIZATION_ERROR",
            RuntimeError::Handler { .. } => codes::PLUGIN_ERROR,
            RuntimeError::NotImplemented(_) => codes::NOT_IMPLEMENTED,
            RuntimeError::UnknownPlugin(_) | RuntimeError::NoCurrentPlugin => {
                codes::PLUGIN_NOT_FOUND
            }
            RuntimeError::InvalidState { .. } => codes::NOT_RUNNING,
            RuntimeError::Config(_) => "CONFIG_ERROR",
        }
    }
}

/// Errors reported by host primitives.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HostError {
    #[error("Point not found: {0}")]
    NotFound(String),

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Primitive unavailable: {0}")]
    Unavailable(String),
}

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        format!("panicked: {msg}")
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("panicked: {msg}")
    } else {
        "panicked".to_string()
    }
}
