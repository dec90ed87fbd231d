//! Error types for the GDB server

use thiserror::Error;

use crate::controller::TargetControllerError;

/// Main error type for the GDB server
#[derive(Error, Debug)]
pub enum DebugError {
    #[error("Probe not found: {0}")]
    ProbeNotFound(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Device initialisation failed: {0}")]
    DeviceInitializationFailure(String),

    #[error("Target controller is not available")]
    ControllerUnavailable,

    #[error("Target controller error: {0}")]
    Controller(#[from] TargetControllerError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, DebugError>;
