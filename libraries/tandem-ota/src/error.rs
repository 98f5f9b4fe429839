//! Collaborator error types
//!
//! These describe failures reported by the device-facing collaborators. The
//! orchestrator logs them and maps them onto the [`tandem_core::OtaError`]
//! taxonomy at the component boundary.

use tandem_core::OtaError;
use thiserror::Error;

/// Errors reported by an HTTP transport
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The connection could not be established
    #[error("Connection failed: {0}")]
    Connect(String),

    /// The server answered with a non-success status
    #[error("HTTP status {0}")]
    Status(u16),

    /// The transfer broke after the connection was established
    #[error("Transfer error: {0}")]
    Io(String),

    /// The request was canceled through its token
    #[error("Transfer canceled")]
    Cancelled,
}

/// Errors reported by the companion flashing link
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// Serial or bus I/O failed
    #[error("Link I/O error: {0}")]
    Io(String),

    /// The companion answered with a negative acknowledgement
    #[error("Companion rejected command: {0}")]
    Rejected(String),

    /// The requested transport is not available on this device
    #[error("Transport unavailable: {0}")]
    Unavailable(String),
}

/// Errors reported by the main-firmware partition primitives
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PartitionError {
    /// The image server could not be reached
    #[error("Connection failed: {0}")]
    Connect(String),

    /// The image header or descriptor is malformed
    #[error("Invalid image: {0}")]
    InvalidImage(String),

    /// Reading the image or writing the partition failed
    #[error("Partition I/O error: {0}")]
    Io(String),

    /// The handle does not refer to an open update
    #[error("Unknown update handle {0}")]
    InvalidHandle(u32),
}

/// Outcome of a call through the worker-call bridge
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// The request could not be posted to the privileged context
    #[error("Worker call could not be dispatched")]
    Dispatch,

    /// The primitive ran and failed
    #[error(transparent)]
    Partition(#[from] PartitionError),
}

impl CallError {
    /// Map onto the taxonomy, using `fallback` for primitive failures
    pub fn classify(&self, fallback: OtaError) -> OtaError {
        match self {
            CallError::Dispatch => OtaError::WorkerCallDispatchFail,
            CallError::Partition(_) => fallback,
        }
    }
}

/// Invalid engine configuration
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid configuration: {0}")]
pub struct ConfigError(pub String);
