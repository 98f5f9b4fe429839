//! Error taxonomy shared by every stage of an update.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using `OtaError`
pub type Result<T> = std::result::Result<T, OtaError>;

/// Terminal failure classes of an update job or manifest.
///
/// The enum is `Copy` so that it can travel inside status records and be
/// compared in tests. Diagnostic detail is logged where the failure happens.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OtaError {
    /// A job or manifest sequence is already queued or executing
    #[error("An update is already running")]
    AlreadyRunning,

    /// The offered image is not newer than the installed one
    #[error("Offered version is not newer than the installed version")]
    VersionTooOld,

    /// The HTTP connection could not be established
    #[error("Connection failed")]
    ConnectionFail,

    /// The image descriptor of a main-firmware image could not be read
    #[error("Failed to read image header")]
    ImageHeaderReadFail,

    /// The transfer ended before the full body was received
    #[error("Download incomplete")]
    DownloadIncomplete,

    /// The companion rejected the start-of-flash handshake
    #[error("Companion flasher start failed")]
    FlasherStartFail,

    /// A chunk write or the finish handshake failed
    #[error("Companion flasher write failed")]
    FlasherWriteFail,

    /// The writer starved or hit an unexpected internal condition
    #[error("Companion flasher internal error")]
    FlasherInternalError,

    /// A remote manifest was malformed or missing fields
    #[error("Update manifest is invalid")]
    ManifestInvalid,

    /// A stage produced no status update within its budget
    #[error("Update stage timed out")]
    Timeout,

    /// The job was aborted on request
    #[error("Update canceled by user")]
    UserCanceled,

    /// A call into the privileged partition context could not be posted
    #[error("Failed to dispatch worker call")]
    WorkerCallDispatchFail,

    /// The engine's background tasks are no longer running
    #[error("Update engine stopped")]
    EngineStopped,
}

impl OtaError {
    /// Stable numeric code carried in outbound status payloads.
    pub fn code(self) -> i32 {
        match self {
            OtaError::AlreadyRunning => 1,
            OtaError::VersionTooOld => 2,
            OtaError::ConnectionFail => 3,
            OtaError::ImageHeaderReadFail => 4,
            OtaError::DownloadIncomplete => 5,
            OtaError::FlasherStartFail => 6,
            OtaError::FlasherWriteFail => 7,
            OtaError::FlasherInternalError => 8,
            OtaError::ManifestInvalid => 9,
            OtaError::Timeout => 10,
            OtaError::UserCanceled => 11,
            OtaError::WorkerCallDispatchFail => 12,
            OtaError::EngineStopped => 13,
        }
    }

    /// Inverse of [`OtaError::code`].
    pub fn from_code(code: i32) -> Option<Self> {
        let err = match code {
            1 => OtaError::AlreadyRunning,
            2 => OtaError::VersionTooOld,
            3 => OtaError::ConnectionFail,
            4 => OtaError::ImageHeaderReadFail,
            5 => OtaError::DownloadIncomplete,
            6 => OtaError::FlasherStartFail,
            7 => OtaError::FlasherWriteFail,
            8 => OtaError::FlasherInternalError,
            9 => OtaError::ManifestInvalid,
            10 => OtaError::Timeout,
            11 => OtaError::UserCanceled,
            12 => OtaError::WorkerCallDispatchFail,
            13 => OtaError::EngineStopped,
            _ => return None,
        };
        Some(err)
    }
}
