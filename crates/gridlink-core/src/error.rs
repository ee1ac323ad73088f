//! Error handling for gridlink
//!
//! Provides error types for each layer of the controller:
//! - Connection errors (serial / TCP transport)
//! - Job errors (starting and running print or mill jobs)
//! - Command errors (client directives)
//! - Firmware errors (flashing)
//!
//! All error types use `thiserror` for ergonomic error handling.

use thiserror::Error;

/// Connection error type
///
/// Represents errors related to the transport between the controller
/// and the attached device.
#[derive(Error, Debug, Clone)]
pub enum ConnectionError {
    /// No port configured or detected
    #[error("No device port configured")]
    NoPort,

    /// Failed to open port
    #[error("Failed to open port {port}: {reason}")]
    FailedToOpen {
        /// The name of the port that failed to open.
        port: String,
        /// The reason the port failed to open.
        reason: String,
    },

    /// Transport is not open
    #[error("Transport not connected")]
    NotConnected,

    /// Write to the transport failed
    #[error("Write failed: {reason}")]
    WriteFailed {
        /// The reason the write failed.
        reason: String,
    },

    /// Connection lost
    #[error("Connection lost: {reason}")]
    ConnectionLost {
        /// The reason the connection was lost.
        reason: String,
    },

    /// Invalid host:port specification
    #[error("Invalid network address: {address}")]
    InvalidAddress {
        /// The address that failed to parse.
        address: String,
    },
}

/// Job error type
///
/// Raised when a print or mill job cannot be started. None of these
/// leave the controller in a modified state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    /// Device missing or has not finished booting
    #[error("device missing or not ready")]
    DeviceNotReady,

    /// Bed clear marker absent
    #[error("bed not marked clear. use *clear first")]
    BedNotClear,

    /// Job file has no content
    #[error("invalid file: empty")]
    EmptyFile,

    /// Another job is running
    #[error("job in progress")]
    JobInProgress,

    /// No runnable files in the file directory
    #[error("no valid files")]
    NoValidFiles,

    /// Job file could not be read
    #[error("error reading job {path}: {reason}")]
    Unreadable {
        /// The job file path.
        path: String,
        /// The underlying reason.
        reason: String,
    },
}

/// Command error type
///
/// Problems with a line submitted by a client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// Unknown `*` directive
    #[error("invalid command \"{directive}\"")]
    InvalidDirective {
        /// The directive text without its prefix.
        directive: String,
    },

    /// Directive argument missing or malformed
    #[error("bad argument for {directive}: {reason}")]
    BadArgument {
        /// The directive name.
        directive: String,
        /// What was wrong with the argument.
        reason: String,
    },

    /// Named macro does not exist
    #[error("unknown macro: {name}")]
    UnknownMacro {
        /// The macro name.
        name: String,
    },
}

/// Firmware flashing error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FirmwareError {
    /// A flash is already running
    #[error("firmware update already in progress")]
    FlashInProgress,

    /// No image file found
    #[error("no firmware image found in {dir}")]
    NoImage {
        /// The directory that was searched.
        dir: String,
    },

    /// Flasher exited with failure
    #[error("flash update failed: {reason}")]
    FlashFailed {
        /// The reason reported by the flasher.
        reason: String,
    },
}

/// Main error type for gridlink
///
/// A unified error type that can represent any error from all layers.
/// This is the primary error type used in public APIs.
#[derive(Error, Debug)]
pub enum Error {
    /// Connection error
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Job error
    #[error(transparent)]
    Job(#[from] JobError),

    /// Command error
    #[error(transparent)]
    Command(#[from] CommandError),

    /// Firmware error
    #[error(transparent)]
    Firmware(#[from] FirmwareError),

    /// Standard I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create an error from a string message
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    /// Check if this is a connection error
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Error::Connection(_))
    }

    /// Check if this is a job error
    pub fn is_job_error(&self) -> bool {
        matches!(self, Error::Job(_))
    }

    /// Check if this error was caused by client input
    pub fn is_command_error(&self) -> bool {
        matches!(self, Error::Command(_))
    }
}

/// Result type using Error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_error_messages() {
        assert_eq!(
            JobError::BedNotClear.to_string(),
            "bed not marked clear. use *clear first"
        );
        assert_eq!(JobError::EmptyFile.to_string(), "invalid file: empty");
    }

    #[test]
    fn test_error_conversion() {
        let err: Error = JobError::DeviceNotReady.into();
        assert!(err.is_job_error());
        assert!(!err.is_connection_error());

        let err: Error = CommandError::InvalidDirective {
            directive: "bogus".to_string(),
        }
        .into();
        assert!(err.is_command_error());
        assert_eq!(err.to_string(), "invalid command \"bogus\"");
    }
}
