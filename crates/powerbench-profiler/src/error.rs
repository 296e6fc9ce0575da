//! Error types for telemetry sources and telemetry output
//!
//! Source errors (`DeviceIo`, `Protocol`, `Parse`, `Timeout`) are recoverable: samplers
//! log them and keep the last good reading.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for telemetry operations
pub type Result<T> = std::result::Result<T, TelemetryError>;

/// Errors raised while talking to a power source
#[derive(Error, Debug)]
pub enum TelemetryError {
    /// Serial port could not be opened, written, or timed out on read
    #[error("Device I/O error on {port}: {message}")]
    DeviceIo {
        /// Port the meter is attached to
        port: String,
        /// Underlying failure
        message: String,
    },

    /// Meter reply did not match the expected frame layout
    #[error("Protocol error: expected {expected} bytes, received {received}")]
    Protocol {
        /// Frame length the codec requires
        expected: usize,
        /// Bytes actually received
        received: usize,
    },

    /// Vendor utility produced output that is not a single number
    #[error("Parse error from {source_name}: {message}")]
    Parse {
        /// Name of the source that produced the output
        source_name: String,
        /// What was wrong with it
        message: String,
    },

    /// Vendor utility did not exit in time and was killed
    #[error("{source_name} did not answer within {timeout:?}")]
    Timeout {
        source_name: String,
        timeout: Duration,
    },

    /// IO errors outside the serial link (subprocess spawn, files)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV output errors
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl TelemetryError {
    pub(crate) fn device_io(port: &str, message: impl Into<String>) -> Self {
        TelemetryError::DeviceIo {
            port: port.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn parse(source_name: &str, message: impl Into<String>) -> Self {
        TelemetryError::Parse {
            source_name: source_name.to_string(),
            message: message.into(),
        }
    }
}
