//! Error types for pxflash.

use std::io;
use thiserror::Error;

/// Result type for pxflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for pxflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Firmware payload could not be decoded (base64 or zlib).
    #[error("Firmware decode error: {0}")]
    Decode(String),

    /// Firmware descriptor is malformed or missing required metadata.
    #[error("Invalid firmware file: {0}")]
    InvalidFirmware(String),

    /// A metadata field was requested that the descriptor does not carry.
    #[error("Missing firmware field: {0}")]
    MissingField(String),

    /// No bytes arrived within the read window.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Unexpected byte in the bootloader handshake.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Device replied INSYNC + FAILED.
    #[error("Bootloader reports operation failed")]
    OperationFailed,

    /// Device replied INSYNC + INVALID.
    #[error("Bootloader reports invalid operation")]
    UnsupportedOperation,

    /// Device and firmware do not go together.
    #[error("Incompatible: {0}")]
    Compatibility(String),

    /// Erase did not complete within the erase deadline.
    #[error("Timed out waiting for erase to complete")]
    EraseTimeout,

    /// Device-reported CRC differs from the locally computed one (rev 3+).
    #[error("Program CRC mismatch: expected {expected:#010x}, got {actual:#010x}")]
    CrcMismatch {
        /// Locally computed CRC over the padded image.
        expected: u32,
        /// CRC the bootloader reported.
        actual: u32,
    },

    /// Read-back bytes differ from what was programmed (rev 2).
    #[error("Verify mismatch at offset {offset}: expected {expected:02x?}, got {actual:02x?}")]
    VerifyMismatch {
        /// Byte offset of the first mismatching chunk.
        offset: usize,
        /// Bytes that were programmed.
        expected: Vec<u8>,
        /// Bytes the device returned.
        actual: Vec<u8>,
    },
}

impl Error {
    /// Whether this error is a per-read timeout (the only kind the erase
    /// polling loop absorbs).
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}
