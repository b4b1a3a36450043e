//! Error types for otaflash.

use std::io;
use thiserror::Error;

use crate::image::ihex::DecodeError;

/// Result type for otaflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for otaflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Malformed Intel HEX input.
    #[error("Intel HEX decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Network fetch failed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// File store operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Target device unreachable or misbehaving.
    #[error("Device error: {0}")]
    Device(String),

    /// Bridge protocol violation (bad frame, bad CRC, unexpected reply).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Communication timeout.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Stopped by the embedding application.
    #[error("Operation interrupted")]
    Interrupted,
}

impl Error {
    /// Returns `true` for errors raised by the network collaborator.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// Returns `true` for errors raised by the file store collaborator.
    pub fn is_storage(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}
