// src/error.rs
//
// Error taxonomy for the transport layer.
//
// Only configuration and capability errors ever reach a caller synchronously
// (from `start()` / `select_transport()`). Everything a running worker hits is
// recovered inside its reconnect loop and reported through `tracing` only.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, BackendError>;

/// Main error type for backend and manager operations
#[derive(Error, Debug)]
pub enum BackendError {
    /// A required client library or runtime capability is absent
    #[error("Unsupported transport: {0}")]
    UnsupportedTransport(String),

    /// Auto-detection (serial port scan, BLE name scan) found nothing
    #[error("No device found: {0}")]
    NoDeviceFound(String),

    /// A single open/connect attempt failed
    #[error("Connect error: {0}")]
    Connect(String),

    /// Mid-session read/write failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A malformed inbound unit
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Invalid or unreadable configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl BackendError {
    /// True for errors a reconnect loop is expected to absorb and retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BackendError::NoDeviceFound(_)
                | BackendError::Connect(_)
                | BackendError::Io(_)
                | BackendError::Decode(_)
        )
    }
}

/// Why a line or notification payload was dropped
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("empty unit")]
    Empty,

    #[error("expected at least {required} fields, found {found}")]
    TooFewFields { required: usize, found: usize },

    #[error("field {field:?} is not an integer")]
    NotAnInteger { field: String },

    #[error("value {value} outside {min}..={max}")]
    OutOfRange { value: i64, min: u32, max: u32 },
}
