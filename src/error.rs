//! Error types for muxkv
//!
//! Provides a unified error type for all operations, plus the classifier
//! that maps wire-level request error tags onto it.

use thiserror::Error;

/// Result type alias using MuxError
pub type Result<T> = std::result::Result<T, MuxError>;

/// Unified error type for muxkv operations
#[derive(Debug, Error)]
pub enum MuxError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Connection Errors
    // -------------------------------------------------------------------------
    /// Transport severed, or the engine reported a disconnect
    #[error("Connection error: {0}")]
    Connection(String),

    /// Operation attempted on a connection that is closing or closed
    #[error("Closing error: {0}")]
    Closing(String),

    // -------------------------------------------------------------------------
    // Request Errors
    // -------------------------------------------------------------------------
    #[error("Timeout: {0}")]
    Timeout(String),

    /// An atomic batch was aborted by the engine
    #[error("Exec abort: {0}")]
    ExecAbort(String),

    #[error("Request error: {0}")]
    Request(String),

    // -------------------------------------------------------------------------
    // Protocol Errors
    // -------------------------------------------------------------------------
    /// Malformed or unexpected frame or payload
    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Fieldless discriminant of [`MuxError`], handy for matching in callers and tests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Io,
    Connection,
    Closing,
    Timeout,
    ExecAbort,
    Request,
    Decode,
    Serialization,
    Config,
}

impl MuxError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MuxError::Io(_) => ErrorKind::Io,
            MuxError::Connection(_) => ErrorKind::Connection,
            MuxError::Closing(_) => ErrorKind::Closing,
            MuxError::Timeout(_) => ErrorKind::Timeout,
            MuxError::ExecAbort(_) => ErrorKind::ExecAbort,
            MuxError::Request(_) => ErrorKind::Request,
            MuxError::Decode(_) => ErrorKind::Decode,
            MuxError::Serialization(_) => ErrorKind::Serialization,
            MuxError::Config(_) => ErrorKind::Config,
        }
    }
}

impl From<bincode::Error> for MuxError {
    fn from(err: bincode::Error) -> Self {
        MuxError::Serialization(err.to_string())
    }
}

// =============================================================================
// Request Error Classification
// =============================================================================

/// Error type tags carried by a request error on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RequestErrorType {
    Unspecified = 0,
    ExecAbort = 1,
    Timeout = 2,
    Disconnect = 3,
}

impl RequestErrorType {
    /// Map a raw wire tag to a known type. Unknown tags are `Unspecified`.
    pub fn from_tag(tag: u32) -> Self {
        match tag {
            1 => RequestErrorType::ExecAbort,
            2 => RequestErrorType::Timeout,
            3 => RequestErrorType::Disconnect,
            _ => RequestErrorType::Unspecified,
        }
    }

    pub fn tag(self) -> u32 {
        self as u32
    }
}

/// Turn a wire request error into the matching [`MuxError`]
pub fn classify_request_error(error_type: u32, message: impl Into<String>) -> MuxError {
    let message = message.into();
    match RequestErrorType::from_tag(error_type) {
        RequestErrorType::Disconnect => MuxError::Connection(message),
        RequestErrorType::ExecAbort => MuxError::ExecAbort(message),
        RequestErrorType::Timeout => MuxError::Timeout(message),
        RequestErrorType::Unspecified => MuxError::Request(message),
    }
}
