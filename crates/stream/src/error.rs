//! Stream error types

use crate::device::ChipType;
use crate::transport::{SlotId, TransferStatus};
use std::time::Duration;
use thiserror::Error;

/// libusb-compatible status codes
pub mod codes {
    pub const SUCCESS: i32 = 0;
    pub const ERROR_IO: i32 = -1;
    pub const ERROR_INVALID_PARAM: i32 = -2;
    pub const ERROR_ACCESS: i32 = -3;
    pub const ERROR_NO_DEVICE: i32 = -4;
    pub const ERROR_NOT_FOUND: i32 = -5;
    pub const ERROR_BUSY: i32 = -6;
    pub const ERROR_TIMEOUT: i32 = -7;
    pub const ERROR_OVERFLOW: i32 = -8;
    pub const ERROR_PIPE: i32 = -9;
    pub const ERROR_INTERRUPTED: i32 = -10;
    pub const ERROR_NO_MEM: i32 = -11;
    pub const ERROR_NOT_SUPPORTED: i32 = -12;
    pub const ERROR_OTHER: i32 = -99;

    /// Status returned for setup failures and stalls
    pub const SESSION_ABORTED: i32 = 1;
}

/// Errors reported by the USB transport layer
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Input/output error")]
    Io,

    #[error("Invalid parameter")]
    InvalidParam,

    #[error("Access denied")]
    Access,

    #[error("No such device (it may have been disconnected)")]
    NoDevice,

    #[error("Entity not found")]
    NotFound,

    #[error("Resource busy")]
    Busy,

    #[error("Operation timed out")]
    Timeout,

    #[error("Overflow")]
    Overflow,

    #[error("Pipe error")]
    Pipe,

    #[error("System call interrupted")]
    Interrupted,

    #[error("Insufficient memory")]
    NoMem,

    #[error("Operation not supported")]
    NotSupported,

    #[error("Other error: {0}")]
    Other(String),
}

impl TransportError {
    /// libusb status code for this error
    pub fn code(&self) -> i32 {
        match self {
            TransportError::Io => codes::ERROR_IO,
            TransportError::InvalidParam => codes::ERROR_INVALID_PARAM,
            TransportError::Access => codes::ERROR_ACCESS,
            TransportError::NoDevice => codes::ERROR_NO_DEVICE,
            TransportError::NotFound => codes::ERROR_NOT_FOUND,
            TransportError::Busy => codes::ERROR_BUSY,
            TransportError::Timeout => codes::ERROR_TIMEOUT,
            TransportError::Overflow => codes::ERROR_OVERFLOW,
            TransportError::Pipe => codes::ERROR_PIPE,
            TransportError::Interrupted => codes::ERROR_INTERRUPTED,
            TransportError::NoMem => codes::ERROR_NO_MEM,
            TransportError::NotSupported => codes::ERROR_NOT_SUPPORTED,
            TransportError::Other(_) => codes::ERROR_OTHER,
        }
    }

    /// Map a negative libusb status code back to an error
    pub fn from_code(code: i32) -> Self {
        match code {
            codes::ERROR_IO => TransportError::Io,
            codes::ERROR_INVALID_PARAM => TransportError::InvalidParam,
            codes::ERROR_ACCESS => TransportError::Access,
            codes::ERROR_NO_DEVICE => TransportError::NoDevice,
            codes::ERROR_NOT_FOUND => TransportError::NotFound,
            codes::ERROR_BUSY => TransportError::Busy,
            codes::ERROR_TIMEOUT => TransportError::Timeout,
            codes::ERROR_OVERFLOW => TransportError::Overflow,
            codes::ERROR_PIPE => TransportError::Pipe,
            codes::ERROR_INTERRUPTED => TransportError::Interrupted,
            codes::ERROR_NO_MEM => TransportError::NoMem,
            codes::ERROR_NOT_SUPPORTED => TransportError::NotSupported,
            other => TransportError::Other(format!("libusb status {}", other)),
        }
    }
}

/// Terminal errors of a streaming session
#[derive(Debug, Error)]
pub enum StreamError {
    /// Chip has no synchronous FIFO mode
    #[error("Device {0} doesn't support synchronous FIFO mode")]
    UnsupportedChip(ChipType),

    #[error("Can't reset mode: {0}")]
    ModeReset(#[source] TransportError),

    #[error("Can't flush FIFOs & buffers: {0}")]
    Flush(#[source] TransportError),

    #[error("Can't set synchronous FIFO mode: {0}")]
    SyncFifoMode(#[source] TransportError),

    #[error("Invalid stream configuration: {0}")]
    InvalidConfig(String),

    /// A transfer buffer or the slot table could not be allocated
    #[error("Out of memory allocating {size} bytes")]
    NoMemory { size: usize },

    #[error("Failed to submit transfer {slot}: {source}")]
    Submit {
        slot: SlotId,
        #[source]
        source: TransportError,
    },

    /// A transfer completed with a non-success status
    #[error("Transfer {slot} finished with status {status}")]
    Transfer { slot: SlotId, status: TransferStatus },

    #[error("Event handling failed: {0}")]
    Transport(#[from] TransportError),

    /// No transfer completed within one read timeout
    #[error("Stream stalled: no transfer completed within {timeout:?}")]
    Stall { timeout: Duration },
}

impl StreamError {
    /// Integer status of the session, `0` being reserved for a clean stop
    pub fn code(&self) -> i32 {
        match self {
            StreamError::UnsupportedChip(_)
            | StreamError::ModeReset(_)
            | StreamError::Flush(_)
            | StreamError::SyncFifoMode(_)
            | StreamError::Stall { .. } => codes::SESSION_ABORTED,
            StreamError::InvalidConfig(_) => codes::ERROR_INVALID_PARAM,
            StreamError::NoMemory { .. } => codes::ERROR_NO_MEM,
            StreamError::Submit { source, .. } => source.code(),
            StreamError::Transfer { .. } => codes::ERROR_IO,
            StreamError::Transport(e) => e.code(),
        }
    }
}

/// Type alias for stream results
pub type Result<T> = std::result::Result<T, StreamError>;
