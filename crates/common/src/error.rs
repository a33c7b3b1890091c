//! Common error types

use stream::error::codes;
use stream::{StreamError, TransportError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("USB error: {0}")]
    Usb(#[from] TransportError),

    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(String),
}

impl Error {
    /// Process exit status for this error
    ///
    /// USB and stream failures keep their libusb-style codes so scripts can
    /// tell a missing device from a stalled stream.
    pub fn code(&self) -> i32 {
        match self {
            Error::Usb(e) => e.code(),
            Error::Stream(e) => e.code(),
            Error::Config(_) => codes::ERROR_INVALID_PARAM,
            Error::Io(_) => codes::ERROR_IO,
            Error::Other(_) => codes::ERROR_OTHER,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
