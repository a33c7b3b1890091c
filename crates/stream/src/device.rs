//! Device-control collaborator
//!
//! Enumeration and handle acquisition happen elsewhere; the session only
//! needs to know what chip it talks to and how to switch its mode.

use crate::error::TransportError;
use std::fmt;
use std::time::Duration;

/// FTDI chip family, as identified by `bcdDevice`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChipType {
    Am,
    Bm,
    Ft2232C,
    R,
    Ft2232H,
    Ft4232H,
    Ft232H,
    Ft230X,
    Unknown,
}

impl ChipType {
    pub fn from_bcd_device(bcd_device: u16) -> Self {
        match bcd_device {
            0x0200 => ChipType::Am,
            0x0400 => ChipType::Bm,
            0x0500 => ChipType::Ft2232C,
            0x0600 => ChipType::R,
            0x0700 => ChipType::Ft2232H,
            0x0800 => ChipType::Ft4232H,
            0x0900 => ChipType::Ft232H,
            0x1000 => ChipType::Ft230X,
            _ => ChipType::Unknown,
        }
    }

    /// Only the FT2232H and FT232H implement synchronous FIFO mode
    pub fn supports_sync_fifo(self) -> bool {
        matches!(self, ChipType::Ft2232H | ChipType::Ft232H)
    }

    /// High-speed chips use 512 byte bulk packets
    pub fn is_high_speed(self) -> bool {
        matches!(
            self,
            ChipType::Ft2232H | ChipType::Ft4232H | ChipType::Ft232H
        )
    }

    /// Packet size used when the endpoint descriptor can't be read
    pub fn default_packet_size(self) -> usize {
        if self.is_high_speed() { 512 } else { 64 }
    }
}

impl fmt::Display for ChipType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChipType::Am => "FT8U232AM",
            ChipType::Bm => "FT232BM",
            ChipType::Ft2232C => "FT2232C",
            ChipType::R => "FT232R",
            ChipType::Ft2232H => "FT2232H",
            ChipType::Ft4232H => "FT4232H",
            ChipType::Ft232H => "FT232H",
            ChipType::Ft230X => "FT230X",
            ChipType::Unknown => "unknown FTDI chip",
        };
        f.write_str(name)
    }
}

/// Bit modes the session switches between
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BitMode {
    Reset = 0x00,
    SyncFifo = 0x40,
}

/// Mode and buffer control of a FIFO-capable device
pub trait FifoDevice {
    fn chip_type(&self) -> ChipType;

    /// Transfer granularity in bytes, header included
    fn max_packet_size(&self) -> usize;

    /// Upper bound for one event-dispatch wait
    fn read_timeout(&self) -> Duration;

    fn set_bitmode(&mut self, mask: u8, mode: BitMode) -> Result<(), TransportError>;

    /// Purge host and device RX/TX buffers
    fn flush_buffers(&mut self) -> Result<(), TransportError>;
}

impl<D: FifoDevice + ?Sized> FifoDevice for &mut D {
    fn chip_type(&self) -> ChipType {
        (**self).chip_type()
    }

    fn max_packet_size(&self) -> usize {
        (**self).max_packet_size()
    }

    fn read_timeout(&self) -> Duration {
        (**self).read_timeout()
    }

    fn set_bitmode(&mut self, mask: u8, mode: BitMode) -> Result<(), TransportError> {
        (**self).set_bitmode(mask, mode)
    }

    fn flush_buffers(&mut self) -> Result<(), TransportError> {
        (**self).flush_buffers()
    }
}
