//! USB subsystem
//!
//! Opens the FTDI device with rusb and provides the two collaborators the
//! streaming core needs:
//! - [`FtdiDevice`]: vendor control requests (bit mode, FIFO purge) and chip
//!   detection
//! - [`LibusbTransport`]: asynchronous bulk IN transfers driven through the
//!   libusb event loop
//!
//! Both share one `DeviceHandle`, so the whole session runs on the thread
//! that opened the device.

pub mod device;
pub mod transfers;

pub use device::{FtdiDevice, FtdiInterface};
pub use transfers::{LibusbTransport, map_rusb_error};
