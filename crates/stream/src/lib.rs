//! Synchronous FIFO streaming core
//!
//! This crate drives continuous, high-throughput reads from an FTDI device in
//! synchronous FIFO mode. It keeps a fixed pool of asynchronous bulk transfers
//! in flight, strips the 2-byte status header from every packet, hands the
//! payload to a consumer and periodically reports throughput.
//!
//! The USB transport and the device-control primitives are collaborators
//! expressed as traits ([`Transport`], [`FifoDevice`]) so the session logic
//! can run against libusb or against the mocks in [`test_utils`].
//!
//! # Example
//!
//! ```
//! use stream::test_utils::{MockDevice, MockTransport};
//! use stream::{Flow, StreamEvent, stream_read};
//!
//! let mut device = MockDevice::ft232h();
//! let mut transport = MockTransport::new();
//! let mut received = 0usize;
//!
//! let result = stream_read(
//!     &mut device,
//!     &mut transport,
//!     &mut |event: StreamEvent<'_>| match event {
//!         StreamEvent::Data(payload) => {
//!             received += payload.len();
//!             if received >= 64 * 1024 { Flow::Stop } else { Flow::Continue }
//!         }
//!         StreamEvent::Progress(_) => Flow::Continue,
//!     },
//!     8,
//!     4,
//! );
//!
//! assert!(result.is_ok());
//! assert_eq!(transport.outstanding(), 0);
//! ```

pub mod config;
pub mod device;
pub mod driver;
pub mod error;
pub mod handler;
pub mod pool;
pub mod progress;
pub mod test_utils;
pub mod time;
pub mod transport;

pub use config::StreamConfig;
pub use device::{BitMode, ChipType, FifoDevice};
pub use driver::{SessionReport, StreamSession, stream_read};
pub use error::{Result, StreamError, TransportError};
pub use handler::{CompletionHandler, Flow, Outcome, StreamConsumer, StreamEvent};
pub use pool::{PoolError, PoolStats, ReleaseReason, SlotState, TransferPool};
pub use progress::{Progress, Sample};
pub use time::{Clock, MonotonicClock, seconds_between};
pub use transport::{
    CompletedTransfer, Disposition, SlotId, SubmitError, TransferCompletionSink, TransferStatus,
    Transport,
};

/// Bytes of modem/line status the device prepends to every packet
pub const PACKET_HEADER_LEN: usize = 2;
