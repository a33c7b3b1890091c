//! Asynchronous transfer transport abstraction
//!
//! A [`Transport`] moves bytes; the session only decides what happens to a
//! transfer once it comes back. Submitting moves the buffer into the
//! transport, and the buffer is handed back either inside a
//! [`CompletedTransfer`] or inside a [`SubmitError`]. There is no other way
//! to get it back, so a buffer cannot be released twice.

use crate::error::TransportError;
use std::fmt;
use std::time::Duration;

/// Index of a transfer slot in the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(pub usize);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Final status of one transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Completed,
    Error,
    TimedOut,
    Cancelled,
    Stall,
    NoDevice,
    Overflow,
}

impl TransferStatus {
    pub fn is_success(self) -> bool {
        self == TransferStatus::Completed
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransferStatus::Completed => "completed",
            TransferStatus::Error => "error",
            TransferStatus::TimedOut => "timed out",
            TransferStatus::Cancelled => "cancelled",
            TransferStatus::Stall => "stall",
            TransferStatus::NoDevice => "no device",
            TransferStatus::Overflow => "overflow",
        };
        f.write_str(name)
    }
}

/// A transfer handed back by the transport
#[derive(Debug)]
pub struct CompletedTransfer {
    pub slot: SlotId,
    pub status: TransferStatus,
    /// Full-size buffer; only the first `actual_length` bytes are valid
    pub buffer: Vec<u8>,
    pub actual_length: usize,
}

impl CompletedTransfer {
    /// Received bytes
    pub fn data(&self) -> &[u8] {
        let len = self.actual_length.min(self.buffer.len());
        &self.buffer[..len]
    }
}

/// A submission the transport refused, returning the buffer
#[derive(Debug)]
pub struct SubmitError {
    pub slot: SlotId,
    pub error: TransportError,
    pub buffer: Vec<u8>,
}

/// What the sink wants done with a completed transfer
#[derive(Debug)]
pub enum Disposition {
    /// Queue the same slot again with this buffer
    Resubmit(Vec<u8>),
    /// The slot is finished; the sink has already dropped the buffer
    Release,
}

/// Receiver of transfer completions
///
/// Called from inside [`Transport::handle_events`], on the thread that
/// pumps events.
pub trait TransferCompletionSink {
    fn on_complete(&mut self, transfer: CompletedTransfer) -> Disposition;

    /// A [`Disposition::Resubmit`] could not be queued
    fn on_resubmit_failed(&mut self, failed: SubmitError);
}

/// Asynchronous bulk-read transport
pub trait Transport {
    /// Queue a read of `buffer.len()` bytes for `slot`
    fn submit(&mut self, slot: SlotId, buffer: Vec<u8>) -> Result<(), SubmitError>;

    /// Request cancellation; the transfer still completes (as cancelled)
    /// through a later [`Transport::handle_events`] call
    fn cancel(&mut self, slot: SlotId);

    /// Wait up to `timeout` for completions and dispatch each one to `sink`
    ///
    /// Returns `Ok(())` on timeout. Every completion is dispatched exactly
    /// once, and resubmissions requested by the sink are queued before
    /// this returns.
    fn handle_events(
        &mut self,
        timeout: Duration,
        sink: &mut dyn TransferCompletionSink,
    ) -> Result<(), TransportError>;
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn submit(&mut self, slot: SlotId, buffer: Vec<u8>) -> Result<(), SubmitError> {
        (**self).submit(slot, buffer)
    }

    fn cancel(&mut self, slot: SlotId) {
        (**self).cancel(slot)
    }

    fn handle_events(
        &mut self,
        timeout: Duration,
        sink: &mut dyn TransferCompletionSink,
    ) -> Result<(), TransportError> {
        (**self).handle_events(timeout, sink)
    }
}
