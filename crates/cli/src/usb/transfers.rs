//! Asynchronous bulk transfers over libusb
//!
//! [`LibusbTransport`] implements the streaming core's [`Transport`] with raw
//! libusb transfers. Each submitted buffer gets its own `libusb_transfer`;
//! the completion callback only raises a flag, and `handle_events` hands the
//! flagged transfers to the sink in submission order.

use rusb::ffi::{self, constants::*};
use rusb::{Context, DeviceHandle, UsbContext};
use std::collections::VecDeque;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use stream::{
    CompletedTransfer, Disposition, SlotId, SubmitError, TransferCompletionSink, TransferStatus,
    Transport, TransportError,
};
use tracing::{debug, warn};

/// Event-loop rounds to wait for cancelled transfers when dropped
const DROP_DRAIN_ROUNDS: u32 = 4;

struct AsyncTransfer {
    ptr: NonNull<ffi::libusb_transfer>,
    slot: SlotId,
    buffer: Vec<u8>,
}

impl AsyncTransfer {
    /// Allocate a bulk transfer reading into `buffer`
    ///
    /// Caller must keep `device` open for as long as the transfer lives.
    unsafe fn new_bulk(
        device: *mut ffi::libusb_device_handle,
        endpoint: u8,
        slot: SlotId,
        mut buffer: Vec<u8>,
    ) -> Result<Self, (TransportError, Vec<u8>)> {
        let Ok(length) = i32::try_from(buffer.len()) else {
            return Err((TransportError::InvalidParam, buffer));
        };

        // Safety: zero iso packets for a bulk transfer
        let Some(ptr) = NonNull::new(unsafe { ffi::libusb_alloc_transfer(0) }) else {
            return Err((TransportError::NoMem, buffer));
        };

        let user_data = Box::into_raw(Box::new(AtomicBool::new(false))).cast::<libc::c_void>();

        // Safety: `ptr` was just allocated; the buffer's heap block moves with
        // the Vec, so the pointer stays valid while `self.buffer` is untouched.
        // Timeout 0 means the read waits for data indefinitely.
        unsafe {
            ffi::libusb_fill_bulk_transfer(
                ptr.as_ptr(),
                device,
                endpoint,
                buffer.as_mut_ptr(),
                length,
                Self::transfer_cb,
                user_data,
                0,
            );
        }

        Ok(Self { ptr, slot, buffer })
    }

    extern "system" fn transfer_cb(transfer: *mut ffi::libusb_transfer) {
        // Safety: libusb passes the transfer it just completed; user_data
        // is freed only together with the transfer.
        let completed = unsafe { &*(*transfer).user_data.cast::<AtomicBool>() };
        completed.store(true, Ordering::SeqCst);
    }

    fn transfer(&self) -> &ffi::libusb_transfer {
        // Safety: the transfer stays allocated as long as self
        unsafe { self.ptr.as_ref() }
    }

    fn is_completed(&self) -> bool {
        // Safety: user_data lives as long as the transfer
        unsafe { &*self.transfer().user_data.cast::<AtomicBool>() }.load(Ordering::SeqCst)
    }

    fn submit(&mut self) -> Result<(), TransportError> {
        let length = i32::try_from(self.buffer.len()).map_err(|_| TransportError::InvalidParam)?;

        // Safety: see transfer()
        let transfer = unsafe { self.ptr.as_mut() };
        transfer.buffer = self.buffer.as_mut_ptr();
        transfer.length = length;
        transfer.actual_length = 0;
        // Safety: see transfer()
        unsafe { &*transfer.user_data.cast::<AtomicBool>() }.store(false, Ordering::SeqCst);

        // Safety: the transfer is filled and not currently submitted
        match unsafe { ffi::libusb_submit_transfer(self.ptr.as_ptr()) } {
            0 => Ok(()),
            code => Err(TransportError::from_code(code)),
        }
    }

    fn cancel(&mut self) {
        // Safety: cancelling a finished transfer only returns NOT_FOUND
        let code = unsafe { ffi::libusb_cancel_transfer(self.ptr.as_ptr()) };
        if code != 0 {
            debug!(
                "Cancelling transfer {} returned {}",
                self.slot,
                TransportError::from_code(code)
            );
        }
    }

    fn status(&self) -> TransferStatus {
        map_transfer_status(self.transfer().status)
    }

    fn actual_length(&self) -> usize {
        usize::try_from(self.transfer().actual_length).unwrap_or(0)
    }
}

/// Invariant: transfer must not be pending
impl Drop for AsyncTransfer {
    fn drop(&mut self) {
        // Safety: user_data was created by Box::into_raw in new_bulk
        unsafe {
            drop(Box::from_raw(self.transfer().user_data.cast::<AtomicBool>()));
            ffi::libusb_free_transfer(self.ptr.as_ptr());
        }
    }
}

/// Bulk IN transport on one endpoint of an opened device
pub struct LibusbTransport {
    device: Arc<DeviceHandle<Context>>,
    endpoint: u8,
    pending: VecDeque<AsyncTransfer>,
}

impl LibusbTransport {
    pub fn new(device: Arc<DeviceHandle<Context>>, endpoint: u8) -> Self {
        Self {
            device,
            endpoint,
            pending: VecDeque::new(),
        }
    }

    /// Transfers currently owned by libusb
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    fn wait(&self, timeout: Duration) -> Result<(), TransportError> {
        let timeval = libc::timeval {
            tv_sec: timeout.as_secs().try_into().unwrap_or(libc::time_t::MAX),
            tv_usec: timeout.subsec_micros().try_into().unwrap_or(0),
        };

        // Safety: the context outlives this call through the device handle
        let code = unsafe {
            ffi::libusb_handle_events_timeout(self.device.context().as_raw(), &timeval)
        };
        match code {
            0 => Ok(()),
            code => Err(TransportError::from_code(code)),
        }
    }
}

impl Transport for LibusbTransport {
    fn submit(&mut self, slot: SlotId, buffer: Vec<u8>) -> Result<(), SubmitError> {
        // Safety: the transfer is kept in `pending` and freed before
        // `device` is dropped
        let created =
            unsafe { AsyncTransfer::new_bulk(self.device.as_raw(), self.endpoint, slot, buffer) };
        let mut transfer = created.map_err(|(error, buffer)| SubmitError {
            slot,
            error,
            buffer,
        })?;

        if let Err(error) = transfer.submit() {
            return Err(SubmitError {
                slot,
                error,
                buffer: std::mem::take(&mut transfer.buffer),
            });
        }

        self.pending.push_back(transfer);
        Ok(())
    }

    fn cancel(&mut self, slot: SlotId) {
        if let Some(transfer) = self.pending.iter_mut().find(|t| t.slot == slot) {
            transfer.cancel();
        }
    }

    fn handle_events(
        &mut self,
        timeout: Duration,
        sink: &mut dyn TransferCompletionSink,
    ) -> Result<(), TransportError> {
        self.wait(timeout)?;

        let mut still_pending = VecDeque::with_capacity(self.pending.len());
        let mut completed = Vec::new();
        for transfer in self.pending.drain(..) {
            if transfer.is_completed() {
                completed.push(transfer);
            } else {
                still_pending.push_back(transfer);
            }
        }
        self.pending = still_pending;

        for mut transfer in completed {
            let slot = transfer.slot;
            let disposition = sink.on_complete(CompletedTransfer {
                slot,
                status: transfer.status(),
                actual_length: transfer.actual_length(),
                buffer: std::mem::take(&mut transfer.buffer),
            });

            if let Disposition::Resubmit(buffer) = disposition {
                transfer.buffer = buffer;
                match transfer.submit() {
                    Ok(()) => self.pending.push_back(transfer),
                    Err(error) => sink.on_resubmit_failed(SubmitError {
                        slot,
                        error,
                        buffer: std::mem::take(&mut transfer.buffer),
                    }),
                }
            }
        }

        Ok(())
    }
}

impl Drop for LibusbTransport {
    fn drop(&mut self) {
        if self.pending.is_empty() {
            return;
        }

        debug!("Cancelling {} transfers on drop", self.pending.len());
        for transfer in self.pending.iter_mut().rev() {
            transfer.cancel();
        }

        for _ in 0..DROP_DRAIN_ROUNDS {
            if self.pending.is_empty() {
                break;
            }
            if self.wait(Duration::from_millis(250)).is_err() {
                break;
            }
            self.pending.retain(|transfer| !transfer.is_completed());
        }

        if !self.pending.is_empty() {
            // Freeing a transfer libusb still owns is undefined behaviour
            warn!(
                "{} transfers never completed, leaking them",
                self.pending.len()
            );
            for transfer in self.pending.drain(..) {
                std::mem::forget(transfer);
            }
        }
    }
}

/// Map a libusb transfer status to the streaming core's status
pub fn map_transfer_status(status: i32) -> TransferStatus {
    match status {
        LIBUSB_TRANSFER_COMPLETED => TransferStatus::Completed,
        LIBUSB_TRANSFER_TIMED_OUT => TransferStatus::TimedOut,
        LIBUSB_TRANSFER_CANCELLED => TransferStatus::Cancelled,
        LIBUSB_TRANSFER_STALL => TransferStatus::Stall,
        LIBUSB_TRANSFER_NO_DEVICE => TransferStatus::NoDevice,
        LIBUSB_TRANSFER_OVERFLOW => TransferStatus::Overflow,
        _ => TransferStatus::Error,
    }
}

/// Map rusb::Error to the streaming core's transport error
pub fn map_rusb_error(err: rusb::Error) -> TransportError {
    match err {
        rusb::Error::Io => TransportError::Io,
        rusb::Error::InvalidParam => TransportError::InvalidParam,
        rusb::Error::Access => TransportError::Access,
        rusb::Error::NoDevice => TransportError::NoDevice,
        rusb::Error::NotFound => TransportError::NotFound,
        rusb::Error::Busy => TransportError::Busy,
        rusb::Error::Timeout => TransportError::Timeout,
        rusb::Error::Overflow => TransportError::Overflow,
        rusb::Error::Pipe => TransportError::Pipe,
        rusb::Error::Interrupted => TransportError::Interrupted,
        rusb::Error::NoMem => TransportError::NoMem,
        rusb::Error::NotSupported => TransportError::NotSupported,
        _ => TransportError::Other(err.to_string()),
    }
}
