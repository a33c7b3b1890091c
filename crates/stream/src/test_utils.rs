//! Test utilities for the streaming core
//!
//! Provides a scripted transport, a mock device and a manually advanced clock
//! so whole sessions can run without hardware.
//!
//! # Example
//!
//! ```
//! use stream::test_utils::{MockTransport, fill_packets};
//! use stream::TransferStatus;
//!
//! let transport = MockTransport::new()
//!     .per_dispatch(1)
//!     .fail_completion(5, TransferStatus::Error);
//! assert_eq!(transport.outstanding(), 0);
//!
//! let mut buffer = vec![0u8; 1024];
//! fill_packets(&mut buffer, 512, 0xab);
//! assert_eq!(&buffer[512..515], &[0x32, 0x60, 0xab]);
//! ```

use crate::device::{BitMode, ChipType, FifoDevice};
use crate::error::TransportError;
use crate::time::Clock;
use crate::transport::{
    CompletedTransfer, Disposition, SlotId, SubmitError, TransferCompletionSink, TransferStatus,
    Transport,
};
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Modem and line status bytes an idle FTDI chip reports
pub const STATUS_HEADER: [u8; 2] = [0x32, 0x60];

/// Fill `data` with packets of `packet_size` bytes: status header, then `value`
pub fn fill_packets(data: &mut [u8], packet_size: usize, value: u8) {
    for packet in data.chunks_mut(packet_size) {
        for (index, byte) in packet.iter_mut().enumerate() {
            *byte = STATUS_HEADER.get(index).copied().unwrap_or(value);
        }
    }
}

/// Shared, ordered record of calls made on mocks
#[derive(Debug, Clone, Default)]
pub struct CallLog(Rc<RefCell<Vec<String>>>);

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, entry: impl Into<String>) {
        self.0.borrow_mut().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.borrow().clone()
    }

    /// Index of the first entry equal to `entry`
    pub fn position(&self, entry: &str) -> Option<usize> {
        self.0.borrow().iter().position(|e| e == entry)
    }
}

/// Clock that only moves when told to
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Rc<Cell<Instant>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Rc::new(Cell::new(Instant::now())),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now.set(self.now.get() + by);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.now.get()
    }
}

/// Device with configurable chip type and scripted failures
#[derive(Debug)]
pub struct MockDevice {
    chip: ChipType,
    packet_size: usize,
    read_timeout: Duration,
    bitmodes: Vec<BitMode>,
    flushes: u32,
    bitmode_failure: Option<(BitMode, TransportError)>,
    flush_failure: Option<TransportError>,
    log: Option<CallLog>,
}

impl MockDevice {
    pub fn new(chip: ChipType) -> Self {
        Self {
            chip,
            packet_size: chip.default_packet_size(),
            read_timeout: Duration::from_millis(100),
            bitmodes: Vec::new(),
            flushes: 0,
            bitmode_failure: None,
            flush_failure: None,
            log: None,
        }
    }

    pub fn ft232h() -> Self {
        Self::new(ChipType::Ft232H)
    }

    pub fn ft2232h() -> Self {
        Self::new(ChipType::Ft2232H)
    }

    pub fn with_packet_size(mut self, packet_size: usize) -> Self {
        self.packet_size = packet_size;
        self
    }

    pub fn fail_bitmode(mut self, mode: BitMode, error: TransportError) -> Self {
        self.bitmode_failure = Some((mode, error));
        self
    }

    pub fn fail_flush(mut self, error: TransportError) -> Self {
        self.flush_failure = Some(error);
        self
    }

    pub fn with_log(mut self, log: CallLog) -> Self {
        self.log = Some(log);
        self
    }

    /// Bit modes requested so far, failed requests included
    pub fn bitmodes(&self) -> &[BitMode] {
        &self.bitmodes
    }

    pub fn flushes(&self) -> u32 {
        self.flushes
    }
}

impl FifoDevice for MockDevice {
    fn chip_type(&self) -> ChipType {
        self.chip
    }

    fn max_packet_size(&self) -> usize {
        self.packet_size
    }

    fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    fn set_bitmode(&mut self, _mask: u8, mode: BitMode) -> Result<(), TransportError> {
        self.bitmodes.push(mode);
        if let Some(log) = &self.log {
            log.record(format!("bitmode:{:?}", mode));
        }
        match &self.bitmode_failure {
            Some((failing, error)) if *failing == mode => Err(error.clone()),
            _ => Ok(()),
        }
    }

    fn flush_buffers(&mut self) -> Result<(), TransportError> {
        if let Some(error) = &self.flush_failure {
            return Err(error.clone());
        }
        self.flushes += 1;
        if let Some(log) = &self.log {
            log.record("flush");
        }
        Ok(())
    }
}

struct Queued {
    slot: SlotId,
    buffer: Vec<u8>,
    cancelled: bool,
}

/// Scripted in-memory transport
///
/// Every dispatch first returns cancelled transfers, then completes up to
/// `per_dispatch` transfers in submission order, filling each with packets
/// whose payload byte is the completion number. Completion numbers start
/// at 1, submission and dispatch indices at 0.
pub struct MockTransport {
    queue: VecDeque<Queued>,
    packet_size: usize,
    per_dispatch: usize,
    actual_length: Option<usize>,
    submission_failures: HashMap<u64, TransportError>,
    completion_statuses: HashMap<u64, TransferStatus>,
    event_errors: HashMap<u64, TransportError>,
    idle_after: Option<u64>,
    ignore_cancel: bool,
    clock: Option<(ManualClock, Duration)>,
    log: Option<CallLog>,
    seen: HashSet<SlotId>,
    attempts: u64,
    submissions: u64,
    resubmissions: u64,
    cancellations: u64,
    completions: u64,
    dispatches: u64,
    dispatches_before_cancel: Option<u64>,
    max_outstanding: usize,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            packet_size: 512,
            per_dispatch: usize::MAX,
            actual_length: None,
            submission_failures: HashMap::new(),
            completion_statuses: HashMap::new(),
            event_errors: HashMap::new(),
            idle_after: None,
            ignore_cancel: false,
            clock: None,
            log: None,
            seen: HashSet::new(),
            attempts: 0,
            submissions: 0,
            resubmissions: 0,
            cancellations: 0,
            completions: 0,
            dispatches: 0,
            dispatches_before_cancel: None,
            max_outstanding: 0,
        }
    }

    pub fn with_packet_size(mut self, packet_size: usize) -> Self {
        self.packet_size = packet_size;
        self
    }

    /// Complete at most `count` transfers per dispatch
    pub fn per_dispatch(mut self, count: usize) -> Self {
        self.per_dispatch = count;
        self
    }

    /// Report this many received bytes instead of a full buffer
    pub fn with_actual_length(mut self, length: usize) -> Self {
        self.actual_length = Some(length);
        self
    }

    /// Refuse the submission attempt with this index
    pub fn fail_submission(mut self, attempt: u64, error: TransportError) -> Self {
        self.submission_failures.insert(attempt, error);
        self
    }

    /// Finish completion number `completion` with `status`
    pub fn fail_completion(mut self, completion: u64, status: TransferStatus) -> Self {
        self.completion_statuses.insert(completion, status);
        self
    }

    /// Make dispatch number `dispatch` return `error` without completing anything
    pub fn with_event_error(mut self, dispatch: u64, error: TransportError) -> Self {
        self.event_errors.insert(dispatch, error);
        self
    }

    /// Stop completing transfers after `completions` completions
    pub fn idle_after(mut self, completions: u64) -> Self {
        self.idle_after = Some(completions);
        self
    }

    /// Accept cancellations but never act on them
    pub fn ignore_cancel(mut self) -> Self {
        self.ignore_cancel = true;
        self
    }

    /// Advance `clock` by `tick` on every dispatch
    pub fn with_clock(mut self, clock: ManualClock, tick: Duration) -> Self {
        self.clock = Some((clock, tick));
        self
    }

    pub fn with_log(mut self, log: CallLog) -> Self {
        self.log = Some(log);
        self
    }

    /// Buffers currently owned by the transport
    pub fn outstanding(&self) -> usize {
        self.queue.len()
    }

    pub fn max_outstanding(&self) -> usize {
        self.max_outstanding
    }

    /// Accepted submissions, resubmissions included
    pub fn submissions(&self) -> u64 {
        self.submissions
    }

    /// Accepted submissions of a slot that had completed before
    pub fn resubmissions(&self) -> u64 {
        self.resubmissions
    }

    pub fn cancellations(&self) -> u64 {
        self.cancellations
    }

    /// Completions dispatched, cancelled ones excluded
    pub fn completions(&self) -> u64 {
        self.completions
    }

    pub fn dispatches(&self) -> u64 {
        self.dispatches
    }

    /// Dispatches that ran before the first cancellation
    pub fn dispatches_before_cancel(&self) -> Option<u64> {
        self.dispatches_before_cancel
    }

    fn is_idle(&self) -> bool {
        self.idle_after
            .is_some_and(|limit| self.completions >= limit)
    }

    fn settle(
        &mut self,
        slot: SlotId,
        disposition: Disposition,
        sink: &mut dyn TransferCompletionSink,
    ) {
        if let Disposition::Resubmit(buffer) = disposition {
            if let Err(failed) = self.submit(slot, buffer) {
                sink.on_resubmit_failed(failed);
            }
        }
    }
}

impl Transport for MockTransport {
    fn submit(&mut self, slot: SlotId, buffer: Vec<u8>) -> Result<(), SubmitError> {
        let attempt = self.attempts;
        self.attempts += 1;

        if let Some(error) = self.submission_failures.remove(&attempt) {
            return Err(SubmitError {
                slot,
                error,
                buffer,
            });
        }

        if let Some(log) = &self.log {
            log.record(format!("submit:{}", slot.0));
        }
        self.submissions += 1;
        if !self.seen.insert(slot) {
            self.resubmissions += 1;
        }
        self.queue.push_back(Queued {
            slot,
            buffer,
            cancelled: false,
        });
        self.max_outstanding = self.max_outstanding.max(self.queue.len());
        Ok(())
    }

    fn cancel(&mut self, slot: SlotId) {
        self.cancellations += 1;
        self.dispatches_before_cancel.get_or_insert(self.dispatches);
        if let Some(log) = &self.log {
            log.record(format!("cancel:{}", slot.0));
        }
        if self.ignore_cancel {
            return;
        }
        if let Some(entry) = self.queue.iter_mut().find(|entry| entry.slot == slot) {
            entry.cancelled = true;
        }
    }

    fn handle_events(
        &mut self,
        _timeout: Duration,
        sink: &mut dyn TransferCompletionSink,
    ) -> Result<(), TransportError> {
        let dispatch = self.dispatches;
        self.dispatches += 1;

        if let Some((clock, tick)) = &self.clock {
            clock.advance(*tick);
        }
        if let Some(error) = self.event_errors.remove(&dispatch) {
            return Err(error);
        }

        let (cancelled, pending): (VecDeque<Queued>, VecDeque<Queued>) =
            self.queue.drain(..).partition(|entry| entry.cancelled);
        self.queue = pending;

        for entry in cancelled {
            let disposition = sink.on_complete(CompletedTransfer {
                slot: entry.slot,
                status: TransferStatus::Cancelled,
                buffer: entry.buffer,
                actual_length: 0,
            });
            self.settle(entry.slot, disposition, sink);
        }

        let budget = self.per_dispatch.min(self.queue.len());
        for _ in 0..budget {
            if self.is_idle() {
                break;
            }
            let Some(mut entry) = self.queue.pop_front() else {
                break;
            };

            self.completions += 1;
            let number = self.completions;
            let status = self
                .completion_statuses
                .remove(&number)
                .unwrap_or(TransferStatus::Completed);
            let actual_length = if status.is_success() {
                self.actual_length
                    .unwrap_or(entry.buffer.len())
                    .min(entry.buffer.len())
            } else {
                0
            };
            fill_packets(
                &mut entry.buffer[..actual_length],
                self.packet_size,
                number as u8,
            );

            let disposition = sink.on_complete(CompletedTransfer {
                slot: entry.slot,
                status,
                buffer: entry.buffer,
                actual_length,
            });
            self.settle(entry.slot, disposition, sink);
        }

        Ok(())
    }
}
