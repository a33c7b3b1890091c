//! Completion handling
//!
//! The [`CompletionHandler`] owns the session state shared between the driver
//! loop and the completions: the activity counter, the sticky outcome and the
//! progress accumulator. Completions run inside the transport's event
//! dispatch on the driver thread, so plain fields are enough.

use crate::PACKET_HEADER_LEN;
use crate::error::StreamError;
use crate::pool::{ReleaseReason, TransferPool};
use crate::progress::Progress;
use crate::transport::{
    CompletedTransfer, Disposition, SubmitError, TransferCompletionSink, TransferStatus,
};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Consumer's answer to a data chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// What the consumer is handed
#[derive(Debug, Clone, Copy)]
pub enum StreamEvent<'a> {
    /// Payload of one packet, header stripped
    Data(&'a [u8]),
    /// Periodic throughput report
    Progress(&'a Progress),
}

/// Receiver of streamed payload and progress reports
///
/// The [`Flow`] returned for a [`StreamEvent::Progress`] is ignored.
pub trait StreamConsumer {
    fn on_event(&mut self, event: StreamEvent<'_>) -> Flow;
}

impl<F> StreamConsumer for F
where
    F: FnMut(StreamEvent<'_>) -> Flow,
{
    fn on_event(&mut self, event: StreamEvent<'_>) -> Flow {
        self(event)
    }
}

/// Terminal status of a session
#[derive(Debug)]
pub enum Outcome {
    /// The consumer asked to stop
    Stopped,
    Failed(StreamError),
}

pub struct CompletionHandler<'c, C: StreamConsumer + ?Sized> {
    consumer: &'c mut C,
    packet_size: usize,
    activity: u64,
    outcome: Option<Outcome>,
    progress: Progress,
    pool: TransferPool,
}

impl<'c, C: StreamConsumer + ?Sized> CompletionHandler<'c, C> {
    pub fn new(consumer: &'c mut C, packet_size: usize, pool: TransferPool, start: Instant) -> Self {
        Self {
            consumer,
            packet_size,
            // Counts as activity so the first empty wait isn't a stall
            activity: 1,
            outcome: None,
            progress: Progress::new(start),
            pool,
        }
    }

    /// True until the sticky outcome is set
    pub fn is_running(&self) -> bool {
        self.outcome.is_none()
    }

    pub fn outcome(&self) -> Option<&Outcome> {
        self.outcome.as_ref()
    }

    /// Record a terminal outcome unless one is already set
    pub fn settle(&mut self, outcome: Outcome) {
        if self.outcome.is_none() {
            self.outcome = Some(outcome);
        } else {
            debug!("Ignoring {:?}, session outcome already set", outcome);
        }
    }

    pub fn fail(&mut self, error: StreamError) {
        self.settle(Outcome::Failed(error));
    }

    /// Completions since the last call, resetting the counter
    pub fn take_activity(&mut self) -> u64 {
        std::mem::take(&mut self.activity)
    }

    /// Restart the throughput clock, used once the device starts streaming
    pub fn restart_progress(&mut self, start: Instant) {
        self.progress = Progress::new(start);
    }

    /// Run the periodic progress report if `interval` has elapsed
    pub fn report_progress(&mut self, now: Instant, interval: Duration) -> bool {
        let consumer = &mut *self.consumer;
        self.progress.maybe_report(now, interval, |progress| {
            let _ = consumer.on_event(StreamEvent::Progress(progress));
        })
    }

    pub fn progress(&self) -> &Progress {
        &self.progress
    }

    pub fn pool(&self) -> &TransferPool {
        &self.pool
    }

    pub fn pool_mut(&mut self) -> &mut TransferPool {
        &mut self.pool
    }

    pub fn into_parts(self) -> (Option<Outcome>, Progress, TransferPool) {
        (self.outcome, self.progress, self.pool)
    }

    /// Split `data` into packets and deliver each payload
    ///
    /// The last packet may be short. Delivery ends at the first
    /// [`Flow::Stop`].
    fn deliver(&mut self, data: &[u8]) -> Flow {
        for packet in data.chunks(self.packet_size) {
            let payload = packet.get(PACKET_HEADER_LEN..).unwrap_or(&[]);
            self.progress.record_bytes(payload.len() as u64);

            if self.consumer.on_event(StreamEvent::Data(payload)) == Flow::Stop {
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    fn release(&mut self, transfer: CompletedTransfer, reason: ReleaseReason) -> Disposition {
        let slot = transfer.slot;
        if let Err(e) = self.pool.release(slot, transfer.buffer, reason) {
            error!("Released transfer {} out of order: {}", slot, e);
        }
        Disposition::Release
    }
}

impl<C: StreamConsumer + ?Sized> TransferCompletionSink for CompletionHandler<'_, C> {
    fn on_complete(&mut self, transfer: CompletedTransfer) -> Disposition {
        self.activity += 1;
        let slot = transfer.slot;

        if !transfer.status.is_success() {
            if self.is_running() {
                warn!("Transfer {} finished with status {}", slot, transfer.status);
                self.fail(StreamError::Transfer {
                    slot,
                    status: transfer.status,
                });
                return self.release(transfer, ReleaseReason::Failed);
            }

            if transfer.status != TransferStatus::Cancelled {
                warn!(
                    "Transfer {} finished with status {} while shutting down",
                    slot, transfer.status
                );
            }
            return self.release(transfer, ReleaseReason::Drained);
        }

        // No more data once the consumer asked to stop
        if matches!(self.outcome, Some(Outcome::Stopped)) {
            return self.release(transfer, ReleaseReason::Drained);
        }

        // Data already read is still delivered, but never re-queued
        if !self.is_running() {
            let _ = self.deliver(transfer.data());
            return self.release(transfer, ReleaseReason::Failed);
        }

        if self.deliver(transfer.data()) == Flow::Stop {
            debug!("Consumer requested stop on transfer {}", slot);
            self.settle(Outcome::Stopped);
            return self.release(transfer, ReleaseReason::Stopped);
        }

        match self.pool.mark_resubmitted(slot) {
            Ok(()) => Disposition::Resubmit(transfer.buffer),
            Err(e) => {
                error!("Completion for transfer {} not in flight: {}", slot, e);
                Disposition::Release
            }
        }
    }

    fn on_resubmit_failed(&mut self, failed: SubmitError) {
        let slot = failed.slot;
        warn!("Resubmitting transfer {} failed: {}", slot, failed.error);
        if let Err(e) = self.pool.resubmit_failed(slot, failed.buffer) {
            error!("Resubmit failure for transfer {}: {}", slot, e);
        }
        self.fail(StreamError::Submit {
            slot,
            source: failed.error,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::pool::SlotState;
    use crate::test_utils::{MockTransport, fill_packets};
    use crate::transport::SlotId;

    const PACKET: usize = 512;

    fn completed(slot: usize, data: Vec<u8>) -> CompletedTransfer {
        let actual_length = data.len();
        CompletedTransfer {
            slot: SlotId(slot),
            status: TransferStatus::Completed,
            buffer: data,
            actual_length,
        }
    }

    fn primed_pool(transfers: usize, buffer_size: usize) -> TransferPool {
        let mut transport = MockTransport::new();
        let mut pool = TransferPool::new(transfers, buffer_size).unwrap();
        pool.setup(&mut transport).unwrap();
        pool
    }

    #[test]
    fn test_exact_multiple_splits_into_packets() {
        let mut chunks = Vec::new();
        let mut consumer = |event: StreamEvent<'_>| {
            if let StreamEvent::Data(payload) = event {
                chunks.push(payload.to_vec());
            }
            Flow::Continue
        };
        let mut handler =
            CompletionHandler::new(&mut consumer, PACKET, primed_pool(1, 4096), Instant::now());

        let mut data = vec![0u8; 4096];
        fill_packets(&mut data, PACKET, 7);
        let disposition = handler.on_complete(completed(0, data));

        assert!(matches!(disposition, Disposition::Resubmit(ref b) if b.len() == 4096));
        assert_eq!(handler.progress().total_bytes(), 4096 - 2 * 8);
        drop(handler);

        assert_eq!(chunks.len(), 8);
        assert!(chunks.iter().all(|c| c.len() == PACKET - 2));
        assert!(chunks.iter().all(|c| c.iter().all(|b| *b == 7)));
    }

    #[test]
    fn test_short_final_packet() {
        let mut lengths = Vec::new();
        let mut consumer = |event: StreamEvent<'_>| {
            if let StreamEvent::Data(payload) = event {
                lengths.push(payload.len());
            }
            Flow::Continue
        };
        let mut handler =
            CompletionHandler::new(&mut consumer, PACKET, primed_pool(1, 4096), Instant::now());

        // 2 full packets plus a 100 byte packet
        let length = 2 * PACKET + 100;
        let mut transfer = completed(0, vec![0u8; 4096]);
        transfer.actual_length = length;
        handler.on_complete(transfer);
        drop(handler);

        let packets = length.div_ceil(PACKET);
        assert_eq!(lengths, vec![510, 510, 98]);
        assert_eq!(lengths.iter().sum::<usize>(), length - 2 * packets);
    }

    #[test]
    fn test_header_only_packets_deliver_empty_payload() {
        let mut lengths = Vec::new();
        let mut consumer = |event: StreamEvent<'_>| {
            if let StreamEvent::Data(payload) = event {
                lengths.push(payload.len());
            }
            Flow::Continue
        };
        let mut handler =
            CompletionHandler::new(&mut consumer, PACKET, primed_pool(1, 4096), Instant::now());

        let mut transfer = completed(0, vec![0u8; 4096]);
        transfer.actual_length = 2;
        handler.on_complete(transfer);
        drop(handler);

        assert_eq!(lengths, vec![0]);
    }

    #[test]
    fn test_stop_releases_without_resubmit() {
        let mut consumer = |_: StreamEvent<'_>| Flow::Stop;
        let mut handler =
            CompletionHandler::new(&mut consumer, PACKET, primed_pool(2, 1024), Instant::now());

        let disposition = handler.on_complete(completed(1, vec![0u8; 1024]));

        assert!(matches!(disposition, Disposition::Release));
        assert!(matches!(handler.outcome(), Some(Outcome::Stopped)));
        assert_eq!(handler.pool().state(SlotId(1)), Some(SlotState::Free));
        assert_eq!(handler.pool().state(SlotId(0)), Some(SlotState::InFlight));
        assert_eq!(handler.pool().stats().released_on_stop, 1);
        assert_eq!(handler.pool().stats().resubmitted, 0);
    }

    #[test]
    fn test_completions_after_stop_are_drained_silently() {
        let mut deliveries = 0;
        let mut consumer = |event: StreamEvent<'_>| {
            if let StreamEvent::Data(_) = event {
                deliveries += 1;
            }
            Flow::Stop
        };
        let mut handler =
            CompletionHandler::new(&mut consumer, PACKET, primed_pool(2, 512), Instant::now());

        handler.on_complete(completed(0, vec![0u8; 512]));
        let second = handler.on_complete(completed(1, vec![0u8; 512]));
        assert!(matches!(second, Disposition::Release));
        assert_eq!(handler.pool().stats().drained, 1);
        assert_eq!(handler.pool().in_flight(), 0);
        drop(handler);

        assert_eq!(deliveries, 1);
    }

    #[test]
    fn test_error_status_is_sticky_first_wins() {
        let mut consumer = |_: StreamEvent<'_>| Flow::Continue;
        let mut handler =
            CompletionHandler::new(&mut consumer, PACKET, primed_pool(3, 512), Instant::now());

        let mut failed = completed(0, vec![0u8; 512]);
        failed.status = TransferStatus::Stall;
        assert!(matches!(handler.on_complete(failed), Disposition::Release));

        let mut second = completed(1, vec![0u8; 512]);
        second.status = TransferStatus::NoDevice;
        handler.on_complete(second);

        match handler.outcome() {
            Some(Outcome::Failed(StreamError::Transfer { slot, status })) => {
                assert_eq!(*slot, SlotId(0));
                assert_eq!(*status, TransferStatus::Stall);
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        // Successful completions after a failure are not re-queued
        let third = handler.on_complete(completed(2, vec![0u8; 512]));
        assert!(matches!(third, Disposition::Release));
        assert_eq!(handler.pool().in_flight(), 0);
    }

    #[test]
    fn test_activity_counts_every_completion() {
        let mut consumer = |_: StreamEvent<'_>| Flow::Continue;
        let mut handler =
            CompletionHandler::new(&mut consumer, PACKET, primed_pool(2, 512), Instant::now());

        assert_eq!(handler.take_activity(), 1);
        assert_eq!(handler.take_activity(), 0);

        handler.on_complete(completed(0, vec![0u8; 512]));
        let mut failed = completed(1, vec![0u8; 512]);
        failed.status = TransferStatus::Error;
        handler.on_complete(failed);

        assert_eq!(handler.take_activity(), 2);
    }

    #[test]
    fn test_resubmit_failure_recorded() {
        let mut consumer = |_: StreamEvent<'_>| Flow::Continue;
        let mut handler =
            CompletionHandler::new(&mut consumer, PACKET, primed_pool(1, 512), Instant::now());

        let buffer = match handler.on_complete(completed(0, vec![0u8; 512])) {
            Disposition::Resubmit(buffer) => buffer,
            Disposition::Release => panic!("expected resubmit"),
        };
        handler.on_resubmit_failed(SubmitError {
            slot: SlotId(0),
            error: TransportError::NoDevice,
            buffer,
        });

        assert!(matches!(
            handler.outcome(),
            Some(Outcome::Failed(StreamError::Submit {
                source: TransportError::NoDevice,
                ..
            }))
        ));
        assert_eq!(handler.pool().in_flight(), 0);
        assert_eq!(handler.pool().stats().resubmit_failures, 1);
    }

    #[test]
    fn test_progress_report_uses_consumer() {
        let mut reports = Vec::new();
        let mut consumer = |event: StreamEvent<'_>| {
            if let StreamEvent::Progress(progress) = event {
                reports.push(progress.total_bytes());
            }
            Flow::Stop
        };
        let start = Instant::now();
        let mut handler =
            CompletionHandler::new(&mut consumer, PACKET, primed_pool(1, 512), start);

        assert!(!handler.report_progress(start, Duration::from_secs(1)));
        assert!(handler.report_progress(start + Duration::from_secs(1), Duration::from_secs(1)));
        // A Stop returned for a progress report is ignored
        assert!(handler.is_running());
        drop(handler);

        assert_eq!(reports, vec![0]);
    }
}
