//! Streaming driver loop
//!
//! One call runs a whole session:
//!
//! 1. Check the chip supports synchronous FIFO mode
//! 2. Reset the bit mode and purge both FIFOs
//! 3. Prime the transfer pool
//! 4. Switch to synchronous FIFO mode, then pump events until the sticky
//!    outcome is set (consumer stop, transfer error or stall)
//! 5. Cancel whatever is still in flight and drain it
//!
//! The device is only switched into streaming mode once every transfer is
//! queued, otherwise the host misses data while the pool fills up.

use crate::config::StreamConfig;
use crate::device::{BitMode, FifoDevice};
use crate::error::{StreamError, TransportError};
use crate::handler::{CompletionHandler, Outcome, StreamConsumer};
use crate::pool::{PoolStats, TransferPool};
use crate::progress::Progress;
use crate::time::{Clock, MonotonicClock};
use crate::transport::{SlotId, Transport};
use crate::PACKET_HEADER_LEN;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Summary of a session that ended on a consumer stop
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub progress: Progress,
    pub pool: PoolStats,
    /// Slots still in flight after draining
    pub leaked: usize,
}

/// A configured streaming session
#[derive(Debug, Clone)]
pub struct StreamSession<K: Clock = MonotonicClock> {
    config: StreamConfig,
    clock: K,
}

impl StreamSession<MonotonicClock> {
    pub fn new(config: StreamConfig) -> Self {
        Self {
            config,
            clock: MonotonicClock,
        }
    }
}

impl<K: Clock> StreamSession<K> {
    pub fn with_clock(config: StreamConfig, clock: K) -> Self {
        Self { config, clock }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Stream until the consumer stops or the session fails
    ///
    /// `Ok` means the consumer asked to stop and every transfer settled.
    pub fn run<D, T, C>(
        &self,
        device: &mut D,
        transport: &mut T,
        consumer: &mut C,
    ) -> Result<SessionReport, StreamError>
    where
        D: FifoDevice + ?Sized,
        T: Transport + ?Sized,
        C: StreamConsumer + ?Sized,
    {
        self.config.validate()?;

        let chip = device.chip_type();
        if !chip.supports_sync_fifo() {
            error!("Device {} doesn't support synchronous FIFO mode", chip);
            return Err(StreamError::UnsupportedChip(chip));
        }

        let packet_size = device.max_packet_size();
        if packet_size <= PACKET_HEADER_LEN {
            error!("Device reports an unusable packet size of {}", packet_size);
            return Err(StreamError::InvalidConfig(format!(
                "max packet size {} leaves no room for payload after the {}-byte header",
                packet_size, PACKET_HEADER_LEN
            )));
        }

        // We don't know what state the device is in
        device.set_bitmode(0xff, BitMode::Reset).map_err(|e| {
            error!("Can't reset mode: {}", e);
            StreamError::ModeReset(e)
        })?;

        device.flush_buffers().map_err(|e| {
            error!("Can't flush FIFOs & buffers: {}", e);
            StreamError::Flush(e)
        })?;

        let buffer_size = self.config.buffer_size(packet_size)?;
        let read_timeout = device.read_timeout();

        let pool = TransferPool::new(self.config.num_transfers, buffer_size)?;
        let mut handler = CompletionHandler::new(consumer, packet_size, pool, self.clock.now());

        info!(
            "Streaming from {}: {} transfers x {} packets of {} bytes",
            chip, self.config.num_transfers, self.config.packets_per_transfer, packet_size
        );

        match handler.pool_mut().setup(transport) {
            Err(e) => {
                error!("Failed to set up transfers: {}", e);
                handler.fail(e);
            }
            Ok(()) => match device.set_bitmode(0xff, BitMode::SyncFifo) {
                Err(e) => {
                    error!("Can't set synchronous FIFO mode: {}", e);
                    handler.fail(StreamError::SyncFifoMode(e));
                }
                Ok(()) => {
                    handler.restart_progress(self.clock.now());
                    self.pump(transport, &mut handler, read_timeout);
                }
            },
        }

        let leaked = self.drain(transport, &mut handler, read_timeout);
        let (outcome, progress, pool) = handler.into_parts();

        info!(
            "Stream finished: {} payload bytes, {} completions",
            progress.total_bytes(),
            pool.stats().completions
        );

        match outcome {
            Some(Outcome::Failed(e)) => {
                if leaked > 0 {
                    error!(
                        "Session failed with {} transfers still pending: {}",
                        leaked, e
                    );
                }
                Err(e)
            }
            Some(Outcome::Stopped) | None => Ok(SessionReport {
                progress,
                pool: pool.stats(),
                leaked,
            }),
        }
    }

    fn pump<T, C>(
        &self,
        transport: &mut T,
        handler: &mut CompletionHandler<'_, C>,
        read_timeout: Duration,
    ) where
        T: Transport + ?Sized,
        C: StreamConsumer + ?Sized,
    {
        let interval = self.config.progress_interval();

        while handler.is_running() {
            let mut result = transport.handle_events(read_timeout, handler);
            if result == Err(TransportError::Interrupted) {
                debug!("Event handling interrupted, retrying");
                result = transport.handle_events(read_timeout, handler);
            }
            if let Err(e) = result {
                warn!("Event handling failed: {}", e);
                handler.fail(StreamError::Transport(e));
            }

            if handler.take_activity() == 0 {
                warn!("No transfer completed within {:?}", read_timeout);
                handler.fail(StreamError::Stall {
                    timeout: read_timeout,
                });
            }

            handler.report_progress(self.clock.now(), interval);
        }
    }

    /// Cancel outstanding transfers and pump until they come back
    ///
    /// Gives up after `drain_rounds` consecutive waits without a completion
    /// and returns the number of slots still in flight.
    fn drain<T, C>(
        &self,
        transport: &mut T,
        handler: &mut CompletionHandler<'_, C>,
        read_timeout: Duration,
    ) -> usize
    where
        T: Transport + ?Sized,
        C: StreamConsumer + ?Sized,
    {
        let pending: Vec<SlotId> = handler.pool().in_flight_slots().collect();
        if pending.is_empty() {
            return 0;
        }

        debug!("Cancelling {} outstanding transfers", pending.len());
        // Newest first so a later transfer can't reach the bus after an
        // earlier one was cancelled
        for slot in pending.into_iter().rev() {
            transport.cancel(slot);
        }

        handler.take_activity();
        let mut idle_rounds = 0;
        while handler.pool().in_flight() > 0 && idle_rounds < self.config.drain_rounds {
            if let Err(e) = transport.handle_events(read_timeout, handler) {
                debug!("Event handling during cleanup failed: {}", e);
            }
            if handler.take_activity() == 0 {
                idle_rounds += 1;
            } else {
                idle_rounds = 0;
            }
        }

        let leaked = handler.pool().in_flight();
        if leaked > 0 {
            warn!("{} transfers did not return after cancellation", leaked);
        }
        leaked
    }
}

/// Stream from `device` with the default session settings
///
/// `packets_per_transfer * num_transfers` packets bound the buffer memory in
/// flight.
pub fn stream_read<D, T, C>(
    device: &mut D,
    transport: &mut T,
    consumer: &mut C,
    packets_per_transfer: usize,
    num_transfers: usize,
) -> Result<SessionReport, StreamError>
where
    D: FifoDevice + ?Sized,
    T: Transport + ?Sized,
    C: StreamConsumer + ?Sized,
{
    StreamSession::new(StreamConfig::new(packets_per_transfer, num_transfers)).run(
        device,
        transport,
        consumer,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::ChipType;
    use crate::handler::{Flow, StreamEvent};
    use crate::test_utils::{CallLog, MockDevice, MockTransport};

    fn continue_forever(_: StreamEvent<'_>) -> Flow {
        Flow::Continue
    }

    #[test]
    fn test_unsupported_chip_fails_fast() {
        let mut device = MockDevice::new(ChipType::R);
        let mut transport = MockTransport::new();

        let err = stream_read(&mut device, &mut transport, &mut continue_forever, 8, 4)
            .unwrap_err();

        assert!(matches!(err, StreamError::UnsupportedChip(ChipType::R)));
        assert_eq!(err.code(), 1);
        assert!(device.bitmodes().is_empty());
        assert_eq!(transport.submissions(), 0);
    }

    #[test]
    fn test_unusable_packet_size_rejected() {
        for packet_size in [0, 1, 2] {
            let mut device = MockDevice::ft232h().with_packet_size(packet_size);
            let mut transport = MockTransport::new();

            let err = stream_read(&mut device, &mut transport, &mut continue_forever, 8, 4)
                .unwrap_err();

            assert!(matches!(err, StreamError::InvalidConfig(_)));
            assert_eq!(err.code(), -2);
            assert!(device.bitmodes().is_empty());
            assert_eq!(transport.submissions(), 0);
        }
    }

    #[test]
    fn test_smallest_usable_packet_size() {
        let mut device = MockDevice::ft232h().with_packet_size(3);
        let mut transport = MockTransport::new().with_packet_size(3);
        let mut bytes = 0;
        let mut consumer = |event: StreamEvent<'_>| {
            if let StreamEvent::Data(payload) = event {
                bytes += payload.len();
            }
            Flow::Stop
        };

        stream_read(&mut device, &mut transport, &mut consumer, 8, 4).unwrap();

        assert_eq!(bytes, 1);
        assert_eq!(transport.outstanding(), 0);
    }

    #[test]
    fn test_mode_reset_failure() {
        let mut device = MockDevice::ft232h().fail_bitmode(BitMode::Reset, TransportError::Io);
        let mut transport = MockTransport::new();

        let err = stream_read(&mut device, &mut transport, &mut continue_forever, 8, 4)
            .unwrap_err();

        assert!(matches!(err, StreamError::ModeReset(TransportError::Io)));
        assert_eq!(device.flushes(), 0);
        assert_eq!(transport.submissions(), 0);
    }

    #[test]
    fn test_flush_failure() {
        let mut device = MockDevice::ft2232h().fail_flush(TransportError::Pipe);
        let mut transport = MockTransport::new();

        let err = stream_read(&mut device, &mut transport, &mut continue_forever, 8, 4)
            .unwrap_err();

        assert!(matches!(err, StreamError::Flush(TransportError::Pipe)));
        assert_eq!(device.bitmodes(), &[BitMode::Reset]);
        assert_eq!(transport.submissions(), 0);
    }

    #[test]
    fn test_sync_mode_set_after_pool_primed() {
        let log = CallLog::new();
        let mut device = MockDevice::ft232h().with_log(log.clone());
        let mut transport = MockTransport::new().with_log(log.clone());
        let mut chunks = 0;
        let mut consumer = |event: StreamEvent<'_>| {
            if let StreamEvent::Data(_) = event {
                chunks += 1;
            }
            if chunks >= 16 { Flow::Stop } else { Flow::Continue }
        };

        stream_read(&mut device, &mut transport, &mut consumer, 8, 4).unwrap();

        assert_eq!(device.bitmodes(), &[BitMode::Reset, BitMode::SyncFifo]);
        assert_eq!(device.flushes(), 1);

        let sync = log.position("bitmode:SyncFifo").unwrap();
        assert!(log.position("flush").unwrap() < log.position("submit:0").unwrap());
        assert!(log.position("submit:3").unwrap() < sync);
        assert_eq!(log.entries()[1..sync].len(), 5);
    }

    #[test]
    fn test_sync_mode_failure_cleans_up_pool() {
        let mut device = MockDevice::ft232h().fail_bitmode(BitMode::SyncFifo, TransportError::Io);
        let mut transport = MockTransport::new();

        let err = stream_read(&mut device, &mut transport, &mut continue_forever, 8, 4)
            .unwrap_err();

        assert!(matches!(err, StreamError::SyncFifoMode(TransportError::Io)));
        assert_eq!(transport.cancellations(), 4);
        assert_eq!(transport.outstanding(), 0);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut device = MockDevice::ft232h();
        let mut transport = MockTransport::new();

        let err = stream_read(&mut device, &mut transport, &mut continue_forever, 0, 4)
            .unwrap_err();
        assert!(matches!(err, StreamError::InvalidConfig(_)));
        assert!(device.bitmodes().is_empty());
    }

    #[test]
    fn test_interrupted_wait_retried_once() {
        let mut device = MockDevice::ft232h();
        let mut transport = MockTransport::new()
            .with_event_error(0, TransportError::Interrupted)
            .per_dispatch(1);
        let mut consumer = |event: StreamEvent<'_>| match event {
            StreamEvent::Data(_) => Flow::Stop,
            StreamEvent::Progress(_) => Flow::Continue,
        };

        let report = stream_read(&mut device, &mut transport, &mut consumer, 1, 2).unwrap();
        assert_eq!(report.pool.released_on_stop, 1);
    }

    #[test]
    fn test_repeated_interrupt_becomes_error() {
        let mut device = MockDevice::ft232h();
        let mut transport = MockTransport::new()
            .with_event_error(0, TransportError::Interrupted)
            .with_event_error(1, TransportError::Interrupted);

        let err = stream_read(&mut device, &mut transport, &mut continue_forever, 1, 2)
            .unwrap_err();
        assert!(matches!(
            err,
            StreamError::Transport(TransportError::Interrupted)
        ));
        assert_eq!(transport.outstanding(), 0);
    }
}
