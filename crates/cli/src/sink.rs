//! Payload output
//!
//! [`PayloadSink`] is the stream consumer of the binary: it writes payload to
//! a file or stdout, logs progress reports and decides when to stop.

use common::ProgressSnapshot;
use std::io::{self, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use stream::{Flow, StreamConsumer, StreamEvent};
use tracing::{info, warn};

/// Writes streamed payload and stops on a limit, a write error or a signal
pub struct PayloadSink<W: Write> {
    writer: W,
    stop: Arc<AtomicBool>,
    byte_limit: Option<u64>,
    duration_limit: Option<Duration>,
    started: Instant,
    written: u64,
    error: Option<io::Error>,
}

impl<W: Write> PayloadSink<W> {
    /// `stop` is polled on every chunk; set it to end the session cleanly
    pub fn new(writer: W, stop: Arc<AtomicBool>) -> Self {
        Self {
            writer,
            stop,
            byte_limit: None,
            duration_limit: None,
            started: Instant::now(),
            written: 0,
            error: None,
        }
    }

    pub fn with_byte_limit(mut self, limit: Option<u64>) -> Self {
        self.byte_limit = limit;
        self
    }

    pub fn with_duration_limit(mut self, limit: Option<Duration>) -> Self {
        self.duration_limit = limit;
        self
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    /// Flush the writer and surface the first write error
    pub fn finish(mut self) -> io::Result<W> {
        if let Some(e) = self.error.take() {
            return Err(e);
        }
        self.writer.flush()?;
        Ok(self.writer)
    }

    fn write_payload(&mut self, payload: &[u8]) -> Flow {
        let remaining = self
            .byte_limit
            .map_or(payload.len() as u64, |limit| limit.saturating_sub(self.written));
        let take = payload.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));

        if let Err(e) = self.writer.write_all(&payload[..take]) {
            warn!("Writing payload failed: {}", e);
            self.error = Some(e);
            return Flow::Stop;
        }
        self.written += take as u64;

        if self.byte_limit.is_some_and(|limit| self.written >= limit) {
            info!("Byte limit reached after {} bytes", self.written);
            return Flow::Stop;
        }
        Flow::Continue
    }
}

impl<W: Write> StreamConsumer for PayloadSink<W> {
    fn on_event(&mut self, event: StreamEvent<'_>) -> Flow {
        match event {
            StreamEvent::Data(payload) => {
                if self.stop.load(Ordering::Relaxed) {
                    info!("Stop requested");
                    return Flow::Stop;
                }
                if self
                    .duration_limit
                    .is_some_and(|limit| self.started.elapsed() >= limit)
                {
                    info!("Duration limit reached");
                    return Flow::Stop;
                }
                self.write_payload(payload)
            }
            StreamEvent::Progress(progress) => {
                info!("{}", ProgressSnapshot::from_progress(progress).status_line());
                Flow::Continue
            }
        }
    }
}
