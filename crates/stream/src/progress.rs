//! Throughput tracking
//!
//! Keeps three byte/time samples: the session start, the last report and the
//! live accumulator. Rates need two samples, so they only appear from the
//! second report on.

use crate::time::seconds_between;
use std::time::{Duration, Instant};

/// Cumulative byte count at a point in time
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub total_bytes: u64,
    pub time: Instant,
}

/// Progress of a streaming session
#[derive(Debug, Clone)]
pub struct Progress {
    first: Sample,
    previous: Sample,
    current: Sample,
    total_time: f64,
    total_rate: Option<f64>,
    current_rate: Option<f64>,
    reports: u64,
}

impl Progress {
    pub fn new(start: Instant) -> Self {
        let sample = Sample {
            total_bytes: 0,
            time: start,
        };
        Self {
            first: sample,
            previous: sample,
            current: sample,
            total_time: 0.0,
            total_rate: None,
            current_rate: None,
            reports: 0,
        }
    }

    /// Add delivered payload bytes to the live sample
    pub fn record_bytes(&mut self, bytes: u64) {
        self.current.total_bytes = self.current.total_bytes.saturating_add(bytes);
    }

    /// Report if at least `interval` passed since the last report
    ///
    /// Returns whether `report` was invoked. The view passed to `report`
    /// already carries the refreshed time and rates.
    pub fn maybe_report<F>(&mut self, now: Instant, interval: Duration, report: F) -> bool
    where
        F: FnOnce(&Progress),
    {
        if now.saturating_duration_since(self.current.time) < interval {
            return false;
        }

        self.current.time = now;
        self.total_time = seconds_between(now, self.first.time);

        if self.reports > 0 {
            let window = seconds_between(now, self.previous.time);
            if self.total_time > 0.0 {
                self.total_rate = Some(self.current.total_bytes as f64 / self.total_time);
            }
            if window > 0.0 {
                let delta = self.current.total_bytes - self.previous.total_bytes;
                self.current_rate = Some(delta as f64 / window);
            }
        }

        report(self);

        self.previous = self.current;
        self.reports += 1;
        true
    }

    /// Payload bytes delivered so far
    pub fn total_bytes(&self) -> u64 {
        self.current.total_bytes
    }

    /// Seconds from session start to the last report
    pub fn total_time(&self) -> f64 {
        self.total_time
    }

    /// Average rate since session start in bytes/s
    pub fn total_rate(&self) -> Option<f64> {
        self.total_rate
    }

    /// Rate over the last reporting interval in bytes/s
    pub fn current_rate(&self) -> Option<f64> {
        self.current_rate
    }

    /// Number of reports issued
    pub fn reports(&self) -> u64 {
        self.reports
    }

    pub fn first(&self) -> Sample {
        self.first
    }

    pub fn previous(&self) -> Sample {
        self.previous
    }

    pub fn current(&self) -> Sample {
        self.current
    }
}
