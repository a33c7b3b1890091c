//! Throughput metrics formatting for streaming sessions
//!
//! Turns the progress and pool counters kept by the streaming core into
//! human-readable figures for log lines and the end-of-session summary.

use std::time::Duration;
use stream::{Progress, SessionReport};

/// Point-in-time copy of a session's throughput figures
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSnapshot {
    /// Payload bytes delivered
    pub total_bytes: u64,
    /// Seconds since streaming started, as of the last report
    pub elapsed_secs: f64,
    /// Average rate since start in bytes/sec
    pub total_rate: Option<f64>,
    /// Rate over the last interval in bytes/sec
    pub current_rate: Option<f64>,
}

impl ProgressSnapshot {
    pub fn from_progress(progress: &Progress) -> Self {
        Self {
            total_bytes: progress.total_bytes(),
            elapsed_secs: progress.total_time(),
            total_rate: progress.total_rate(),
            current_rate: progress.current_rate(),
        }
    }

    pub fn format_total(&self) -> String {
        format_bytes(self.total_bytes)
    }

    pub fn format_total_rate(&self) -> String {
        format_rate(self.total_rate)
    }

    pub fn format_current_rate(&self) -> String {
        format_rate(self.current_rate)
    }

    pub fn format_elapsed(&self) -> String {
        format_duration(Duration::from_secs_f64(self.elapsed_secs.max(0.0)))
    }

    /// One-line status for periodic progress logging
    pub fn status_line(&self) -> String {
        format!(
            "{} in {} (avg {}, now {})",
            self.format_total(),
            self.format_elapsed(),
            self.format_total_rate(),
            self.format_current_rate()
        )
    }
}

/// End-of-session summary of a completed stream
pub fn summarize_report(report: &SessionReport) -> String {
    let snapshot = ProgressSnapshot::from_progress(&report.progress);
    let mut summary = format!(
        "{} received, {} transfers completed, {} resubmitted",
        snapshot.format_total(),
        report.pool.completions,
        report.pool.resubmitted
    );
    if report.leaked > 0 {
        summary.push_str(&format!(", {} transfers leaked", report.leaked));
    }
    summary
}

/// Format an optional rate, "n/a" until it can be computed
pub fn format_rate(rate: Option<f64>) -> String {
    match rate {
        Some(bps) => format_bytes_per_second(bps),
        None => "n/a".to_string(),
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Format bytes per second as human-readable string
pub fn format_bytes_per_second(bps: f64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;

    if bps >= GB {
        format!("{:.2} GB/s", bps / GB)
    } else if bps >= MB {
        format!("{:.2} MB/s", bps / MB)
    } else if bps >= KB {
        format!("{:.2} KB/s", bps / KB)
    } else {
        format!("{:.0} B/s", bps)
    }
}

/// Format duration for display
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let hours = secs / 3600;
    let mins = (secs % 3600) / 60;
    let secs = secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, mins, secs)
    } else if mins > 0 {
        format!("{}m {}s", mins, secs)
    } else {
        format!("{}s", secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use stream::PoolStats;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(500), "500 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1024 * 1024), "1.00 MB");
        assert_eq!(format_bytes(1024 * 1024 * 1024), "1.00 GB");
    }

    #[test]
    fn test_format_rate() {
        assert_eq!(format_rate(None), "n/a");
        assert_eq!(format_rate(Some(512.0)), "512 B/s");
        assert_eq!(format_rate(Some(40.0 * 1024.0 * 1024.0)), "40.00 MB/s");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(42)), "42s");
        assert_eq!(format_duration(Duration::from_secs(125)), "2m 5s");
        assert_eq!(format_duration(Duration::from_secs(3725)), "1h 2m 5s");
    }

    #[test]
    fn test_snapshot_before_second_report() {
        let start = Instant::now();
        let mut progress = Progress::new(start);
        progress.record_bytes(2048);
        progress.maybe_report(start + Duration::from_secs(2), Duration::from_secs(1), |_| {});

        let snapshot = ProgressSnapshot::from_progress(&progress);
        assert_eq!(snapshot.total_bytes, 2048);
        assert_eq!(
            snapshot.status_line(),
            "2.00 KB in 2s (avg n/a, now n/a)"
        );
    }

    #[test]
    fn test_snapshot_with_rates() {
        let start = Instant::now();
        let mut progress = Progress::new(start);
        progress.record_bytes(1024);
        progress.maybe_report(start + Duration::from_secs(1), Duration::from_secs(1), |_| {});
        progress.record_bytes(1024);
        progress.maybe_report(start + Duration::from_secs(2), Duration::from_secs(1), |_| {});

        let snapshot = ProgressSnapshot::from_progress(&progress);
        assert_eq!(snapshot.format_total_rate(), "1.00 KB/s");
        assert_eq!(snapshot.format_current_rate(), "1.00 KB/s");
    }

    #[test]
    fn test_summary_mentions_leaks() {
        let report = SessionReport {
            progress: Progress::new(Instant::now()),
            pool: PoolStats {
                completions: 12,
                resubmitted: 8,
                ..PoolStats::default()
            },
            leaked: 2,
        };
        assert_eq!(
            summarize_report(&report),
            "0 B received, 12 transfers completed, 8 resubmitted, 2 transfers leaked"
        );
    }
}
