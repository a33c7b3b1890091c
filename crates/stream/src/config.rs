//! Stream session configuration

use crate::error::StreamError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Packets read by one transfer
    #[serde(default = "StreamConfig::default_packets_per_transfer")]
    pub packets_per_transfer: usize,
    /// Transfers kept in flight
    #[serde(default = "StreamConfig::default_num_transfers")]
    pub num_transfers: usize,
    /// Interval between progress reports in milliseconds
    #[serde(default = "StreamConfig::default_progress_interval_ms")]
    pub progress_interval_ms: u64,
    /// Idle read-timeout periods to wait for cancelled transfers on cleanup
    #[serde(default = "StreamConfig::default_drain_rounds")]
    pub drain_rounds: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            packets_per_transfer: Self::default_packets_per_transfer(),
            num_transfers: Self::default_num_transfers(),
            progress_interval_ms: Self::default_progress_interval_ms(),
            drain_rounds: Self::default_drain_rounds(),
        }
    }
}

impl StreamConfig {
    pub fn new(packets_per_transfer: usize, num_transfers: usize) -> Self {
        Self {
            packets_per_transfer,
            num_transfers,
            ..Self::default()
        }
    }

    fn default_packets_per_transfer() -> usize {
        8
    }

    fn default_num_transfers() -> usize {
        256
    }

    fn default_progress_interval_ms() -> u64 {
        1000
    }

    fn default_drain_rounds() -> u32 {
        2
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    /// Size of one transfer buffer for the given packet size
    pub fn buffer_size(&self, packet_size: usize) -> Result<usize, StreamError> {
        self.packets_per_transfer
            .checked_mul(packet_size)
            .ok_or_else(|| {
                StreamError::InvalidConfig(format!(
                    "{} packets of {} bytes overflow a transfer buffer",
                    self.packets_per_transfer, packet_size
                ))
            })
    }

    pub fn validate(&self) -> Result<(), StreamError> {
        if self.packets_per_transfer == 0 {
            return Err(StreamError::InvalidConfig(
                "packets_per_transfer must be at least 1".to_string(),
            ));
        }
        if self.num_transfers == 0 {
            return Err(StreamError::InvalidConfig(
                "num_transfers must be at least 1".to_string(),
            ));
        }
        if self.progress_interval_ms == 0 {
            return Err(StreamError::InvalidConfig(
                "progress_interval_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}
