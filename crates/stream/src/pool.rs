//! Fixed-size pool of transfer slots
//!
//! Slots are indexed by [`SlotId`] and tagged [`SlotState::Free`] or
//! [`SlotState::InFlight`]. The buffer of an in-flight slot is owned by the
//! transport; the pool only keeps the tag, so every completion must settle
//! its slot exactly once, either by resubmitting or by releasing.

use crate::error::StreamError;
use crate::transport::{SlotId, Transport};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free,
    InFlight,
}

/// Why a slot left the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseReason {
    /// Consumer asked to stop
    Stopped,
    /// Transfer failed or the session already ended
    Failed,
    /// Returned after cancellation during cleanup
    Drained,
}

/// Bookkeeping violations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("Slot {0} does not exist")]
    UnknownSlot(SlotId),

    #[error("Slot {0} is not in flight")]
    NotInFlight(SlotId),
}

/// Counters over the pool's lifetime
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Initial submissions during setup
    pub submitted: u64,
    /// Completions settled through this pool
    pub completions: u64,
    /// Buffers handed back to the transport for another read
    pub resubmitted: u64,
    pub released_on_stop: u64,
    pub released_on_error: u64,
    pub drained: u64,
    /// Resubmissions the transport refused
    pub resubmit_failures: u64,
}

impl PoolStats {
    pub fn released(&self) -> u64 {
        self.released_on_stop + self.released_on_error + self.drained
    }
}

#[derive(Debug)]
pub struct TransferPool {
    slots: Vec<SlotState>,
    buffer_size: usize,
    stats: PoolStats,
}

impl TransferPool {
    /// Create `num_transfers` free slots for buffers of `buffer_size` bytes
    pub fn new(num_transfers: usize, buffer_size: usize) -> Result<Self, StreamError> {
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(num_transfers)
            .map_err(|_| StreamError::NoMemory {
                size: num_transfers.saturating_mul(std::mem::size_of::<SlotState>()),
            })?;
        slots.resize(num_transfers, SlotState::Free);

        Ok(Self {
            slots,
            buffer_size,
            stats: PoolStats::default(),
        })
    }

    /// Allocate and submit a buffer for every slot
    ///
    /// Stops at the first failure. Slots submitted before the failure stay
    /// in flight so the caller can cancel and drain them; the buffer of the
    /// failing slot has already been dropped.
    pub fn setup<T: Transport + ?Sized>(&mut self, transport: &mut T) -> Result<(), StreamError> {
        for index in 0..self.slots.len() {
            let slot = SlotId(index);
            let buffer = allocate_buffer(self.buffer_size)?;

            match transport.submit(slot, buffer) {
                Ok(()) => {
                    self.slots[index] = SlotState::InFlight;
                    self.stats.submitted += 1;
                }
                Err(failed) => {
                    drop(failed.buffer);
                    return Err(StreamError::Submit {
                        slot,
                        source: failed.error,
                    });
                }
            }
        }

        debug!(
            "Submitted {} transfers of {} bytes",
            self.slots.len(),
            self.buffer_size
        );
        Ok(())
    }

    /// Record that a completed slot was handed back to the transport
    pub fn mark_resubmitted(&mut self, slot: SlotId) -> Result<(), PoolError> {
        self.expect_in_flight(slot)?;
        self.stats.completions += 1;
        self.stats.resubmitted += 1;
        Ok(())
    }

    /// Free a completed slot and its buffer
    pub fn release(
        &mut self,
        slot: SlotId,
        buffer: Vec<u8>,
        reason: ReleaseReason,
    ) -> Result<(), PoolError> {
        self.expect_in_flight(slot)?;
        drop(buffer);
        self.slots[slot.0] = SlotState::Free;
        self.stats.completions += 1;
        match reason {
            ReleaseReason::Stopped => self.stats.released_on_stop += 1,
            ReleaseReason::Failed => self.stats.released_on_error += 1,
            ReleaseReason::Drained => self.stats.drained += 1,
        }
        Ok(())
    }

    /// Free a slot whose resubmission was refused
    pub fn resubmit_failed(&mut self, slot: SlotId, buffer: Vec<u8>) -> Result<(), PoolError> {
        self.expect_in_flight(slot)?;
        drop(buffer);
        self.slots[slot.0] = SlotState::Free;
        self.stats.resubmit_failures += 1;
        Ok(())
    }

    pub fn state(&self, slot: SlotId) -> Option<SlotState> {
        self.slots.get(slot.0).copied()
    }

    pub fn in_flight(&self) -> usize {
        self.slots
            .iter()
            .filter(|state| **state == SlotState::InFlight)
            .count()
    }

    pub fn in_flight_slots(&self) -> impl Iterator<Item = SlotId> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, state)| **state == SlotState::InFlight)
            .map(|(index, _)| SlotId(index))
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn stats(&self) -> PoolStats {
        self.stats
    }

    fn expect_in_flight(&self, slot: SlotId) -> Result<(), PoolError> {
        match self.slots.get(slot.0) {
            Some(SlotState::InFlight) => Ok(()),
            Some(SlotState::Free) => Err(PoolError::NotInFlight(slot)),
            None => Err(PoolError::UnknownSlot(slot)),
        }
    }
}

fn allocate_buffer(size: usize) -> Result<Vec<u8>, StreamError> {
    let mut buffer = Vec::new();
    buffer
        .try_reserve_exact(size)
        .map_err(|_| StreamError::NoMemory { size })?;
    buffer.resize(size, 0);
    Ok(buffer)
}
