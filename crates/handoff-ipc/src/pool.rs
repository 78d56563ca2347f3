//! Rotating surface pool.
//!
//! The producer owns a [`SurfacePool`] with write capability; the consumer
//! rebuilds a [`PoolView`] from the setup message. The two are never shared
//! memory: they stay in step only through setup and swap messages.

use std::collections::VecDeque;

use tracing::{debug, info, warn};

use crate::error::PoolError;
use crate::surface::{PixelFormat, SurfaceAllocator, SurfaceHandle};

/// Index of a slot in [0, N).
pub type SlotIndex = usize;

/// Lifecycle of one pool slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Producer may draw into it
    Writable,
    /// Announced to the consumer, not yet released
    InFlight,
    /// Session ended; slot is no longer usable
    Retired,
}

#[derive(Debug)]
struct Slot {
    handle: SurfaceHandle,
    state: SlotState,
}

/// Slot states plus the transitions both sides share.
#[derive(Debug)]
struct SlotTable {
    slots: Vec<Slot>,
    /// In-flight slots, oldest announcement first
    in_flight: VecDeque<SlotIndex>,
}

impl SlotTable {
    fn new(handles: Vec<SurfaceHandle>) -> Self {
        Self {
            slots: handles
                .into_iter()
                .map(|handle| Slot {
                    handle,
                    state: SlotState::Writable,
                })
                .collect(),
            in_flight: VecDeque::new(),
        }
    }

    fn len(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, idx: SlotIndex) -> Result<&Slot, PoolError> {
        self.slots.get(idx).ok_or(PoolError::SlotOutOfRange {
            slot: idx,
            slot_count: self.slots.len(),
        })
    }

    fn transition(&mut self, idx: SlotIndex, from: SlotState, to: SlotState) -> Result<(), PoolError> {
        let slot_count = self.slots.len();
        let slot = self
            .slots
            .get_mut(idx)
            .ok_or(PoolError::SlotOutOfRange { slot: idx, slot_count })?;

        if slot.state != from {
            return Err(PoolError::InvalidTransition {
                slot: idx,
                from: slot.state,
                to,
            });
        }
        slot.state = to;

        match to {
            SlotState::InFlight => self.in_flight.push_back(idx),
            _ => self.in_flight.retain(|&i| i != idx),
        }
        Ok(())
    }

    fn mark_ready(&mut self, idx: SlotIndex) -> Result<(), PoolError> {
        self.transition(idx, SlotState::Writable, SlotState::InFlight)
    }

    fn release(&mut self, idx: SlotIndex) -> Result<(), PoolError> {
        self.transition(idx, SlotState::InFlight, SlotState::Writable)
    }

    fn oldest_in_flight(&self) -> Option<SlotIndex> {
        self.in_flight.front().copied()
    }

    fn retire_all(&mut self) {
        for slot in &mut self.slots {
            slot.state = SlotState::Retired;
        }
        self.in_flight.clear();
    }
}

/// Surface parameters shared by every slot of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceSpec {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

/// Producer-side pool with write capability.
#[derive(Debug)]
pub struct SurfacePool {
    table: SlotTable,
    /// Slots handed out by `acquire_for_write` and not yet marked ready
    leased: Vec<bool>,
    /// Next slot the round-robin scan starts from
    cursor: usize,
}

impl SurfacePool {
    /// Allocate `n` surfaces; every slot starts Writable.
    ///
    /// If any allocation fails, the surfaces already allocated are handed
    /// back to the allocator and no pool is created.
    pub fn create(n: usize, spec: SurfaceSpec, allocator: &dyn SurfaceAllocator) -> Result<Self, PoolError> {
        if n == 0 {
            return Err(PoolError::EmptyPool);
        }

        let mut handles = Vec::with_capacity(n);
        for slot in 0..n {
            match allocator.allocate(spec.width, spec.height, spec.format) {
                Ok(handle) => handles.push(handle),
                Err(source) => {
                    warn!(
                        "Surface allocation failed for slot {}: {}, rolling back {} slots",
                        slot,
                        source,
                        handles.len()
                    );
                    for handle in handles {
                        allocator.free(handle);
                    }
                    return Err(PoolError::AllocationFailed { slot, source });
                }
            }
        }

        info!(
            "Created surface pool: {} slots of {}x{} {:?}",
            n, spec.width, spec.height, spec.format
        );

        Ok(Self {
            table: SlotTable::new(handles),
            leased: vec![false; n],
            cursor: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.len() == 0
    }

    pub fn state(&self, idx: SlotIndex) -> Option<SlotState> {
        self.table.slots.get(idx).map(|s| s.state)
    }

    pub fn handle(&self, idx: SlotIndex) -> Option<&SurfaceHandle> {
        self.table.slots.get(idx).map(|s| &s.handle)
    }

    /// Lease the next Writable slot, scanning round-robin from the cursor.
    pub fn acquire_for_write(&mut self) -> Result<SlotIndex, PoolError> {
        let n = self.len();
        for step in 0..n {
            let idx = (self.cursor + step) % n;
            if self.table.slots[idx].state == SlotState::Writable && !self.leased[idx] {
                self.leased[idx] = true;
                self.cursor = (idx + 1) % n;
                return Ok(idx);
            }
        }
        Err(PoolError::NoWritableSlot)
    }

    /// Hand a leased slot back without presenting it.
    pub fn cancel_write(&mut self, idx: SlotIndex) -> Result<(), PoolError> {
        let slot = self.table.slot(idx)?;
        if slot.state != SlotState::Writable || !self.leased[idx] {
            return Err(PoolError::InvalidTransition {
                slot: idx,
                from: slot.state,
                to: SlotState::Writable,
            });
        }
        self.leased[idx] = false;
        Ok(())
    }

    /// Writable → InFlight
    pub fn mark_ready(&mut self, idx: SlotIndex) -> Result<(), PoolError> {
        self.table.mark_ready(idx)?;
        self.leased[idx] = false;
        Ok(())
    }

    /// InFlight → Writable
    pub fn release(&mut self, idx: SlotIndex) -> Result<(), PoolError> {
        self.table.release(idx)
    }

    /// Take back the oldest in-flight slot, dropping the frame it carried.
    pub fn reclaim_oldest(&mut self) -> Option<SlotIndex> {
        let idx = self.table.oldest_in_flight()?;
        self.table.release(idx).ok()?;
        debug!("Reclaimed in-flight slot {}", idx);
        Some(idx)
    }

    pub fn retire_all(&mut self) {
        self.table.retire_all();
        self.leased.iter_mut().for_each(|l| *l = false);
    }

    /// One display-only export per slot, in index order, for the setup message.
    pub fn export_handles(&self) -> Result<Vec<SurfaceHandle>, PoolError> {
        self.table
            .slots
            .iter()
            .enumerate()
            .map(|(slot, s)| s.handle.export().map_err(|source| PoolError::Export { slot, source }))
            .collect()
    }
}

/// Consumer-side, read-only view of the producer's pool.
#[derive(Debug)]
pub struct PoolView {
    table: SlotTable,
}

impl PoolView {
    /// Build the view from the handles of a decoded setup message, in slot order.
    pub fn from_handles(handles: Vec<SurfaceHandle>) -> Self {
        Self {
            table: SlotTable::new(handles),
        }
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.len() == 0
    }

    pub fn state(&self, idx: SlotIndex) -> Option<SlotState> {
        self.table.slots.get(idx).map(|s| s.state)
    }

    pub fn handle(&self, idx: SlotIndex) -> Option<&SurfaceHandle> {
        self.table.slots.get(idx).map(|s| &s.handle)
    }

    /// A swap announced this slot: Writable → InFlight.
    pub fn mark_ready(&mut self, idx: SlotIndex) -> Result<(), PoolError> {
        self.table.mark_ready(idx)
    }

    /// The host finished with the frame: InFlight → Writable.
    pub fn release(&mut self, idx: SlotIndex) -> Result<(), PoolError> {
        self.table.release(idx)
    }

    pub fn retire_all(&mut self) {
        self.table.retire_all();
    }
}
