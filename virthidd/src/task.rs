//! Staged client address space
//!
//! Socket clients cannot hand us raw pointers, so each request carries the
//! regions its scalars point into. They are staged into the connection's
//! `StagedTask` before dispatch, and writable regions are collected and sent
//! back afterwards. Pointers handed out by `map` point into the staged byte
//! vectors, which are never touched while any region is pinned.

use std::ptr::NonNull;
use std::sync::{Mutex, MutexGuard, PoisonError};

use libvirthid::{Direction, MemoryFault, TaskId, TaskMemory, UserRange};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Largest total size of the regions staged for one request (1 MB)
pub const MAX_STAGED_BYTES: usize = 1024 * 1024;

/// Client memory region as carried on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub address: u64,
    #[serde(default)]
    pub data: Vec<u8>,
    #[serde(default)]
    pub writable: bool,
}

impl Region {
    pub fn input(address: u64, data: &[u8]) -> Self {
        Self { address, data: data.to_vec(), writable: false }
    }

    pub fn output(address: u64, length: usize) -> Self {
        Self { address, data: vec![0; length], writable: true }
    }

    fn range(&self) -> UserRange {
        UserRange::new(self.address, self.data.len() as u64)
    }
}

/// Errors when staging request regions
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StageError {
    #[error("region at {0:#x} is empty or wraps the address space")]
    BadRegion(u64),
    #[error("regions at {0:#x} and {1:#x} overlap")]
    Overlap(u64, u64),
    #[error("staged regions exceed 1 MB")]
    TooLarge,
    #[error("regions are still pinned by an in-flight request")]
    Busy,
}

#[derive(Default)]
struct State {
    regions: Vec<Region>,
    pins: usize,
    maps: usize,
}

/// Client task backed by per-request staged regions
pub struct StagedTask {
    id: TaskId,
    state: Mutex<State>,
}

impl StagedTask {
    pub fn new(id: TaskId) -> Self {
        Self { id, state: Mutex::new(State::default()) }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the staged regions with those of the next request
    pub fn stage(&self, regions: Vec<Region>) -> Result<(), StageError> {
        let mut total = 0usize;
        for (i, region) in regions.iter().enumerate() {
            let range = region.range();
            if region.data.is_empty() || range.end().is_none() {
                return Err(StageError::BadRegion(region.address));
            }
            total = total.saturating_add(region.data.len());
            for other in &regions[..i] {
                if overlaps(range, other.range()) {
                    return Err(StageError::Overlap(other.address, region.address));
                }
            }
        }
        if total > MAX_STAGED_BYTES {
            return Err(StageError::TooLarge);
        }

        let mut state = self.lock();
        if state.pins > 0 || state.maps > 0 {
            return Err(StageError::Busy);
        }
        state.regions = regions;
        Ok(())
    }

    /// Take the writable regions back out after dispatch
    pub fn collect_written(&self) -> Result<Vec<Region>, StageError> {
        let mut state = self.lock();
        if state.pins > 0 || state.maps > 0 {
            return Err(StageError::Busy);
        }
        let regions = std::mem::take(&mut state.regions);
        Ok(regions.into_iter().filter(|r| r.writable).collect())
    }

    /// Live (pins, mappings)
    pub fn outstanding(&self) -> (usize, usize) {
        let state = self.lock();
        (state.pins, state.maps)
    }
}

fn overlaps(a: UserRange, b: UserRange) -> bool {
    match (a.end(), b.end()) {
        (Some(a_end), Some(b_end)) => a.address < b_end && b.address < a_end,
        _ => true,
    }
}

fn find<'s>(
    state: &'s mut State,
    range: UserRange,
    direction: Direction,
) -> Result<&'s mut Region, MemoryFault> {
    let region = state
        .regions
        .iter_mut()
        .find(|r| r.range().contains(&range))
        .ok_or(MemoryFault::NotOwned)?;
    if direction.is_write() && !region.writable {
        return Err(MemoryFault::PermissionDenied);
    }
    Ok(region)
}

// SAFETY: region byte vectors are only replaced or moved out by `stage` and
// `collect_written`, both of which refuse while a pin or mapping is live, so a
// mapped pointer stays valid until `unmap`. Pointers are offsets from the
// vector's raw base pointer, never from a slice reborrow, so overlapping
// mappings opened by one request stay usable together.
unsafe impl TaskMemory for StagedTask {
    fn task_id(&self) -> TaskId {
        self.id
    }

    fn prepare(&self, range: UserRange, direction: Direction) -> Result<(), MemoryFault> {
        let mut state = self.lock();
        find(&mut state, range, direction)?;
        state.pins += 1;
        Ok(())
    }

    fn complete(&self, _range: UserRange, _direction: Direction) {
        let mut state = self.lock();
        state.pins = state.pins.saturating_sub(1);
    }

    fn map(&self, range: UserRange, direction: Direction) -> Result<NonNull<u8>, MemoryFault> {
        let mut state = self.lock();
        let region = find(&mut state, range, direction)?;
        let offset = (range.address - region.address) as usize;
        // Raw offset only; slicing would reborrow bytes a live mapping still reads
        let ptr = NonNull::new(region.data.as_mut_ptr().wrapping_add(offset))
            .ok_or(MemoryFault::NotMapped)?;
        state.maps += 1;
        Ok(ptr)
    }

    fn unmap(&self, _range: UserRange, _mapping: NonNull<u8>) {
        let mut state = self.lock();
        state.maps = state.maps.saturating_sub(1);
    }
}
