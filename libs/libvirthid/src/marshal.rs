//! Buffer marshaling
//!
//! Turns a client-supplied (address, length) pair into a view the bridge can
//! dereference for the duration of one request.
//!
//! ## Lifecycle
//!
//! Opening a buffer validates the range, pins it in the client task
//! (`prepare`) and maps it. Each step that succeeds is owned by a guard, so a
//! failure part-way through undoes exactly the steps that completed, and a
//! successfully opened [`MappedBuffer`] unmaps and unpins itself exactly once
//! when it goes out of scope. Handlers that open several buffers simply hold
//! several guards; an early return releases whichever ones exist.

use core::ptr::NonNull;

use tracing::{debug, trace};

use crate::memory::{Direction, TaskMemory, UserRange};

/// Longest region a single buffer may cover (64 KB)
pub const MAX_MAP_LENGTH: u64 = 64 * 1024;

/// Errors that can occur while opening a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarshalError {
    /// Address is null
    NullAddress,
    /// Length is zero
    ZeroLength,
    /// Length exceeds [`MAX_MAP_LENGTH`]
    LengthTooLarge,
    /// Address overflow during range calculation
    AddressOverflow,
    /// Task refused to pin the range
    PrepareFailed,
    /// Task refused to map the pinned range
    MapFailed,
}

/// Validate a range before asking the task for it
#[inline]
fn validate_range(range: UserRange) -> Result<(), MarshalError> {
    if range.address == 0 {
        return Err(MarshalError::NullAddress);
    }

    if range.length == 0 {
        return Err(MarshalError::ZeroLength);
    }

    if range.length > MAX_MAP_LENGTH {
        return Err(MarshalError::LengthTooLarge);
    }

    range.end().ok_or(MarshalError::AddressOverflow)?;

    Ok(())
}

/// A pinned range; unpinned on drop
struct Prepared<'t> {
    task: &'t dyn TaskMemory,
    range: UserRange,
    direction: Direction,
}

impl Drop for Prepared<'_> {
    fn drop(&mut self) {
        self.task.complete(self.range, self.direction);
    }
}

/// A request-scoped view over client memory
///
/// Field order matters: the mapping is torn down in `Drop::drop`, after which
/// `prepared` is dropped and unpins the range.
pub struct MappedBuffer<'t> {
    mapping: NonNull<u8>,
    prepared: Prepared<'t>,
}

impl<'t> MappedBuffer<'t> {
    /// Validate, pin and map `range` of `task`
    pub fn open(
        task: &'t dyn TaskMemory,
        range: UserRange,
        direction: Direction,
    ) -> Result<Self, MarshalError> {
        validate_range(range)?;

        task.prepare(range, direction).map_err(|fault| {
            debug!("{}: prepare {} failed: {:?}", task.task_id(), range, fault);
            MarshalError::PrepareFailed
        })?;
        let prepared = Prepared {
            task,
            range,
            direction,
        };

        let mapping = task.map(range, direction).map_err(|fault| {
            debug!("{}: map {} failed: {:?}", task.task_id(), range, fault);
            MarshalError::MapFailed
        })?;

        trace!("{}: mapped {} ({:?})", task.task_id(), range, direction);

        Ok(Self { mapping, prepared })
    }

    pub fn range(&self) -> UserRange {
        self.prepared.range
    }

    pub fn direction(&self) -> Direction {
        self.prepared.direction
    }

    pub fn len(&self) -> usize {
        // Bounded by MAX_MAP_LENGTH
        self.prepared.range.length as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Contents of the mapped region
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: `TaskMemory::map` guarantees the mapping is valid for
        // `len()` bytes and exclusively ours until `unmap`, which only runs
        // when `self` is dropped.
        unsafe { core::slice::from_raw_parts(self.mapping.as_ptr(), self.len()) }
    }

    /// Writable contents, only for buffers opened [`Direction::ToClient`]
    pub fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        if !self.direction().is_write() {
            return None;
        }
        // SAFETY: as in `as_slice`, plus the task mapped the range writable
        // because it was opened for `Direction::ToClient`.
        Some(unsafe { core::slice::from_raw_parts_mut(self.mapping.as_ptr(), self.len()) })
    }

    /// Release the buffer now rather than at end of scope
    pub fn close(self) {
        drop(self);
    }
}

impl Drop for MappedBuffer<'_> {
    fn drop(&mut self) {
        self.prepared.task.unmap(self.prepared.range, self.mapping);
        trace!(
            "{}: unmapped {}",
            self.prepared.task.task_id(),
            self.prepared.range
        );
    }
}

impl core::fmt::Debug for MappedBuffer<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MappedBuffer")
            .field("range", &self.prepared.range)
            .field("direction", &self.prepared.direction)
            .finish()
    }
}
