//! Client task address space
//!
//! The marshaler never touches client memory directly. Everything goes through
//! a [`TaskMemory`] implementation that owns the client's address space and
//! knows how to pin (`prepare`), map, unmap and unpin (`complete`) a range.

use core::fmt;
use core::ptr::NonNull;

/// Identity of the client process owning a connection
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task:{}", self.0)
    }
}

/// Transfer direction, seen from the client
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Bridge reads client memory (name, descriptor, report)
    FromClient,
    /// Bridge writes client memory (list output)
    ToClient,
}

impl Direction {
    pub fn is_write(self) -> bool {
        self == Direction::ToClient
    }
}

/// A region of the client's address space
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct UserRange {
    pub address: u64,
    pub length: u64,
}

impl UserRange {
    pub const fn new(address: u64, length: u64) -> Self {
        Self { address, length }
    }

    /// One past the last byte, if it does not overflow
    pub fn end(&self) -> Option<u64> {
        self.address.checked_add(self.length)
    }

    /// Check whether `other` lies entirely inside this range
    pub fn contains(&self, other: &UserRange) -> bool {
        match (self.end(), other.end()) {
            (Some(end), Some(other_end)) => other.address >= self.address && other_end <= end,
            _ => false,
        }
    }
}

impl fmt::Display for UserRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}+{}", self.address, self.length)
    }
}

/// Why a task refused to prepare or map a range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryFault {
    /// Range is not (entirely) owned by the task
    NotOwned,
    /// Range is owned but not backed by memory
    NotMapped,
    /// Range lacks the permission the direction needs
    PermissionDenied,
    /// Task ran out of pin or mapping slots
    Exhausted,
}

/// Address space of the client task behind a connection
///
/// # Safety
///
/// A pointer returned by [`TaskMemory::map`] must be valid for reads of
/// `range.length` bytes (and for writes, when mapped [`Direction::ToClient`])
/// until the matching [`TaskMemory::unmap`] call, and nothing else may access
/// that memory while the mapping is live.
pub unsafe trait TaskMemory: Send + Sync {
    /// Owning process identity
    fn task_id(&self) -> TaskId;

    /// Pin `range` so it stays resident and owned until `complete`
    fn prepare(&self, range: UserRange, direction: Direction) -> Result<(), MemoryFault>;

    /// Undo a successful `prepare`
    fn complete(&self, range: UserRange, direction: Direction);

    /// Map a prepared range into the bridge's address space
    fn map(&self, range: UserRange, direction: Direction) -> Result<NonNull<u8>, MemoryFault>;

    /// Undo a successful `map`
    fn unmap(&self, range: UserRange, mapping: NonNull<u8>);
}
