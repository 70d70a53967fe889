//! Asynchronous report delivery
//!
//! A connection holds at most one subscription target. Client `subscribe`
//! calls replace it; provider `notify` calls read it. Both go through
//! [`SubscriberSlot`], so a `notify` racing a replacement delivers to either
//! the old or the new target, never to a released one.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::connection::Connection;
use crate::dispatch::MethodReply;
use crate::error::{Error, Result, Status};
use crate::handlers::{open_input, MAX_NAME_LEN};

/// Largest report the channel delivers
pub const MAX_REPORT_SIZE: usize = 64;

/// Report as delivered to the client's async reply mechanism
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReportRecord {
    /// Valid bytes in `data`
    pub size: u64,
    /// Payload; zero beyond `size`
    pub data: [u8; MAX_REPORT_SIZE],
}

impl ReportRecord {
    /// Number of 64-bit argument words in the wire form
    pub const WORDS: usize = core::mem::size_of::<ReportRecord>() / 8;

    /// Copy a report into a record
    pub fn new(report: &[u8]) -> Result<Self> {
        if report.len() > MAX_REPORT_SIZE {
            return Err(Error::InvalidArgument("report exceeds 64 bytes"));
        }

        let mut data = [0u8; MAX_REPORT_SIZE];
        data[..report.len()].copy_from_slice(report);

        Ok(Self {
            size: report.len() as u64,
            data,
        })
    }

    /// Valid part of the payload
    pub fn payload(&self) -> &[u8] {
        let len = (self.size as usize).min(MAX_REPORT_SIZE);
        &self.data[..len]
    }

    /// Encode as little-endian argument words
    pub fn to_words(&self) -> [u64; Self::WORDS] {
        let mut words = [0u64; Self::WORDS];
        words[0] = self.size;
        for (word, chunk) in words[1..].iter_mut().zip(self.data.chunks_exact(8)) {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(chunk);
            *word = u64::from_le_bytes(bytes);
        }
        words
    }

    /// Decode argument words produced by `to_words`
    pub fn from_words(words: &[u64]) -> Option<Self> {
        if words.len() != Self::WORDS || words[0] > MAX_REPORT_SIZE as u64 {
            return None;
        }

        let mut data = [0u8; MAX_REPORT_SIZE];
        for (chunk, word) in data.chunks_exact_mut(8).zip(&words[1..]) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }

        Some(Self {
            size: words[0],
            data,
        })
    }
}

/// Client-supplied asynchronous reply address
///
/// Dropping the target releases it.
pub trait AsyncTarget: Send + Sync {
    /// Deliver an asynchronous result to the client
    fn send_async_result(&self, status: Status, args: &[u64]);
}

/// Pause imposed after each delivered report
///
/// Keeps report bursts from flooding the client. The default is 1 ms; a zero
/// delay disables throttling.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NotifyThrottle {
    delay: Duration,
}

impl NotifyThrottle {
    pub const DEFAULT_DELAY: Duration = Duration::from_millis(1);

    pub const fn new(delay: Duration) -> Self {
        Self { delay }
    }

    pub const fn disabled() -> Self {
        Self::new(Duration::ZERO)
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub(crate) fn pause(&self) {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
    }
}

impl Default for NotifyThrottle {
    fn default() -> Self {
        Self::new(Self::DEFAULT_DELAY)
    }
}

/// Single-slot register for the subscription target
///
/// The lock only guards the slot; delivery runs on a cloned handle, so a
/// target may block or call back into its connection.
#[derive(Default)]
pub(crate) struct SubscriberSlot {
    target: Mutex<Option<Arc<dyn AsyncTarget>>>,
}

impl SubscriberSlot {
    fn lock(&self) -> MutexGuard<'_, Option<Arc<dyn AsyncTarget>>> {
        self.target.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Install `target`, releasing the previous one. Returns whether there was one.
    pub(crate) fn replace(&self, target: Box<dyn AsyncTarget>) -> bool {
        let previous = self.lock().replace(Arc::from(target));
        // Released outside the lock
        previous.is_some()
    }

    /// Release the current target, if any
    pub(crate) fn clear(&self) -> bool {
        let previous = self.lock().take();
        previous.is_some()
    }

    pub(crate) fn is_registered(&self) -> bool {
        self.lock().is_some()
    }

    /// Deliver a record to the current target
    pub(crate) fn deliver(&self, record: &ReportRecord) -> Result<()> {
        let target = self
            .lock()
            .clone()
            .ok_or(Error::FailedPrecondition("no subscriber registered"))?;
        target.send_async_result(Status::Success, &record.to_words());
        Ok(())
    }
}

/// Subscribe handler
pub(crate) fn subscribe(
    conn: &Connection,
    args: &[u64],
    target: Option<Box<dyn AsyncTarget>>,
) -> Result<MethodReply> {
    let target = target.ok_or_else(|| {
        warn!("{}: subscribe without async target", conn.task_id());
        Error::InvalidArgument("missing async target")
    })?;

    let name = open_input(conn, args, 0, MAX_NAME_LEN, "device name")?;

    if conn.subscriber().replace(target) {
        debug!("{}: released previous subscriber", conn.task_id());
    }

    if conn.provider().subscribe(name.as_slice(), conn.downgrade()) {
        Ok(MethodReply::empty())
    } else {
        Err(Error::DeviceError("subscribe"))
    }
}

/// Deliver a provider-originated report to the connection's subscriber
pub(crate) fn notify(conn: &Connection, report: &[u8]) -> Result<()> {
    let record = ReportRecord::new(report)?;

    conn.subscriber().deliver(&record).inspect_err(|_| {
        warn!("{}: notify with no subscriber", conn.task_id());
    })?;
    trace!("{}: delivered {} byte report", conn.task_id(), record.size);

    conn.throttle().pause();

    Ok(())
}
