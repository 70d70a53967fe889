//! Test doubles shared by the integration tests
//!
//! - `FakeTask`: a client address space made of explicit regions, counting
//!   live pins and mappings so tests can check release pairing.
//! - `SpyProvider`: an in-memory provider that records every call.
//! - `SpyTarget`: an async target that records deliveries and its release.

#![allow(dead_code)]

use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use libvirthid::{
    AsyncTarget, Connection, ConnectionRef, Direction, ListOutcome, MemoryFault, NotifyThrottle,
    Provider, Status, TaskId, TaskMemory, UserRange,
};

struct Region {
    base: u64,
    bytes: Vec<u8>,
    writable: bool,
}

#[derive(Default)]
pub struct FakeTask {
    regions: Mutex<Vec<Region>>,
    pinned: AtomicUsize,
    mapped: AtomicUsize,
    map_calls: AtomicUsize,
    fail_prepare_at: Mutex<Option<u64>>,
    fail_map_at: Mutex<Option<u64>>,
}

impl FakeTask {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Place read-only bytes at `base`
    pub fn add_region(&self, base: u64, bytes: &[u8]) {
        self.regions.lock().unwrap().push(Region {
            base,
            bytes: bytes.to_vec(),
            writable: false,
        });
    }

    /// Place a writable region of `len` bytes filled with `fill`
    pub fn add_writable(&self, base: u64, len: usize, fill: u8) {
        self.regions.lock().unwrap().push(Region {
            base,
            bytes: vec![fill; len],
            writable: true,
        });
    }

    pub fn read(&self, base: u64) -> Vec<u8> {
        self.regions
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.base == base)
            .map(|r| r.bytes.clone())
            .unwrap_or_default()
    }

    pub fn fail_prepare_at(&self, address: u64) {
        *self.fail_prepare_at.lock().unwrap() = Some(address);
    }

    pub fn fail_map_at(&self, address: u64) {
        *self.fail_map_at.lock().unwrap() = Some(address);
    }

    /// Live pins
    pub fn pinned(&self) -> usize {
        self.pinned.load(Ordering::SeqCst)
    }

    /// Live mappings
    pub fn mapped(&self) -> usize {
        self.mapped.load(Ordering::SeqCst)
    }

    /// Successful `map` calls so far
    pub fn map_calls(&self) -> usize {
        self.map_calls.load(Ordering::SeqCst)
    }

    fn locate(&self, range: UserRange, direction: Direction) -> Result<NonNull<u8>, MemoryFault> {
        let mut regions = self.regions.lock().unwrap();
        let region = regions
            .iter_mut()
            .find(|r| UserRange::new(r.base, r.bytes.len() as u64).contains(&range))
            .ok_or(MemoryFault::NotOwned)?;

        if direction.is_write() && !region.writable {
            return Err(MemoryFault::PermissionDenied);
        }

        let offset = (range.address - region.base) as usize;
        NonNull::new(region.bytes.as_mut_ptr().wrapping_add(offset)).ok_or(MemoryFault::NotMapped)
    }
}

// SAFETY: region byte vectors are never resized, so pointers stay valid until
// the task is dropped, which outlives every connection using it.
unsafe impl TaskMemory for FakeTask {
    fn task_id(&self) -> TaskId {
        TaskId(7)
    }

    fn prepare(&self, range: UserRange, direction: Direction) -> Result<(), MemoryFault> {
        if *self.fail_prepare_at.lock().unwrap() == Some(range.address) {
            return Err(MemoryFault::Exhausted);
        }
        self.locate(range, direction)?;
        self.pinned.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn complete(&self, _range: UserRange, _direction: Direction) {
        self.pinned.fetch_sub(1, Ordering::SeqCst);
    }

    fn map(&self, range: UserRange, direction: Direction) -> Result<NonNull<u8>, MemoryFault> {
        if *self.fail_map_at.lock().unwrap() == Some(range.address) {
            return Err(MemoryFault::Exhausted);
        }
        let ptr = self.locate(range, direction)?;
        self.mapped.fetch_add(1, Ordering::SeqCst);
        self.map_calls.fetch_add(1, Ordering::SeqCst);
        Ok(ptr)
    }

    fn unmap(&self, _range: UserRange, _mapping: NonNull<u8>) {
        self.mapped.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Create {
        name: Vec<u8>,
        descriptor: Vec<u8>,
        serial: Vec<u8>,
        vendor_id: u32,
        product_id: u32,
    },
    Destroy(Vec<u8>),
    Send {
        name: Vec<u8>,
        report: Vec<u8>,
    },
    List {
        capacity: usize,
    },
    Subscribe(Vec<u8>),
}

#[derive(Default)]
pub struct SpyProvider {
    calls: Mutex<Vec<Call>>,
    devices: Mutex<Vec<Vec<u8>>>,
    subscribers: Mutex<Vec<(Vec<u8>, ConnectionRef)>>,
}

impl SpyProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_devices(names: &[&str]) -> Arc<Self> {
        let provider = Self::default();
        *provider.devices.lock().unwrap() = names.iter().map(|n| n.as_bytes().to_vec()).collect();
        Arc::new(provider)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// Push a host-originated report for `name` to its subscriber
    pub fn push(&self, name: &str, report: &[u8]) -> libvirthid::Result<()> {
        let subscriber = self
            .subscribers
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(n, _)| n == name.as_bytes())
            .map(|(_, conn)| conn.clone())
            .ok_or(libvirthid::Error::FailedPrecondition("no subscriber"))?;
        subscriber.notify(report)
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn exists(&self, name: &[u8]) -> bool {
        self.devices.lock().unwrap().iter().any(|d| d == name)
    }
}

impl Provider for SpyProvider {
    fn create(
        &self,
        name: &[u8],
        descriptor: &[u8],
        serial: &[u8],
        vendor_id: u32,
        product_id: u32,
    ) -> bool {
        self.record(Call::Create {
            name: name.to_vec(),
            descriptor: descriptor.to_vec(),
            serial: serial.to_vec(),
            vendor_id,
            product_id,
        });
        if self.exists(name) {
            return false;
        }
        self.devices.lock().unwrap().push(name.to_vec());
        true
    }

    fn destroy(&self, name: &[u8]) -> bool {
        self.record(Call::Destroy(name.to_vec()));
        let mut devices = self.devices.lock().unwrap();
        let before = devices.len();
        devices.retain(|d| d != name);
        devices.len() != before
    }

    fn send(&self, name: &[u8], report: &[u8]) -> bool {
        self.record(Call::Send {
            name: name.to_vec(),
            report: report.to_vec(),
        });
        self.exists(name)
    }

    fn list(&self, destination: &mut [u8]) -> Option<ListOutcome> {
        self.record(Call::List {
            capacity: destination.len(),
        });
        let mut outcome = ListOutcome::default();
        let mut offset = 0usize;
        for name in self.devices.lock().unwrap().iter() {
            let entry = name.len() + 1;
            if offset + entry <= destination.len() {
                destination[offset..offset + name.len()].copy_from_slice(name);
                destination[offset + name.len()] = 0;
                offset += entry;
                outcome.items += 1;
            }
            outcome.needed += entry as u16;
        }
        Some(outcome)
    }

    fn subscribe(&self, name: &[u8], connection: ConnectionRef) -> bool {
        self.record(Call::Subscribe(name.to_vec()));
        if !self.exists(name) {
            return false;
        }
        self.subscribers.lock().unwrap().push((name.to_vec(), connection));
        true
    }
}

/// Observer for a `SpyTarget`
#[derive(Clone, Default)]
pub struct TargetProbe {
    deliveries: Arc<Mutex<Vec<(Status, Vec<u64>)>>>,
    released: Arc<AtomicUsize>,
}

impl TargetProbe {
    pub fn deliveries(&self) -> Vec<(Status, Vec<u64>)> {
        self.deliveries.lock().unwrap().clone()
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn target(&self) -> Box<dyn AsyncTarget> {
        Box::new(SpyTarget {
            probe: self.clone(),
        })
    }
}

pub struct SpyTarget {
    probe: TargetProbe,
}

impl AsyncTarget for SpyTarget {
    fn send_async_result(&self, status: Status, args: &[u64]) {
        self.probe
            .deliveries
            .lock()
            .unwrap()
            .push((status, args.to_vec()));
    }
}

impl Drop for SpyTarget {
    fn drop(&mut self) {
        self.probe.released.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn connect(task: &Arc<FakeTask>, provider: &Arc<SpyProvider>) -> Arc<Connection> {
    Connection::new(task.clone(), provider.clone(), NotifyThrottle::disabled())
}
