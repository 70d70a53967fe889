//! Device operation handlers
//!
//! Scalar counts were checked by the dispatcher; each handler range-checks
//! its length scalars, opens its buffers and calls the provider. Buffers are
//! released when they leave scope, on every path.

use tracing::debug;

use crate::connection::Connection;
use crate::dispatch::MethodReply;
use crate::error::{Error, Result};
use crate::marshal::MappedBuffer;
use crate::memory::{Direction, UserRange};

/// Longest device name or serial number
pub const MAX_NAME_LEN: u64 = u8::MAX as u64;

/// Longest report descriptor, report or list buffer
pub const MAX_PAYLOAD_LEN: u64 = u16::MAX as u64;

/// Build the range for a (pointer, length) scalar pair
fn user_range(address: u64, length: u64, max: u64, what: &'static str) -> Result<UserRange> {
    if length > max {
        debug!("{} length {} exceeds {}", what, length, max);
        return Err(Error::InvalidArgument(what));
    }
    Ok(UserRange::new(address, length))
}

fn device_id(value: u64, what: &'static str) -> Result<u32> {
    u32::try_from(value).map_err(|_| Error::InvalidArgument(what))
}

fn provider_result(ok: bool, op: &'static str) -> Result<MethodReply> {
    if ok {
        Ok(MethodReply::empty())
    } else {
        debug!("Provider rejected {}", op);
        Err(Error::DeviceError(op))
    }
}

/// Open a read buffer for a (pointer, length) pair in `args`
pub(crate) fn open_input<'c>(
    conn: &'c Connection,
    args: &[u64],
    index: usize,
    max: u64,
    what: &'static str,
) -> Result<MappedBuffer<'c>> {
    let range = user_range(args[index], args[index + 1], max, what)?;
    Ok(MappedBuffer::open(conn.task(), range, Direction::FromClient)?)
}

pub(crate) fn create(conn: &Connection, args: &[u64]) -> Result<MethodReply> {
    // Check the id scalars before touching client memory
    let vendor_id = device_id(args[6], "vendor id")?;
    let product_id = device_id(args[7], "product id")?;

    let name = open_input(conn, args, 0, MAX_NAME_LEN, "device name")?;
    let descriptor = open_input(conn, args, 2, MAX_PAYLOAD_LEN, "report descriptor")?;
    let serial = open_input(conn, args, 4, MAX_NAME_LEN, "serial number")?;

    let ok = conn.provider().create(
        name.as_slice(),
        descriptor.as_slice(),
        serial.as_slice(),
        vendor_id,
        product_id,
    );

    provider_result(ok, "create")
}

pub(crate) fn destroy(conn: &Connection, args: &[u64]) -> Result<MethodReply> {
    let name = open_input(conn, args, 0, MAX_NAME_LEN, "device name")?;

    let ok = conn.provider().destroy(name.as_slice());

    provider_result(ok, "destroy")
}

pub(crate) fn send(conn: &Connection, args: &[u64]) -> Result<MethodReply> {
    let name = open_input(conn, args, 0, MAX_NAME_LEN, "device name")?;
    let report = open_input(conn, args, 2, MAX_PAYLOAD_LEN, "report")?;

    let ok = conn.provider().send(name.as_slice(), report.as_slice());

    provider_result(ok, "send")
}

pub(crate) fn list(conn: &Connection, args: &[u64]) -> Result<MethodReply> {
    let range = user_range(args[0], args[1], MAX_PAYLOAD_LEN, "list buffer")?;
    let mut buffer = MappedBuffer::open(conn.task(), range, Direction::ToClient)?;

    let destination = buffer
        .as_mut_slice()
        .ok_or(Error::ResourceExhausted("list buffer not writable"))?;

    match conn.provider().list(destination) {
        Some(outcome) => {
            debug!(
                "{}: list needs {} bytes, wrote {} items",
                conn.task_id(),
                outcome.needed,
                outcome.items
            );
            Ok(MethodReply {
                scalar_output: vec![u64::from(outcome.needed), u64::from(outcome.items)],
            })
        }
        None => Err(Error::DeviceError("list")),
    }
}
