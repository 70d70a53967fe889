//! Create / list / send / destroy through the dispatcher

mod common;

use common::{connect, Call, FakeTask, SpyProvider};
use libvirthid::{Error, MethodCall, Selector, Status, MAX_NAME_LEN};

const NAME: u64 = 0x1000;
const DESCRIPTOR: u64 = 0x2000;
const SERIAL: u64 = 0x3000;
const LIST: u64 = 0x4000;
const REPORT: u64 = 0x5000;

const MOUSE_DESCRIPTOR: [u8; 8] = [0x05, 0x01, 0x09, 0x02, 0xA1, 0x01, 0xC0, 0x00];

fn list(conn: &libvirthid::Connection, capacity: u64) -> libvirthid::Result<(u64, u64)> {
    let call = MethodCall::new(vec![LIST, capacity]).with_scalar_outputs(2);
    let reply = conn.external_method(Selector::List.as_raw(), call)?;
    Ok((reply.scalar_output[0], reply.scalar_output[1]))
}

#[test]
fn test_create_passes_arguments_verbatim() {
    let task = FakeTask::new();
    task.add_region(NAME, b"pad1");
    task.add_region(DESCRIPTOR, &MOUSE_DESCRIPTOR);
    task.add_region(SERIAL, b"SN1");
    let provider = SpyProvider::new();
    let conn = connect(&task, &provider);

    let call = MethodCall::new(vec![
        NAME,
        4,
        DESCRIPTOR,
        MOUSE_DESCRIPTOR.len() as u64,
        SERIAL,
        3,
        0x1234,
        0x5678,
    ]);
    let reply = conn
        .external_method(Selector::Create.as_raw(), call)
        .unwrap();
    assert!(reply.scalar_output.is_empty());

    assert_eq!(
        provider.calls(),
        vec![Call::Create {
            name: b"pad1".to_vec(),
            descriptor: MOUSE_DESCRIPTOR.to_vec(),
            serial: b"SN1".to_vec(),
            vendor_id: 0x1234,
            product_id: 0x5678,
        }]
    );
}

#[test]
fn test_list_reports_exact_size() {
    let task = FakeTask::new();
    task.add_writable(LIST, 64, 0xEE);
    let provider = SpyProvider::with_devices(&["pad1", "kbd"]);
    let conn = connect(&task, &provider);

    let (needed, items) = list(&conn, 64).unwrap();
    assert_eq!(needed, 9);
    assert_eq!(items, 2);

    let written = task.read(LIST);
    assert_eq!(&written[..9], b"pad1\0kbd\0");
    assert!(written[9..].iter().all(|b| *b == 0xEE));
    assert_eq!(task.mapped(), 0);
}

#[test]
fn test_list_truncates_to_capacity() {
    let task = FakeTask::new();
    // Writable region larger than the capacity the client declares
    task.add_writable(LIST, 32, 0xEE);
    let provider = SpyProvider::with_devices(&["pad1", "kbd"]);
    let conn = connect(&task, &provider);

    let (needed, items) = list(&conn, 7).unwrap();
    assert!(needed > 7);
    assert_eq!(needed, 9);
    assert_eq!(items, 1);

    let written = task.read(LIST);
    assert_eq!(&written[..5], b"pad1\0");
    assert!(written[7..].iter().all(|b| *b == 0xEE));

    // Second phase: retry with the size the first call asked for
    let (_, items) = list(&conn, needed).unwrap();
    assert_eq!(items, 2);
}

#[test]
fn test_list_on_read_only_buffer_fails() {
    let task = FakeTask::new();
    task.add_region(LIST, &[0; 16]);
    let provider = SpyProvider::with_devices(&["pad1"]);
    let conn = connect(&task, &provider);

    let err = list(&conn, 16).unwrap_err();
    assert_eq!(err.status(), Status::ResourceExhausted);
    assert!(provider.calls().is_empty());
}

#[test]
fn test_create_then_list() {
    let task = FakeTask::new();
    task.add_region(NAME, b"pad1");
    task.add_region(DESCRIPTOR, &MOUSE_DESCRIPTOR);
    task.add_region(SERIAL, b"SN1");
    task.add_writable(LIST, 128, 0);
    let provider = SpyProvider::new();
    let conn = connect(&task, &provider);

    let call = MethodCall::new(vec![NAME, 4, DESCRIPTOR, 8, SERIAL, 3, 0x1234, 0x5678]);
    conn.external_method(Selector::Create.as_raw(), call)
        .unwrap();

    let (needed, items) = list(&conn, 128).unwrap();
    assert!(items >= 1);
    assert_eq!(needed, 5);
}

#[test]
fn test_destroy_unknown_device() {
    let task = FakeTask::new();
    task.add_region(NAME, b"ghost");
    let provider = SpyProvider::with_devices(&["pad1"]);
    let conn = connect(&task, &provider);

    let err = conn
        .external_method(Selector::Destroy.as_raw(), MethodCall::new(vec![NAME, 5]))
        .unwrap_err();

    assert_eq!(err, Error::DeviceError("destroy"));
    assert_eq!(task.pinned(), 0);
    assert_eq!(task.mapped(), 0);
}

#[test]
fn test_send_forwards_report() {
    let task = FakeTask::new();
    task.add_region(NAME, b"pad1");
    task.add_region(REPORT, &[0x01, 0x05, 0xFB, 0x00]);
    let provider = SpyProvider::with_devices(&["pad1"]);
    let conn = connect(&task, &provider);

    conn.external_method(
        Selector::Send.as_raw(),
        MethodCall::new(vec![NAME, 4, REPORT, 4]),
    )
    .unwrap();

    assert_eq!(
        provider.calls(),
        vec![Call::Send {
            name: b"pad1".to_vec(),
            report: vec![0x01, 0x05, 0xFB, 0x00],
        }]
    );
    assert_eq!(task.mapped(), 0);
}

#[test]
fn test_send_to_unknown_device() {
    let task = FakeTask::new();
    task.add_region(NAME, b"pad2");
    task.add_region(REPORT, &[0x01]);
    let provider = SpyProvider::with_devices(&["pad1"]);
    let conn = connect(&task, &provider);

    let err = conn
        .external_method(
            Selector::Send.as_raw(),
            MethodCall::new(vec![NAME, 4, REPORT, 1]),
        )
        .unwrap_err();
    assert_eq!(err.status(), Status::DeviceError);
}

#[test]
fn test_oversized_fields_are_invalid() {
    let task = FakeTask::new();
    task.add_region(NAME, &[b'a'; 300]);
    task.add_region(DESCRIPTOR, &MOUSE_DESCRIPTOR);
    task.add_region(SERIAL, b"SN1");
    let provider = SpyProvider::new();
    let conn = connect(&task, &provider);

    let call = MethodCall::new(vec![NAME, MAX_NAME_LEN + 1]);
    let err = conn
        .external_method(Selector::Destroy.as_raw(), call)
        .unwrap_err();
    assert_eq!(err, Error::InvalidArgument("device name"));

    let call = MethodCall::new(vec![NAME, 4, DESCRIPTOR, 8, SERIAL, 3, 1 << 32, 1]);
    let err = conn
        .external_method(Selector::Create.as_raw(), call)
        .unwrap_err();
    assert_eq!(err, Error::InvalidArgument("vendor id"));

    assert!(provider.calls().is_empty());
    assert_eq!(task.map_calls(), 0);
}

#[test]
fn test_zero_length_name_is_invalid() {
    let task = FakeTask::new();
    task.add_region(NAME, b"pad1");
    let provider = SpyProvider::with_devices(&["pad1"]);
    let conn = connect(&task, &provider);

    let err = conn
        .external_method(Selector::Destroy.as_raw(), MethodCall::new(vec![NAME, 0]))
        .unwrap_err();
    assert_eq!(err, Error::InvalidArgument("zero buffer length"));
}

#[test]
fn test_create_with_overlapping_fields() {
    let task = FakeTask::new();
    task.add_region(NAME, b"pad1pad1");
    task.add_region(DESCRIPTOR, &MOUSE_DESCRIPTOR);
    let provider = SpyProvider::new();
    let conn = connect(&task, &provider);

    // Name and serial share bytes of one client region
    let call = MethodCall::new(vec![NAME + 4, 4, DESCRIPTOR, 8, NAME, 8, 1, 2]);
    conn.external_method(Selector::Create.as_raw(), call)
        .unwrap();

    assert_eq!(
        provider.calls(),
        vec![Call::Create {
            name: b"pad1".to_vec(),
            descriptor: MOUSE_DESCRIPTOR.to_vec(),
            serial: b"pad1pad1".to_vec(),
            vendor_id: 1,
            product_id: 2,
        }]
    );
    assert_eq!(task.pinned(), 0);
    assert_eq!(task.mapped(), 0);
}
