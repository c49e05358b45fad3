mod common;

use uart_link_lib::serial::{ScriptedDevice, SerialError, SinkEvent};

#[test]
fn test_message_written_once_then_flushed() {
    let device = ScriptedDevice::new();
    let connection = common::connect(&device);

    connection.send_message(Some(&[0x10, 0x20, 0x30][..])).unwrap();

    assert_eq!(
        device.sink_events(),
        vec![SinkEvent::Write(vec![0x10, 0x20, 0x30]), SinkEvent::Flush]
    );
    let metrics = connection.metrics();
    assert_eq!(metrics.messages_sent, 1);
    assert_eq!(metrics.bytes_written, 3);
}

#[test]
fn test_absent_message_is_rejected_before_io() {
    let device = ScriptedDevice::new();
    let connection = common::connect(&device);

    let err = connection.send_message(None).unwrap_err();

    assert!(matches!(err, SerialError::MissingPayload("message")));
    assert!(device.sink_events().is_empty());
    assert_eq!(device.outputs_created(), 0);
}

#[test]
fn test_empty_message_is_still_written() {
    let device = ScriptedDevice::new();
    let connection = common::connect(&device);

    connection.send_message(Some(&[][..])).unwrap();

    assert_eq!(device.sink_events(), vec![SinkEvent::Write(vec![]), SinkEvent::Flush]);
}

#[test]
fn test_write_failure_propagates() {
    let device = ScriptedDevice::new();
    let connection = common::connect(&device);
    device.fail_writes(true);

    let err = connection.send_message(Some(&[0x01][..])).unwrap_err();

    assert!(matches!(err, SerialError::IoError(_)));
    assert!(connection.metrics().last_error.is_some());
}

#[test]
fn test_output_adapter_is_reused() {
    let device = ScriptedDevice::new();
    let connection = common::connect(&device);

    connection.send_message(Some(&[0x01][..])).unwrap();
    connection.send_message(Some(&[0x02][..])).unwrap();

    assert_eq!(device.outputs_created(), 1);
    assert_eq!(device.written(), vec![0x01, 0x02]);
}
