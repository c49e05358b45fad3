mod common;

use std::time::{Duration, Instant};

use uart_link_lib::serial::{ScriptedDevice, SerialError, SinkEvent};

fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

#[test]
fn test_command_captures_delayed_reply() {
    let device = ScriptedDevice::new();
    device.queue_reply(vec![(ms(50), vec![0x03, 0x04])]);
    let connection = common::connect(&device);

    let response = connection
        .send_command(Some(&[0x01, 0x02][..]), ms(200))
        .unwrap();

    assert_eq!(response, Some(vec![0x03, 0x04]));
    assert_eq!(device.written(), vec![0x01, 0x02]);
    let metrics = connection.metrics();
    assert_eq!(metrics.commands_sent, 1);
    assert_eq!(metrics.responses_captured, 1);
    assert_eq!(metrics.desync_events, 0);
}

#[test]
fn test_demarcated_command_stops_at_silence() {
    let device = ScriptedDevice::new();
    device.set_echo(true);
    // 0xBB follows the echo by 5 ms, then the line is quiet for 30 ms
    device.queue_reply(vec![(ms(5), vec![0xBB]), (ms(35), vec![0xCC])]);
    let connection = common::connect(&device);

    let response = connection
        .send_command_demarcated(Some(&[0xAA][..]), ms(200), ms(20))
        .unwrap();
    assert_eq!(response, Some(vec![0xAA, 0xBB]));

    let next = connection.read_response(ms(200)).unwrap();
    assert_eq!(next, Some(vec![0xCC]));
}

#[test]
fn test_demarcated_command_opens_both_streams_up_front() {
    let device = ScriptedDevice::new();
    let connection = common::connect(&device);

    let response = connection
        .send_command_demarcated(Some(&[0x01][..]), ms(20), ms(10))
        .unwrap();

    assert_eq!(response, None);
    assert_eq!(device.inputs_created(), 1);
    assert_eq!(device.outputs_created(), 1);
}

#[test]
fn test_command_without_reply_is_absent() {
    let device = ScriptedDevice::new();
    let connection = common::connect(&device);

    let start = Instant::now();
    let response = connection.send_command(Some(&[0x7E][..]), ms(60)).unwrap();

    assert_eq!(response, None);
    assert!(start.elapsed() >= ms(60));
    assert_eq!(connection.metrics().responses_absent, 1);
}

#[test]
fn test_stale_bytes_are_discarded_before_command() {
    let device = ScriptedDevice::new();
    device.push_now(&[0xDE, 0xAD]);
    device.queue_reply(vec![(ms(10), vec![0x06])]);
    let connection = common::connect(&device);

    let response = connection.send_command(Some(&[0x05][..]), ms(200)).unwrap();

    assert_eq!(response, Some(vec![0x06]));
    let metrics = connection.metrics();
    assert_eq!(metrics.stale_bytes_discarded, 2);
    assert_eq!(metrics.desync_events, 1);
    assert!(metrics.last_desync_at.is_some());
}

#[test]
fn test_absent_command_is_rejected_before_io() {
    let device = ScriptedDevice::new();
    device.push_now(&[0x01]);
    let connection = common::connect(&device);

    let err = connection.send_command(None, ms(100)).unwrap_err();
    assert!(matches!(err, SerialError::MissingPayload("command")));
    let err = connection.send_command_demarcated(None, ms(100), ms(10)).unwrap_err();
    assert!(matches!(err, SerialError::MissingPayload("command")));

    assert!(device.sink_events().is_empty());
    // Nothing was flushed either
    assert_eq!(device.pending(), 1);
}

#[test]
fn test_flush_buffer_on_idle_source_is_absent() {
    let device = ScriptedDevice::new();
    let connection = common::connect(&device);

    assert_eq!(connection.flush_buffer().unwrap(), None);
}

#[test]
fn test_flush_buffer_returns_waiting_bytes() {
    let device = ScriptedDevice::new();
    device.push_now(&[0x41, 0x42, 0x43]);
    let connection = common::connect(&device);

    assert_eq!(connection.flush_buffer().unwrap(), Some(vec![0x41, 0x42, 0x43]));
    assert_eq!(connection.flush_buffer().unwrap(), None);
}

#[test]
fn test_reply_split_across_drain_passes() {
    let device = ScriptedDevice::new();
    device.queue_reply(vec![(ms(10), vec![0x01]), (ms(120), vec![0x02])]);
    let connection = common::connect(&device);

    // The drain pass ends as soon as the source is empty, even with time left
    let response = connection.send_command(Some(&[0x00][..]), ms(500)).unwrap();
    assert_eq!(response, Some(vec![0x01]));

    let rest = connection.read_response(ms(500)).unwrap();
    assert_eq!(rest, Some(vec![0x02]));
}

#[test]
fn test_read_frame_without_command() {
    let device = ScriptedDevice::new();
    device.push_after(ms(10), &[0x10, 0x11]);
    device.push_after(ms(20), &[0x12]);
    let connection = common::connect(&device);

    let frame = connection.read_frame(ms(200), ms(30)).unwrap();

    assert_eq!(frame, Some(vec![0x10, 0x11, 0x12]));
    assert_eq!(device.sink_events(), Vec::<SinkEvent>::new());
}
