//! Response capture over a boundary-less byte source.
//!
//! Two strategies are provided:
//!
//! * [`read_with_timeout`] waits up to `timeout` for the first byte and then
//!   performs a single non-waiting drain pass. Bytes that arrive after the
//!   drain has seen an empty source are left for the next read, even if the
//!   timeout has not expired yet.
//! * [`read_with_demarcation`] waits the same way for the first byte and then
//!   keeps consuming until the line has been silent for `demark`. The silence
//!   is the frame boundary.
//!
//! Both wait in slices of at most `settings.tick` so the time bound is
//! re-checked at that granularity even when the source blocks on readiness.

use std::io;
use std::time::{Duration, Instant};

use crate::config::ReadSettings;

use super::device::ByteSource;

/// Wait until the source has data or `timeout` has elapsed.
fn wait_for_data(
    source: &mut dyn ByteSource,
    timeout: Duration,
    tick: Duration,
) -> io::Result<bool> {
    let start = Instant::now();
    loop {
        if source.available()? > 0 {
            return Ok(true);
        }
        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Ok(false);
        }
        pause(source, (timeout - elapsed).min(tick))?;
    }
}

/// One wait slice. Interruptions only cut the slice short.
pub(crate) fn pause(source: &mut dyn ByteSource, slice: Duration) -> io::Result<()> {
    match source.wait_readable(slice) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::Interrupted => {
            log::debug!("Interrupted while waiting for serial data, still waiting");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Consume everything that is available right now, up to `limit` bytes total.
fn drain(source: &mut dyn ByteSource, buffer: &mut Vec<u8>, limit: usize) -> io::Result<()> {
    while buffer.len() < limit && source.available()? > 0 {
        buffer.push(source.read_byte()?);
    }
    Ok(())
}

fn into_response(buffer: Vec<u8>) -> Option<Vec<u8>> {
    (!buffer.is_empty()).then_some(buffer)
}

/// Fixed-timeout drain read. Returns `None` when nothing was captured.
pub fn read_with_timeout(
    source: &mut dyn ByteSource,
    timeout: Duration,
    settings: &ReadSettings,
) -> io::Result<Option<Vec<u8>>> {
    let mut buffer = Vec::new();
    wait_for_data(source, timeout, settings.tick)?;
    let limit = settings.max_frame_bytes.get();
    drain(source, &mut buffer, limit)?;

    if buffer.len() >= limit && source.available()? > 0 {
        log::warn!(
            "Response reached {} bytes, leaving the rest for the next read",
            limit
        );
    }
    Ok(into_response(buffer))
}

/// Timeout plus silence demarcation read. Returns `None` when no byte arrived
/// within `timeout`.
pub fn read_with_demarcation(
    source: &mut dyn ByteSource,
    timeout: Duration,
    demark: Duration,
    settings: &ReadSettings,
) -> io::Result<Option<Vec<u8>>> {
    if !wait_for_data(source, timeout, settings.tick)? {
        return Ok(None);
    }

    let mut buffer = Vec::new();
    let frame_start = Instant::now();
    let mut last_byte = frame_start;

    loop {
        if buffer.len() >= settings.max_frame_bytes.get() {
            log::warn!(
                "Frame reached {} bytes before {:?} of silence, cutting it short",
                settings.max_frame_bytes,
                demark
            );
            break;
        }

        if source.available()? > 0 {
            buffer.push(source.read_byte()?);
            last_byte = Instant::now();
            continue;
        }

        let idle = last_byte.elapsed();
        if idle >= demark {
            break;
        }

        if let Some(limit) = settings.max_frame_duration {
            if frame_start.elapsed() >= limit {
                log::warn!(
                    "Line never went quiet for {:?} within {:?}, closing frame after {} bytes",
                    demark,
                    limit,
                    buffer.len()
                );
                break;
            }
        }

        pause(source, (demark - idle).min(settings.tick))?;
    }

    Ok(into_response(buffer))
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;

    use super::*;
    use crate::serial::scripted::ScriptedDevice;
    use crate::serial::DeviceHandle;

    fn settings() -> ReadSettings {
        ReadSettings::default()
    }

    fn source_for(device: &ScriptedDevice) -> Box<dyn ByteSource> {
        let mut handle = device.handle("scripted");
        handle.input().unwrap()
    }

    /// Source whose first few readiness waits are interrupted.
    struct Interrupting {
        inner: Box<dyn ByteSource>,
        interrupts: usize,
    }

    impl ByteSource for Interrupting {
        fn available(&mut self) -> io::Result<usize> {
            self.inner.available()
        }

        fn read_byte(&mut self) -> io::Result<u8> {
            self.inner.read_byte()
        }

        fn wait_readable(&mut self, timeout: Duration) -> io::Result<bool> {
            if self.interrupts > 0 {
                self.interrupts -= 1;
                return Err(io::Error::new(io::ErrorKind::Interrupted, "signal"));
            }
            self.inner.wait_readable(timeout)
        }
    }

    #[test]
    fn test_timeout_read_on_silent_source_is_absent() {
        let device = ScriptedDevice::new();
        let mut source = source_for(&device);

        let start = Instant::now();
        let response = read_with_timeout(&mut *source, Duration::from_millis(40), &settings()).unwrap();

        assert_eq!(response, None);
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn test_timeout_read_returns_queued_burst() {
        let device = ScriptedDevice::new();
        device.push_now(&[0x10, 0x20, 0x30]);
        let mut source = source_for(&device);

        let response = read_with_timeout(&mut *source, Duration::from_millis(200), &settings()).unwrap();
        assert_eq!(response, Some(vec![0x10, 0x20, 0x30]));
    }

    #[test]
    fn test_timeout_read_is_a_single_drain_pass() {
        let device = ScriptedDevice::new();
        device.push_after(Duration::from_millis(20), &[0x01]);
        device.push_after(Duration::from_millis(120), &[0x02]);
        let mut source = source_for(&device);

        let response = read_with_timeout(&mut *source, Duration::from_millis(500), &settings()).unwrap();
        assert_eq!(response, Some(vec![0x01]));

        let next = read_with_timeout(&mut *source, Duration::from_millis(500), &settings()).unwrap();
        assert_eq!(next, Some(vec![0x02]));
    }

    #[test]
    fn test_timeout_read_caps_frame_size() {
        let device = ScriptedDevice::new();
        device.push_now(&[0xAB; 10]);
        let mut source = source_for(&device);
        let limited = ReadSettings {
            max_frame_bytes: NonZeroUsize::new(4).unwrap(),
            ..ReadSettings::default()
        };

        let first = read_with_timeout(&mut *source, Duration::from_millis(50), &limited).unwrap();
        assert_eq!(first, Some(vec![0xAB; 4]));
        assert_eq!(source.available().unwrap(), 6);
    }

    #[test]
    fn test_timeout_read_filling_cap_exactly() {
        let device = ScriptedDevice::new();
        device.push_now(&[0x01, 0x02, 0x03, 0x04]);
        let mut source = source_for(&device);
        let limited = ReadSettings {
            max_frame_bytes: NonZeroUsize::new(4).unwrap(),
            ..ReadSettings::default()
        };

        let response = read_with_timeout(&mut *source, Duration::from_millis(50), &limited).unwrap();
        assert_eq!(response, Some(vec![0x01, 0x02, 0x03, 0x04]));
        assert_eq!(source.available().unwrap(), 0);
    }

    #[test]
    fn test_timeout_read_keeps_waiting_after_interrupt() {
        let device = ScriptedDevice::new();
        let mut source = Interrupting {
            inner: source_for(&device),
            interrupts: 1,
        };

        let start = Instant::now();
        let response = read_with_timeout(&mut source, Duration::from_millis(40), &settings()).unwrap();

        assert_eq!(response, None);
        assert_eq!(source.interrupts, 0);
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn test_demarcation_survives_interrupts() {
        let device = ScriptedDevice::new();
        device.push_after(Duration::from_millis(20), &[0x0A]);
        device.push_after(Duration::from_millis(25), &[0x0B]);
        let mut source = Interrupting {
            inner: source_for(&device),
            interrupts: 3,
        };

        let frame = read_with_demarcation(
            &mut source,
            Duration::from_millis(200),
            Duration::from_millis(20),
            &settings(),
        )
        .unwrap();

        assert_eq!(frame, Some(vec![0x0A, 0x0B]));
        assert_eq!(source.interrupts, 0);
    }

    #[test]
    fn test_demarcation_stops_at_silence() {
        let device = ScriptedDevice::new();
        device.push_after(Duration::from_millis(10), &[0xA0]);
        device.push_after(Duration::from_millis(15), &[0xB0]);
        device.push_after(Duration::from_millis(90), &[0xC0]);
        let mut source = source_for(&device);

        let frame = read_with_demarcation(
            &mut *source,
            Duration::from_millis(200),
            Duration::from_millis(20),
            &settings(),
        )
        .unwrap();
        assert_eq!(frame, Some(vec![0xA0, 0xB0]));

        let next = read_with_timeout(&mut *source, Duration::from_millis(200), &settings()).unwrap();
        assert_eq!(next, Some(vec![0xC0]));
    }

    #[test]
    fn test_demarcation_without_first_byte_is_absent() {
        let device = ScriptedDevice::new();
        let mut source = source_for(&device);

        let frame = read_with_demarcation(
            &mut *source,
            Duration::from_millis(30),
            Duration::from_millis(10),
            &settings(),
        )
        .unwrap();
        assert_eq!(frame, None);
    }

    #[test]
    fn test_demarcation_bounded_by_max_frame_duration() {
        let device = ScriptedDevice::new();
        for i in 0..40u64 {
            device.push_after(Duration::from_millis(5 * i), &[i as u8]);
        }
        let mut source = source_for(&device);
        let bounded = ReadSettings {
            max_frame_duration: Some(Duration::from_millis(60)),
            ..ReadSettings::default()
        };

        let start = Instant::now();
        let frame = read_with_demarcation(
            &mut *source,
            Duration::from_millis(100),
            Duration::from_millis(50),
            &bounded,
        )
        .unwrap()
        .unwrap();

        assert!(start.elapsed() < Duration::from_millis(150));
        assert!(!frame.is_empty());
        assert!(frame.len() < 40);
        assert_eq!(frame[0], 0);
    }
}
