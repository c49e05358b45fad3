//! Device handle boundary.
//!
//! The connection never talks to `serialport` directly. It goes through the
//! traits below so that the framing logic can be driven by any byte-oriented
//! transport, including the scripted devices used in tests.

use std::io::{self, Read, Write};
use std::thread;
use std::time::Duration;

use serialport::SerialPort;

use crate::config::ConnectionConfig;

/// Timeout applied to blocking writes on a real port.
pub const WRITE_TIMEOUT: Duration = Duration::from_millis(1000);

/// Opens a device handle for a validated configuration.
pub trait DeviceOpener: Send + Sync {
    fn open(&self, config: &ConnectionConfig) -> io::Result<Box<dyn DeviceHandle>>;
}

/// An opened serial device. Owns the underlying transport.
pub trait DeviceHandle: Send {
    fn name(&self) -> &str;

    fn is_open(&self) -> bool;

    /// Create a reader over the device.
    fn input(&mut self) -> io::Result<Box<dyn ByteSource>>;

    /// Create a writer over the device.
    fn output(&mut self) -> io::Result<Box<dyn ByteSink>>;

    fn close(&mut self) -> io::Result<()>;
}

/// Byte-oriented input side of a device.
pub trait ByteSource: Send {
    /// Number of bytes that can be read right now without blocking.
    fn available(&mut self) -> io::Result<usize>;

    /// Read one byte. Only called after `available` reported data.
    fn read_byte(&mut self) -> io::Result<u8>;

    /// Block for at most `timeout` until data is available.
    ///
    /// The default sleeps the whole slice and re-checks, which gives the
    /// coarse tick behaviour for sources without readiness notification.
    fn wait_readable(&mut self, timeout: Duration) -> io::Result<bool> {
        thread::sleep(timeout);
        Ok(self.available()? > 0)
    }

    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Byte-oriented output side of a device.
pub trait ByteSink: Send {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()>;

    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Opens real ports through the `serialport` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemOpener;

impl DeviceOpener for SystemOpener {
    fn open(&self, config: &ConnectionConfig) -> io::Result<Box<dyn DeviceHandle>> {
        let port = serialport::new(config.port.as_str(), config.baud_rate)
            .data_bits(config.data_bits.into())
            .parity(config.parity.into())
            .stop_bits(config.stop_bits.into())
            .flow_control(config.flow_control.into())
            .timeout(WRITE_TIMEOUT)
            .open()?;

        log::info!("Opened serial device {}", config.device_name());
        Ok(Box::new(SerialPortDevice::new(config.port.clone(), port)))
    }
}

pub struct SerialPortDevice {
    name: String,
    port: Option<Box<dyn SerialPort>>,
}

impl SerialPortDevice {
    pub fn new(name: String, port: Box<dyn SerialPort>) -> Self {
        Self {
            name,
            port: Some(port),
        }
    }

    fn clone_port(&self) -> io::Result<Box<dyn SerialPort>> {
        let port = self
            .port
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "serial device is closed"))?;
        Ok(port.try_clone()?)
    }
}

impl DeviceHandle for SerialPortDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn input(&mut self) -> io::Result<Box<dyn ByteSource>> {
        Ok(Box::new(SerialPortSource {
            port: Some(self.clone_port()?),
            pending: None,
        }))
    }

    fn output(&mut self) -> io::Result<Box<dyn ByteSink>> {
        Ok(Box::new(SerialPortSink {
            port: Some(self.clone_port()?),
        }))
    }

    fn close(&mut self) -> io::Result<()> {
        // The descriptor is released when the last clone is dropped
        if self.port.take().is_some() {
            log::info!("Closed serial device {}", self.name);
        }
        Ok(())
    }
}

fn closed_stream() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "serial stream is closed")
}

struct SerialPortSource {
    port: Option<Box<dyn SerialPort>>,
    // Byte consumed while waiting for readiness, handed out by the next read
    pending: Option<u8>,
}

impl SerialPortSource {
    fn port(&mut self) -> io::Result<&mut Box<dyn SerialPort>> {
        self.port.as_mut().ok_or_else(closed_stream)
    }
}

impl ByteSource for SerialPortSource {
    fn available(&mut self) -> io::Result<usize> {
        let queued = self.port()?.bytes_to_read()? as usize;
        Ok(queued + usize::from(self.pending.is_some()))
    }

    fn read_byte(&mut self) -> io::Result<u8> {
        if let Some(byte) = self.pending.take() {
            return Ok(byte);
        }
        let mut buf = [0u8; 1];
        self.port()?.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    fn wait_readable(&mut self, timeout: Duration) -> io::Result<bool> {
        if self.available()? > 0 {
            return Ok(true);
        }

        let port = self.port()?;
        port.set_timeout(timeout.max(Duration::from_millis(1)))?;
        let mut buf = [0u8; 1];
        match port.read(&mut buf) {
            Ok(0) => Ok(false),
            Ok(_) => {
                self.pending = Some(buf[0]);
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn close(&mut self) -> io::Result<()> {
        self.pending = None;
        self.port = None;
        Ok(())
    }
}

struct SerialPortSink {
    port: Option<Box<dyn SerialPort>>,
}

impl ByteSink for SerialPortSink {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.port.as_mut().ok_or_else(closed_stream)?.write_all(bytes)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.as_mut().ok_or_else(closed_stream)?.flush()
    }

    fn close(&mut self) -> io::Result<()> {
        if let Some(mut port) = self.port.take() {
            port.flush()?;
        }
        Ok(())
    }
}
