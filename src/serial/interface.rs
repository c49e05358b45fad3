use std::fmt;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::{ConnectionConfig, ReadSettings};

use super::device::{ByteSource, DeviceHandle, DeviceOpener, SystemOpener};
use super::metrics::ConnectionMetrics;
use super::reader;
use super::stream::{lock, InputStream, OutputStream};
use super::{bytes_as_string, Result, SerialError};

/// Failures swallowed while tearing resources down.
#[derive(Debug, Default)]
pub struct ReleaseReport {
    pub failures: Vec<SerialError>,
}

impl ReleaseReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn record(&mut self, resource: &'static str, result: io::Result<()>) {
        if let Err(source) = result {
            log::warn!("Failed to release {}: {}", resource, source);
            self.failures.push(SerialError::ReleaseFailed { resource, source });
        }
    }
}

/// One serial connection: a device handle plus lazily created stream adapters.
///
/// Reads are exclusive per connection (the input adapter is locked for the
/// whole read). Every write, and every write followed by a read inside
/// `send_command*`, additionally holds the exchange lock so concurrent callers
/// cannot interleave commands or steal each other's replies.
pub struct SerialConnection {
    opener: Arc<dyn DeviceOpener>,
    settings: ReadSettings,
    config: Option<ConnectionConfig>,
    device: Mutex<Option<Box<dyn DeviceHandle>>>,
    input: Mutex<Option<InputStream>>,
    output: Mutex<Option<OutputStream>>,
    exchange: Mutex<()>,
    metrics: Mutex<ConnectionMetrics>,
}

impl SerialConnection {
    pub fn new() -> Self {
        Self::with_opener(Arc::new(SystemOpener))
    }

    pub fn with_opener(opener: Arc<dyn DeviceOpener>) -> Self {
        Self {
            opener,
            settings: ReadSettings::default(),
            config: None,
            device: Mutex::new(None),
            input: Mutex::new(None),
            output: Mutex::new(None),
            exchange: Mutex::new(()),
            metrics: Mutex::new(ConnectionMetrics::default()),
        }
    }

    pub fn with_settings(mut self, settings: ReadSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Open a real port with the given configuration.
    pub fn open(config: ConnectionConfig) -> Result<Self> {
        let mut connection = Self::new();
        connection.configure(config)?;
        Ok(connection)
    }

    pub fn config(&self) -> Option<&ConnectionConfig> {
        self.config.as_ref()
    }

    pub fn settings(&self) -> &ReadSettings {
        &self.settings
    }

    pub fn is_open(&self) -> bool {
        lock(&self.device).as_ref().is_some_and(|device| device.is_open())
    }

    pub fn metrics(&self) -> ConnectionMetrics {
        lock(&self.metrics).clone()
    }

    fn update_metrics(&self, f: impl FnOnce(&mut ConnectionMetrics)) {
        f(&mut lock(&self.metrics));
    }

    /// Apply a new configuration.
    ///
    /// Existing adapters and the device handle are released first; failures
    /// there are logged and do not stop the reopen. Streams are created
    /// lazily afterwards.
    pub fn configure(&mut self, config: ConnectionConfig) -> Result<()> {
        config.validate()?;

        let mut report = ReleaseReport::default();
        self.release_streams(&mut report);
        if let Some(mut device) = lock(&self.device).take() {
            if device.is_open() {
                report.record("device handle", device.close());
            }
        }
        self.note_release_failures(&report);
        self.config = None;

        let device = self.opener.open(&config).map_err(|source| {
            log::error!("Failed to open {}: {}", config, source);
            SerialError::ConnectionFailed {
                config: config.to_string(),
                source,
            }
        })?;

        log::info!("Serial connection configured: {}", config);
        *lock(&self.device) = Some(device);
        self.config = Some(config);
        Ok(())
    }

    /// Input adapter for this connection, created on first use.
    pub fn open_input_stream(&self) -> Result<InputStream> {
        let mut slot = lock(&self.input);
        if let Some(stream) = slot.as_ref() {
            return Ok(stream.clone());
        }

        let mut device = lock(&self.device);
        let handle = device
            .as_mut()
            .filter(|handle| handle.is_open())
            .ok_or(SerialError::NotConnected)?;
        let stream = InputStream::new(handle.input()?, self.settings.tick);
        log::debug!("Opened input stream on {}", handle.name());

        *slot = Some(stream.clone());
        Ok(stream)
    }

    /// Output adapter for this connection, created on first use.
    pub fn open_output_stream(&self) -> Result<OutputStream> {
        let mut slot = lock(&self.output);
        if let Some(stream) = slot.as_ref() {
            return Ok(stream.clone());
        }

        let mut device = lock(&self.device);
        let handle = device
            .as_mut()
            .filter(|handle| handle.is_open())
            .ok_or(SerialError::NotConnected)?;
        let stream = OutputStream::new(handle.output()?);
        log::debug!("Opened output stream on {}", handle.name());

        *slot = Some(stream.clone());
        Ok(stream)
    }

    /// Write a message and flush it.
    pub fn send_message(&self, message: Option<&[u8]>) -> Result<()> {
        let message = message.ok_or(SerialError::MissingPayload("message"))?;
        log::debug!("send_message() - {}", bytes_as_string(message));

        let _exchange = lock(&self.exchange);
        self.write(message)?;
        self.update_metrics(|m| m.messages_sent += 1);
        Ok(())
    }

    /// Write a command and capture whatever the device sends back within
    /// `timeout`, using a single drain pass once the first byte is seen.
    pub fn send_command(&self, command: Option<&[u8]>, timeout: Duration) -> Result<Option<Vec<u8>>> {
        let command = command.ok_or(SerialError::MissingPayload("command"))?;
        log::debug!("send_command() - {}", bytes_as_string(command));

        let _exchange = lock(&self.exchange);
        let input = self.open_input_stream()?;
        self.discard_stale_input(&input)?;
        self.write(command)?;
        self.update_metrics(|m| m.commands_sent += 1);

        let settings = self.settings;
        self.read_response_locked(&input, |source| {
            reader::read_with_timeout(source, timeout, &settings)
        })
    }

    /// Write a command and capture the reply frame that ends once the line
    /// has been quiet for `demark`.
    pub fn send_command_demarcated(
        &self,
        command: Option<&[u8]>,
        timeout: Duration,
        demark: Duration,
    ) -> Result<Option<Vec<u8>>> {
        let command = command.ok_or(SerialError::MissingPayload("command"))?;
        log::debug!("send_command() - {}", bytes_as_string(command));

        let _exchange = lock(&self.exchange);
        self.open_output_stream()?;
        let input = self.open_input_stream()?;
        self.discard_stale_input(&input)?;
        self.write(command)?;
        self.update_metrics(|m| m.commands_sent += 1);

        let settings = self.settings;
        self.read_response_locked(&input, |source| {
            reader::read_with_demarcation(source, timeout, demark, &settings)
        })
    }

    /// Drain whatever is sitting in the input buffer.
    pub fn flush_buffer(&self) -> Result<Option<Vec<u8>>> {
        let _exchange = lock(&self.exchange);
        let input = self.open_input_stream()?;
        self.drain_input(&input)
    }

    /// Fixed-timeout read without writing anything first.
    pub fn read_response(&self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        let _exchange = lock(&self.exchange);
        let input = self.open_input_stream()?;
        let settings = self.settings;
        self.read_response_locked(&input, |source| {
            reader::read_with_timeout(source, timeout, &settings)
        })
    }

    /// Silence-delimited read without writing anything first.
    pub fn read_frame(&self, timeout: Duration, demark: Duration) -> Result<Option<Vec<u8>>> {
        let _exchange = lock(&self.exchange);
        let input = self.open_input_stream()?;
        let settings = self.settings;
        self.read_response_locked(&input, |source| {
            reader::read_with_demarcation(source, timeout, demark, &settings)
        })
    }

    /// Release both adapters, then close the device handle if it is still
    /// open. Adapter release failures are collected in the returned report;
    /// only a failing device close is raised. Closing twice is a no-op.
    pub fn close(&self) -> Result<ReleaseReport> {
        let mut report = ReleaseReport::default();
        self.release_streams(&mut report);
        self.note_release_failures(&report);

        let mut device = lock(&self.device);
        if let Some(handle) = device.as_mut() {
            if handle.is_open() {
                // Left in place on failure so a later close can retry
                handle.close()?;
                log::info!("Serial connection {} closed", handle.name());
            }
        }
        *device = None;
        Ok(report)
    }

    fn release_streams(&self, report: &mut ReleaseReport) {
        if let Some(output) = lock(&self.output).take() {
            report.record("output stream", output.release());
        }
        if let Some(input) = lock(&self.input).take() {
            report.record("input stream", input.release());
        }
    }

    fn note_release_failures(&self, report: &ReleaseReport) {
        if report.is_clean() {
            return;
        }
        let last = report.failures.last().map(ToString::to_string);
        self.update_metrics(|m| {
            m.release_failures += report.failures.len() as u64;
            m.last_error = last;
        });
    }

    fn write(&self, bytes: &[u8]) -> Result<()> {
        let output = self.open_output_stream()?;
        if let Err(e) = output.write_and_flush(bytes) {
            self.update_metrics(|m| m.last_error = Some(e.to_string()));
            return Err(e.into());
        }
        self.update_metrics(|m| m.bytes_written += bytes.len() as u64);
        Ok(())
    }

    fn drain_input(&self, input: &InputStream) -> Result<Option<Vec<u8>>> {
        let settings = self.settings;
        self.read_locked(input, |source| {
            reader::read_with_timeout(source, settings.flush_timeout, &settings)
        })
    }

    /// Bytes left over before a command are a sign the peer and we are out
    /// of step. They are dropped and reported, never returned.
    fn discard_stale_input(&self, input: &InputStream) -> Result<()> {
        if let Some(stale) = self.drain_input(input)? {
            log::warn!(
                "Discarding {} byte(s) from the serial input buffer before sending command: {}",
                stale.len(),
                bytes_as_string(&stale)
            );
            self.update_metrics(|m| m.record_discard(stale.len()));
        }
        Ok(())
    }

    fn read_locked<F>(&self, input: &InputStream, read: F) -> Result<Option<Vec<u8>>>
    where
        F: FnOnce(&mut dyn ByteSource) -> io::Result<Option<Vec<u8>>>,
    {
        let mut guard = input.lock();
        let source = guard.as_mut().ok_or(SerialError::NotConnected)?;
        let bytes = match read(&mut **source) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.update_metrics(|m| m.last_error = Some(e.to_string()));
                return Err(e.into());
            }
        };
        drop(guard);

        if let Some(bytes) = &bytes {
            log::debug!("Received {} byte(s): {}", bytes.len(), bytes_as_string(bytes));
            self.update_metrics(|m| m.bytes_read += bytes.len() as u64);
        }
        Ok(bytes)
    }

    fn read_response_locked<F>(&self, input: &InputStream, read: F) -> Result<Option<Vec<u8>>>
    where
        F: FnOnce(&mut dyn ByteSource) -> io::Result<Option<Vec<u8>>>,
    {
        let response = self.read_locked(input, read)?;
        self.update_metrics(|m| m.record_response(response.is_some()));
        Ok(response)
    }
}

impl Default for SerialConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SerialConnection {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::warn!("Error closing serial connection on drop: {}", e);
        }
    }
}

impl fmt::Debug for SerialConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialConnection")
            .field("config", &self.config)
            .field("open", &self.is_open())
            .finish()
    }
}
