//! In-memory device driven by a timed script.
//!
//! Exposed unconditionally so integration tests and host-side simulations can
//! exercise [`super::SerialConnection`] without hardware. Inbound bytes carry a
//! due time and only become available once it has passed; writes are recorded
//! and can trigger scripted replies relative to the moment they happened.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::config::ConnectionConfig;

use super::device::{ByteSink, ByteSource, DeviceHandle, DeviceOpener};
use super::stream::lock;

/// Reply script: each entry is delivered `delay` after the triggering write.
pub type ReplyScript = Vec<(Duration, Vec<u8>)>;

type Responder = Box<dyn Fn(&[u8]) -> ReplyScript + Send>;

/// What the output side observed, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    Write(Vec<u8>),
    Flush,
}

#[derive(Default)]
struct ScriptState {
    inbound: VecDeque<(Instant, u8)>,
    echo: bool,
    replies: VecDeque<ReplyScript>,
    responder: Option<Responder>,
    sink_events: Vec<SinkEvent>,
    opened: Vec<ConnectionConfig>,
    handle_closes: usize,
    inputs_created: usize,
    outputs_created: usize,
    fail_next_open: Option<io::ErrorKind>,
    fail_stream_release: bool,
    fail_handle_close: bool,
    fail_writes: bool,
}

impl ScriptState {
    fn schedule(&mut self, due: Instant, bytes: &[u8]) {
        self.inbound.extend(bytes.iter().map(|b| (due, *b)));
        // Stable, so bytes sharing a due time keep their order
        self.inbound.make_contiguous().sort_by_key(|(due, _)| *due);
    }

    fn ready(&self, now: Instant) -> usize {
        self.inbound.iter().take_while(|(due, _)| *due <= now).count()
    }

    fn next_due(&self) -> Option<Instant> {
        self.inbound.front().map(|(due, _)| *due)
    }
}

#[derive(Default)]
struct Shared {
    state: Mutex<ScriptState>,
    arrived: Condvar,
}

#[derive(Clone, Default)]
pub struct ScriptedDevice {
    shared: Arc<Shared>,
}

impl ScriptedDevice {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut ScriptState) -> R) -> R {
        let result = f(&mut lock(&self.shared.state));
        self.shared.arrived.notify_all();
        result
    }

    /// Make bytes available immediately.
    pub fn push_now(&self, bytes: &[u8]) {
        self.push_after(Duration::ZERO, bytes);
    }

    /// Make bytes available `delay` from now.
    pub fn push_after(&self, delay: Duration, bytes: &[u8]) {
        let due = Instant::now() + delay;
        self.with_state(|state| state.schedule(due, bytes));
    }

    /// Loop every written byte straight back to the input.
    pub fn set_echo(&self, echo: bool) {
        self.with_state(|state| state.echo = echo);
    }

    /// Reply script consumed by the next write that has no earlier script queued.
    pub fn queue_reply(&self, script: ReplyScript) {
        self.with_state(|state| state.replies.push_back(script));
    }

    /// Compute a reply for every write that has no queued script.
    pub fn respond_with<F>(&self, responder: F)
    where
        F: Fn(&[u8]) -> ReplyScript + Send + 'static,
    {
        self.with_state(|state| state.responder = Some(Box::new(responder)));
    }

    pub fn fail_next_open(&self, kind: io::ErrorKind) {
        self.with_state(|state| state.fail_next_open = Some(kind));
    }

    pub fn fail_stream_release(&self, fail: bool) {
        self.with_state(|state| state.fail_stream_release = fail);
    }

    pub fn fail_handle_close(&self, fail: bool) {
        self.with_state(|state| state.fail_handle_close = fail);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.with_state(|state| state.fail_writes = fail);
    }

    pub fn sink_events(&self) -> Vec<SinkEvent> {
        lock(&self.shared.state).sink_events.clone()
    }

    /// Every byte written so far, concatenated.
    pub fn written(&self) -> Vec<u8> {
        lock(&self.shared.state)
            .sink_events
            .iter()
            .filter_map(|event| match event {
                SinkEvent::Write(bytes) => Some(bytes.as_slice()),
                SinkEvent::Flush => None,
            })
            .flatten()
            .copied()
            .collect()
    }

    /// Bytes still queued on the input side, due or not.
    pub fn pending(&self) -> usize {
        lock(&self.shared.state).inbound.len()
    }

    pub fn opened_configs(&self) -> Vec<ConnectionConfig> {
        lock(&self.shared.state).opened.clone()
    }

    pub fn handle_closes(&self) -> usize {
        lock(&self.shared.state).handle_closes
    }

    pub fn inputs_created(&self) -> usize {
        lock(&self.shared.state).inputs_created
    }

    pub fn outputs_created(&self) -> usize {
        lock(&self.shared.state).outputs_created
    }

    /// A handle over this device that is already open.
    pub fn handle(&self, name: &str) -> ScriptedHandle {
        ScriptedHandle {
            name: name.to_string(),
            shared: self.shared.clone(),
            open: true,
        }
    }
}

impl DeviceOpener for ScriptedDevice {
    fn open(&self, config: &ConnectionConfig) -> io::Result<Box<dyn DeviceHandle>> {
        let mut state = lock(&self.shared.state);
        if let Some(kind) = state.fail_next_open.take() {
            return Err(io::Error::new(kind, format!("cannot open {}", config.port)));
        }
        state.opened.push(config.clone());
        drop(state);
        Ok(Box::new(self.handle(&config.port)))
    }
}

fn scripted_failure(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::Other, format!("scripted {what} failure"))
}

fn not_open() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "scripted device is closed")
}

pub struct ScriptedHandle {
    name: String,
    shared: Arc<Shared>,
    open: bool,
}

impl DeviceHandle for ScriptedHandle {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn input(&mut self) -> io::Result<Box<dyn ByteSource>> {
        if !self.open {
            return Err(not_open());
        }
        lock(&self.shared.state).inputs_created += 1;
        Ok(Box::new(ScriptedSource {
            shared: self.shared.clone(),
            open: true,
        }))
    }

    fn output(&mut self) -> io::Result<Box<dyn ByteSink>> {
        if !self.open {
            return Err(not_open());
        }
        lock(&self.shared.state).outputs_created += 1;
        Ok(Box::new(ScriptedSink {
            shared: self.shared.clone(),
            open: true,
        }))
    }

    fn close(&mut self) -> io::Result<()> {
        let mut state = lock(&self.shared.state);
        if state.fail_handle_close {
            return Err(scripted_failure("close"));
        }
        self.open = false;
        state.handle_closes += 1;
        Ok(())
    }
}

struct ScriptedSource {
    shared: Arc<Shared>,
    open: bool,
}

impl ByteSource for ScriptedSource {
    fn available(&mut self) -> io::Result<usize> {
        if !self.open {
            return Err(not_open());
        }
        Ok(lock(&self.shared.state).ready(Instant::now()))
    }

    fn read_byte(&mut self) -> io::Result<u8> {
        if !self.open {
            return Err(not_open());
        }
        let mut state = lock(&self.shared.state);
        if state.ready(Instant::now()) == 0 {
            return Err(io::Error::new(io::ErrorKind::WouldBlock, "no byte available"));
        }
        Ok(state.inbound.pop_front().map(|(_, byte)| byte).unwrap_or_default())
    }

    fn wait_readable(&mut self, timeout: Duration) -> io::Result<bool> {
        if !self.open {
            return Err(not_open());
        }
        let deadline = Instant::now() + timeout;
        let mut state = lock(&self.shared.state);
        loop {
            let now = Instant::now();
            if state.ready(now) > 0 {
                return Ok(true);
            }
            if now >= deadline {
                return Ok(false);
            }
            let wake = state.next_due().map_or(deadline, |due| due.min(deadline));
            let (guard, _) = self
                .shared
                .arrived
                .wait_timeout(state, wake.saturating_duration_since(now))
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
    }

    fn close(&mut self) -> io::Result<()> {
        if lock(&self.shared.state).fail_stream_release {
            return Err(scripted_failure("input release"));
        }
        self.open = false;
        Ok(())
    }
}

struct ScriptedSink {
    shared: Arc<Shared>,
    open: bool,
}

impl ByteSink for ScriptedSink {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        if !self.open {
            return Err(not_open());
        }
        let now = Instant::now();
        let mut state = lock(&self.shared.state);
        if state.fail_writes {
            return Err(scripted_failure("write"));
        }
        state.sink_events.push(SinkEvent::Write(bytes.to_vec()));
        if state.echo {
            state.schedule(now, bytes);
        }
        let script = match state.replies.pop_front() {
            Some(script) => script,
            None => state
                .responder
                .as_ref()
                .map(|responder| responder(bytes))
                .unwrap_or_default(),
        };
        for (delay, reply) in script {
            state.schedule(now + delay, &reply);
        }
        drop(state);
        self.shared.arrived.notify_all();
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.open {
            return Err(not_open());
        }
        lock(&self.shared.state).sink_events.push(SinkEvent::Flush);
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        if lock(&self.shared.state).fail_stream_release {
            return Err(scripted_failure("output release"));
        }
        self.open = false;
        Ok(())
    }
}
