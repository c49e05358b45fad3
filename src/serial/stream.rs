//! Stream adapters handed out by [`super::SerialConnection`].
//!
//! Each connection creates at most one adapter per direction and shares it
//! through cheap clones. Releasing an adapter closes the wrapped source or
//! sink; clones held elsewhere then fail with `NotConnected`.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use super::device::{ByteSink, ByteSource};
use super::reader;

pub(crate) fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn released() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "stream has been released")
}

pub(crate) type SourceSlot = Option<Box<dyn ByteSource>>;

#[derive(Clone)]
pub struct InputStream {
    source: Arc<Mutex<SourceSlot>>,
    // Callers queued in `lock`; a blocking `Read` steps aside for them
    contenders: Arc<AtomicUsize>,
    tick: Duration,
}

impl InputStream {
    pub(crate) fn new(source: Box<dyn ByteSource>, tick: Duration) -> Self {
        Self {
            source: Arc::new(Mutex::new(Some(source))),
            contenders: Arc::new(AtomicUsize::new(0)),
            tick,
        }
    }

    /// Exclusive access to the source for the duration of one read.
    pub(crate) fn lock(&self) -> MutexGuard<'_, SourceSlot> {
        self.contenders.fetch_add(1, Ordering::SeqCst);
        let guard = lock(&self.source);
        self.contenders.fetch_sub(1, Ordering::SeqCst);
        guard
    }

    fn yield_to_contenders(&self) {
        while self.contenders.load(Ordering::SeqCst) > 0 {
            thread::sleep(Duration::from_millis(1));
        }
    }

    pub fn available(&self) -> io::Result<usize> {
        match self.lock().as_mut() {
            Some(source) => source.available(),
            None => Err(released()),
        }
    }

    pub fn is_released(&self) -> bool {
        self.lock().is_none()
    }

    pub(crate) fn release(&self) -> io::Result<()> {
        match self.lock().take() {
            Some(mut source) => source.close(),
            None => Ok(()),
        }
    }

    pub fn same_as(&self, other: &InputStream) -> bool {
        Arc::ptr_eq(&self.source, &other.source)
    }
}

impl Read for InputStream {
    /// Blocks until at least one byte arrives, then returns whatever is
    /// already queued, up to `buf.len()`.
    ///
    /// The source is held for one tick at a time, so a release or a read
    /// through the connection is never locked out by a quiet line.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            let mut guard = lock(&self.source);
            let source = guard.as_mut().ok_or_else(released)?;
            if source.available()? > 0 {
                let mut count = 0;
                while count < buf.len() && source.available()? > 0 {
                    buf[count] = source.read_byte()?;
                    count += 1;
                }
                return Ok(count);
            }

            reader::pause(&mut **source, self.tick)?;
            drop(guard);
            self.yield_to_contenders();
        }
    }
}

#[derive(Clone)]
pub struct OutputStream {
    sink: Arc<Mutex<Option<Box<dyn ByteSink>>>>,
}

impl OutputStream {
    pub(crate) fn new(sink: Box<dyn ByteSink>) -> Self {
        Self {
            sink: Arc::new(Mutex::new(Some(sink))),
        }
    }

    /// Write every byte and flush straight away.
    pub(crate) fn write_and_flush(&self, bytes: &[u8]) -> io::Result<()> {
        let mut guard = lock(&self.sink);
        let sink = guard.as_mut().ok_or_else(released)?;
        sink.write_all(bytes)?;
        sink.flush()
    }

    pub fn is_released(&self) -> bool {
        lock(&self.sink).is_none()
    }

    pub(crate) fn release(&self) -> io::Result<()> {
        match lock(&self.sink).take() {
            Some(mut sink) => sink.close(),
            None => Ok(()),
        }
    }

    pub fn same_as(&self, other: &OutputStream) -> bool {
        Arc::ptr_eq(&self.sink, &other.sink)
    }
}

impl Write for OutputStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut guard = lock(&self.sink);
        guard.as_mut().ok_or_else(released)?.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        lock(&self.sink).as_mut().ok_or_else(released)?.flush()
    }
}
