//! Message-bus client capability and the frame-level implementation.
//!
//! Device entities only see [`BusClient`]: send a named message, drop stale
//! input, wait a bounded time for a named message, close. Absence of data
//! within the timeout is `Ok(None)`; it happens constantly at high poll
//! rates and is not a failure.

use crate::codec::{CodecError, Fields, Frame, SignalDatabase};
use std::io;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, trace};

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus used after close")]
    Closed,
    #[error("failed to open bus: {0}")]
    Open(String),
    #[error("bus transport error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

pub trait BusClient: Send + Sync {
    fn send(&self, message: &str, fields: &Fields) -> Result<(), BusError>;

    /// Discards inbound frames buffered so far.
    fn flush_input(&self) -> Result<(), BusError>;

    /// Waits up to `timeout` for `message`, discarding other messages.
    fn expect(&self, message: &str, timeout: Duration) -> Result<Option<Fields>, BusError>;

    fn close(&self) -> Result<(), BusError>;
}

/// Raw frame I/O of a bus adapter.
pub trait Transport: Send {
    fn write_frame(&mut self, frame: &Frame) -> io::Result<()>;

    /// `Ok(None)` when nothing arrived within `timeout`.
    fn read_frame(&mut self, timeout: Duration) -> io::Result<Option<Frame>>;

    /// Drops buffered inbound frames, returning how many were dropped.
    fn drain(&mut self) -> io::Result<usize>;

    fn shutdown(&mut self) -> io::Result<()>;
}

/// Longest single blocking read while holding the transport lock, so that
/// sends from other tasks interleave with a long `expect`.
const READ_SLICE: Duration = Duration::from_millis(2);

/// [`BusClient`] over a frame [`Transport`] and a [`SignalDatabase`].
///
/// All physical I/O goes through one mutex; the transport is dropped on
/// `close` and every later call returns [`BusError::Closed`].
pub struct FrameBus<T: Transport, D: SignalDatabase> {
    transport: Mutex<Option<T>>,
    database: D,
}

impl<T: Transport, D: SignalDatabase> FrameBus<T, D> {
    pub fn open(transport: T, database: D) -> Self {
        info!("Frame bus opened");
        Self {
            transport: Mutex::new(Some(transport)),
            database,
        }
    }

    pub fn database(&self) -> &D {
        &self.database
    }

    fn lock(&self) -> MutexGuard<'_, Option<T>> {
        self.transport.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Transport, D: SignalDatabase> BusClient for FrameBus<T, D> {
    fn send(&self, message: &str, fields: &Fields) -> Result<(), BusError> {
        let frame = self.database.encode(message, fields)?;
        let mut guard = self.lock();
        let transport = guard.as_mut().ok_or(BusError::Closed)?;
        transport.write_frame(&frame)?;
        trace!(message, id = frame.id, "Frame sent");
        Ok(())
    }

    fn flush_input(&self) -> Result<(), BusError> {
        let mut guard = self.lock();
        let transport = guard.as_mut().ok_or(BusError::Closed)?;
        let dropped = transport.drain()?;
        if dropped > 0 {
            trace!(dropped, "Flushed inbound frames");
        }
        Ok(())
    }

    fn expect(&self, message: &str, timeout: Duration) -> Result<Option<Fields>, BusError> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let frame = {
                let mut guard = self.lock();
                let transport = guard.as_mut().ok_or(BusError::Closed)?;
                transport.read_frame(remaining.min(READ_SLICE))?
            };

            if let Some(frame) = frame {
                match self.database.decode(&frame) {
                    Ok(Some((name, fields))) if name == message => return Ok(Some(fields)),
                    Ok(Some((name, _))) => trace!(expected = message, got = %name, "Discarded frame"),
                    Ok(None) => trace!(id = frame.id, "Discarded unknown frame"),
                    // Malformed frames of other messages are discarded like any other.
                    Err(e) if e.message().is_some_and(|name| name != message) => {
                        trace!(expected = message, error = %e, "Discarded malformed frame")
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            if remaining.is_zero() {
                return Ok(None);
            }
        }
    }

    fn close(&self) -> Result<(), BusError> {
        let mut guard = self.lock();
        if let Some(mut transport) = guard.take() {
            transport.shutdown()?;
            info!("Frame bus closed");
        } else {
            debug!("Frame bus already closed");
        }
        Ok(())
    }
}

/// In-memory transport; the paired [`LoopbackPeer`] plays the devices.
pub struct LoopbackTransport {
    inbound: Receiver<Frame>,
    outbound: Sender<Frame>,
}

pub struct LoopbackPeer {
    inbound: Sender<Frame>,
    outbound: Receiver<Frame>,
}

impl LoopbackTransport {
    pub fn pair() -> (LoopbackTransport, LoopbackPeer) {
        let (to_bus, inbound) = mpsc::channel();
        let (outbound, from_bus) = mpsc::channel();
        (
            LoopbackTransport { inbound, outbound },
            LoopbackPeer {
                inbound: to_bus,
                outbound: from_bus,
            },
        )
    }
}

impl Transport for LoopbackTransport {
    fn write_frame(&mut self, frame: &Frame) -> io::Result<()> {
        self.outbound
            .send(frame.clone())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "loopback peer dropped"))
    }

    fn read_frame(&mut self, timeout: Duration) -> io::Result<Option<Frame>> {
        match self.inbound.recv_timeout(timeout) {
            Ok(frame) => Ok(Some(frame)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                // Keep `expect` bounded when the peer has gone away.
                std::thread::sleep(timeout);
                Ok(None)
            }
        }
    }

    fn drain(&mut self) -> io::Result<usize> {
        let mut dropped = 0;
        loop {
            match self.inbound.try_recv() {
                Ok(_) => dropped += 1,
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return Ok(dropped),
            }
        }
    }

    fn shutdown(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl LoopbackPeer {
    pub fn inject(&self, frame: Frame) -> bool {
        self.inbound.send(frame).is_ok()
    }

    /// Frames written by the bus since the last call.
    pub fn sent(&self) -> Vec<Frame> {
        self.outbound.try_iter().collect()
    }
}
