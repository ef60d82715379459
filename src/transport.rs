//! Transport abstraction for outbound text frames.
//!
//! The registry only ever sees `dyn Transport`. Two implementations ship here:
//! - `ChannelTransport`: in-process peer behind a crossbeam channel
//! - `QueuedTransport`: gives any transport its own writer thread, so a slow
//!   socket only ever stalls itself
//!
//! The registry wraps every transport whose `may_block` is true in a
//! `QueuedTransport` at admission.

use crate::error::{RealtimeError, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

/// One duplex channel's send half, as seen by the registry.
pub trait Transport: Send + Sync {
    /// Write one text frame. An error means the peer is gone.
    fn send_text(&self, text: &str) -> Result<()>;

    /// Release the underlying channel. Must be idempotent and must not block.
    fn close(&self) {}

    /// Whether `send_text` can stall on I/O. Blocking transports get a
    /// dedicated writer thread when registered.
    fn may_block(&self) -> bool {
        true
    }
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn send_text(&self, text: &str) -> Result<()> {
        (**self).send_text(text)
    }

    fn close(&self) {
        (**self).close()
    }

    fn may_block(&self) -> bool {
        (**self).may_block()
    }
}

/// In-process transport. The peer reads frames from the paired receiver.
pub struct ChannelTransport {
    sender: Sender<String>,
    closed: AtomicBool,
}

impl ChannelTransport {
    /// Create a transport and the receiver its peer reads from.
    pub fn pair() -> (Self, Receiver<String>) {
        let (sender, receiver) = unbounded();
        (
            Self {
                sender,
                closed: AtomicBool::new(false),
            },
            receiver,
        )
    }

    /// True after `close`.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Transport for ChannelTransport {
    fn send_text(&self, text: &str) -> Result<()> {
        if self.is_closed() {
            return Err(RealtimeError::ConnectionClosed);
        }
        self.sender
            .send(text.to_owned())
            .map_err(|_| RealtimeError::ConnectionClosed)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn may_block(&self) -> bool {
        false
    }
}

/// Wraps a transport with a dedicated writer thread fed by an unbounded queue.
///
/// `send_text` only enqueues. When the inner write fails the writer stops and the
/// queue closes, so the next `send_text` reports `ConnectionClosed`.
pub struct QueuedTransport {
    sender: Mutex<Option<Sender<String>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    failed: Arc<AtomicBool>,
}

impl QueuedTransport {
    /// Start the writer thread for `inner`.
    pub fn spawn<T: Transport + 'static>(inner: T) -> Result<Self> {
        let (sender, receiver) = unbounded::<String>();
        let failed = Arc::new(AtomicBool::new(false));
        let worker_failed = Arc::clone(&failed);

        let worker = thread::Builder::new()
            .name("realtime-writer".to_string())
            .spawn(move || {
                for frame in receiver.iter() {
                    if let Err(e) = inner.send_text(&frame) {
                        warn!(error = %e, "writer stopped after failed write");
                        worker_failed.store(true, Ordering::Release);
                        break;
                    }
                }
                inner.close();
                debug!("writer thread exiting");
            })?;

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
            failed,
        })
    }

    /// True once the inner transport has failed a write.
    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Stop accepting frames and wait until the writer has written what was
    /// queued. Blocks for as long as the inner transport takes.
    pub fn flush(&self) {
        self.sender.lock().take();
        let worker = self.worker.lock().take();
        if let Some(handle) = worker {
            if handle.join().is_err() {
                warn!("writer thread panicked");
            }
        }
    }
}

impl Transport for QueuedTransport {
    fn send_text(&self, text: &str) -> Result<()> {
        if self.has_failed() {
            return Err(RealtimeError::ConnectionClosed);
        }
        match self.sender.lock().as_ref() {
            Some(sender) => sender
                .send(text.to_owned())
                .map_err(|_| RealtimeError::ConnectionClosed),
            None => Err(RealtimeError::ConnectionClosed),
        }
    }

    /// Stop accepting frames. The writer drains its backlog in the background
    /// and then closes the inner transport; nobody waits for it.
    fn close(&self) {
        // Dropping the sender ends the writer's receive loop.
        self.sender.lock().take();
        // Detach.
        self.worker.lock().take();
    }

    fn may_block(&self) -> bool {
        false
    }
}

impl Drop for QueuedTransport {
    fn drop(&mut self) {
        self.close();
    }
}
