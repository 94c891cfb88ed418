//! Single-slot blocking handoff between one producer and one consumer.
//!
//! The producer (the control-message dispatch thread) hands one chunk at a
//! time to the consumer (a state-loading worker). A second chunk is only
//! accepted once the previous one was fully read, so a slow loader applies
//! backpressure all the way to the transport instead of queueing unbounded
//! state in memory.
//!
//! Lifecycle: `Open` until the producer signals end of stream (`Eof`) or either
//! side closes the channel (`Closed`). A pending chunk is still readable after
//! `Eof`; nothing is readable after `Closed`.

use std::io::{self, Read};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::error::ReplicaError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Lifecycle {
    Open,
    Eof,
    Closed,
}

#[derive(Debug)]
struct Slot {
    buffer: Option<Bytes>,
    /// Read position inside `buffer`.
    cursor: usize,
    lifecycle: Lifecycle,
}

#[derive(Debug)]
pub struct HandoffChannel {
    slot: Mutex<Slot>,
    /// Signalled when a chunk is installed, on EOF and on close.
    data_ready: Condvar,
    /// Signalled when the consumer drained the slot, and on close.
    slot_free: Condvar,
}

impl Default for HandoffChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl HandoffChannel {
    /// Open channel with an empty slot.
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot {
                buffer: None,
                cursor: 0,
                lifecycle: Lifecycle::Open,
            }),
            data_ready: Condvar::new(),
            slot_free: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hands `buffer` to the consumer, or signals end of stream with `None`.
    ///
    /// Blocks while the previous chunk is still unread. Sending data into a
    /// channel that already saw EOF or was closed fails with
    /// [`ReplicaError::ClosedStream`] without blocking; `None` is then a no-op.
    pub fn send(&self, buffer: Option<Bytes>) -> Result<(), ReplicaError> {
        let mut slot = self.lock();
        let Some(buffer) = buffer else {
            if slot.lifecycle == Lifecycle::Open {
                slot.lifecycle = Lifecycle::Eof;
                self.data_ready.notify_all();
            }
            return Ok(());
        };

        loop {
            if slot.lifecycle != Lifecycle::Open {
                return Err(ReplicaError::ClosedStream);
            }
            if slot.buffer.is_none() {
                break;
            }
            slot = self
                .slot_free
                .wait(slot)
                .unwrap_or_else(PoisonError::into_inner);
        }

        // An empty chunk would read as end of stream.
        if buffer.is_empty() {
            return Ok(());
        }
        slot.buffer = Some(buffer);
        slot.cursor = 0;
        self.data_ready.notify_all();
        Ok(())
    }

    /// Copies pending bytes into `out`, waiting up to `timeout` for a chunk.
    ///
    /// Returns `Ok(0)` at end of stream. A timeout does not poison the
    /// channel: a later `send`/`receive` pair proceeds normally.
    pub fn receive(&self, out: &mut [u8], timeout: Duration) -> Result<usize, ReplicaError> {
        if out.is_empty() {
            return Ok(0);
        }
        let deadline = Instant::now() + timeout;
        let mut slot = self.lock();
        loop {
            if slot.lifecycle == Lifecycle::Closed {
                return Err(ReplicaError::ClosedStream);
            }

            if let Some(buffer) = slot.buffer.clone() {
                let available = &buffer[slot.cursor..];
                let n = available.len().min(out.len());
                out[..n].copy_from_slice(&available[..n]);
                slot.cursor += n;
                if slot.cursor >= buffer.len() {
                    slot.buffer = None;
                    slot.cursor = 0;
                    self.slot_free.notify_all();
                }
                return Ok(n);
            }

            if slot.lifecycle == Lifecycle::Eof {
                return Ok(0);
            }

            // Re-check the predicate after every wakeup; spurious wakeups and
            // notifications meant for the producer land here too.
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ReplicaError::Timeout(timeout));
            }
            let (next, _) = self
                .data_ready
                .wait_timeout(slot, remaining)
                .unwrap_or_else(PoisonError::into_inner);
            slot = next;
        }
    }

    /// Closes the channel and wakes both sides. Idempotent.
    pub fn close(&self) {
        let mut slot = self.lock();
        slot.lifecycle = Lifecycle::Closed;
        slot.buffer = None;
        slot.cursor = 0;
        self.data_ready.notify_all();
        self.slot_free.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().lifecycle == Lifecycle::Closed
    }
}

/// `std::io::Read` view of a channel with a fixed per-read timeout.
///
/// Dropping the reader closes the channel so a producer blocked in `send`
/// never outlives the consumer.
#[derive(Debug)]
pub struct HandoffReader {
    channel: Arc<HandoffChannel>,
    timeout: Duration,
}

impl HandoffReader {
    pub fn new(channel: Arc<HandoffChannel>, timeout: Duration) -> Self {
        Self { channel, timeout }
    }
}

impl Read for HandoffReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.channel
            .receive(buf, self.timeout)
            .map_err(io::Error::from)
    }
}

impl Drop for HandoffReader {
    fn drop(&mut self) {
        self.channel.close();
    }
}
