//! Producer side of a chunked state transfer.

use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use serde_json::Value;

use crate::dispatch::TransferMethodIds;
use crate::error::ReplicaError;
use crate::types::{MethodId, MethodInvocation, NodeId, ResponseMode, Transport};

/// Timeout handed to the transport for control messages; replies are never awaited.
const CONTROL_MESSAGE_TIMEOUT: Duration = Duration::from_secs(10);

/// `std::io::Write` sink that streams state to peers in bounded chunks.
///
/// Opening the sender announces the transfer; every full chunk is sent as it
/// fills up; closing sends the remainder and the end marker. Dropping an open
/// sender closes it on a best-effort basis.
pub struct ChunkedStateSender {
    transport: Arc<dyn Transport>,
    destinations: Vec<NodeId>,
    transfer_id: String,
    ids: TransferMethodIds,
    chunk_size: usize,
    buffer: BytesMut,
    closed: bool,
}

impl ChunkedStateSender {
    /// Announces `transfer_id` to `destinations` and returns the open sender.
    pub fn open(
        transport: Arc<dyn Transport>,
        destinations: Vec<NodeId>,
        transfer_id: impl Into<String>,
        ids: TransferMethodIds,
        chunk_size: usize,
    ) -> Result<Self, ReplicaError> {
        let chunk_size = chunk_size.max(1);
        let mut sender = Self {
            transport,
            destinations,
            transfer_id: transfer_id.into(),
            ids,
            chunk_size,
            buffer: BytesMut::with_capacity(chunk_size),
            closed: false,
        };
        if let Err(err) = sender.send_control(sender.ids.begin, None) {
            // Never announced, so there is nothing to end.
            sender.closed = true;
            return Err(ReplicaError::Transport(err));
        }
        Ok(sender)
    }

    fn send_control(&self, method_id: MethodId, data: Option<Bytes>) -> anyhow::Result<()> {
        let invocation = MethodInvocation {
            method_id,
            args: vec![Value::String(self.transfer_id.clone())],
            data,
        };
        self.transport
            .call(
                Some(&self.destinations),
                invocation,
                ResponseMode::None,
                CONTROL_MESSAGE_TIMEOUT,
            )
            .map(|_| ())
    }

    fn send_chunk(&mut self) -> Result<(), ReplicaError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let data = self.buffer.split().freeze();
        self.buffer.reserve(self.chunk_size);
        self.send_control(self.ids.chunk, Some(data))
            .map_err(ReplicaError::Transport)
    }

    /// Sends any buffered bytes followed by the end marker. Idempotent.
    ///
    /// A failure sending the remainder is returned; a failure sending the end
    /// marker is only logged.
    pub fn close(&mut self) -> Result<(), ReplicaError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let flushed = self.send_chunk();
        if let Err(err) = self.send_control(self.ids.end, None) {
            tracing::warn!(
                error = ?err,
                transfer_id = %self.transfer_id,
                "end-transfer send failed"
            );
        }
        flushed
    }
}

impl Write for ChunkedStateSender {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Err(ReplicaError::ClosedStream.into());
        }
        let mut written = 0;
        while written < buf.len() {
            let room = self.chunk_size - self.buffer.len();
            let take = room.min(buf.len() - written);
            self.buffer.extend_from_slice(&buf[written..written + take]);
            written += take;
            if self.buffer.len() >= self.chunk_size {
                self.send_chunk()?;
            }
        }
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.send_chunk().map_err(io::Error::from)
    }
}

impl Drop for ChunkedStateSender {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            tracing::warn!(
                error = ?err,
                transfer_id = %self.transfer_id,
                "closing dropped state sender failed"
            );
        }
    }
}
