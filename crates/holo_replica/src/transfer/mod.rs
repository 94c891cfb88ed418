//! Chunked per-key state transfer.
//!
//! A transfer is three kinds of fire-and-forget control messages addressed to
//! a set of peers: begin, zero or more chunks, end. `sender` turns a byte
//! stream into that sequence; `receiver` demultiplexes it into one
//! `HandoffChannel` per transfer and feeds the replicated object's loader.

mod receiver;
mod sender;

use serde::{Deserialize, Serialize};

use crate::types::NodeId;

pub use receiver::TransferReceiver;
pub use sender::ChunkedStateSender;

/// Transfer-control message kind; one per synthetic dispatch entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferControl {
    Begin,
    Chunk,
    End,
}

/// Identifies one in-flight transfer on the receiving side.
///
/// The same id from two senders names two independent transfers.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferKey {
    /// Producer-chosen id; the state key for per-key transfers.
    pub transfer_id: String,
    /// Member that sent the begin message.
    pub sender: NodeId,
}

impl TransferKey {
    pub fn new(transfer_id: impl Into<String>, sender: NodeId) -> Self {
        Self {
            transfer_id: transfer_id.into(),
            sender,
        }
    }
}
