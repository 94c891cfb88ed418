//! Error taxonomy for replication and state transfer.

use std::fmt;
use std::io;
use std::time::Duration;

use serde_json::Value;

use crate::types::NodeId;

/// Failure reported by one peer (or by the transport, when `peer` is `None`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerFailure {
    pub peer: Option<NodeId>,
    pub message: String,
}

impl fmt::Display for PeerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.peer {
            Some(peer) => write!(f, "node {peer}: {}", self.message),
            None => write!(f, "transport: {}", self.message),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReplicaError {
    #[error("timed out after {0:?} waiting for state chunk")]
    Timeout(Duration),

    #[error("stream is closed")]
    ClosedStream,

    #[error("transport failure: {0:#}")]
    Transport(#[source] anyhow::Error),

    #[error("state load for transfer '{transfer_id}' failed: {source:#}")]
    StateLoad {
        transfer_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("remote invocation of {method}({}) failed: {}", render_args(.args), render_failures(.failures))]
    Dispatch {
        method: String,
        args: Vec<Value>,
        failures: Vec<PeerFailure>,
    },

    #[error("replicating state for key '{key}' after {method} failed: {source:#}")]
    StateReplication {
        method: String,
        key: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("local invocation of {method} failed: {source:#}")]
    Local {
        method: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("replicated service is {0}, not active")]
    Inactive(&'static str),

    #[error("unknown method {0}")]
    UnknownMethod(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

fn render_args(args: &[Value]) -> String {
    args.iter()
        .map(Value::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

fn render_failures(failures: &[PeerFailure]) -> String {
    failures
        .iter()
        .map(PeerFailure::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<ReplicaError> for io::Error {
    fn from(err: ReplicaError) -> Self {
        match err {
            ReplicaError::Io(inner) => inner,
            ReplicaError::Timeout(_) => io::Error::new(io::ErrorKind::TimedOut, err),
            ReplicaError::ClosedStream => io::Error::new(io::ErrorKind::BrokenPipe, err),
            other => io::Error::other(other),
        }
    }
}
