//! Replicated object state crate.
//!
//! This crate keeps one logical object consistent across cluster members.
//! Higher layers supply a `Transport` (group messaging, membership, whole-object
//! state transfer) and a `ReplicatedObject`, then route calls through a
//! `ReplicatedService`. Per-key state is streamed to peers in bounded chunks and
//! handed to the receiving object through a single-slot blocking channel.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod handoff;
pub mod membership;
pub mod metrics;
pub mod router;
pub mod transfer;
pub mod types;

pub use config::ReplicationConfig;
pub use dispatch::{Aggregation, DispatchTable, MethodDescriptor, MethodSpec, TransferMethodIds};
pub use error::{PeerFailure, ReplicaError};
pub use handoff::{HandoffChannel, HandoffReader};
pub use membership::{MembershipChange, MembershipView};
pub use metrics::{TransferMetrics, TransferMetricsSnapshot};
pub use router::{ReplicatedService, ServiceState};
pub use transfer::{ChunkedStateSender, TransferControl, TransferKey, TransferReceiver};
pub use types::{
    MethodId, MethodInvocation, NodeId, PeerResponse, ReplicatedObject, ResponseMode, Transport,
};
