//! Shared types and collaborator contracts.
//!
//! The replication core is transport-agnostic: group messaging, membership
//! detection and whole-object state transfer are provided by the embedding
//! runtime through [`Transport`], and the replicated object plugs in through
//! [`ReplicatedObject`].

use std::io::{Read, Write};
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::dispatch::MethodDescriptor;

/// Opaque identifier of a cluster member.
pub type NodeId = u64;
/// Per-object method identifier assigned when the dispatch table is built.
pub type MethodId = u16;

/// One method call as carried by the transport.
///
/// Ordinary calls carry JSON arguments. Chunk control messages additionally
/// carry their raw payload in `data` so large state never goes through JSON.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MethodInvocation {
    /// Id from the receiving object's dispatch table.
    pub method_id: MethodId,
    pub args: Vec<Value>,
    /// Raw chunk payload; `None` for ordinary calls.
    pub data: Option<Bytes>,
}

impl MethodInvocation {
    /// Ordinary call without a raw payload.
    pub fn call(method_id: MethodId, args: Vec<Value>) -> Self {
        Self {
            method_id,
            args,
            data: None,
        }
    }
}

/// How many replies the caller waits for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseMode {
    /// Fire-and-forget: return as soon as the message is handed to the transport.
    None,
    /// Wait until every destination replied or the timeout elapsed.
    All,
}

/// Reply from one destination. An `Err` is an exception raised on the peer.
#[derive(Clone, Debug, PartialEq)]
pub struct PeerResponse {
    /// Member that produced the reply.
    pub from: NodeId,
    pub outcome: Result<Value, String>,
}

impl PeerResponse {
    /// Successful reply carrying `value`.
    pub fn ok(from: NodeId, value: Value) -> Self {
        Self {
            from,
            outcome: Ok(value),
        }
    }

    /// Reply reporting an error raised on `from`.
    pub fn failed(from: NodeId, message: impl Into<String>) -> Self {
        Self {
            from,
            outcome: Err(message.into()),
        }
    }
}

/// Group messaging interface used by the replication core.
///
/// Implementations are expected to deliver messages reliably and in order per
/// sender. Inbound invocations are handed to
/// [`ReplicatedService::handle_invocation`](crate::ReplicatedService::handle_invocation),
/// view changes to [`ReplicatedService::view_accepted`](crate::ReplicatedService::view_accepted).
pub trait Transport: Send + Sync + 'static {
    /// Address of the local member.
    fn local_node(&self) -> NodeId;

    /// Send `invocation` to `destinations`, or to every member (including the
    /// local one) when `destinations` is `None`.
    ///
    /// With [`ResponseMode::None`] the returned list is empty.
    fn call(
        &self,
        destinations: Option<&[NodeId]>,
        invocation: MethodInvocation,
        mode: ResponseMode,
        timeout: Duration,
    ) -> anyhow::Result<Vec<PeerResponse>>;

    /// Fetch the whole-object state from `target`, blocking up to `timeout`.
    fn request_state(&self, target: NodeId, timeout: Duration) -> anyhow::Result<Vec<u8>>;
}

/// Object whose state is kept in sync across members.
///
/// `dispatch` executes one method of the object's public interface locally.
/// Per-key state (`get_state`/`set_state`) is streamed in chunks; the
/// whole-object state is only exchanged once, when a member joins.
pub trait ReplicatedObject: Send + Sync + 'static {
    /// Executes `method` on the local instance.
    fn dispatch(&self, method: &MethodDescriptor, args: &[Value]) -> anyhow::Result<Value>;

    /// Serialize the state stored under `key`.
    fn get_state(&self, key: &str, sink: &mut dyn Write) -> anyhow::Result<()>;

    /// Replace the state stored under `key` with the contents of `source`.
    fn set_state(&self, key: &str, source: &mut dyn Read) -> anyhow::Result<()>;

    /// Serialize the whole object for a joining member.
    fn get_initial_state(&self, _sink: &mut dyn Write) -> anyhow::Result<()> {
        Ok(())
    }

    /// Replace the whole object with state received while joining.
    fn set_initial_state(&self, _source: &mut dyn Read) -> anyhow::Result<()> {
        Ok(())
    }

    /// Release per-peer resources held for members that left the view.
    fn dropped_members(&self, _members: &[NodeId]) {}

    /// Called once at start with the local member id.
    fn set_local_address(&self, _node: NodeId) {}
}
