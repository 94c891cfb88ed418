//! Call routing for one replicated object.
//!
//! `ReplicatedService` sits in front of the local object: every call on the
//! replicated interface goes through [`ReplicatedService::invoke`], which
//! decides from the method's declared policy whether to run it locally, push
//! the resulting per-key state to peers, or broadcast it and fold the replies.
//! Typed interfaces wrap the service in a thin decorator that maps each trait
//! method to `invoke`.
//!
//! Lifecycle: `Uninitialized` → `Joining` (on `start`) → `Active` → `Stopped`.
//! A failed initial-state load while joining is logged and the service still
//! becomes active, since the member may be the first one of its group.

use std::collections::HashSet;
use std::io::Write;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use serde_json::Value;
use tokio::runtime::Handle;

use crate::config::ReplicationConfig;
use crate::dispatch::{Aggregation, DispatchTable, MethodDescriptor};
use crate::error::{PeerFailure, ReplicaError};
use crate::membership::{MembershipChange, MembershipView};
use crate::metrics::TransferMetricsSnapshot;
use crate::transfer::{ChunkedStateSender, TransferReceiver};
use crate::types::{
    MethodInvocation, NodeId, PeerResponse, ReplicatedObject, ResponseMode, Transport,
};

/// Lifecycle of a replicated service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Uninitialized = 0,
    Joining = 1,
    Active = 2,
    Stopped = 3,
}

impl ServiceState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Joining,
            2 => Self::Active,
            3 => Self::Stopped,
            _ => Self::Uninitialized,
        }
    }

    /// Lowercase name used in logs and errors.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Joining => "joining",
            Self::Active => "active",
            Self::Stopped => "stopped",
        }
    }
}

/// Routes calls on one replicated object and serves its inbound traffic.
///
/// Shared across threads behind an `Arc`; the transport delivers inbound
/// invocations and view changes to it.
pub struct ReplicatedService {
    name: String,
    object: Arc<dyn ReplicatedObject>,
    table: DispatchTable,
    transport: Arc<dyn Transport>,
    config: ReplicationConfig,
    membership: MembershipView,
    receiver: TransferReceiver,
    state: AtomicU8,
}

impl ReplicatedService {
    /// Wraps `object`; state loaders run on `runtime`'s blocking pool.
    pub fn new(
        name: impl Into<String>,
        object: Arc<dyn ReplicatedObject>,
        table: DispatchTable,
        transport: Arc<dyn Transport>,
        config: ReplicationConfig,
        runtime: Handle,
    ) -> Self {
        let local = transport.local_node();
        let receiver = TransferReceiver::new(object.clone(), runtime, config.receive_timeout);
        Self {
            name: name.into(),
            object,
            table,
            transport,
            config,
            membership: MembershipView::new(local),
            receiver,
            state: AtomicU8::new(ServiceState::Uninitialized as u8),
        }
    }

    /// Service name used in log fields.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ServiceState {
        ServiceState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Logical identifier of this member.
    pub fn local_node(&self) -> NodeId {
        self.membership.local()
    }

    /// Registered methods, including the trailing transfer ids.
    pub fn table(&self) -> &DispatchTable {
        &self.table
    }

    /// Current cluster view as last accepted.
    pub fn membership(&self) -> &MembershipView {
        &self.membership
    }

    /// Snapshot of inbound transfer counters.
    pub fn transfer_metrics(&self) -> TransferMetricsSnapshot {
        self.receiver.metrics().snapshot()
    }

    /// Number of inbound transfers still registered.
    pub fn active_transfers(&self) -> usize {
        self.receiver.active_transfers()
    }

    fn transition(&self, from: ServiceState, to: ServiceState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Joins the group whose current members are `members`.
    ///
    /// When configured to, pulls the whole-object state from one peer first,
    /// bounded by the join timeout.
    pub fn start(&self, members: &[NodeId]) -> Result<(), ReplicaError> {
        if !self.transition(ServiceState::Uninitialized, ServiceState::Joining) {
            return Err(ReplicaError::Inactive(self.state().as_str()));
        }
        self.object.set_local_address(self.local_node());
        self.membership.replace(members);
        let peers = self.membership.peers();
        tracing::info!(
            service = %self.name,
            node_id = self.local_node(),
            peers = ?peers,
            "joining replicated service"
        );

        if self.config.requires_initial_state {
            if let Some(&peer) = peers.first() {
                self.load_initial_state(peer);
            }
        }

        if !self.transition(ServiceState::Joining, ServiceState::Active) {
            return Err(ReplicaError::Inactive(self.state().as_str()));
        }
        tracing::info!(service = %self.name, "replicated service active");
        Ok(())
    }

    fn load_initial_state(&self, peer: NodeId) {
        let loaded = self
            .transport
            .request_state(peer, self.config.join_timeout)
            .with_context(|| format!("fetching initial state from node {peer}"))
            .and_then(|state| {
                let len = state.len();
                self.object
                    .set_initial_state(&mut state.as_slice())
                    .map(|()| len)
            });
        match loaded {
            Ok(bytes) => tracing::info!(
                service = %self.name,
                peer,
                bytes,
                "loaded initial state"
            ),
            Err(err) => tracing::warn!(
                service = %self.name,
                peer,
                error = ?err,
                "initial state load failed; continuing without it"
            ),
        }
    }

    /// Stops routing and abandons every pending inbound transfer.
    pub fn stop(&self) {
        let previous = ServiceState::from_u8(
            self.state
                .swap(ServiceState::Stopped as u8, Ordering::AcqRel),
        );
        if previous == ServiceState::Stopped {
            return;
        }
        self.receiver.shutdown();
        tracing::info!(service = %self.name, "replicated service stopped");
    }

    fn ensure_active(&self) -> Result<(), ReplicaError> {
        match self.state() {
            ServiceState::Active => Ok(()),
            other => Err(ReplicaError::Inactive(other.as_str())),
        }
    }

    fn resolve(&self, method: &str) -> Result<&MethodDescriptor, ReplicaError> {
        self.table
            .lookup(method)
            .filter(|descriptor| !self.table.is_transfer_control(descriptor.id))
            .ok_or_else(|| ReplicaError::UnknownMethod(method.to_string()))
    }

    /// Calls `method` on the replicated interface.
    pub fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value, ReplicaError> {
        let descriptor = self.resolve(method)?;
        self.route(descriptor, args, None)
    }

    /// Calls `method` on an explicit subset of members.
    pub fn invoke_on(
        &self,
        method: &str,
        args: Vec<Value>,
        destinations: &[NodeId],
    ) -> Result<Value, ReplicaError> {
        let descriptor = self.resolve(method)?;
        self.route(descriptor, args, Some(destinations))
    }

    fn route(
        &self,
        descriptor: &MethodDescriptor,
        args: Vec<Value>,
        destinations: Option<&[NodeId]>,
    ) -> Result<Value, ReplicaError> {
        self.ensure_active()?;
        let spec = &descriptor.spec;
        let peers = self.membership.peers();

        if !spec.replicated || peers.is_empty() {
            if spec.remote_only {
                return Ok(Value::Null);
            }
            return self.invoke_local(descriptor, &args);
        }

        if spec.replicates_state {
            return self.invoke_and_push_state(descriptor, &args, peers);
        }

        self.invoke_remote(descriptor, args, destinations, peers)
    }

    fn invoke_local(
        &self,
        descriptor: &MethodDescriptor,
        args: &[Value],
    ) -> Result<Value, ReplicaError> {
        self.object
            .dispatch(descriptor, args)
            .map_err(|source| ReplicaError::Local {
                method: descriptor.name().to_string(),
                source,
            })
    }

    /// Runs the method locally, then streams the state for `args[0]` to `peers`.
    ///
    /// The local effect stands even when streaming fails.
    fn invoke_and_push_state(
        &self,
        descriptor: &MethodDescriptor,
        args: &[Value],
        peers: Vec<NodeId>,
    ) -> Result<Value, ReplicaError> {
        let result = self.invoke_local(descriptor, args)?;
        let key = match args.first() {
            Some(Value::String(key)) => key.clone(),
            Some(other) => other.to_string(),
            None => {
                return Err(ReplicaError::StateReplication {
                    method: descriptor.name().to_string(),
                    key: String::new(),
                    source: anyhow!("method has no state key argument"),
                })
            }
        };
        self.push_state(&key, peers)
            .map_err(|source| ReplicaError::StateReplication {
                method: descriptor.name().to_string(),
                key,
                source,
            })?;
        Ok(result)
    }

    fn push_state(&self, key: &str, peers: Vec<NodeId>) -> anyhow::Result<()> {
        let mut sender = ChunkedStateSender::open(
            self.transport.clone(),
            peers,
            key,
            self.table.transfer_ids(),
            self.config.chunk_size,
        )?;
        let streamed = self.object.get_state(key, &mut sender);
        // Close even when streaming failed so receivers see the end marker.
        let closed = sender.close();
        streamed?;
        closed?;
        Ok(())
    }

    fn invoke_remote(
        &self,
        descriptor: &MethodDescriptor,
        args: Vec<Value>,
        destinations: Option<&[NodeId]>,
        peers: Vec<NodeId>,
    ) -> Result<Value, ReplicaError> {
        let spec = &descriptor.spec;
        // `None` addresses every member, the local one included.
        let destinations = match destinations {
            Some(explicit) => Some(explicit.to_vec()),
            None if spec.remote_only => Some(peers),
            None => None,
        };
        let mode = if spec.asynch {
            ResponseMode::None
        } else {
            ResponseMode::All
        };

        let invocation = MethodInvocation::call(descriptor.id, args.clone());
        let responses = self
            .transport
            .call(destinations.as_deref(), invocation, mode, spec.timeout)
            .map_err(|err| ReplicaError::Dispatch {
                method: descriptor.name().to_string(),
                args: args.clone(),
                failures: vec![PeerFailure {
                    peer: None,
                    message: format!("{err:#}"),
                }],
            })?;

        if spec.asynch {
            return Ok(Value::Null);
        }
        self.aggregate(descriptor, args, responses)
    }

    fn aggregate(
        &self,
        descriptor: &MethodDescriptor,
        args: Vec<Value>,
        responses: Vec<PeerResponse>,
    ) -> Result<Value, ReplicaError> {
        match descriptor.spec.aggregation {
            Aggregation::BooleanAnd => {
                let mut all = true;
                for response in &responses {
                    match &response.outcome {
                        Ok(Value::Bool(true)) => {}
                        Ok(_) => all = false,
                        Err(message) => {
                            tracing::warn!(
                                service = %self.name,
                                method = descriptor.name(),
                                peer = response.from,
                                error = %message,
                                "peer failed; counted as false"
                            );
                            all = false;
                        }
                    }
                }
                Ok(Value::Bool(all))
            }
            Aggregation::CollectionUnion => {
                let mut union = Vec::<Value>::new();
                // Canonical JSON of every element already in `union`.
                let mut seen = HashSet::<String>::new();
                let mut failures = Vec::new();
                for response in responses {
                    match response.outcome {
                        Ok(Value::Array(items)) => {
                            for item in items {
                                if seen.insert(item.to_string()) {
                                    union.push(item);
                                }
                            }
                        }
                        Ok(Value::Null) => {}
                        Ok(other) => failures.push(PeerFailure {
                            peer: Some(response.from),
                            message: format!("expected a collection, got {other}"),
                        }),
                        Err(message) => failures.push(PeerFailure {
                            peer: Some(response.from),
                            message,
                        }),
                    }
                }
                if !failures.is_empty() {
                    return Err(ReplicaError::Dispatch {
                        method: descriptor.name().to_string(),
                        args,
                        failures,
                    });
                }
                Ok(Value::Array(union))
            }
            Aggregation::None => {
                for response in &responses {
                    if let Err(message) = &response.outcome {
                        tracing::debug!(
                            service = %self.name,
                            method = descriptor.name(),
                            peer = response.from,
                            error = %message,
                            "peer failed on call without aggregate"
                        );
                    }
                }
                Ok(Value::Null)
            }
        }
    }

    /// Executes an invocation delivered by the transport from `sender`.
    ///
    /// Transfer-control messages feed the transfer receiver; everything else
    /// runs on the local object.
    pub fn handle_invocation(
        &self,
        sender: NodeId,
        invocation: MethodInvocation,
    ) -> anyhow::Result<Value> {
        if self.state() == ServiceState::Stopped {
            anyhow::bail!("replicated service {} is stopped", self.name);
        }
        let method_id = invocation.method_id;

        if self.table.is_transfer_control(method_id) {
            let control = self
                .table
                .transfer_ids()
                .control_for(method_id)
                .ok_or_else(|| anyhow!("unmapped transfer method id {method_id}"))?;
            let transfer_id = invocation
                .args
                .first()
                .and_then(Value::as_str)
                .ok_or_else(|| anyhow!("transfer control message without transfer id"))?;
            self.receiver
                .handle(sender, control, transfer_id, invocation.data);
            return Ok(Value::Null);
        }

        let descriptor = self
            .table
            .get(method_id)
            .ok_or_else(|| anyhow!("unknown method id {method_id}"))?;
        self.object.dispatch(descriptor, &invocation.args)
    }

    /// Serves the whole-object state to a joining member.
    pub fn provide_state(&self, sink: &mut dyn Write) -> anyhow::Result<()> {
        self.object.get_initial_state(sink)
    }

    /// Applies a new membership view delivered by the transport.
    pub fn view_accepted(&self, members: &[NodeId]) -> MembershipChange {
        let change = self.membership.replace(members);
        if !change.left.is_empty() {
            self.object.dropped_members(&change.left);
            let swept = self.receiver.drop_senders(&change.left);
            tracing::info!(
                service = %self.name,
                left = ?change.left,
                swept_transfers = swept,
                "members left"
            );
        }
        if !change.joined.is_empty() {
            tracing::info!(service = %self.name, joined = ?change.joined, "members joined");
        }
        change
    }
}
