//! Shared helpers for integration tests.
//!
//! `TestCluster` wires several `ReplicatedService`s together through an
//! in-process loopback transport that delivers every invocation synchronously
//! on the calling thread. Each node replicates a small map-backed cache.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};

use holo_replica::{
    Aggregation, DispatchTable, MethodDescriptor, MethodInvocation, MethodSpec, NodeId,
    PeerResponse, ReplicaError, ReplicatedObject, ReplicatedService, ReplicationConfig,
    ResponseMode, Transport,
};
use serde_json::{json, Value};

/// Upper bound for anything the tests wait on.
pub const WAIT: Duration = Duration::from_secs(5);

pub fn test_config() -> ReplicationConfig {
    ReplicationConfig {
        receive_timeout: WAIT,
        chunk_size: 8,
        join_timeout: WAIT,
        requires_initial_state: true,
    }
}

/// Poll `condition` until it holds, panicking with `what` after [`WAIT`].
pub fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(5));
    }
}

pub fn cache_table() -> DispatchTable {
    DispatchTable::new(vec![
        MethodSpec::local("get"),
        MethodSpec::replicated("put").replicates_state(),
        MethodSpec::replicated("remove").aggregation(Aggregation::BooleanAnd),
        MethodSpec::replicated("keys")
            .remote_only()
            .aggregation(Aggregation::CollectionUnion),
    ])
    .expect("cache dispatch table")
}

/// Map-backed replicated object.
#[derive(Default)]
pub struct KvStore {
    entries: Mutex<BTreeMap<String, Value>>,
    dropped: Mutex<Vec<NodeId>>,
    local: AtomicU64,
}

impl KvStore {
    pub fn local_get(&self, key: &str) -> Option<Value> {
        self.entries.lock().unwrap().get(key).cloned()
    }

    /// Mutates this node only, bypassing replication.
    pub fn local_insert(&self, key: &str, value: Value) {
        self.entries.lock().unwrap().insert(key.to_string(), value);
    }

    /// Mutates this node only, bypassing replication.
    pub fn local_remove(&self, key: &str) -> Option<Value> {
        self.entries.lock().unwrap().remove(key)
    }

    pub fn dropped(&self) -> Vec<NodeId> {
        self.dropped.lock().unwrap().clone()
    }

    pub fn local_address(&self) -> NodeId {
        self.local.load(Ordering::SeqCst)
    }
}

fn key_arg(args: &[Value]) -> anyhow::Result<&str> {
    args.first()
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow::anyhow!("missing key argument"))
}

impl ReplicatedObject for KvStore {
    fn dispatch(&self, method: &MethodDescriptor, args: &[Value]) -> anyhow::Result<Value> {
        let mut entries = self.entries.lock().unwrap();
        match method.name() {
            "get" => Ok(entries.get(key_arg(args)?).cloned().unwrap_or(Value::Null)),
            "put" => {
                let value = args.get(1).cloned().unwrap_or(Value::Null);
                Ok(entries
                    .insert(key_arg(args)?.to_string(), value)
                    .unwrap_or(Value::Null))
            }
            "remove" => Ok(Value::Bool(entries.remove(key_arg(args)?).is_some())),
            "keys" => Ok(Value::Array(
                entries.keys().cloned().map(Value::String).collect(),
            )),
            other => anyhow::bail!("unsupported method {other}"),
        }
    }

    fn get_state(&self, key: &str, sink: &mut dyn Write) -> anyhow::Result<()> {
        let value = self.local_get(key).unwrap_or(Value::Null);
        serde_json::to_writer(sink, &value)?;
        Ok(())
    }

    fn set_state(&self, key: &str, source: &mut dyn Read) -> anyhow::Result<()> {
        let value: Value = serde_json::from_reader(source)?;
        let mut entries = self.entries.lock().unwrap();
        if value.is_null() {
            entries.remove(key);
        } else {
            entries.insert(key.to_string(), value);
        }
        Ok(())
    }

    fn get_initial_state(&self, sink: &mut dyn Write) -> anyhow::Result<()> {
        let entries = self.entries.lock().unwrap().clone();
        serde_json::to_writer(sink, &entries)?;
        Ok(())
    }

    fn set_initial_state(&self, source: &mut dyn Read) -> anyhow::Result<()> {
        let entries: BTreeMap<String, Value> = serde_json::from_reader(source)?;
        *self.entries.lock().unwrap() = entries;
        Ok(())
    }

    fn dropped_members(&self, members: &[NodeId]) {
        self.dropped.lock().unwrap().extend_from_slice(members);
    }

    fn set_local_address(&self, node: NodeId) {
        self.local.store(node, Ordering::SeqCst);
    }
}

/// Typed view of the replicated cache; every method routes through the service.
pub trait Cache {
    fn get(&self, key: &str) -> Result<Option<Value>, ReplicaError>;
    fn put(&self, key: &str, value: Value) -> Result<Option<Value>, ReplicaError>;
    fn remove(&self, key: &str) -> Result<bool, ReplicaError>;
    fn keys(&self) -> Result<Vec<String>, ReplicaError>;
}

pub struct ReplicatedCache {
    service: Arc<ReplicatedService>,
}

impl ReplicatedCache {
    pub fn new(service: Arc<ReplicatedService>) -> Self {
        Self { service }
    }
}

fn non_null(value: Value) -> Option<Value> {
    (!value.is_null()).then_some(value)
}

impl Cache for ReplicatedCache {
    fn get(&self, key: &str) -> Result<Option<Value>, ReplicaError> {
        self.service.invoke("get", vec![json!(key)]).map(non_null)
    }

    fn put(&self, key: &str, value: Value) -> Result<Option<Value>, ReplicaError> {
        self.service.invoke("put", vec![json!(key), value]).map(non_null)
    }

    fn remove(&self, key: &str) -> Result<bool, ReplicaError> {
        let removed = self.service.invoke("remove", vec![json!(key)])?;
        Ok(removed.as_bool().unwrap_or(false))
    }

    fn keys(&self) -> Result<Vec<String>, ReplicaError> {
        let keys = self.service.invoke("keys", Vec::new())?;
        Ok(keys
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// Node registry shared by every loopback transport.
#[derive(Default)]
pub struct Registry {
    services: RwLock<BTreeMap<NodeId, Arc<ReplicatedService>>>,
}

impl Registry {
    fn get(&self, node: NodeId) -> Option<Arc<ReplicatedService>> {
        self.services.read().unwrap().get(&node).cloned()
    }

    fn members(&self) -> Vec<NodeId> {
        self.services.read().unwrap().keys().copied().collect()
    }
}

pub struct LoopbackTransport {
    local: NodeId,
    registry: Weak<Registry>,
}

impl LoopbackTransport {
    fn registry(&self) -> anyhow::Result<Arc<Registry>> {
        self.registry
            .upgrade()
            .ok_or_else(|| anyhow::anyhow!("cluster is gone"))
    }
}

impl Transport for LoopbackTransport {
    fn local_node(&self) -> NodeId {
        self.local
    }

    fn call(
        &self,
        destinations: Option<&[NodeId]>,
        invocation: MethodInvocation,
        mode: ResponseMode,
        _timeout: Duration,
    ) -> anyhow::Result<Vec<PeerResponse>> {
        let registry = self.registry()?;
        let targets = match destinations {
            Some(explicit) => explicit.to_vec(),
            None => registry.members(),
        };
        let mut responses = Vec::with_capacity(targets.len());
        for target in targets {
            let response = match registry.get(target) {
                Some(service) => match service.handle_invocation(self.local, invocation.clone()) {
                    Ok(value) => PeerResponse::ok(target, value),
                    Err(err) => PeerResponse::failed(target, format!("{err:#}")),
                },
                None => PeerResponse::failed(target, "unreachable"),
            };
            responses.push(response);
        }
        if mode == ResponseMode::None {
            responses.clear();
        }
        Ok(responses)
    }

    fn request_state(&self, target: NodeId, _timeout: Duration) -> anyhow::Result<Vec<u8>> {
        let service = self
            .registry()?
            .get(target)
            .ok_or_else(|| anyhow::anyhow!("node {target} is unreachable"))?;
        let mut state = Vec::new();
        service.provide_state(&mut state)?;
        Ok(state)
    }
}

pub struct Node {
    pub id: NodeId,
    pub service: Arc<ReplicatedService>,
    pub store: Arc<KvStore>,
}

impl Node {
    pub fn cache(&self) -> ReplicatedCache {
        ReplicatedCache::new(self.service.clone())
    }
}

pub struct TestCluster {
    registry: Arc<Registry>,
    nodes: BTreeMap<NodeId, Node>,
    config: ReplicationConfig,
    runtime: tokio::runtime::Runtime,
}

impl TestCluster {
    /// Builds and starts nodes `1..=size`, each seeing the full membership.
    pub fn start(size: u64) -> Self {
        let mut cluster = Self::empty(test_config());
        for id in 1..=size {
            cluster.add_node(id);
        }
        let members = cluster.members();
        for node in cluster.nodes.values() {
            node.service.start(&members).expect("start node");
        }
        cluster
    }

    pub fn empty(config: ReplicationConfig) -> Self {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .build()
            .expect("runtime");
        Self {
            registry: Arc::new(Registry::default()),
            nodes: BTreeMap::new(),
            config,
            runtime,
        }
    }

    /// Registers a node with the transport without starting it.
    pub fn add_node(&mut self, id: NodeId) -> &Node {
        let store = Arc::new(KvStore::default());
        let transport = Arc::new(LoopbackTransport {
            local: id,
            registry: Arc::downgrade(&self.registry),
        });
        let service = Arc::new(ReplicatedService::new(
            "cache",
            store.clone(),
            cache_table(),
            transport,
            self.config.clone(),
            self.runtime.handle().clone(),
        ));
        self.registry
            .services
            .write()
            .unwrap()
            .insert(id, service.clone());
        self.nodes.entry(id).or_insert(Node { id, service, store })
    }

    /// Removes a node from the transport, as if it crashed.
    pub fn remove_node(&mut self, id: NodeId) {
        self.registry.services.write().unwrap().remove(&id);
        if let Some(node) = self.nodes.remove(&id) {
            node.service.stop();
        }
    }

    pub fn node(&self, id: NodeId) -> &Node {
        self.nodes.get(&id).expect("known node")
    }

    pub fn members(&self) -> Vec<NodeId> {
        self.registry.members()
    }

    /// Delivers the current membership to every node.
    pub fn announce_view(&self) {
        let members = self.members();
        for node in self.nodes.values() {
            node.service.view_accepted(&members);
        }
    }
}

impl Drop for TestCluster {
    fn drop(&mut self) {
        for node in self.nodes.values() {
            node.service.stop();
        }
        self.registry.services.write().unwrap().clear();
    }
}
