//! Consumer side of chunked state transfers.
//!
//! Every transfer key owns one `HandoffChannel` and one loader task on the
//! runtime's blocking pool. The control-message thread only pushes chunks into
//! channels; it never holds the registry lock while a push blocks.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use super::{TransferControl, TransferKey};
use crate::error::ReplicaError;
use crate::handoff::{HandoffChannel, HandoffReader};
use crate::metrics::TransferMetrics;
use crate::types::{NodeId, ReplicatedObject};

struct PendingTransfer {
    channel: Arc<HandoffChannel>,
    loader: JoinHandle<()>,
}

type Registry = Mutex<HashMap<TransferKey, PendingTransfer>>;

fn lock_registry(registry: &Registry) -> MutexGuard<'_, HashMap<TransferKey, PendingTransfer>> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Receiving end of the chunked state-transfer protocol for one object.
///
/// Dropping the receiver closes every pending transfer.
pub struct TransferReceiver {
    object: Arc<dyn ReplicatedObject>,
    registry: Arc<Registry>,
    runtime: Handle,
    receive_timeout: Duration,
    metrics: Arc<TransferMetrics>,
}

impl TransferReceiver {
    /// Loaders for `object` run on `runtime`'s blocking pool and wait at most
    /// `receive_timeout` for each chunk.
    pub fn new(object: Arc<dyn ReplicatedObject>, runtime: Handle, receive_timeout: Duration) -> Self {
        Self {
            object,
            registry: Arc::new(Mutex::new(HashMap::new())),
            runtime,
            receive_timeout,
            metrics: Arc::new(TransferMetrics::default()),
        }
    }

    /// Counters for transfers seen by this receiver.
    pub fn metrics(&self) -> &TransferMetrics {
        &self.metrics
    }

    /// Number of registered transfers.
    pub fn active_transfers(&self) -> usize {
        lock_registry(&self.registry).len()
    }

    /// Whether `key` is registered.
    pub fn is_active(&self, key: &TransferKey) -> bool {
        lock_registry(&self.registry).contains_key(key)
    }

    /// Applies one control message received from `sender`.
    pub fn handle(
        &self,
        sender: NodeId,
        control: TransferControl,
        transfer_id: &str,
        data: Option<Bytes>,
    ) {
        let key = TransferKey::new(transfer_id, sender);
        match control {
            TransferControl::Begin => self.begin(key),
            TransferControl::Chunk => self.chunk(key, data.unwrap_or_default()),
            TransferControl::End => self.end(key),
        }
    }

    fn begin(&self, key: TransferKey) {
        let channel = Arc::new(HandoffChannel::new());
        let stale = {
            let mut registry = lock_registry(&self.registry);
            let stale = registry.remove(&key);
            // Spawn while holding the lock so the loader cannot try to
            // deregister itself before it is registered.
            let loader = self.runtime.spawn_blocking({
                let object = self.object.clone();
                let registry = self.registry.clone();
                let metrics = self.metrics.clone();
                let channel = channel.clone();
                let key = key.clone();
                let timeout = self.receive_timeout;
                move || run_loader(object, registry, metrics, key, channel, timeout)
            });
            registry.insert(
                key.clone(),
                PendingTransfer {
                    channel: channel.clone(),
                    loader,
                },
            );
            stale
        };
        self.metrics.record_started();

        if let Some(stale) = stale {
            // The abandoned stream is incomplete; closing makes its loader
            // fail instead of applying a truncated state.
            stale.channel.close();
            self.metrics.record_overridden();
            tracing::debug!(
                transfer_id = %key.transfer_id,
                sender = key.sender,
                loader_finished = stale.loader.is_finished(),
                "begin-transfer replaced an unfinished transfer"
            );
        }
    }

    fn chunk(&self, key: TransferKey, data: Bytes) {
        let channel = lock_registry(&self.registry)
            .get(&key)
            .map(|pending| pending.channel.clone());
        let Some(channel) = channel else {
            self.metrics.record_dropped_chunk();
            tracing::debug!(
                transfer_id = %key.transfer_id,
                sender = key.sender,
                "dropping chunk for unknown transfer"
            );
            return;
        };

        let len = data.len();
        match channel.send(Some(data)) {
            Ok(()) => self.metrics.record_chunk(len),
            Err(err) => {
                self.metrics.record_dropped_chunk();
                tracing::debug!(
                    error = %err,
                    transfer_id = %key.transfer_id,
                    sender = key.sender,
                    "dropping chunk for finished transfer"
                );
            }
        }
    }

    fn end(&self, key: TransferKey) {
        let channel = lock_registry(&self.registry)
            .get(&key)
            .map(|pending| pending.channel.clone());
        let Some(channel) = channel else {
            tracing::debug!(
                transfer_id = %key.transfer_id,
                sender = key.sender,
                "end-transfer for unknown transfer"
            );
            return;
        };
        // Deliver EOF first, then deregister.
        let _ = channel.send(None);
        remove_if_current(&self.registry, &key, &channel);
    }

    /// Abandons every transfer whose sender is in `departed`.
    ///
    /// Returns the number of transfers closed.
    pub fn drop_senders(&self, departed: &[NodeId]) -> usize {
        if departed.is_empty() {
            return 0;
        }
        let swept = {
            let mut registry = lock_registry(&self.registry);
            let keys = registry
                .keys()
                .filter(|key| departed.contains(&key.sender))
                .cloned()
                .collect::<Vec<_>>();
            keys.into_iter()
                .filter_map(|key| registry.remove(&key).map(|pending| (key, pending)))
                .collect::<Vec<_>>()
        };
        for (key, pending) in &swept {
            pending.channel.close();
            tracing::debug!(
                transfer_id = %key.transfer_id,
                sender = key.sender,
                "abandoned transfer from departed member"
            );
        }
        self.metrics.record_swept(swept.len() as u64);
        swept.len()
    }

    /// Closes every pending transfer.
    pub fn shutdown(&self) {
        let drained = lock_registry(&self.registry)
            .drain()
            .map(|(_, pending)| pending)
            .collect::<Vec<_>>();
        for pending in drained {
            pending.channel.close();
        }
    }
}

impl Drop for TransferReceiver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn remove_if_current(registry: &Registry, key: &TransferKey, channel: &Arc<HandoffChannel>) {
    let mut registry = lock_registry(registry);
    let current = registry
        .get(key)
        .is_some_and(|pending| Arc::ptr_eq(&pending.channel, channel));
    if current {
        registry.remove(key);
    }
}

fn run_loader(
    object: Arc<dyn ReplicatedObject>,
    registry: Arc<Registry>,
    metrics: Arc<TransferMetrics>,
    key: TransferKey,
    channel: Arc<HandoffChannel>,
    timeout: Duration,
) {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        let mut reader = HandoffReader::new(channel.clone(), timeout);
        object.set_state(&key.transfer_id, &mut reader)
    }))
    .unwrap_or_else(|_| Err(anyhow::anyhow!("state loader panicked")));
    // The reader is gone either way; make sure the producer is released.
    channel.close();

    match outcome {
        Ok(()) => metrics.record_completed(),
        Err(source) => {
            metrics.record_failed();
            let err = ReplicaError::StateLoad {
                transfer_id: key.transfer_id.clone(),
                source,
            };
            tracing::warn!(error = %err, sender = key.sender, "state transfer failed");
        }
    }
    remove_if_current(&registry, &key, &channel);
}
