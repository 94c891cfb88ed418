//! Method dispatch table for a replicated object.
//!
//! Each method of the replicated interface is declared once with its
//! replication policy. Ids are assigned in declaration order; three synthetic
//! entries for the chunked state-transfer protocol are always appended last so
//! a receiver recognizes control messages with a single range check.

use std::collections::HashMap;
use std::time::Duration;

use crate::transfer::TransferControl;
use crate::types::MethodId;

/// Default wait for replies to a synchronous replicated call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);
/// Number of synthetic transfer-control entries at the end of every table.
pub const TRANSFER_METHOD_COUNT: usize = 3;

const BEGIN_TRANSFER: &str = "__begin_transfer";
const TRANSFER_CHUNK: &str = "__transfer_chunk";
const END_TRANSFER: &str = "__end_transfer";

/// How replies from several members are folded into one return value.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Aggregation {
    /// No aggregate; the caller gets `null`.
    #[default]
    None,
    /// `true` only if every member answered `true`.
    BooleanAnd,
    /// Union of the elements of every member's collection.
    CollectionUnion,
}

/// Replication policy for one method.
#[derive(Clone, Debug, PartialEq)]
pub struct MethodSpec {
    /// Name callers use with `ReplicatedService::invoke`.
    pub name: String,
    /// Whether the call is sent to other members at all.
    pub replicated: bool,
    /// Never executed locally by the caller; only peers run it.
    pub remote_only: bool,
    /// Fire-and-forget; replies are not awaited.
    pub asynch: bool,
    /// Upper bound for collecting replies to a synchronous call.
    pub timeout: Duration,
    /// Run locally, then push the state for the key in `args[0]` to peers.
    pub replicates_state: bool,
    /// How replies are combined into the caller's result.
    pub aggregation: Aggregation,
}

impl MethodSpec {
    /// A method that always runs locally only.
    pub fn local(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            replicated: false,
            remote_only: false,
            asynch: false,
            timeout: DEFAULT_CALL_TIMEOUT,
            replicates_state: false,
            aggregation: Aggregation::None,
        }
    }

    /// A method broadcast to every member, the caller included.
    pub fn replicated(name: impl Into<String>) -> Self {
        Self {
            replicated: true,
            ..Self::local(name)
        }
    }

    /// Sends the call to peers only.
    pub fn remote_only(mut self) -> Self {
        self.remote_only = true;
        self
    }

    /// Returns without waiting for replies.
    pub fn asynch(mut self) -> Self {
        self.asynch = true;
        self
    }

    /// Overrides [`DEFAULT_CALL_TIMEOUT`].
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Replicates by streaming the affected key's state instead of re-running the call.
    pub fn replicates_state(mut self) -> Self {
        self.replicates_state = true;
        self
    }

    /// Sets the reply aggregation.
    pub fn aggregation(mut self, aggregation: Aggregation) -> Self {
        self.aggregation = aggregation;
        self
    }
}

/// A [`MethodSpec`] bound to its assigned id.
#[derive(Clone, Debug, PartialEq)]
pub struct MethodDescriptor {
    /// Position in the table; stable for the table's lifetime.
    pub id: MethodId,
    pub spec: MethodSpec,
}

impl MethodDescriptor {
    /// Declared method name.
    pub fn name(&self) -> &str {
        &self.spec.name
    }
}

/// Ids of the three synthetic transfer-control methods.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransferMethodIds {
    pub begin: MethodId,
    pub chunk: MethodId,
    pub end: MethodId,
}

impl TransferMethodIds {
    /// Maps a synthetic id to its control kind; `None` for ordinary methods.
    pub fn control_for(&self, method_id: MethodId) -> Option<TransferControl> {
        if method_id == self.begin {
            Some(TransferControl::Begin)
        } else if method_id == self.chunk {
            Some(TransferControl::Chunk)
        } else if method_id == self.end {
            Some(TransferControl::End)
        } else {
            None
        }
    }
}

/// Immutable method table, built once per replicated object.
#[derive(Clone, Debug)]
pub struct DispatchTable {
    methods: Vec<MethodDescriptor>,
    by_name: HashMap<String, MethodId>,
}

impl DispatchTable {
    /// Assigns ids in declaration order and appends the transfer-control entries.
    ///
    /// Fails on duplicate names or when ids would overflow [`MethodId`].
    pub fn new(specs: Vec<MethodSpec>) -> anyhow::Result<Self> {
        let total = specs.len() + TRANSFER_METHOD_COUNT;
        anyhow::ensure!(
            total <= usize::from(MethodId::MAX),
            "too many replicated methods: {}",
            specs.len()
        );

        let synthetic = [BEGIN_TRANSFER, TRANSFER_CHUNK, END_TRANSFER]
            .into_iter()
            .map(MethodSpec::local);
        let mut methods = Vec::with_capacity(total);
        let mut by_name = HashMap::with_capacity(total);
        for (idx, spec) in specs.into_iter().chain(synthetic).enumerate() {
            let id = idx as MethodId;
            anyhow::ensure!(
                by_name.insert(spec.name.clone(), id).is_none(),
                "duplicate method name: {}",
                spec.name
            );
            methods.push(MethodDescriptor { id, spec });
        }
        Ok(Self { methods, by_name })
    }

    /// Total number of entries, synthetic ones included.
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    /// Whether no user method was declared.
    pub fn is_empty(&self) -> bool {
        self.methods.len() == TRANSFER_METHOD_COUNT
    }

    /// Looks up a method by id.
    pub fn get(&self, method_id: MethodId) -> Option<&MethodDescriptor> {
        self.methods.get(usize::from(method_id))
    }

    /// Looks up a method by declared name.
    pub fn lookup(&self, name: &str) -> Option<&MethodDescriptor> {
        self.by_name.get(name).and_then(|id| self.get(*id))
    }

    /// Ids of the three trailing transfer-control entries.
    pub fn transfer_ids(&self) -> TransferMethodIds {
        let base = (self.methods.len() - TRANSFER_METHOD_COUNT) as MethodId;
        TransferMethodIds {
            begin: base,
            chunk: base + 1,
            end: base + 2,
        }
    }

    /// Whether `method_id` is one of the synthetic transfer-control entries.
    pub fn is_transfer_control(&self, method_id: MethodId) -> bool {
        let id = usize::from(method_id);
        id >= self.methods.len() - TRANSFER_METHOD_COUNT && id < self.methods.len()
    }

    /// User-declared methods in id order.
    pub fn methods(&self) -> &[MethodDescriptor] {
        &self.methods[..self.methods.len() - TRANSFER_METHOD_COUNT]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache_table() -> DispatchTable {
        DispatchTable::new(vec![
            MethodSpec::local("get"),
            MethodSpec::replicated("put").replicates_state(),
            MethodSpec::replicated("remove").aggregation(Aggregation::BooleanAnd),
            MethodSpec::replicated("keys")
                .remote_only()
                .aggregation(Aggregation::CollectionUnion),
        ])
        .expect("table")
    }

    #[test]
    fn transfer_entries_are_the_last_three_ids() {
        let table = cache_table();
        assert_eq!(table.len(), 7);
        let ids = table.transfer_ids();
        assert_eq!((ids.begin, ids.chunk, ids.end), (4, 5, 6));
        for id in 0..4 {
            assert!(!table.is_transfer_control(id));
            assert_eq!(ids.control_for(id), None);
        }
        for id in 4..7 {
            assert!(table.is_transfer_control(id));
        }
        assert!(!table.is_transfer_control(7));
        assert_eq!(ids.control_for(5), Some(TransferControl::Chunk));
    }

    #[test]
    fn lookup_resolves_declared_policy() {
        let table = cache_table();
        let keys = table.lookup("keys").expect("keys");
        assert_eq!(keys.id, 3);
        assert!(keys.spec.remote_only);
        assert_eq!(keys.spec.aggregation, Aggregation::CollectionUnion);
        assert!(!table.lookup("get").expect("get").spec.replicated);
        assert_eq!(table.methods().len(), 4);
        assert!(table.lookup("missing").is_none());
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let err = DispatchTable::new(vec![MethodSpec::local("a"), MethodSpec::local("a")])
            .expect_err("duplicate");
        assert!(err.to_string().contains("duplicate method name: a"));
    }

    #[test]
    fn user_methods_cannot_shadow_transfer_entries() {
        assert!(DispatchTable::new(vec![MethodSpec::local(BEGIN_TRANSFER)]).is_err());
    }

    #[test]
    fn empty_table_still_carries_transfer_entries() {
        let table = DispatchTable::new(Vec::new()).expect("table");
        assert!(table.is_empty());
        assert_eq!(table.transfer_ids().begin, 0);
    }
}
