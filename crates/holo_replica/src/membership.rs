//! Copy-on-write view of the remote members.
//!
//! The view is replaced wholesale by the single thread that delivers view
//! changes; callers take a cheap `Arc` snapshot and never hold the lock while
//! routing.

use std::collections::BTreeSet;
use std::sync::{Arc, PoisonError, RwLock};

use crate::types::NodeId;

/// Difference between two consecutive views.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MembershipChange {
    /// Members present now but not in the previous view.
    pub joined: Vec<NodeId>,
    /// Members of the previous view that are gone.
    pub left: Vec<NodeId>,
}

impl MembershipChange {
    /// Whether the view did not change.
    pub fn is_empty(&self) -> bool {
        self.joined.is_empty() && self.left.is_empty()
    }
}

/// Remote members as seen by one local member.
#[derive(Debug)]
pub struct MembershipView {
    local: NodeId,
    remote: RwLock<Arc<BTreeSet<NodeId>>>,
}

impl MembershipView {
    /// Empty view owned by `local`.
    pub fn new(local: NodeId) -> Self {
        Self {
            local,
            remote: RwLock::new(Arc::new(BTreeSet::new())),
        }
    }

    /// Logical identifier of the local member.
    pub fn local(&self) -> NodeId {
        self.local
    }

    /// Current remote members (self excluded).
    pub fn snapshot(&self) -> Arc<BTreeSet<NodeId>> {
        self.remote
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Remote members in ascending id order.
    pub fn peers(&self) -> Vec<NodeId> {
        self.snapshot().iter().copied().collect()
    }

    /// Whether any remote member is in the view.
    pub fn has_peers(&self) -> bool {
        !self.snapshot().is_empty()
    }

    /// Publishes the full member list of a new view and returns what changed.
    pub fn replace(&self, members: &[NodeId]) -> MembershipChange {
        let next = members
            .iter()
            .copied()
            .filter(|id| *id != self.local)
            .collect::<BTreeSet<_>>();
        let mut guard = self.remote.write().unwrap_or_else(PoisonError::into_inner);
        let change = MembershipChange {
            joined: next.difference(&guard).copied().collect(),
            left: guard.difference(&next).copied().collect(),
        };
        *guard = Arc::new(next);
        change
    }
}
