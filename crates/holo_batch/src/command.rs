//! Update commands and the metadata the planner resolves them against.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PlanningError;

/// Identifier of a physical backing store.
pub type StoreId = String;

/// Statement kind of an update command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandKind {
    Insert,
    Update,
    Delete,
    /// `SELECT ... INTO`; never batched.
    SelectInto,
}

impl CommandKind {
    /// SQL keyword rendering used in plan explanations.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::SelectInto => "SELECT INTO",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One update command targeting a group (table) of some model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateCommand {
    pub kind: CommandKind,
    /// Target group, resolved to a store through the [`Catalog`].
    pub group: String,
    /// Statement text as sent to the store.
    pub text: String,
    /// Whether the command carries expressions that must be evaluated at run time.
    pub needs_evaluation: bool,
    /// Bound parameter values; empty for unparameterized commands.
    pub parameters: Vec<Value>,
}

impl UpdateCommand {
    /// Command without parameters or runtime evaluation.
    pub fn new(kind: CommandKind, group: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            kind,
            group: group.into(),
            text: text.into(),
            needs_evaluation: false,
            parameters: Vec::new(),
        }
    }

    /// Builds an `INSERT` command.
    pub fn insert(group: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(CommandKind::Insert, group, text)
    }

    /// Builds an `UPDATE` command.
    pub fn update(group: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(CommandKind::Update, group, text)
    }

    /// Builds a `DELETE` command.
    pub fn delete(group: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(CommandKind::Delete, group, text)
    }

    /// Builds a `SELECT ... INTO` command.
    pub fn select_into(group: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(CommandKind::SelectInto, group, text)
    }

    /// Marks the command as needing runtime evaluation.
    pub fn with_evaluation(mut self) -> Self {
        self.needs_evaluation = true;
        self
    }

    /// Binds one row of parameter values.
    pub fn with_parameters(mut self, parameters: Vec<Value>) -> Self {
        self.parameters = parameters;
        self
    }
}

/// Store feature relevant to update batching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Capability {
    /// Several distinct update commands can be sent in one request.
    BatchedUpdates,
    /// One parameterized command can be sent with an array of parameter rows.
    PreparedBatchUpdate,
}

/// Capabilities a store declares.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySet(BTreeSet<Capability>);

impl CapabilitySet {
    /// Store with no batching support.
    pub fn none() -> Self {
        Self::default()
    }

    /// Adds `capability`.
    pub fn with(mut self, capability: Capability) -> Self {
        self.0.insert(capability);
        self
    }

    /// Whether the store declares `capability`.
    pub fn supports(&self, capability: Capability) -> bool {
        self.0.contains(&capability)
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Where a group lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupBinding {
    /// Backed by a table in `store`.
    Physical { store: StoreId },
    /// Defined by a view over other groups; has no store of its own.
    Virtual,
}

impl GroupBinding {
    /// Backing store, or `None` for virtual groups.
    pub fn store(&self) -> Option<&str> {
        match self {
            Self::Physical { store } => Some(store),
            Self::Virtual => None,
        }
    }
}

/// Metadata source consulted while planning.
pub trait Catalog {
    /// Finds where `group` lives.
    fn resolve_group(&self, group: &str) -> Result<GroupBinding, PlanningError>;

    /// Capabilities declared by `store`.
    fn capabilities(&self, store: &str) -> Result<CapabilitySet, PlanningError>;
}

/// In-memory catalog for fixed deployments and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    groups: HashMap<String, GroupBinding>,
    stores: HashMap<StoreId, CapabilitySet>,
}

impl StaticCatalog {
    /// Catalog with no groups or stores.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `store` with its capabilities.
    pub fn with_store(mut self, store: impl Into<StoreId>, capabilities: CapabilitySet) -> Self {
        self.stores.insert(store.into(), capabilities);
        self
    }

    /// Binds `group` to a physical store.
    pub fn with_group(mut self, group: impl Into<String>, store: impl Into<StoreId>) -> Self {
        self.groups.insert(
            group.into(),
            GroupBinding::Physical {
                store: store.into(),
            },
        );
        self
    }

    /// Registers `group` as virtual.
    pub fn with_virtual_group(mut self, group: impl Into<String>) -> Self {
        self.groups.insert(group.into(), GroupBinding::Virtual);
        self
    }
}

impl Catalog for StaticCatalog {
    fn resolve_group(&self, group: &str) -> Result<GroupBinding, PlanningError> {
        self.groups
            .get(group)
            .cloned()
            .ok_or_else(|| PlanningError::UnknownGroup(group.to_string()))
    }

    fn capabilities(&self, store: &str) -> Result<CapabilitySet, PlanningError> {
        self.stores
            .get(store)
            .cloned()
            .ok_or_else(|| PlanningError::UnknownStore(store.to_string()))
    }
}
