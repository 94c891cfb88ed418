//! Groups contiguous same-store updates into batched execution nodes.
//!
//! Grouping is decided only by store identity and adjacency. A command bound
//! for store A after an intervening command for store B starts a new run, even
//! if moving it would give a larger batch: the caller's order is the order of
//! effects.

use serde::Serialize;
use serde_json::Value;

use crate::command::{Capability, CapabilitySet, Catalog, CommandKind, StoreId, UpdateCommand};
use crate::error::PlanningError;

/// A contiguous run of commands executed against one store in one request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchGroup {
    pub store: StoreId,
    pub commands: Vec<UpdateCommand>,
    /// Per-command "needs runtime evaluation" flags, aligned with `commands`.
    pub needs_evaluation: Vec<bool>,
    /// Per-command parameter rows, aligned with `commands`.
    pub parameter_rows: Vec<Vec<Value>>,
}

impl BatchGroup {
    fn new(store: StoreId, commands: Vec<UpdateCommand>) -> Self {
        let needs_evaluation = commands.iter().map(|cmd| cmd.needs_evaluation).collect();
        let parameter_rows = commands.iter().map(|cmd| cmd.parameters.clone()).collect();
        Self {
            store,
            commands,
            needs_evaluation,
            parameter_rows,
        }
    }

    /// Number of commands in the run.
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// One step of an update plan, executed in plan order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum ExecutionNode {
    /// One command planned on its own. `store` is `None` for virtual groups.
    Access {
        command: UpdateCommand,
        store: Option<StoreId>,
    },
    /// Two or more commands sent to one store in a single request.
    BatchedUpdate(BatchGroup),
    /// Parameterized command handed to a store that consumes all rows at once.
    PreparedAccess {
        command: UpdateCommand,
        store: StoreId,
        rows: Vec<Vec<Value>>,
    },
    /// Parameterized command executed once per row, in row order.
    PreparedBatch {
        command: UpdateCommand,
        store: Option<StoreId>,
        rows: Vec<Vec<Value>>,
    },
}

impl ExecutionNode {
    /// Number of statement executions this node stands for.
    pub fn command_count(&self) -> usize {
        match self {
            Self::Access { .. } => 1,
            Self::BatchedUpdate(group) => group.len(),
            Self::PreparedAccess { rows, .. } | Self::PreparedBatch { rows, .. } => rows.len(),
        }
    }

    /// One-line, human-readable rendering of this node.
    pub fn explain(&self) -> String {
        match self {
            Self::Access { command, store } => format!(
                "Access store={} kind={}: {}",
                store.as_deref().unwrap_or("<virtual>"),
                command.kind,
                command.text
            ),
            Self::BatchedUpdate(group) => {
                let kinds = group
                    .commands
                    .iter()
                    .map(|cmd| cmd.kind.as_str())
                    .collect::<Vec<_>>()
                    .join(", ");
                format!(
                    "BatchedUpdate store={} commands={} [{}]",
                    group.store,
                    group.len(),
                    kinds
                )
            }
            Self::PreparedAccess {
                command,
                store,
                rows,
            } => format!(
                "PreparedAccess store={} rows={}: {}",
                store,
                rows.len(),
                command.text
            ),
            Self::PreparedBatch {
                command,
                store,
                rows,
            } => format!(
                "PreparedBatch store={} rows={}: {}",
                store.as_deref().unwrap_or("<virtual>"),
                rows.len(),
                command.text
            ),
        }
    }
}

/// Renders a whole plan, one node per line.
pub fn explain_plan(nodes: &[ExecutionNode]) -> String {
    if nodes.is_empty() {
        return "empty plan".to_string();
    }
    nodes
        .iter()
        .map(ExecutionNode::explain)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Resolved placement of one command.
#[derive(Debug, Clone)]
enum Target {
    /// Select-into, or a virtual group.
    Ineligible { store: Option<StoreId> },
    Eligible {
        store: StoreId,
        capabilities: CapabilitySet,
    },
}

impl Target {
    fn batch_store(&self) -> Option<&str> {
        match self {
            Self::Eligible {
                store,
                capabilities,
            } if capabilities.supports(Capability::BatchedUpdates) => Some(store),
            _ => None,
        }
    }
}

/// Plans update requests against a [`Catalog`].
pub struct UpdateBatchPlanner<'a, C: Catalog + ?Sized> {
    catalog: &'a C,
}

impl<'a, C: Catalog + ?Sized> UpdateBatchPlanner<'a, C> {
    /// Planner that resolves groups and stores through `catalog`.
    pub fn new(catalog: &'a C) -> Self {
        Self { catalog }
    }

    fn target(&self, command: &UpdateCommand) -> Result<Target, PlanningError> {
        let binding = self.catalog.resolve_group(&command.group)?;
        let store = binding.store().map(str::to_string);
        match store {
            Some(store) if command.kind != CommandKind::SelectInto => {
                let capabilities = self.catalog.capabilities(&store)?;
                Ok(Target::Eligible {
                    store,
                    capabilities,
                })
            }
            store => Ok(Target::Ineligible { store }),
        }
    }

    /// Plans `commands` in order.
    ///
    /// Every command is resolved before any node is built, so a metadata
    /// failure returns no partial plan.
    pub fn plan(&self, commands: Vec<UpdateCommand>) -> Result<Vec<ExecutionNode>, PlanningError> {
        let targets = commands
            .iter()
            .map(|command| self.target(command))
            .collect::<Result<Vec<_>, _>>()?;

        let mut nodes = Vec::with_capacity(commands.len());
        let mut planned = commands.into_iter().zip(targets).peekable();
        while let Some((command, target)) = planned.next() {
            let Some(store) = target.batch_store().map(str::to_string) else {
                let store = match target {
                    Target::Eligible { store, .. } => Some(store),
                    Target::Ineligible { store } => store,
                };
                nodes.push(ExecutionNode::Access { command, store });
                continue;
            };

            let mut run = vec![command];
            while planned
                .peek()
                .is_some_and(|(_, next)| next.batch_store() == Some(store.as_str()))
            {
                if let Some((command, _)) = planned.next() {
                    run.push(command);
                }
            }

            if run.len() == 1 {
                nodes.push(ExecutionNode::Access {
                    command: run.remove(0),
                    store: Some(store),
                });
                continue;
            }
            tracing::debug!(
                store = %store,
                commands = run.len(),
                "grouped contiguous updates into one batch"
            );
            nodes.push(ExecutionNode::BatchedUpdate(BatchGroup::new(store, run)));
        }
        Ok(nodes)
    }

    /// Plans one parameterized command executed once per row of `rows`.
    ///
    /// Prefers a store that takes all rows at once, then a batch of per-row
    /// clones, then sequential execution.
    pub fn plan_prepared(
        &self,
        command: UpdateCommand,
        rows: Vec<Vec<Value>>,
    ) -> Result<ExecutionNode, PlanningError> {
        if rows.is_empty() {
            return Err(PlanningError::MissingParameters(command.group));
        }
        let (store, capabilities) = match self.target(&command)? {
            Target::Eligible {
                store,
                capabilities,
            } => (store, capabilities),
            Target::Ineligible { store } => {
                return Ok(ExecutionNode::PreparedBatch {
                    command,
                    store,
                    rows,
                })
            }
        };

        if capabilities.supports(Capability::PreparedBatchUpdate) {
            return Ok(ExecutionNode::PreparedAccess {
                command,
                store,
                rows,
            });
        }
        if capabilities.supports(Capability::BatchedUpdates) && rows.len() > 1 {
            tracing::debug!(
                store = %store,
                rows = rows.len(),
                "expanding prepared update into a batch"
            );
            let clones = rows
                .into_iter()
                .map(|row| command.clone().with_parameters(row))
                .collect();
            return Ok(ExecutionNode::BatchedUpdate(BatchGroup::new(store, clones)));
        }
        Ok(ExecutionNode::PreparedBatch {
            command,
            store: Some(store),
            rows,
        })
    }
}
