//! Planning failures. Any of them aborts the whole plan.

/// Metadata failure raised while planning.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanningError {
    #[error("unknown group '{0}'")]
    UnknownGroup(String),

    #[error("unknown store '{0}'")]
    UnknownStore(String),

    #[error("prepared command on group '{0}' has no parameter rows")]
    MissingParameters(String),
}
