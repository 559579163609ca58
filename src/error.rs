use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Flow authoring/store errors. Surfaced to the flow author; a validated
/// flow should never produce these at traversal time.
#[derive(Debug, Clone, Error)]
pub enum FlowError {
    #[error("invalid flow: {0}")]
    Validation(String),

    #[error("flow `{0}` not found")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Traversal-time errors. Each of these retires the execution to
/// `Failed{reason}`; none propagate to the webhook caller as a panic.
///
/// Serializable because the variant message becomes the stored terminal
/// reason an operator later inspects.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum EngineError {
    /// A node or connection referenced at runtime no longer exists, or a
    /// node's config (template, regex) is unusable.
    #[error("broken flow: {0}")]
    BrokenFlow(String),

    /// A condition matched nothing and the node declares no default
    /// connection, or a predicate could not be evaluated.
    #[error("predicate error: {0}")]
    Predicate(String),

    /// A cyclic or runaway graph exhausted the per-event step budget.
    #[error("step ceiling exceeded after {0} steps")]
    StepCeilingExceeded(usize),
}

/// Execution-store errors. `VersionConflict` is the optimistic-concurrency
/// token check failing; it signals a serialization bug in the caller, not
/// an execution failure.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    #[error("execution not found")]
    NotFound,

    #[error("execution version conflict: expected {expected}, found {found}")]
    VersionConflict { expected: u64, found: u64 },

    #[error("a live execution already exists for this (flow, contact) pair")]
    DuplicateLive,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("flow `{0}` not found")]
    FlowNotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("concurrency conflict: {0}")]
    Conflict(String),
}
