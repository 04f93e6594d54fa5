//! Error types.
//!
//! Condition failures are not errors: the command algebra reports them as
//! [`Reject`](crate::tree::Reject) results. The types here cover the other
//! failure classes.

use thiserror::Error;

use crate::tree::Id;

/// Failures reported synchronously at the call site.
#[derive(Debug, Error)]
pub enum SignalError {
    /// A validator attached to the signal handle refused the command.
    #[error("operation not supported by this signal: {0}")]
    Unsupported(String),

    /// A handle from another tree was passed where a child was expected.
    #[error("node {0} belongs to a different tree")]
    ForeignNode(Id),

    /// The root node cannot be removed.
    #[error("the root node cannot be removed")]
    RootRemoval,

    /// A clustered tree was combined with another tree in one transaction.
    #[error("a clustered tree cannot share a transaction with other trees")]
    MixedTrees,

    /// An effect wrote to a node it depends on.
    #[error("effect loop detected while writing node {0}")]
    EffectLoop(Id),

    /// Confirmation was delivered to a tree that is not clustered.
    #[error("tree is not clustered")]
    NotClustered,

    /// A stored value could not be converted to or from the requested type.
    #[error("value conversion failed: {0}")]
    Codec(#[from] serde_json::Error),

    /// A snapshot could not be encoded or decoded.
    #[error("snapshot failed: {0}")]
    Snapshot(String),
}

/// Failures delivered through a [`PendingResult`](crate::transaction::PendingResult).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OperationError {
    /// The tree rejected the command.
    #[error("rejected: {0}")]
    Rejected(String),

    /// The operation was cancelled before it committed.
    #[error("operation was cancelled")]
    Cancelled,

    /// The producer went away without delivering a result.
    #[error("operation was abandoned without a result")]
    Abandoned,

    /// The body of a transaction or update failed before anything was
    /// submitted.
    #[error("operation failed: {0}")]
    Failed(String),

    /// An update kept conflicting until the attempt limit was reached.
    #[error("gave up after {0} conflicting attempts")]
    AttemptsExhausted(usize),
}

/// Structural invariant violations found by
/// [`TreeRevision::validate`](crate::tree::TreeRevision::validate).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TreeError {
    #[error("the root node is missing")]
    MissingRoot,

    #[error("the root node has a parent")]
    RootHasParent,

    #[error("node {0} has no parent")]
    Detached(Id),

    #[error("node {child} names {parent} as parent but is not listed there")]
    ParentMismatch { child: Id, parent: Id },

    #[error("node {parent} lists {child} which does not point back")]
    ChildMismatch { parent: Id, child: Id },

    #[error("node {0} is not reachable from the root")]
    Cycle(Id),

    #[error("alias {alias} points to missing node {target}")]
    DanglingAlias { alias: Id, target: Id },
}
