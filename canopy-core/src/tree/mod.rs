//! The Signal Tree
//!
//! Everything that describes tree state and changes to it: identifiers,
//! nodes, immutable revisions, the command algebra and the mutable
//! [`SignalTree`] container that installs new revisions.

mod apply;
mod command;
mod id;
mod node;
mod revision;
mod signal_tree;

pub use apply::{apply, apply_all, Applied};
pub use command::{
    Accept, Command, CommandKind, CommandResult, KeyExpectation, ListPosition, NodeModification,
    Reject,
};
pub use id::{Id, ParseIdError};
pub use node::{Data, Node};
pub use revision::TreeRevision;
pub use signal_tree::{CommandSink, SignalTree};

pub(crate) use signal_tree::ResultHandler;
