//! Source and replica nodes.

mod replica;
mod source;

pub use replica::{ReplicaNode, ReplicaSettings, WQL_THREADS};
pub use source::SourceNode;
