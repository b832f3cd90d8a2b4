//! Harness error abstractions.

use std::time::Duration;

use thiserror::Error;

/// Cluster error variants.
///
/// The variants follow the harness failure taxonomy. Launch failures, structural violations and
/// malformed responses are fatal and abort the whole run. Readiness and convergence timeouts are
/// not errors at all, they are reported to callers as `Ok(false)`.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// The base cluster or a source node failed to come up or relaunch.
    #[error("launch error: {0}")]
    Launch(String),
    /// A replica served an item stream with a gap, a misordered item or no items at all.
    #[error("structural violation: {0}")]
    StructuralViolation(String),
    /// A stopped process did not exit within its grace period.
    #[error("{name} did not exit within {grace:?} of receiving {signal}")]
    Shutdown { name: String, signal: String, grace: Duration },
    /// A query endpoint answered with a body which is missing required fields.
    #[error("malformed response from {endpoint}: {detail}")]
    MalformedResponse { endpoint: String, detail: String },
    /// A query endpoint could not be reached.
    #[error("error querying {endpoint}: {detail}")]
    Query { endpoint: String, detail: String },
    /// The given source node id does not exist in this cluster.
    #[error("source node {0} does not exist")]
    UnknownSource(u32),
    /// The given replica id does not exist in this cluster.
    #[error("replica {0} does not exist")]
    UnknownReplica(usize),
    /// The requested operation is not valid in the orchestrator's current phase.
    #[error("operation `{op}` is invalid while the cluster is {phase}")]
    InvalidPhase { op: &'static str, phase: String },
    /// The given input was invalid.
    #[error("validation error: {0}")]
    InvalidInput(String),
    /// A filesystem or process-level IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Any other internal error.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ClusterError {
    /// Check whether this error must abort the whole run.
    ///
    /// Shutdown errors are logged by callers and teardown proceeds.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Shutdown { .. })
    }
}

/// A result type where the error is a `ClusterError`.
pub type ClusterResult<T> = ::std::result::Result<T, ClusterError>;
