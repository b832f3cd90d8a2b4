use std::time::Duration;

use crate::cluster::{BlockKind, ChainNode};
use crate::error::{ClusterError, ClusterResult};
use crate::supervisor::StopSignal;
use crate::topology::{Endpoint, NodeId};

/// A block producer or state-history node of the cluster.
pub struct SourceNode {
    /// The endpoint replicas use to reach this node's state-history stream, if it exports one.
    endpoint: Option<Endpoint>,
    /// The underlying chain node.
    node: Box<dyn ChainNode>,
    /// Whether `restart` has ever been called.
    ///
    /// The base cluster persists a node's command line across relaunches, so one-time
    /// arguments may only be handed over on the first restart.
    ever_restarted: bool,
}

impl SourceNode {
    /// Create a new instance.
    pub fn new(node: Box<dyn ChainNode>, endpoint: Option<Endpoint>) -> Self {
        Self { endpoint, node, ever_restarted: false }
    }

    pub fn id(&self) -> NodeId {
        self.node.id()
    }

    pub fn endpoint(&self) -> Option<&Endpoint> {
        self.endpoint.as_ref()
    }

    pub fn ever_restarted(&self) -> bool {
        self.ever_restarted
    }

    /// Restart this node.
    ///
    /// `one_time_args` are only applied on the very first call. A relaunch which does not report
    /// success is a fatal `Launch` error, as every later measurement would be meaningless.
    pub async fn restart(&mut self, clean: bool, one_time_args: &[String]) -> ClusterResult<()> {
        let chain_args = if self.ever_restarted { &[][..] } else { one_time_args };
        self.ever_restarted = true;
        tracing::info!(node = self.id(), clean, ?chain_args, "restarting source node");

        if !self.node.relaunch(chain_args, clean).await? {
            return Err(ClusterError::Launch(format!("failed to relaunch source node {}", self.id())));
        }
        Ok(())
    }

    /// Stop this node with the given signal.
    pub async fn stop(&mut self, signal: StopSignal) -> ClusterResult<()> {
        tracing::info!(node = self.id(), %signal, "stopping source node");
        self.node.kill(signal).await
    }

    /// Wait until this node's last irreversible block reaches `block_num`.
    pub async fn wait_for_lib(&self, block_num: u32, timeout: Duration) -> ClusterResult<bool> {
        self.node.wait_for_block(block_num, BlockKind::Lib, timeout).await
    }
}
