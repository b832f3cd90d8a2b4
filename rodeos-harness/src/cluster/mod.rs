//! The base cluster capability.
//!
//! Bringing up a multi-node chain is delegated to a `BaseCluster`. The orchestrator only needs to
//! launch it, wait for it to sync, drop its bootstrap node and tear it down again. Each launched
//! node is handed out as an owned `ChainNode`, so the orchestrator alone drives source lifecycles
//! from then on.

mod local;

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::ClusterResult;
use crate::supervisor::StopSignal;
use crate::topology::NodeId;

pub use local::LocalCluster;

/// The kind of block a node is asked to wait for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockKind {
    /// The node's head block.
    Head,
    /// The node's last irreversible block.
    Lib,
}

/// What the base cluster is asked to launch.
#[derive(Clone, Debug, Default)]
pub struct LaunchPlan {
    /// The number of nodes to launch besides the bootstrap node. Node 0 is the producer.
    pub total_nodes: u32,
    /// Wipe any state left behind by previous runs before launching.
    pub clean_run: bool,
    /// Extra arguments for specific nodes, keyed by node id.
    pub specific_extra_args: BTreeMap<NodeId, Vec<String>>,
}

/// How the base cluster is to be torn down.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TeardownPolicy {
    /// Whether the run succeeded.
    pub successful: bool,
    /// Keep logs and working directories regardless of the outcome.
    pub keep_logs: bool,
    /// Stop every process still running.
    pub kill_instances: bool,
    /// Log the tail of every captured stderr when the run failed.
    pub dump_error_details: bool,
}

impl TeardownPolicy {
    /// Whether working directories and logs should be purged.
    ///
    /// Follows the rule of retaining logs only on failure: a failed run always keeps its
    /// evidence, and a successful run keeps it only when `keep_logs` is set.
    pub fn purge(&self) -> bool {
        self.successful && !self.keep_logs
    }

    /// Whether captured error output should be dumped to the log.
    pub fn dump(&self) -> bool {
        !self.successful && self.dump_error_details
    }
}

/// A node of the base cluster.
#[async_trait]
pub trait ChainNode: Send {
    /// The id of this node.
    fn id(&self) -> NodeId;

    /// The data directory of this node.
    fn data_dir(&self) -> &Path;

    /// Relaunch this node.
    ///
    /// `chain_args` are appended to the node's command line, and are remembered for every
    /// subsequent relaunch. When `clean` is set the node's data directory is wiped first.
    /// Returns `false` if the node did not come back up.
    async fn relaunch(&mut self, chain_args: &[String], clean: bool) -> ClusterResult<bool>;

    /// Stop this node with the given signal, waiting for it to exit.
    async fn kill(&mut self, signal: StopSignal) -> ClusterResult<()>;

    /// Wait until this node reports the given block, returning `false` on timeout.
    async fn wait_for_block(&self, block_num: u32, kind: BlockKind, timeout: Duration) -> ClusterResult<bool>;
}

/// A multi-node chain which can be launched, synced and torn down as a whole.
#[async_trait]
pub trait BaseCluster: Send {
    /// Launch the cluster, returning its nodes in id order.
    async fn launch(&mut self, plan: &LaunchPlan) -> ClusterResult<Vec<Box<dyn ChainNode>>>;

    /// Wait until every node reports a consistent chain which advanced by `block_advancing` blocks.
    async fn wait_on_sync(&mut self, block_advancing: u32) -> ClusterResult<bool>;

    /// Stop the bootstrap node, leaving a single producer behind.
    async fn remove_bootstrap_node(&mut self, signal: StopSignal) -> ClusterResult<()>;

    /// Tear down whatever the cluster still owns.
    async fn shutdown(&mut self, policy: &TeardownPolicy) -> ClusterResult<()>;
}
