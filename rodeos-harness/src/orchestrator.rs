//! The rodeos cluster orchestrator.
//!
//! A `RodeosCluster` owns every node of a test topology: a single producer, one or more ship nodes
//! and one or more rodeos replicas. It walks a strict lifecycle:
//!
//! ```text
//! Uninitialized -> BaseClusterUp -> SourcesSynced -> ReplicasAttached -> Running -> TearingDown -> Terminated
//! ```
//!
//! Replicas are only ever attached once the base cluster has synced and its bootstrap node is gone,
//! as a replica attached to a forking stream would make every later measurement meaningless.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::cluster::{BaseCluster, ChainNode, LaunchPlan, TeardownPolicy};
use crate::config::Config;
use crate::error::{ClusterError, ClusterResult};
use crate::node::{ReplicaNode, ReplicaSettings, SourceNode};
use crate::query::{BlockInfo, ChainInfo};
use crate::supervisor::{self, StopSignal};
use crate::topology::{Endpoint, NodeId, ReplicaId, TopologyMap, PRODUCER_NODE_ID};
use crate::verifier::ConvergenceVerifier;

/// The number of blocks the base cluster must advance by before it counts as synced.
const SYNC_BLOCK_ADVANCING: u32 = 5;
/// The number of stderr lines dumped per replica after a failed run.
const DUMP_LINES: usize = 100;

/// The per-run shape of a cluster.
#[derive(Clone, Debug)]
pub struct ClusterSpec {
    /// The number of ship nodes, with ids `1..=num_ship`.
    pub num_ship: u32,
    /// The number of rodeos replicas, with ids `0..num_rodeos`.
    pub num_rodeos: usize,
    /// Connect replicas to ships over unix sockets instead of TCP.
    pub unix_socket: bool,
    /// Settings shared by every replica.
    pub replica: ReplicaSettings,
    /// Keep logs and working directories regardless of the outcome.
    pub keep_logs: bool,
    /// Leave the base cluster's processes running after teardown.
    pub leave_running: bool,
    /// Wipe state left behind by previous runs before launching.
    pub clean_run: bool,
    /// Log the tail of every captured stderr when the run failed.
    pub dump_error_details: bool,
    /// The arguments applied on the producer's first restart, which enable block production.
    ///
    /// Defaults to `-e -p <producer_name>` when unset.
    pub producer_args: Option<Vec<String>>,
}

impl Default for ClusterSpec {
    fn default() -> Self {
        Self {
            num_ship: 1,
            num_rodeos: 1,
            unix_socket: false,
            replica: ReplicaSettings::default(),
            keep_logs: false,
            leave_running: false,
            clean_run: false,
            dump_error_details: false,
            producer_args: None,
        }
    }
}

/// The lifecycle phase of a `RodeosCluster`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClusterPhase {
    Uninitialized,
    BaseClusterUp,
    SourcesSynced,
    ReplicasAttached,
    Running,
    TearingDown,
    Terminated,
}

impl fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::BaseClusterUp => "base cluster up",
            Self::SourcesSynced => "sources synced",
            Self::ReplicasAttached => "replicas attached",
            Self::Running => "running",
            Self::TearingDown => "tearing down",
            Self::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// A cluster of one producer, one or more ship nodes and one or more rodeos replicas.
pub struct RodeosCluster<C: BaseCluster> {
    config: Arc<Config>,
    spec: ClusterSpec,
    base: C,
    phase: ClusterPhase,

    /// The producer, present once the base cluster is up.
    producer: Option<SourceNode>,
    /// Ship nodes keyed by node id.
    ships: BTreeMap<NodeId, SourceNode>,
    /// Replicas indexed by replica id.
    replicas: Vec<ReplicaNode>,
    topology: TopologyMap,
    verifier: ConvergenceVerifier,

    /// Whether the run succeeded, which governs log retention on teardown.
    successful: bool,
}

impl<C: BaseCluster> RodeosCluster<C> {
    /// Create a new instance.
    ///
    /// Every replica's working directory is wiped and recreated. Nothing is spawned until `setup`.
    pub async fn new(config: Arc<Config>, spec: ClusterSpec, base: C) -> ClusterResult<Self> {
        if spec.num_ship == 0 {
            return Err(ClusterError::InvalidInput("a cluster needs at least one ship node".into()));
        }
        if spec.num_rodeos == 0 {
            return Err(ClusterError::InvalidInput("a cluster needs at least one rodeos replica".into()));
        }
        tracing::info!(
            num_ship = spec.num_ship,
            num_rodeos = spec.num_rodeos,
            unix_socket = spec.unix_socket,
            enable_oc = spec.replica.enable_oc,
            "standing up rodeos cluster"
        );

        let ship_ids: Vec<NodeId> = (1..=spec.num_ship).collect();
        let topology = TopologyMap::assign(spec.num_rodeos, &ship_ids)?;
        let settings = Arc::new(spec.replica.clone());
        let mut replicas = Vec::with_capacity(spec.num_rodeos);
        for id in 0..spec.num_rodeos {
            let replica = ReplicaNode::new(id, &config, settings.clone())?;
            supervisor::wipe_dir(replica.working_dir()).await?;
            replicas.push(replica);
        }
        let verifier = ConvergenceVerifier::new(config.ready_policy(), config.catchup_policy());

        Ok(Self {
            config,
            spec,
            base,
            phase: ClusterPhase::Uninitialized,
            producer: None,
            ships: BTreeMap::new(),
            replicas,
            topology,
            verifier,
            successful: false,
        })
    }

    pub fn phase(&self) -> ClusterPhase {
        self.phase
    }

    pub fn topology(&self) -> &TopologyMap {
        &self.topology
    }

    /// The ids of every ship node, in ascending order.
    pub fn ship_ids(&self) -> impl Iterator<Item = NodeId> {
        1..=self.spec.num_ship
    }

    /// The number of replicas in this cluster.
    pub fn num_replicas(&self) -> usize {
        self.replicas.len()
    }

    pub fn is_successful(&self) -> bool {
        self.successful
    }

    /// Mark the run as successful or failed.
    pub fn set_test_successful(&mut self, successful: bool) {
        self.successful = successful;
    }

    /// The extra nodeos arguments handed to the given ship node.
    pub fn ship_args(&self, ship: NodeId) -> Vec<String> {
        let mut args: Vec<String> = [
            "--plugin",
            "eosio::state_history_plugin",
            "--trace-history",
            "--chain-state-history",
            "--state-history-endpoint",
        ]
        .iter()
        .map(ToString::to_string)
        .collect();
        args.push(self.config.ship_addr(ship));
        args.extend(["--disable-replay-opts".into(), "--plugin".into(), "eosio::net_api_plugin".into()]);
        if self.spec.unix_socket {
            args.extend(["--state-history-unix-socket-path".into(), socket_name(ship)]);
        }
        args
    }

    /// Bring the whole cluster up, leaving it in the `Running` phase.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn setup(&mut self) -> ClusterResult<()> {
        self.expect_phase("setup", ClusterPhase::Uninitialized)?;

        // Launch the producer and every ship node.
        let total_nodes = self.spec.num_ship + 1;
        let specific_extra_args = (1..=self.spec.num_ship).map(|ship| (ship, self.ship_args(ship))).collect();
        let plan = LaunchPlan { total_nodes, clean_run: self.spec.clean_run, specific_extra_args };
        let nodes = self.base.launch(&plan).await?;
        self.adopt_nodes(nodes, total_nodes).await?;
        self.transition(ClusterPhase::BaseClusterUp);

        // Only a single producer may remain, so that the state-history stream cannot fork.
        if !self.base.wait_on_sync(SYNC_BLOCK_ADVANCING).await? {
            return Err(ClusterError::Launch("base cluster failed to sync".into()));
        }
        tracing::info!("base cluster in sync");
        self.base.remove_bootstrap_node(StopSignal::Terminate).await?;
        self.transition(ClusterPhase::SourcesSynced);

        let assignments: Vec<_> = self.topology.iter().collect();
        for (replica, ship) in assignments {
            self.attach_replica(replica, ship, true).await?;
        }
        self.transition(ClusterPhase::ReplicasAttached);
        self.transition(ClusterPhase::Running);
        Ok(())
    }

    /// Take ownership of the launched nodes as the producer and ship sources.
    ///
    /// If the nodes cannot all be adopted, every one of them is stopped before the error is
    /// returned, since nothing else tracks them.
    async fn adopt_nodes(&mut self, nodes: Vec<Box<dyn ChainNode>>, total_nodes: u32) -> ClusterResult<()> {
        let endpoints = if nodes.len() != total_nodes as usize {
            Err(ClusterError::Launch(format!("expected {} nodes from base cluster, got {}", total_nodes, nodes.len())))
        } else {
            nodes
                .iter()
                .filter(|node| node.id() != PRODUCER_NODE_ID)
                .map(|node| -> ClusterResult<(NodeId, Endpoint)> { Ok((node.id(), self.ship_endpoint(&**node)?)) })
                .collect::<ClusterResult<BTreeMap<NodeId, Endpoint>>>()
        };
        let mut endpoints = match endpoints {
            Ok(endpoints) => endpoints,
            Err(err) => {
                for mut node in nodes {
                    if let Err(stop_err) = node.kill(StopSignal::Terminate).await {
                        tracing::error!(node = node.id(), error = ?stop_err, "error stopping unadopted node");
                    }
                }
                return Err(err);
            }
        };

        for node in nodes {
            let id = node.id();
            if id == PRODUCER_NODE_ID {
                self.producer = Some(SourceNode::new(node, None));
            } else {
                let endpoint = endpoints.remove(&id);
                self.ships.insert(id, SourceNode::new(node, endpoint));
            }
        }
        Ok(())
    }

    fn ship_endpoint(&self, node: &dyn ChainNode) -> ClusterResult<Endpoint> {
        if self.spec.unix_socket {
            Ok(Endpoint::Unix(node.data_dir().join(socket_name(node.id()))))
        } else {
            Endpoint::tcp(&self.config.ship_addr(node.id()))
        }
    }

    /// Restart the producer.
    ///
    /// The first call enables block production. Later calls reuse the persisted command line.
    pub async fn restart_producer(&mut self, clean: bool) -> ClusterResult<()> {
        self.expect_running("restart_producer")?;
        let one_time_args = self
            .spec
            .producer_args
            .clone()
            .unwrap_or_else(|| vec!["-e".into(), "-p".into(), self.config.producer_name.clone()]);
        self.producer_mut()?.restart(clean, &one_time_args).await
    }

    /// Stop the producer with the given signal.
    pub async fn stop_producer(&mut self, signal: StopSignal) -> ClusterResult<()> {
        self.expect_running("stop_producer")?;
        self.producer_mut()?.stop(signal).await
    }

    /// Restart the given ship node.
    pub async fn restart_ship(&mut self, ship: NodeId, clean: bool) -> ClusterResult<()> {
        self.expect_running("restart_ship")?;
        self.ship_mut(ship)?.restart(clean, &[]).await
    }

    /// Stop the given ship node with the given signal.
    pub async fn stop_ship(&mut self, ship: NodeId, signal: StopSignal) -> ClusterResult<()> {
        self.expect_running("stop_ship")?;
        self.ship_mut(ship)?.stop(signal).await
    }

    /// Restart the given replica against the given ship, or its assigned ship when `None`.
    pub async fn restart_replica(&mut self, replica: ReplicaId, ship: Option<NodeId>, clean: bool) -> ClusterResult<()> {
        self.expect_running("restart_replica")?;
        let ship = match ship {
            Some(ship) => ship,
            None => self.topology.source_of(replica)?,
        };
        self.attach_replica(replica, ship, clean).await
    }

    /// Stop the given replica with the given signal, waiting for it to exit.
    pub async fn stop_replica(&mut self, replica: ReplicaId, signal: StopSignal) -> ClusterResult<()> {
        self.expect_running("stop_replica")?;
        self.replica_mut(replica)?.stop(signal).await
    }

    /// Wait until the given replica's query endpoint answers, returning `false` on timeout.
    pub async fn wait_replica_ready(&self, replica: ReplicaId) -> ClusterResult<bool> {
        let replica = self.replica(replica)?;
        Ok(self.verifier.wait_until_ready(replica.query()).await)
    }

    /// Query the status of the given replica.
    pub async fn get_info(&self, replica: ReplicaId) -> ClusterResult<ChainInfo> {
        self.replica(replica)?.query().get_info().await
    }

    /// Query a single block from the given replica.
    pub async fn get_block(&self, replica: ReplicaId, block_num: u32) -> ClusterResult<BlockInfo> {
        self.replica(replica)?.query().get_block(block_num).await
    }

    /// Wait until the producer's last irreversible block reaches `num_blocks`.
    pub async fn produce_blocks(&self, num_blocks: u32) -> ClusterResult<bool> {
        self.expect_running("produce_blocks")?;
        tracing::info!(num_blocks, "waiting for producer to produce blocks");
        let producer = self.producer.as_ref().ok_or(ClusterError::UnknownSource(PRODUCER_NODE_ID))?;
        producer.wait_for_lib(num_blocks, Duration::from_secs(self.config.produce_timeout_seconds)).await
    }

    /// Verify that the given replica received blocks `[first_seen, num_blocks]` without a gap.
    pub async fn verify_contiguous_receipt(&self, replica: ReplicaId, num_blocks: u32) -> ClusterResult<bool> {
        let replica = self.replica(replica)?;
        self.verifier.verify_contiguous_receipt(replica.query(), num_blocks).await
    }

    /// Tear the cluster down.
    ///
    /// Every replica is stopped and its capture files closed, then the base cluster is torn down.
    /// Shutdown errors are logged and teardown proceeds. Working directories are purged only when
    /// the run succeeded and logs were not explicitly requested to be kept.
    #[tracing::instrument(level = "debug", skip(self), fields(successful = self.successful))]
    pub async fn teardown(&mut self) -> ClusterResult<()> {
        if matches!(self.phase, ClusterPhase::TearingDown | ClusterPhase::Terminated) {
            return Ok(());
        }
        self.transition(ClusterPhase::TearingDown);
        let policy = TeardownPolicy {
            successful: self.successful,
            keep_logs: self.spec.keep_logs,
            kill_instances: !self.spec.leave_running,
            dump_error_details: self.spec.dump_error_details,
        };

        let mut first_err = None;
        for replica in self.replicas.iter_mut() {
            if let Err(err) = replica.stop(StopSignal::Terminate).await {
                tracing::error!(replica = replica.id(), error = ?err, "error stopping replica");
                if err.is_fatal() && first_err.is_none() {
                    first_err = Some(err);
                }
            }
            replica.close_logs();
        }

        if policy.kill_instances {
            let sources = self.producer.iter_mut().chain(self.ships.values_mut());
            for source in sources {
                if let Err(err) = source.stop(StopSignal::Terminate).await {
                    tracing::error!(node = source.id(), error = ?err, "error stopping source node");
                    if err.is_fatal() && first_err.is_none() {
                        first_err = Some(err);
                    }
                }
            }
        }

        if policy.dump() {
            for replica in self.replicas.iter() {
                if let Some(tail) = supervisor::stderr_tail(replica.working_dir(), DUMP_LINES).await {
                    tracing::error!(replica = replica.id(), "stderr of replica:\n{}", tail);
                }
            }
        }
        if let Err(err) = self.base.shutdown(&policy).await {
            tracing::error!(error = ?err, "error shutting down base cluster");
            if first_err.is_none() {
                first_err = Some(err);
            }
        }
        if policy.purge() {
            for replica in self.replicas.iter() {
                supervisor::purge_dir(replica.working_dir()).await;
            }
        }

        self.transition(ClusterPhase::Terminated);
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Clean or warm restart a replica against the given ship.
    async fn attach_replica(&mut self, replica: ReplicaId, ship: NodeId, clean: bool) -> ClusterResult<()> {
        let endpoint = self
            .ships
            .get(&ship)
            .and_then(|source| source.endpoint())
            .cloned()
            .ok_or(ClusterError::UnknownSource(ship))?;
        tracing::info!(replica, ship, clean, %endpoint, "attaching replica");
        self.replica_mut(replica)?.restart(ship, &endpoint, clean).await
    }

    fn transition(&mut self, next: ClusterPhase) {
        tracing::debug!(from = %self.phase, to = %next, "cluster phase transition");
        self.phase = next;
    }

    fn expect_phase(&self, op: &'static str, phase: ClusterPhase) -> ClusterResult<()> {
        if self.phase != phase {
            return Err(ClusterError::InvalidPhase { op, phase: self.phase.to_string() });
        }
        Ok(())
    }

    fn expect_running(&self, op: &'static str) -> ClusterResult<()> {
        self.expect_phase(op, ClusterPhase::Running)
    }

    fn producer_mut(&mut self) -> ClusterResult<&mut SourceNode> {
        self.producer.as_mut().ok_or(ClusterError::UnknownSource(PRODUCER_NODE_ID))
    }

    fn ship_mut(&mut self, ship: NodeId) -> ClusterResult<&mut SourceNode> {
        self.ships.get_mut(&ship).ok_or(ClusterError::UnknownSource(ship))
    }

    fn replica(&self, replica: ReplicaId) -> ClusterResult<&ReplicaNode> {
        self.replicas.get(replica).ok_or(ClusterError::UnknownReplica(replica))
    }

    fn replica_mut(&mut self, replica: ReplicaId) -> ClusterResult<&mut ReplicaNode> {
        self.replicas.get_mut(replica).ok_or(ClusterError::UnknownReplica(replica))
    }
}

/// The unix socket file name of the given ship node, relative to its data dir.
fn socket_name(ship: NodeId) -> String {
    format!("ship{}.sock", ship)
}
