//! A base cluster of local `nodeos` processes.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::cluster::{BaseCluster, BlockKind, ChainNode, LaunchPlan, TeardownPolicy};
use crate::config::Config;
use crate::error::{ClusterError, ClusterResult};
use crate::query::{ChainInfo, HttpQueryClient, QueryApi};
use crate::supervisor::{self, StopSignal, Supervisor};
use crate::topology::NodeId;

/// The name of the bootstrap node's directories.
const BIOS_NAME: &str = "bios";
/// The file name of the genesis document in every node's config dir.
const GENESIS_FILE: &str = "genesis.json";
/// The timestamp every launched chain starts from.
const GENESIS_TIMESTAMP: &str = "2018-06-01T12:00:00.000";
/// The number of stderr lines dumped per node after a failed run.
const DUMP_LINES: usize = 100;

/// The plugins every node runs.
const BASE_PLUGINS: &[&str] = &["eosio::producer_plugin", "eosio::chain_api_plugin", "eosio::http_plugin"];

#[derive(Serialize)]
struct Genesis<'a> {
    initial_timestamp: &'a str,
    initial_key: &'a str,
}

/// A `BaseCluster` made of `nodeos` processes on the local host.
///
/// A bootstrap node produces as the configured producer until the cluster has synced. Node 0 is
/// the designated producer, every further node is typically a state-history node. All nodes peer
/// with the bootstrap node and with every node launched before them.
pub struct LocalCluster {
    config: Arc<Config>,
    /// The bootstrap node, until it is removed.
    bios: Option<NodeosNode>,
    /// Query clients of every launched node, indexed by node id.
    queries: Vec<HttpQueryClient>,
    /// The names of every launched node, used for directory bookkeeping.
    names: Vec<String>,
}

impl LocalCluster {
    /// Create a new instance. Nothing is spawned until `launch`.
    pub fn new(config: Arc<Config>) -> Self {
        Self { config, bios: None, queries: vec![], names: vec![] }
    }

    /// The directory name of the given node.
    pub fn node_name(id: NodeId) -> String {
        format!("{:02}", id)
    }

    /// Build the base command line of a node, excluding any genesis arguments.
    ///
    /// The bootstrap node is addressed with `slot == total_nodes`, which places its ports after
    /// those of every regular node.
    pub fn node_args(config: &Config, name: &str, slot: u32, total_nodes: u32, extra: &[String]) -> Vec<String> {
        let host = &config.listen_host;
        let mut args = vec![
            "--data-dir".into(),
            config.node_data_dir(name).to_string_lossy().into_owned(),
            "--config-dir".into(),
            config.node_config_dir(name).to_string_lossy().into_owned(),
            "--http-server-address".into(),
            format!("{}:{}", host, config.http_base_port as u32 + slot),
            "--p2p-listen-endpoint".into(),
            format!("{}:{}", host, config.p2p_base_port as u32 + slot),
            "--signature-provider".into(),
            config.signature_provider.clone(),
        ];
        for plugin in BASE_PLUGINS {
            args.extend(["--plugin".into(), plugin.to_string()]);
        }
        // Regular nodes peer with the bootstrap node and every node before them.
        if slot != total_nodes {
            args.extend(["--p2p-peer-address".into(), format!("{}:{}", host, config.p2p_base_port as u32 + total_nodes)]);
            for peer in 0..slot {
                args.extend(["--p2p-peer-address".into(), format!("{}:{}", host, config.p2p_base_port as u32 + peer)]);
            }
        }
        args.extend(extra.iter().cloned());
        args
    }

    /// Write the genesis document into the given node's config dir.
    pub(crate) async fn write_genesis(config: &Config, name: &str) -> ClusterResult<PathBuf> {
        let dir = config.node_config_dir(name);
        tokio::fs::create_dir_all(&dir).await?;
        let initial_key = config
            .signature_provider
            .split_once('=')
            .map(|(public, _)| public)
            .unwrap_or(&config.signature_provider);
        let genesis = Genesis { initial_timestamp: GENESIS_TIMESTAMP, initial_key };
        let body = serde_json::to_vec_pretty(&genesis).map_err(anyhow::Error::from)?;
        let path = dir.join(GENESIS_FILE);
        tokio::fs::write(&path, body).await?;
        Ok(path)
    }

    async fn spawn_node(&self, id: NodeId, name: String, slot: u32, total_nodes: u32, extra: &[String], clean: bool) -> ClusterResult<NodeosNode> {
        let genesis = Self::write_genesis(&self.config, &name).await?;
        let args = Self::node_args(&self.config, &name, slot, total_nodes, extra);
        let addr = format!("{}:{}", self.config.listen_host, self.config.http_base_port as u32 + slot);
        let mut node = NodeosNode::new(id, &name, addr, args, genesis, &self.config)?;
        node.start(clean).await?;
        Ok(node)
    }

    /// Stop the given nodes and the bootstrap node after a partly failed launch.
    ///
    /// Directories are left in place so that the caller's teardown can dump and retain them.
    async fn abandon(&mut self, nodes: Vec<NodeosNode>) {
        let bios = self.bios.take();
        for mut node in nodes.into_iter().chain(bios) {
            if let Err(err) = node.kill(StopSignal::Terminate).await {
                tracing::error!(node = node.id, error = ?err, "error stopping node of a failed launch");
            }
        }
    }

    /// Poll every node until all of them report a head at or beyond `target`.
    async fn wait_for_heads(&self, target: u32, timeout: Duration) -> ClusterResult<bool> {
        for query in self.queries.iter() {
            if !poll_block(query, target, BlockKind::Head, self.config.poll_interval(), timeout).await? {
                tracing::warn!(endpoint = query.endpoint(), target, "node did not reach sync target in time");
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[async_trait]
impl BaseCluster for LocalCluster {
    #[tracing::instrument(level = "debug", skip(self, plan), fields(total_nodes = plan.total_nodes))]
    async fn launch(&mut self, plan: &LaunchPlan) -> ClusterResult<Vec<Box<dyn ChainNode>>> {
        if plan.total_nodes == 0 {
            return Err(ClusterError::InvalidInput("a cluster needs at least one node besides the bootstrap node".into()));
        }
        tracing::info!(total_nodes = plan.total_nodes, clean_run = plan.clean_run, "launching base cluster");

        let bios_args = vec!["-e".to_string(), "-p".to_string(), self.config.producer_name.clone()];
        let bios = self
            .spawn_node(plan.total_nodes, BIOS_NAME.into(), plan.total_nodes, plan.total_nodes, &bios_args, plan.clean_run)
            .await?;
        self.bios = Some(bios);

        let mut nodes: Vec<NodeosNode> = Vec::with_capacity(plan.total_nodes as usize);
        for id in 0..plan.total_nodes {
            let name = Self::node_name(id);
            let extra = plan.specific_extra_args.get(&id).map(Vec::as_slice).unwrap_or(&[]);
            let node = match self.spawn_node(id, name.clone(), id, plan.total_nodes, extra, plan.clean_run).await {
                Ok(node) => node,
                Err(err) => {
                    tracing::error!(node = id, error = ?err, "error launching node, stopping nodes launched so far");
                    self.abandon(nodes).await;
                    return Err(err);
                }
            };
            self.queries.push(node.query.clone());
            self.names.push(name);
            nodes.push(node);
        }
        Ok(nodes.into_iter().map(|node| Box::new(node) as Box<dyn ChainNode>).collect())
    }

    async fn wait_on_sync(&mut self, block_advancing: u32) -> ClusterResult<bool> {
        let timeout = Duration::from_secs(self.config.sync_timeout_seconds);
        let reference = match self.queries.first() {
            Some(query) => query,
            None => return Err(ClusterError::InvalidInput("cannot sync a cluster which was never launched".into())),
        };
        if !poll_block(reference, 1, BlockKind::Head, self.config.poll_interval(), timeout).await? {
            return Ok(false);
        }
        let start = reference.get_info().await?.head(reference.endpoint())?;
        let target = start + block_advancing;
        tracing::info!(start, target, "waiting for base cluster to sync");
        if !self.wait_for_heads(target, timeout).await? {
            return Ok(false);
        }

        // Every node must hold the same block at the target height.
        let mut expected: Option<String> = None;
        for query in self.queries.iter() {
            let block = query.get_block(target).await?;
            match (&expected, block.id) {
                (_, None) => {
                    tracing::warn!(endpoint = query.endpoint(), target, "node does not hold sync target block");
                    return Ok(false);
                }
                (None, Some(id)) => expected = Some(id),
                (Some(want), Some(id)) if *want != id => {
                    tracing::warn!(endpoint = query.endpoint(), target, expected = %want, found = %id, "nodes disagree on sync target block");
                    return Ok(false);
                }
                _ => (),
            }
        }
        tracing::info!(target, "base cluster is in sync");
        Ok(true)
    }

    async fn remove_bootstrap_node(&mut self, signal: StopSignal) -> ClusterResult<()> {
        if let Some(mut bios) = self.bios.take() {
            tracing::info!(%signal, "removing bootstrap node");
            bios.kill(signal).await?;
        }
        Ok(())
    }

    async fn shutdown(&mut self, policy: &TeardownPolicy) -> ClusterResult<()> {
        if policy.kill_instances {
            if let Some(mut bios) = self.bios.take() {
                if let Err(err) = bios.kill(StopSignal::Terminate).await {
                    tracing::error!(error = ?err, "error stopping bootstrap node");
                }
            }
        }

        let mut names = self.names.clone();
        names.push(BIOS_NAME.into());
        if policy.dump() {
            for name in names.iter() {
                if let Some(tail) = supervisor::stderr_tail(&self.config.node_data_dir(name), DUMP_LINES).await {
                    tracing::error!(node = %name, "stderr of node:\n{}", tail);
                }
            }
        }
        if policy.purge() {
            for name in names.iter() {
                supervisor::purge_dir(&self.config.node_data_dir(name)).await;
                supervisor::purge_dir(&self.config.node_config_dir(name)).await;
            }
        }
        Ok(())
    }
}

/// A supervised `nodeos` process.
pub struct NodeosNode {
    id: NodeId,
    data_dir: PathBuf,
    /// The persisted command line, which grows by the chain args of the first relaunch.
    args: Vec<String>,
    /// Whether a relaunch already cached its chain args into `args`.
    cached: bool,
    genesis: PathBuf,
    query: HttpQueryClient,
    poll_interval: Duration,
    relaunch_timeout: Duration,
    supervisor: Supervisor,
}

impl NodeosNode {
    pub(crate) fn new(id: NodeId, name: &str, http_addr: String, args: Vec<String>, genesis: PathBuf, config: &Config) -> ClusterResult<Self> {
        let data_dir = config.node_data_dir(name);
        Ok(Self {
            id,
            args,
            cached: false,
            genesis,
            query: HttpQueryClient::new(&http_addr)?,
            poll_interval: config.poll_interval(),
            relaunch_timeout: Duration::from_secs(config.relaunch_timeout_seconds),
            supervisor: Supervisor::new(format!("nodeos{}", name), &config.nodeos_binary, &data_dir, config.post_start_delay(), config.stop_grace()),
            data_dir,
        })
    }

    /// The persisted command line of this node.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Spawn the node, starting a fresh chain from genesis when no block log exists yet.
    async fn start(&mut self, clean: bool) -> ClusterResult<u32> {
        let mut args = self.args.clone();
        if clean || !self.data_dir.join("blocks").exists() {
            args.extend(["--genesis-json".into(), self.genesis.to_string_lossy().into_owned()]);
        }
        self.supervisor.start(&args, clean).await
    }
}

#[async_trait]
impl ChainNode for NodeosNode {
    fn id(&self) -> NodeId {
        self.id
    }

    fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    async fn relaunch(&mut self, chain_args: &[String], clean: bool) -> ClusterResult<bool> {
        if self.supervisor.is_running() {
            self.supervisor.stop(StopSignal::Terminate).await?;
        }
        if !self.cached {
            self.args.extend(chain_args.iter().cloned());
            self.cached = true;
        } else if !chain_args.is_empty() {
            tracing::warn!(node = self.id, ?chain_args, "ignoring chain args on a relaunch after the first");
        }
        self.start(clean).await?;
        let ok = poll_block(&self.query, 0, BlockKind::Head, self.poll_interval, self.relaunch_timeout).await?;
        tracing::info!(node = self.id, clean, ok, "relaunched node");
        Ok(ok)
    }

    async fn kill(&mut self, signal: StopSignal) -> ClusterResult<()> {
        self.supervisor.stop(signal).await
    }

    async fn wait_for_block(&self, block_num: u32, kind: BlockKind, timeout: Duration) -> ClusterResult<bool> {
        poll_block(&self.query, block_num, kind, self.poll_interval, timeout).await
    }
}

/// Poll a node's status until the given kind of block reaches `block_num`.
///
/// An unreachable node counts as no progress. Returns `false` once `timeout` elapses.
async fn poll_block(query: &dyn QueryApi, block_num: u32, kind: BlockKind, interval: Duration, timeout: Duration) -> ClusterResult<bool> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match query.get_info().await {
            Ok(info) => {
                let current = reported(&info, kind);
                tracing::debug!(endpoint = query.endpoint(), ?kind, current = ?current, block_num, "polled node");
                if current.map(|current| current >= block_num).unwrap_or(false) {
                    return Ok(true);
                }
            }
            Err(err @ ClusterError::Query { .. }) => tracing::debug!(endpoint = query.endpoint(), error = %err, "node status is unavailable"),
            Err(err) => return Err(err),
        }
        if tokio::time::Instant::now() + interval > deadline {
            tracing::warn!(endpoint = query.endpoint(), ?kind, block_num, "node did not reach block in time");
            return Ok(false);
        }
        tokio::time::sleep(interval).await;
    }
}

fn reported(info: &ChainInfo, kind: BlockKind) -> Option<u32> {
    match kind {
        BlockKind::Head => info.head_block_num,
        BlockKind::Lib => info.last_irreversible_block_num,
    }
}
