//! Test fixtures.

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::cluster::{BaseCluster, BlockKind, ChainNode, LaunchPlan, TeardownPolicy};
use crate::config::Config;
use crate::error::{ClusterError, ClusterResult};
use crate::query::{BlockInfo, ChainInfo, QueryApi};
use crate::supervisor::StopSignal;
use crate::topology::NodeId;

/// Poll a file until it contains `needle`, returning its contents.
pub async fn wait_for_file_contents(path: &Path, needle: &str) -> Result<String> {
    for _ in 0..200 {
        if let Ok(contents) = tokio::fs::read_to_string(path).await {
            if contents.contains(needle) {
                return Ok(contents);
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    bail!("timed out waiting for {:?} to contain {:?}", path, needle)
}

/// Write an executable script standing in for the replica binary.
///
/// The script echoes its arguments to stdout and then sleeps until signalled.
pub async fn replica_script(dir: &Path) -> Result<PathBuf> {
    let path = dir.join("fake-rodeos.sh");
    tokio::fs::write(&path, "#!/bin/sh\necho \"$@\"\nexec sleep 600\n")
        .await
        .context("error writing replica script")?;
    tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).await?;
    Ok(path)
}

/// Build a test config whose replicas run the replica script, with replica 0's query endpoint
/// served by a fresh fake query server at the given head.
pub async fn config_with_fake_replica(head: u32) -> Result<(Arc<Config>, tempfile::TempDir, FakeQueryServer)> {
    let (config, tmpdir) = Config::new_test()?;
    let server = FakeQueryServer::start(head).await?;
    let mut config = (*config).clone();
    config.rodeos_binary = replica_script(tmpdir.path()).await?.to_string_lossy().into_owned();
    config.wql_base_port = server.addr.port();
    Ok((Arc::new(config), tmpdir, server))
}

/// An in-memory replica serving a block stream.
///
/// Every `get_info` call reports the current head, then advances it by `step`. Blocks in
/// `[first, head]` are materialized unless withheld or misreported.
pub struct MemReplica {
    endpoint: String,
    head: AtomicU32,
    step: u32,
    first: u32,
    withheld: BTreeSet<u32>,
    misreported: BTreeMap<u32, u32>,
    unreachable: bool,
    malformed: bool,
    info_calls: AtomicU32,
}

impl MemReplica {
    /// A replica which already holds blocks `[1, head]` and stays there.
    pub fn synced(head: u32) -> Self {
        Self {
            endpoint: "mem://replica".into(),
            head: AtomicU32::new(head),
            step: 0,
            first: 1,
            withheld: BTreeSet::new(),
            misreported: BTreeMap::new(),
            unreachable: false,
            malformed: false,
            info_calls: AtomicU32::new(0),
        }
    }

    /// A replica which never receives a block.
    pub fn stalled() -> Self {
        Self::synced(0)
    }

    /// A replica whose query endpoint cannot be reached.
    pub fn unreachable() -> Self {
        Self { unreachable: true, ..Self::synced(0) }
    }

    /// A replica whose status lacks a head block number.
    pub fn malformed() -> Self {
        Self { malformed: true, ..Self::synced(0) }
    }

    /// Advance the head by `step` blocks on every status query.
    pub fn growing(mut self, step: u32) -> Self {
        self.step = step;
        self
    }

    /// Only materialize blocks from `first` onward.
    pub fn pruned_below(mut self, first: u32) -> Self {
        self.first = first;
        self
    }

    /// Never serve the given block.
    pub fn withhold(mut self, block_num: u32) -> Self {
        self.withheld.insert(block_num);
        self
    }

    /// Serve block `reported` when asked for block `block_num`.
    pub fn misreport(mut self, block_num: u32, reported: u32) -> Self {
        self.misreported.insert(block_num, reported);
        self
    }

    /// The number of `get_info` calls served so far.
    pub fn info_calls(&self) -> u32 {
        self.info_calls.load(Ordering::SeqCst)
    }

    fn unreachable_err(&self) -> ClusterError {
        ClusterError::Query { endpoint: self.endpoint.clone(), detail: "connection refused".into() }
    }
}

#[async_trait]
impl QueryApi for MemReplica {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn get_info(&self) -> ClusterResult<ChainInfo> {
        self.info_calls.fetch_add(1, Ordering::SeqCst);
        if self.unreachable {
            return Err(self.unreachable_err());
        }
        if self.malformed {
            return Ok(ChainInfo::default());
        }
        let head = self.head.fetch_add(self.step, Ordering::SeqCst);
        Ok(ChainInfo { head_block_num: Some(head), last_irreversible_block_num: Some(head), ..Default::default() })
    }

    async fn get_block(&self, block_num: u32) -> ClusterResult<BlockInfo> {
        if self.unreachable {
            return Err(self.unreachable_err());
        }
        let head = self.head.load(Ordering::SeqCst);
        if block_num < self.first || block_num > head || self.withheld.contains(&block_num) {
            return Ok(BlockInfo::default());
        }
        Ok(BlockInfo::materialized(self.misreported.get(&block_num).copied().unwrap_or(block_num)))
    }
}

/// The state behind a `FakeQueryServer`.
#[derive(Debug, Default)]
pub struct FakeChain {
    /// The reported head, `None` renders a status without `head_block_num`.
    pub head: Option<u32>,
    /// The reported last irreversible block.
    pub lib: u32,
    /// Blocks which are never served.
    pub withheld: BTreeSet<u32>,
}

/// A fake chain query HTTP API.
pub struct FakeQueryServer {
    pub addr: SocketAddr,
    pub chain: Arc<Mutex<FakeChain>>,
    handle: JoinHandle<()>,
}

impl FakeQueryServer {
    /// Serve a fake chain at the given head on an ephemeral local port.
    pub async fn start(head: u32) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        Self::serve(listener, head).await
    }

    /// Serve a fake chain at the given head on the given listener.
    pub async fn serve(listener: TcpListener, head: u32) -> Result<Self> {
        let addr = listener.local_addr()?;
        let chain = Arc::new(Mutex::new(FakeChain { head: Some(head), lib: head, withheld: BTreeSet::new() }));
        let app = Router::new()
            .route("/v1/chain/get_info", get(fake_get_info))
            .route("/v1/chain/get_block", post(fake_get_block))
            .with_state(chain.clone());
        let handle = tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, app).await {
                tracing::error!(error = ?err, "fake query server failed");
            }
        });
        Ok(Self { addr, chain, handle })
    }

    /// Set the reported head and last irreversible block.
    pub fn set_head(&self, head: u32) {
        if let Ok(mut chain) = self.chain.lock() {
            chain.head = Some(head);
            chain.lib = head;
        }
    }

    /// Never serve the given block.
    pub fn withhold(&self, block_num: u32) {
        if let Ok(mut chain) = self.chain.lock() {
            chain.withheld.insert(block_num);
        }
    }

    /// Drop the head block number from every status response.
    pub fn malform(&self) {
        if let Ok(mut chain) = self.chain.lock() {
            chain.head = None;
        }
    }
}

impl Drop for FakeQueryServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn fake_get_info(State(chain): State<Arc<Mutex<FakeChain>>>) -> Json<Value> {
    let chain = chain.lock().expect("fake chain lock poisoned");
    match chain.head {
        Some(head) => Json(serde_json::json!({
            "server_version": "fake",
            "head_block_num": head,
            "last_irreversible_block_num": chain.lib,
            "head_block_id": format!("{:08x}", head),
        })),
        None => Json(serde_json::json!({ "server_version": "fake" })),
    }
}

async fn fake_get_block(State(chain): State<Arc<Mutex<FakeChain>>>, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    let chain = chain.lock().expect("fake chain lock poisoned");
    let block_num = body.get("block_num_or_id").and_then(Value::as_u64).unwrap_or(0) as u32;
    let head = chain.head.unwrap_or(0);
    if block_num == 0 || block_num > head || chain.withheld.contains(&block_num) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "code": 500, "message": "Internal Service Error", "error": { "what": "unknown block" } })),
        );
    }
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "block_num": block_num,
            "id": format!("{:08x}", block_num),
            "previous": format!("{:08x}", block_num - 1),
        })),
    )
}

/// An event observed by the fake base cluster or one of its nodes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClusterEvent {
    Launched { total_nodes: u32, clean_run: bool },
    Synced { block_advancing: u32 },
    BootstrapRemoved { signal: StopSignal },
    Relaunched { node: NodeId, chain_args: Vec<String>, clean: bool },
    Killed { node: NodeId, signal: StopSignal },
    Shutdown { policy: TeardownPolicy },
}

/// The shared, ordered log of cluster events.
pub type EventLog = Arc<Mutex<Vec<ClusterEvent>>>;

fn record(events: &EventLog, event: ClusterEvent) {
    if let Ok(mut events) = events.lock() {
        events.push(event);
    }
}

/// Snapshot the given event log.
pub fn events(log: &EventLog) -> Vec<ClusterEvent> {
    log.lock().map(|events| events.clone()).unwrap_or_default()
}

/// A fake chain node recording its lifecycle.
pub struct FakeChainNode {
    id: NodeId,
    data_dir: PathBuf,
    events: EventLog,
    relaunch_ok: bool,
}

#[async_trait]
impl ChainNode for FakeChainNode {
    fn id(&self) -> NodeId {
        self.id
    }

    fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    async fn relaunch(&mut self, chain_args: &[String], clean: bool) -> ClusterResult<bool> {
        record(&self.events, ClusterEvent::Relaunched { node: self.id, chain_args: chain_args.to_vec(), clean });
        Ok(self.relaunch_ok)
    }

    async fn kill(&mut self, signal: StopSignal) -> ClusterResult<()> {
        record(&self.events, ClusterEvent::Killed { node: self.id, signal });
        Ok(())
    }

    async fn wait_for_block(&self, _block_num: u32, _kind: BlockKind, _timeout: Duration) -> ClusterResult<bool> {
        Ok(true)
    }
}

/// A fake base cluster handing out `FakeChainNode`s.
pub struct FakeBaseCluster {
    root: PathBuf,
    events: EventLog,
    /// The extra arguments of the last launch plan.
    pub extra_args: Arc<Mutex<BTreeMap<NodeId, Vec<String>>>>,
    /// Whether the cluster reports a successful sync.
    pub syncs: bool,
    /// Whether the cluster's nodes report successful relaunches.
    pub relaunch_ok: bool,
    /// Whether launching fails outright.
    pub fail_launch: bool,
    /// Whether launching hands back one node fewer than planned.
    pub short_launch: bool,
}

impl FakeBaseCluster {
    /// Create a new instance whose node data dirs live under `root`.
    pub fn new(root: &Path) -> (Self, EventLog) {
        let events = EventLog::default();
        let cluster = Self {
            root: root.to_path_buf(),
            events: events.clone(),
            extra_args: Default::default(),
            syncs: true,
            relaunch_ok: true,
            fail_launch: false,
            short_launch: false,
        };
        (cluster, events)
    }
}

#[async_trait]
impl BaseCluster for FakeBaseCluster {
    async fn launch(&mut self, plan: &LaunchPlan) -> ClusterResult<Vec<Box<dyn ChainNode>>> {
        record(&self.events, ClusterEvent::Launched { total_nodes: plan.total_nodes, clean_run: plan.clean_run });
        if self.fail_launch {
            return Err(ClusterError::Launch("fake launch failure".into()));
        }
        if let Ok(mut extra_args) = self.extra_args.lock() {
            *extra_args = plan.specific_extra_args.clone();
        }
        let total_nodes = if self.short_launch { plan.total_nodes.saturating_sub(1) } else { plan.total_nodes };
        Ok((0..total_nodes)
            .map(|id| {
                Box::new(FakeChainNode {
                    id,
                    data_dir: self.root.join(format!("node_{:02}", id)),
                    events: self.events.clone(),
                    relaunch_ok: self.relaunch_ok,
                }) as Box<dyn ChainNode>
            })
            .collect())
    }

    async fn wait_on_sync(&mut self, block_advancing: u32) -> ClusterResult<bool> {
        record(&self.events, ClusterEvent::Synced { block_advancing });
        Ok(self.syncs)
    }

    async fn remove_bootstrap_node(&mut self, signal: StopSignal) -> ClusterResult<()> {
        record(&self.events, ClusterEvent::BootstrapRemoved { signal });
        Ok(())
    }

    async fn shutdown(&mut self, policy: &TeardownPolicy) -> ClusterResult<()> {
        record(&self.events, ClusterEvent::Shutdown { policy: *policy });
        Ok(())
    }
}
