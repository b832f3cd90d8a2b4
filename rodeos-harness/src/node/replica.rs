use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::Config;
use crate::error::ClusterResult;
use crate::query::{HttpQueryClient, QueryApi};
use crate::supervisor::{StopSignal, Supervisor, STDERR_FILE};
use crate::topology::{Endpoint, NodeId, ReplicaId};

/// The fixed size of every replica's query thread pool.
pub const WQL_THREADS: u32 = 8;

/// The replica settings shared by every replica of a cluster.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReplicaSettings {
    /// The name of the filter contract the replica runs.
    pub filter_name: String,
    /// The path of the filter contract's wasm.
    pub filter_wasm: String,
    /// Enable on-chain execution acceleration.
    pub enable_oc: bool,
}

/// A rodeos instance re-serving one source's state-history stream.
pub struct ReplicaNode {
    id: ReplicaId,
    /// The `host:port` the replica's query API listens on.
    query_addr: String,
    /// The query client of the replica's API.
    query: HttpQueryClient,
    /// The source this replica was last attached to.
    source: Option<NodeId>,
    settings: Arc<ReplicaSettings>,
    supervisor: Supervisor,
}

impl ReplicaNode {
    /// Create a new instance. Nothing is spawned until the first `restart`.
    pub fn new(id: ReplicaId, config: &Config, settings: Arc<ReplicaSettings>) -> ClusterResult<Self> {
        let query_addr = config.wql_addr(id);
        let query = HttpQueryClient::new(&query_addr)?;
        let supervisor = Supervisor::new(
            format!("rodeos{}", id),
            &config.rodeos_binary,
            config.replica_dir(id),
            config.post_start_delay(),
            config.stop_grace(),
        );
        Ok(Self { id, query_addr, query, source: None, settings, supervisor })
    }

    pub fn id(&self) -> ReplicaId {
        self.id
    }

    pub fn working_dir(&self) -> &Path {
        self.supervisor.working_dir()
    }

    /// The path of the file capturing this replica's stderr.
    pub fn stderr_path(&self) -> PathBuf {
        self.working_dir().join(STDERR_FILE)
    }

    /// The `host:port` the replica's query API listens on.
    pub fn query_endpoint(&self) -> &str {
        &self.query_addr
    }

    /// The query client of this replica.
    pub fn query(&self) -> &dyn QueryApi {
        &self.query
    }

    /// The source this replica was last attached to.
    pub fn source(&self) -> Option<NodeId> {
        self.source
    }

    pub fn is_running(&mut self) -> bool {
        self.supervisor.is_running()
    }

    /// Restart this replica against the given source.
    ///
    /// A still running instance is interrupted first. A clean restart closes the capture files,
    /// wipes the working directory and opens fresh capture files before spawning.
    pub async fn restart(&mut self, source: NodeId, endpoint: &Endpoint, clean: bool) -> ClusterResult<()> {
        tracing::info!(replica = self.id, source, %endpoint, clean, "restarting replica");
        if self.supervisor.is_running() {
            self.supervisor.stop(StopSignal::Interrupt).await?;
        }
        let args = self.args(endpoint);
        self.supervisor.start(&args, clean).await?;
        self.source = Some(source);
        Ok(())
    }

    /// Stop this replica with the given signal, waiting for it to exit.
    pub async fn stop(&mut self, signal: StopSignal) -> ClusterResult<()> {
        tracing::info!(replica = self.id, %signal, "stopping replica");
        self.supervisor.stop(signal).await
    }

    /// Close this replica's capture files.
    pub fn close_logs(&mut self) {
        self.supervisor.close_logs();
    }

    /// Build the replica's command line for the given source endpoint.
    pub fn args(&self, endpoint: &Endpoint) -> Vec<String> {
        let dir = self.working_dir();
        let mut args = vec![
            "--rdb-database".into(),
            dir.join("rocksdb").to_string_lossy().into_owned(),
            "--data-dir".into(),
            dir.to_string_lossy().into_owned(),
        ];
        match endpoint {
            Endpoint::Tcp { .. } => args.extend(["--clone-connect-to".into(), endpoint.to_string()]),
            Endpoint::Unix(path) => args.extend(["--clone-unix-connect-to".into(), path.to_string_lossy().into_owned()]),
        }
        args.extend([
            "--wql-listen".into(),
            self.query_addr.clone(),
            "--wql-threads".into(),
            WQL_THREADS.to_string(),
            "--filter-name".into(),
            self.settings.filter_name.clone(),
            "--filter-wasm".into(),
            self.settings.filter_wasm.clone(),
        ]);
        if self.settings.enable_oc {
            args.push("--eos-vm-oc-enable".into());
        }
        args
    }
}
