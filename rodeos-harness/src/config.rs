//! Runtime configuration.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::verifier::RetryPolicy;

/// The prefix of all environment variables read by `Config::new`.
pub const ENV_PREFIX: &str = "RODEOS_HARNESS_";
/// The well-known development key used to sign blocks on throwaway chains.
pub const DEV_SIGNATURE_PROVIDER: &str =
    "EOS6MRyAjQq8ud7hVNYcfnVPJqcVpscN5So8BhtHuGYqET5GDW5CV=KEY:5KQwrPbwdL6PhXujxW37FSSQZ1JiwsST4cqQzDeyXtP79zkvFD3";

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The path to the rodeos binary.
    #[serde(default = "Config::default_rodeos_binary")]
    pub rodeos_binary: String,
    /// The path to the nodeos binary.
    #[serde(default = "Config::default_nodeos_binary")]
    pub nodeos_binary: String,
    /// The directory under which all node and replica state is kept.
    #[serde(default = "Config::default_work_dir")]
    pub work_dir: String,
    /// The host on which every process of the cluster listens.
    #[serde(default = "Config::default_listen_host")]
    pub listen_host: String,

    /// The state-history port of ship node 1, further ship nodes count up from here.
    #[serde(default = "Config::default_ship_base_port")]
    pub ship_base_port: u16,
    /// The query port of replica 0, further replicas count up from here.
    #[serde(default = "Config::default_wql_base_port")]
    pub wql_base_port: u16,
    /// The HTTP port of node 0, further nodes count up from here.
    #[serde(default = "Config::default_http_base_port")]
    pub http_base_port: u16,
    /// The p2p port of node 0, further nodes count up from here.
    #[serde(default = "Config::default_p2p_base_port")]
    pub p2p_base_port: u16,

    /// The account which produces blocks once the bootstrap node is gone.
    #[serde(default = "Config::default_producer_name")]
    pub producer_name: String,
    /// The signature provider handed to every producing node.
    #[serde(default = "Config::default_signature_provider")]
    pub signature_provider: String,

    /// How long to wait after spawning a process before handing control back.
    #[serde(default = "Config::default_post_start_delay_ms")]
    pub post_start_delay_ms: u64,
    /// How long a stopped process may take to exit, unbounded when unset.
    #[serde(default)]
    pub stop_grace_seconds: Option<u64>,
    /// The cadence of every polling loop.
    #[serde(default = "Config::default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// The number of retries granted to a replica catching up to a target block.
    #[serde(default = "Config::default_catchup_max_retries")]
    pub catchup_max_retries: u32,
    /// The time granted to a replica's query endpoint to come up.
    #[serde(default = "Config::default_ready_timeout_seconds")]
    pub ready_timeout_seconds: u64,
    /// The time granted to a relaunched chain node's HTTP endpoint to come up.
    #[serde(default = "Config::default_relaunch_timeout_seconds")]
    pub relaunch_timeout_seconds: u64,
    /// The time granted to the base cluster to sync after launch.
    #[serde(default = "Config::default_sync_timeout_seconds")]
    pub sync_timeout_seconds: u64,
    /// The time granted to the producer to reach a target irreversible block.
    #[serde(default = "Config::default_produce_timeout_seconds")]
    pub produce_timeout_seconds: u64,
}

impl Config {
    /// Create a new config instance.
    ///
    /// Every value may be overridden by an environment variable carrying the `RODEOS_HARNESS_`
    /// prefix, e.g. `RODEOS_HARNESS_WQL_BASE_PORT`.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        envy::prefixed(ENV_PREFIX).from_env().context("error building config from env")
    }

    /// The working directory of the given replica.
    pub fn replica_dir(&self, replica: usize) -> PathBuf {
        PathBuf::from(&self.work_dir).join("var").join("lib").join(format!("rodeos{}", replica))
    }

    /// The data directory of the given chain node.
    pub fn node_data_dir(&self, node: &str) -> PathBuf {
        PathBuf::from(&self.work_dir).join("var").join("lib").join(format!("node_{}", node))
    }

    /// The config directory of the given chain node.
    pub fn node_config_dir(&self, node: &str) -> PathBuf {
        PathBuf::from(&self.work_dir).join("etc").join("eosio").join(format!("node_{}", node))
    }

    /// The query listen address of the given replica.
    pub fn wql_addr(&self, replica: usize) -> String {
        format!("{}:{}", self.listen_host, self.wql_base_port as usize + replica)
    }

    /// The state-history endpoint of the given ship node, ship ids start at 1.
    pub fn ship_addr(&self, ship: u32) -> String {
        format!("{}:{}", self.listen_host, self.ship_base_port as u32 + ship.saturating_sub(1))
    }

    pub fn post_start_delay(&self) -> Duration {
        Duration::from_millis(self.post_start_delay_ms)
    }

    pub fn stop_grace(&self) -> Option<Duration> {
        self.stop_grace_seconds.map(Duration::from_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// The retry policy of the catch-up phase of convergence verification.
    pub fn catchup_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.poll_interval(), self.catchup_max_retries)
    }

    /// The retry policy used while waiting for a replica's query endpoint.
    pub fn ready_policy(&self) -> RetryPolicy {
        RetryPolicy::within(self.poll_interval(), Duration::from_secs(self.ready_timeout_seconds))
    }

    fn default_rodeos_binary() -> String {
        "./programs/rodeos/rodeos".into()
    }
    fn default_nodeos_binary() -> String {
        "./programs/nodeos/nodeos".into()
    }
    fn default_work_dir() -> String {
        ".".into()
    }
    fn default_listen_host() -> String {
        "127.0.0.1".into()
    }
    fn default_ship_base_port() -> u16 {
        9999
    }
    fn default_wql_base_port() -> u16 {
        8880
    }
    fn default_http_base_port() -> u16 {
        8888
    }
    fn default_p2p_base_port() -> u16 {
        9876
    }
    fn default_producer_name() -> String {
        "eosio".into()
    }
    fn default_signature_provider() -> String {
        DEV_SIGNATURE_PROVIDER.into()
    }
    fn default_post_start_delay_ms() -> u64 {
        1000
    }
    fn default_poll_interval_ms() -> u64 {
        1000
    }
    fn default_catchup_max_retries() -> u32 {
        60
    }
    fn default_ready_timeout_seconds() -> u64 {
        30
    }
    fn default_relaunch_timeout_seconds() -> u64 {
        10
    }
    fn default_sync_timeout_seconds() -> u64 {
        120
    }
    fn default_produce_timeout_seconds() -> u64 {
        120
    }
}

#[cfg(test)]
impl Config {
    /// Build a config suitable for tests, rooted in a fresh temporary directory.
    ///
    /// Delays are zeroed and polling is tight so that timeouts resolve in milliseconds.
    pub fn new_test() -> Result<(std::sync::Arc<Self>, tempfile::TempDir)> {
        let tmpdir = tempfile::tempdir_in("/tmp").context("error creating tmp dir in /tmp")?;
        let mut config: Config = envy::prefixed(ENV_PREFIX)
            .from_iter(Vec::<(String, String)>::new())
            .context("error building default config")?;
        config.work_dir = tmpdir.path().to_string_lossy().into_owned();
        config.post_start_delay_ms = 0;
        config.stop_grace_seconds = Some(10);
        config.poll_interval_ms = 5;
        config.catchup_max_retries = 10;
        config.ready_timeout_seconds = 1;
        config.relaunch_timeout_seconds = 1;
        config.sync_timeout_seconds = 1;
        config.produce_timeout_seconds = 1;
        Ok((std::sync::Arc::new(config), tmpdir))
    }
}
