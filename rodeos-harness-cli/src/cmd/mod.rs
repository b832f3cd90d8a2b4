//! Harness subcommands.

pub mod run;
pub mod up;

use std::sync::Arc;

use anyhow::{Context, Result};
use rodeos_harness::node::ReplicaSettings;
use rodeos_harness::{ClusterSpec, Config};
use structopt::StructOpt;

/// Options shaping the cluster, shared by every subcommand.
#[derive(StructOpt)]
pub struct ClusterOpts {
    /// The number of ship nodes.
    #[structopt(long, default_value = "1")]
    num_ship: u32,
    /// The number of rodeos replicas.
    #[structopt(long, default_value = "1")]
    num_rodeos: usize,
    /// Connect replicas to ship nodes over unix sockets.
    #[structopt(long)]
    unix_socket: bool,
    /// Enable on-chain execution acceleration in every replica.
    #[structopt(long)]
    enable_oc: bool,
    /// The name of the filter contract replicas run.
    #[structopt(long, default_value = "test.filter")]
    filter_name: String,
    /// The path of the filter contract's wasm.
    #[structopt(long, default_value = "./tests/test_filter.wasm")]
    filter_wasm: String,
    /// Keep logs and working directories even after a successful run.
    #[structopt(long)]
    keep_logs: bool,
    /// Leave the chain nodes running after teardown.
    #[structopt(long)]
    leave_running: bool,
    /// Wipe state left behind by previous runs before launching.
    #[structopt(long)]
    clean_run: bool,
    /// Dump the tail of every captured stderr when the run fails.
    #[structopt(long)]
    dump_error_details: bool,
}

impl ClusterOpts {
    /// Build the cluster spec described by these options.
    pub fn spec(&self) -> ClusterSpec {
        ClusterSpec {
            num_ship: self.num_ship,
            num_rodeos: self.num_rodeos,
            unix_socket: self.unix_socket,
            replica: ReplicaSettings {
                filter_name: self.filter_name.clone(),
                filter_wasm: self.filter_wasm.clone(),
                enable_oc: self.enable_oc,
            },
            keep_logs: self.keep_logs,
            leave_running: self.leave_running,
            clean_run: self.clean_run,
            dump_error_details: self.dump_error_details,
            producer_args: None,
        }
    }
}

/// Load runtime config from the environment.
pub fn load_config() -> Result<Arc<Config>> {
    let config = Config::new().context("error loading harness config")?;
    tracing::debug!(?config, "loaded harness config");
    Ok(Arc::new(config))
}
