//! Run a scenario against a fresh cluster.

use anyhow::{bail, Result};
use rodeos_harness::{run_scenario, LocalCluster, Scenario};
use structopt::StructOpt;

use crate::cmd::{load_config, ClusterOpts};

/// Run a scenario against a fresh cluster.
#[derive(StructOpt)]
#[structopt(name = "run")]
pub struct Run {
    /// The scenario to run: basic, replica-restart-clean, replica-restart-warm, ship-restart or
    /// producer-restart.
    #[structopt(short, long, default_value = "basic")]
    scenario: Scenario,
    /// The number of blocks to produce and verify per round.
    #[structopt(short, long, default_value = "30")]
    blocks: u32,
    #[structopt(flatten)]
    cluster: ClusterOpts,
}

impl Run {
    pub async fn run(&self) -> Result<()> {
        let config = load_config()?;
        tracing::info!(scenario = %self.scenario, blocks = self.blocks, "running scenario");
        let base = LocalCluster::new(config.clone());
        let passed = run_scenario(config, self.cluster.spec(), base, self.scenario, self.blocks).await?;
        if !passed {
            bail!("scenario {} failed", self.scenario);
        }
        tracing::info!(scenario = %self.scenario, "scenario passed");
        Ok(())
    }
}
