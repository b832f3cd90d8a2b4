//! Stand a cluster up and hold it until ctrl-c.

use anyhow::{Context, Result};
use rodeos_harness::{LocalCluster, RodeosCluster};
use structopt::StructOpt;

use crate::cmd::{load_config, ClusterOpts};

/// Stand a cluster up and hold it until ctrl-c.
#[derive(StructOpt)]
#[structopt(name = "up")]
pub struct Up {
    #[structopt(flatten)]
    cluster: ClusterOpts,
}

impl Up {
    pub async fn run(&self) -> Result<()> {
        let config = load_config()?;
        let base = LocalCluster::new(config.clone());
        let mut cluster = RodeosCluster::new(config, self.cluster.spec(), base).await?;

        // The first producer restart enables block production.
        let res = match cluster.setup().await {
            Ok(()) => cluster.restart_producer(false).await,
            Err(err) => Err(err),
        };
        if let Err(err) = res {
            tracing::error!(error = ?err, "error standing up cluster");
            cluster.teardown().await.context("error tearing down cluster")?;
            return Err(err.into());
        }

        tracing::info!("cluster is up, press ctrl-c to tear it down");
        let _ = tokio::signal::ctrl_c().await;
        cluster.set_test_successful(true);
        cluster.teardown().await.context("error tearing down cluster")?;
        Ok(())
    }
}
