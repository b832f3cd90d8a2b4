//! Canned end-to-end scenarios.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::cluster::BaseCluster;
use crate::config::Config;
use crate::error::{ClusterError, ClusterResult};
use crate::orchestrator::{ClusterSpec, RodeosCluster};
use crate::supervisor::StopSignal;

/// A scenario driven against a freshly stood up cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scenario {
    /// Produce blocks and verify every replica received them.
    Basic,
    /// Clean restart every replica between two rounds of production.
    ReplicaRestartClean,
    /// Interrupt and warm restart every replica between two rounds of production.
    ReplicaRestartWarm,
    /// Interrupt and warm restart every ship node between two rounds of production.
    ShipRestart,
    /// Interrupt and warm restart the producer between two rounds of production.
    ProducerRestart,
}

impl Scenario {
    /// Every scenario, in the order they are listed to users.
    pub const ALL: [Scenario; 5] = [
        Self::Basic,
        Self::ReplicaRestartClean,
        Self::ReplicaRestartWarm,
        Self::ShipRestart,
        Self::ProducerRestart,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Basic => "basic",
            Self::ReplicaRestartClean => "replica-restart-clean",
            Self::ReplicaRestartWarm => "replica-restart-warm",
            Self::ShipRestart => "ship-restart",
            Self::ProducerRestart => "producer-restart",
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Scenario {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|scenario| scenario.name() == s)
            .ok_or_else(|| ClusterError::InvalidInput(format!("unknown scenario {}", s)))
    }
}

/// Stand a cluster up, drive the given scenario against it and tear it down again.
///
/// Returns `Ok(false)` when a bounded wait timed out. The run is only marked successful when the
/// scenario returned `Ok(true)`, and teardown happens no matter how the scenario ended.
#[tracing::instrument(level = "info", skip(config, spec, base))]
pub async fn run_scenario<C: BaseCluster>(config: Arc<Config>, spec: ClusterSpec, base: C, scenario: Scenario, num_blocks: u32) -> ClusterResult<bool> {
    if num_blocks == 0 {
        return Err(ClusterError::InvalidInput("a scenario needs at least one block".into()));
    }
    let mut cluster = RodeosCluster::new(config, spec, base).await?;
    let res = drive(&mut cluster, scenario, num_blocks).await;
    cluster.set_test_successful(matches!(res, Ok(true)));
    let teardown = cluster.teardown().await;

    let passed = res?;
    if let Err(err) = teardown {
        tracing::error!(error = ?err, "error tearing down cluster");
        if err.is_fatal() {
            return Err(err);
        }
    }
    tracing::info!(passed, "scenario finished");
    Ok(passed)
}

async fn drive<C: BaseCluster>(cluster: &mut RodeosCluster<C>, scenario: Scenario, num_blocks: u32) -> ClusterResult<bool> {
    cluster.setup().await?;
    // The first producer restart enables block production.
    cluster.restart_producer(false).await?;
    if !produce_and_verify(cluster, num_blocks).await? {
        return Ok(false);
    }

    match scenario {
        Scenario::Basic => return Ok(true),
        Scenario::ReplicaRestartClean => {
            for replica in 0..cluster.num_replicas() {
                cluster.restart_replica(replica, None, true).await?;
            }
        }
        Scenario::ReplicaRestartWarm => {
            for replica in 0..cluster.num_replicas() {
                cluster.stop_replica(replica, StopSignal::Interrupt).await?;
                cluster.restart_replica(replica, None, false).await?;
            }
        }
        Scenario::ShipRestart => {
            let ships: Vec<_> = cluster.ship_ids().collect();
            for ship in ships {
                cluster.stop_ship(ship, StopSignal::Interrupt).await?;
                cluster.restart_ship(ship, false).await?;
            }
            // Replicas lose their stream when a ship goes away.
            for replica in 0..cluster.num_replicas() {
                cluster.restart_replica(replica, None, false).await?;
            }
        }
        Scenario::ProducerRestart => {
            cluster.stop_producer(StopSignal::Interrupt).await?;
            cluster.restart_producer(false).await?;
        }
    }

    produce_and_verify(cluster, num_blocks * 2).await
}

/// Wait for the producer to reach `target`, then verify every replica received it.
async fn produce_and_verify<C: BaseCluster>(cluster: &RodeosCluster<C>, target: u32) -> ClusterResult<bool> {
    if !cluster.produce_blocks(target).await? {
        tracing::warn!(target, "producer did not produce blocks in time");
        return Ok(false);
    }
    for replica in 0..cluster.num_replicas() {
        if !cluster.wait_replica_ready(replica).await? {
            tracing::warn!(replica, "replica did not become ready");
            return Ok(false);
        }
        if !cluster.verify_contiguous_receipt(replica, target).await? {
            return Ok(false);
        }
    }
    Ok(true)
}
