//! Lifecycle orchestration and convergence verification for clusters of a block producer,
//! state-history nodes and rodeos replicas.
//!
//! The harness supervises every process of the cluster, wires each replica to a state-history
//! source, and proves that replicas receive a gap-free prefix of the produced block stream.

pub mod cluster;
pub mod config;
#[cfg(test)]
mod config_test;
pub mod error;
#[cfg(test)]
mod fixtures;
pub mod node;
pub mod orchestrator;
pub mod query;
pub mod scenarios;
pub mod supervisor;
#[cfg(test)]
mod supervisor_test;
pub mod topology;
pub mod verifier;

pub use crate::cluster::{BaseCluster, ChainNode, LocalCluster};
pub use crate::config::Config;
pub use crate::error::{ClusterError, ClusterResult};
pub use crate::orchestrator::{ClusterPhase, ClusterSpec, RodeosCluster};
pub use crate::scenarios::{run_scenario, Scenario};
