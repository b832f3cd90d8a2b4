//! Convergence verification.
//!
//! Proving that a replica holds a gap-free prefix of the source's block stream happens in two
//! phases. The catch-up phase polls the replica's cheap `get_info` head counter until it reaches
//! the target, failing softly on timeout. The gap-detection phase then pays for one `get_block`
//! per block, once, over exactly the range which must be contiguous. Any hole or misordered block
//! found there is a hard `StructuralViolation`.

use std::time::Duration;

use crate::error::{ClusterError, ClusterResult};
use crate::query::QueryApi;

/// The shortest pause a timeout-derived policy waits between two attempts.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// A fixed-interval, bounded retry policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// The pause between two attempts.
    pub interval: Duration,
    /// The number of pauses granted before giving up.
    pub max_retries: u32,
}

impl RetryPolicy {
    /// Create a new instance.
    pub fn new(interval: Duration, max_retries: u32) -> Self {
        Self { interval, max_retries }
    }

    /// A policy retrying at `interval` for as long as `timeout` allows.
    ///
    /// The interval is raised to at least `MIN_POLL_INTERVAL`, so that a zero interval still
    /// polls for the whole timeout.
    pub fn within(interval: Duration, timeout: Duration) -> Self {
        let interval = interval.max(MIN_POLL_INTERVAL);
        let retries = u32::try_from(timeout.as_nanos() / interval.as_nanos()).unwrap_or(u32::MAX);
        Self { interval, max_retries: retries }
    }
}

/// The outcome of the catch-up phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CatchUp {
    /// The replica reported a head at or beyond the target.
    Reached { head: u32 },
    /// The retry budget ran out; `last_seen` is the last head the replica reported.
    TimedOut { last_seen: u32 },
}

/// Verifies that replicas converge on the source's block stream.
#[derive(Clone, Copy, Debug)]
pub struct ConvergenceVerifier {
    ready: RetryPolicy,
    catchup: RetryPolicy,
}

impl ConvergenceVerifier {
    /// Create a new instance.
    pub fn new(ready: RetryPolicy, catchup: RetryPolicy) -> Self {
        Self { ready, catchup }
    }

    /// Poll the replica's status until it answers with a well-formed response.
    ///
    /// Returns `false` once the readiness budget is spent, never an error.
    pub async fn wait_until_ready(&self, replica: &dyn QueryApi) -> bool {
        let mut retries = 0;
        loop {
            match replica.get_info().await {
                Ok(info) if info.head_block_num.is_some() => {
                    tracing::debug!(endpoint = replica.endpoint(), head_block_num = ?info.head_block_num, "replica is ready");
                    return true;
                }
                Ok(info) => tracing::debug!(endpoint = replica.endpoint(), ?info, "replica status is not well-formed yet"),
                Err(err) => tracing::debug!(endpoint = replica.endpoint(), error = %err, "replica status is unavailable"),
            }
            if retries >= self.ready.max_retries {
                tracing::warn!(endpoint = replica.endpoint(), retries, "replica did not become ready in time");
                return false;
            }
            tokio::time::sleep(self.ready.interval).await;
            retries += 1;
        }
    }

    /// Poll the replica's reported head until it reaches `target`.
    ///
    /// An unreachable replica counts as no progress. A reachable replica whose status lacks a
    /// head block number is a malformed response and aborts the run.
    pub async fn catch_up(&self, replica: &dyn QueryApi, target: u32) -> ClusterResult<CatchUp> {
        let (mut last_seen, mut retries) = (0, 0);
        loop {
            match replica.get_info().await {
                Ok(info) => {
                    last_seen = info.head(replica.endpoint())?;
                    tracing::info!(endpoint = replica.endpoint(), head_block_num = last_seen, target, "polled replica head");
                    if last_seen >= target {
                        return Ok(CatchUp::Reached { head: last_seen });
                    }
                }
                Err(err @ ClusterError::Query { .. }) => {
                    tracing::warn!(endpoint = replica.endpoint(), error = %err, last_seen, "replica status is unavailable");
                }
                Err(err) => return Err(err),
            }
            if retries >= self.catchup.max_retries {
                tracing::warn!(
                    endpoint = replica.endpoint(),
                    target,
                    last_seen,
                    retries,
                    "replica did not receive block {} in time, only block {} received",
                    target,
                    last_seen
                );
                return Ok(CatchUp::TimedOut { last_seen });
            }
            tokio::time::sleep(self.catchup.interval).await;
            retries += 1;
        }
    }

    /// Verify that the replica has received blocks up to `target` without any gap.
    ///
    /// Returns `Ok(false)` if the replica did not catch up in time. Returns a
    /// `StructuralViolation` if the replica holds no block in `[1, target]`, or if any block
    /// from the first materialized one up to `target` is missing or reports another number.
    pub async fn verify_contiguous_receipt(&self, replica: &dyn QueryApi, target: u32) -> ClusterResult<bool> {
        if target == 0 {
            return Err(ClusterError::InvalidInput("target block count must be at least 1".into()));
        }
        tracing::info!(endpoint = replica.endpoint(), target, "verifying blocks were received by replica");
        match self.catch_up(replica, target).await? {
            CatchUp::Reached { .. } => tracing::info!(endpoint = replica.endpoint(), target, "blocks have been received"),
            CatchUp::TimedOut { .. } => return Ok(false),
        }

        let first_seen = first_materialized(replica, target).await?;
        tracing::info!(endpoint = replica.endpoint(), first_seen, "verifying blocks were not skipped");
        for block_num in first_seen..=target {
            let block = replica.get_block(block_num).await?;
            match block.block_num {
                Some(found) if found == block_num => (),
                Some(found) => {
                    return Err(ClusterError::StructuralViolation(format!(
                        "{} responded with block {} when asked for block {}",
                        replica.endpoint(),
                        found,
                        block_num
                    )))
                }
                None => {
                    return Err(ClusterError::StructuralViolation(format!(
                        "{} is missing block {} within the contiguous range [{}, {}]",
                        replica.endpoint(),
                        block_num,
                        first_seen,
                        target
                    )))
                }
            }
        }
        tracing::info!(endpoint = replica.endpoint(), first_seen, target, "no blocks were skipped");
        Ok(true)
    }
}

/// Find the first block in `[1, target]` which the replica has materialized.
///
/// Leading absent blocks are tolerated, as replicas may prune below a retention window.
async fn first_materialized(replica: &dyn QueryApi, target: u32) -> ClusterResult<u32> {
    for block_num in 1..=target {
        if replica.get_block(block_num).await?.block_num.is_some() {
            tracing::debug!(endpoint = replica.endpoint(), first_seen = block_num, "found first materialized block");
            return Ok(block_num);
        }
    }
    Err(ClusterError::StructuralViolation(format!(
        "{} holds no block within [1, {}]",
        replica.endpoint(),
        target
    )))
}
