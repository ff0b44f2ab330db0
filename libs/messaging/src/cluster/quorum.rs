//! # Reload Coordination
//!
//! Quorum-aware gate in front of a site reload: a jittered delay avoids
//! every node reloading in lockstep, then the cluster-state map is polled
//! until enough peers report the site as started. The gate is best-effort by
//! design — reaching the maximum wait is logged loudly and treated as
//! success, never as an error.

use crate::cluster::state::ClusterState;
use crate::config::ReloadConfig;
use rand::Rng;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Minimum number of nodes that must report a site as started before a
/// reload proceeds. Small clusters require every node; larger clusters
/// require a majority plus one.
pub fn min_active_nodes(total: usize) -> usize {
    if total <= 3 {
        total
    } else {
        (total + 1) / 2 + 1
    }
}

/// Random delay drawn uniformly from `[max_delay, 2 * max_delay)`.
pub fn jittered_delay(max_delay: Duration) -> Duration {
    let max_ms = max_delay.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(max_ms..max_ms * 2))
}

/// Outcome of a quorum wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuorumOutcome {
    /// Enough nodes reported the site as started
    Reached { active: usize, required: usize },
    /// The maximum wait elapsed; processing proceeds regardless
    TimedOut { active: usize, required: usize },
}

impl QuorumOutcome {
    pub fn reached(&self) -> bool {
        matches!(self, QuorumOutcome::Reached { .. })
    }
}

/// Poll the cluster-state map until quorum for `site_name` is reached or the
/// configured maximum wait elapses. Blocks the calling event-handling task,
/// never a request-serving one; the only cancellation is process shutdown.
pub async fn await_site_quorum(
    cluster: &ClusterState,
    site_name: &str,
    settings: &ReloadConfig,
) -> QuorumOutcome {
    let required = min_active_nodes(cluster.node_count());
    let poll_interval = Duration::from_millis(settings.poll_interval_ms);
    let deadline = Instant::now() + Duration::from_millis(settings.max_wait_ms);

    loop {
        let active = cluster.started_count(site_name);
        if active >= required {
            info!(
                site = site_name,
                active, required, "quorum reached, proceeding with reload"
            );
            return QuorumOutcome::Reached { active, required };
        }
        if Instant::now() >= deadline {
            warn!(
                site = site_name,
                active,
                required,
                max_wait_ms = settings.max_wait_ms,
                "quorum wait elapsed, proceeding with reload anyway"
            );
            return QuorumOutcome::TimedOut { active, required };
        }
        debug!(
            site = site_name,
            active, required, "waiting for site quorum"
        );
        tokio::time::sleep(poll_interval).await;
    }
}
