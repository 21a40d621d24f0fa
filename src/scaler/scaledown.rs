//! Scale-down candidate filtering.
//!
//! Each Deletable runner is checked as if it were removed alone against the
//! pre-tick availability; the totals are intentionally not updated across
//! candidates. This rejects more than strictly necessary but can never drop
//! headroom below the configured minimums.

use std::collections::HashSet;

use log::{info, warn};

use crate::scaler::decision::ScalePolicy;
use crate::scaler::metrics::PoolMetrics;
use crate::scaler::snapshot::ClusterState;

/// Pick the placeholder pods whose nodes can safely be released.
///
/// Candidates are processed in snapshot order, first fit. Returns the names
/// of the scheduled placeholder pods to delete; downstream reconcilers drain
/// the freed nodes.
pub fn plan_scale_down(
    state: &ClusterState,
    metrics: &PoolMetrics,
    policy: &ScalePolicy,
) -> Vec<String> {
    let mut victims = Vec::new();
    let mut claimed: HashSet<&str> = HashSet::new();

    for runner in state.deletable_runners() {
        let Some(node) = state.node_for_address(&runner.domain) else {
            warn!(
                "runner {} resolves to no node (domain '{}'), skipping scale-down",
                runner.id, runner.domain
            );
            continue;
        };

        let cpu_after = metrics.total_available_cpu - node.allocatable_cpu;
        let memory_after = metrics.total_available_memory - node.allocatable_memory;
        if cpu_after < policy.min_idle_cpu || memory_after < policy.min_idle_memory {
            info!(
                "keeping runner {}: removing node {} would leave cpu={:.2} mem={:.2}",
                runner.id, node.name, cpu_after, memory_after
            );
            continue;
        }

        let placeholder = state.placeholders.iter().find(|p| {
            p.node_name.as_deref() == Some(node.name.as_str())
                && !claimed.contains(p.name.as_str())
        });
        match placeholder {
            Some(pod) => {
                claimed.insert(pod.name.as_str());
                info!(
                    "runner {} on node {} is safe to remove, releasing placeholder {}",
                    runner.id, node.name, pod.name
                );
                victims.push(pod.name.clone());
            }
            None => {
                warn!(
                    "no scheduled placeholder on node {} for deletable runner {}",
                    node.name, runner.id
                );
            }
        }
    }

    victims
}
