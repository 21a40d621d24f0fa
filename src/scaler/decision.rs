//! Scale-up decision logic.
//!
//! A pure function of the tick's metrics, the pending placeholder count, and
//! the configured policy. Pending placeholders absorb the deficit first so a
//! scale-up already in flight is not re-ordered while the node autoscaler is
//! still provisioning.

use crate::scaler::metrics::PoolMetrics;

/// Scale thresholds, validated at startup.
#[derive(Debug, Clone)]
pub struct ScalePolicy {
    pub max_utilization_percent: f32,
    pub min_idle_runners: usize,
    pub min_idle_cpu: f32,
    pub min_idle_memory: f32,
}

/// Outcome of evaluating one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScalePlan {
    /// Whether any scale-up predicate fired. When true the tick belongs to
    /// scale-up even if pending placeholders absorb the whole deficit.
    pub scale_up: bool,
    pub nodes_needed: u32,
    pub pods_to_create: u32,
}

impl ScalePlan {
    pub fn evaluate(
        metrics: &PoolMetrics,
        pending_placeholders: usize,
        policy: &ScalePolicy,
    ) -> Self {
        let utilization_high = (metrics.total_cpu_capacity > 0.0
            && 100.0 * metrics.total_allocated_cpu / metrics.total_cpu_capacity
                > policy.max_utilization_percent)
            || (metrics.total_memory_capacity > 0.0
                && 100.0 * metrics.total_allocated_memory / metrics.total_memory_capacity
                    > policy.max_utilization_percent);

        let idle_pool = metrics.idle_runners + metrics.nascent_nodes;
        let idle_buffer_low = idle_pool < policy.min_idle_runners;
        let cpu_idle_low = metrics.total_available_cpu < policy.min_idle_cpu;
        let memory_idle_low = metrics.total_available_memory < policy.min_idle_memory;

        if !(utilization_high || idle_buffer_low || cpu_idle_low || memory_idle_low) {
            return Self::default();
        }

        let mut nodes_needed: u32 = 0;
        if cpu_idle_low && metrics.avg_cpu_per_node > 0.0 {
            let deficit = (policy.min_idle_cpu - metrics.total_available_cpu)
                / metrics.avg_cpu_per_node;
            nodes_needed = nodes_needed.max(deficit.ceil() as u32);
        }
        if memory_idle_low && metrics.avg_memory_per_node > 0.0 {
            let deficit = (policy.min_idle_memory - metrics.total_available_memory)
                / metrics.avg_memory_per_node;
            nodes_needed = nodes_needed.max(deficit.ceil() as u32);
        }
        if idle_buffer_low {
            nodes_needed = nodes_needed.max((policy.min_idle_runners - idle_pool) as u32);
        }
        if utilization_high && nodes_needed == 0 {
            nodes_needed = 1;
        }

        Self {
            scale_up: true,
            nodes_needed,
            pods_to_create: nodes_needed.saturating_sub(pending_placeholders as u32),
        }
    }
}
