//! Per-tick capacity aggregation.
//!
//! Capacity prefers what runners report about themselves (the Docker-visible
//! cgroup) over the node allocatable; the node fallback keeps freshly
//! provisioned nodes counted before their runner registers. Units are
//! fractional cores and GiB throughout.

use std::collections::HashSet;

use crate::scaler::snapshot::ClusterState;

/// Aggregate pool metrics derived once per tick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoolMetrics {
    pub total_cpu_capacity: f32,
    pub total_memory_capacity: f32,
    pub total_allocated_cpu: f32,
    pub total_allocated_memory: f32,
    pub total_available_cpu: f32,
    pub total_available_memory: f32,
    pub avg_cpu_per_node: f32,
    pub avg_memory_per_node: f32,
    pub idle_runners: usize,
    pub nascent_nodes: usize,
    pub schedulable_nodes: usize,
}

/// Compute pool metrics from a snapshot.
pub fn aggregate(state: &ClusterState) -> PoolMetrics {
    let mut metrics = PoolMetrics::default();

    // Capacity from schedulable runners, remembering which nodes they cover.
    let mut nodes_with_runners: HashSet<&str> = HashSet::new();
    for runner in state.runners.iter().filter(|r| !r.unschedulable) {
        metrics.total_cpu_capacity += runner.cpu_capacity;
        metrics.total_memory_capacity += runner.memory_capacity;
        if let Some(node) = state.node_for_address(&runner.domain) {
            nodes_with_runners.insert(node.name.as_str());
        }
    }

    // Node allocatable stands in for schedulable nodes without a runner.
    for node in state.nodes.iter().filter(|n| !n.unschedulable) {
        if !nodes_with_runners.contains(node.name.as_str()) {
            metrics.total_cpu_capacity += node.allocatable_cpu;
            metrics.total_memory_capacity += node.allocatable_memory;
        }
    }

    // Idle and Deletable runners hold nothing by definition.
    for runner in state.runners.iter().filter(|r| r.is_active()) {
        metrics.total_allocated_cpu += runner.allocated_cpu;
        metrics.total_allocated_memory += runner.allocated_memory;
    }

    metrics.total_available_cpu = metrics.total_cpu_capacity - metrics.total_allocated_cpu;
    metrics.total_available_memory =
        metrics.total_memory_capacity - metrics.total_allocated_memory;

    let schedulable_nodes = state.nodes.iter().filter(|n| !n.unschedulable).count();
    metrics.schedulable_nodes = schedulable_nodes;
    if schedulable_nodes > 0 {
        metrics.avg_cpu_per_node = metrics.total_cpu_capacity / schedulable_nodes as f32;
        metrics.avg_memory_per_node = metrics.total_memory_capacity / schedulable_nodes as f32;
    }

    metrics.idle_runners = state.idle_runners().count();
    metrics.nascent_nodes = state.nascent_nodes().len();
    metrics
}
