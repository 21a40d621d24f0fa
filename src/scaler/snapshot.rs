//! Cluster snapshot collection and classification.
//!
//! One snapshot per tick: the runner registry, the node inventory, and the
//! placeholder pods are fetched together and joined into a `ClusterState`
//! carrying the indexes the aggregation and scale paths work from. A failed
//! fetch aborts the tick; partial state is never published.

use std::collections::{HashMap, HashSet};

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::{Api, ListParams};

use crate::api::{ApiClient, Runner};
use crate::config::{PLACEHOLDER_APP_LABEL, RUNNER_NODE_LABEL};

/// A node as the scaler sees it: schedulability, addresses, allocatable.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub name: String,
    pub unschedulable: bool,
    pub addresses: Vec<String>,
    /// Allocatable CPU in cores.
    pub allocatable_cpu: f32,
    /// Allocatable memory in GiB.
    pub allocatable_memory: f32,
}

/// A placeholder pod. Pending until the scheduler assigns it a node.
#[derive(Debug, Clone)]
pub struct PlaceholderPod {
    pub name: String,
    pub node_name: Option<String>,
}

impl PlaceholderPod {
    pub fn is_pending(&self) -> bool {
        self.node_name.is_none()
    }

    pub fn is_scheduled(&self) -> bool {
        self.node_name.is_some()
    }
}

/// Joined view of the three sources of truth for one tick.
pub struct ClusterState {
    pub runners: Vec<Runner>,
    pub nodes: Vec<NodeInfo>,
    pub placeholders: Vec<PlaceholderPod>,
    runner_by_domain: HashMap<String, usize>,
    node_by_ip: HashMap<String, usize>,
    /// Names of nodes that have a registered runner, resolved through the
    /// address index over all runners.
    nodes_with_runners: HashSet<String>,
}

impl ClusterState {
    pub fn build(
        runners: Vec<Runner>,
        nodes: Vec<NodeInfo>,
        placeholders: Vec<PlaceholderPod>,
    ) -> Self {
        let mut runner_by_domain = HashMap::new();
        for (i, runner) in runners.iter().enumerate() {
            if runner.domain.is_empty() {
                continue;
            }
            runner_by_domain.insert(runner.domain.clone(), i);
        }

        let mut node_by_ip = HashMap::new();
        for (i, node) in nodes.iter().enumerate() {
            for address in &node.addresses {
                if address.is_empty() {
                    continue;
                }
                node_by_ip.insert(address.clone(), i);
            }
        }

        let mut nodes_with_runners = HashSet::new();
        for runner in &runners {
            if let Some(&i) = node_by_ip.get(&runner.domain) {
                nodes_with_runners.insert(nodes[i].name.clone());
            }
        }

        Self {
            runners,
            nodes,
            placeholders,
            runner_by_domain,
            node_by_ip,
            nodes_with_runners,
        }
    }

    pub fn runner_for_domain(&self, domain: &str) -> Option<&Runner> {
        self.runner_by_domain.get(domain).map(|&i| &self.runners[i])
    }

    pub fn node_for_address(&self, address: &str) -> Option<&NodeInfo> {
        self.node_by_ip.get(address).map(|&i| &self.nodes[i])
    }

    /// Whether any runner has registered from this node.
    pub fn has_runner_on(&self, node_name: &str) -> bool {
        self.nodes_with_runners.contains(node_name)
    }

    pub fn idle_runners(&self) -> impl Iterator<Item = &Runner> {
        self.runners.iter().filter(|r| r.is_idle())
    }

    pub fn deletable_runners(&self) -> impl Iterator<Item = &Runner> {
        self.runners.iter().filter(|r| r.is_deletable())
    }

    pub fn pending_placeholders(&self) -> impl Iterator<Item = &PlaceholderPod> {
        self.placeholders.iter().filter(|p| p.is_pending())
    }

    /// Schedulable nodes that host a scheduled placeholder but have no
    /// registered runner: provisioned, agent not yet up.
    pub fn nascent_nodes(&self) -> Vec<&NodeInfo> {
        let hosting: HashSet<&str> = self
            .placeholders
            .iter()
            .filter_map(|p| p.node_name.as_deref())
            .collect();
        self.nodes
            .iter()
            .filter(|n| {
                !n.unschedulable
                    && hosting.contains(n.name.as_str())
                    && !self.nodes_with_runners.contains(&n.name)
            })
            .collect()
    }
}

/// Parse a Kubernetes CPU quantity into fractional cores.
pub fn parse_cpu_quantity(quantity: &Quantity) -> f32 {
    let raw = quantity.0.trim();
    if let Some(milli) = raw.strip_suffix('m') {
        milli.parse::<f32>().unwrap_or(0.0) / 1000.0
    } else {
        raw.parse::<f32>().unwrap_or(0.0)
    }
}

/// Parse a Kubernetes memory quantity into GiB.
pub fn parse_memory_quantity(quantity: &Quantity) -> f32 {
    const GIB: f64 = (1u64 << 30) as f64;
    let raw = quantity.0.trim();
    let (digits, factor) = if let Some(v) = raw.strip_suffix("Ki") {
        (v, 1024.0)
    } else if let Some(v) = raw.strip_suffix("Mi") {
        (v, 1024.0 * 1024.0)
    } else if let Some(v) = raw.strip_suffix("Gi") {
        (v, GIB)
    } else if let Some(v) = raw.strip_suffix("Ti") {
        (v, 1024.0 * GIB)
    } else if let Some(v) = raw.strip_suffix('k') {
        (v, 1e3)
    } else if let Some(v) = raw.strip_suffix('M') {
        (v, 1e6)
    } else if let Some(v) = raw.strip_suffix('G') {
        (v, 1e9)
    } else if let Some(v) = raw.strip_suffix('T') {
        (v, 1e12)
    } else {
        (raw, 1.0)
    };
    let bytes = digits.parse::<f64>().unwrap_or(0.0) * factor;
    (bytes / GIB) as f32
}

fn node_info(node: &Node) -> Option<NodeInfo> {
    let name = node.metadata.name.clone()?;
    let unschedulable = node
        .spec
        .as_ref()
        .and_then(|s| s.unschedulable)
        .unwrap_or(false);
    let status = node.status.as_ref();
    let addresses = status
        .and_then(|s| s.addresses.as_ref())
        .map(|list| list.iter().map(|a| a.address.clone()).collect())
        .unwrap_or_default();
    let allocatable = status.and_then(|s| s.allocatable.as_ref());
    let allocatable_cpu = allocatable
        .and_then(|m| m.get("cpu"))
        .map(parse_cpu_quantity)
        .unwrap_or(0.0);
    let allocatable_memory = allocatable
        .and_then(|m| m.get("memory"))
        .map(parse_memory_quantity)
        .unwrap_or(0.0);
    Some(NodeInfo {
        name,
        unschedulable,
        addresses,
        allocatable_cpu,
        allocatable_memory,
    })
}

fn placeholder_info(pod: &Pod) -> Option<PlaceholderPod> {
    let name = pod.metadata.name.clone()?;
    let node_name = pod
        .spec
        .as_ref()
        .and_then(|s| s.node_name.clone())
        .filter(|n| !n.is_empty());
    Some(PlaceholderPod { name, node_name })
}

/// Fetches the three inputs of a tick and joins them.
pub struct SnapshotCollector {
    api: ApiClient,
    region_id: String,
    pods: Api<Pod>,
    nodes: Api<Node>,
}

impl SnapshotCollector {
    pub fn new(api: ApiClient, client: kube::Client, namespace: &str, region_id: &str) -> Self {
        Self {
            api,
            region_id: region_id.to_string(),
            pods: Api::namespaced(client.clone(), namespace),
            nodes: Api::all(client),
        }
    }

    pub async fn snapshot(&self) -> Result<ClusterState> {
        let pod_params =
            ListParams::default().labels(&format!("app={PLACEHOLDER_APP_LABEL}"));
        let node_params = ListParams::default().labels(&format!("{RUNNER_NODE_LABEL}=true"));

        let (runners, pods, nodes) = tokio::join!(
            self.api.list_runners(&self.region_id),
            self.pods.list(&pod_params),
            self.nodes.list(&node_params),
        );
        let runners = runners.context("listing runners")?;
        let pods = pods.context("listing placeholder pods")?;
        let nodes = nodes.context("listing runner nodes")?;

        let nodes = nodes.items.iter().filter_map(node_info).collect();
        let placeholders = pods.items.iter().filter_map(placeholder_info).collect();
        Ok(ClusterState::build(runners, nodes, placeholders))
    }
}
