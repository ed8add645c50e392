//! Nimbus node CIDR allocator: reads each node's backing cloud instance,
//! derives the pod CIDR set for the cluster stack, and patches the node
//! with CIDRs, multi-network annotations and the network condition.

#![forbid(unsafe_code)]

pub mod ranges;
pub mod topology;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use k8s_openapi::api::core::v1::{Node, NodeCondition};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use metrics::{counter, gauge, histogram};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use nimbus_cloud::Compute;
use nimbus_core::cidr;
use nimbus_core::provider::ProviderId;
use nimbus_core::{
    Error, Result, StackType, MULTI_NETWORK_ANNOTATION, NODE_NETWORKS_ANNOTATION,
    NORTH_INTERFACES_ANNOTATION,
};
use nimbus_hub::api::{Apis, EventSeverity};
use nimbus_hub::{CacheEvent, NodeView, SharedCache};
use nimbus_queue::{run_workers, WorkQueue};

use ranges::{GkeNetworkParamSet, Network};

const NETWORK_UNAVAILABLE: &str = "NetworkUnavailable";
const REASON_CIDR_ASSIGNED: &str = "CidrAssigned";

pub const EVENT_CIDR_NOT_AVAILABLE: &str = "CIDRNotAvailable";
pub const EVENT_CIDR_ASSIGNMENT_FAILED: &str = "CIDRAssignmentFailed";
pub const EVENT_INSTANCE_NOT_FOUND: &str = "InstanceNotFound";

pub struct CidrAllocator {
    nodes: NodeView,
    compute: Arc<dyn Compute>,
    apis: Apis,
    networks: Arc<SharedCache<Network>>,
    param_sets: Arc<SharedCache<GkeNetworkParamSet>>,
    stack: StackType,
    project: String,
    multi_project: bool,
}

impl CidrAllocator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        nodes: NodeView,
        compute: Arc<dyn Compute>,
        apis: Apis,
        networks: Arc<SharedCache<Network>>,
        param_sets: Arc<SharedCache<GkeNetworkParamSet>>,
        stack: StackType,
        project: &str,
        multi_project: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            nodes,
            compute,
            apis,
            networks,
            param_sets,
            stack,
            project: project.to_string(),
            multi_project,
        })
    }

    /// Drive the allocator until the tenant context is cancelled.
    pub async fn run(self: Arc<Self>, ctx: CancellationToken, workers: usize) {
        let queue = WorkQueue::with_default_limiter("cidr_allocator");
        let handler = {
            let queue = Arc::clone(&queue);
            self.nodes.register(move |ev| {
                if let CacheEvent::Applied { new, .. } = ev {
                    queue.enqueue(None, new.metadata.name.as_deref());
                }
            })
        };

        tokio::select! {
            _ = ctx.cancelled() => return,
            _ = self.nodes.wait_synced() => {}
        }
        for node in self.nodes.list() {
            queue.enqueue(None, node.metadata.name.as_deref());
        }

        let this = Arc::clone(&self);
        let pool = run_workers(
            Arc::clone(&queue),
            workers,
            Arc::new(move |key| {
                let this = Arc::clone(&this);
                Box::pin(async move { this.sync(&key).await })
            }),
        );
        info!(tenant = self.nodes.tenant(), "cidr allocator running");
        ctx.cancelled().await;
        pool.shutdown().await;
        handler.release();
    }

    /// Sync one node; records outcome metrics and the failure event.
    pub async fn sync(&self, key: &str) -> Result<()> {
        let t0 = Instant::now();
        let res = self.sync_node(key).await;
        match &res {
            Ok(()) => counter!("cidr_allocation_total", 1u64, "outcome" => "success"),
            Err(e) => {
                counter!("cidr_allocation_total", 1u64, "outcome" => "error");
                self.apis
                    .events
                    .record("Node", key, EventSeverity::Warning, EVENT_CIDR_ASSIGNMENT_FAILED, &e.to_string())
                    .await;
            }
        }
        histogram!("cidr_allocation_seconds", t0.elapsed().as_secs_f64());
        res
    }

    async fn sync_node(&self, key: &str) -> Result<()> {
        // Gone from the cache (or not ours): nothing to do.
        let Some(node) = self.nodes.get(key) else {
            return Ok(());
        };
        let provider_id = node
            .spec
            .as_ref()
            .and_then(|s| s.provider_id.as_deref())
            .unwrap_or("");
        if provider_id.is_empty() {
            return Err(Error::Transient(format!("node {} has no provider id yet", key)));
        }
        let pid = ProviderId::parse(provider_id)?;
        let project = if self.multi_project { pid.project.as_str() } else { self.project.as_str() };

        let instance = self
            .compute
            .instance(project, &pid.zone, &pid.instance)
            .await
            .map_err(Error::from)?;
        let Some(instance) = instance else {
            let msg = format!("instance {} not found in zone {}", pid.instance, pid.zone);
            self.apis
                .events
                .record("Node", key, EventSeverity::Warning, EVENT_INSTANCE_NOT_FOUND, &msg)
                .await;
            return Err(Error::Transient(msg));
        };

        if ranges::has_no_ranges(&instance) {
            self.apis
                .events
                .record(
                    "Node",
                    key,
                    EventSeverity::Warning,
                    EVENT_CIDR_NOT_AVAILABLE,
                    "instance carries no alias ranges and no IPv6 address",
                )
                .await;
            return Err(Error::Transient(format!("no pod ranges available for {}", key)));
        }

        let mut annotations: BTreeMap<String, String> = BTreeMap::new();
        let mut capacity: BTreeMap<String, String> = BTreeMap::new();
        let mut pod_cidrs = if ranges::is_multi_network(&instance) {
            let networks = self.networks.list();
            let alloc =
                ranges::match_networks(&instance, &networks, |name| self.param_sets.get(name));
            if !alloc.networks.is_empty() {
                annotations.insert(
                    NORTH_INTERFACES_ANNOTATION.to_string(),
                    serde_json::to_string(&alloc.north_interfaces)
                        .map_err(|e| Error::Parse(e.to_string()))?,
                );
                annotations.insert(
                    MULTI_NETWORK_ANNOTATION.to_string(),
                    serde_json::to_string(&alloc.networks)
                        .map_err(|e| Error::Parse(e.to_string()))?,
                );
                annotations.insert(
                    NODE_NETWORKS_ANNOTATION.to_string(),
                    alloc.networks.iter().map(|n| n.name.as_str()).collect::<Vec<_>>().join(","),
                );
                for network in &alloc.networks {
                    if let Some(first) = network.cidrs.first() {
                        capacity.insert(
                            format!("networking.gke.io.networks/{}.IP", network.name),
                            cidr_host_count(first).to_string(),
                        );
                    }
                }
            }
            ranges::stack_cidrs(self.stack, &alloc.default_ranges)?
        } else {
            let Some(ifc) = instance.network_interfaces.first() else {
                return Err(Error::Transient(format!("instance for {} has no interfaces", key)));
            };
            ranges::stack_cidrs(self.stack, &ranges::interface_ranges(ifc))?
        };

        if pod_cidrs.len() > 2 {
            warn!(node = key, count = pod_cidrs.len(), "truncating pod CIDRs to two entries");
            pod_cidrs.truncate(2);
        }
        cidr::validate_pod_cidrs(&pod_cidrs)?;

        if !same_cidr_list(&current_pod_cidrs(&node), &pod_cidrs) {
            self.apis
                .nodes
                .patch(key, json!({ "spec": { "podCIDR": pod_cidrs[0], "podCIDRs": pod_cidrs } }))
                .await?;
        }

        if annotations_changed(&node, &annotations) {
            self.apis
                .nodes
                .patch(key, json!({ "metadata": { "annotations": annotations } }))
                .await?;
        }

        if capacity_changed(&node, &capacity) {
            self.apis
                .nodes
                .patch_status(key, json!({ "status": { "capacity": capacity } }))
                .await?;
        }

        if let Some(patch) = network_ready_patch(&node) {
            self.apis.nodes.patch_status(key, patch).await?;
        }

        self.export_network_gauges();
        Ok(())
    }

    /// Multi-network node counts, from the live view.
    fn export_network_gauges(&self) {
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for node in self.nodes.list() {
            let Some(names) = node.label_annotation(NODE_NETWORKS_ANNOTATION) else {
                continue;
            };
            for name in names.split(',').filter(|n| !n.is_empty()) {
                *counts.entry(name.to_string()).or_default() += 1;
            }
        }
        for (network, count) in counts {
            gauge!("multinetwork_nodes", count as f64, "network" => network);
        }
    }
}

trait NodeAnnotations {
    fn label_annotation(&self, key: &str) -> Option<&str>;
}

impl NodeAnnotations for Node {
    fn label_annotation(&self, key: &str) -> Option<&str> {
        self.metadata.annotations.as_ref()?.get(key).map(String::as_str)
    }
}

fn current_pod_cidrs(node: &Node) -> Vec<String> {
    let spec = node.spec.as_ref();
    let cidrs = spec.and_then(|s| s.pod_cidrs.clone()).unwrap_or_default();
    if !cidrs.is_empty() {
        return cidrs;
    }
    spec.and_then(|s| s.pod_cidr.clone()).into_iter().collect()
}

fn same_cidr_list(a: &[String], b: &[String]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| cidr::cidrs_equal(x, y))
}

fn annotations_changed(node: &Node, desired: &BTreeMap<String, String>) -> bool {
    let current = node.metadata.annotations.as_ref();
    desired
        .iter()
        .any(|(k, v)| current.and_then(|a| a.get(k)) != Some(v))
}

fn capacity_changed(node: &Node, desired: &BTreeMap<String, String>) -> bool {
    let current = node.status.as_ref().and_then(|s| s.capacity.as_ref());
    desired
        .iter()
        .any(|(k, v)| current.and_then(|c| c.get(k)).map(|q| q.0.as_str()) != Some(v.as_str()))
}

/// Condition patch setting `NetworkUnavailable=False`. `None` when the
/// condition is already False, which keeps `LastTransitionTime` intact
/// and makes the write happen exactly once per allocation.
fn network_ready_patch(node: &Node) -> Option<Value> {
    let already_false = node
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|cs| cs.iter().find(|c| c.type_ == NETWORK_UNAVAILABLE))
        .is_some_and(|c| c.status == "False");
    if already_false {
        return None;
    }
    let now = Time(chrono::Utc::now());
    let condition = NodeCondition {
        type_: NETWORK_UNAVAILABLE.to_string(),
        status: "False".to_string(),
        reason: Some(REASON_CIDR_ASSIGNED.to_string()),
        message: Some("pod CIDRs assigned to the node".to_string()),
        last_transition_time: Some(now.clone()),
        last_heartbeat_time: Some(now),
    };
    Some(json!({ "status": { "conditions": [condition] } }))
}

fn cidr_host_count(s: &str) -> u64 {
    match cidr::parse(s) {
        Ok(net) => {
            let host_bits = u32::from(net.max_prefix_len().saturating_sub(net.prefix_len()));
            1u64.checked_shl(host_bits).unwrap_or(u64::MAX)
        }
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cidr_lists_compare_as_prefixes() {
        let a = vec!["2001:db8:0:0::/64".to_string()];
        let b = vec!["2001:db8::/64".to_string()];
        assert!(same_cidr_list(&a, &b));
        assert!(!same_cidr_list(&a, &["2001:db9::/64".to_string()]));
        assert!(!same_cidr_list(&a, &[]));
    }

    #[test]
    fn host_counts() {
        assert_eq!(cidr_host_count("10.0.1.0/24"), 256);
        assert_eq!(cidr_host_count("10.0.1.0/31"), 2);
        assert_eq!(cidr_host_count("bogus"), 0);
    }

    #[test]
    fn condition_patch_skipped_when_already_false() {
        use k8s_openapi::api::core::v1::{NodeStatus, NodeCondition};
        let mut node = Node::default();
        assert!(network_ready_patch(&node).is_some());

        node.status = Some(NodeStatus {
            conditions: Some(vec![NodeCondition {
                type_: NETWORK_UNAVAILABLE.to_string(),
                status: "False".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        });
        assert!(network_ready_patch(&node).is_none());

        node.status = Some(NodeStatus {
            conditions: Some(vec![NodeCondition {
                type_: NETWORK_UNAVAILABLE.to_string(),
                status: "True".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        });
        assert!(network_ready_patch(&node).is_some());
    }
}
