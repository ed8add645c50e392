//! Node topology syncer: keeps the cluster-wide `default` topology
//! object's subnet list equal to the union of subnets observed on nodes.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use nimbus_cloud::trailing_segment;
use nimbus_core::{Result, SUBNET_LABEL};
use nimbus_hub::api::{NodeTopologyStatus, TopologyApi};
use nimbus_hub::{CacheKeyed, NodeView};
use nimbus_queue::{run_workers, WorkQueue};

/// Name of the single cluster-wide topology object.
pub const TOPOLOGY_OBJECT: &str = "default";

const DEFAULT_RESYNC_SECS: u64 = 300;

pub struct TopologySyncer {
    nodes: NodeView,
    topology: Arc<dyn TopologyApi>,
    default_subnet: Option<String>,
    resync: Duration,
}

impl TopologySyncer {
    pub fn new(
        nodes: NodeView,
        topology: Arc<dyn TopologyApi>,
        subnetwork_url: Option<&str>,
    ) -> Arc<Self> {
        let resync = std::env::var("NIMBUS_TOPOLOGY_RESYNC_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_RESYNC_SECS);
        Arc::new(Self {
            nodes,
            topology,
            default_subnet: subnetwork_url.map(|u| trailing_segment(u).to_string()),
            resync: Duration::from_secs(resync.max(1)),
        })
    }

    pub async fn run(self: Arc<Self>, ctx: CancellationToken) {
        let queue = WorkQueue::with_default_limiter("node_topology");
        let handler = {
            let queue = Arc::clone(&queue);
            // Any node event can change the union; recompute from the cache.
            self.nodes.register(move |_ev| queue.add(TOPOLOGY_OBJECT))
        };

        tokio::select! {
            _ = ctx.cancelled() => return,
            _ = self.nodes.wait_synced() => {}
        }
        queue.add(TOPOLOGY_OBJECT);

        let this = Arc::clone(&self);
        let pool = run_workers(
            Arc::clone(&queue),
            1,
            Arc::new(move |_key| {
                let this = Arc::clone(&this);
                Box::pin(async move { this.sync().await })
            }),
        );
        info!(tenant = self.nodes.tenant(), "topology syncer running");

        let mut ticker = tokio::time::interval(self.resync);
        ticker.tick().await; // immediate first tick
        loop {
            tokio::select! {
                _ = ctx.cancelled() => break,
                _ = ticker.tick() => queue.add(TOPOLOGY_OBJECT),
            }
        }
        pool.shutdown().await;
        handler.release();
    }

    /// Recompute the subnet union and write it when it differs. A
    /// missing topology object is skipped, not an error.
    pub async fn sync(&self) -> Result<()> {
        let mut subnets: Vec<String> = self
            .nodes
            .list()
            .iter()
            .filter_map(|n| n.label(SUBNET_LABEL).map(String::from))
            .collect();
        if let Some(default) = &self.default_subnet {
            subnets.push(default.clone());
        }
        subnets.sort();
        subnets.dedup();

        let Some(current) = self.topology.get_status(TOPOLOGY_OBJECT).await? else {
            debug!("topology object absent; skipping");
            return Ok(());
        };
        if current.subnets == subnets {
            return Ok(());
        }
        let status = NodeTopologyStatus { subnets, zones: current.zones };
        self.topology.update_status(TOPOLOGY_OBJECT, &status).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Node;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use nimbus_core::TENANCY_LABEL;
    use nimbus_hub::fakes::FakeTopologyApi;
    use nimbus_hub::{FilteredView, SharedCache};
    use std::collections::BTreeMap;

    fn node(name: &str, subnet: Option<&str>) -> Node {
        let mut labels = BTreeMap::new();
        labels.insert(TENANCY_LABEL.to_string(), "t1".to_string());
        if let Some(s) = subnet {
            labels.insert(SUBNET_LABEL.to_string(), s.to_string());
        }
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(labels),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn syncer(
        cache: &std::sync::Arc<SharedCache<Node>>,
        topo: Arc<FakeTopologyApi>,
    ) -> Arc<TopologySyncer> {
        TopologySyncer::new(
            FilteredView::new(Arc::clone(cache), "t1"),
            topo,
            Some("projects/p/regions/r/subnetworks/subnet-base"),
        )
    }

    #[tokio::test]
    async fn writes_sorted_union_with_default_subnet() {
        let cache = SharedCache::<Node>::new("nodes");
        cache.apply(node("n1", Some("subnet-b")));
        cache.apply(node("n2", Some("subnet-a")));
        cache.apply(node("n3", None));

        let topo = Arc::new(FakeTopologyApi::default());
        *topo.current.lock().unwrap() = Some(NodeTopologyStatus::default());

        syncer(&cache, Arc::clone(&topo)).sync().await.unwrap();
        let updates = topo.updates.lock().unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(
            updates[0].1.subnets,
            vec!["subnet-a".to_string(), "subnet-b".to_string(), "subnet-base".to_string()]
        );
    }

    #[tokio::test]
    async fn unchanged_union_writes_nothing() {
        let cache = SharedCache::<Node>::new("nodes");
        cache.apply(node("n1", Some("subnet-a")));

        let topo = Arc::new(FakeTopologyApi::default());
        *topo.current.lock().unwrap() = Some(NodeTopologyStatus {
            subnets: vec!["subnet-a".to_string(), "subnet-base".to_string()],
            zones: vec![],
        });

        syncer(&cache, Arc::clone(&topo)).sync().await.unwrap();
        assert!(topo.updates.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn zones_are_left_untouched() {
        let cache = SharedCache::<Node>::new("nodes");
        cache.apply(node("n1", Some("subnet-a")));

        let topo = Arc::new(FakeTopologyApi::default());
        *topo.current.lock().unwrap() = Some(NodeTopologyStatus {
            subnets: vec![],
            zones: vec!["zone-1".to_string()],
        });

        syncer(&cache, Arc::clone(&topo)).sync().await.unwrap();
        let updates = topo.updates.lock().unwrap();
        assert_eq!(updates[0].1.zones, vec!["zone-1".to_string()]);
    }

    #[tokio::test]
    async fn absent_object_is_skipped() {
        let cache = SharedCache::<Node>::new("nodes");
        cache.apply(node("n1", Some("subnet-a")));
        let topo = Arc::new(FakeTopologyApi::default());
        syncer(&cache, Arc::clone(&topo)).sync().await.unwrap();
        assert!(topo.updates.lock().unwrap().is_empty());
    }
}
