//! Nimbus node annotator: reconciles the instance-id annotation, node
//! labels and node taints against the backing instance's metadata. The
//! three sub-annotators accumulate into one PATCH.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{Node, Taint as K8sTaint};
use metrics::counter;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use nimbus_cloud::{Compute, Instance};
use nimbus_core::provider::ProviderId;
use nimbus_core::taints::Taint;
use nimbus_core::{
    labels, taints, Error, Result, INSTANCE_ID_ANNOTATION, KUBE_ENV_METADATA_KEY,
    KUBE_LABELS_METADATA_KEY, LAST_APPLIED_LABELS_ANNOTATION, LAST_APPLIED_TAINTS_ANNOTATION,
};
use nimbus_hub::{CacheEvent, NodeView};
use nimbus_queue::{run_workers, WorkQueue};

/// Label keys this controller owns outright; they are cleared before the
/// desired set is applied even if no last-applied record names them.
const OWNED_LABEL_KEYS: &[&str] = &[
    "cloud.google.com/gke-nodepool",
    "cloud.google.com/gke-os-distribution",
    "cloud.google.com/gke-boot-disk",
    "cloud.google.com/machine-family",
];

pub struct NodeAnnotator {
    nodes: NodeView,
    compute: Arc<dyn Compute>,
    apis: nimbus_hub::api::Apis,
    project: String,
    multi_project: bool,
}

impl NodeAnnotator {
    pub fn new(
        nodes: NodeView,
        compute: Arc<dyn Compute>,
        apis: nimbus_hub::api::Apis,
        project: &str,
        multi_project: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            nodes,
            compute,
            apis,
            project: project.to_string(),
            multi_project,
        })
    }

    pub async fn run(self: Arc<Self>, ctx: CancellationToken, workers: usize) {
        let queue = WorkQueue::with_default_limiter("node_annotator");
        let handler = {
            let queue = Arc::clone(&queue);
            self.nodes.register(move |ev| match ev {
                CacheEvent::Applied { old: None, new } => {
                    queue.enqueue(None, new.metadata.name.as_deref());
                }
                CacheEvent::Applied { old: Some(old), new } if boot_id_changed(old, new) => {
                    queue.enqueue(None, new.metadata.name.as_deref());
                }
                _ => {}
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
        info!(tenant = self.nodes.tenant(), "node annotator running");
        ctx.cancelled().await;
        pool.shutdown().await;
        handler.release();
    }

    pub async fn sync(&self, key: &str) -> Result<()> {
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
        // A node whose instance is gone is someone else's problem.
        let Some(instance) = instance else {
            debug!(node = key, "backing instance not found, skipping");
            return Ok(());
        };

        let mut patch = NodePatch::default();
        reconcile_instance_id(&node, &instance, &mut patch);
        reconcile_labels(&node, &instance, &mut patch)?;
        reconcile_taints(&node, &instance, &mut patch)?;

        if let Some(body) = patch.into_value() {
            self.apis.nodes.patch(key, body).await?;
            counter!("node_annotator_patches_total", 1u64);
        }
        Ok(())
    }
}

pub fn boot_id_changed(old: &Node, new: &Node) -> bool {
    let boot_id = |n: &Node| {
        n.status
            .as_ref()
            .and_then(|s| s.node_info.as_ref())
            .map(|i| i.boot_id.clone())
    };
    boot_id(old) != boot_id(new)
}

/// Accumulated mutations across the three sub-annotators.
#[derive(Default)]
struct NodePatch {
    annotations: BTreeMap<String, String>,
    /// Explicit nulls remove keys on merge.
    labels: Map<String, Value>,
    taints: Option<Vec<K8sTaint>>,
}

impl NodePatch {
    fn is_empty(&self) -> bool {
        self.annotations.is_empty() && self.labels.is_empty() && self.taints.is_none()
    }

    fn into_value(self) -> Option<Value> {
        if self.is_empty() {
            return None;
        }
        let mut metadata = Map::new();
        if !self.annotations.is_empty() {
            metadata.insert("annotations".into(), json!(self.annotations));
        }
        if !self.labels.is_empty() {
            metadata.insert("labels".into(), Value::Object(self.labels));
        }
        let mut body = Map::new();
        if !metadata.is_empty() {
            body.insert("metadata".into(), Value::Object(metadata));
        }
        if let Some(taints) = self.taints {
            body.insert("spec".into(), json!({ "taints": taints }));
        }
        Some(Value::Object(body))
    }
}

fn annotation<'a>(node: &'a Node, key: &str) -> Option<&'a str> {
    node.metadata.annotations.as_ref()?.get(key).map(String::as_str)
}

fn reconcile_instance_id(node: &Node, instance: &Instance, patch: &mut NodePatch) {
    let desired = instance.id.to_string();
    if annotation(node, INSTANCE_ID_ANNOTATION) != Some(desired.as_str()) {
        patch.annotations.insert(INSTANCE_ID_ANNOTATION.to_string(), desired);
    }
}

/// Label dance: clear last-applied keys, clear owned keys, set the
/// desired set, record it sorted.
fn reconcile_labels(node: &Node, instance: &Instance, patch: &mut NodePatch) -> Result<()> {
    let Some(raw) = instance.metadata_value(KUBE_LABELS_METADATA_KEY) else {
        return Ok(());
    };
    let desired = labels::parse(raw)?;
    let last_applied = labels::parse(annotation(node, LAST_APPLIED_LABELS_ANNOTATION).unwrap_or(""))
        .unwrap_or_default();

    let current = node.metadata.labels.clone().unwrap_or_default();
    let mut next = current.clone();
    for key in last_applied.keys() {
        next.remove(key);
    }
    for key in OWNED_LABEL_KEYS {
        next.remove(*key);
    }
    for (k, v) in &desired {
        next.insert(k.clone(), v.clone());
    }

    for key in current.keys() {
        if !next.contains_key(key) {
            patch.labels.insert(key.clone(), Value::Null);
        }
    }
    for (k, v) in &next {
        if current.get(k) != Some(v) {
            patch.labels.insert(k.clone(), Value::String(v.clone()));
        }
    }

    let serialized = labels::serialize(&desired);
    if annotation(node, LAST_APPLIED_LABELS_ANNOTATION) != Some(serialized.as_str()) {
        patch.annotations.insert(LAST_APPLIED_LABELS_ANNOTATION.to_string(), serialized);
    }
    Ok(())
}

/// Same dance for taints, sourced from the kube-env blob.
fn reconcile_taints(node: &Node, instance: &Instance, patch: &mut NodePatch) -> Result<()> {
    let Some(kube_env) = instance.metadata_value(KUBE_ENV_METADATA_KEY) else {
        return Ok(());
    };
    let Some(segment) = taints::extract_taints_segment(kube_env) else {
        return Ok(());
    };
    let desired = taints::parse(segment)?;
    let last_applied =
        taints::parse(annotation(node, LAST_APPLIED_TAINTS_ANNOTATION).unwrap_or(""))
            .unwrap_or_default();

    let current: Vec<K8sTaint> = node
        .spec
        .as_ref()
        .and_then(|s| s.taints.clone())
        .unwrap_or_default();
    let mut next: Vec<K8sTaint> = current
        .iter()
        .filter(|t| !last_applied.iter().any(|la| la.key == t.key))
        .filter(|t| !desired.iter().any(|d| d.key == t.key))
        .cloned()
        .collect();
    for taint in &desired {
        next.push(K8sTaint {
            key: taint.key.clone(),
            value: (!taint.value.is_empty()).then(|| taint.value.clone()),
            effect: taint.effect.clone(),
            time_added: None,
        });
    }
    next.sort_by(|a, b| (&a.key, &a.effect).cmp(&(&b.key, &b.effect)));

    if !same_taints(&current, &next) {
        patch.taints = Some(next);
    }
    let serialized = taints::serialize(&desired);
    if annotation(node, LAST_APPLIED_TAINTS_ANNOTATION) != Some(serialized.as_str()) {
        patch.annotations.insert(LAST_APPLIED_TAINTS_ANNOTATION.to_string(), serialized);
    }
    Ok(())
}

fn same_taints(a: &[K8sTaint], b: &[K8sTaint]) -> bool {
    let shape = |ts: &[K8sTaint]| -> Vec<Taint> {
        let mut v: Vec<Taint> = ts
            .iter()
            .map(|t| Taint {
                key: t.key.clone(),
                value: t.value.clone().unwrap_or_default(),
                effect: t.effect.clone(),
            })
            .collect();
        v.sort();
        v
    };
    shape(a) == shape(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{NodeStatus, NodeSystemInfo};

    #[test]
    fn boot_id_change_detection() {
        let with_boot = |id: &str| Node {
            status: Some(NodeStatus {
                node_info: Some(NodeSystemInfo { boot_id: id.to_string(), ..Default::default() }),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(!boot_id_changed(&with_boot("a"), &with_boot("a")));
        assert!(boot_id_changed(&with_boot("a"), &with_boot("b")));
        assert!(boot_id_changed(&Node::default(), &with_boot("a")));
    }

    #[test]
    fn empty_patch_yields_no_body() {
        assert!(NodePatch::default().into_value().is_none());
    }
}
