#![forbid(unsafe_code)]

//! Annotator sync against fake cloud metadata.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{Node, NodeSpec, Taint};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use nimbus_annotator::NodeAnnotator;
use nimbus_cloud::fake::FakeCompute;
use nimbus_cloud::{Instance, InstanceMetadata, MetadataEntry};
use nimbus_core::{
    INSTANCE_ID_ANNOTATION, LAST_APPLIED_LABELS_ANNOTATION, LAST_APPLIED_TAINTS_ANNOTATION,
    TENANCY_LABEL,
};
use nimbus_hub::fakes::FakeApis;
use nimbus_hub::{FilteredView, SharedCache};

struct Rig {
    nodes: Arc<SharedCache<Node>>,
    compute: Arc<FakeCompute>,
    apis: FakeApis,
}

impl Rig {
    fn new() -> Self {
        Self {
            nodes: SharedCache::new("nodes"),
            compute: Arc::new(FakeCompute::new()),
            apis: FakeApis::new(),
        }
    }

    fn annotator(&self) -> Arc<NodeAnnotator> {
        NodeAnnotator::new(
            FilteredView::new(Arc::clone(&self.nodes), "t1"),
            Arc::clone(&self.compute) as Arc<dyn nimbus_cloud::Compute>,
            self.apis.apis(),
            "p0",
            false,
        )
    }
}

fn node(name: &str) -> Node {
    let mut labels = BTreeMap::new();
    labels.insert(TENANCY_LABEL.to_string(), "t1".to_string());
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(NodeSpec {
            provider_id: Some(format!("gce://p0/z0/{}", name)),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn instance(name: &str, id: u64, metadata: &[(&str, &str)]) -> Instance {
    Instance {
        id,
        name: name.to_string(),
        zone: "projects/p0/zones/z0".to_string(),
        metadata: InstanceMetadata {
            items: metadata
                .iter()
                .map(|(k, v)| MetadataEntry { key: (*k).to_string(), value: Some((*v).to_string()) })
                .collect(),
        },
        ..Default::default()
    }
}

#[tokio::test]
async fn instance_id_annotation_is_added() {
    let rig = Rig::new();
    rig.nodes.apply(node("n1"));
    rig.compute.put_instance("p0", "z0", instance("n1", 5554443332221110, &[]));

    rig.annotator().sync("n1").await.unwrap();
    let patches = rig.apis.nodes.patches_for("n1");
    assert_eq!(patches.len(), 1);
    assert_eq!(
        patches[0]["metadata"]["annotations"][INSTANCE_ID_ANNOTATION],
        "5554443332221110"
    );
}

#[tokio::test]
async fn label_merge_respects_last_applied() {
    let rig = Rig::new();
    let mut n = node("n2");
    {
        let meta = &mut n.metadata;
        let labels = meta.labels.as_mut().unwrap();
        labels.insert("a".to_string(), "1".to_string());
        labels.insert("b".to_string(), "2".to_string());
        labels.insert("c".to_string(), "3".to_string());
        let mut annotations = BTreeMap::new();
        annotations.insert(LAST_APPLIED_LABELS_ANNOTATION.to_string(), "a=1,b=2".to_string());
        annotations.insert(INSTANCE_ID_ANNOTATION.to_string(), "9".to_string());
        meta.annotations = Some(annotations);
    }
    rig.nodes.apply(n);
    rig.compute
        .put_instance("p0", "z0", instance("n2", 9, &[("kube-labels", "a=3")]));

    rig.annotator().sync("n2").await.unwrap();
    let patches = rig.apis.nodes.patches_for("n2");
    assert_eq!(patches.len(), 1);
    let labels = &patches[0]["metadata"]["labels"];
    // a updated, b removed, c untouched.
    assert_eq!(labels["a"], "3");
    assert!(labels["b"].is_null());
    assert!(labels.get("c").is_none());
    assert_eq!(
        patches[0]["metadata"]["annotations"][LAST_APPLIED_LABELS_ANNOTATION],
        "a=3"
    );
}

#[tokio::test]
async fn taints_follow_kube_env() {
    let rig = Rig::new();
    let mut n = node("n3");
    n.spec.as_mut().unwrap().taints = Some(vec![
        Taint {
            key: "stale".to_string(),
            value: Some("1".to_string()),
            effect: "NoSchedule".to_string(),
            time_added: None,
        },
        Taint {
            key: "user-taint".to_string(),
            value: Some("keep".to_string()),
            effect: "NoExecute".to_string(),
            time_added: None,
        },
    ]);
    let mut annotations = BTreeMap::new();
    annotations.insert(LAST_APPLIED_TAINTS_ANNOTATION.to_string(), "stale=1:NoSchedule".to_string());
    annotations.insert(INSTANCE_ID_ANNOTATION.to_string(), "9".to_string());
    n.metadata.annotations = Some(annotations);
    rig.nodes.apply(n);
    rig.compute.put_instance(
        "p0",
        "z0",
        instance("n3", 9, &[("kube-env", "node_taints=dedicated=gpu:NoSchedule;other=x")]),
    );

    rig.annotator().sync("n3").await.unwrap();
    let patches = rig.apis.nodes.patches_for("n3");
    assert_eq!(patches.len(), 1);
    let taints = patches[0]["spec"]["taints"].as_array().unwrap();
    let keys: Vec<&str> = taints.iter().map(|t| t["key"].as_str().unwrap()).collect();
    assert_eq!(keys, vec!["dedicated", "user-taint"]);
    assert_eq!(
        patches[0]["metadata"]["annotations"][LAST_APPLIED_TAINTS_ANNOTATION],
        "dedicated=gpu:NoSchedule"
    );
}

#[tokio::test]
async fn settled_node_needs_no_patch() {
    let rig = Rig::new();
    let mut n = node("n4");
    let mut annotations = BTreeMap::new();
    annotations.insert(INSTANCE_ID_ANNOTATION.to_string(), "7".to_string());
    annotations.insert(LAST_APPLIED_LABELS_ANNOTATION.to_string(), "a=1".to_string());
    n.metadata.annotations = Some(annotations);
    n.metadata.labels.as_mut().unwrap().insert("a".to_string(), "1".to_string());
    rig.nodes.apply(n);
    rig.compute
        .put_instance("p0", "z0", instance("n4", 7, &[("kube-labels", "a=1")]));

    rig.annotator().sync("n4").await.unwrap();
    assert!(rig.apis.nodes.patches_for("n4").is_empty());
}

#[tokio::test]
async fn missing_instance_is_skipped() {
    let rig = Rig::new();
    rig.nodes.apply(node("n5"));
    rig.annotator().sync("n5").await.unwrap();
    assert!(rig.apis.nodes.patches_for("n5").is_empty());
}

#[tokio::test]
async fn invalid_kube_labels_is_terminal() {
    let rig = Rig::new();
    rig.nodes.apply(node("n6"));
    rig.compute
        .put_instance("p0", "z0", instance("n6", 7, &[("kube-labels", "not a label list")]));
    let err = rig.annotator().sync("n6").await.unwrap_err();
    assert!(!err.is_retryable());
}
