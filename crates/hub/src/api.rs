//! Typed API seams the controllers write through. One trait per write
//! surface, a kube-backed implementation for each, and an `Apis` bundle
//! the orchestrator hands to every controller.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::authorization::v1::{
    SubjectAccessReview, SubjectAccessReviewSpec, ResourceAttributes,
};
use k8s_openapi::api::certificates::v1::{
    CertificateSigningRequest, CertificateSigningRequestCondition,
};
use k8s_openapi::api::core::v1::{ConfigMap, Node, ObjectReference};
use k8s_openapi::ByteString;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::runtime::events::{Event as KubeEvent, EventType, Recorder, Reporter};
use kube::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

use nimbus_core::{Error, Result};

/// Field manager recorded on every write.
const MANAGER: &str = "nimbus";

fn kube_err(context: &str, e: kube::Error) -> Error {
    match e {
        kube::Error::Api(ae) if ae.code == 404 => {
            Error::NotFound(format!("{}: {}", context, ae.message))
        }
        kube::Error::Api(ae) if ae.code == 400 || ae.code == 422 => {
            Error::Parse(format!("{}: {}", context, ae.message))
        }
        kube::Error::Api(ae) => Error::Transient(format!("{}: {}", context, ae.message)),
        other => Error::Transient(format!("{}: {}", context, other)),
    }
}

#[async_trait]
pub trait NodeApi: Send + Sync {
    /// Strategic-merge-patch spec/metadata fields.
    async fn patch(&self, name: &str, patch: Value) -> Result<()>;
    /// Strategic-merge-patch status fields; conditions merge by type.
    async fn patch_status(&self, name: &str, patch: Value) -> Result<()>;
}

#[async_trait]
pub trait CsrApi: Send + Sync {
    /// Append a condition through the approval subresource.
    async fn patch_approval(
        &self,
        name: &str,
        condition: CertificateSigningRequestCondition,
    ) -> Result<()>;
    /// Set `status.certificate`, leaving every other status field alone.
    async fn patch_status_certificate(&self, name: &str, certificate: Vec<u8>) -> Result<()>;
}

#[async_trait]
pub trait ConfigMapApi: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<BTreeMap<String, String>>>;
    async fn upsert(&self, namespace: &str, name: &str, data: BTreeMap<String, String>) -> Result<()>;
}

/// Status of the cluster-wide node topology object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeTopologyStatus {
    pub subnets: Vec<String>,
    pub zones: Vec<String>,
}

#[async_trait]
pub trait TopologyApi: Send + Sync {
    async fn get_status(&self, name: &str) -> Result<Option<NodeTopologyStatus>>;
    async fn update_status(&self, name: &str, status: &NodeTopologyStatus) -> Result<()>;
}

/// One permission check against the object store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccessRequest {
    pub user: String,
    pub groups: Vec<String>,
    pub extra: BTreeMap<String, Vec<String>>,
    pub verb: String,
    pub group: String,
    pub resource: String,
    pub subresource: Option<String>,
}

#[async_trait]
pub trait AccessReview: Send + Sync {
    async fn allowed(&self, req: &AccessRequest) -> Result<bool>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSeverity {
    Normal,
    Warning,
}

#[async_trait]
pub trait EventSink: Send + Sync {
    /// Record an event against an object. Best-effort: failures are
    /// logged, never propagated.
    async fn record(&self, kind: &str, name: &str, severity: EventSeverity, reason: &str, message: &str);
}

/// The bundle handed to every controller.
#[derive(Clone)]
pub struct Apis {
    pub nodes: Arc<dyn NodeApi>,
    pub csrs: Arc<dyn CsrApi>,
    pub config_maps: Arc<dyn ConfigMapApi>,
    pub topology: Arc<dyn TopologyApi>,
    pub access: Arc<dyn AccessReview>,
    pub events: Arc<dyn EventSink>,
}

impl Apis {
    pub fn for_client(client: Client) -> Self {
        Self {
            nodes: Arc::new(KubeNodeApi::new(client.clone())),
            csrs: Arc::new(KubeCsrApi::new(client.clone())),
            config_maps: Arc::new(KubeConfigMapApi::new(client.clone())),
            topology: Arc::new(KubeTopologyApi::new(client.clone())),
            access: Arc::new(KubeAccessReview::new(client.clone())),
            events: Arc::new(KubeEventSink::new(client)),
        }
    }
}

// ----------------- kube-backed implementations -----------------

pub struct KubeNodeApi {
    api: Api<Node>,
}

impl KubeNodeApi {
    pub fn new(client: Client) -> Self {
        Self { api: Api::all(client) }
    }
}

#[async_trait]
impl NodeApi for KubeNodeApi {
    async fn patch(&self, name: &str, patch: Value) -> Result<()> {
        let pp = PatchParams::default();
        self.api
            .patch(name, &pp, &Patch::Strategic(&patch))
            .await
            .map_err(|e| kube_err("patching node", e))?;
        Ok(())
    }

    async fn patch_status(&self, name: &str, patch: Value) -> Result<()> {
        let pp = PatchParams::default();
        self.api
            .patch_status(name, &pp, &Patch::Strategic(&patch))
            .await
            .map_err(|e| kube_err("patching node status", e))?;
        Ok(())
    }
}

pub struct KubeCsrApi {
    api: Api<CertificateSigningRequest>,
}

impl KubeCsrApi {
    pub fn new(client: Client) -> Self {
        Self { api: Api::all(client) }
    }
}

#[async_trait]
impl CsrApi for KubeCsrApi {
    async fn patch_approval(
        &self,
        name: &str,
        condition: CertificateSigningRequestCondition,
    ) -> Result<()> {
        let pp = PatchParams::apply(MANAGER);
        let patch = json!({ "status": { "conditions": [condition] } });
        self.api
            .patch_approval(name, &pp, &Patch::Merge(&patch))
            .await
            .map_err(|e| kube_err("patching csr approval", e))?;
        Ok(())
    }

    async fn patch_status_certificate(&self, name: &str, certificate: Vec<u8>) -> Result<()> {
        let pp = PatchParams::apply(MANAGER);
        let patch = json!({ "status": { "certificate": ByteString(certificate) } });
        self.api
            .patch_status(name, &pp, &Patch::Merge(&patch))
            .await
            .map_err(|e| kube_err("patching csr status", e))?;
        Ok(())
    }
}

pub struct KubeConfigMapApi {
    client: Client,
}

impl KubeConfigMapApi {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ConfigMapApi for KubeConfigMapApi {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<BTreeMap<String, String>>> {
        let cm = self
            .api(namespace)
            .get_opt(name)
            .await
            .map_err(|e| kube_err("getting configmap", e))?;
        Ok(cm.map(|c| c.data.unwrap_or_default()))
    }

    async fn upsert(&self, namespace: &str, name: &str, data: BTreeMap<String, String>) -> Result<()> {
        let api = self.api(namespace);
        let existing = api
            .get_opt(name)
            .await
            .map_err(|e| kube_err("getting configmap", e))?;
        if existing.is_some() {
            let pp = PatchParams::apply(MANAGER);
            api.patch(name, &pp, &Patch::Merge(&json!({ "data": data })))
                .await
                .map_err(|e| kube_err("updating configmap", e))?;
        } else {
            let cm = ConfigMap {
                metadata: kube::core::ObjectMeta {
                    name: Some(name.to_string()),
                    namespace: Some(namespace.to_string()),
                    ..Default::default()
                },
                data: Some(data),
                ..Default::default()
            };
            api.create(&PostParams::default(), &cm)
                .await
                .map_err(|e| kube_err("creating configmap", e))?;
        }
        Ok(())
    }
}

pub struct KubeTopologyApi {
    api: Api<DynamicObject>,
}

impl KubeTopologyApi {
    pub fn new(client: Client) -> Self {
        let gvk = GroupVersionKind {
            group: "networking.gke.io".to_string(),
            version: "v1".to_string(),
            kind: "NodeTopology".to_string(),
        };
        let ar = ApiResource::from_gvk(&gvk);
        Self { api: Api::all_with(client, &ar) }
    }
}

#[async_trait]
impl TopologyApi for KubeTopologyApi {
    async fn get_status(&self, name: &str) -> Result<Option<NodeTopologyStatus>> {
        let obj = self
            .api
            .get_opt(name)
            .await
            .map_err(|e| kube_err("getting node topology", e))?;
        let Some(obj) = obj else {
            return Ok(None);
        };
        let status = obj
            .data
            .get("status")
            .cloned()
            .map(serde_json::from_value::<NodeTopologyStatus>)
            .transpose()
            .map_err(|e| Error::Parse(format!("node topology status: {}", e)))?;
        Ok(Some(status.unwrap_or_default()))
    }

    async fn update_status(&self, name: &str, status: &NodeTopologyStatus) -> Result<()> {
        let pp = PatchParams::apply(MANAGER);
        self.api
            .patch_status(name, &pp, &Patch::Merge(&json!({ "status": status })))
            .await
            .map_err(|e| kube_err("patching node topology status", e))?;
        Ok(())
    }
}

pub struct KubeAccessReview {
    api: Api<SubjectAccessReview>,
}

impl KubeAccessReview {
    pub fn new(client: Client) -> Self {
        Self { api: Api::all(client) }
    }
}

#[async_trait]
impl AccessReview for KubeAccessReview {
    async fn allowed(&self, req: &AccessRequest) -> Result<bool> {
        let extra: BTreeMap<String, Vec<String>> =
            req.extra.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        let sar = SubjectAccessReview {
            spec: SubjectAccessReviewSpec {
                user: Some(req.user.clone()),
                groups: Some(req.groups.clone()),
                extra: (!extra.is_empty()).then_some(extra),
                resource_attributes: Some(ResourceAttributes {
                    group: (!req.group.is_empty()).then(|| req.group.clone()),
                    resource: Some(req.resource.clone()),
                    subresource: req.subresource.clone(),
                    verb: Some(req.verb.clone()),
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        };
        let created = self
            .api
            .create(&PostParams::default(), &sar)
            .await
            .map_err(|e| kube_err("creating subject access review", e))?;
        Ok(created.status.map(|s| s.allowed).unwrap_or(false))
    }
}

pub struct KubeEventSink {
    client: Client,
    reporter: Reporter,
}

impl KubeEventSink {
    pub fn new(client: Client) -> Self {
        Self { client, reporter: Reporter { controller: MANAGER.into(), instance: None } }
    }
}

#[async_trait]
impl EventSink for KubeEventSink {
    async fn record(&self, kind: &str, name: &str, severity: EventSeverity, reason: &str, message: &str) {
        let api_version = match kind {
            "CertificateSigningRequest" => "certificates.k8s.io/v1",
            _ => "v1",
        };
        let reference = ObjectReference {
            kind: Some(kind.to_string()),
            name: Some(name.to_string()),
            api_version: Some(api_version.to_string()),
            ..Default::default()
        };
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), reference);
        let type_ = match severity {
            EventSeverity::Normal => EventType::Normal,
            EventSeverity::Warning => EventType::Warning,
        };
        let res = recorder
            .publish(KubeEvent {
                type_,
                reason: reason.to_string(),
                note: Some(message.to_string()),
                action: reason.to_string(),
                secondary: None,
            })
            .await;
        if let Err(e) = res {
            warn!(kind, name, reason, error = %e, "event publish failed");
        }
    }
}
