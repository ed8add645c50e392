//! In-memory API doubles for controller tests. Each records the calls
//! it sees; `FakeApis::apis()` erases them into the trait bundle.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::api::certificates::v1::CertificateSigningRequestCondition;
use serde_json::Value;

use crate::api::{
    AccessRequest, AccessReview, Apis, ConfigMapApi, CsrApi, EventSeverity, EventSink, NodeApi,
    NodeTopologyStatus, TopologyApi,
};
use nimbus_core::Result;

#[derive(Default)]
pub struct FakeNodeApi {
    pub patches: Mutex<Vec<(String, Value)>>,
    pub status_patches: Mutex<Vec<(String, Value)>>,
    /// When set, every call fails with a transient error.
    pub fail: AtomicBool,
}

impl FakeNodeApi {
    fn check(&self) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(nimbus_core::Error::Transient("fake node api down".into()));
        }
        Ok(())
    }

    pub fn patches_for(&self, name: &str) -> Vec<Value> {
        self.patches
            .lock()
            .unwrap()
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub fn status_patches_for(&self, name: &str) -> Vec<Value> {
        self.status_patches
            .lock()
            .unwrap()
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, p)| p.clone())
            .collect()
    }
}

#[async_trait]
impl NodeApi for FakeNodeApi {
    async fn patch(&self, name: &str, patch: Value) -> Result<()> {
        self.check()?;
        self.patches.lock().unwrap().push((name.to_string(), patch));
        Ok(())
    }

    async fn patch_status(&self, name: &str, patch: Value) -> Result<()> {
        self.check()?;
        self.status_patches.lock().unwrap().push((name.to_string(), patch));
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeCsrApi {
    pub conditions: Mutex<Vec<(String, CertificateSigningRequestCondition)>>,
    pub certificates: Mutex<Vec<(String, Vec<u8>)>>,
}

impl FakeCsrApi {
    pub fn condition_types_for(&self, name: &str) -> Vec<String> {
        self.conditions
            .lock()
            .unwrap()
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, c)| c.type_.clone())
            .collect()
    }
}

#[async_trait]
impl CsrApi for FakeCsrApi {
    async fn patch_approval(
        &self,
        name: &str,
        condition: CertificateSigningRequestCondition,
    ) -> Result<()> {
        self.conditions.lock().unwrap().push((name.to_string(), condition));
        Ok(())
    }

    async fn patch_status_certificate(&self, name: &str, certificate: Vec<u8>) -> Result<()> {
        self.certificates.lock().unwrap().push((name.to_string(), certificate));
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeConfigMapApi {
    pub store: Mutex<BTreeMap<(String, String), BTreeMap<String, String>>>,
}

#[async_trait]
impl ConfigMapApi for FakeConfigMapApi {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<BTreeMap<String, String>>> {
        Ok(self.store.lock().unwrap().get(&(namespace.to_string(), name.to_string())).cloned())
    }

    async fn upsert(&self, namespace: &str, name: &str, data: BTreeMap<String, String>) -> Result<()> {
        self.store.lock().unwrap().insert((namespace.to_string(), name.to_string()), data);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeTopologyApi {
    pub current: Mutex<Option<NodeTopologyStatus>>,
    pub updates: Mutex<Vec<(String, NodeTopologyStatus)>>,
}

#[async_trait]
impl TopologyApi for FakeTopologyApi {
    async fn get_status(&self, _name: &str) -> Result<Option<NodeTopologyStatus>> {
        Ok(self.current.lock().unwrap().clone())
    }

    async fn update_status(&self, name: &str, status: &NodeTopologyStatus) -> Result<()> {
        *self.current.lock().unwrap() = Some(status.clone());
        self.updates.lock().unwrap().push((name.to_string(), status.clone()));
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeAccessReview {
    pub deny: AtomicBool,
    pub requests: Mutex<Vec<AccessRequest>>,
}

#[async_trait]
impl AccessReview for FakeAccessReview {
    async fn allowed(&self, req: &AccessRequest) -> Result<bool> {
        self.requests.lock().unwrap().push(req.clone());
        Ok(!self.deny.load(Ordering::SeqCst))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedEvent {
    pub kind: String,
    pub name: String,
    pub severity: EventSeverity,
    pub reason: String,
    pub message: String,
}

#[derive(Default)]
pub struct FakeEventSink {
    pub events: Mutex<Vec<RecordedEvent>>,
}

impl FakeEventSink {
    pub fn reasons(&self) -> Vec<String> {
        self.events.lock().unwrap().iter().map(|e| e.reason.clone()).collect()
    }
}

#[async_trait]
impl EventSink for FakeEventSink {
    async fn record(&self, kind: &str, name: &str, severity: EventSeverity, reason: &str, message: &str) {
        self.events.lock().unwrap().push(RecordedEvent {
            kind: kind.to_string(),
            name: name.to_string(),
            severity,
            reason: reason.to_string(),
            message: message.to_string(),
        });
    }
}

/// Concrete handles plus the erased bundle, so tests can both inject and
/// inspect.
pub struct FakeApis {
    pub nodes: Arc<FakeNodeApi>,
    pub csrs: Arc<FakeCsrApi>,
    pub config_maps: Arc<FakeConfigMapApi>,
    pub topology: Arc<FakeTopologyApi>,
    pub access: Arc<FakeAccessReview>,
    pub events: Arc<FakeEventSink>,
}

impl Default for FakeApis {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeApis {
    pub fn new() -> Self {
        Self {
            nodes: Arc::new(FakeNodeApi::default()),
            csrs: Arc::new(FakeCsrApi::default()),
            config_maps: Arc::new(FakeConfigMapApi::default()),
            topology: Arc::new(FakeTopologyApi::default()),
            access: Arc::new(FakeAccessReview::default()),
            events: Arc::new(FakeEventSink::default()),
        }
    }

    pub fn apis(&self) -> Apis {
        Apis {
            nodes: self.nodes.clone(),
            csrs: self.csrs.clone(),
            config_maps: self.config_maps.clone(),
            topology: self.topology.clone(),
            access: self.access.clone(),
            events: self.events.clone(),
        }
    }
}
