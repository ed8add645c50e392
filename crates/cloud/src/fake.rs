//! In-memory `Compute` double for controller tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::{CloudError, Compute, Instance, ShieldedVmIdentity};

#[derive(Default)]
pub struct FakeCompute {
    instances: Mutex<HashMap<(String, String, String), Instance>>,
    zones: Mutex<Vec<String>>,
    referrers: Mutex<Vec<String>>,
    shielded: Mutex<ShieldedVmIdentity>,
    /// When set, every call fails with a transient error.
    pub fail: AtomicBool,
}

impl FakeCompute {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_instance(&self, project: &str, zone: &str, instance: Instance) {
        self.instances.lock().unwrap().insert(
            (project.to_string(), zone.to_string(), instance.name.clone()),
            instance,
        );
    }

    pub fn set_zones(&self, zones: &[&str]) {
        *self.zones.lock().unwrap() = zones.iter().map(|z| z.to_string()).collect();
    }

    pub fn set_shielded_identity(&self, identity: ShieldedVmIdentity) {
        *self.shielded.lock().unwrap() = identity;
    }

    fn check(&self) -> Result<(), CloudError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(CloudError::Transient("fake cloud down".into()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Compute for FakeCompute {
    async fn instance(
        &self,
        project: &str,
        zone: &str,
        name: &str,
    ) -> Result<Option<Instance>, CloudError> {
        self.check()?;
        Ok(self
            .instances
            .lock()
            .unwrap()
            .get(&(project.to_string(), zone.to_string(), name.to_string()))
            .cloned())
    }

    async fn zones(&self, _project: &str) -> Result<Vec<String>, CloudError> {
        self.check()?;
        Ok(self.zones.lock().unwrap().clone())
    }

    async fn instance_referrers(
        &self,
        _project: &str,
        _zone: &str,
        _name: &str,
    ) -> Result<Vec<String>, CloudError> {
        self.check()?;
        Ok(self.referrers.lock().unwrap().clone())
    }

    async fn shielded_identity(
        &self,
        _project: &str,
        _zone: &str,
        _name: &str,
    ) -> Result<ShieldedVmIdentity, CloudError> {
        self.check()?;
        Ok(self.shielded.lock().unwrap().clone())
    }
}
