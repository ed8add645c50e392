//! Nimbus hub – shared object caches fed by kube watchers, tenancy
//! filtered views over them, and the typed API seams controllers write
//! through.

#![forbid(unsafe_code)]

pub mod api;
pub mod fakes;
mod watch;

pub use watch::{run_dynamic_watcher, run_watcher};

use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use metrics::gauge;
use rustc_hash::FxHashMap;
use tokio::sync::watch as watch_ch;
use tracing::debug;
use uuid::Uuid;

use nimbus_core::keys::object_key;
use nimbus_core::TENANCY_LABEL;

/// Cache residents: provide their queue key and label lookup for the
/// tenancy filter.
pub trait CacheKeyed {
    fn cache_key(&self) -> String;
    fn label(&self, key: &str) -> Option<&str>;
}

#[derive(Clone)]
pub enum CacheEvent<T> {
    Applied { old: Option<Arc<T>>, new: Arc<T> },
    Deleted(Arc<T>),
}

type Handler<T> = Arc<dyn Fn(&CacheEvent<T>) + Send + Sync>;

/// Snapshot cache over one object kind, fed by a single watcher task.
/// Readers get arc-swapped maps; event handlers run inline on the
/// watcher task in registration order.
pub struct SharedCache<T> {
    name: &'static str,
    map: ArcSwap<FxHashMap<String, Arc<T>>>,
    handlers: Mutex<Vec<(Uuid, Handler<T>)>>,
    synced: watch_ch::Sender<bool>,
}

impl<T: CacheKeyed + Send + Sync + 'static> SharedCache<T> {
    pub fn new(name: &'static str) -> Arc<Self> {
        let (synced, _) = watch_ch::channel(false);
        Arc::new(Self {
            name,
            map: ArcSwap::from_pointee(FxHashMap::default()),
            handlers: Mutex::new(Vec::new()),
            synced,
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn apply(&self, obj: T) {
        let new = Arc::new(obj);
        let key = new.cache_key();
        let old = self.map.load().get(&key).cloned();
        let mut next = (**self.map.load()).clone();
        next.insert(key, Arc::clone(&new));
        gauge!("cache_objects", next.len() as f64, "cache" => self.name);
        self.map.store(Arc::new(next));
        self.dispatch(&CacheEvent::Applied { old, new });
    }

    pub fn delete(&self, key: &str) {
        let mut next = (**self.map.load()).clone();
        let Some(old) = next.remove(key) else {
            return;
        };
        gauge!("cache_objects", next.len() as f64, "cache" => self.name);
        self.map.store(Arc::new(next));
        self.dispatch(&CacheEvent::Deleted(old));
    }

    /// Wholesale replacement after a watch relist. Emits Applied for
    /// everything present and Deleted for everything gone, then marks
    /// the cache synced.
    pub fn replace(&self, objs: Vec<T>) {
        let prev = self.map.load_full();
        let mut next = FxHashMap::default();
        let mut events = Vec::with_capacity(objs.len());
        for obj in objs {
            let new = Arc::new(obj);
            let key = new.cache_key();
            let old = prev.get(&key).cloned();
            next.insert(key, Arc::clone(&new));
            events.push(CacheEvent::Applied { old, new });
        }
        for (key, old) in prev.iter() {
            if !next.contains_key(key) {
                events.push(CacheEvent::Deleted(Arc::clone(old)));
            }
        }
        gauge!("cache_objects", next.len() as f64, "cache" => self.name);
        self.map.store(Arc::new(next));
        for ev in &events {
            self.dispatch(ev);
        }
        self.mark_synced();
    }

    pub fn mark_synced(&self) {
        let _ = self.synced.send(true);
    }

    /// Resolves once the first full list has landed.
    pub async fn wait_synced(&self) {
        let mut rx = self.synced.subscribe();
        let _ = rx.wait_for(|ready| *ready).await;
    }

    pub fn has_synced(&self) -> bool {
        *self.synced.borrow()
    }

    pub fn get(&self, key: &str) -> Option<Arc<T>> {
        self.map.load().get(key).cloned()
    }

    pub fn list(&self) -> Vec<Arc<T>> {
        self.map.load().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.map.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register an event handler. The handle deregisters on release (or
    /// drop), after which the handler never fires again.
    pub fn register(
        self: &Arc<Self>,
        handler: impl Fn(&CacheEvent<T>) + Send + Sync + 'static,
    ) -> HandlerHandle {
        let id = Uuid::new_v4();
        self.handlers
            .lock()
            .expect("handler lock poisoned")
            .push((id, Arc::new(handler)));
        let cache = Arc::clone(self);
        HandlerHandle {
            release: Some(Box::new(move || {
                cache
                    .handlers
                    .lock()
                    .expect("handler lock poisoned")
                    .retain(|(hid, _)| *hid != id);
                debug!(cache = cache.name, id = %id, "event handler released");
            })),
        }
    }

    fn dispatch(&self, ev: &CacheEvent<T>) {
        let handlers: Vec<Handler<T>> = {
            let g = self.handlers.lock().expect("handler lock poisoned");
            g.iter().map(|(_, h)| Arc::clone(h)).collect()
        };
        for h in handlers {
            h(ev);
        }
    }
}

/// Deregistration handle for a cache event handler.
pub struct HandlerHandle {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl HandlerHandle {
    pub fn release(mut self) {
        if let Some(f) = self.release.take() {
            f();
        }
    }
}

impl Drop for HandlerHandle {
    fn drop(&mut self) {
        if let Some(f) = self.release.take() {
            f();
        }
    }
}

/// Tenancy-filtered view over a shared cache: admits objects labelled
/// for the tenant, plus unlabelled objects under the supervisor policy.
pub struct FilteredView<T> {
    cache: Arc<SharedCache<T>>,
    tenant: String,
    admit_unlabelled: bool,
}

impl<T> Clone for FilteredView<T> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
            tenant: self.tenant.clone(),
            admit_unlabelled: self.admit_unlabelled,
        }
    }
}

impl<T: CacheKeyed + Send + Sync + 'static> FilteredView<T> {
    pub fn new(cache: Arc<SharedCache<T>>, tenant: &str) -> Self {
        Self {
            cache,
            tenant: tenant.to_string(),
            // Supervisor tenants see boot-time objects that predate labelling.
            admit_unlabelled: tenant.starts_with('s'),
        }
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    pub fn admits(&self, obj: &T) -> bool {
        match obj.label(TENANCY_LABEL) {
            Some(v) => v == self.tenant,
            None => self.admit_unlabelled,
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<T>> {
        self.cache.get(key).filter(|o| self.admits(o))
    }

    pub fn list(&self) -> Vec<Arc<T>> {
        self.cache.list().into_iter().filter(|o| self.admits(o)).collect()
    }

    /// Filtered list with an extra predicate; the indexer stand-in.
    pub fn list_where(&self, pred: impl Fn(&T) -> bool) -> Vec<Arc<T>> {
        self.list().into_iter().filter(|o| pred(o)).collect()
    }

    pub async fn wait_synced(&self) {
        self.cache.wait_synced().await
    }

    /// Register a handler that only sees admitted objects.
    pub fn register(
        &self,
        handler: impl Fn(&CacheEvent<T>) + Send + Sync + 'static,
    ) -> HandlerHandle {
        let view = self.clone();
        self.cache.register(move |ev| {
            let admitted = match ev {
                CacheEvent::Applied { new, .. } => view.admits(new),
                CacheEvent::Deleted(obj) => view.admits(obj),
            };
            if admitted {
                handler(ev);
            }
        })
    }
}

/// The per-tenant node view every controller works against.
pub type NodeView = FilteredView<k8s_openapi::api::core::v1::Node>;

impl CacheKeyed for k8s_openapi::api::core::v1::Node {
    fn cache_key(&self) -> String {
        self.metadata.name.clone().unwrap_or_default()
    }

    fn label(&self, key: &str) -> Option<&str> {
        self.metadata.labels.as_ref()?.get(key).map(String::as_str)
    }
}

impl CacheKeyed for k8s_openapi::api::core::v1::Pod {
    fn cache_key(&self) -> String {
        object_key(self.metadata.namespace.as_deref(), self.metadata.name.as_deref().unwrap_or_default())
    }

    fn label(&self, key: &str) -> Option<&str> {
        self.metadata.labels.as_ref()?.get(key).map(String::as_str)
    }
}

impl CacheKeyed for k8s_openapi::api::certificates::v1::CertificateSigningRequest {
    fn cache_key(&self) -> String {
        self.metadata.name.clone().unwrap_or_default()
    }

    fn label(&self, key: &str) -> Option<&str> {
        self.metadata.labels.as_ref()?.get(key).map(String::as_str)
    }
}

impl CacheKeyed for nimbus_core::ProviderConfig {
    fn cache_key(&self) -> String {
        self.name.clone()
    }

    fn label(&self, key: &str) -> Option<&str> {
        (key == TENANCY_LABEL).then_some(self.tenancy.as_deref()).flatten()
    }
}

/// Shape a watched tenant descriptor into the core type.
pub fn provider_config_from_dynamic(
    obj: &kube::core::DynamicObject,
) -> Option<nimbus_core::ProviderConfig> {
    let name = obj.metadata.name.clone()?;
    let tenancy = obj
        .metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(TENANCY_LABEL))
        .cloned();
    let spec = obj.data.get("spec");
    let strings = |field: &str| -> Vec<String> {
        spec.and_then(|s| s.get(field))
            .and_then(|v| v.as_array())
            .map(|a| a.iter().filter_map(|x| x.as_str().map(String::from)).collect())
            .unwrap_or_default()
    };
    Some(nimbus_core::ProviderConfig {
        name,
        tenancy,
        project_number: spec
            .and_then(|s| s.get("projectNumber"))
            .and_then(|v| v.as_i64())
            .unwrap_or_default(),
        cluster_network: spec
            .and_then(|s| s.get("clusterNetwork"))
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        pod_ranges: strings("podRanges"),
        subnet_paths: strings("subnetPaths"),
    })
}
