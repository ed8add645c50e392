//! Nimbus tenant orchestrator: watches tenant descriptors and runs a
//! private controller set per tenant, each bound to a tenant-scoped
//! cloud client and a tenancy-filtered node view. Cancellation flows
//! parent to child through the per-tenant token.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use k8s_openapi::api::core::v1::Node;
use metrics::gauge;
use rustc_hash::FxHashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use nimbus_cloud::{CloudConfig, CloudError, Compute, HttpCompute};
use nimbus_core::{ProviderConfig, Result};
use nimbus_hub::api::Apis;
use nimbus_hub::{CacheEvent, FilteredView, NodeView, SharedCache};
use nimbus_queue::{run_workers, WorkQueue};

/// Everything one controller gets at start.
#[derive(Clone)]
pub struct ControllerConfig {
    /// Cancelled when the tenant is removed.
    pub ctx: CancellationToken,
    /// Tenant-scoped cloud client.
    pub cloud: Arc<dyn Compute>,
    /// Tenancy-filtered node view.
    pub nodes: NodeView,
    /// Object-store write seams.
    pub apis: Apis,
    /// The tenant descriptor itself.
    pub tenant: ProviderConfig,
}

/// A controller entry point. It should block until `ctx` is cancelled;
/// returning earlier is logged and the controller is not restarted.
pub type ControllerStartFn =
    Arc<dyn Fn(ControllerConfig) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Produces the tenant-scoped cloud client.
pub type ComputeFactory =
    Arc<dyn Fn(&ProviderConfig) -> std::result::Result<Arc<dyn Compute>, CloudError> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TenantState {
    Starting,
    Running,
    Failed,
    Stopping,
}

struct TenantHandle {
    state: TenantState,
    ctx: CancellationToken,
    runner: Option<JoinHandle<()>>,
}

pub struct Orchestrator {
    root: CancellationToken,
    node_cache: Arc<SharedCache<Node>>,
    descriptors: Arc<SharedCache<ProviderConfig>>,
    apis: Apis,
    compute_factory: ComputeFactory,
    starters: Vec<(&'static str, ControllerStartFn)>,
    tenants: Mutex<FxHashMap<String, Arc<Mutex<TenantHandle>>>>,
}

impl Orchestrator {
    pub fn new(
        root: CancellationToken,
        node_cache: Arc<SharedCache<Node>>,
        descriptors: Arc<SharedCache<ProviderConfig>>,
        apis: Apis,
        compute_factory: ComputeFactory,
    ) -> Self {
        Self {
            root,
            node_cache,
            descriptors,
            apis,
            compute_factory,
            starters: Vec::new(),
            tenants: Mutex::new(FxHashMap::default()),
        }
    }

    /// The production factory: derive tenant credentials, build the
    /// HTTP client.
    pub fn http_compute_factory(base: CloudConfig) -> ComputeFactory {
        Arc::new(move |tenant| {
            let config = base.for_tenant(tenant)?;
            Ok(Arc::new(HttpCompute::new(config)?) as Arc<dyn Compute>)
        })
    }

    /// Register a controller start function. Start order across
    /// controllers is unspecified.
    pub fn register_controller(&mut self, name: &'static str, start: ControllerStartFn) {
        self.starters.push((name, start));
    }

    pub fn tenant_state(&self, name: &str) -> Option<TenantState> {
        let tenants = self.tenants.lock().expect("tenant map poisoned");
        let handle = tenants.get(name)?;
        let state = handle.lock().expect("tenant handle poisoned").state;
        Some(state)
    }

    /// Drive the orchestrator until the root token is cancelled. The
    /// descriptor watch feeds a queue; one worker applies the state
    /// machine.
    pub async fn run(self: Arc<Self>) {
        let queue = WorkQueue::with_default_limiter("tenant_orchestrator");
        let handler = {
            let queue = Arc::clone(&queue);
            self.descriptors.register(move |ev| match ev {
                CacheEvent::Applied { new, .. } => queue.enqueue(None, Some(&new.name)),
                CacheEvent::Deleted(old) => queue.enqueue(None, Some(&old.name)),
            })
        };

        tokio::select! {
            _ = self.root.cancelled() => return,
            _ = self.descriptors.wait_synced() => {}
        }
        for descriptor in self.descriptors.list() {
            queue.enqueue(None, Some(&descriptor.name));
        }

        let this = Arc::clone(&self);
        let pool = run_workers(
            Arc::clone(&queue),
            1,
            Arc::new(move |key| {
                let this = Arc::clone(&this);
                Box::pin(async move { this.sync(&key).await })
            }),
        );
        info!("tenant orchestrator running");
        self.root.cancelled().await;
        pool.shutdown().await;
        handler.release();

        // Tear down every tenant on the way out.
        let names: Vec<String> = {
            let tenants = self.tenants.lock().expect("tenant map poisoned");
            tenants.keys().cloned().collect()
        };
        for name in names {
            self.remove_tenant(&name).await;
        }
    }

    /// Reconcile one tenant name against the descriptor cache.
    pub async fn sync(&self, name: &str) -> Result<()> {
        match self.descriptors.get(name) {
            Some(descriptor) => self.observe_tenant(&descriptor),
            None => self.remove_tenant(name).await,
        }
        let count = self.tenants.lock().expect("tenant map poisoned").len();
        gauge!("tenants", count as f64);
        Ok(())
    }

    fn observe_tenant(&self, descriptor: &ProviderConfig) {
        let mut tenants = self.tenants.lock().expect("tenant map poisoned");
        if tenants.contains_key(&descriptor.name) {
            // Descriptor updates do not restart a live tenant.
            return;
        }
        let ctx = self.root.child_token();
        let handle = Arc::new(Mutex::new(TenantHandle {
            state: TenantState::Starting,
            ctx: ctx.clone(),
            runner: None,
        }));
        tenants.insert(descriptor.name.clone(), Arc::clone(&handle));
        drop(tenants);

        info!(tenant = %descriptor.name, "tenant observed, starting controllers");
        let cloud = match (self.compute_factory)(descriptor) {
            Ok(cloud) => cloud,
            Err(e) => {
                error!(tenant = %descriptor.name, error = %e, "tenant cloud client failed");
                handle.lock().expect("tenant handle poisoned").state = TenantState::Failed;
                return;
            }
        };
        let nodes = FilteredView::new(Arc::clone(&self.node_cache), &descriptor.name);
        let apis = self.apis.clone();
        let tenant = descriptor.clone();
        let starters = self.starters.clone();
        let handle_for_runner = Arc::clone(&handle);
        let node_cache = Arc::clone(&self.node_cache);

        let runner = tokio::spawn(async move {
            tokio::select! {
                _ = ctx.cancelled() => return,
                _ = node_cache.wait_synced() => {}
            }
            let mut tasks = Vec::with_capacity(starters.len());
            for (name, start) in starters {
                let config = ControllerConfig {
                    ctx: ctx.clone(),
                    cloud: Arc::clone(&cloud),
                    nodes: nodes.clone(),
                    apis: apis.clone(),
                    tenant: tenant.clone(),
                };
                let tenant_name = tenant.name.clone();
                let fut = start(config);
                tasks.push(tokio::spawn(async move {
                    match fut.await {
                        Ok(()) => info!(tenant = %tenant_name, controller = name, "controller exited"),
                        Err(e) => {
                            warn!(tenant = %tenant_name, controller = name, error = %e, "controller exited with error")
                        }
                    }
                }));
            }
            handle_for_runner.lock().expect("tenant handle poisoned").state = TenantState::Running;
            // Controllers run until the tenant context is cancelled; a
            // start fn that returns early is not restarted.
            futures::future::join_all(tasks).await;
        });
        handle.lock().expect("tenant handle poisoned").runner = Some(runner);
    }

    async fn remove_tenant(&self, name: &str) {
        let handle = {
            let mut tenants = self.tenants.lock().expect("tenant map poisoned");
            tenants.remove(name)
        };
        let Some(handle) = handle else {
            return;
        };
        info!(tenant = name, "tenant removed, stopping controllers");
        let runner = {
            let mut h = handle.lock().expect("tenant handle poisoned");
            h.state = TenantState::Stopping;
            h.ctx.cancel();
            h.runner.take()
        };
        if let Some(runner) = runner {
            // Wait for every controller goroutine to exit; handlers on
            // the filtered view release as they do.
            if let Err(e) = runner.await {
                warn!(tenant = name, error = %e, "tenant runner join failed");
            }
        }
        info!(tenant = name, "tenant stopped");
    }
}
