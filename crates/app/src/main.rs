//! Nimbus controller manager entry point: flags, tracing, metrics, kube
//! watchers, and the tenant orchestrator wiring.

use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use k8s_openapi::api::certificates::v1::CertificateSigningRequest;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::Api;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use nimbus_allocator::ranges::{GkeNetworkParamSet, Network};
use nimbus_allocator::topology::TopologySyncer;
use nimbus_allocator::CidrAllocator;
use nimbus_cloud::CloudConfig;
use nimbus_core::{ProviderConfig, StackType};
use nimbus_csr::approvers::{build_validators, ApproverSettings};
use nimbus_csr::signer::{CsrSigner, HttpSigningWebhook, SigningWebhook};
use nimbus_csr::CsrApprover;
use nimbus_gsa::{NodeSaMap, VerifiedSaMap};
use nimbus_hub::api::Apis;
use nimbus_hub::{provider_config_from_dynamic, run_dynamic_watcher, run_watcher, SharedCache};
use nimbus_tenants::{ControllerConfig, ControllerStartFn, Orchestrator};

#[derive(Parser, Debug)]
#[command(name = "nimbus-controller", version, about = "Multi-tenant cloud controller core")]
struct Flags {
    /// Resolve each node's project from its provider ID.
    #[arg(long)]
    enable_multi_project: bool,

    /// Provision single-port forwarding rules.
    #[arg(long)]
    enable_discrete_port_forwarding: bool,

    /// Default new external L4 load balancers to RBS.
    #[arg(long)]
    enable_rbs_default_l4_netlb: bool,

    /// Annotate provisioned load-balancer resources.
    #[arg(long)]
    enable_l4_lb_annotations: bool,

    /// Run the per-tenant controller orchestrator.
    #[arg(long)]
    enable_gke_tenant_controller: bool,

    /// Run the service-account verifier maps and node syncer plumbing.
    #[arg(long)]
    direct_path: bool,

    /// Approve readonly kubelet client certificates.
    #[arg(long)]
    kubelet_readonly_csr_approver: bool,

    /// Require shielded-identity attestation for serving certificates.
    #[arg(long)]
    csr_approver_verify_cluster_membership: bool,

    /// Accept the legacy-unknown signer for node client certificates.
    #[arg(long)]
    csr_approver_allow_legacy_kubelet: bool,

    /// Cluster IP stack: ipv4, ipv6, ipv4-ipv6 or ipv6-ipv4.
    #[arg(long, default_value = "ipv4")]
    stack_type: String,

    /// Cloud project the cluster lives in.
    #[arg(long)]
    project: String,

    /// Cluster-membership token endpoint.
    #[arg(long, default_value = "")]
    token_url: String,

    /// JSON body for token requests.
    #[arg(long, default_value = "{}")]
    token_body: String,

    /// Compute API base override.
    #[arg(long)]
    api_endpoint: Option<String>,

    /// The cluster's own subnetwork URL.
    #[arg(long)]
    subnetwork_url: Option<String>,

    /// External CSR signing webhook. The signer is off without it.
    #[arg(long)]
    signing_webhook_url: Option<String>,

    /// Autopilot cluster policy for the readonly approver.
    #[arg(long)]
    autopilot: bool,

    /// Prometheus listen address, e.g. 127.0.0.1:9090.
    #[arg(long)]
    metrics_addr: Option<std::net::SocketAddr>,

    /// Worker threads per controller queue.
    #[arg(long, default_value_t = 2)]
    workers: usize,
}

fn init_tracing() {
    let env = std::env::var("NIMBUS_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

struct Caches {
    nodes: Arc<SharedCache<Node>>,
    pods: Arc<SharedCache<Pod>>,
    csrs: Arc<SharedCache<CertificateSigningRequest>>,
    descriptors: Arc<SharedCache<ProviderConfig>>,
    networks: Arc<SharedCache<Network>>,
    param_sets: Arc<SharedCache<GkeNetworkParamSet>>,
}

impl Caches {
    fn new() -> Self {
        Self {
            nodes: SharedCache::new("nodes"),
            pods: SharedCache::new("pods"),
            csrs: SharedCache::new("csrs"),
            descriptors: SharedCache::new("provider_configs"),
            networks: SharedCache::new("networks"),
            param_sets: SharedCache::new("network_param_sets"),
        }
    }
}

/// Keep a watcher alive for the life of the process.
fn spawn_watcher<F, Fut>(name: &'static str, ctx: CancellationToken, mut start: F)
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = anyhow::Result<()>> + Send,
{
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = ctx.cancelled() => return,
                res = start() => {
                    match res {
                        Ok(()) => warn!(watcher = name, "watch stream ended, restarting"),
                        Err(e) => error!(watcher = name, error = %e, "watcher failed, restarting"),
                    }
                }
            }
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
        }
    });
}

fn start_watchers(client: Client, caches: &Caches, ctx: &CancellationToken, watch_descriptors: bool) {
    {
        let client = client.clone();
        let cache = Arc::clone(&caches.nodes);
        spawn_watcher("nodes", ctx.clone(), move || {
            run_watcher(Api::<Node>::all(client.clone()), Arc::clone(&cache))
        });
    }
    {
        let client = client.clone();
        let cache = Arc::clone(&caches.pods);
        spawn_watcher("pods", ctx.clone(), move || {
            run_watcher(Api::<Pod>::all(client.clone()), Arc::clone(&cache))
        });
    }
    {
        let client = client.clone();
        let cache = Arc::clone(&caches.csrs);
        spawn_watcher("csrs", ctx.clone(), move || {
            run_watcher(Api::<CertificateSigningRequest>::all(client.clone()), Arc::clone(&cache))
        });
    }
    if watch_descriptors {
        let client = client.clone();
        let cache = Arc::clone(&caches.descriptors);
        spawn_watcher("provider_configs", ctx.clone(), move || {
            run_dynamic_watcher(
                client.clone(),
                "tenancy.gke.io/v1/ProviderConfig",
                Arc::clone(&cache),
                provider_config_from_dynamic,
            )
        });
    }
    {
        let client = client.clone();
        let cache = Arc::clone(&caches.networks);
        spawn_watcher("networks", ctx.clone(), move || {
            run_dynamic_watcher(
                client.clone(),
                "networking.gke.io/v1/Network",
                Arc::clone(&cache),
                Network::from_dynamic,
            )
        });
    }
    {
        let cache = Arc::clone(&caches.param_sets);
        spawn_watcher("network_param_sets", ctx.clone(), move || {
            run_dynamic_watcher(
                client.clone(),
                "networking.gke.io/v1/GKENetworkParamSet",
                Arc::clone(&cache),
                GkeNetworkParamSet::from_dynamic,
            )
        });
    }
}

fn register_controllers(
    orchestrator: &mut Orchestrator,
    flags: &Flags,
    caches: &Caches,
    stack: StackType,
    webhook: Option<Arc<dyn SigningWebhook>>,
) {
    let workers = flags.workers;

    let allocator: ControllerStartFn = {
        let networks = Arc::clone(&caches.networks);
        let param_sets = Arc::clone(&caches.param_sets);
        let project = flags.project.clone();
        let multi_project = flags.enable_multi_project;
        Arc::new(move |cfg: ControllerConfig| {
            let allocator = CidrAllocator::new(
                cfg.nodes.clone(),
                Arc::clone(&cfg.cloud),
                cfg.apis.clone(),
                Arc::clone(&networks),
                Arc::clone(&param_sets),
                stack,
                &project,
                multi_project,
            );
            Box::pin(async move {
                allocator.run(cfg.ctx, workers).await;
                Ok(())
            })
        })
    };
    orchestrator.register_controller("cidr-allocator", allocator);

    let topology: ControllerStartFn = {
        let subnetwork_url = flags.subnetwork_url.clone();
        Arc::new(move |cfg: ControllerConfig| {
            let syncer = TopologySyncer::new(
                cfg.nodes.clone(),
                Arc::clone(&cfg.apis.topology),
                subnetwork_url.as_deref(),
            );
            Box::pin(async move {
                syncer.run(cfg.ctx).await;
                Ok(())
            })
        })
    };
    orchestrator.register_controller("node-topology", topology);

    let approver: ControllerStartFn = {
        let csrs = Arc::clone(&caches.csrs);
        let pods = Arc::clone(&caches.pods);
        let settings = ApproverSettings {
            project: flags.project.clone(),
            allow_legacy_kubelet: flags.csr_approver_allow_legacy_kubelet,
            kubelet_readonly: flags.kubelet_readonly_csr_approver,
            verify_cluster_membership: flags.csr_approver_verify_cluster_membership,
            autopilot: flags.autopilot,
        };
        Arc::new(move |cfg: ControllerConfig| {
            let validators =
                build_validators(&settings, Arc::clone(&cfg.cloud), Some(Arc::clone(&pods)));
            let approver = CsrApprover::new(Arc::clone(&csrs), cfg.apis.clone(), validators);
            Box::pin(async move {
                approver.run(cfg.ctx, workers).await;
                Ok(())
            })
        })
    };
    orchestrator.register_controller("csr-approver", approver);

    if let Some(webhook) = webhook {
        let signer: ControllerStartFn = {
            let csrs = Arc::clone(&caches.csrs);
            Arc::new(move |cfg: ControllerConfig| {
                let signer =
                    CsrSigner::new(Arc::clone(&csrs), cfg.apis.clone(), Arc::clone(&webhook));
                Box::pin(async move {
                    signer.run(cfg.ctx, workers).await;
                    Ok(())
                })
            })
        };
        orchestrator.register_controller("csr-signer", signer);
    }

    let annotator: ControllerStartFn = {
        let project = flags.project.clone();
        let multi_project = flags.enable_multi_project;
        Arc::new(move |cfg: ControllerConfig| {
            let annotator = nimbus_annotator::NodeAnnotator::new(
                cfg.nodes.clone(),
                Arc::clone(&cfg.cloud),
                cfg.apis.clone(),
                &project,
                multi_project,
            );
            Box::pin(async move {
                annotator.run(cfg.ctx, workers).await;
                Ok(())
            })
        })
    };
    orchestrator.register_controller("node-annotator", annotator);
}

const VERIFIED_SA_NAMESPACE: &str = "kube-system";
const VERIFIED_SA_CONFIG_MAP: &str = "nimbus-verified-sa";

async fn init_direct_path(apis: &Apis) -> Result<(Arc<VerifiedSaMap>, Arc<NodeSaMap>)> {
    let verified = Arc::new(VerifiedSaMap::new());
    let node_usage = Arc::new(NodeSaMap::new());
    if let Some(data) = apis
        .config_maps
        .get(VERIFIED_SA_NAMESPACE, VERIFIED_SA_CONFIG_MAP)
        .await
        .context("loading verified service-account map")?
    {
        verified
            .load_config_map_data(&data)
            .context("decoding verified service-account map")?;
    }
    info!(entries = verified.len(), "direct path service-account maps ready");
    Ok((verified, node_usage))
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    init_tracing();
    let flags = Flags::parse();
    let stack: StackType = flags.stack_type.parse().map_err(|e| anyhow::anyhow!("{}", e))?;

    if let Some(addr) = flags.metrics_addr {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("installing metrics exporter")?;
    }

    let client = Client::try_default().await.context("building kube client")?;
    let apis = Apis::for_client(client.clone());
    let caches = Caches::new();
    let root = CancellationToken::new();
    start_watchers(client.clone(), &caches, &root, flags.enable_gke_tenant_controller);

    let webhook: Option<Arc<dyn SigningWebhook>> = match &flags.signing_webhook_url {
        Some(url) => Some(Arc::new(
            HttpSigningWebhook::new(url).map_err(|e| anyhow::anyhow!("{}", e))?,
        )),
        None => {
            info!("no signing webhook configured, csr signer disabled");
            None
        }
    };

    let _direct_path = if flags.direct_path {
        Some(init_direct_path(&apis).await?)
    } else {
        None
    };

    let cloud_config = CloudConfig {
        project_id: flags.project.clone(),
        token_url: flags.token_url.clone(),
        token_body: flags.token_body.clone(),
        api_endpoint: flags.api_endpoint.clone(),
        subnetwork_url: flags.subnetwork_url.clone(),
        multi_project: flags.enable_multi_project,
    };

    let mut orchestrator = Orchestrator::new(
        root.clone(),
        Arc::clone(&caches.nodes),
        Arc::clone(&caches.descriptors),
        apis.clone(),
        Orchestrator::http_compute_factory(cloud_config),
    );
    register_controllers(&mut orchestrator, &flags, &caches, stack, webhook);

    if !flags.enable_gke_tenant_controller {
        // Without the tenant controller the supervisor descriptor hosts
        // the controller set over the unlabelled (boot-time) nodes.
        caches.descriptors.apply(ProviderConfig {
            name: "supervisor".to_string(),
            project_number: 0,
            ..Default::default()
        });
        caches.descriptors.mark_synced();
    }

    let orchestrator = Arc::new(orchestrator);
    let orchestrator_task = tokio::spawn(Arc::clone(&orchestrator).run());

    info!(
        tenant_controller = flags.enable_gke_tenant_controller,
        direct_path = flags.direct_path,
        stack = %stack,
        "nimbus controller manager started"
    );

    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("shutdown signal received");
    root.cancel();
    let _ = orchestrator_task.await;
    info!("nimbus controller manager stopped");
    Ok(())
}
