//! Nimbus CSR pipeline: approver state machines that classify and
//! approve/deny incoming certificate requests, and a signer that
//! forwards approved requests to the external signing webhook.

#![forbid(unsafe_code)]

pub mod approvers;
pub mod parse;
pub mod signer;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use k8s_openapi::api::certificates::v1::{
    CertificateSigningRequest, CertificateSigningRequestCondition,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use metrics::{counter, histogram};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use nimbus_core::{Error, Result};
use nimbus_hub::api::{AccessRequest, Apis};
use nimbus_hub::{CacheEvent, SharedCache};
use nimbus_queue::{run_workers, WorkQueue};

use parse::ParsedCsr;

/// Signer names this pipeline knows. Anything else is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignerKind {
    KubeletClient,
    KubeletServing,
    KubeletReadonly,
    LegacyUnknown,
    Istiod,
    Oidc,
}

impl SignerKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "kubernetes.io/kube-apiserver-client-kubelet" => Some(Self::KubeletClient),
            "kubernetes.io/kubelet-serving" => Some(Self::KubeletServing),
            "gke.io/kubelet-readonly-client" => Some(Self::KubeletReadonly),
            "kubernetes.io/legacy-unknown" => Some(Self::LegacyUnknown),
            "gke.io/istiod" => Some(Self::Istiod),
            "gke.io/gke-oidc" => Some(Self::Oidc),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::KubeletClient => "kubernetes.io/kube-apiserver-client-kubelet",
            Self::KubeletServing => "kubernetes.io/kubelet-serving",
            Self::KubeletReadonly => "gke.io/kubelet-readonly-client",
            Self::LegacyUnknown => "kubernetes.io/legacy-unknown",
            Self::Istiod => "gke.io/istiod",
            Self::Oidc => "gke.io/gke-oidc",
        }
    }
}

/// Owned view of one CSR, built once per sync and handed to validators.
#[derive(Debug, Clone)]
pub struct CsrInfo {
    pub name: String,
    pub signer: SignerKind,
    pub username: String,
    pub groups: Vec<String>,
    pub extra: BTreeMap<String, Vec<String>>,
    pub usages: Vec<String>,
    pub parsed: Arc<ParsedCsr>,
}

impl CsrInfo {
    pub fn from_csr(csr: &CertificateSigningRequest, signer: SignerKind) -> Result<Self> {
        let parsed = parse::parse_csr_pem(&csr.spec.request.0)?;
        Ok(Self {
            name: csr.metadata.name.clone().unwrap_or_default(),
            signer,
            username: csr.spec.username.clone().unwrap_or_default(),
            groups: csr.spec.groups.clone().unwrap_or_default(),
            extra: csr
                .spec
                .extra
                .clone()
                .unwrap_or_default()
                .into_iter()
                .collect(),
            usages: csr.spec.usages.clone().unwrap_or_default(),
            parsed: Arc::new(parsed),
        })
    }

    /// Exact usage-set equality, order-insensitive.
    pub fn usages_exactly(&self, required: &[&str]) -> bool {
        self.usages.len() == required.len() && self.usages_subset(required)
    }

    /// Every requested usage is in the allowed set.
    pub fn usages_subset(&self, allowed: &[&str]) -> bool {
        self.usages.iter().all(|u| allowed.iter().any(|a| a == u))
    }
}

/// Result of a validator's `validate` closure: pass on to the
/// permission check, or deny with a message.
#[derive(Debug, Clone, PartialEq)]
pub enum Validation {
    Pass,
    Fail(String),
}

pub type RecognizeFn = Box<dyn Fn(&CsrInfo) -> bool + Send + Sync>;
pub type ValidateFn = Box<dyn Fn(CsrInfo) -> BoxFuture<'static, Result<Validation>> + Send + Sync>;
pub type PreApproveFn = Box<dyn Fn(CsrInfo) -> BoxFuture<'static, Result<Validation>> + Send + Sync>;

/// One approver flavor: the first validator whose `recognize` returns
/// true takes the CSR.
pub struct Validator {
    pub name: &'static str,
    /// Subresource on certificatesigningrequests the requester must be
    /// able to create.
    pub permission_subresource: &'static str,
    pub recognize: RecognizeFn,
    pub validate: ValidateFn,
    pub pre_approve: Option<PreApproveFn>,
}

const CONDITION_APPROVED: &str = "Approved";
const CONDITION_DENIED: &str = "Denied";

fn has_condition(csr: &CertificateSigningRequest, type_: &str) -> bool {
    csr.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|cs| cs.iter().any(|c| c.type_ == type_))
}

pub fn is_approved(csr: &CertificateSigningRequest) -> bool {
    has_condition(csr, CONDITION_APPROVED)
}

pub fn is_settled(csr: &CertificateSigningRequest) -> bool {
    has_condition(csr, CONDITION_APPROVED) || has_condition(csr, CONDITION_DENIED)
}

/// The per-tenant approver controller: drains CSR events, classifies,
/// validates, runs the permission check, and patches the verdict.
pub struct CsrApprover {
    csrs: Arc<SharedCache<CertificateSigningRequest>>,
    apis: Apis,
    validators: Vec<Validator>,
}

impl CsrApprover {
    pub fn new(
        csrs: Arc<SharedCache<CertificateSigningRequest>>,
        apis: Apis,
        validators: Vec<Validator>,
    ) -> Arc<Self> {
        Arc::new(Self { csrs, apis, validators })
    }

    pub async fn run(self: Arc<Self>, ctx: CancellationToken, workers: usize) {
        let queue = WorkQueue::with_default_limiter("csr_approver");
        let handler = {
            let queue = Arc::clone(&queue);
            self.csrs.register(move |ev| {
                if let CacheEvent::Applied { new, .. } = ev {
                    queue.enqueue(None, new.metadata.name.as_deref());
                }
            })
        };

        tokio::select! {
            _ = ctx.cancelled() => return,
            _ = self.csrs.wait_synced() => {}
        }
        for csr in self.csrs.list() {
            queue.enqueue(None, csr.metadata.name.as_deref());
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
        info!("csr approver running");
        ctx.cancelled().await;
        pool.shutdown().await;
        handler.release();
    }

    pub async fn sync(&self, key: &str) -> Result<()> {
        let t0 = Instant::now();
        let outcome = self.sync_csr(key).await;
        let label = match &outcome {
            Ok(o) => o.as_str(),
            Err(_) => "error",
        };
        counter!("csr_approval_total", 1u64, "outcome" => label);
        histogram!("csr_approval_latency_seconds", t0.elapsed().as_secs_f64(), "outcome" => label);
        outcome.map(|_| ())
    }

    async fn sync_csr(&self, key: &str) -> Result<Outcome> {
        let Some(csr) = self.csrs.get(key) else {
            return Ok(Outcome::Ignored);
        };
        // Re-observing a settled CSR is a no-op.
        if is_settled(&csr) {
            return Ok(Outcome::Ignored);
        }
        let Some(signer) = SignerKind::from_name(&csr.spec.signer_name) else {
            debug!(csr = key, signer = %csr.spec.signer_name, "unknown signer, ignoring");
            return Ok(Outcome::Ignored);
        };
        let info = match CsrInfo::from_csr(&csr, signer) {
            Ok(info) => info,
            Err(Error::Parse(msg)) => {
                self.deny(key, &format!("unable to parse certificate request: {}", msg)).await?;
                return Ok(Outcome::Denied);
            }
            Err(e) => return Err(e),
        };

        let Some(validator) = self.validators.iter().find(|v| (v.recognize)(&info)) else {
            return Ok(Outcome::Ignored);
        };
        debug!(csr = key, validator = validator.name, "csr recognized");

        match (validator.validate)(info.clone()).await? {
            Validation::Fail(msg) => {
                self.deny(key, &format!("{}: {}", validator.name, msg)).await?;
                return Ok(Outcome::Denied);
            }
            Validation::Pass => {}
        }

        let allowed = self
            .apis
            .access
            .allowed(&AccessRequest {
                user: info.username.clone(),
                groups: info.groups.clone(),
                extra: info.extra.clone(),
                verb: "create".to_string(),
                group: "certificates.k8s.io".to_string(),
                resource: "certificatesigningrequests".to_string(),
                subresource: Some(validator.permission_subresource.to_string()),
            })
            .await?;
        if !allowed {
            self.deny(key, &format!("user {} is not permitted to request this certificate", info.username))
                .await?;
            return Ok(Outcome::Denied);
        }

        if let Some(hook) = &validator.pre_approve {
            if let Validation::Fail(msg) = hook(info).await? {
                self.deny(key, &format!("{}: {}", validator.name, msg)).await?;
                return Ok(Outcome::Denied);
            }
        }
        self.approve(key, validator.name).await?;
        Ok(Outcome::Approved)
    }

    async fn approve(&self, name: &str, by: &str) -> Result<()> {
        let condition = CertificateSigningRequestCondition {
            type_: CONDITION_APPROVED.to_string(),
            status: "True".to_string(),
            reason: Some("AutoApproved".to_string()),
            message: Some(format!("approved by {}", by)),
            last_update_time: Some(Time(chrono::Utc::now())),
            last_transition_time: None,
        };
        self.apis.csrs.patch_approval(name, condition).await
    }

    async fn deny(&self, name: &str, message: &str) -> Result<()> {
        let condition = CertificateSigningRequestCondition {
            type_: CONDITION_DENIED.to_string(),
            status: "True".to_string(),
            reason: Some("AutoDenied".to_string()),
            message: Some(message.to_string()),
            last_update_time: Some(Time(chrono::Utc::now())),
            last_transition_time: None,
        };
        self.apis.csrs.patch_approval(name, condition).await
    }
}

enum Outcome {
    Approved,
    Denied,
    Ignored,
}

impl Outcome {
    fn as_str(&self) -> &'static str {
        match self {
            Outcome::Approved => "approve",
            Outcome::Denied => "deny",
            Outcome::Ignored => "ignore",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signer_names_round_trip() {
        for kind in [
            SignerKind::KubeletClient,
            SignerKind::KubeletServing,
            SignerKind::KubeletReadonly,
            SignerKind::LegacyUnknown,
            SignerKind::Istiod,
            SignerKind::Oidc,
        ] {
            assert_eq!(SignerKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(SignerKind::from_name("example.com/other"), None);
    }

    #[test]
    fn usage_sets() {
        let info = CsrInfo {
            name: "c".into(),
            signer: SignerKind::KubeletClient,
            username: "u".into(),
            groups: vec![],
            extra: BTreeMap::new(),
            usages: vec!["digital signature".into(), "client auth".into()],
            parsed: Arc::new(ParsedCsr::default()),
        };
        assert!(info.usages_exactly(&["client auth", "digital signature"]));
        assert!(!info.usages_exactly(&["client auth"]));
        assert!(info.usages_subset(&["client auth", "digital signature", "key encipherment"]));
        assert!(!info.usages_subset(&["client auth"]));
    }
}
