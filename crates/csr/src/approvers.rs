//! The approver flavors. Each builds a [`Validator`] record; the
//! ordered list goes to the approver engine.

use std::net::IpAddr;
use std::sync::Arc;

use nimbus_cloud::{Compute, Instance};
use nimbus_core::{Error, Result, AUTOPILOT_READONLY_ANNOTATION};
use nimbus_hub::SharedCache;

use crate::{CsrInfo, SignerKind, Validation, Validator};

const USAGE_KEY_ENCIPHERMENT: &str = "key encipherment";
const USAGE_DIGITAL_SIGNATURE: &str = "digital signature";
const USAGE_CLIENT_AUTH: &str = "client auth";
const USAGE_SERVER_AUTH: &str = "server auth";

const NODE_PREFIX: &str = "system:node:";
const NODE_GROUP: &str = "system:nodes";
const LEGACY_KUBELET_USERNAME: &str = "kubelet";

/// Settings threaded from the flag surface.
#[derive(Debug, Clone, Default)]
pub struct ApproverSettings {
    pub project: String,
    pub allow_legacy_kubelet: bool,
    pub kubelet_readonly: bool,
    pub verify_cluster_membership: bool,
    pub autopilot: bool,
}

/// Build the ordered validator list for one tenant.
pub fn build_validators(
    settings: &ApproverSettings,
    compute: Arc<dyn Compute>,
    pods: Option<Arc<SharedCache<k8s_openapi::api::core::v1::Pod>>>,
) -> Vec<Validator> {
    let mut validators = Vec::new();
    validators.push(node_client_legacy(settings.allow_legacy_kubelet));
    validators.push(self_node_server(settings, compute));
    if settings.kubelet_readonly {
        validators.push(kubelet_readonly(settings.autopilot, pods));
    }
    validators.push(istiod());
    validators.push(oidc());
    validators
}

/// Legacy node client certificates: client-auth kubelet bootstrap
/// requests submitted under the legacy kubelet identity.
pub fn node_client_legacy(allow_legacy_signer: bool) -> Validator {
    Validator {
        name: "node-client-cert-legacy",
        permission_subresource: "nodeclient",
        recognize: Box::new(move |info| {
            let signer_ok = match info.signer {
                SignerKind::KubeletClient => true,
                SignerKind::LegacyUnknown => allow_legacy_signer,
                _ => false,
            };
            signer_ok
                && info.username == LEGACY_KUBELET_USERNAME
                && info
                    .parsed
                    .common_name
                    .as_deref()
                    .is_some_and(|cn| cn.starts_with(NODE_PREFIX))
        }),
        validate: Box::new(|info| {
            Box::pin(async move {
                if !info.usages_exactly(&[
                    USAGE_KEY_ENCIPHERMENT,
                    USAGE_DIGITAL_SIGNATURE,
                    USAGE_CLIENT_AUTH,
                ]) {
                    return Ok(Validation::Fail("unexpected usages for a client certificate".into()));
                }
                if info.parsed.organizations != vec![NODE_GROUP.to_string()] {
                    return Ok(Validation::Fail(format!(
                        "organization must be exactly {}",
                        NODE_GROUP
                    )));
                }
                Ok(Validation::Pass)
            })
        }),
        pre_approve: None,
    }
}

/// Kubelet serving certificates: the node requests a cert for itself;
/// every requested name and address must map onto the backing instance.
/// With membership verification on, a pre-approve hook additionally
/// requires a shielded identity on the instance.
pub fn self_node_server(settings: &ApproverSettings, compute: Arc<dyn Compute>) -> Validator {
    let project = settings.project.clone();
    let pre_approve = settings.verify_cluster_membership.then(|| -> crate::PreApproveFn {
        let compute = Arc::clone(&compute);
        let project = project.clone();
        Box::new(move |info| {
            let compute = Arc::clone(&compute);
            let project = project.clone();
            Box::pin(async move { verify_cluster_membership(&compute, &project, info).await })
        })
    });
    Validator {
        name: "self-node-server-cert",
        permission_subresource: "selfnodeserver",
        recognize: Box::new(|info| {
            info.signer == SignerKind::KubeletServing
                && info.username.starts_with(NODE_PREFIX)
                && info.parsed.common_name.as_deref() == Some(info.username.as_str())
        }),
        validate: Box::new(move |info| {
            let compute = Arc::clone(&compute);
            let project = project.clone();
            Box::pin(async move { validate_node_server(&compute, &project, info).await })
        }),
        pre_approve,
    }
}

/// Attestation gate: the instance must expose a shielded identity.
async fn verify_cluster_membership(
    compute: &Arc<dyn Compute>,
    project: &str,
    info: CsrInfo,
) -> Result<Validation> {
    let Some(node_name) = info.username.strip_prefix(NODE_PREFIX) else {
        return Ok(Validation::Fail("requester is not a node".into()));
    };
    let zones = compute.zones(project).await.map_err(Error::from)?;
    for zone in &zones {
        if compute
            .instance(project, zone, node_name)
            .await
            .map_err(Error::from)?
            .is_none()
        {
            continue;
        }
        let identity = compute
            .shielded_identity(project, zone, node_name)
            .await
            .map_err(Error::from)?;
        if identity.signing_key.is_some() {
            return Ok(Validation::Pass);
        }
        return Ok(Validation::Fail(format!(
            "instance {} has no shielded identity to attest cluster membership",
            node_name
        )));
    }
    Ok(Validation::Fail(format!("no instance named {} in any configured zone", node_name)))
}

async fn validate_node_server(
    compute: &Arc<dyn Compute>,
    project: &str,
    info: CsrInfo,
) -> Result<Validation> {
    let server_usages_ok = info.usages_exactly(&[
        USAGE_KEY_ENCIPHERMENT,
        USAGE_DIGITAL_SIGNATURE,
        USAGE_SERVER_AUTH,
    ]) || info.usages_exactly(&[USAGE_DIGITAL_SIGNATURE, USAGE_SERVER_AUTH]);
    if !server_usages_ok {
        return Ok(Validation::Fail("unexpected usages for a serving certificate".into()));
    }
    let Some(node_name) = info.username.strip_prefix(NODE_PREFIX) else {
        return Ok(Validation::Fail("requester is not a node".into()));
    };

    let zones = compute.zones(project).await.map_err(Error::from)?;
    let mut found: Option<(Instance, String)> = None;
    for zone in &zones {
        match compute.instance(project, zone, node_name).await.map_err(Error::from)? {
            Some(instance) => {
                found = Some((instance, zone.clone()));
                break;
            }
            None => continue,
        }
    }
    let Some((instance, zone)) = found else {
        return Ok(Validation::Fail(format!(
            "no instance named {} in any configured zone",
            node_name
        )));
    };

    let instance_ips = instance_addresses(&instance);
    for ip in &info.parsed.ip_addresses {
        if !instance_ips.contains(ip) {
            return Ok(Validation::Fail(format!(
                "requested IP {} does not belong to instance {}",
                ip, node_name
            )));
        }
    }

    let allowed_dns = allowed_dns_names(node_name, &zone, project);
    for dns in &info.parsed.dns_names {
        if !allowed_dns.iter().any(|a| a == dns) {
            return Ok(Validation::Fail(format!(
                "requested DNS name {} does not map to instance {}",
                dns, node_name
            )));
        }
    }
    Ok(Validation::Pass)
}

fn instance_addresses(instance: &Instance) -> Vec<IpAddr> {
    let mut out = Vec::new();
    for ifc in &instance.network_interfaces {
        if let Ok(ip) = ifc.network_ip.parse() {
            out.push(ip);
        }
        if let Some(ipv6) = &ifc.ipv6_address {
            if let Ok(ip) = ipv6.split('/').next().unwrap_or(ipv6).parse() {
                out.push(ip);
            }
        }
    }
    out
}

/// The three accepted DNS schemes, with the domain-scoped-project
/// variant where `domain.tld:proj` becomes `proj.domain.tld` labels.
fn allowed_dns_names(node: &str, zone: &str, project: &str) -> Vec<String> {
    let project_dns = match project.split_once(':') {
        Some((domain, proj)) => format!("{}.{}", proj, domain),
        None => project.to_string(),
    };
    vec![
        format!("{}.{}.c.{}.internal", node, zone, project_dns),
        format!("{}.c.{}.internal", node, project_dns),
        node.to_string(),
    ]
}

/// Readonly kubelet client certificates, chained sub-validators; any
/// sub-validator that fails denies immediately.
pub fn kubelet_readonly(
    autopilot: bool,
    pods: Option<Arc<SharedCache<k8s_openapi::api::core::v1::Pod>>>,
) -> Validator {
    Validator {
        name: "kubelet-readonly-client-cert",
        permission_subresource: "kubeletclient",
        recognize: Box::new(|info| info.signer == SignerKind::KubeletReadonly),
        validate: Box::new(move |info| {
            let pods = pods.clone();
            Box::pin(async move {
                if !info.usages_subset(&[
                    USAGE_KEY_ENCIPHERMENT,
                    USAGE_DIGITAL_SIGNATURE,
                    USAGE_CLIENT_AUTH,
                ]) {
                    return Ok(Validation::Fail("usages exceed the readonly client set".into()));
                }
                if autopilot {
                    match readonly_pod_check(&info, pods.as_deref()) {
                        Ok(()) => {}
                        Err(msg) => return Ok(Validation::Fail(msg)),
                    }
                }
                Ok(Validation::Pass)
            })
        }),
        pre_approve: None,
    }
}

/// On autopilot clusters the requesting pod must be named in the CSR's
/// Extra and must opt in via the limited-reader annotation.
fn readonly_pod_check(
    info: &CsrInfo,
    pods: Option<&SharedCache<k8s_openapi::api::core::v1::Pod>>,
) -> std::result::Result<(), String> {
    let pod_name = info
        .extra
        .get("authentication.kubernetes.io/pod-name")
        .and_then(|v| v.first())
        .ok_or_else(|| "request carries no pod name".to_string())?;
    let namespace = info
        .username
        .strip_prefix("system:serviceaccount:")
        .and_then(|rest| rest.split(':').next())
        .ok_or_else(|| "requester is not a service account".to_string())?;
    let Some(pods) = pods else {
        return Err("pod store unavailable".to_string());
    };
    let key = nimbus_core::keys::pod_key(namespace, pod_name);
    let Some(pod) = pods.get(&key) else {
        return Err(format!("pod {} not found", key));
    };
    let annotated = pod
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(AUTOPILOT_READONLY_ANNOTATION))
        .is_some_and(|v| v == "true");
    if !annotated {
        return Err(format!("pod {} is not a limited reader", key));
    }
    Ok(())
}

const ISTIO_NAMESPACE: &str = "istio-system";
const ISTIOD_ACCOUNT: &str = "system:serviceaccount:istio-system:istiod";

pub fn istiod() -> Validator {
    Validator {
        name: "istiod-cert",
        permission_subresource: "istiodclient",
        recognize: Box::new(|info| info.signer == SignerKind::Istiod),
        validate: Box::new(|info| {
            Box::pin(async move {
                if !info.usages_exactly(&[
                    USAGE_KEY_ENCIPHERMENT,
                    USAGE_DIGITAL_SIGNATURE,
                    USAGE_SERVER_AUTH,
                ]) {
                    return Ok(Validation::Fail("unexpected usages for an istiod certificate".into()));
                }
                if info.parsed.has_forbidden_san_kinds(true) {
                    return Ok(Validation::Fail("URI, email and IP SANs are not allowed".into()));
                }
                let requester_ok = info.username == ISTIOD_ACCOUNT
                    || info
                        .username
                        .strip_prefix(ISTIOD_ACCOUNT)
                        .is_some_and(|rest| rest.starts_with('-'));
                if !requester_ok {
                    return Ok(Validation::Fail(format!("requester {} is not istiod", info.username)));
                }
                for dns in &info.parsed.dns_names {
                    if !istiod_dns_ok(dns) {
                        return Ok(Validation::Fail(format!("DNS name {} is not an istiod service", dns)));
                    }
                }
                Ok(Validation::Pass)
            })
        }),
        pre_approve: None,
    }
}

fn istiod_dns_ok(dns: &str) -> bool {
    let labels: Vec<&str> = dns.split('.').collect();
    let [first, namespace, svc] = labels.as_slice() else {
        return false;
    };
    if *namespace != ISTIO_NAMESPACE || *svc != "svc" {
        return false;
    }
    matches!(*first, "istiod" | "istiod-remote" | "istio-pilot") || first.starts_with("istiod-")
}

const OIDC_ACCOUNT_PREFIX: &str = "system:serviceaccount:anthos-identity-service:gke-oidc";

pub fn oidc() -> Validator {
    Validator {
        name: "gke-oidc-cert",
        permission_subresource: "gkeoidcclient",
        recognize: Box::new(|info| info.signer == SignerKind::Oidc),
        validate: Box::new(|info| {
            Box::pin(async move {
                if !info.usages_exactly(&[USAGE_CLIENT_AUTH, USAGE_SERVER_AUTH]) {
                    return Ok(Validation::Fail("unexpected usages for a gke-oidc certificate".into()));
                }
                if info.parsed.has_forbidden_san_kinds(false) {
                    return Ok(Validation::Fail("URI and email SANs are not allowed".into()));
                }
                if !info.username.starts_with(OIDC_ACCOUNT_PREFIX) {
                    return Ok(Validation::Fail(format!(
                        "requester {} is not the gke-oidc service",
                        info.username
                    )));
                }
                for dns in &info.parsed.dns_names {
                    if !oidc_dns_ok(dns) {
                        return Ok(Validation::Fail(format!("DNS name {} is not a gke-oidc service", dns)));
                    }
                }
                Ok(Validation::Pass)
            })
        }),
        pre_approve: None,
    }
}

fn oidc_dns_ok(dns: &str) -> bool {
    let labels: Vec<&str> = dns.split('.').collect();
    let [first, namespace, _svc] = labels.as_slice() else {
        return false;
    };
    if *namespace != "anthos-identity-service" && *namespace != "kube-system" {
        return false;
    }
    *first == "gke-oidc-envoy" || first.starts_with("gke-oidc")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn istiod_dns_rules() {
        assert!(istiod_dns_ok("istiod.istio-system.svc"));
        assert!(istiod_dns_ok("istiod-remote.istio-system.svc"));
        assert!(istiod_dns_ok("istio-pilot.istio-system.svc"));
        assert!(istiod_dns_ok("istiod-canary.istio-system.svc"));
        assert!(!istiod_dns_ok("istio-sidecar.istio-system.svc"));
        assert!(!istiod_dns_ok("istiod.default.svc"));
        assert!(!istiod_dns_ok("istiod.istio-system.svc.cluster.local"));
    }

    #[test]
    fn oidc_dns_rules() {
        assert!(oidc_dns_ok("gke-oidc-envoy.anthos-identity-service.svc"));
        assert!(oidc_dns_ok("gke-oidc-service.kube-system.svc"));
        assert!(!oidc_dns_ok("other.kube-system.svc"));
        assert!(!oidc_dns_ok("gke-oidc-envoy.default.svc"));
    }

    #[test]
    fn dns_schemes_for_plain_and_domain_scoped_projects() {
        assert_eq!(
            allowed_dns_names("i0", "z0", "p0"),
            vec!["i0.z0.c.p0.internal".to_string(), "i0.c.p0.internal".to_string(), "i0".to_string()]
        );
        assert_eq!(
            allowed_dns_names("i0", "z0", "example.com:proj"),
            vec![
                "i0.z0.c.proj.example.com.internal".to_string(),
                "i0.c.proj.example.com.internal".to_string(),
                "i0".to_string()
            ]
        );
    }
}
